//! Built-in telemetry models.
//!
//! These are the entity types the demo node and the integration tests run
//! through the pipeline. Each declares its schema once; the struct fields are
//! the business-facing view and `to_values`/`from_values` map them onto the
//! declared column order.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::{ColumnType, Entity, MergeOperation, Schema, Value, ValueReader};
use crate::types::{Downsampling, EntityId};
use crate::Result;

/// Per-service call statistics for one time bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCallMetrics {
    pub time_bucket: i64,
    pub service: String,
    pub calls: i64,
    pub errors: i64,
    pub total_latency_ms: i64,
    pub last_status: i32,
}

impl ServiceCallMetrics {
    /// A single observed call, bucketed by minute.
    pub fn observe(ts: DateTime<Utc>, service: impl Into<String>, latency_ms: i64, status: i32) -> Self {
        Self {
            time_bucket: Downsampling::Minute.time_bucket(ts),
            service: service.into(),
            calls: 1,
            errors: i64::from(status >= 500),
            total_latency_ms: latency_ms,
            last_status: status,
        }
    }

    /// Same aggregate re-keyed to a coarser bucket.
    pub fn downsample(mut self, to: Downsampling) -> Self {
        self.time_bucket = to.rebucket(self.time_bucket);
        self
    }

    /// Mean latency, or zero for an empty aggregate.
    pub fn avg_latency_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.calls as f64
        }
    }
}

impl Entity for ServiceCallMetrics {
    fn schema() -> &'static Schema {
        static SCHEMA: OnceLock<Schema> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            Schema::builder("service_call")
                .column("time_bucket", ColumnType::Long, MergeOperation::Non)
                .column("service", ColumnType::Str, MergeOperation::Non)
                .column("calls", ColumnType::Long, MergeOperation::Add)
                .column("errors", ColumnType::Long, MergeOperation::Add)
                .column("total_latency_ms", ColumnType::Long, MergeOperation::Add)
                .column("last_status", ColumnType::Int, MergeOperation::Cover)
                .build()
        })
    }

    fn id(&self) -> EntityId {
        EntityId::compose(self.time_bucket, &self.service)
    }

    fn rebucket(&self, to: Downsampling) -> Option<Self> {
        Some(self.clone().downsample(to))
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Long(self.time_bucket),
            Value::Str(self.service.clone()),
            Value::Long(self.calls),
            Value::Long(self.errors),
            Value::Long(self.total_latency_ms),
            Value::Int(self.last_status),
        ]
    }

    fn from_values(values: Vec<Value>) -> Result<Self> {
        let mut r = ValueReader::new(Self::schema(), values)?;
        Ok(Self {
            time_bucket: r.long()?,
            service: r.string()?,
            calls: r.long()?,
            errors: r.long()?,
            total_latency_ms: r.long()?,
            last_status: r.int()?,
        })
    }
}

/// JVM heap and GC statistics of one instance for one time bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JvmMemoryMetrics {
    pub time_bucket: i64,
    pub instance: String,
    pub heap_used: i64,
    pub heap_max: i64,
    pub gc_count: i64,
}

impl JvmMemoryMetrics {
    /// A single heap sample, bucketed by minute.
    pub fn sample(ts: DateTime<Utc>, instance: impl Into<String>, heap_used: i64, heap_max: i64, gc_count: i64) -> Self {
        Self {
            time_bucket: Downsampling::Minute.time_bucket(ts),
            instance: instance.into(),
            heap_used,
            heap_max,
            gc_count,
        }
    }
}

impl Entity for JvmMemoryMetrics {
    fn schema() -> &'static Schema {
        static SCHEMA: OnceLock<Schema> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            Schema::builder("jvm_memory")
                .column("time_bucket", ColumnType::Long, MergeOperation::Non)
                .column("instance", ColumnType::Str, MergeOperation::Non)
                .column("heap_used", ColumnType::Long, MergeOperation::Cover)
                .column("heap_max", ColumnType::Long, MergeOperation::Cover)
                .column("gc_count", ColumnType::Long, MergeOperation::Add)
                .build()
        })
    }

    fn id(&self) -> EntityId {
        EntityId::compose(self.time_bucket, &self.instance)
    }

    fn rebucket(&self, to: Downsampling) -> Option<Self> {
        let mut coarse = self.clone();
        coarse.time_bucket = to.rebucket(self.time_bucket);
        Some(coarse)
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Long(self.time_bucket),
            Value::Str(self.instance.clone()),
            Value::Long(self.heap_used),
            Value::Long(self.heap_max),
            Value::Long(self.gc_count),
        ]
    }

    fn from_values(values: Vec<Value>) -> Result<Self> {
        let mut r = ValueReader::new(Self::schema(), values)?;
        Ok(Self {
            time_bucket: r.long()?,
            instance: r.string()?,
            heap_used: r.long()?,
            heap_max: r.long()?,
            gc_count: r.long()?,
        })
    }
}
