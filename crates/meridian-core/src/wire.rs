//! Positional wire encoding for cross-node dispatch.
//!
//! An entity travels as a [`RemoteData`]: one ordered array per primitive
//! type, filled by walking the schema's columns in declaration order. No
//! column names travel on the wire, so the declared order must stay stable
//! across every node version in a cluster.
//!
//! Batches of [`RemoteMessage`]s are framed for streaming transports as a
//! big-endian `u32` length followed by a JSON payload.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::MeridianError;
use crate::schema::{ColumnType, Entity, Schema, Value};
use crate::types::GraphId;
use crate::Result;

/// Upper bound on a single frame, guarding the reader against garbage lengths.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Typed arrays carrying one entity's column values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteData {
    #[serde(default)]
    pub strings: Vec<String>,
    #[serde(default)]
    pub longs: Vec<i64>,
    #[serde(default)]
    pub ints: Vec<i32>,
    #[serde(default)]
    pub doubles: Vec<f64>,
    #[serde(default)]
    pub bools: Vec<bool>,
    #[serde(default)]
    pub bytes: Vec<Bytes>,
}

impl RemoteData {
    /// Encode a value row. The row is validated against `schema` first.
    pub fn from_values(schema: &Schema, values: Vec<Value>) -> Result<Self> {
        schema.validate(&values)?;
        let mut data = Self::default();
        for value in values {
            match value {
                Value::Str(v) => data.strings.push(v),
                Value::Long(v) => data.longs.push(v),
                Value::Int(v) => data.ints.push(v),
                Value::Double(v) => data.doubles.push(v),
                Value::Bool(v) => data.bools.push(v),
                Value::Bytes(v) => data.bytes.push(v),
            }
        }
        Ok(data)
    }

    /// Decode back into a value row following the schema's column order.
    ///
    /// Every array must be consumed exactly; leftovers or shortfalls are
    /// reported as an entity shape error.
    pub fn into_values(self, schema: &Schema) -> Result<Vec<Value>> {
        let mut strings = self.strings.into_iter();
        let mut longs = self.longs.into_iter();
        let mut ints = self.ints.into_iter();
        let mut doubles = self.doubles.into_iter();
        let mut bools = self.bools.into_iter();
        let mut bytes = self.bytes.into_iter();

        let mut values = Vec::with_capacity(schema.columns().len());
        for column in schema.columns() {
            let value = match column.ty {
                ColumnType::Str => strings.next().map(Value::Str),
                ColumnType::Long => longs.next().map(Value::Long),
                ColumnType::Int => ints.next().map(Value::Int),
                ColumnType::Double => doubles.next().map(Value::Double),
                ColumnType::Bool => bools.next().map(Value::Bool),
                ColumnType::Bytes => bytes.next().map(Value::Bytes),
            };
            let value = value.ok_or_else(|| {
                MeridianError::shape(
                    schema.name(),
                    format!("wire message is missing a value for column '{}'", column.name),
                )
            })?;
            values.push(value);
        }

        let leftover = strings.len() + longs.len() + ints.len() + doubles.len() + bools.len() + bytes.len();
        if leftover > 0 {
            return Err(MeridianError::shape(
                schema.name(),
                format!("wire message carries {leftover} values beyond the schema"),
            ));
        }
        Ok(values)
    }

    /// Encode an entity.
    pub fn encode<E: Entity>(entity: &E) -> Result<Self> {
        Self::from_values(E::schema(), entity.to_values())
    }

    /// Decode an entity.
    pub fn decode<E: Entity>(self) -> Result<E> {
        E::from_values(self.into_values(E::schema())?)
    }
}

/// One entity addressed to a graph on the receiving node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub graph_id: GraphId,
    pub data: RemoteData,
}

/// Frame a batch of messages: `u32` big-endian length + JSON body.
pub fn encode_frame(messages: &[RemoteMessage]) -> Result<Bytes> {
    let body = serde_json::to_vec(messages)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(MeridianError::codec(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_LEN} byte limit",
            body.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Decode a frame body (without the length prefix).
pub fn decode_frame_body(body: &[u8]) -> Result<Vec<RemoteMessage>> {
    serde_json::from_slice(body).map_err(|e| MeridianError::codec(format!("bad frame body: {e}")))
}
