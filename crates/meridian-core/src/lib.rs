//! Meridian core types, traits, configuration, and errors.
//!
//! This crate provides the foundational building blocks for the Meridian
//! streaming aggregation pipeline: typed identifiers, the schema and merge
//! model behind every [`Entity`], the positional wire encoding, the
//! collaborator traits the runtime calls out to ([`StorageBackend`],
//! [`MetricsDao`], [`BatchWriter`], [`RemoteTransport`]), pipeline
//! configuration, and the unified error type.

pub mod config;
pub mod dao;
pub mod error;
pub mod schema;
pub mod storage;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod wire;

pub use config::{OverflowPolicy, PipelineConfig, RoutingStrategy};
pub use dao::{BatchWriter, MetricsDao, WriteOp};
pub use error::MeridianError;
pub use schema::{delta, Column, ColumnType, Entity, MergeOperation, Schema, Value, ValueReader};
pub use storage::StorageBackend;
pub use transport::RemoteTransport;
pub use types::*;
pub use wire::{RemoteData, RemoteMessage};

/// Convenience Result type using [`MeridianError`].
pub type Result<T> = std::result::Result<T, MeridianError>;
