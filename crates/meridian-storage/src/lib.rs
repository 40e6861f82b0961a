//! Storage implementations for Meridian.
//!
//! This crate provides concrete implementations of the
//! [`StorageBackend`](meridian_core::StorageBackend) trait:
//!
//! - [`LocalBackend`]: filesystem-backed storage for solo mode and development
//! - [`MemoryBackend`]: in-process storage for `memory://` nodes and tests
//!
//! and [`KvMetricsDao`], a key-value
//! [`MetricsDao`](meridian_core::MetricsDao) / [`BatchWriter`](meridian_core::BatchWriter)
//! that stores aggregates as JSON documents on any backend.

pub mod kv_dao;
pub mod local;
pub mod memory;

pub use kv_dao::KvMetricsDao;
pub use local::LocalBackend;
pub use memory::MemoryBackend;
