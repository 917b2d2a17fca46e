//! Persistence layer: libSQL-backed durable store for runs, batches and entities.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::{LibSqlBackend, StoreOptions};
pub use traits::{DurableStore, HistoryEvent};
