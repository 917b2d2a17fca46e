//! Worker system: stage handlers and the pools that run them.
//!
//! - `stage`: `StageHandler` trait, one implementation per pipeline stage
//! - `pool`: `StageWorkerPool`, concurrent claim → process → commit loops

pub mod pool;
pub mod stage;

pub use pool::{PoolReport, PoolSettings, StageWorkerPool};
pub use stage::StageHandler;
