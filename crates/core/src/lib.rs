//! crmsync core library.
//!
//! This crate provides the components for scheduled one-way CRM record
//! synchronization: configuration, database persistence, field mapping,
//! per-stream watermarks, source/target connectors, the batch job runner,
//! the poller, and the sync engine that ties them together.

pub mod batch;
pub mod config;
pub mod connector;
pub mod db;
pub mod errors;
pub mod harness;
pub mod mapping;
pub mod models;
pub mod scheduler;
pub mod sync_engine;
pub mod watermark;

// Re-exports for convenience.
pub use batch::{BatchJobRunner, SyncJob};
pub use config::AppConfig;
pub use connector::{SourceConnector, TargetConnector};
pub use db::Database;
pub use mapping::FieldMapping;
pub use scheduler::{Poller, PollerState, SyncCycle};
pub use sync_engine::{EngineSettings, SyncEngine};
pub use watermark::{Watermark, WatermarkStore};
