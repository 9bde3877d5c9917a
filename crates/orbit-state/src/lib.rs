//! orbit-state — embedded state store for Orbit.
//!
//! Backed by [redb](https://docs.rs/redb). Holds everything the orchestrator
//! needs to survive a restart: backup and restore metadata, deployment
//! properties (the lock record and bindings) and recurring job schedules.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{root_folder}/{backup_guid}`, `{deployment}/{property}`,
//! `{owner}:{job_type}`) allow prefix scans over related records.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::StateStore;
