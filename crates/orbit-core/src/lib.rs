//! orbit-core — shared types and configuration for the Orbit orchestrator.
//!
//! Everything here is plain data: operation handles, apply-service tasks,
//! lock records, backup/restore metadata and the `orbit.toml` model. The
//! behaviour lives in `orbit-director`; the durable copies live in
//! `orbit-state`.

pub mod backup;
pub mod config;
pub mod types;

pub use backup::*;
pub use config::{ConfigError, OrbitConfig, PlanConfig};
pub use types::*;
