//! orbit-director — deployment orchestration for Orbit.
//!
//! Turns service-instance requests into deployments on an external apply
//! service and tracks them to completion:
//!
//! - [`naming`]: deployment names and network segment allocation
//! - [`manifest`]: deterministic manifest rendering per plan
//! - [`lock`]: the durable per-deployment lock
//! - [`operation`]: request routing and the operation state machine
//! - [`backup`]: backup/restore sagas driven through the agent
//! - [`reaper`]: retention cleanup of old backups
//!
//! Every external system is reached through a trait in [`collaborators`].
//! [`durable`] backs the store-like ones with the local redb state store.

pub mod backup;
pub mod collaborators;
pub mod durable;
pub mod error;
pub mod lock;
pub mod manager;
pub mod manifest;
pub mod naming;
pub mod operation;
pub mod reaper;
pub mod registry;
pub mod retry;
pub mod saga;

#[cfg(test)]
mod testing;

pub use backup::{AbortOutcome, BackupRequest, InstanceScope, RestoreRequest};
pub use collaborators::{
    Agent, ApplyService, BackupStore, Collaborators, DeletePrecondition, DeploymentProperties,
    JobLease, Platform, Scheduler,
};
pub use error::{DirectorError, DirectorResult};
pub use lock::{DeploymentLock, LOCK_PROPERTY, LockRequest};
pub use manager::{DeploymentInfo, DirectorManager, IngressError, ManagerSettings, PreviousValues};
pub use manifest::{ManifestContext, ManifestGenerator};
pub use naming::{DeploymentIdentity, DeploymentNamer};
pub use operation::{DeploymentInstance, OperationRequest, Transition};
pub use reaper::BackupReaper;
pub use registry::ManagerRegistry;
