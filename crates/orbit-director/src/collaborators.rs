//! Contracts the orchestrator requires from the systems around it.
//!
//! None of these define a wire format. Production code plugs in clients for
//! the apply service, the agent protocol, the scheduler and the platform;
//! the backup store and deployment properties can be backed by the local
//! [`orbit_state::StateStore`] (see `durable`).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use orbit_core::{
    AgentLastOperation, BackupDescriptor, BackupFileEntry, BackupMetadata, BackupRef,
    DeleteOptions, DeleteStatus, DeployArgs, DeploymentVm, InstanceKey, JobType,
    RestoreDescriptor, RestoreMetadata, RunPatch, Schedule, SecurityRule, Task, TaskEvent,
    TaskFilter, Vm,
};

use crate::error::DirectorResult;

// ── Apply service ─────────────────────────────────────────────────

/// External system that turns a manifest into running infrastructure.
#[async_trait]
pub trait ApplyService: Send + Sync {
    /// Submit a manifest. Returns the task id tracking the apply.
    async fn create_or_update_deployment(&self, manifest: &str, args: &DeployArgs) -> DirectorResult<String>;

    async fn delete_deployment(&self, deployment: &str) -> DirectorResult<String>;

    /// Fails `NotFound` for unknown task ids.
    async fn get_task(&self, task_id: &str) -> DirectorResult<Task>;

    async fn get_tasks(&self, filter: &TaskFilter) -> DirectorResult<Vec<Task>>;

    async fn get_task_events(&self, task_id: &str) -> DirectorResult<Vec<TaskEvent>>;

    /// `None` when the deployment exists but has no manifest.
    async fn get_deployment_manifest(&self, deployment: &str) -> DirectorResult<Option<String>>;

    async fn get_deployment_vms(&self, deployment: &str) -> DirectorResult<Vec<DeploymentVm>>;

    /// Names of all deployments, optionally including those with queued
    /// create tasks.
    async fn get_deployment_names(&self, include_queued: bool) -> DirectorResult<Vec<String>>;

    /// Fails `NotFound` when no deployment belongs to the instance.
    async fn get_deployment_name_for_instance_id(&self, instance_guid: &str) -> DirectorResult<String>;

    async fn deployment_exists(&self, deployment: &str) -> DirectorResult<bool>;
}

/// Per-deployment key/value properties. Holds the lock record and bindings.
#[async_trait]
pub trait DeploymentProperties: Send + Sync {
    async fn get_property(&self, deployment: &str, key: &str) -> DirectorResult<Option<Value>>;

    /// Fails `AlreadyExists` if the property is present.
    async fn create_property(&self, deployment: &str, key: &str, value: &Value) -> DirectorResult<()>;

    async fn update_or_create_property(&self, deployment: &str, key: &str, value: &Value) -> DirectorResult<()>;

    /// Fails `NotFound` if the property is absent.
    async fn delete_property(&self, deployment: &str, key: &str) -> DirectorResult<()>;
}

// ── Agent ─────────────────────────────────────────────────────────

/// Management endpoint running on a deployment's VMs.
///
/// Which calls an agent supports is declared by the plan's
/// `agent.features` list.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn get_state(&self, ips: &[String]) -> DirectorResult<Value>;

    async fn create_credentials(&self, ips: &[String], parameters: &Value) -> DirectorResult<Value>;

    async fn delete_credentials(&self, ips: &[String], credentials: &Value) -> DirectorResult<()>;

    /// Returns the ip of the agent now running the backup.
    async fn start_backup(&self, ips: &[String], backup: &BackupDescriptor, vms: &[Vm]) -> DirectorResult<String>;

    async fn get_backup_last_operation(&self, agent_ip: &str) -> DirectorResult<AgentLastOperation>;

    async fn get_backup_logs(&self, agent_ip: &str) -> DirectorResult<Vec<Value>>;

    async fn abort_backup(&self, agent_ip: &str) -> DirectorResult<()>;

    async fn start_restore(&self, ips: &[String], backup: &RestoreDescriptor, vms: &[Vm]) -> DirectorResult<String>;

    async fn get_restore_last_operation(&self, agent_ip: &str) -> DirectorResult<AgentLastOperation>;

    async fn get_restore_logs(&self, agent_ip: &str) -> DirectorResult<Vec<Value>>;

    async fn abort_restore(&self, agent_ip: &str) -> DirectorResult<()>;

    async fn deprovision(&self, ips: &[String]) -> DirectorResult<()>;
}

// ── Backup store ──────────────────────────────────────────────────

/// Check evaluated against stored metadata right before a delete.
#[async_trait]
pub trait DeletePrecondition: Send + Sync {
    async fn allows(&self, metadata: &BackupMetadata) -> DirectorResult<bool>;
}

/// Durable metadata store for backups and restores.
#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn put_backup_file(&self, metadata: &BackupMetadata) -> DirectorResult<()>;

    async fn put_restore_file(&self, metadata: &RestoreMetadata) -> DirectorResult<()>;

    async fn patch_backup_file(&self, target: &BackupRef, patch: &RunPatch) -> DirectorResult<BackupMetadata>;

    async fn patch_restore_file(&self, instance: &InstanceKey, patch: &RunPatch) -> DirectorResult<RestoreMetadata>;

    /// Fails `NotFound`.
    async fn get_backup_file(&self, target: &BackupRef) -> DirectorResult<BackupMetadata>;

    /// Latest backup of an instance. Fails `NotFound`.
    async fn get_latest_backup_file(&self, instance: &InstanceKey) -> DirectorResult<BackupMetadata>;

    /// Fails `NotFound`.
    async fn get_restore_file(&self, instance: &InstanceKey) -> DirectorResult<RestoreMetadata>;

    /// Delete a backup record. A precondition that does not hold yields
    /// `PreconditionNotMet` and leaves the record in place.
    async fn delete_backup_file(
        &self,
        target: &BackupRef,
        options: &DeleteOptions,
        precondition: Option<&dyn DeletePrecondition>,
    ) -> DirectorResult<DeleteStatus>;

    /// Fails `NotFound`.
    async fn delete_restore_file(&self, instance: &InstanceKey) -> DirectorResult<()>;

    /// Backups started at or before `older_than` (and after `newer_than`,
    /// when given). Out-of-band backups are included only on request.
    async fn list_backup_files(
        &self,
        older_than: DateTime<Utc>,
        newer_than: Option<DateTime<Utc>>,
        include_oob: bool,
    ) -> DirectorResult<Vec<BackupFileEntry>>;
}

// ── Scheduler ─────────────────────────────────────────────────────

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Fails `NotFound` when no such job is registered.
    async fn get_schedule(&self, owner_id: &str, job_type: JobType) -> DirectorResult<Schedule>;

    async fn schedule_auto_update(&self, instance_guid: &str, time_zone: &str) -> DirectorResult<Schedule>;
}

/// Lease on the long-running job a batch runs under.
#[async_trait]
pub trait JobLease: Send + Sync {
    async fn touch(&self) -> DirectorResult<()>;
}

// ── Platform ──────────────────────────────────────────────────────

/// The platform the service instances are registered with.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn instance_exists(&self, instance_guid: &str) -> DirectorResult<bool>;

    /// Space the instance is registered in, if the platform knows it.
    async fn instance_space(&self, instance_guid: &str) -> DirectorResult<Option<String>>;

    /// Returns the guid of the new security group.
    async fn create_security_group(&self, name: &str, rules: &[SecurityRule], space_guid: &str) -> DirectorResult<String>;

    async fn find_security_group(&self, name: &str) -> DirectorResult<Option<String>>;

    /// Fails `NotFound` when absent.
    async fn delete_security_group(&self, name: &str) -> DirectorResult<()>;
}

/// Every collaborator a manager talks to, shared across plans.
#[derive(Clone)]
pub struct Collaborators {
    pub apply: Arc<dyn ApplyService>,
    pub properties: Arc<dyn DeploymentProperties>,
    pub agent: Arc<dyn Agent>,
    pub store: Arc<dyn BackupStore>,
    pub scheduler: Arc<dyn Scheduler>,
    pub platform: Arc<dyn Platform>,
}
