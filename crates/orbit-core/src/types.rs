//! Shared types used across Orbit crates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Operations ────────────────────────────────────────────────────

/// Kind of request the caller made against a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Bind,
    Unbind,
    Get,
}

impl OperationKind {
    /// Capitalized action name used in operation descriptions.
    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::Create => "Create",
            OperationKind::Update => "Update",
            OperationKind::Delete => "Delete",
            OperationKind::Bind => "Bind",
            OperationKind::Unbind => "Unbind",
            OperationKind::Get => "Get",
        }
    }
}

/// Specialized flavours of an `update` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationSubtype {
    Backup,
    Restore,
    Unlock,
}

impl OperationSubtype {
    pub fn label(&self) -> &'static str {
        match self {
            OperationSubtype::Backup => "Backup",
            OperationSubtype::Restore => "Restore",
            OperationSubtype::Unlock => "Unlock",
        }
    }
}

/// Caller-visible lifecycle of an operation. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Queued,
    InProgress,
    Succeeded,
    Failed,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Succeeded | OperationState::Failed)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationState::Queued => write!(f, "queued"),
            OperationState::InProgress => write!(f, "in progress"),
            OperationState::Succeeded => write!(f, "succeeded"),
            OperationState::Failed => write!(f, "failed"),
        }
    }
}

/// Opaque handle the caller keeps between polls.
///
/// Not persisted by the orchestrator: every field needed to resume polling
/// after a restart travels inside the handle itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<OperationSubtype>,
    pub state: OperationState,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    /// Credentials returned by a synchronous bind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Value>,
}

impl Operation {
    /// A fresh, queued operation of the given kind.
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            subtype: None,
            state: OperationState::Queued,
            description: String::new(),
            task_id: None,
            agent_ip: None,
            deployment: None,
            backup_guid: None,
            space_guid: None,
            username: None,
            parameters: None,
            credentials: None,
        }
    }

    /// A fresh `update` operation carrying the given subtype.
    pub fn with_subtype(subtype: OperationSubtype) -> Self {
        Self {
            subtype: Some(subtype),
            ..Self::new(OperationKind::Update)
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Action name for descriptions: the subtype if present, else the kind.
    pub fn action_label(&self) -> &'static str {
        match self.subtype {
            Some(subtype) => subtype.label(),
            None => self.kind.label(),
        }
    }
}

// ── Apply-service tasks ───────────────────────────────────────────

/// State of an apply-service task, as reported upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Processing,
    Done,
    Error,
    Cancelled,
    Timeout,
}

/// An apply-service job. Owned by the apply service; read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub deployment: String,
    pub state: TaskState,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub result: String,
    /// Unix timestamp (seconds) of the last state change.
    pub timestamp: i64,
}

/// Filter for listing apply-service tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    pub deployment: Option<String>,
}

/// A single progress event emitted by an apply-service task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Unix timestamp (seconds).
    pub time: i64,
    pub stage: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub total: u32,
    pub task: String,
    pub index: u32,
    pub state: String,
}

/// Extra arguments passed along with a manifest submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default)]
    pub recreate: bool,
    #[serde(default)]
    pub skip_drain: bool,
}

// ── Deployment inventory ──────────────────────────────────────────

/// A VM as reported by the apply service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentVm {
    pub cid: String,
    pub agent_id: String,
    pub job: String,
    pub index: u32,
    #[serde(default)]
    pub ips: Vec<String>,
}

/// IaaS-level identity of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IaasVmMetadata {
    pub vm_id: String,
}

/// Normalized VM inventory entry handed to the agent for backup/restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vm {
    pub cid: String,
    pub agent_id: String,
    pub job: String,
    pub index: u32,
    pub iaas_vm_metadata: IaasVmMetadata,
}

// ── Deployment lock ───────────────────────────────────────────────

/// Durable lock record stored as a deployment property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub username: String,
    pub lock_for_operation: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_info: Option<LockInstanceInfo>,
}

/// Provenance of the in-flight backup that holds a lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInstanceInfo {
    pub space_guid: String,
    pub backup_guid: String,
    pub instance_guid: String,
    pub agent_ip: String,
    pub service_id: String,
    pub plan_id: String,
    pub deployment: String,
    pub started_at: DateTime<Utc>,
}

// ── Agent ─────────────────────────────────────────────────────────

/// Capabilities an agent may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentFeature {
    State,
    Lifecycle,
    Credentials,
    Backup,
    Restore,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for AgentFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentFeature::State => "state",
            AgentFeature::Lifecycle => "lifecycle",
            AgentFeature::Credentials => "credentials",
            AgentFeature::Backup => "backup",
            AgentFeature::Restore => "restore",
            AgentFeature::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

// ── Platform ──────────────────────────────────────────────────────

/// One ingress rule of a deployment's security group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
    pub protocol: String,
    pub destination: String,
    pub ports: String,
}

// ── Scheduler ─────────────────────────────────────────────────────

/// Recurring job kinds the orchestrator cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    ScheduledBackup,
    ScheduledOobDeploymentBackup,
    ServiceInstanceUpdate,
    BackupReaper,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ScheduledBackup => "ScheduledBackup",
            JobType::ScheduledOobDeploymentBackup => "ScheduledOobDeploymentBackup",
            JobType::ServiceInstanceUpdate => "ServiceInstanceUpdate",
            JobType::BackupReaper => "BackupReaper",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recurring job registered with the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Instance guid or deployment name owning the job.
    pub owner_id: String,
    pub job_type: JobType,
    pub repeat_interval: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    /// Job name as the scheduler knows it: `{owner}_{job_type}`.
    pub fn name(&self) -> String {
        format!("{}_{}", self.owner_id, self.job_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_serializes_kind_as_type() {
        let mut op = Operation::with_subtype(OperationSubtype::Backup);
        op.agent_ip = Some("10.0.1.10".to_string());
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["subtype"], "backup");
        assert_eq!(json["state"], "queued");
        assert!(json.get("task_id").is_none());
    }

    #[test]
    fn lock_info_uses_camel_case_keys() {
        let lock = LockInfo {
            username: "admin".to_string(),
            lock_for_operation: "on_demand_backup".to_string(),
            created_at: Utc::now(),
            instance_info: None,
        };
        let json = serde_json::to_value(&lock).unwrap();
        assert_eq!(json["lockForOperation"], "on_demand_backup");
        assert!(json.get("createdAt").is_some());
    }

    #[test]
    fn unknown_agent_feature_is_tolerated() {
        let features: Vec<AgentFeature> =
            serde_json::from_str(r#"["backup", "multi_tenancy"]"#).unwrap();
        assert_eq!(features, vec![AgentFeature::Backup, AgentFeature::Unknown]);
    }

    #[test]
    fn terminal_states() {
        assert!(OperationState::Succeeded.is_terminal());
        assert!(OperationState::Failed.is_terminal());
        assert!(!OperationState::InProgress.is_terminal());
        assert_eq!(OperationState::InProgress.to_string(), "in progress");
    }
}
