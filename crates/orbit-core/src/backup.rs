//! Backup and restore metadata.
//!
//! A metadata record is written when a backup/restore run starts
//! (`state = processing`), patched once the agent reports a terminal state,
//! and removed by the retention reaper or an explicit delete.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Storage root for backups that are not tied to a broker-managed instance.
pub const OOB_ROOT_FOLDER: &str = "OOB";

/// Default backup type requested from the agent.
pub const DEFAULT_BACKUP_TYPE: &str = "online";

/// Who asked for a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    OnDemand,
    Scheduled,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::OnDemand => "on_demand",
            Trigger::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a backup or restore run, both as stored and as reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Processing,
    Succeeded,
    Failed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Processing)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Processing => "processing",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Fields identifying the latest backup/restore of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub space_guid: String,
    pub service_id: String,
    pub plan_id: String,
    pub instance_guid: String,
}

/// Address of one backup record: its storage root plus guid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackupRef {
    /// Tenant (space guid) or [`OOB_ROOT_FOLDER`].
    pub root_folder: String,
    pub backup_guid: String,
}

impl BackupRef {
    pub fn new(root_folder: impl Into<String>, backup_guid: impl Into<String>) -> Self {
        Self {
            root_folder: root_folder.into(),
            backup_guid: backup_guid.into(),
        }
    }

    pub fn is_out_of_band(&self) -> bool {
        self.root_folder == OOB_ROOT_FOLDER
    }
}

/// Persisted metadata of one backup run.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub backup_guid: String,
    pub service_id: String,
    pub plan_id: String,
    pub instance_guid: String,
    /// Tenant scope, or [`OOB_ROOT_FOLDER`] for out-of-band backups.
    pub space_guid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub trigger: Trigger,
    #[serde(rename = "type")]
    pub backup_type: String,
    pub state: RunState,
    pub agent_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(rename = "snapshotId", default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    /// Live stage reported by the agent; never persisted.
    #[serde(default, skip_serializing)]
    pub stage: Option<String>,
    #[serde(default)]
    pub logs: Vec<Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl BackupMetadata {
    pub fn backup_ref(&self) -> BackupRef {
        BackupRef::new(self.space_guid.clone(), self.backup_guid.clone())
    }

    pub fn instance_key(&self) -> InstanceKey {
        InstanceKey {
            space_guid: self.space_guid.clone(),
            service_id: self.service_id.clone(),
            plan_id: self.plan_id.clone(),
            instance_guid: self.instance_guid.clone(),
        }
    }

    pub fn is_out_of_band(&self) -> bool {
        self.space_guid == OOB_ROOT_FOLDER
    }

    /// Apply a terminal patch from the agent.
    pub fn apply(&mut self, patch: &RunPatch) {
        self.state = patch.state;
        self.logs = patch.logs.clone();
        if patch.snapshot_id.is_some() {
            self.snapshot_id = patch.snapshot_id.clone();
        }
        self.finished_at = patch.finished_at;
    }
}

impl fmt::Debug for BackupMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupMetadata")
            .field("backup_guid", &self.backup_guid)
            .field("instance_guid", &self.instance_guid)
            .field("space_guid", &self.space_guid)
            .field("trigger", &self.trigger)
            .field("state", &self.state)
            .field("agent_ip", &self.agent_ip)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

/// Persisted metadata of one restore run. One per instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreMetadata {
    pub backup_guid: String,
    pub service_id: String,
    pub plan_id: String,
    pub instance_guid: String,
    pub space_guid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub state: RunState,
    pub agent_ip: String,
    #[serde(default, skip_serializing)]
    pub stage: Option<String>,
    #[serde(default)]
    pub logs: Vec<Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RestoreMetadata {
    pub fn instance_key(&self) -> InstanceKey {
        InstanceKey {
            space_guid: self.space_guid.clone(),
            service_id: self.service_id.clone(),
            plan_id: self.plan_id.clone(),
            instance_guid: self.instance_guid.clone(),
        }
    }

    pub fn apply(&mut self, patch: &RunPatch) {
        self.state = patch.state;
        self.logs = patch.logs.clone();
        self.finished_at = patch.finished_at;
    }
}

/// Terminal update written back once the agent finishes a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPatch {
    pub state: RunState,
    #[serde(default)]
    pub logs: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Listing entry for retention scans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupFileEntry {
    pub root_folder: String,
    pub backup_guid: String,
    pub started_at: DateTime<Utc>,
    pub trigger: Trigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
}

impl BackupFileEntry {
    pub fn backup_ref(&self) -> BackupRef {
        BackupRef::new(self.root_folder.clone(), self.backup_guid.clone())
    }

    pub fn is_out_of_band(&self) -> bool {
        self.root_folder == OOB_ROOT_FOLDER
    }
}

impl From<&BackupMetadata> for BackupFileEntry {
    fn from(meta: &BackupMetadata) -> Self {
        Self {
            root_folder: meta.space_guid.clone(),
            backup_guid: meta.backup_guid.clone(),
            started_at: meta.started_at,
            trigger: meta.trigger,
            instance_guid: Some(meta.instance_guid.clone()),
            deployment_name: meta.deployment_name.clone(),
            service_id: Some(meta.service_id.clone()),
            plan_id: Some(meta.plan_id.clone()),
        }
    }
}

/// Options for deleting a backup record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOptions {
    pub force: bool,
    /// Acting user, for audit logs.
    pub user: String,
}

/// Outcome of a conditional delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteStatus {
    Deleted,
    PreconditionNotMet,
}

/// Parameters handed to the agent to start a backup.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupDescriptor {
    pub guid: String,
    #[serde(rename = "type")]
    pub backup_type: String,
    pub trigger: Trigger,
    pub secret: String,
}

impl fmt::Debug for BackupDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupDescriptor")
            .field("guid", &self.guid)
            .field("backup_type", &self.backup_type)
            .field("trigger", &self.trigger)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Parameters handed to the agent to start a restore.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreDescriptor {
    pub guid: String,
    #[serde(rename = "type")]
    pub backup_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(rename = "snapshotId", default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
}

impl fmt::Debug for RestoreDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreDescriptor")
            .field("guid", &self.guid)
            .field("backup_type", &self.backup_type)
            .field("snapshot_id", &self.snapshot_id)
            .finish_non_exhaustive()
    }
}

/// The agent's view of its last backup/restore run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLastOperation {
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(rename = "snapshotId", default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}
