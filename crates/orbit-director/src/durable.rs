//! Collaborator implementations backed by the local redb [`StateStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use orbit_core::{
    BackupFileEntry, BackupMetadata, BackupRef, DeleteOptions, DeleteStatus, InstanceKey,
    JobType, RestoreMetadata, RunPatch, RunState, Schedule,
};
use orbit_state::{StateError, StateStore};

use crate::collaborators::{BackupStore, DeletePrecondition, DeploymentProperties, Scheduler};
use crate::error::{DirectorError, DirectorResult};

/// Repeat interval recorded for auto-update jobs; the scheduler picks the slot.
pub const RANDOM_REPEAT_INTERVAL: &str = "random";

fn not_found(what: impl Into<String>) -> impl FnOnce(StateError) -> DirectorError {
    let what = what.into();
    move |err| match err {
        StateError::NotFound(_) => DirectorError::NotFound(what),
        other => DirectorError::State(other),
    }
}

#[async_trait]
impl BackupStore for StateStore {
    async fn put_backup_file(&self, metadata: &BackupMetadata) -> DirectorResult<()> {
        self.put_backup(metadata)?;
        Ok(())
    }

    async fn put_restore_file(&self, metadata: &RestoreMetadata) -> DirectorResult<()> {
        self.put_restore(metadata)?;
        Ok(())
    }

    async fn patch_backup_file(&self, target: &BackupRef, patch: &RunPatch) -> DirectorResult<BackupMetadata> {
        self.update_backup(target, |meta| meta.apply(patch))
            .map_err(not_found(format!("backup {}", target.backup_guid)))
    }

    async fn patch_restore_file(&self, instance: &InstanceKey, patch: &RunPatch) -> DirectorResult<RestoreMetadata> {
        self.update_restore(instance, |meta| meta.apply(patch))
            .map_err(not_found(format!("restore of instance {}", instance.instance_guid)))
    }

    async fn get_backup_file(&self, target: &BackupRef) -> DirectorResult<BackupMetadata> {
        self.get_backup(target)?
            .ok_or_else(|| DirectorError::NotFound(format!("backup {}", target.backup_guid)))
    }

    async fn get_latest_backup_file(&self, instance: &InstanceKey) -> DirectorResult<BackupMetadata> {
        self.latest_backup(instance)?.ok_or_else(|| {
            DirectorError::NotFound(format!("backup of instance {}", instance.instance_guid))
        })
    }

    async fn get_restore_file(&self, instance: &InstanceKey) -> DirectorResult<RestoreMetadata> {
        self.get_restore(instance)?.ok_or_else(|| {
            DirectorError::NotFound(format!("restore of instance {}", instance.instance_guid))
        })
    }

    async fn delete_backup_file(
        &self,
        target: &BackupRef,
        options: &DeleteOptions,
        precondition: Option<&dyn DeletePrecondition>,
    ) -> DirectorResult<DeleteStatus> {
        let metadata = self.get_backup_file(target).await?;
        if !options.force && metadata.state == RunState::Processing {
            return Err(DirectorError::Forbidden(format!(
                "Delete of backup {} in state processing not permitted",
                target.backup_guid
            )));
        }
        if let Some(check) = precondition {
            if !check.allows(&metadata).await? {
                debug!(backup = %target.backup_guid, "delete precondition not met");
                return Ok(DeleteStatus::PreconditionNotMet);
            }
        }
        self.delete_backup(target)?;
        info!(
            backup = %target.backup_guid,
            root_folder = %target.root_folder,
            user = %options.user,
            "backup metadata deleted"
        );
        Ok(DeleteStatus::Deleted)
    }

    async fn delete_restore_file(&self, instance: &InstanceKey) -> DirectorResult<()> {
        if self.delete_restore(instance)? {
            Ok(())
        } else {
            Err(DirectorError::NotFound(format!(
                "restore of instance {}",
                instance.instance_guid
            )))
        }
    }

    async fn list_backup_files(
        &self,
        older_than: DateTime<Utc>,
        newer_than: Option<DateTime<Utc>>,
        include_oob: bool,
    ) -> DirectorResult<Vec<BackupFileEntry>> {
        let mut entries: Vec<BackupFileEntry> = self
            .list_backups()?
            .iter()
            .filter(|b| b.started_at <= older_than)
            .filter(|b| newer_than.is_none_or(|floor| b.started_at > floor))
            .filter(|b| include_oob || !b.is_out_of_band())
            .map(BackupFileEntry::from)
            .collect();
        entries.sort_by_key(|e| e.started_at);
        Ok(entries)
    }
}

#[async_trait]
impl DeploymentProperties for StateStore {
    async fn get_property(&self, deployment: &str, key: &str) -> DirectorResult<Option<Value>> {
        Ok(StateStore::get_property(self, deployment, key)?)
    }

    async fn create_property(&self, deployment: &str, key: &str, value: &Value) -> DirectorResult<()> {
        self.insert_property_if_absent(deployment, key, value)
            .map_err(|err| match err {
                StateError::Conflict(_) => {
                    DirectorError::AlreadyExists(format!("property {key} of {deployment}"))
                }
                other => DirectorError::State(other),
            })
    }

    async fn update_or_create_property(&self, deployment: &str, key: &str, value: &Value) -> DirectorResult<()> {
        self.put_property(deployment, key, value)?;
        Ok(())
    }

    async fn delete_property(&self, deployment: &str, key: &str) -> DirectorResult<()> {
        if StateStore::delete_property(self, deployment, key)? {
            Ok(())
        } else {
            Err(DirectorError::NotFound(format!("property {key} of {deployment}")))
        }
    }
}

#[async_trait]
impl Scheduler for StateStore {
    async fn get_schedule(&self, owner_id: &str, job_type: JobType) -> DirectorResult<Schedule> {
        StateStore::get_schedule(self, owner_id, job_type)?
            .ok_or_else(|| DirectorError::NotFound(format!("schedule {owner_id}_{job_type}")))
    }

    async fn schedule_auto_update(&self, instance_guid: &str, time_zone: &str) -> DirectorResult<Schedule> {
        let schedule = Schedule {
            owner_id: instance_guid.to_string(),
            job_type: JobType::ServiceInstanceUpdate,
            repeat_interval: RANDOM_REPEAT_INTERVAL.to_string(),
            time_zone: Some(time_zone.to_string()),
            created_at: Utc::now(),
        };
        self.put_schedule(&schedule)?;
        info!(instance = %instance_guid, %time_zone, "auto update scheduled");
        Ok(schedule)
    }
}
