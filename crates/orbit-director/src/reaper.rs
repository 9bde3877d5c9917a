//! Backup retention reaper.
//!
//! Deletes backups that have outlived the retention period. Scheduled
//! backups go as soon as they are past the cutoff. On-demand backups are
//! kept while their owner has an active backup schedule or still exists, so
//! the last copy of a live, unscheduled instance is never reaped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use tracing::{error, info, warn};

use orbit_core::{
    BackupFileEntry, BackupMetadata, DeleteOptions, DeleteStatus, JobType, OrbitConfig, Trigger,
};

use crate::collaborators::{
    ApplyService, BackupStore, Collaborators, DeletePrecondition, JobLease, Platform, Scheduler,
};
use crate::error::DirectorResult;

/// User recorded on reaper deletes.
pub const REAPER_USER: &str = "backup-reaper";

/// Deletion check for on-demand backups, evaluated right before the delete.
struct RetentionPrecondition {
    scheduler: Arc<dyn Scheduler>,
    apply: Arc<dyn ApplyService>,
    platform: Arc<dyn Platform>,
}

#[async_trait]
impl DeletePrecondition for RetentionPrecondition {
    async fn allows(&self, metadata: &BackupMetadata) -> DirectorResult<bool> {
        if metadata.trigger == Trigger::Scheduled {
            return Ok(true);
        }
        if metadata.is_out_of_band() {
            let Some(deployment) = metadata.deployment_name.as_deref() else {
                warn!(backup_guid = %metadata.backup_guid, "out-of-band backup without deployment name kept");
                return Ok(false);
            };
            match self
                .scheduler
                .get_schedule(deployment, JobType::ScheduledOobDeploymentBackup)
                .await
            {
                Ok(_) => Ok(false),
                Err(err) if err.is_not_found() => Ok(!self.apply.deployment_exists(deployment).await?),
                Err(err) => Err(err),
            }
        } else {
            let instance = metadata.instance_guid.as_str();
            match self.scheduler.get_schedule(instance, JobType::ScheduledBackup).await {
                Ok(_) => Ok(false),
                Err(err) if err.is_not_found() => Ok(!self.platform.instance_exists(instance).await?),
                Err(err) => Err(err),
            }
        }
    }
}

pub struct BackupReaper {
    store: Arc<dyn BackupStore>,
    precondition: RetentionPrecondition,
    retention_days: u32,
    delete_delay: Duration,
    touch_every: usize,
}

impl BackupReaper {
    pub fn new(config: &OrbitConfig, collaborators: &Collaborators) -> Self {
        Self {
            store: collaborators.store.clone(),
            precondition: RetentionPrecondition {
                scheduler: collaborators.scheduler.clone(),
                apply: collaborators.apply.clone(),
                platform: collaborators.platform.clone(),
            },
            retention_days: config.backup.retention_period_in_days,
            delete_delay: Duration::from_millis(config.reaper.delete_delay_ms),
            touch_every: config.reaper.touch_every,
        }
    }

    /// Oldest `started_at` that is still kept, relative to `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - ChronoDuration::days(i64::from(self.retention_days) + 1)
    }

    pub async fn run(&self, lease: &dyn JobLease) -> DirectorResult<Vec<String>> {
        self.run_at(Utc::now(), lease).await
    }

    /// Reap everything started at or before the cutoff. Returns the guids
    /// actually deleted.
    pub async fn run_at(&self, now: DateTime<Utc>, lease: &dyn JobLease) -> DirectorResult<Vec<String>> {
        let cutoff = self.cutoff(now);
        let candidates = self.store.list_backup_files(cutoff, None, true).await?;
        info!(%cutoff, candidates = candidates.len(), "reaping backups");

        let mut tenant_seq = 0;
        let mut oob_seq = 0;
        let jobs: Vec<_> = candidates
            .into_iter()
            .map(|entry| {
                let seq = if entry.is_out_of_band() {
                    oob_seq += 1;
                    oob_seq
                } else {
                    tenant_seq += 1;
                    tenant_seq
                };
                self.reap(entry, seq, lease)
            })
            .collect();
        let deleted: Vec<String> = join_all(jobs).await.into_iter().flatten().collect();
        info!(deleted = deleted.len(), "backup reaping finished");
        Ok(deleted)
    }

    async fn reap(&self, entry: BackupFileEntry, seq: usize, lease: &dyn JobLease) -> Option<String> {
        let steps = u32::try_from(seq).unwrap_or(u32::MAX);
        tokio::time::sleep(self.delete_delay.saturating_mul(steps)).await;
        if self.touch_every > 0 && seq % self.touch_every == 0 {
            if let Err(err) = lease.touch().await {
                warn!(error = %err, "failed to renew reaper lease");
            }
        }

        let options = DeleteOptions {
            force: true,
            user: REAPER_USER.to_string(),
        };
        let target = entry.backup_ref();
        let precondition: &dyn DeletePrecondition = &self.precondition;
        match self
            .store
            .delete_backup_file(&target, &options, Some(precondition))
            .await
        {
            Ok(DeleteStatus::Deleted) => {
                info!(backup_guid = %target.backup_guid, root = %target.root_folder, "backup reaped");
                Some(target.backup_guid)
            }
            Ok(DeleteStatus::PreconditionNotMet) => {
                warn!(
                    backup_guid = %target.backup_guid,
                    instance = ?entry.instance_guid,
                    deployment = ?entry.deployment_name,
                    "on-demand backup protected, owner still active"
                );
                None
            }
            Err(err) => {
                error!(backup_guid = %target.backup_guid, error = %err, "failed to reap backup");
                None
            }
        }
    }
}
