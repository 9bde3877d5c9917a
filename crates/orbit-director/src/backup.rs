//! Backup and restore orchestration.
//!
//! Starting a backup is a saga: agent start, metadata write, lock. Once the
//! agent accepted the run every later failure aborts it again, and once the
//! metadata is written it is force-deleted again. Restores follow the same
//! shape without the secret and without the lock.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use rand::RngCore;
use serde::Serialize;
use tracing::{info, warn};

use orbit_core::{
    AgentFeature, BackupDescriptor, BackupMetadata, BackupRef, DEFAULT_BACKUP_TYPE, DeleteOptions,
    DeleteStatus, InstanceKey, LockInstanceInfo, OOB_ROOT_FOLDER, Operation, OperationState,
    OperationSubtype, RestoreDescriptor, RestoreMetadata, RunPatch, RunState, Trigger,
};

use crate::error::{DirectorError, DirectorResult};
use crate::lock::LockRequest;
use crate::manager::DirectorManager;
use crate::operation::{Transition, run_transition};
use crate::saga::Saga;

/// Random bytes in a backup secret, before encoding.
const SECRET_BYTES: usize = 12;

/// Identifies the deployment a backup or restore runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceScope {
    pub deployment: String,
    pub instance_guid: String,
    pub space_guid: String,
    pub organization_guid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub backup_guid: String,
    /// Defaults to [`DEFAULT_BACKUP_TYPE`].
    pub backup_type: Option<String>,
    pub trigger: Trigger,
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    /// The backup to restore from, as recorded in its metadata.
    pub backup: RestoreDescriptor,
    pub username: String,
}

/// Result of an abort request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortOutcome {
    /// The agent was told to abort the running run.
    Aborting,
    /// Nothing was running; the stored state is returned.
    Unchanged(RunState),
}

impl AbortOutcome {
    pub fn state(&self) -> String {
        match self {
            AbortOutcome::Aborting => "aborting".to_string(),
            AbortOutcome::Unchanged(state) => state.to_string(),
        }
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

impl DirectorManager {
    fn instance_key(&self, instance_guid: &str, space_guid: &str) -> InstanceKey {
        InstanceKey {
            space_guid: space_guid.to_string(),
            service_id: self.plan().service_id.clone(),
            plan_id: self.plan().id.clone(),
            instance_guid: instance_guid.to_string(),
        }
    }

    // ── Backup ─────────────────────────────────────────────────────

    /// Fail `Forbidden` once the instance holds the maximum number of
    /// on-demand backup records, whatever their state.
    async fn check_on_demand_quota(&self, scope: &InstanceScope) -> DirectorResult<()> {
        let limit = self.settings().max_on_demand_backups;
        let held = self
            .c
            .store
            .list_backup_files(Utc::now(), None, scope.space_guid == OOB_ROOT_FOLDER)
            .await?
            .into_iter()
            .filter(|entry| {
                entry.trigger == Trigger::OnDemand
                    && entry.root_folder == scope.space_guid
                    && entry.instance_guid.as_deref() == Some(scope.instance_guid.as_str())
            })
            .count();
        if held >= limit as usize {
            warn!(instance = %scope.instance_guid, held, limit, "on-demand backup quota reached");
            return Err(DirectorError::Forbidden(format!(
                "Reached max quota of {limit} {} backups",
                Trigger::OnDemand
            )));
        }
        Ok(())
    }

    pub async fn start_backup(&self, scope: &InstanceScope, request: BackupRequest) -> DirectorResult<Operation> {
        let deployment = scope.deployment.as_str();
        let started_at = Utc::now();
        let descriptor = BackupDescriptor {
            guid: request.backup_guid.clone(),
            backup_type: request
                .backup_type
                .clone()
                .unwrap_or_else(|| DEFAULT_BACKUP_TYPE.to_string()),
            trigger: request.trigger,
            secret: generate_secret(),
        };
        info!(
            %deployment,
            backup_guid = %descriptor.guid,
            trigger = %descriptor.trigger,
            "starting backup"
        );

        if request.trigger == Trigger::OnDemand {
            self.check_on_demand_quota(scope).await?;
        }

        let (ips, vms) =
            futures::try_join!(self.deployment_ips(deployment), self.deployment_vms(deployment))?;
        let agent_ip = self.c.agent.start_backup(&ips, &descriptor, &vms).await?;
        info!(%deployment, backup_guid = %descriptor.guid, %agent_ip, "agent accepted backup");

        let mut saga = Saga::new(format!("backup {}", descriptor.guid));
        let agent = self.c.agent.clone();
        let ip = agent_ip.clone();
        saga.on_failure("start agent backup", move || async move { agent.abort_backup(&ip).await });

        let metadata = BackupMetadata {
            backup_guid: descriptor.guid.clone(),
            service_id: self.plan().service_id.clone(),
            plan_id: self.plan().id.clone(),
            instance_guid: scope.instance_guid.clone(),
            space_guid: scope.space_guid.clone(),
            organization_guid: scope.organization_guid.clone(),
            deployment_name: Some(deployment.to_string()),
            username: Some(request.username.clone()),
            trigger: descriptor.trigger,
            backup_type: descriptor.backup_type.clone(),
            state: RunState::Processing,
            agent_ip: agent_ip.clone(),
            secret: Some(descriptor.secret.clone()),
            snapshot_id: None,
            stage: None,
            logs: Vec::new(),
            started_at,
            finished_at: None,
        };
        saga.attempt("persist backup metadata", self.c.store.put_backup_file(&metadata))
            .await?;
        let store = self.c.store.clone();
        let target = metadata.backup_ref();
        let user = request.username.clone();
        saga.on_failure("persist backup metadata", move || async move {
            store
                .delete_backup_file(&target, &DeleteOptions { force: true, user }, None)
                .await
                .map(|_| ())
        });

        let lock = LockRequest {
            created_at: Some(started_at),
            instance_info: Some(LockInstanceInfo {
                space_guid: scope.space_guid.clone(),
                backup_guid: descriptor.guid.clone(),
                instance_guid: scope.instance_guid.clone(),
                agent_ip: agent_ip.clone(),
                service_id: metadata.service_id.clone(),
                plan_id: metadata.plan_id.clone(),
                deployment: deployment.to_string(),
                started_at,
            }),
            ..LockRequest::new(request.username.clone(), format!("{}_backup", descriptor.trigger))
        };
        saga.attempt("acquire deployment lock", self.lock().acquire(deployment, lock))
            .await?;

        let mut op = Operation::with_subtype(OperationSubtype::Backup);
        op.state = OperationState::InProgress;
        op.description = format!(
            "{} backup triggered by {} at {}",
            descriptor.trigger,
            request.username,
            started_at.to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        op.backup_guid = Some(descriptor.guid);
        op.agent_ip = Some(agent_ip);
        op.deployment = Some(deployment.to_string());
        op.space_guid = Some(scope.space_guid.clone());
        op.username = Some(request.username);
        Ok(op)
    }

    /// Poll the agent; on a terminal state fetch logs and record the outcome.
    pub async fn backup_operation_state(
        &self,
        deployment: &str,
        agent_ip: &str,
        target: &BackupRef,
    ) -> DirectorResult<Transition> {
        let last = self.c.agent.get_backup_last_operation(agent_ip).await?;
        let at = last.updated_at.unwrap_or_else(Utc::now);
        if last.state.is_terminal() {
            let logs = self.c.agent.get_backup_logs(agent_ip).await?;
            let patch = RunPatch {
                state: last.state,
                logs,
                snapshot_id: last.snapshot_id.clone(),
                finished_at: Some(at),
            };
            self.c.store.patch_backup_file(target, &patch).await?;
            info!(%deployment, backup_guid = %target.backup_guid, state = %last.state, "backup finished");
        }
        Ok(run_transition(OperationSubtype::Backup.label(), deployment, &last, at))
    }

    /// Latest backup of an instance. With `no_cache`, a running backup
    /// reports the agent's live state and stage.
    pub async fn last_backup(&self, instance_guid: &str, space_guid: &str, no_cache: bool) -> DirectorResult<BackupMetadata> {
        let key = self.instance_key(instance_guid, space_guid);
        let mut metadata = self.c.store.get_latest_backup_file(&key).await?;
        if metadata.state == RunState::Processing && no_cache {
            let live = self.c.agent.get_backup_last_operation(&metadata.agent_ip).await?;
            metadata.state = live.state;
            metadata.stage = live.stage;
        }
        Ok(metadata)
    }

    pub async fn abort_last_backup(&self, instance_guid: &str, space_guid: &str, force: bool) -> DirectorResult<AbortOutcome> {
        let key = self.instance_key(instance_guid, space_guid);
        let metadata = self.c.store.get_latest_backup_file(&key).await?;
        if !force && metadata.trigger == Trigger::Scheduled {
            return Err(DirectorError::Forbidden(
                "System scheduled backup runs cannot be aborted".to_string(),
            ));
        }
        match metadata.state {
            RunState::Processing => {
                self.c.agent.abort_backup(&metadata.agent_ip).await?;
                info!(instance = %instance_guid, backup_guid = %metadata.backup_guid, "backup abort requested");
                Ok(AbortOutcome::Aborting)
            }
            state => Ok(AbortOutcome::Unchanged(state)),
        }
    }

    /// Delete a backup on behalf of `user`. Scheduled backups younger than
    /// the retention period need `force`.
    pub async fn delete_backup(&self, target: &BackupRef, force: bool, user: &str) -> DirectorResult<DeleteStatus> {
        let metadata = self.c.store.get_backup_file(target).await?;
        let retention_days = self.settings().retention_days;
        let window_start = Utc::now() - ChronoDuration::days(i64::from(retention_days));
        if !force && metadata.trigger == Trigger::Scheduled && metadata.started_at > window_start {
            warn!(backup_guid = %target.backup_guid, %user, "refusing to delete scheduled backup within retention period");
            return Err(DirectorError::Forbidden(format!(
                "Delete of scheduled backup not permitted within retention period of {retention_days} days"
            )));
        }
        let options = DeleteOptions {
            force,
            user: user.to_string(),
        };
        self.c.store.delete_backup_file(target, &options, None).await
    }

    // ── Restore ────────────────────────────────────────────────────

    pub async fn start_restore(&self, scope: &InstanceScope, request: RestoreRequest) -> DirectorResult<Operation> {
        let deployment = scope.deployment.as_str();
        let backup_guid = request.backup.guid.clone();
        info!(%deployment, %backup_guid, "starting restore");

        if request.trigger == Trigger::OnDemand {
            self.check_on_demand_quota(scope).await?;
        }

        let (ips, vms) =
            futures::try_join!(self.deployment_ips(deployment), self.deployment_vms(deployment))?;
        let agent_ip = self.c.agent.start_restore(&ips, &request.backup, &vms).await?;
        info!(%deployment, %backup_guid, %agent_ip, "agent accepted restore");

        let mut saga = Saga::new(format!("restore {backup_guid}"));
        let agent = self.c.agent.clone();
        let ip = agent_ip.clone();
        saga.on_failure("start agent restore", move || async move { agent.abort_restore(&ip).await });

        let metadata = RestoreMetadata {
            backup_guid: backup_guid.clone(),
            service_id: self.plan().service_id.clone(),
            plan_id: self.plan().id.clone(),
            instance_guid: scope.instance_guid.clone(),
            space_guid: scope.space_guid.clone(),
            organization_guid: scope.organization_guid.clone(),
            username: Some(request.username.clone()),
            state: RunState::Processing,
            agent_ip: agent_ip.clone(),
            stage: None,
            logs: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        };
        saga.attempt("persist restore metadata", self.c.store.put_restore_file(&metadata))
            .await?;

        let mut op = Operation::with_subtype(OperationSubtype::Restore);
        op.state = OperationState::InProgress;
        op.description = format!("Restore deployment {deployment} is still in progress");
        op.backup_guid = Some(backup_guid);
        op.agent_ip = Some(agent_ip);
        op.deployment = Some(deployment.to_string());
        op.space_guid = Some(scope.space_guid.clone());
        op.username = Some(request.username);
        Ok(op)
    }

    pub async fn restore_operation_state(
        &self,
        deployment: &str,
        agent_ip: &str,
        instance_guid: &str,
        space_guid: &str,
    ) -> DirectorResult<Transition> {
        let last = self.c.agent.get_restore_last_operation(agent_ip).await?;
        let at = last.updated_at.unwrap_or_else(Utc::now);
        if last.state.is_terminal() {
            let logs = self.c.agent.get_restore_logs(agent_ip).await?;
            let patch = RunPatch {
                state: last.state,
                logs,
                snapshot_id: None,
                finished_at: Some(at),
            };
            let key = self.instance_key(instance_guid, space_guid);
            self.c.store.patch_restore_file(&key, &patch).await?;
            info!(%deployment, instance = %instance_guid, state = %last.state, "restore finished");
        }
        Ok(run_transition(OperationSubtype::Restore.label(), deployment, &last, at))
    }

    /// Latest restore of an instance; a running restore always reports the
    /// agent's live state and stage.
    pub async fn last_restore(&self, instance_guid: &str, space_guid: &str) -> DirectorResult<RestoreMetadata> {
        let key = self.instance_key(instance_guid, space_guid);
        let mut metadata = self.c.store.get_restore_file(&key).await?;
        if metadata.state == RunState::Processing {
            let live = self.c.agent.get_restore_last_operation(&metadata.agent_ip).await?;
            metadata.state = live.state;
            metadata.stage = live.stage;
        }
        Ok(metadata)
    }

    pub async fn abort_last_restore(&self, instance_guid: &str, space_guid: &str) -> DirectorResult<AbortOutcome> {
        let key = self.instance_key(instance_guid, space_guid);
        let metadata = self.c.store.get_restore_file(&key).await?;
        match metadata.state {
            RunState::Processing => {
                self.c.agent.abort_restore(&metadata.agent_ip).await?;
                info!(instance = %instance_guid, "restore abort requested");
                Ok(AbortOutcome::Aborting)
            }
            state => Ok(AbortOutcome::Unchanged(state)),
        }
    }

    /// Remove the instance's restore record, if the agent keeps any.
    pub async fn delete_restore_file(&self, instance_guid: &str, space_guid: &str) -> DirectorResult<()> {
        if !self.supports(AgentFeature::Backup) {
            return Ok(());
        }
        let key = self.instance_key(instance_guid, space_guid);
        match self.c.store.delete_restore_file(&key).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    // ── Unlock ─────────────────────────────────────────────────────

    pub async fn unlock(&self, deployment: &str, description: Option<String>) -> DirectorResult<Operation> {
        self.lock().release(deployment).await?;
        let mut op = Operation::with_subtype(OperationSubtype::Unlock);
        op.state = OperationState::Succeeded;
        op.deployment = Some(deployment.to_string());
        op.description = description.unwrap_or_else(|| format!("Unlocked deployment {deployment}"));
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::BackupStore;
    use crate::testing::Harness;
    use orbit_core::AgentLastOperation;

    fn scope(h: &Harness) -> InstanceScope {
        InstanceScope {
            deployment: h.deploy("inst", 1),
            instance_guid: "inst".to_string(),
            space_guid: "space".to_string(),
            organization_guid: Some("org".to_string()),
        }
    }

    fn backup_request(guid: &str, trigger: Trigger) -> BackupRequest {
        BackupRequest {
            backup_guid: guid.to_string(),
            backup_type: None,
            trigger,
            username: "admin".to_string(),
        }
    }

    #[test]
    fn secret_is_base64_of_twelve_bytes() {
        let secret = generate_secret();
        assert_eq!(STANDARD.decode(&secret).unwrap().len(), SECRET_BYTES);
        assert_ne!(secret, generate_secret());
    }

    #[tokio::test]
    async fn happy_path_backup() {
        let h = Harness::new();
        let scope = scope(&h);
        let op = h
            .manager
            .start_backup(&scope, backup_request("b1", Trigger::OnDemand))
            .await
            .unwrap();

        assert_eq!(op.subtype, Some(OperationSubtype::Backup));
        assert_eq!(op.agent_ip.as_deref(), Some(h.agent.agent_ip().as_str()));
        assert!(op.description.starts_with("on_demand backup triggered by admin at "));

        let stored = h.store.get_backup_file(&BackupRef::new("space", "b1")).await.unwrap();
        assert_eq!(stored.state, RunState::Processing);
        assert_eq!(stored.backup_type, DEFAULT_BACKUP_TYPE);
        assert!(stored.secret.is_some());

        let lock = h.manager.lock().current(&scope.deployment).await.unwrap().unwrap();
        assert_eq!(lock.lock_for_operation, "on_demand_backup");
        assert_eq!(lock.instance_info.unwrap().backup_guid, "b1");
    }

    #[tokio::test]
    async fn on_demand_quota_counts_existing_records() {
        let h = Harness::with_config(|c| c.backup.max_num_on_demand_backup = 2);
        let scope = scope(&h);

        h.manager
            .start_backup(&scope, backup_request("b1", Trigger::OnDemand))
            .await
            .unwrap();
        h.manager.unlock(&scope.deployment, None).await.unwrap();
        // one below the limit: still allowed
        h.manager
            .start_backup(&scope, backup_request("b2", Trigger::OnDemand))
            .await
            .unwrap();
        h.manager.unlock(&scope.deployment, None).await.unwrap();

        let starts = h.agent.calls_of("start_backup");
        let err = h
            .manager
            .start_backup(&scope, backup_request("b3", Trigger::OnDemand))
            .await
            .unwrap_err();
        assert!(matches!(err, DirectorError::Forbidden(msg) if msg == "Reached max quota of 2 on_demand backups"));
        assert_eq!(h.agent.calls_of("start_backup"), starts);

        // scheduled runs are not counted against the quota
        h.manager
            .start_backup(&scope, backup_request("s1", Trigger::Scheduled))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn terminal_poll_fetches_logs_once_and_patches() {
        let h = Harness::new();
        let scope = scope(&h);
        h.manager
            .start_backup(&scope, backup_request("b1", Trigger::OnDemand))
            .await
            .unwrap();
        let target = BackupRef::new("space", "b1");
        let ip = h.agent.agent_ip();

        h.agent.set_last_operation(AgentLastOperation {
            state: RunState::Processing,
            stage: Some("Creating volume".to_string()),
            snapshot_id: None,
            updated_at: None,
        });
        let running = h.manager.backup_operation_state(&scope.deployment, &ip, &target).await.unwrap();
        assert_eq!(running.state, OperationState::InProgress);
        assert!(running.description.ends_with("is still in progress: \"Creating volume\""));
        assert_eq!(h.agent.calls_of("get_backup_logs"), 0);

        h.agent.set_last_operation(AgentLastOperation {
            state: RunState::Succeeded,
            stage: None,
            snapshot_id: Some("snap-1".to_string()),
            updated_at: Some(Utc::now()),
        });
        let done = h.manager.backup_operation_state(&scope.deployment, &ip, &target).await.unwrap();
        assert_eq!(done.state, OperationState::Succeeded);
        assert_eq!(h.agent.calls_of("get_backup_logs"), 1);

        let stored = h.store.get_backup_file(&target).await.unwrap();
        assert_eq!(stored.state, RunState::Succeeded);
        assert_eq!(stored.snapshot_id.as_deref(), Some("snap-1"));
        assert_eq!(stored.logs.len(), 1);
    }

    #[tokio::test]
    async fn failed_metadata_write_aborts_agent_and_skips_lock() {
        let h = Harness::new();
        let scope = scope(&h);
        h.failing_store.fail_puts(true);

        let err = h
            .manager
            .start_backup(&scope, backup_request("b1", Trigger::OnDemand))
            .await
            .unwrap_err();

        assert!(matches!(err, DirectorError::Upstream { .. }));
        assert_eq!(h.agent.calls_of("abort_backup"), 1);
        assert!(h.manager.lock().current(&scope.deployment).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_lock_removes_metadata() {
        let h = Harness::new();
        let scope = scope(&h);
        let request = BackupRequest {
            username: String::new(),
            ..backup_request("b1", Trigger::OnDemand)
        };

        let err = h.manager.start_backup(&scope, request).await.unwrap_err();

        assert!(matches!(err, DirectorError::BadRequest(_)));
        assert_eq!(h.agent.calls_of("abort_backup"), 1);
        let gone = h.store.get_backup_file(&BackupRef::new("space", "b1")).await.unwrap_err();
        assert!(gone.is_not_found());
    }

    #[tokio::test]
    async fn abort_protects_scheduled_backups() {
        let h = Harness::new();
        let scope = scope(&h);
        h.manager
            .start_backup(&scope, backup_request("b1", Trigger::Scheduled))
            .await
            .unwrap();

        let err = h.manager.abort_last_backup("inst", "space", false).await.unwrap_err();
        assert!(matches!(err, DirectorError::Forbidden(_)));

        let outcome = h.manager.abort_last_backup("inst", "space", true).await.unwrap();
        assert_eq!(outcome, AbortOutcome::Aborting);
        assert_eq!(outcome.state(), "aborting");
        assert_eq!(h.agent.calls_of("abort_backup"), 1);
    }

    #[tokio::test]
    async fn last_backup_overlays_live_state_without_cache() {
        let h = Harness::new();
        let scope = scope(&h);
        h.manager
            .start_backup(&scope, backup_request("b1", Trigger::OnDemand))
            .await
            .unwrap();
        h.agent.set_last_operation(AgentLastOperation {
            state: RunState::Processing,
            stage: Some("Uploading".to_string()),
            snapshot_id: None,
            updated_at: None,
        });

        let cached = h.manager.last_backup("inst", "space", false).await.unwrap();
        assert!(cached.stage.is_none());
        let live = h.manager.last_backup("inst", "space", true).await.unwrap();
        assert_eq!(live.stage.as_deref(), Some("Uploading"));
    }

    #[tokio::test]
    async fn scheduled_backup_delete_needs_force_within_retention() {
        let h = Harness::new();
        let scope = scope(&h);
        h.manager
            .start_backup(&scope, backup_request("b1", Trigger::Scheduled))
            .await
            .unwrap();
        let target = BackupRef::new("space", "b1");
        h.store
            .patch_backup_file(
                &target,
                &RunPatch {
                    state: RunState::Succeeded,
                    logs: vec![],
                    snapshot_id: None,
                    finished_at: Some(Utc::now()),
                },
            )
            .await
            .unwrap();

        let err = h.manager.delete_backup(&target, false, "admin").await.unwrap_err();
        assert!(
            matches!(err, DirectorError::Forbidden(msg) if msg == "Delete of scheduled backup not permitted within retention period of 14 days")
        );
        let status = h.manager.delete_backup(&target, true, "admin").await.unwrap();
        assert_eq!(status, DeleteStatus::Deleted);
    }

    #[tokio::test]
    async fn restore_round_trip() {
        let h = Harness::new();
        let scope = scope(&h);
        let request = RestoreRequest {
            backup: RestoreDescriptor {
                guid: "b1".to_string(),
                backup_type: "online".to_string(),
                secret: Some("c2VjcmV0".to_string()),
                snapshot_id: Some("snap-1".to_string()),
            },
            username: "admin".to_string(),
        };
        let op = h.manager.start_restore(&scope, request).await.unwrap();
        assert_eq!(op.subtype, Some(OperationSubtype::Restore));
        assert!(h.manager.lock().current(&scope.deployment).await.unwrap().is_none());

        h.agent.set_last_operation(AgentLastOperation {
            state: RunState::Failed,
            stage: Some("Attaching volume".to_string()),
            snapshot_id: None,
            updated_at: Some(Utc::now()),
        });
        let ip = h.agent.agent_ip();
        let done = h
            .manager
            .restore_operation_state(&scope.deployment, &ip, "inst", "space")
            .await
            .unwrap();
        assert_eq!(done.state, OperationState::Failed);
        assert!(done.description.ends_with("with Error \"Attaching volume\""));

        let stored = h.manager.last_restore("inst", "space").await.unwrap();
        assert_eq!(stored.state, RunState::Failed);
        let outcome = h.manager.abort_last_restore("inst", "space").await.unwrap();
        assert_eq!(outcome, AbortOutcome::Unchanged(RunState::Failed));
    }

    #[tokio::test]
    async fn unlock_is_idempotent() {
        let h = Harness::new();
        let scope = scope(&h);
        h.manager
            .start_backup(&scope, backup_request("b1", Trigger::OnDemand))
            .await
            .unwrap();

        let op = h.manager.unlock(&scope.deployment, None).await.unwrap();
        assert_eq!(op.state, OperationState::Succeeded);
        assert_eq!(op.description, format!("Unlocked deployment {}", scope.deployment));
        h.manager.lock().verify(&scope.deployment).await.unwrap();
        h.manager.unlock(&scope.deployment, Some("done".to_string())).await.unwrap();
    }
}
