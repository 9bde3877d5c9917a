//! Operation routing and polling for one service instance.
//!
//! Every request a caller can make is a variant of [`OperationRequest`].
//! Submitting one returns an [`Operation`] handle; the caller keeps it and
//! hands it back to [`DeploymentInstance::last_operation`] until it reaches
//! a terminal state. Terminal handles are returned untouched.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tracing::{info, warn};

use orbit_core::{
    AgentLastOperation, BackupRef, DeployArgs, Operation, OperationKind, OperationState,
    OperationSubtype, RunState, Task, TaskState,
};

use crate::backup::{BackupRequest, InstanceScope, RestoreRequest};
use crate::error::{DirectorError, DirectorResult};
use crate::manager::{DirectorManager, IngressError, PreviousValues};
use crate::manifest::ManifestContext;

/// New state and description of an operation after a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: OperationState,
    pub description: String,
}

fn iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Map an apply-service task onto the operation it backs.
pub fn task_transition(action: &str, task: &Task) -> Transition {
    let at = DateTime::<Utc>::from_timestamp(task.timestamp, 0)
        .map(iso)
        .unwrap_or_else(|| task.timestamp.to_string());
    let name = &task.deployment;
    match task.state {
        TaskState::Done => Transition {
            state: OperationState::Succeeded,
            description: format!("{action} deployment {name} succeeded at {at}"),
        },
        TaskState::Error | TaskState::Cancelled | TaskState::Timeout => Transition {
            state: OperationState::Failed,
            description: format!("{action} deployment {name} failed at {at} with Error \"{}\"", task.result),
        },
        TaskState::Queued | TaskState::Processing => Transition {
            state: OperationState::InProgress,
            description: format!("{action} deployment {name} is still in progress"),
        },
    }
}

/// Map an agent backup/restore run onto the operation it backs.
pub fn run_transition(action: &str, deployment: &str, last: &AgentLastOperation, at: DateTime<Utc>) -> Transition {
    let at = iso(at);
    let stage = last.stage.as_deref().unwrap_or_default();
    match last.state {
        RunState::Succeeded => Transition {
            state: OperationState::Succeeded,
            description: format!("{action} deployment {deployment} succeeded at {at}"),
        },
        RunState::Aborted => Transition {
            state: OperationState::Failed,
            description: format!("{action} deployment {deployment} aborted at {at}"),
        },
        RunState::Failed => Transition {
            state: OperationState::Failed,
            description: format!("{action} deployment {deployment} failed at {at} with Error \"{stage}\""),
        },
        RunState::Processing => Transition {
            state: OperationState::InProgress,
            description: match &last.stage {
                Some(stage) => format!("{action} deployment {deployment} is still in progress: \"{stage}\""),
                None => format!("{action} deployment {deployment} is still in progress"),
            },
        },
    }
}

/// Everything a caller can ask of a service instance.
#[derive(Debug, Clone)]
pub enum OperationRequest {
    Create {
        parameters: Value,
        space_guid: String,
        organization_guid: Option<String>,
        context: Option<Value>,
    },
    Update {
        parameters: Value,
        previous_values: PreviousValues,
        args: DeployArgs,
    },
    Delete {
        space_guid: Option<String>,
    },
    Bind {
        binding_id: String,
        parameters: Value,
    },
    Unbind {
        binding_id: String,
    },
    Backup {
        previous_values: PreviousValues,
        request: BackupRequest,
    },
    Restore {
        previous_values: PreviousValues,
        request: RestoreRequest,
    },
    Unlock {
        description: Option<String>,
    },
}

/// A service instance as seen through its plan's manager.
#[derive(Clone)]
pub struct DeploymentInstance {
    guid: String,
    manager: Arc<DirectorManager>,
}

impl DeploymentInstance {
    pub fn new(guid: impl Into<String>, manager: Arc<DirectorManager>) -> Self {
        Self {
            guid: guid.into(),
            manager,
        }
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn manager(&self) -> &DirectorManager {
        &self.manager
    }

    pub async fn submit(&self, request: OperationRequest) -> DirectorResult<Operation> {
        let m = &self.manager;
        match request {
            OperationRequest::Create {
                parameters,
                space_guid,
                organization_guid,
                context,
            } => self.create(parameters, space_guid, organization_guid, context).await,
            OperationRequest::Update {
                parameters,
                previous_values,
                args,
            } => {
                let deployment = self.resolve_unlocked().await?;
                let ctx = ManifestContext {
                    parameters: parameters.clone(),
                    ..ManifestContext::default()
                };
                let task_id = m
                    .create_or_update_deployment(&deployment, ctx, Some(&previous_values), &args)
                    .await?;
                let mut op = self.submitted(OperationKind::Update, &deployment, task_id);
                op.parameters = Some(parameters);
                op.space_guid = previous_values.space_id;
                Ok(op)
            }
            OperationRequest::Delete { space_guid } => {
                let deployment = self.resolve_unlocked().await?;
                m.delete_security_group(&self.guid).await?;
                let space_guid = m.resolve_space(&self.guid, space_guid).await?;
                match &space_guid {
                    Some(space) => m.delete_restore_file(&self.guid, space).await?,
                    None => warn!(instance = %self.guid, "space unknown, restore metadata kept"),
                }
                let task_id = m.delete_deployment(&deployment).await?;
                let mut op = self.submitted(OperationKind::Delete, &deployment, task_id);
                op.space_guid = space_guid;
                Ok(op)
            }
            OperationRequest::Bind {
                binding_id,
                parameters,
            } => {
                let deployment = self.resolve_deployment().await?;
                let credentials = m.create_binding(&deployment, &binding_id, parameters.clone()).await?;
                let mut op = self.completed(OperationKind::Bind, &deployment);
                op.parameters = Some(parameters);
                op.credentials = Some(credentials);
                Ok(op)
            }
            OperationRequest::Unbind { binding_id } => {
                let deployment = self.resolve_deployment().await?;
                m.delete_binding(&deployment, &binding_id).await?;
                Ok(self.completed(OperationKind::Unbind, &deployment))
            }
            OperationRequest::Backup {
                previous_values,
                request,
            } => {
                let deployment = self.resolve_unlocked().await?;
                let scope = self.scope(deployment, previous_values)?;
                m.start_backup(&scope, request).await
            }
            OperationRequest::Restore {
                previous_values,
                request,
            } => {
                let deployment = self.resolve_unlocked().await?;
                let scope = self.scope(deployment, previous_values)?;
                m.start_restore(&scope, request).await
            }
            OperationRequest::Unlock { description } => {
                let deployment = self.resolve_deployment().await?;
                m.unlock(&deployment, description).await
            }
        }
    }

    /// Refresh a non-terminal handle.
    pub async fn last_operation(&self, mut op: Operation) -> DirectorResult<Operation> {
        if op.is_terminal() {
            return Ok(op);
        }
        let m = &self.manager;
        match (op.kind, op.subtype) {
            (_, Some(OperationSubtype::Backup)) => {
                let deployment = required(&op.deployment, "deployment")?;
                let agent_ip = required(&op.agent_ip, "agent_ip")?;
                let target = BackupRef::new(
                    required(&op.space_guid, "space_guid")?,
                    required(&op.backup_guid, "backup_guid")?,
                );
                let t = m.backup_operation_state(deployment, agent_ip, &target).await?;
                op.state = t.state;
                op.description = t.description;
                Ok(op)
            }
            (_, Some(OperationSubtype::Restore)) => {
                let deployment = required(&op.deployment, "deployment")?;
                let agent_ip = required(&op.agent_ip, "agent_ip")?;
                let space_guid = required(&op.space_guid, "space_guid")?;
                let t = m
                    .restore_operation_state(deployment, agent_ip, &self.guid, space_guid)
                    .await?;
                op.state = t.state;
                op.description = t.description;
                Ok(op)
            }
            (_, Some(OperationSubtype::Unlock))
            | (OperationKind::Bind | OperationKind::Unbind | OperationKind::Get, None) => Ok(op),
            (OperationKind::Create | OperationKind::Update | OperationKind::Delete, None) => {
                self.poll_task(op).await
            }
        }
    }

    async fn poll_task(&self, mut op: Operation) -> DirectorResult<Operation> {
        let task_id = required(&op.task_id, "task_id")?;
        let task = self.manager.get_task(task_id).await.map_err(|err| {
            if err.is_not_found() {
                DirectorError::NotFound(format!("service instance {}", self.guid))
            } else {
                err
            }
        })?;
        if self.manager.namer().instance_id_of(&task.deployment) != Some(self.guid.as_str()) {
            return Err(DirectorError::InvalidDeploymentName {
                name: task.deployment,
                expected: format!("a deployment of instance {}", self.guid),
            });
        }
        let index = self.manager.namer().index_of(&task.deployment)?;
        let t = task_transition(op.action_label(), &task);
        op.state = t.state;
        op.description = t.description;
        op.deployment = Some(task.deployment.clone());
        if op.is_terminal() {
            info!(instance = %self.guid, deployment = %task.deployment, state = %op.state, "operation finished");
            self.finalize(&mut op, &task.deployment, index).await;
        }
        Ok(op)
    }

    /// Ingress rules and auto-update once a create/update task is done.
    /// Ingress failures degrade the operation instead of failing the poll.
    async fn finalize(&self, op: &mut Operation, deployment: &str, index: u32) {
        let m = &self.manager;
        let ingress = match op.kind {
            OperationKind::Create => match op.space_guid.as_deref() {
                Some(space) => m
                    .create_security_group(&self.guid, index, space)
                    .await
                    .map(|_| ())
                    .map_err(IngressError::creation),
                None => Err(IngressError::creation(DirectorError::UnprocessableInput(format!(
                    "space of instance {} unknown",
                    self.guid
                )))),
            },
            OperationKind::Update => {
                m.ensure_security_group(&self.guid, index, op.space_guid.as_deref())
                    .await
            }
            _ => return,
        };
        match ingress {
            Ok(()) => {
                if op.kind == OperationKind::Create && op.state == OperationState::Succeeded {
                    m.schedule_auto_update(&self.guid).await;
                }
            }
            Err(err) => {
                warn!(instance = %self.guid, %deployment, step = err.step, error = %err.source, "ingress rules degraded");
                op.state = OperationState::Failed;
                op.description = format!(
                    "{} deployment '{deployment}' not yet completely succeeded because \"{err}\"",
                    op.action_label()
                );
            }
        }
    }

    async fn create(
        &self,
        parameters: Value,
        space_guid: String,
        organization_guid: Option<String>,
        context: Option<Value>,
    ) -> DirectorResult<Operation> {
        let m = &self.manager;
        let index = m.acquire_index(&self.guid).await?;
        let deployment = m.deployment_name(&self.guid, index);
        let ctx = ManifestContext {
            parameters: parameters.clone(),
            previous_manifest: None,
            organization_guid,
            space_guid: Some(space_guid.clone()),
        };
        let args = DeployArgs {
            context,
            ..DeployArgs::default()
        };
        let task_id = m.create_or_update_deployment(&deployment, ctx, None, &args).await?;
        let mut op = self.submitted(OperationKind::Create, &deployment, task_id);
        op.parameters = Some(parameters);
        op.space_guid = Some(space_guid);
        Ok(op)
    }

    async fn resolve_deployment(&self) -> DirectorResult<String> {
        let deployment = self.manager.find_deployment_name(&self.guid).await?;
        self.manager.namer().parse(&deployment)?;
        Ok(deployment)
    }

    /// Resolve the deployment and fail `AlreadyLocked` if it is locked.
    async fn resolve_unlocked(&self) -> DirectorResult<String> {
        let deployment = self.resolve_deployment().await?;
        self.manager.lock().verify(&deployment).await?;
        Ok(deployment)
    }

    fn scope(&self, deployment: String, previous: PreviousValues) -> DirectorResult<InstanceScope> {
        let space_guid = previous.space_id.ok_or_else(|| {
            DirectorError::BadRequest("previous_values must have the property 'space_id'".to_string())
        })?;
        Ok(InstanceScope {
            deployment,
            instance_guid: self.guid.clone(),
            space_guid,
            organization_guid: previous.organization_id,
        })
    }

    fn submitted(&self, kind: OperationKind, deployment: &str, task_id: String) -> Operation {
        let mut op = Operation::new(kind);
        op.state = OperationState::InProgress;
        op.description = format!("{} deployment {deployment} is still in progress", kind.label());
        op.task_id = Some(task_id);
        op.deployment = Some(deployment.to_string());
        op
    }

    fn completed(&self, kind: OperationKind, deployment: &str) -> Operation {
        let mut op = Operation::new(kind);
        op.state = OperationState::Succeeded;
        op.description = format!("{} deployment {deployment} succeeded at {}", kind.label(), iso(Utc::now()));
        op.deployment = Some(deployment.to_string());
        op
    }
}

fn required<'a>(value: &'a Option<String>, field: &str) -> DirectorResult<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| DirectorError::BadRequest(format!("Operation must have the property '{field}'")))
}
