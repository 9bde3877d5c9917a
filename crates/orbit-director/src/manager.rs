//! Per-plan deployment manager.
//!
//! A `DirectorManager` owns everything plan-specific (naming, manifest
//! rendering, agent capabilities) and the collaborators it drives. It holds
//! no per-request state; instances share one manager per plan through the
//! [`ManagerRegistry`](crate::registry::ManagerRegistry).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use orbit_core::{
    AgentFeature, DeployArgs, IaasVmMetadata, OrbitConfig, PlanConfig, SecurityRule, Task,
    TaskFilter, Vm,
};

use crate::collaborators::Collaborators;
use crate::error::{DirectorError, DirectorResult};
use crate::lock::DeploymentLock;
use crate::manifest::{ManifestContext, ManifestGenerator};
use crate::naming::DeploymentNamer;
use crate::retry::RetryPolicy;

/// Port range opened by every ingress rule.
pub const INGRESS_PORTS: &str = "1024-65535";

/// Provider whose VM inventory is keyed by agent id instead of cid.
const AZURE: &str = "azure";

/// Values the platform remembers from provisioning, sent along on update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreviousValues {
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub space_id: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
}

/// Plan-independent knobs every manager shares.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub prefix: String,
    pub provider: String,
    pub retention_days: u32,
    pub max_on_demand_backups: u32,
    pub ingress_retry: RetryPolicy,
    pub auto_update_retry: RetryPolicy,
    pub scheduled_update: bool,
    pub auto_update_time_zone: String,
}

impl ManagerSettings {
    pub fn from_config(config: &OrbitConfig) -> Self {
        let delay = Duration::from_millis(config.retry.delay_ms);
        Self {
            prefix: config.director.prefix.clone(),
            provider: config.backup.provider.clone(),
            retention_days: config.backup.retention_period_in_days,
            max_on_demand_backups: config.backup.max_num_on_demand_backup,
            ingress_retry: RetryPolicy::fixed(config.retry.ingress_attempts, delay),
            auto_update_retry: RetryPolicy::fixed(config.retry.auto_update_attempts, delay),
            scheduled_update: config.features.scheduled_update,
            auto_update_time_zone: config.features.auto_update_time_zone.clone(),
        }
    }
}

/// A failed step of putting an instance's ingress rules in place.
#[derive(Debug, Error)]
#[error("security group {step} failed: {source}")]
pub struct IngressError {
    /// `lookup` or `creation`.
    pub step: &'static str,
    pub source: DirectorError,
}

impl IngressError {
    fn lookup(source: DirectorError) -> Self {
        Self { step: "lookup", source }
    }

    pub(crate) fn creation(source: DirectorError) -> Self {
        Self { step: "creation", source }
    }
}

/// Progress of one task within a stage of the create task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub index: u32,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    pub tags: Vec<String>,
    pub total: u32,
    pub tasks: BTreeMap<String, TaskProgress>,
}

/// The create task of a deployment with its events folded per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentInfo {
    pub task: Task,
    pub events: BTreeMap<String, StageProgress>,
}

pub struct DirectorManager {
    plan: PlanConfig,
    namer: DeploymentNamer,
    generator: ManifestGenerator,
    lock: DeploymentLock,
    settings: ManagerSettings,
    pub(crate) c: Collaborators,
}

impl DirectorManager {
    pub fn new(config: &OrbitConfig, plan: PlanConfig, collaborators: Collaborators) -> DirectorResult<Self> {
        let subnet = config.subnet_for(&plan);
        let namer = DeploymentNamer::new(config.director.prefix.clone(), subnet)?;
        let generator = ManifestGenerator::new(
            config.infrastructure.clone(),
            plan.clone(),
            config.network_name_for(&plan),
        );
        Ok(Self {
            lock: DeploymentLock::new(collaborators.properties.clone()),
            settings: ManagerSettings::from_config(config),
            plan,
            namer,
            generator,
            c: collaborators,
        })
    }

    pub fn plan(&self) -> &PlanConfig {
        &self.plan
    }

    pub fn namer(&self) -> &DeploymentNamer {
        &self.namer
    }

    pub fn generator(&self) -> &ManifestGenerator {
        &self.generator
    }

    pub fn lock(&self) -> &DeploymentLock {
        &self.lock
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn deployment_name(&self, instance_guid: &str, index: u32) -> String {
        self.namer.format(index, instance_guid)
    }

    pub fn supports(&self, feature: AgentFeature) -> bool {
        self.plan.has_feature(feature)
    }

    pub fn verify_feature(&self, feature: AgentFeature) -> DirectorResult<()> {
        if self.supports(feature) {
            Ok(())
        } else {
            Err(DirectorError::NotImplemented(format!(
                "Feature '{feature}' not supported"
            )))
        }
    }

    // ── Identity ───────────────────────────────────────────────────

    /// Allocate a fresh network segment index for a new instance.
    pub async fn acquire_index(&self, instance_guid: &str) -> DirectorResult<u32> {
        info!(instance = %instance_guid, "acquiring network segment index");
        let names = self.c.apply.get_deployment_names(true).await?;
        self.namer.allocate(&names, instance_guid)
    }

    pub async fn find_deployment_name(&self, instance_guid: &str) -> DirectorResult<String> {
        let name = self
            .c
            .apply
            .get_deployment_name_for_instance_id(instance_guid)
            .await?;
        debug!(instance = %instance_guid, deployment = %name, "found deployment");
        Ok(name)
    }

    // ── Manifests ──────────────────────────────────────────────────

    pub fn generate_manifest(&self, deployment: &str, ctx: &ManifestContext) -> DirectorResult<String> {
        let index = self.namer.index_of(deployment)?;
        self.generator.generate(deployment, index, ctx)
    }

    /// Re-render against the manifest that is currently deployed.
    pub async fn regenerate_manifest(&self, deployment: &str) -> DirectorResult<String> {
        let previous = self.c.apply.get_deployment_manifest(deployment).await?;
        self.generate_manifest(
            deployment,
            &ManifestContext {
                previous_manifest: previous,
                ..ManifestContext::default()
            },
        )
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Render and submit a manifest. `previous` marks an update.
    pub async fn create_or_update_deployment(
        &self,
        deployment: &str,
        mut ctx: ManifestContext,
        previous: Option<&PreviousValues>,
        args: &DeployArgs,
    ) -> DirectorResult<String> {
        let action = if previous.is_some() { "update" } else { "create" };
        info!(%deployment, action, "submitting deployment");
        if let Some(previous) = previous {
            ctx.previous_manifest = self.c.apply.get_deployment_manifest(deployment).await?;
            ctx.organization_guid = previous.organization_id.clone();
            ctx.space_guid = previous.space_id.clone();
        }
        let manifest = self.generate_manifest(deployment, &ctx)?;
        let task_id = self
            .c
            .apply
            .create_or_update_deployment(&manifest, args)
            .await
            .inspect_err(|err| error!(%deployment, action, error = %err, "failed to submit deployment"))?;
        info!(%deployment, action, %task_id, "scheduled deployment task");
        Ok(task_id)
    }

    /// Deprovision through the agent when supported, then submit the delete.
    pub async fn delete_deployment(&self, deployment: &str) -> DirectorResult<String> {
        info!(%deployment, "deleting deployment");
        if self.supports(AgentFeature::Lifecycle) {
            let deprovisioned = match self.deployment_ips(deployment).await {
                Ok(ips) => self.c.agent.deprovision(&ips).await,
                Err(err) => Err(err),
            };
            match deprovisioned {
                Ok(()) => {}
                Err(DirectorError::NotImplemented(_) | DirectorError::NotOperational(_)) => {
                    debug!(%deployment, "deprovision skipped");
                }
                Err(err) => return Err(err),
            }
        }
        let task_id = self.c.apply.delete_deployment(deployment).await?;
        info!(%deployment, %task_id, "scheduled delete deployment task");
        Ok(task_id)
    }

    pub async fn get_task(&self, task_id: &str) -> DirectorResult<Task> {
        let task = self.c.apply.get_task(task_id).await?;
        debug!(%task_id, deployment = %task.deployment, state = ?task.state, "fetched task");
        Ok(task)
    }

    // ── Inventory ──────────────────────────────────────────────────

    /// Static IPs of every job in the deployed manifest.
    pub async fn deployment_ips(&self, deployment: &str) -> DirectorResult<Vec<String>> {
        let manifest = self
            .c
            .apply
            .get_deployment_manifest(deployment)
            .await?
            .ok_or_else(|| DirectorError::NotOperational(deployment.to_string()))?;
        manifest_ips(&manifest)
    }

    pub async fn deployment_vms(&self, deployment: &str) -> DirectorResult<Vec<Vm>> {
        let vms = self.c.apply.get_deployment_vms(deployment).await?;
        let on_azure = self.settings.provider == AZURE;
        Ok(vms
            .into_iter()
            .map(|vm| {
                let vm_id = if on_azure { vm.agent_id.clone() } else { vm.cid.clone() };
                Vm {
                    cid: vm.cid,
                    agent_id: vm.agent_id,
                    job: vm.job,
                    index: vm.index,
                    iaas_vm_metadata: IaasVmMetadata { vm_id },
                }
            })
            .collect())
    }

    // ── Bindings ───────────────────────────────────────────────────

    /// Create credentials through the agent and record the binding.
    pub async fn create_binding(&self, deployment: &str, binding_id: &str, parameters: Value) -> DirectorResult<Value> {
        self.verify_feature(AgentFeature::Credentials)?;
        info!(%deployment, binding = %binding_id, "creating binding");
        let ips = self.deployment_ips(deployment).await?;
        let credentials = self.c.agent.create_credentials(&ips, &parameters).await?;
        let record = json!({
            "id": binding_id,
            "parameters": parameters,
            "credentials": credentials,
        });
        self.c
            .properties
            .create_property(deployment, &binding_property(binding_id), &record)
            .await
            .map_err(|err| match err {
                DirectorError::AlreadyExists(_) => {
                    DirectorError::AlreadyExists(format!("binding {binding_id}"))
                }
                other => other,
            })?;
        info!(%deployment, binding = %binding_id, "created binding");
        Ok(credentials)
    }

    pub async fn delete_binding(&self, deployment: &str, binding_id: &str) -> DirectorResult<()> {
        self.verify_feature(AgentFeature::Credentials)?;
        info!(%deployment, binding = %binding_id, "deleting binding");
        let key = binding_property(binding_id);
        let record = self
            .c
            .properties
            .get_property(deployment, &key)
            .await?
            .ok_or_else(|| DirectorError::NotFound(format!("binding {binding_id}")))?;
        let ips = self.deployment_ips(deployment).await?;
        let credentials = record.get("credentials").cloned().unwrap_or(Value::Null);
        self.c.agent.delete_credentials(&ips, &credentials).await?;
        self.c.properties.delete_property(deployment, &key).await?;
        info!(%deployment, binding = %binding_id, "deleted binding");
        Ok(())
    }

    // ── Status ─────────────────────────────────────────────────────

    /// The deployment's create task with its events folded per stage, or
    /// `None` when the deployment does not exist.
    pub async fn deployment_info(&self, deployment: &str) -> DirectorResult<Option<DeploymentInfo>> {
        if !self.c.apply.deployment_exists(deployment).await? {
            return Ok(None);
        }
        let mut tasks = self
            .c
            .apply
            .get_tasks(&TaskFilter {
                deployment: Some(deployment.to_string()),
            })
            .await?;
        tasks.sort_by(|a, b| task_order(&a.id).cmp(&task_order(&b.id)));
        let Some(task) = tasks.into_iter().find(|t| is_create_task(&t.description)) else {
            return Ok(None);
        };
        let mut events: BTreeMap<String, StageProgress> = BTreeMap::new();
        for event in self.c.apply.get_task_events(&task.id).await? {
            let stage = events
                .entry(event.stage.clone())
                .or_insert_with(|| StageProgress {
                    tags: event.tags.clone(),
                    total: event.total,
                    tasks: BTreeMap::new(),
                });
            match stage.tasks.get_mut(&event.task) {
                None => {
                    stage.tasks.insert(
                        event.task.clone(),
                        TaskProgress {
                            index: event.index,
                            status: event.state.clone(),
                            time: Some(event.time),
                            duration: None,
                        },
                    );
                }
                Some(progress) => {
                    progress.status = event.state.clone();
                    if let Some(started) = progress.time.take() {
                        progress.duration = Some(format!("{} sec", event.time - started));
                    }
                }
            }
        }
        Ok(Some(DeploymentInfo { task, events }))
    }

    /// The caller's space if given, else the one the platform reports.
    pub async fn resolve_space(&self, instance_guid: &str, space_guid: Option<String>) -> DirectorResult<Option<String>> {
        if space_guid.is_some() {
            return Ok(space_guid);
        }
        let space = self.c.platform.instance_space(instance_guid).await?;
        debug!(instance = %instance_guid, space = ?space, "looked up instance space");
        Ok(space)
    }

    pub async fn instance_state(&self, instance_guid: &str) -> DirectorResult<Value> {
        let deployment = self.find_deployment_name(instance_guid).await?;
        let ips = self.deployment_ips(&deployment).await?;
        self.c.agent.get_state(&ips).await
    }

    // ── Ingress rules ──────────────────────────────────────────────

    pub fn security_group_name(&self, instance_guid: &str) -> String {
        format!("{}-{}", self.settings.prefix, instance_guid)
    }

    /// One tcp rule per static range of the deployment's network.
    pub fn security_group_rules(&self, index: u32) -> DirectorResult<Vec<SecurityRule>> {
        Ok(self
            .generator
            .deployment_networks(index)?
            .iter()
            .filter_map(|net| net.static_range())
            .map(|destination| SecurityRule {
                protocol: "tcp".to_string(),
                destination,
                ports: INGRESS_PORTS.to_string(),
            })
            .collect())
    }

    pub async fn create_security_group(&self, instance_guid: &str, index: u32, space_guid: &str) -> DirectorResult<String> {
        let name = self.security_group_name(instance_guid);
        let rules = self.security_group_rules(index)?;
        let group = self
            .settings
            .ingress_retry
            .run("create security group", |_| {
                self.c.platform.create_security_group(&name, &rules, space_guid)
            })
            .await?;
        info!(instance = %instance_guid, %name, %group, "security group created");
        Ok(group)
    }

    /// Recreate the security group if it went missing.
    pub async fn ensure_security_group(
        &self,
        instance_guid: &str,
        index: u32,
        space_guid: Option<&str>,
    ) -> Result<(), IngressError> {
        let name = self.security_group_name(instance_guid);
        let found = self
            .c
            .platform
            .find_security_group(&name)
            .await
            .map_err(IngressError::lookup)?;
        if found.is_some() {
            debug!(%name, "security group exists");
            return Ok(());
        }
        warn!(instance = %instance_guid, %name, "security group missing, recreating");
        let space_guid = space_guid.ok_or_else(|| {
            IngressError::creation(DirectorError::UnprocessableInput(format!(
                "space of instance {instance_guid} unknown"
            )))
        })?;
        self.create_security_group(instance_guid, index, space_guid)
            .await
            .map_err(IngressError::creation)?;
        Ok(())
    }

    /// Remove the security group. An absent group counts as removed.
    pub async fn delete_security_group(&self, instance_guid: &str) -> DirectorResult<()> {
        let name = self.security_group_name(instance_guid);
        match self.c.platform.delete_security_group(&name).await {
            Ok(()) => {
                info!(instance = %instance_guid, %name, "security group deleted");
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    // ── Scheduling ─────────────────────────────────────────────────

    /// Register the instance for automatic updates. Failures are logged only.
    pub async fn schedule_auto_update(&self, instance_guid: &str) {
        if !self.settings.scheduled_update {
            warn!(instance = %instance_guid, "schedule update feature is disabled, auto update not scheduled");
            return;
        }
        let time_zone = self.settings.auto_update_time_zone.as_str();
        let scheduled = self
            .settings
            .auto_update_retry
            .run("schedule auto update", |_| {
                self.c.scheduler.schedule_auto_update(instance_guid, time_zone)
            })
            .await;
        if let Err(err) = scheduled {
            error!(instance = %instance_guid, error = %err, "error occurred while scheduling auto update");
        }
    }
}

pub(crate) fn binding_property(binding_id: &str) -> String {
    format!("binding-{binding_id}")
}

/// Collect `static_ips` of every network of every job / instance group.
fn manifest_ips(manifest: &str) -> DirectorResult<Vec<String>> {
    let doc: serde_yaml::Value = serde_yaml::from_str(manifest)
        .map_err(|e| DirectorError::upstream("apply service", format!("unreadable manifest: {e}")))?;
    let mut ips = Vec::new();
    for section in ["jobs", "instance_groups"] {
        let Some(groups) = doc.get(section).and_then(|v| v.as_sequence()) else {
            continue;
        };
        for group in groups {
            let Some(networks) = group.get("networks").and_then(|v| v.as_sequence()) else {
                continue;
            };
            for net in networks {
                if let Some(static_ips) = net.get("static_ips").and_then(|v| v.as_sequence()) {
                    ips.extend(static_ips.iter().filter_map(|ip| ip.as_str()).map(String::from));
                }
            }
        }
    }
    Ok(ips)
}

fn is_create_task(description: &str) -> bool {
    description
        .strip_prefix("create")
        .filter(|rest| rest.starts_with(char::is_whitespace))
        .is_some_and(|rest| rest.trim_start().starts_with("deployment"))
}

/// Numeric ids sort numerically, anything else after them lexically.
fn task_order(id: &str) -> (u8, u64, &str) {
    match id.parse::<u64>() {
        Ok(n) => (0, n, id),
        Err(_) => (1, 0, id),
    }
}
