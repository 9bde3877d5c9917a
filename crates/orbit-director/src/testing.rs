//! Recording fakes shared by the unit tests of this crate.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use orbit_core::{
    AgentFeature, AgentLastOperation, BackupDescriptor, BackupFileEntry, BackupMetadata, BackupRef,
    DeleteOptions, DeleteStatus, DeployArgs, DeploymentVm, InstanceKey, OrbitConfig,
    RestoreDescriptor, RestoreMetadata, RunPatch, RunState, SecurityRule, Task, TaskEvent,
    TaskFilter, TaskState, Vm,
};
use orbit_state::StateStore;

use crate::collaborators::{
    Agent, ApplyService, BackupStore, Collaborators, DeletePrecondition, JobLease, Platform,
};
use crate::error::{DirectorError, DirectorResult};
use crate::manager::DirectorManager;
use crate::manifest::ManifestContext;
use crate::operation::DeploymentInstance;

pub(crate) const CONFIG: &str = r#"
[infrastructure.stemcell]
name = "ubuntu-trusty"
version = "3263"

[[infrastructure.azs]]
name = "z1"

[[infrastructure.vm_types]]
name = "small"

[[infrastructure.networks]]
name = "default"
type = "manual"

[[infrastructure.networks.subnets]]
az = "z1"
range = "10.11.0.0/24"
gateway = "10.11.0.1"

[[plans]]
id = "small"
service_id = "blueprint"
name = "small"
template = """
name: {{ name }}
jobs:
  - name: db
    instances: 1
    networks:
      - name: {{ networks.0.name }}
        static_ips: [{{ networks.0.subnets.0.static.0 }}]
"""
releases = [{ name = "blueprint", version = "1" }]

[plans.agent]
features = ["state", "lifecycle", "credentials", "backup", "restore"]
"#;

// ── Apply service ──────────────────────────────────────────────────

#[derive(Default)]
struct ApplyState {
    deployments: BTreeMap<String, Option<String>>,
    tasks: BTreeMap<String, Task>,
    events: HashMap<String, Vec<TaskEvent>>,
    vms: HashMap<String, Vec<DeploymentVm>>,
    next_task: u64,
    submissions: usize,
}

#[derive(Default)]
pub(crate) struct FakeApply {
    state: Mutex<ApplyState>,
}

impl FakeApply {
    pub fn add_deployment(&self, name: &str, manifest: Option<String>) {
        self.state.lock().unwrap().deployments.insert(name.to_string(), manifest);
    }

    pub fn remove_deployment(&self, name: &str) {
        self.state.lock().unwrap().deployments.remove(name);
    }

    pub fn deployment_names(&self) -> Vec<String> {
        self.state.lock().unwrap().deployments.keys().cloned().collect()
    }

    pub fn set_vms(&self, deployment: &str, vms: Vec<DeploymentVm>) {
        self.state.lock().unwrap().vms.insert(deployment.to_string(), vms);
    }

    pub fn vms(&self, deployment: &str) -> Vec<DeploymentVm> {
        self.state.lock().unwrap().vms.get(deployment).cloned().unwrap_or_default()
    }

    pub fn add_task(&self, task: Task) {
        self.state.lock().unwrap().tasks.insert(task.id.clone(), task);
    }

    pub fn task(&self, id: &str) -> Option<Task> {
        self.state.lock().unwrap().tasks.get(id).cloned()
    }

    pub fn set_events(&self, task_id: &str, events: Vec<TaskEvent>) {
        self.state.lock().unwrap().events.insert(task_id.to_string(), events);
    }

    /// Register a task for `deployment` and return its id.
    pub fn submit_task(&self, deployment: &str, state: TaskState) -> String {
        let mut st = self.state.lock().unwrap();
        st.next_task += 1;
        let id = st.next_task.to_string();
        st.tasks.insert(
            id.clone(),
            Task {
                id: id.clone(),
                deployment: deployment.to_string(),
                state,
                description: format!("create deployment {deployment}"),
                result: String::new(),
                timestamp: Utc::now().timestamp(),
            },
        );
        id
    }

    pub fn finish_task(&self, id: &str, state: TaskState, result: &str) {
        let mut st = self.state.lock().unwrap();
        let task = st.tasks.get_mut(id).unwrap();
        task.state = state;
        task.result = result.to_string();
    }

    pub fn submissions(&self) -> usize {
        self.state.lock().unwrap().submissions
    }
}

fn manifest_name(manifest: &str) -> DirectorResult<String> {
    let doc: serde_yaml::Value = serde_yaml::from_str(manifest)
        .map_err(|e| DirectorError::upstream("apply service", e.to_string()))?;
    doc.get("name")
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| DirectorError::upstream("apply service", "manifest without name"))
}

#[async_trait]
impl ApplyService for FakeApply {
    async fn create_or_update_deployment(&self, manifest: &str, _args: &DeployArgs) -> DirectorResult<String> {
        let name = manifest_name(manifest)?;
        {
            let mut st = self.state.lock().unwrap();
            st.submissions += 1;
            st.deployments.insert(name.clone(), Some(manifest.to_string()));
        }
        Ok(self.submit_task(&name, TaskState::Processing))
    }

    async fn delete_deployment(&self, deployment: &str) -> DirectorResult<String> {
        self.remove_deployment(deployment);
        Ok(self.submit_task(deployment, TaskState::Queued))
    }

    async fn get_task(&self, task_id: &str) -> DirectorResult<Task> {
        self.task(task_id)
            .ok_or_else(|| DirectorError::NotFound(format!("task {task_id}")))
    }

    async fn get_tasks(&self, filter: &TaskFilter) -> DirectorResult<Vec<Task>> {
        let st = self.state.lock().unwrap();
        Ok(st
            .tasks
            .values()
            .filter(|t| filter.deployment.as_ref().is_none_or(|d| &t.deployment == d))
            .cloned()
            .collect())
    }

    async fn get_task_events(&self, task_id: &str) -> DirectorResult<Vec<TaskEvent>> {
        Ok(self.state.lock().unwrap().events.get(task_id).cloned().unwrap_or_default())
    }

    async fn get_deployment_manifest(&self, deployment: &str) -> DirectorResult<Option<String>> {
        Ok(self.state.lock().unwrap().deployments.get(deployment).cloned().flatten())
    }

    async fn get_deployment_vms(&self, deployment: &str) -> DirectorResult<Vec<DeploymentVm>> {
        Ok(self.vms(deployment))
    }

    async fn get_deployment_names(&self, _include_queued: bool) -> DirectorResult<Vec<String>> {
        Ok(self.deployment_names())
    }

    async fn get_deployment_name_for_instance_id(&self, instance_guid: &str) -> DirectorResult<String> {
        self.deployment_names()
            .into_iter()
            .find(|name| name.ends_with(&format!("-{instance_guid}")))
            .ok_or_else(|| DirectorError::NotFound(format!("deployment of instance {instance_guid}")))
    }

    async fn deployment_exists(&self, deployment: &str) -> DirectorResult<bool> {
        Ok(self.state.lock().unwrap().deployments.contains_key(deployment))
    }
}

// ── Agent ──────────────────────────────────────────────────────────

pub(crate) struct FakeAgent {
    agent_ip: String,
    calls: Mutex<Vec<&'static str>>,
    failures: Mutex<HashMap<&'static str, DirectorError>>,
    last: Mutex<AgentLastOperation>,
}

impl Default for FakeAgent {
    fn default() -> Self {
        Self {
            agent_ip: "10.0.1.10".to_string(),
            calls: Mutex::default(),
            failures: Mutex::default(),
            last: Mutex::new(AgentLastOperation {
                state: RunState::Processing,
                stage: None,
                snapshot_id: None,
                updated_at: None,
            }),
        }
    }
}

impl FakeAgent {
    pub fn agent_ip(&self) -> String {
        self.agent_ip.clone()
    }

    pub fn calls_of(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == call).count()
    }

    /// Fail the next `call` with `err`.
    pub fn fail_next(&self, call: &'static str, err: DirectorError) {
        self.failures.lock().unwrap().insert(call, err);
    }

    pub fn set_last_operation(&self, last: AgentLastOperation) {
        *self.last.lock().unwrap() = last;
    }

    fn record(&self, call: &'static str) -> DirectorResult<()> {
        self.calls.lock().unwrap().push(call);
        match self.failures.lock().unwrap().remove(call) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn last_operation(&self) -> AgentLastOperation {
        self.last.lock().unwrap().clone()
    }
}

#[async_trait]
impl Agent for FakeAgent {
    async fn get_state(&self, _ips: &[String]) -> DirectorResult<Value> {
        self.record("get_state")?;
        Ok(json!({"operational": true}))
    }

    async fn create_credentials(&self, _ips: &[String], _parameters: &Value) -> DirectorResult<Value> {
        self.record("create_credentials")?;
        Ok(json!({"username": "user-bind", "password": "pa55"}))
    }

    async fn delete_credentials(&self, _ips: &[String], _credentials: &Value) -> DirectorResult<()> {
        self.record("delete_credentials")
    }

    async fn start_backup(&self, _ips: &[String], _backup: &BackupDescriptor, _vms: &[Vm]) -> DirectorResult<String> {
        self.record("start_backup")?;
        Ok(self.agent_ip())
    }

    async fn get_backup_last_operation(&self, _agent_ip: &str) -> DirectorResult<AgentLastOperation> {
        self.record("get_backup_last_operation")?;
        Ok(self.last_operation())
    }

    async fn get_backup_logs(&self, _agent_ip: &str) -> DirectorResult<Vec<Value>> {
        self.record("get_backup_logs")?;
        Ok(vec![json!({"level": "info", "msg": "backup finished"})])
    }

    async fn abort_backup(&self, _agent_ip: &str) -> DirectorResult<()> {
        self.record("abort_backup")
    }

    async fn start_restore(&self, _ips: &[String], _backup: &RestoreDescriptor, _vms: &[Vm]) -> DirectorResult<String> {
        self.record("start_restore")?;
        Ok(self.agent_ip())
    }

    async fn get_restore_last_operation(&self, _agent_ip: &str) -> DirectorResult<AgentLastOperation> {
        self.record("get_restore_last_operation")?;
        Ok(self.last_operation())
    }

    async fn get_restore_logs(&self, _agent_ip: &str) -> DirectorResult<Vec<Value>> {
        self.record("get_restore_logs")?;
        Ok(vec![json!({"level": "info", "msg": "restore finished"})])
    }

    async fn abort_restore(&self, _agent_ip: &str) -> DirectorResult<()> {
        self.record("abort_restore")
    }

    async fn deprovision(&self, _ips: &[String]) -> DirectorResult<()> {
        self.record("deprovision")
    }
}

// ── Platform ───────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct FakePlatform {
    instances: Mutex<HashSet<String>>,
    spaces: Mutex<HashMap<String, String>>,
    groups: Mutex<HashMap<String, (String, Vec<SecurityRule>)>>,
    pending_create_failures: AtomicU32,
    create_attempts: AtomicU32,
    fail_lookups: AtomicBool,
}

impl FakePlatform {
    pub fn add_instance(&self, guid: &str) {
        self.instances.lock().unwrap().insert(guid.to_string());
    }

    pub fn set_space(&self, guid: &str, space_guid: &str) {
        self.spaces.lock().unwrap().insert(guid.to_string(), space_guid.to_string());
    }

    pub fn remove_instance(&self, guid: &str) {
        self.instances.lock().unwrap().remove(guid);
    }

    /// Fail the next `n` security group creations.
    pub fn fail_creates(&self, n: u32) {
        self.pending_create_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn create_attempts(&self) -> u32 {
        self.create_attempts.load(Ordering::SeqCst)
    }

    pub fn rules_of(&self, name: &str) -> Option<Vec<SecurityRule>> {
        self.groups.lock().unwrap().get(name).map(|(_, rules)| rules.clone())
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn instance_exists(&self, instance_guid: &str) -> DirectorResult<bool> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(DirectorError::upstream("platform", "lookup failed"));
        }
        Ok(self.instances.lock().unwrap().contains(instance_guid))
    }

    async fn instance_space(&self, instance_guid: &str) -> DirectorResult<Option<String>> {
        Ok(self.spaces.lock().unwrap().get(instance_guid).cloned())
    }

    async fn create_security_group(&self, name: &str, rules: &[SecurityRule], _space_guid: &str) -> DirectorResult<String> {
        self.create_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .pending_create_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DirectorError::upstream("platform", "security group not created"));
        }
        let guid = format!("sg-{name}");
        self.groups
            .lock()
            .unwrap()
            .insert(name.to_string(), (guid.clone(), rules.to_vec()));
        Ok(guid)
    }

    async fn find_security_group(&self, name: &str) -> DirectorResult<Option<String>> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(DirectorError::upstream("platform", "lookup failed"));
        }
        Ok(self.groups.lock().unwrap().get(name).map(|(guid, _)| guid.clone()))
    }

    async fn delete_security_group(&self, name: &str) -> DirectorResult<()> {
        self.groups
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| DirectorError::NotFound(format!("security group {name}")))
    }
}

// ── Backup store with failure injection ────────────────────────────

/// Delegates to a [`StateStore`] but can be told to fail writes.
pub(crate) struct FailingStore {
    inner: Arc<StateStore>,
    fail_puts: AtomicBool,
}

impl FailingStore {
    pub fn new(inner: Arc<StateStore>) -> Self {
        Self {
            inner,
            fail_puts: AtomicBool::new(false),
        }
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> DirectorResult<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(DirectorError::upstream("backup store", "write rejected"));
        }
        Ok(())
    }
}

#[async_trait]
impl BackupStore for FailingStore {
    async fn put_backup_file(&self, metadata: &BackupMetadata) -> DirectorResult<()> {
        self.check()?;
        self.inner.put_backup_file(metadata).await
    }

    async fn put_restore_file(&self, metadata: &RestoreMetadata) -> DirectorResult<()> {
        self.check()?;
        self.inner.put_restore_file(metadata).await
    }

    async fn patch_backup_file(&self, target: &BackupRef, patch: &RunPatch) -> DirectorResult<BackupMetadata> {
        self.inner.patch_backup_file(target, patch).await
    }

    async fn patch_restore_file(&self, instance: &InstanceKey, patch: &RunPatch) -> DirectorResult<RestoreMetadata> {
        self.inner.patch_restore_file(instance, patch).await
    }

    async fn get_backup_file(&self, target: &BackupRef) -> DirectorResult<BackupMetadata> {
        self.inner.get_backup_file(target).await
    }

    async fn get_latest_backup_file(&self, instance: &InstanceKey) -> DirectorResult<BackupMetadata> {
        self.inner.get_latest_backup_file(instance).await
    }

    async fn get_restore_file(&self, instance: &InstanceKey) -> DirectorResult<RestoreMetadata> {
        self.inner.get_restore_file(instance).await
    }

    async fn delete_backup_file(
        &self,
        target: &BackupRef,
        options: &DeleteOptions,
        precondition: Option<&dyn DeletePrecondition>,
    ) -> DirectorResult<DeleteStatus> {
        self.inner.delete_backup_file(target, options, precondition).await
    }

    async fn delete_restore_file(&self, instance: &InstanceKey) -> DirectorResult<()> {
        self.inner.delete_restore_file(instance).await
    }

    async fn list_backup_files(
        &self,
        older_than: DateTime<Utc>,
        newer_than: Option<DateTime<Utc>>,
        include_oob: bool,
    ) -> DirectorResult<Vec<BackupFileEntry>> {
        self.inner.list_backup_files(older_than, newer_than, include_oob).await
    }
}

// ── Job lease ──────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct CountingLease {
    touches: AtomicUsize,
}

impl CountingLease {
    pub fn touches(&self) -> usize {
        self.touches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobLease for CountingLease {
    async fn touch(&self) -> DirectorResult<()> {
        self.touches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Harness ────────────────────────────────────────────────────────

/// A manager for the test plan wired to fresh fakes.
pub(crate) struct Harness {
    pub config: OrbitConfig,
    pub manager: Arc<DirectorManager>,
    pub apply: Arc<FakeApply>,
    pub agent: Arc<FakeAgent>,
    pub platform: Arc<FakePlatform>,
    pub store: Arc<StateStore>,
    pub failing_store: Arc<FailingStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_features(features: &[AgentFeature]) -> Self {
        Self::with_config(|c| c.plans[0].agent.features = features.to_vec())
    }

    pub fn with_config(adjust: impl FnOnce(&mut OrbitConfig)) -> Self {
        let mut config = OrbitConfig::from_toml_str(CONFIG).unwrap();
        adjust(&mut config);
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let apply = Arc::new(FakeApply::default());
        let agent = Arc::new(FakeAgent::default());
        let platform = Arc::new(FakePlatform::default());
        let failing_store = Arc::new(FailingStore::new(store.clone()));
        let collaborators = wire(&apply, &agent, &platform, &store, &failing_store);
        let manager = DirectorManager::new(&config, config.plans[0].clone(), collaborators).unwrap();
        Self {
            manager: Arc::new(manager),
            config,
            apply,
            agent,
            platform,
            store,
            failing_store,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        wire(&self.apply, &self.agent, &self.platform, &self.store, &self.failing_store)
    }

    /// Register a running deployment of `instance_guid` at `index`.
    pub fn deploy(&self, instance_guid: &str, index: u32) -> String {
        let name = self.manager.deployment_name(instance_guid, index);
        let manifest = self
            .manager
            .generate_manifest(&name, &ManifestContext::default())
            .unwrap();
        self.apply.add_deployment(&name, Some(manifest));
        name
    }

    pub fn instance(&self, instance_guid: &str) -> DeploymentInstance {
        DeploymentInstance::new(instance_guid, self.manager.clone())
    }
}

fn wire(
    apply: &Arc<FakeApply>,
    agent: &Arc<FakeAgent>,
    platform: &Arc<FakePlatform>,
    store: &Arc<StateStore>,
    failing_store: &Arc<FailingStore>,
) -> Collaborators {
    Collaborators {
        apply: apply.clone(),
        properties: store.clone(),
        agent: agent.clone(),
        store: failing_store.clone(),
        scheduler: store.clone(),
        platform: platform.clone(),
    }
}

#[test]
fn harness_manifest_exposes_static_ip() {
    let h = Harness::new();
    let name = h.deploy("inst", 2);
    let stored = h.apply.state.lock().unwrap().deployments[&name].clone().unwrap();
    assert!(stored.contains("static_ips: [10.11.0.32]"), "{stored}");
}
