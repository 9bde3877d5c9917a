//! One [`DirectorManager`] per plan, built once at start-up.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use orbit_core::OrbitConfig;

use crate::collaborators::Collaborators;
use crate::error::{DirectorError, DirectorResult};
use crate::manager::DirectorManager;
use crate::operation::DeploymentInstance;

pub struct ManagerRegistry {
    managers: HashMap<String, Arc<DirectorManager>>,
}

impl ManagerRegistry {
    pub fn from_config(config: &OrbitConfig, collaborators: Collaborators) -> DirectorResult<Self> {
        let mut managers = HashMap::with_capacity(config.plans.len());
        for plan in &config.plans {
            let manager = DirectorManager::new(config, plan.clone(), collaborators.clone())?;
            info!(plan = %plan.id, name = %plan.name, "registered plan");
            managers.insert(plan.id.clone(), Arc::new(manager));
        }
        Ok(Self { managers })
    }

    pub fn get(&self, plan_id: &str) -> DirectorResult<Arc<DirectorManager>> {
        self.managers
            .get(plan_id)
            .cloned()
            .ok_or_else(|| DirectorError::NotFound(format!("plan {plan_id}")))
    }

    /// Handle on a service instance of the given plan.
    pub fn instance(&self, plan_id: &str, instance_guid: &str) -> DirectorResult<DeploymentInstance> {
        Ok(DeploymentInstance::new(instance_guid, self.get(plan_id)?))
    }

    /// Registered plan ids, sorted.
    pub fn plan_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.managers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
