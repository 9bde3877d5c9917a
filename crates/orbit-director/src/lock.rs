//! Durable per-deployment lock.
//!
//! The lock is a deployment property, so it survives restarts and is shared
//! by every orchestrator process talking to the same property store.
//! [`DeploymentLock::acquire`] overwrites any existing record (last writer
//! wins); [`DeploymentLock::acquire_exclusive`] refuses to.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use orbit_core::{LockInfo, LockInstanceInfo};

use crate::collaborators::DeploymentProperties;
use crate::error::{DirectorError, DirectorResult};

/// Property key the lock record is stored under.
pub const LOCK_PROPERTY: &str = "__LOCK__";

/// What a caller supplies to take the lock.
#[derive(Debug, Clone, Default)]
pub struct LockRequest {
    pub username: Option<String>,
    pub lock_for_operation: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub instance_info: Option<LockInstanceInfo>,
}

impl LockRequest {
    pub fn new(username: impl Into<String>, lock_for_operation: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            lock_for_operation: Some(lock_for_operation.into()),
            ..Self::default()
        }
    }

    fn into_lock_info(self, deployment: &str) -> DirectorResult<LockInfo> {
        match (self.username, self.lock_for_operation) {
            (Some(username), Some(lock_for_operation))
                if !username.is_empty() && !lock_for_operation.is_empty() =>
            {
                Ok(LockInfo {
                    username,
                    lock_for_operation,
                    created_at: self.created_at.unwrap_or_else(Utc::now),
                    instance_info: self.instance_info,
                })
            }
            _ => {
                let msg = format!(
                    "Lock cannot be acquired on deployment {deployment} as (username | lockForOperation) is empty"
                );
                error!(%deployment, "{msg}");
                Err(DirectorError::BadRequest(msg))
            }
        }
    }
}

#[derive(Clone)]
pub struct DeploymentLock {
    properties: Arc<dyn DeploymentProperties>,
}

impl DeploymentLock {
    pub fn new(properties: Arc<dyn DeploymentProperties>) -> Self {
        Self { properties }
    }

    /// Write the lock record, replacing any existing one.
    pub async fn acquire(&self, deployment: &str, request: LockRequest) -> DirectorResult<LockInfo> {
        let lock = request.into_lock_info(deployment)?;
        let value = to_value(&lock)?;
        self.properties
            .update_or_create_property(deployment, LOCK_PROPERTY, &value)
            .await?;
        info!(
            %deployment,
            username = %lock.username,
            operation = %lock.lock_for_operation,
            "deployment lock acquired"
        );
        Ok(lock)
    }

    /// Write the lock record only if none exists. Contention fails
    /// `AlreadyLocked` carrying the current holder.
    pub async fn acquire_exclusive(&self, deployment: &str, request: LockRequest) -> DirectorResult<LockInfo> {
        let lock = request.into_lock_info(deployment)?;
        let value = to_value(&lock)?;
        match self
            .properties
            .create_property(deployment, LOCK_PROPERTY, &value)
            .await
        {
            Ok(()) => {
                info!(%deployment, username = %lock.username, "deployment lock acquired exclusively");
                Ok(lock)
            }
            Err(DirectorError::AlreadyExists(_)) => match self.current(deployment).await? {
                Some(holder) => Err(DirectorError::locked(deployment, holder)),
                // Released between the two calls.
                None => Err(DirectorError::upstream(
                    "deployment properties",
                    format!("lock on {deployment} changed while acquiring"),
                )),
            },
            Err(err) => Err(err),
        }
    }

    /// Remove the lock. An absent lock counts as released.
    pub async fn release(&self, deployment: &str) -> DirectorResult<()> {
        match self.properties.delete_property(deployment, LOCK_PROPERTY).await {
            Ok(()) => {
                info!(%deployment, "deployment lock released");
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                info!(%deployment, "lock already released from deployment");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Fail `AlreadyLocked` if a lock record exists.
    pub async fn verify(&self, deployment: &str) -> DirectorResult<()> {
        match self.current(deployment).await? {
            Some(lock) => Err(DirectorError::locked(deployment, lock)),
            None => Ok(()),
        }
    }

    pub async fn current(&self, deployment: &str) -> DirectorResult<Option<LockInfo>> {
        let Some(value) = self.properties.get_property(deployment, LOCK_PROPERTY).await? else {
            return Ok(None);
        };
        serde_json::from_value(value).map(Some).map_err(|e| {
            DirectorError::upstream("deployment properties", format!("malformed lock record: {e}"))
        })
    }
}

fn to_value(lock: &LockInfo) -> DirectorResult<serde_json::Value> {
    serde_json::to_value(lock)
        .map_err(|e| DirectorError::upstream("deployment properties", e.to_string()))
}
