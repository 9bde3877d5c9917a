//! StateStore — redb-backed state persistence for Orbit.
//!
//! Provides typed CRUD operations over backup/restore metadata, deployment
//! properties and job schedules. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use orbit_core::{
    BackupMetadata, BackupRef, InstanceKey, JobType, RestoreMetadata, Schedule,
};
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(BACKUPS).map_err(map_err!(Table))?;
        txn.open_table(RESTORES).map_err(map_err!(Table))?;
        txn.open_table(PROPERTIES).map_err(map_err!(Table))?;
        txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON helpers ───────────────────────────────────────

    fn put_json<T: Serialize>(&self, table_def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table_def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix` (empty prefix lists the table).
    fn scan_json<T: DeserializeOwned>(&self, table_def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn remove(&self, table_def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read-modify-write of one record inside a single write transaction.
    fn update_json<T, F>(&self, table_def: JsonTable, key: &str, mutate: F) -> StateResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            let current = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| StateError::NotFound(key.to_string()))?;
            let mut record: T =
                serde_json::from_slice(&current).map_err(map_err!(Deserialize))?;
            mutate(&mut record);
            let bytes = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
            record
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    // ── Backups ────────────────────────────────────────────────────

    /// Insert or replace a backup metadata record.
    pub fn put_backup(&self, meta: &BackupMetadata) -> StateResult<()> {
        let key = backup_key(&meta.space_guid, &meta.backup_guid);
        self.put_json(BACKUPS, &key, meta)?;
        debug!(%key, state = %meta.state, "backup metadata stored");
        Ok(())
    }

    pub fn get_backup(&self, target: &BackupRef) -> StateResult<Option<BackupMetadata>> {
        self.get_json(BACKUPS, &backup_key(&target.root_folder, &target.backup_guid))
    }

    /// Apply `mutate` to a stored backup record. Fails `NotFound` when absent.
    pub fn update_backup<F>(&self, target: &BackupRef, mutate: F) -> StateResult<BackupMetadata>
    where
        F: FnOnce(&mut BackupMetadata),
    {
        let key = backup_key(&target.root_folder, &target.backup_guid);
        let updated = self.update_json(BACKUPS, &key, mutate)?;
        debug!(%key, state = %updated.state, "backup metadata patched");
        Ok(updated)
    }

    /// List every backup record across all root folders.
    pub fn list_backups(&self) -> StateResult<Vec<BackupMetadata>> {
        self.scan_json(BACKUPS, "")
    }

    /// List the backup records stored under one root folder.
    pub fn list_backups_in(&self, root_folder: &str) -> StateResult<Vec<BackupMetadata>> {
        self.scan_json(BACKUPS, &format!("{root_folder}/"))
    }

    /// Most recently started backup of an instance.
    pub fn latest_backup(&self, instance: &InstanceKey) -> StateResult<Option<BackupMetadata>> {
        let latest = self
            .list_backups_in(&instance.space_guid)?
            .into_iter()
            .filter(|b| {
                b.instance_guid == instance.instance_guid
                    && b.service_id == instance.service_id
                    && b.plan_id == instance.plan_id
            })
            .max_by_key(|b| b.started_at);
        Ok(latest)
    }

    /// Delete a backup record. Returns true if it existed.
    pub fn delete_backup(&self, target: &BackupRef) -> StateResult<bool> {
        let key = backup_key(&target.root_folder, &target.backup_guid);
        let existed = self.remove(BACKUPS, &key)?;
        debug!(%key, existed, "backup metadata deleted");
        Ok(existed)
    }

    // ── Restores ───────────────────────────────────────────────────

    /// Insert or replace the restore record of an instance.
    pub fn put_restore(&self, meta: &RestoreMetadata) -> StateResult<()> {
        let key = restore_key(&meta.space_guid, &meta.instance_guid);
        self.put_json(RESTORES, &key, meta)?;
        debug!(%key, state = %meta.state, "restore metadata stored");
        Ok(())
    }

    pub fn get_restore(&self, instance: &InstanceKey) -> StateResult<Option<RestoreMetadata>> {
        let found: Option<RestoreMetadata> = self.get_json(
            RESTORES,
            &restore_key(&instance.space_guid, &instance.instance_guid),
        )?;
        Ok(found.filter(|r| r.service_id == instance.service_id && r.plan_id == instance.plan_id))
    }

    pub fn update_restore<F>(&self, instance: &InstanceKey, mutate: F) -> StateResult<RestoreMetadata>
    where
        F: FnOnce(&mut RestoreMetadata),
    {
        let key = restore_key(&instance.space_guid, &instance.instance_guid);
        let updated = self.update_json(RESTORES, &key, mutate)?;
        debug!(%key, state = %updated.state, "restore metadata patched");
        Ok(updated)
    }

    pub fn delete_restore(&self, instance: &InstanceKey) -> StateResult<bool> {
        let key = restore_key(&instance.space_guid, &instance.instance_guid);
        let existed = self.remove(RESTORES, &key)?;
        debug!(%key, existed, "restore metadata deleted");
        Ok(existed)
    }

    // ── Deployment properties ──────────────────────────────────────

    pub fn get_property(&self, deployment: &str, property: &str) -> StateResult<Option<Value>> {
        self.get_json(PROPERTIES, &property_key(deployment, property))
    }

    /// Insert or overwrite a property.
    pub fn put_property(&self, deployment: &str, property: &str, value: &Value) -> StateResult<()> {
        let key = property_key(deployment, property);
        self.put_json(PROPERTIES, &key, value)?;
        debug!(%key, "property stored");
        Ok(())
    }

    /// Insert a property only if it does not exist yet.
    ///
    /// The existence check and the write share one write transaction, so two
    /// concurrent callers cannot both succeed. Fails `Conflict` when present.
    pub fn insert_property_if_absent(
        &self,
        deployment: &str,
        property: &str,
        value: &Value,
    ) -> StateResult<()> {
        let key = property_key(deployment, property);
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PROPERTIES).map_err(map_err!(Table))?;
            let exists = table.get(key.as_str()).map_err(map_err!(Read))?.is_some();
            if exists {
                return Err(StateError::Conflict(key));
            }
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "property created");
        Ok(())
    }

    /// Delete a property. Returns true if it existed.
    pub fn delete_property(&self, deployment: &str, property: &str) -> StateResult<bool> {
        let key = property_key(deployment, property);
        let existed = self.remove(PROPERTIES, &key)?;
        debug!(%key, existed, "property deleted");
        Ok(existed)
    }

    // ── Schedules ──────────────────────────────────────────────────

    pub fn put_schedule(&self, schedule: &Schedule) -> StateResult<()> {
        let key = schedule_key(&schedule.owner_id, schedule.job_type.as_str());
        self.put_json(SCHEDULES, &key, schedule)?;
        debug!(%key, "schedule stored");
        Ok(())
    }

    pub fn get_schedule(&self, owner_id: &str, job_type: JobType) -> StateResult<Option<Schedule>> {
        self.get_json(SCHEDULES, &schedule_key(owner_id, job_type.as_str()))
    }

    pub fn list_schedules(&self) -> StateResult<Vec<Schedule>> {
        self.scan_json(SCHEDULES, "")
    }

    pub fn delete_schedule(&self, owner_id: &str, job_type: JobType) -> StateResult<bool> {
        self.remove(SCHEDULES, &schedule_key(owner_id, job_type.as_str()))
    }
}
