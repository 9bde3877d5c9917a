//! redb table definitions for the Orbit state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

pub(crate) type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Backup metadata keyed by `{root_folder}/{backup_guid}`.
///
/// `root_folder` is the tenant space guid, or `OOB` for out-of-band backups.
pub const BACKUPS: JsonTable = TableDefinition::new("backups");

/// Restore metadata keyed by `{space_guid}/{instance_guid}`. One per instance.
pub const RESTORES: JsonTable = TableDefinition::new("restores");

/// Deployment properties keyed by `{deployment}/{property}`.
pub const PROPERTIES: JsonTable = TableDefinition::new("properties");

/// Recurring job schedules keyed by `{owner_id}:{job_type}`.
pub const SCHEDULES: JsonTable = TableDefinition::new("schedules");

pub fn backup_key(root_folder: &str, backup_guid: &str) -> String {
    format!("{root_folder}/{backup_guid}")
}

pub fn restore_key(space_guid: &str, instance_guid: &str) -> String {
    format!("{space_guid}/{instance_guid}")
}

pub fn property_key(deployment: &str, property: &str) -> String {
    format!("{deployment}/{property}")
}

pub fn schedule_key(owner_id: &str, job_type: &str) -> String {
    format!("{owner_id}:{job_type}")
}
