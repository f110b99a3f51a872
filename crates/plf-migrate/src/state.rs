//! Migration state: cloud records and one entity per table
//!
//! `sync` and `register` are independent state machines. Refresh touches
//! only the recorded metadata pointer; clear resets both to pending.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use plf_common::{warehouse_table_name, ResourceBase};
use plf_setup::TableIdent;
use serde::{Deserialize, Serialize};

use crate::{MigrateError, Result};

/// Transfer stage of one table
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Pending,
    InProgress,
    Synced,
    Failed,
}

impl SyncStatus {
    /// Statuses a plain (non-forced) sync picks up
    pub fn is_actionable(self) -> bool {
        !matches!(self, SyncStatus::Synced)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncStatus::Pending => "pending",
            SyncStatus::InProgress => "in_progress",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        })
    }
}

/// Warehouse registration stage of one table
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterStatus {
    #[default]
    Pending,
    Done,
}

impl fmt::Display for RegisterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RegisterStatus::Pending => "pending",
            RegisterStatus::Done => "done",
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub object_count: u64,
    #[serde(default)]
    pub total_bytes: u64,
    /// Digest of the source key+size listing at the last successful sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRecord {
    pub status: RegisterStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refreshed_at: Option<DateTime<Utc>>,
    /// Fully qualified warehouse table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sf_table: Option<String>,
    /// Metadata file the warehouse table currently points at, relative to the bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_error: Option<String>,
}

/// One table tracked through the pipeline
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationEntity {
    pub namespace: String,
    pub table: String,
    #[serde(default)]
    pub sync: SyncRecord,
    #[serde(default)]
    pub register: RegisterRecord,
}

impl MigrationEntity {
    pub fn new(ident: &TableIdent) -> Self {
        Self {
            namespace: ident.namespace.clone(),
            table: ident.name.clone(),
            sync: SyncRecord::default(),
            register: RegisterRecord::default(),
        }
    }

    pub fn key(&self) -> String {
        entity_key(&self.namespace, &self.table)
    }

    pub fn ident(&self) -> TableIdent {
        TableIdent::new(&self.namespace, &self.table)
    }

    /// Object prefix of the table inside a bucket
    pub fn prefix(&self) -> String {
        format!("{}/{}/", self.namespace, self.table)
    }

    /// Back to pending in both stages, keeping identity only
    pub fn reset(&mut self) {
        self.sync = SyncRecord::default();
        self.register = RegisterRecord::default();
    }
}

/// State key of a table: `NAMESPACE_TABLE`
pub fn entity_key(namespace: &str, table: &str) -> String {
    warehouse_table_name(namespace, table)
}

/// Two tables that would share one warehouse table name
pub fn name_collision(first: &TableIdent, second: &TableIdent) -> MigrateError {
    MigrateError::validation(format!(
        "tables {} and {} both map to warehouse table {}; rename one of them",
        first,
        second,
        entity_key(&second.namespace, &second.name)
    ))
}

/// Cloud storage created by setup-cloud
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudRecord {
    pub bucket: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
    /// Naming inputs the bucket and warehouse objects were created with
    pub base: ResourceBase,
    pub updated_at: DateTime<Utc>,
}

/// Warehouse objects created by setup-cloud
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseRecord {
    pub catalog_integration: String,
    pub external_volume: String,
    pub sa_role: String,
    pub database: String,
    pub schema: String,
    pub updated_at: DateTime<Utc>,
}

/// Everything persisted in `l2c-state.json`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<CloudRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warehouse: Option<WarehouseRecord>,
    #[serde(default)]
    pub tables: BTreeMap<String, MigrationEntity>,
}

impl MigrationState {
    pub fn entity(&self, key: &str) -> Option<&MigrationEntity> {
        self.tables.get(key)
    }

    /// The entity for `ident`, created pending on first sight.
    ///
    /// Fails when another table already holds the same warehouse name.
    pub fn entity_mut(&mut self, ident: &TableIdent) -> Result<&mut MigrationEntity> {
        let entity = self
            .tables
            .entry(entity_key(&ident.namespace, &ident.name))
            .or_insert_with(|| MigrationEntity::new(ident));
        if entity.namespace != ident.namespace || entity.table != ident.name {
            return Err(name_collision(&entity.ident(), ident));
        }
        Ok(entity)
    }

    /// Structural checks applied to a loaded state file
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (key, entity) in &self.tables {
            if *key != entity.key() {
                return Err(format!(
                    "table record {} is keyed {} but describes {}.{}",
                    key, key, entity.namespace, entity.table
                ));
            }
            if entity.register.status == RegisterStatus::Done && entity.sync.last_sync.is_none() {
                return Err(format!("table {} is registered but was never synced", key));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_keys_are_uppercase_with_underscores() {
        assert_eq!(entity_key("wildlife", "penguins"), "WILDLIFE_PENGUINS");
        assert_eq!(entity_key("my-ns", "sea-lions"), "MY_NS_SEA_LIONS");
    }

    #[test]
    fn status_wire_names() {
        let json = serde_json::to_string(&SyncStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let status: RegisterStatus = serde_json::from_str("\"done\"").unwrap();
        assert_eq!(status, RegisterStatus::Done);
    }

    #[test]
    fn only_synced_tables_are_skipped_by_default() {
        assert!(SyncStatus::Pending.is_actionable());
        assert!(SyncStatus::InProgress.is_actionable());
        assert!(SyncStatus::Failed.is_actionable());
        assert!(!SyncStatus::Synced.is_actionable());
    }

    #[test]
    fn reset_keeps_identity() {
        let mut entity = MigrationEntity::new(&TableIdent::new("wildlife", "penguins"));
        entity.sync.status = SyncStatus::Synced;
        entity.sync.last_sync = Some(Utc::now());
        entity.register.status = RegisterStatus::Done;
        entity.reset();
        assert_eq!(entity.sync.status, SyncStatus::Pending);
        assert_eq!(entity.register.status, RegisterStatus::Pending);
        assert_eq!(entity.key(), "WILDLIFE_PENGUINS");
    }

    #[test]
    fn mis_keyed_record_fails_validation() {
        let mut state = MigrationState::default();
        let entity = MigrationEntity::new(&TableIdent::new("wildlife", "penguins"));
        state.tables.insert("OTHER".into(), entity);
        assert!(state.validate().is_err());
    }

    #[test]
    fn registered_without_sync_fails_validation() {
        let mut state = MigrationState::default();
        state
            .entity_mut(&TableIdent::new("wildlife", "penguins"))
            .unwrap()
            .register
            .status = RegisterStatus::Done;
        assert!(state.validate().unwrap_err().contains("never synced"));
    }

    #[test]
    fn tables_sharing_a_warehouse_name_are_rejected() {
        let mut state = MigrationState::default();
        state.entity_mut(&TableIdent::new("sales_eu", "orders")).unwrap();

        let err = state
            .entity_mut(&TableIdent::new("sales", "eu_orders"))
            .unwrap_err();
        assert!(matches!(err, MigrateError::Validation { .. }));
        assert!(err.to_string().contains("SALES_EU_ORDERS"));

        assert_eq!(state.tables.len(), 1);
        let kept = &state.tables["SALES_EU_ORDERS"];
        assert_eq!((kept.namespace.as_str(), kept.table.as_str()), ("sales_eu", "orders"));
        assert!(state.entity_mut(&TableIdent::new("sales_eu", "orders")).is_ok());
    }
}
