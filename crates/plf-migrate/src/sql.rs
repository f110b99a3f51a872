//! Warehouse SQL templates
//!
//! Every statement the pipeline sends is rendered from a template under
//! `sql/`, so a dry run prints exactly what a real run executes.

use plf_common::{ResourceBase, TemplateEngine};
use serde::Serialize;
use serde_json::json;

use crate::state::WarehouseRecord;
use crate::Result;

const CATALOG_INTEGRATION: &str = include_str!("../sql/catalog_integration.sql");
const EXTERNAL_VOLUME: &str = include_str!("../sql/external_volume.sql");
const SETUP_ROLE: &str = include_str!("../sql/setup_role.sql");
const REGISTER_TABLE: &str = include_str!("../sql/register_table.sql");
const REFRESH_TABLE: &str = include_str!("../sql/refresh_table.sql");
const DROP_TABLE: &str = include_str!("../sql/drop_table.sql");
const CLEANUP: &str = include_str!("../sql/cleanup.sql");

/// Names of the warehouse objects one project owns
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WarehouseNames {
    pub sa_role: String,
    pub catalog_integration: String,
    pub external_volume: String,
    pub database: String,
    pub schema: String,
}

impl WarehouseNames {
    /// Role, integration and volume all take the warehouse base name; the
    /// database does too unless overridden.
    pub fn from_base(base: &ResourceBase, database: Option<&str>, schema: &str) -> Self {
        let name = base.warehouse_base();
        Self {
            sa_role: name.clone(),
            catalog_integration: name.clone(),
            external_volume: name.clone(),
            database: database.map(str::to_uppercase).unwrap_or(name),
            schema: schema.to_uppercase(),
        }
    }

    /// `DATABASE.SCHEMA.TABLE`
    pub fn qualified(&self, table: &str) -> String {
        format!("{}.{}.{}", self.database, self.schema, table)
    }
}

impl From<&WarehouseRecord> for WarehouseNames {
    fn from(record: &WarehouseRecord) -> Self {
        Self {
            sa_role: record.sa_role.clone(),
            catalog_integration: record.catalog_integration.clone(),
            external_volume: record.external_volume.clone(),
            database: record.database.clone(),
            schema: record.schema.clone(),
        }
    }
}

/// External volume inputs
#[derive(Clone, Debug)]
pub struct VolumeSpec<'a> {
    pub bucket: &'a str,
    pub role_arn: &'a str,
    pub external_id: &'a str,
}

pub struct SqlTemplates {
    engine: TemplateEngine,
}

impl SqlTemplates {
    pub fn new() -> Result<Self> {
        let engine = TemplateEngine::new()?
            .with_template("catalog_integration.sql", CATALOG_INTEGRATION)?
            .with_template("external_volume.sql", EXTERNAL_VOLUME)?
            .with_template("setup_role.sql", SETUP_ROLE)?
            .with_template("register_table.sql", REGISTER_TABLE)?
            .with_template("refresh_table.sql", REFRESH_TABLE)?
            .with_template("drop_table.sql", DROP_TABLE)?
            .with_template("cleanup.sql", CLEANUP)?;
        Ok(Self { engine })
    }

    pub fn catalog_integration(&self, admin_role: &str, names: &WarehouseNames) -> Result<String> {
        Ok(self.engine.render_named(
            "catalog_integration.sql",
            json!({
                "admin_role": admin_role,
                "catalog_integration": names.catalog_integration,
            }),
        )?)
    }

    pub fn external_volume(
        &self,
        admin_role: &str,
        names: &WarehouseNames,
        volume: &VolumeSpec<'_>,
    ) -> Result<String> {
        Ok(self.engine.render_named(
            "external_volume.sql",
            json!({
                "admin_role": admin_role,
                "volume_name": names.external_volume,
                "storage_location_name": format!("{}_S3", names.external_volume),
                "storage_base_url": format!("s3://{}/", volume.bucket),
                "role_arn": volume.role_arn,
                "external_id": volume.external_id,
            }),
        )?)
    }

    /// Role, database, schema and grants. The role is granted to
    /// `user` when one is configured.
    pub fn setup_role(
        &self,
        admin_role: &str,
        names: &WarehouseNames,
        user: Option<&str>,
    ) -> Result<String> {
        Ok(self.engine.render_named(
            "setup_role.sql",
            json!({
                "admin_role": admin_role,
                "sa_role": names.sa_role,
                "snowflake_user": user.map(str::to_uppercase),
                "database": names.database,
                "schema": names.schema,
                "volume_name": names.external_volume,
                "catalog_integration": names.catalog_integration,
            }),
        )?)
    }

    pub fn register_table(
        &self,
        names: &WarehouseNames,
        table_name: &str,
        metadata_file_path: &str,
    ) -> Result<String> {
        Ok(self.engine.render_named(
            "register_table.sql",
            json!({
                "sa_role": names.sa_role,
                "database": names.database,
                "schema": names.schema,
                "table_name": table_name,
                "external_volume": names.external_volume,
                "catalog_integration": names.catalog_integration,
                "metadata_file_path": metadata_file_path,
            }),
        )?)
    }

    pub fn refresh_table(
        &self,
        names: &WarehouseNames,
        table_name: &str,
        metadata_file_path: &str,
    ) -> Result<String> {
        Ok(self.engine.render_named(
            "refresh_table.sql",
            json!({
                "sa_role": names.sa_role,
                "database": names.database,
                "schema": names.schema,
                "table_name": table_name,
                "metadata_file_path": metadata_file_path,
            }),
        )?)
    }

    pub fn drop_table(&self, names: &WarehouseNames, table_name: &str) -> Result<String> {
        Ok(self.engine.render_named(
            "drop_table.sql",
            json!({
                "sa_role": names.sa_role,
                "database": names.database,
                "schema": names.schema,
                "table_name": table_name,
            }),
        )?)
    }

    pub fn cleanup(&self, admin_role: &str, names: &WarehouseNames) -> Result<String> {
        Ok(self.engine.render_named(
            "cleanup.sql",
            json!({
                "admin_role": admin_role,
                "sa_role": names.sa_role,
                "database": names.database,
                "volume_name": names.external_volume,
                "catalog_integration": names.catalog_integration,
            }),
        )?)
    }
}
