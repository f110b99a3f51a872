//! Local-to-cloud migration pipeline
//!
//! Each operation loads the migration state, checks the recorded naming
//! against the configured one, then works through the tables one at a
//! time, saving after every table. A table that fails is recorded and the
//! batch moves on.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use plf_common::objstore::DEFAULT_REGION;
use plf_common::{ensure_consistent, ObjectStore, ResourceBase, RetryConfig};
use plf_setup::{CatalogService, Principal, TableIdent};
use tracing::{debug, info, warn};

use crate::rewrite::{latest_metadata, rewrite_table};
use crate::sql::{SqlTemplates, VolumeSpec, WarehouseNames};
use crate::state::{
    entity_key, name_collision, CloudRecord, MigrationEntity, MigrationState, RegisterStatus,
    SyncStatus, WarehouseRecord,
};
use crate::store::MigrationStore;
use crate::transfer::{self, source_digest, TransferEngine, TransferPlan, TransferSummary};
use crate::warehouse::Warehouse;
use crate::{MigrateError, Result};

const SETUP_CLOUD: &str = "plf l2c setup-cloud";

/// Settings resolved from flags and the project `.env`
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Local catalog; also the local bucket name
    pub catalog: String,
    /// Naming inputs currently in effect
    pub base: ResourceBase,
    pub region: String,
    pub profile: Option<String>,
    /// IAM role the warehouse assumes to read the bucket
    pub role_arn: Option<String>,
    /// External id on the role trust policy; defaults to the bucket name
    pub external_id: Option<String>,
    pub admin_role: String,
    pub database: Option<String>,
    pub schema: String,
    pub warehouse_user: Option<String>,
    pub retry: RetryConfig,
    pub concurrency: usize,
}

impl PipelineConfig {
    pub fn new(catalog: impl Into<String>, base: ResourceBase) -> Self {
        Self {
            catalog: catalog.into(),
            base,
            region: DEFAULT_REGION.to_string(),
            profile: None,
            role_arn: None,
            external_id: None,
            admin_role: "ACCOUNTADMIN".to_string(),
            database: None,
            schema: "L2C".to_string(),
            warehouse_user: None,
            retry: TransferEngine::default_retry(),
            concurrency: 4,
        }
    }

    /// Destination bucket for the configured naming
    pub fn bucket(&self) -> String {
        self.base.aws_base()
    }

    pub fn warehouse_names(&self) -> WarehouseNames {
        WarehouseNames::from_base(&self.base, self.database.as_deref(), &self.schema)
    }
}

/// One table found in the local catalog
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InventoryEntry {
    pub ident: TableIdent,
    pub metadata_location: Option<String>,
    /// Why the table's metadata could not be loaded
    pub error: Option<String>,
}

/// What `setup-cloud` would create
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloudPlan {
    pub bucket: String,
    pub region: String,
    pub base: ResourceBase,
    pub names: WarehouseNames,
    /// Rendered statements, in execution order
    pub statements: Vec<String>,
    /// Cloud resources are already recorded with this naming
    pub recorded: bool,
}

/// Per-table result of a batch operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityOutcome {
    pub key: String,
    pub detail: String,
    pub error: Option<String>,
}

impl EntityOutcome {
    fn ok(key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            detail: detail.into(),
            error: None,
        }
    }

    fn failed(key: impl Into<String>, error: impl ToString) -> Self {
        Self {
            key: key.into(),
            detail: String::new(),
            error: Some(error.to_string()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcomes of a batch operation, in table key order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub outcomes: Vec<EntityOutcome>,
}

impl BatchReport {
    pub fn failed(&self) -> Vec<&EntityOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded()).collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(EntityOutcome::succeeded)
    }
}

/// Sync flags
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Re-sync synced tables and copy every object
    pub force: bool,
    /// Leave metadata locations pointing at the local bucket
    pub skip_rewrite: bool,
}

/// A planned register or refresh
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataPlan {
    pub key: String,
    pub sf_table: String,
    /// Pointer currently recorded, if any
    pub current: Option<String>,
    /// Latest metadata file, relative to the bucket. `None` when the table
    /// has no metadata at the destination yet.
    pub latest: Option<String>,
}

/// Drives the migration of every local table to the cloud warehouse
pub struct Pipeline<M: MigrationStore> {
    store: M,
    catalog: Arc<dyn CatalogService>,
    principal: Principal,
    source: Arc<dyn ObjectStore>,
    dest: Arc<dyn ObjectStore>,
    warehouse: Arc<dyn Warehouse>,
    sql: SqlTemplates,
    config: PipelineConfig,
}

impl<M: MigrationStore> Pipeline<M> {
    pub fn new(
        store: M,
        catalog: Arc<dyn CatalogService>,
        principal: Principal,
        source: Arc<dyn ObjectStore>,
        dest: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
        config: PipelineConfig,
    ) -> Result<Self> {
        Ok(Self {
            store,
            catalog,
            principal,
            source,
            dest,
            warehouse,
            sql: SqlTemplates::new()?,
            config,
        })
    }

    pub fn store(&self) -> &M {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Current migration state
    pub fn status(&self) -> Result<MigrationState> {
        self.store.load()
    }

    // =========================================================================
    // Inventory
    // =========================================================================

    /// Every table in the local catalog with its current metadata location
    pub async fn inventory(&self) -> Result<Vec<InventoryEntry>> {
        let catalog = &self.config.catalog;
        let mut entries = Vec::new();
        for namespace in self.catalog.list_namespaces(&self.principal, catalog).await? {
            let mut tables = self
                .catalog
                .list_tables(&self.principal, catalog, &namespace)
                .await?;
            tables.sort();
            for ident in tables {
                let entry = match self.catalog.load_table(&self.principal, catalog, &ident).await {
                    Ok(info) => InventoryEntry {
                        ident,
                        metadata_location: info.metadata_location,
                        error: None,
                    },
                    Err(e) => {
                        warn!(table = %ident, error = %e, "failed to load table metadata");
                        InventoryEntry {
                            ident,
                            metadata_location: None,
                            error: Some(e.to_string()),
                        }
                    }
                };
                entries.push(entry);
            }
        }

        let mut seen: HashMap<String, &TableIdent> = HashMap::new();
        for entry in &entries {
            let key = entity_key(&entry.ident.namespace, &entry.ident.name);
            if let Some(first) = seen.insert(key, &entry.ident) {
                return Err(name_collision(first, &entry.ident));
            }
        }
        Ok(entries)
    }

    /// Add newly discovered tables to the state as pending.
    async fn discover(&self, state: &mut MigrationState) -> Result<()> {
        let before = state.tables.len();
        for entry in self.inventory().await? {
            state.entity_mut(&entry.ident)?;
        }
        let added = state.tables.len() - before;
        if added > 0 {
            info!(added, "discovered new tables");
            self.store.save(state)?;
        }
        Ok(())
    }

    // =========================================================================
    // Drift
    // =========================================================================

    /// Recorded cloud storage, refusing when the configured naming drifted.
    fn recorded_cloud(&self, state: &MigrationState) -> Result<CloudRecord> {
        let aws = state
            .aws
            .clone()
            .ok_or_else(|| MigrateError::not_set_up("cloud storage", SETUP_CLOUD))?;
        ensure_consistent(&self.config.base, &aws.base)?;
        Ok(aws)
    }

    fn recorded_warehouse(state: &MigrationState) -> Result<WarehouseNames> {
        state
            .warehouse
            .as_ref()
            .map(WarehouseNames::from)
            .ok_or_else(|| MigrateError::not_set_up("warehouse objects", SETUP_CLOUD))
    }

    // =========================================================================
    // Cloud setup
    // =========================================================================

    pub fn plan_setup_cloud(&self) -> Result<CloudPlan> {
        let state = self.store.load()?;
        if let Some(aws) = &state.aws {
            ensure_consistent(&self.config.base, &aws.base)?;
        }

        let bucket = self.config.bucket();
        let names = self.config.warehouse_names();
        let role_arn = self.config.role_arn.as_deref().ok_or_else(|| {
            MigrateError::validation("an IAM role ARN is required (set L2C_STORAGE_ROLE_ARN)")
        })?;
        let external_id = self.config.external_id.clone().unwrap_or_else(|| bucket.clone());
        let admin = &self.config.admin_role;

        let statements = vec![
            self.sql.catalog_integration(admin, &names)?,
            self.sql.external_volume(
                admin,
                &names,
                &VolumeSpec {
                    bucket: &bucket,
                    role_arn,
                    external_id: &external_id,
                },
            )?,
            self.sql
                .setup_role(admin, &names, self.config.warehouse_user.as_deref())?,
        ];

        Ok(CloudPlan {
            recorded: state.aws.is_some() && state.warehouse.is_some(),
            bucket,
            region: self.config.region.clone(),
            base: self.config.base.clone(),
            names,
            statements,
        })
    }

    /// Create the bucket and warehouse objects and record them.
    ///
    /// Every statement is idempotent, so a partially failed run is fixed by
    /// running it again.
    pub async fn setup_cloud(&self) -> Result<MigrationState> {
        let plan = self.plan_setup_cloud()?;
        let mut state = self.store.load()?;

        self.dest.create_bucket(&plan.bucket).await?;
        info!(bucket = %plan.bucket, region = %plan.region, "destination bucket ready");
        state.aws = Some(CloudRecord {
            bucket: plan.bucket.clone(),
            region: plan.region.clone(),
            profile: self.config.profile.clone(),
            role_arn: self.config.role_arn.clone(),
            base: plan.base.clone(),
            updated_at: Utc::now(),
        });
        self.store.save(&state)?;

        for sql in &plan.statements {
            self.warehouse.execute(sql).await?;
        }
        info!(role = %plan.names.sa_role, database = %plan.names.database, "warehouse objects ready");
        state.warehouse = Some(WarehouseRecord {
            catalog_integration: plan.names.catalog_integration.clone(),
            external_volume: plan.names.external_volume.clone(),
            sa_role: plan.names.sa_role.clone(),
            database: plan.names.database.clone(),
            schema: plan.names.schema.clone(),
            updated_at: Utc::now(),
        });
        self.store.save(&state)?;
        Ok(state)
    }

    // =========================================================================
    // Sync
    // =========================================================================

    fn engine(&self, dest_bucket: &str) -> TransferEngine {
        TransferEngine::new(
            self.source.clone(),
            self.config.catalog.clone(),
            self.dest.clone(),
            dest_bucket,
        )
        .with_retry(self.config.retry.clone())
        .with_concurrency(self.config.concurrency)
    }

    fn sync_candidates(state: &MigrationState, force: bool) -> Vec<MigrationEntity> {
        state
            .tables
            .values()
            .filter(|e| force || e.sync.status.is_actionable())
            .cloned()
            .collect()
    }

    /// Objects each table would transfer. Reads listings only.
    pub async fn plan_sync(&self, force: bool) -> Result<Vec<(String, TransferPlan)>> {
        let mut state = self.store.load()?;
        let aws = self.recorded_cloud(&state)?;
        for entry in self.inventory().await? {
            state.entity_mut(&entry.ident)?;
        }

        let engine = self.engine(&aws.bucket);
        let mut plans = Vec::new();
        for entity in Self::sync_candidates(&state, force) {
            let source = engine.list_source(&entity.prefix()).await?;
            let dest = engine.list_dest(&entity.prefix()).await?;
            plans.push((entity.key(), transfer::plan(&source, &dest, force)));
        }
        Ok(plans)
    }

    /// Copy every actionable table to the destination bucket.
    pub async fn sync(&self, options: SyncOptions) -> Result<BatchReport> {
        let mut state = self.store.load()?;
        let aws = self.recorded_cloud(&state)?;
        self.discover(&mut state).await?;

        let engine = self.engine(&aws.bucket);
        let mut report = BatchReport::default();
        for entity in Self::sync_candidates(&state, options.force) {
            let key = entity.key();
            state = self.store.update_entity(&key, &mut |e| {
                e.sync.status = SyncStatus::InProgress;
                e.sync.error = None;
            })?;

            let outcome = self.sync_entity(&engine, &entity, options).await;
            state = self.store.update_entity(&key, &mut |e| match &outcome {
                Ok(synced) => {
                    e.sync.status = SyncStatus::Synced;
                    e.sync.last_sync = Some(Utc::now());
                    e.sync.object_count = synced.object_count;
                    e.sync.total_bytes = synced.total_bytes;
                    e.sync.source_digest = Some(synced.digest.clone());
                    e.sync.rewrite_count = synced.rewrite_count;
                    e.sync.rewrite_error = synced.rewrite_error.clone();
                }
                Err(err) => {
                    e.sync.status = SyncStatus::Failed;
                    e.sync.error = Some(err.clone());
                }
            })?;

            report.outcomes.push(match outcome {
                Ok(synced) => {
                    info!(entity = %key, transferred = synced.transfer.transferred, "synced");
                    EntityOutcome::ok(
                        &key,
                        format!(
                            "{} copied, {} unchanged, {} bytes",
                            synced.transfer.transferred, synced.skipped, synced.transfer.bytes
                        ),
                    )
                }
                Err(err) => {
                    warn!(entity = %key, error = %err, "sync failed");
                    EntityOutcome::failed(&key, err)
                }
            });
        }
        debug!(tables = state.tables.len(), "sync pass finished");
        Ok(report)
    }

    async fn sync_entity(
        &self,
        engine: &TransferEngine,
        entity: &MigrationEntity,
        options: SyncOptions,
    ) -> std::result::Result<EntitySync, String> {
        let prefix = entity.prefix();
        let source = engine.list_source(&prefix).await.map_err(|e| e.to_string())?;
        let dest = engine.list_dest(&prefix).await.map_err(|e| e.to_string())?;
        let plan = transfer::plan(&source, &dest, options.force);

        let outcomes = engine.execute(&plan).await;
        let summary = TransferSummary::from_outcomes(&outcomes);
        if let Some(error) = summary.error {
            return Err(error);
        }

        let mut synced = EntitySync {
            object_count: source.len() as u64,
            total_bytes: source.iter().map(|e| e.size).sum(),
            digest: source_digest(&source),
            skipped: plan.skipped,
            transfer: summary,
            rewrite_count: None,
            rewrite_error: None,
        };

        if !options.skip_rewrite && !source.is_empty() {
            let from = format!("s3://{}/", engine.source_bucket());
            let to = format!("s3://{}/", engine.dest_bucket());
            match rewrite_table(
                self.dest.as_ref(),
                engine.dest_bucket(),
                &entity.namespace,
                &entity.table,
                &from,
                &to,
            )
            .await
            {
                Ok(rewrite) => synced.rewrite_count = Some(rewrite.rewritten),
                Err(e) => {
                    warn!(entity = %entity.key(), error = %e, "metadata rewrite failed");
                    synced.rewrite_error = Some(e.to_string());
                }
            }
        }
        Ok(synced)
    }

    // =========================================================================
    // Register / refresh
    // =========================================================================

    async fn metadata_plans<F>(&self, state: &MigrationState, bucket: &str, select: F) -> Result<Vec<MetadataPlan>>
    where
        F: Fn(&MigrationEntity) -> bool,
    {
        let names = Self::recorded_warehouse(state)?;
        let mut plans = Vec::new();
        for entity in state.tables.values().filter(|e| select(e)) {
            let latest =
                latest_metadata(self.dest.as_ref(), bucket, &entity.namespace, &entity.table).await?;
            plans.push(MetadataPlan {
                key: entity.key(),
                sf_table: names.qualified(&entity.key()),
                current: entity.register.metadata_path.clone(),
                latest,
            });
        }
        Ok(plans)
    }

    /// Synced tables not yet registered in the warehouse
    pub async fn plan_register(&self) -> Result<Vec<MetadataPlan>> {
        let state = self.store.load()?;
        let aws = self.recorded_cloud(&state)?;
        self.metadata_plans(&state, &aws.bucket, |e| {
            e.sync.status == SyncStatus::Synced && e.register.status != RegisterStatus::Done
        })
        .await
    }

    /// Create a warehouse table over each planned table's latest metadata.
    pub async fn register(&self) -> Result<BatchReport> {
        let state = self.store.load()?;
        let names = Self::recorded_warehouse(&state)?;
        let mut report = BatchReport::default();

        for plan in self.plan_register().await? {
            let Some(latest) = plan.latest.clone() else {
                let message = "no metadata file found at the destination";
                self.store.update_entity(&plan.key, &mut |e| {
                    e.register.error = Some(message.to_string());
                })?;
                report.outcomes.push(EntityOutcome::failed(&plan.key, message));
                continue;
            };

            let sql = self.sql.register_table(&names, &plan.key, &latest)?;
            let result = self.warehouse.execute(&sql).await;
            self.store.update_entity(&plan.key, &mut |e| match &result {
                Ok(_) => {
                    e.register.status = RegisterStatus::Done;
                    e.register.registered_at = Some(Utc::now());
                    e.register.sf_table = Some(plan.sf_table.clone());
                    e.register.metadata_path = Some(latest.clone());
                    e.register.error = None;
                }
                Err(err) => e.register.error = Some(err.to_string()),
            })?;

            report.outcomes.push(match result {
                Ok(_) => {
                    info!(entity = %plan.key, table = %plan.sf_table, "registered");
                    EntityOutcome::ok(&plan.key, &plan.sf_table)
                }
                Err(err) => {
                    warn!(entity = %plan.key, error = %err, "register failed");
                    EntityOutcome::failed(&plan.key, err)
                }
            });
        }
        Ok(report)
    }

    /// Registered tables whose latest metadata differs from the recorded pointer
    pub async fn plan_refresh(&self) -> Result<Vec<MetadataPlan>> {
        let state = self.store.load()?;
        let aws = self.recorded_cloud(&state)?;
        let plans = self
            .metadata_plans(&state, &aws.bucket, |e| e.register.status == RegisterStatus::Done)
            .await?;
        Ok(plans
            .into_iter()
            .filter(|p| p.latest.is_some() && p.latest != p.current)
            .collect())
    }

    /// Point each stale warehouse table at its latest metadata file.
    pub async fn refresh(&self) -> Result<BatchReport> {
        let state = self.store.load()?;
        let names = Self::recorded_warehouse(&state)?;
        let mut report = BatchReport::default();

        for plan in self.plan_refresh().await? {
            let Some(latest) = plan.latest.clone() else {
                continue;
            };
            let sql = self.sql.refresh_table(&names, &plan.key, &latest)?;
            let result = self.warehouse.execute(&sql).await;
            self.store.update_entity(&plan.key, &mut |e| match &result {
                Ok(_) => {
                    e.register.metadata_path = Some(latest.clone());
                    e.register.refreshed_at = Some(Utc::now());
                    e.register.refresh_error = None;
                }
                Err(err) => e.register.refresh_error = Some(err.to_string()),
            })?;

            report.outcomes.push(match result {
                Ok(_) => EntityOutcome::ok(&plan.key, latest),
                Err(err) => {
                    warn!(entity = %plan.key, error = %err, "refresh failed");
                    EntityOutcome::failed(&plan.key, err)
                }
            });
        }
        Ok(report)
    }

    // =========================================================================
    // Clear / cleanup
    // =========================================================================

    /// Tables that clear would reset
    pub fn plan_clear(&self) -> Result<Vec<String>> {
        let state = self.store.load()?;
        self.recorded_cloud(&state)?;
        Ok(state.tables.keys().cloned().collect())
    }

    /// Delete each table's destination objects and warehouse table, then
    /// reset it to pending.
    pub async fn clear(&self) -> Result<BatchReport> {
        let state = self.store.load()?;
        let aws = self.recorded_cloud(&state)?;
        let names = state.warehouse.as_ref().map(WarehouseNames::from);

        let mut report = BatchReport::default();
        for entity in state.tables.values() {
            let key = entity.key();
            match self.clear_entity(&aws.bucket, names.as_ref(), entity).await {
                Ok(deleted) => {
                    self.store.update_entity(&key, &mut |e| e.reset())?;
                    info!(entity = %key, deleted, "cleared");
                    report
                        .outcomes
                        .push(EntityOutcome::ok(&key, format!("{deleted} objects deleted")));
                }
                Err(err) => {
                    warn!(entity = %key, error = %err, "clear failed");
                    report.outcomes.push(EntityOutcome::failed(&key, err));
                }
            }
        }
        Ok(report)
    }

    async fn clear_entity(
        &self,
        bucket: &str,
        names: Option<&WarehouseNames>,
        entity: &MigrationEntity,
    ) -> Result<usize> {
        if let Some(names) = names {
            let sql = self.sql.drop_table(names, &entity.key())?;
            self.warehouse.execute(&sql).await?;
        }
        self.delete_prefix(bucket, &entity.prefix()).await
    }

    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<usize> {
        let objects = match self.dest.list(bucket, prefix).await {
            Ok(objects) => objects,
            Err(plf_common::StoreError::NoSuchBucket { .. }) => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        for object in &objects {
            self.dest.delete(bucket, &object.key).await?;
        }
        Ok(objects.len())
    }

    /// What cleanup removes: the bucket and the warehouse statements
    pub fn plan_cleanup(&self) -> Result<(String, Vec<String>)> {
        let state = self.store.load()?;
        let aws = self.recorded_cloud(&state)?;
        let statements = match &state.warehouse {
            Some(record) => vec![self
                .sql
                .cleanup(&self.config.admin_role, &WarehouseNames::from(record))?],
            None => Vec::new(),
        };
        Ok((aws.bucket, statements))
    }

    /// Clear every table, drop the warehouse objects and delete the bucket.
    /// Table records stay, reset to pending.
    pub async fn cleanup(&self) -> Result<MigrationState> {
        let (bucket, statements) = self.plan_cleanup()?;

        let report = self.clear().await?;
        if let Some(failed) = report.failed().first() {
            return Err(MigrateError::validation(format!(
                "cleanup stopped, clearing {} failed: {}",
                failed.key,
                failed.error.as_deref().unwrap_or_default()
            )));
        }

        for sql in &statements {
            self.warehouse.execute(sql).await?;
        }
        let mut state = self.store.load()?;
        state.warehouse = None;
        self.store.save(&state)?;

        self.delete_prefix(&bucket, "").await?;
        self.dest.delete_bucket(&bucket).await?;
        info!(bucket = %bucket, "destination bucket deleted");

        state.aws = None;
        self.store.save(&state)?;
        Ok(state)
    }

    // =========================================================================
    // Migrate
    // =========================================================================

    /// setup-cloud (when not yet recorded), then sync, then register.
    pub async fn migrate(&self, options: SyncOptions) -> Result<(BatchReport, BatchReport)> {
        let state = self.store.load()?;
        match (&state.aws, &state.warehouse) {
            (Some(aws), Some(_)) => {
                ensure_consistent(&self.config.base, &aws.base)?;
                info!(bucket = %aws.bucket, "cloud resources already recorded");
            }
            _ => {
                self.setup_cloud().await?;
            }
        }
        let synced = self.sync(options).await?;
        let registered = self.register().await?;
        Ok((synced, registered))
    }
}

struct EntitySync {
    object_count: u64,
    total_bytes: u64,
    digest: String,
    skipped: usize,
    transfer: TransferSummary,
    rewrite_count: Option<usize>,
    rewrite_error: Option<String>,
}
