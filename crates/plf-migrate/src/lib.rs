//! Local-to-cloud table migration
//!
//! Tables found in the local catalog are tracked as [`MigrationEntity`]
//! records. `sync` copies their objects to a cloud bucket and rewrites
//! metadata locations, `register` creates warehouse tables over the copied
//! metadata, and `refresh` moves registered tables to newer metadata.

pub mod error;
pub mod pipeline;
pub mod rewrite;
pub mod sql;
pub mod state;
pub mod store;
pub mod transfer;
pub mod warehouse;

pub use error::{MigrateError, Result};
pub use pipeline::{
    BatchReport, CloudPlan, EntityOutcome, InventoryEntry, MetadataPlan, Pipeline, PipelineConfig,
    SyncOptions,
};
pub use rewrite::{rewrite_table, RewriteSummary};
pub use sql::{SqlTemplates, WarehouseNames};
pub use state::{
    entity_key, CloudRecord, MigrationEntity, MigrationState, RegisterStatus, SyncStatus,
    WarehouseRecord,
};
pub use store::{FileMigrationStore, MemoryMigrationStore, MigrationStore};
pub use transfer::{TransferEngine, TransferPlan, TransferSummary};
pub use warehouse::{MemoryWarehouse, SnowCli, SnowConnection, Warehouse, WarehouseError};
