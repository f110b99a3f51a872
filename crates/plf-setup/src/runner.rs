//! The local stack: the external calls behind each setup step

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use plf_common::{retry_with_backoff_if, ObjectStore, RetryConfig, StoreError};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::catalog::{CatalogService, CatalogSpec, Principal, PrincipalFile, TableIdent};
use crate::manifests::{write_features, ManifestVars};
use crate::provisioner::{ClusterProvisioner, ClusterSpec, ProvisionError, ReadinessProbe};
use crate::reconciler::StepExecutor;
use crate::steps::SetupStep;
use crate::{Result, SetupError};

/// Everything the stack needs to know about the environment
#[derive(Clone, Debug)]
pub struct StackConfig {
    pub cluster_name: String,
    pub k3s_version: String,
    pub work_dir: PathBuf,
    /// host:container pairs published through the cluster load balancer
    pub ports: Vec<(u16, u16)>,
    pub manifest_vars: ManifestVars,
    pub catalog: CatalogSpec,
    pub demo_table: TableIdent,
    pub cluster_timeout: Duration,
    pub service_timeout: Duration,
}

impl StackConfig {
    /// Manifests the cluster applies on boot
    pub fn features_dir(&self) -> PathBuf {
        self.work_dir.join("k8s").join("features")
    }
}

/// Demo table schema: the penguins dataset
pub fn demo_schema() -> Value {
    json!({
        "type": "struct",
        "schema-id": 0,
        "fields": [
            {"id": 1, "name": "species", "required": false, "type": "string"},
            {"id": 2, "name": "island", "required": false, "type": "string"},
            {"id": 3, "name": "bill_length_mm", "required": false, "type": "double"},
            {"id": 4, "name": "bill_depth_mm", "required": false, "type": "double"},
            {"id": 5, "name": "flipper_length_mm", "required": false, "type": "double"},
            {"id": 6, "name": "body_mass_g", "required": false, "type": "double"},
            {"id": 7, "name": "sex", "required": false, "type": "string"}
        ]
    })
}

/// [`StepExecutor`] over the real collaborators
pub struct LocalStack {
    config: StackConfig,
    provisioner: Arc<dyn ClusterProvisioner>,
    catalog: Arc<dyn CatalogService>,
    objects: Arc<dyn ObjectStore>,
    principals: PrincipalFile,
}

impl LocalStack {
    pub fn new(
        config: StackConfig,
        provisioner: Arc<dyn ClusterProvisioner>,
        catalog: Arc<dyn CatalogService>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        let principals = PrincipalFile::in_work_dir(&config.work_dir);
        Self {
            config,
            provisioner,
            catalog,
            objects,
            principals,
        }
    }

    async fn wait(&self, probe: ReadinessProbe, timeout: Duration) -> Result<()> {
        info!("Waiting for {}...", probe);
        self.provisioner
            .wait_ready(&self.config.cluster_name, probe, timeout)
            .await?;
        Ok(())
    }

    fn principal(&self) -> Result<Principal> {
        self.principals.load()?.ok_or_else(|| {
            SetupError::validation(format!(
                "principal file {} is missing; mark Polaris PENDING in the manifest and resume",
                self.principals.path().display()
            ))
        })
    }

    async fn create_cluster(&self) -> Result<()> {
        let features = self.config.features_dir();
        write_features(&features, &self.config.manifest_vars)?;

        let spec = ClusterSpec {
            name: self.config.cluster_name.clone(),
            k3s_version: self.config.k3s_version.clone(),
            ports: self.config.ports.clone(),
            manifests_dir: Some(features),
        };
        match self.provisioner.create(&spec).await {
            Ok(handle) => info!(cluster = %handle.name, "Cluster created"),
            Err(ProvisionError::AlreadyExists { name }) => {
                info!(cluster = %name, "Cluster already exists, reusing")
            }
            Err(e) => return Err(e.into()),
        }
        self.wait(ReadinessProbe::ApiServer, self.config.cluster_timeout)
            .await
    }

    async fn wait_for_storage(&self) -> Result<()> {
        self.wait(ReadinessProbe::ObjectStore, self.config.service_timeout)
            .await?;
        self.wait(ReadinessProbe::Database, self.config.service_timeout)
            .await
    }

    async fn deploy_catalog_service(&self) -> Result<()> {
        self.catalog.deploy().await?;
        let principal = self.catalog.bootstrap().await?;
        self.principals.save(&principal)?;
        info!(path = %self.principals.path().display(), "Principal credentials saved");
        self.wait(ReadinessProbe::CatalogService, self.config.service_timeout)
            .await
    }

    async fn configure_catalog(&self) -> Result<()> {
        let principal = self.principal()?;
        let spec = &self.config.catalog;

        // The load balancer can lag the deployment becoming available
        let objects = self.objects.clone();
        retry_with_backoff_if(
            &RetryConfig::bounded(5, Duration::from_secs(1)),
            "create catalog bucket",
            || {
                let objects = objects.clone();
                let bucket = spec.bucket.clone();
                async move { objects.create_bucket(&bucket).await }
            },
            StoreError::is_retryable,
        )
        .await?;

        self.catalog.create_catalog(&principal, spec).await?;
        match self
            .catalog
            .create_namespace(&principal, &spec.name, &self.config.demo_table.namespace)
            .await
        {
            Ok(()) => info!(namespace = %self.config.demo_table.namespace, "Namespace created"),
            Err(e) if e.is_already_exists() => debug!("namespace exists"),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn load_demo_data(&self) -> Result<()> {
        let principal = self.principal()?;
        let catalog = &self.config.catalog.name;
        let table = &self.config.demo_table;

        match self
            .catalog
            .create_table(&principal, catalog, table, &demo_schema())
            .await
        {
            Ok(()) => info!(table = %table, "Demo table created"),
            Err(e) if e.is_already_exists() => debug!(table = %table, "demo table exists"),
            Err(e) => return Err(e.into()),
        }

        let tables = self
            .catalog
            .list_tables(&principal, catalog, &table.namespace)
            .await?;
        if !tables.contains(table) {
            return Err(SetupError::validation(format!(
                "table {} not listed in namespace {} after creation",
                table, table.namespace
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StepExecutor for LocalStack {
    async fn execute(&self, step: SetupStep) -> Result<()> {
        match step {
            SetupStep::CreateCluster => self.create_cluster().await,
            SetupStep::WaitForStorage => self.wait_for_storage().await,
            SetupStep::DeployCatalogService => self.deploy_catalog_service().await,
            SetupStep::ConfigureCatalog => self.configure_catalog().await,
            SetupStep::LoadDemoData => self.load_demo_data().await,
        }
    }
}
