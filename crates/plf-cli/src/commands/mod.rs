//! CLI commands
//!
//! Every subcommand resolves to an [`Operation`] which runs against a
//! [`Context`] built from the work directory. The context wires the real
//! collaborators (k3d, Polaris, S3, the `snow` CLI) into the reconciler and
//! the migration pipeline.

use std::fmt::Display;
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use plf_common::objstore::{resolve_region, CloudStoreConfig, LocalStoreConfig, S3Store};
use plf_common::verify_cloud_credentials;
use plf_migrate::{
    FileMigrationStore, Pipeline, PipelineConfig, SnowCli, SnowConnection, SyncOptions,
};
use plf_setup::k3d::K3dProvisioner;
use plf_setup::polaris::{PolarisConfig, PolarisService};
use plf_setup::runtime::ContainerRuntime;
use plf_setup::{
    FileRunStore, LocalStack, PrincipalFile, Reconciler, RunConfig, RunStore, SetupError,
    StackConfig,
};
use tracing::{debug, info};

use self::host::OutputFormat;
use crate::config::{ProjectEnv, Settings};
use crate::{Error, Result};

pub mod format;
pub mod host;
pub mod l2c;
pub mod setup;

/// Extension trait to convert errors with Display to CLI Error::CommandFailed.
pub trait CommandErrorExt<T> {
    /// Convert an error to `Error::CommandFailed` using its Display implementation.
    fn cmd_err(self) -> Result<T>;
}

impl<T, E: Display> CommandErrorExt<T> for std::result::Result<T, E> {
    fn cmd_err(self) -> Result<T> {
        self.map_err(|e| Error::command_failed(e.to_string()))
    }
}

// =============================================================================
// Context
// =============================================================================

/// Flags that adjust cloud naming and credentials for `l2c` commands
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloudOverrides {
    pub prefix: Option<String>,
    pub no_prefix: bool,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub profile: Option<String>,
    pub region: Option<String>,
    pub role_arn: Option<String>,
    pub admin_role: Option<String>,
}

/// Everything an operation needs besides its own arguments
#[derive(Clone, Debug)]
pub struct Context {
    pub settings: Settings,
    /// Skip the confirmation prompt
    pub yes: bool,
    /// Print the plan and stop
    pub dry_run: bool,
    pub cloud: CloudOverrides,
}

impl Context {
    pub fn load(work_dir: &Path) -> Result<Self> {
        let env = ProjectEnv::load(work_dir)?;
        let settings = Settings::resolve(work_dir, &env)?;
        debug!(work_dir = %settings.work_dir.display(), project = %settings.project, "resolved settings");
        Ok(Self {
            settings,
            yes: false,
            dry_run: false,
            cloud: CloudOverrides::default(),
        })
    }

    pub fn run_store(&self) -> FileRunStore {
        FileRunStore::in_work_dir(&self.settings.work_dir)
    }

    pub fn migration_store(&self) -> FileMigrationStore {
        FileMigrationStore::in_work_dir(&self.settings.work_dir)
    }

    /// Runtime preference: flag, then the one recorded in the run, then `.env`.
    async fn runtime(&self, flag: Option<&str>) -> Result<ContainerRuntime> {
        let recorded = self.run_store().load()?.config.container_runtime;
        let preferred = flag
            .map(str::to_string)
            .or(recorded)
            .or_else(|| self.settings.container_runtime.clone());
        Ok(ContainerRuntime::detect(preferred.as_deref()).await?)
    }

    fn polaris(&self) -> Result<PolarisService> {
        let s = &self.settings;
        let service = PolarisService::new(PolarisConfig {
            url: s.polaris_url.clone(),
            realm: s.realm.clone(),
            kubeconfig: s.kubeconfig(),
            job_timeout: s.service_timeout(),
            manifest_vars: s.manifest_vars(),
        })
        .map_err(SetupError::from)?;
        Ok(service)
    }

    fn local_store(&self) -> S3Store {
        S3Store::local(&LocalStoreConfig {
            endpoint: self.settings.s3_endpoint.clone(),
            access_key_id: self.settings.access_key.clone(),
            secret_access_key: self.settings.secret_key.clone(),
        })
    }

    pub fn run_config(&self, runtime: ContainerRuntime) -> RunConfig {
        RunConfig {
            container_runtime: Some(runtime.as_str().to_string()),
            cluster_name: self.settings.cluster_name.clone(),
            project_name: self.settings.project.clone(),
        }
    }

    fn provisioner(&self, runtime_env: Vec<(String, String)>) -> K3dProvisioner {
        K3dProvisioner::new(self.settings.kubeconfig(), runtime_env)
    }

    /// k3d reached through the detected runtime
    async fn cluster_provisioner(&self, runtime_flag: Option<&str>) -> Result<K3dProvisioner> {
        let runtime = self.runtime(runtime_flag).await?;
        Ok(self.provisioner(runtime.k3d_env().await?))
    }

    /// Reconciler over k3d, Polaris and the in-cluster object store
    pub async fn reconciler(
        &self,
        runtime_flag: Option<&str>,
    ) -> Result<(Reconciler<FileRunStore>, ContainerRuntime)> {
        let s = &self.settings;
        let runtime = self.runtime(runtime_flag).await?;
        let provisioner = Arc::new(self.provisioner(runtime.k3d_env().await?));
        let stack = LocalStack::new(
            StackConfig {
                cluster_name: s.cluster_name.clone(),
                k3s_version: s.k3s_version.clone(),
                work_dir: s.work_dir.clone(),
                ports: s.ports(),
                manifest_vars: s.manifest_vars(),
                catalog: s.catalog_spec(),
                demo_table: s.demo_table(),
                cluster_timeout: s.cluster_timeout(),
                service_timeout: s.service_timeout(),
            },
            provisioner.clone(),
            Arc::new(self.polaris()?),
            Arc::new(self.local_store()),
        );
        Ok((
            Reconciler::new(self.run_store(), Arc::new(stack), provisioner),
            runtime,
        ))
    }

    /// Pipeline settings from `.env` with flag overrides applied.
    ///
    /// Without a prefix flag or `SNOWFLAKE_USER`, the warehouse user is
    /// discovered from the `snow` connection and saved to `.env`.
    pub async fn pipeline_config(&self) -> Result<PipelineConfig> {
        let s = &self.settings;
        let o = &self.cloud;
        let profile = o.profile.clone().or_else(|| s.aws_profile.clone());
        let region = resolve_region(
            o.region.as_deref().or(s.aws_region.as_deref()),
            profile.as_deref(),
        )
        .await;

        let discovered = if s.snowflake_user.is_none() && o.prefix.is_none() && !o.no_prefix {
            Some(self.discover_warehouse_user().await?)
        } else {
            None
        };
        let base = match &discovered {
            Some(user) => s.resource_base(Some(user.as_str()), false),
            None => s.resource_base(o.prefix.as_deref(), o.no_prefix),
        };

        let mut config = PipelineConfig::new(&s.catalog_name, base);
        config.region = region;
        config.profile = profile;
        config.role_arn = o.role_arn.clone().or_else(|| s.role_arn.clone());
        config.database = o.database.clone();
        config.schema = o.schema.clone().unwrap_or_else(|| s.schema.clone());
        config.warehouse_user = s.snowflake_user.clone().or(discovered);
        if let Some(admin) = &o.admin_role {
            config.admin_role = admin.clone();
        }
        Ok(config)
    }

    async fn discover_warehouse_user(&self) -> Result<String> {
        info!("SNOWFLAKE_USER is not set; discovering it from the snow connection");
        let connection = SnowCli::new(self.settings.snowflake_connection.clone())
            .discover()
            .await
            .map_err(|e| {
                Error::validation(format!(
                    "SNOWFLAKE_USER is not set and connection discovery failed ({}); \
                     set it in .env or pass --prefix or --no-prefix",
                    e
                ))
            })?;
        let (user, updates) = connection_env(&connection)?;
        ProjectEnv::persist(&self.settings.work_dir, &updates)?;
        info!(connection = %connection.name, user = %user, "saved snow connection to .env");
        Ok(user)
    }

    /// Check the cloud profile before anything touches the bucket.
    pub async fn verify_cloud(&self, config: &PipelineConfig) -> Result<String> {
        let account = verify_cloud_credentials(&CloudStoreConfig {
            profile: config.profile.clone(),
            region: config.region.clone(),
        })
        .await?;
        Ok(account)
    }

    /// Migration pipeline over the local catalog, both buckets and `snow`
    pub async fn pipeline(&self) -> Result<Pipeline<FileMigrationStore>> {
        let principals = PrincipalFile::in_work_dir(&self.settings.work_dir);
        let principal = principals.load()?.ok_or_else(|| {
            Error::validation(format!(
                "catalog principal not found at {}; run plf setup first",
                principals.path().display()
            ))
        })?;
        let config = self.pipeline_config().await?;
        let dest = S3Store::cloud(&CloudStoreConfig {
            profile: config.profile.clone(),
            region: config.region.clone(),
        });
        let pipeline = Pipeline::new(
            self.migration_store(),
            Arc::new(self.polaris()?),
            principal,
            Arc::new(self.local_store()),
            Arc::new(dest),
            Arc::new(SnowCli::new(self.settings.snowflake_connection.clone())),
            config,
        )?;
        Ok(pipeline)
    }
}

/// Lowercased warehouse user and the `.env` entries recording `connection`
pub fn connection_env(
    connection: &SnowConnection,
) -> Result<(String, Vec<(&'static str, String)>)> {
    let user = connection.user.clone().ok_or_else(|| {
        Error::validation(format!(
            "snow connection '{}' has no user; set SNOWFLAKE_USER in .env",
            connection.name
        ))
    })?;
    let mut updates = vec![
        ("SNOWFLAKE_DEFAULT_CONNECTION_NAME", connection.name.clone()),
        ("SNOWFLAKE_USER", user.clone()),
    ];
    if let Some(account) = &connection.account {
        updates.push(("SNOWFLAKE_ACCOUNT", account.clone()));
    }
    if let Some(host) = &connection.host {
        updates.push(("SNOWFLAKE_ACCOUNT_URL", format!("https://{}", host)));
    }
    Ok((user.to_lowercase(), updates))
}

// =============================================================================
// Confirmation
// =============================================================================

/// Whether an answer to a y/N prompt means yes
pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Ask on stdin unless `--yes` was given. A declined prompt is
/// [`Error::Aborted`].
pub fn confirm(ctx: &Context, question: &str) -> Result<()> {
    if ctx.yes {
        return Ok(());
    }
    print!("{} [y/N] ", question);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    if is_affirmative(&answer) {
        Ok(())
    } else {
        println!("Run with --yes to confirm without prompting");
        Err(Error::Aborted)
    }
}

// =============================================================================
// Operations
// =============================================================================

/// Every command the CLI can run
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Init { runtime: Option<String>, force: bool },
    Setup { runtime: Option<String> },
    Resume,
    Replay,
    Teardown,
    Status,
    Doctor { fix: bool, output: OutputFormat },
    RuntimeDetect { json: bool },
    DockerHost,
    ClusterList { output: OutputFormat },
    ClusterStatus { output: OutputFormat },
    Inventory,
    SetupCloud,
    Sync(SyncOptions),
    Register,
    Refresh,
    Clear,
    Cleanup,
    Migrate(SyncOptions),
    MigrationStatus,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Init { .. } => "init",
            Operation::Setup { .. } => "setup",
            Operation::Resume => "resume",
            Operation::Replay => "replay",
            Operation::Teardown => "teardown",
            Operation::Status => "status",
            Operation::Doctor { .. } => "doctor",
            Operation::RuntimeDetect { .. } => "runtime detect",
            Operation::DockerHost => "runtime docker-host",
            Operation::ClusterList { .. } => "cluster list",
            Operation::ClusterStatus { .. } => "cluster status",
            Operation::Inventory => "l2c inventory",
            Operation::SetupCloud => "l2c setup-cloud",
            Operation::Sync(_) => "l2c sync",
            Operation::Register => "l2c register",
            Operation::Refresh => "l2c refresh",
            Operation::Clear => "l2c clear",
            Operation::Cleanup => "l2c cleanup",
            Operation::Migrate(_) => "l2c migrate",
            Operation::MigrationStatus => "l2c status",
        }
    }

    /// Whether the operation changes state anywhere
    pub fn is_mutating(&self) -> bool {
        match self {
            Operation::Doctor { fix, .. } => *fix,
            Operation::Replay
            | Operation::Status
            | Operation::RuntimeDetect { .. }
            | Operation::DockerHost
            | Operation::ClusterList { .. }
            | Operation::ClusterStatus { .. }
            | Operation::Inventory
            | Operation::MigrationStatus => false,
            _ => true,
        }
    }

    /// Run the operation; the value is the process exit code.
    pub async fn execute(self, ctx: &Context) -> Result<i32> {
        debug!(operation = self.name(), dry_run = ctx.dry_run, "executing");
        match self {
            Operation::Init { runtime, force } => setup::init(ctx, runtime.as_deref(), force).await,
            Operation::Setup { runtime } => setup::setup(ctx, runtime.as_deref()).await,
            Operation::Resume => setup::resume(ctx).await,
            Operation::Replay => setup::replay(ctx).await,
            Operation::Teardown => setup::teardown(ctx).await,
            Operation::Status => setup::status(ctx),
            Operation::Doctor { fix, output } => host::doctor(ctx, fix, output).await,
            Operation::RuntimeDetect { json } => host::runtime_detect(json).await,
            Operation::DockerHost => host::docker_host(ctx).await,
            Operation::ClusterList { output } => host::cluster_list(ctx, output).await,
            Operation::ClusterStatus { output } => host::cluster_status(ctx, output).await,
            Operation::Inventory => l2c::inventory(ctx).await,
            Operation::SetupCloud => l2c::setup_cloud(ctx).await,
            Operation::Sync(options) => l2c::sync(ctx, options).await,
            Operation::Register => l2c::register(ctx).await,
            Operation::Refresh => l2c::refresh(ctx).await,
            Operation::Clear => l2c::clear(ctx).await,
            Operation::Cleanup => l2c::cleanup(ctx).await,
            Operation::Migrate(options) => l2c::migrate(ctx, options).await,
            Operation::MigrationStatus => l2c::status(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affirmative_answers() {
        for answer in ["y", "Y", "yes\n", " YES "] {
            assert!(is_affirmative(answer), "{answer:?}");
        }
        for answer in ["", "n", "no", "yep", "\n"] {
            assert!(!is_affirmative(answer), "{answer:?}");
        }
    }

    #[test]
    fn read_only_operations() {
        assert!(!Operation::Status.is_mutating());
        assert!(!Operation::Replay.is_mutating());
        assert!(!Operation::MigrationStatus.is_mutating());
        assert!(!Operation::ClusterStatus { output: OutputFormat::Json }.is_mutating());
        assert!(!Operation::Doctor { fix: false, output: OutputFormat::Text }.is_mutating());
        assert!(Operation::Doctor { fix: true, output: OutputFormat::Text }.is_mutating());
        assert!(Operation::Cleanup.is_mutating());
        assert!(Operation::Sync(SyncOptions::default()).is_mutating());
    }

    #[test]
    fn cmd_err_wraps_display() {
        let err = Err::<(), _>("boom").cmd_err().unwrap_err();
        assert!(matches!(err, Error::CommandFailed { ref message } if message == "boom"));
    }

    #[tokio::test]
    async fn pipeline_config_applies_overrides() {
        let dir = tempfile::Builder::new().prefix("arctic").tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "SNOWFLAKE_USER=kamesh\nL2C_AWS_REGION=eu-west-1\nL2C_SF_SCHEMA=RAW\n",
        )
        .unwrap();
        let mut ctx = Context::load(dir.path()).unwrap();
        ctx.cloud.database = Some("analytics".into());
        ctx.cloud.role_arn = Some("arn:aws:iam::1:role/r".into());

        let config = ctx.pipeline_config().await.unwrap();
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.schema, "RAW");
        assert_eq!(config.database.as_deref(), Some("analytics"));
        assert_eq!(config.role_arn.as_deref(), Some("arn:aws:iam::1:role/r"));
        assert_eq!(config.base.prefix.as_deref(), Some("kamesh"));
        assert!(config.bucket().starts_with("kamesh-arctic"));
        assert!(config.bucket().ends_with("-polardb"));

        ctx.cloud.no_prefix = true;
        let config = ctx.pipeline_config().await.unwrap();
        assert!(config.bucket().starts_with("arctic"));
    }

    #[test]
    fn discovered_connection_is_recorded_for_later_runs() {
        let connection = SnowConnection {
            name: "dev".into(),
            account: Some("ACME-DEV".into()),
            user: Some("Kamesh".into()),
            host: Some("acme-dev.snowflakecomputing.com".into()),
            is_default: true,
        };
        let (user, updates) = connection_env(&connection).unwrap();
        assert_eq!(user, "kamesh");
        assert!(updates.contains(&("SNOWFLAKE_USER", "Kamesh".to_string())));
        assert!(updates.contains(&("SNOWFLAKE_DEFAULT_CONNECTION_NAME", "dev".to_string())));
        assert!(updates.contains(&(
            "SNOWFLAKE_ACCOUNT_URL",
            "https://acme-dev.snowflakecomputing.com".to_string()
        )));

        let anonymous = SnowConnection {
            user: None,
            ..connection
        };
        assert!(connection_env(&anonymous).is_err());
    }
}
