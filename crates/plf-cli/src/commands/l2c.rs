//! Local-to-cloud migration commands
//!
//! Usage: plf l2c <command> [--prefix NAME | --no-prefix] [--dry-run] [--yes]
//!
//! Every mutating command prints its plan first; `--dry-run` stops there
//! and `--yes` skips the confirmation prompt.

use clap::{Args, Subcommand};
use plf_migrate::{
    BatchReport, CloudPlan, FileMigrationStore, MetadataPlan, MigrationStore, Pipeline, SyncOptions,
};

use super::format::{print_migration, print_report, print_table};
use super::{confirm, CloudOverrides, Context, Operation};
use crate::{Error, Result};

/// Migrate local tables to a cloud bucket and warehouse
#[derive(Args, Debug, Clone)]
pub struct L2cArgs {
    #[command(flatten)]
    pub cloud: CloudArgs,

    #[command(subcommand)]
    pub command: L2cCommand,
}

/// Naming and credential flags shared by every `l2c` command
#[derive(Args, Debug, Clone, Default)]
pub struct CloudArgs {
    /// Prefix for cloud resource names (defaults to SNOWFLAKE_USER)
    #[arg(long, global = true, conflicts_with = "no_prefix")]
    pub prefix: Option<String>,

    /// Name cloud resources without a prefix
    #[arg(long, global = true)]
    pub no_prefix: bool,

    /// Warehouse database (defaults to the resource base)
    #[arg(long, global = true)]
    pub database: Option<String>,

    /// Warehouse schema
    #[arg(long, global = true, env = "L2C_SF_SCHEMA")]
    pub schema: Option<String>,

    /// AWS profile for the cloud bucket
    #[arg(long, global = true, env = "L2C_AWS_PROFILE")]
    pub profile: Option<String>,

    /// AWS region for the cloud bucket
    #[arg(long, global = true, env = "L2C_AWS_REGION")]
    pub region: Option<String>,

    /// IAM role the warehouse assumes to read the bucket
    #[arg(long, global = true, env = "L2C_STORAGE_ROLE_ARN")]
    pub role_arn: Option<String>,

    /// Warehouse role that creates account-level objects
    #[arg(long, global = true)]
    pub admin_role: Option<String>,
}

impl From<CloudArgs> for CloudOverrides {
    fn from(args: CloudArgs) -> Self {
        CloudOverrides {
            prefix: args.prefix,
            no_prefix: args.no_prefix,
            database: args.database,
            schema: args.schema,
            profile: args.profile,
            region: args.region,
            role_arn: args.role_arn,
            admin_role: args.admin_role,
        }
    }
}

/// Plan and confirmation flags
#[derive(Args, Debug, Clone, Default)]
pub struct ChangeArgs {
    /// Print the plan and exit
    #[arg(long)]
    pub dry_run: bool,

    /// Skip confirmation prompt
    #[arg(short = 'y', long = "yes")]
    pub yes: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct SyncArgs {
    #[command(flatten)]
    pub change: ChangeArgs,

    /// Re-sync synced tables and copy every object
    #[arg(long)]
    pub force: bool,

    /// Keep metadata locations pointing at the local bucket
    #[arg(long)]
    pub skip_rewrite: bool,
}

impl SyncArgs {
    fn options(&self) -> SyncOptions {
        SyncOptions {
            force: self.force,
            skip_rewrite: self.skip_rewrite,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum L2cCommand {
    /// List tables in the local catalog
    Inventory,
    /// Create the cloud bucket and warehouse objects
    SetupCloud(ChangeArgs),
    /// Copy table objects to the cloud bucket
    Sync(SyncArgs),
    /// Create warehouse tables over synced metadata
    Register(ChangeArgs),
    /// Point registered tables at their latest metadata
    Refresh(ChangeArgs),
    /// Remove migrated objects and warehouse tables, keeping cloud resources
    Clear(ChangeArgs),
    /// Clear, then drop the warehouse objects and delete the bucket
    Cleanup(ChangeArgs),
    /// setup-cloud, sync and register in one go
    Migrate(SyncArgs),
    /// Show migration state
    Status,
}

impl L2cArgs {
    pub fn apply(self, ctx: &mut Context) -> Operation {
        ctx.cloud = self.cloud.into();
        let mut change = |args: &ChangeArgs| {
            ctx.dry_run = args.dry_run;
            ctx.yes = args.yes;
        };
        match self.command {
            L2cCommand::Inventory => Operation::Inventory,
            L2cCommand::SetupCloud(args) => {
                change(&args);
                Operation::SetupCloud
            }
            L2cCommand::Sync(args) => {
                change(&args.change);
                Operation::Sync(args.options())
            }
            L2cCommand::Register(args) => {
                change(&args);
                Operation::Register
            }
            L2cCommand::Refresh(args) => {
                change(&args);
                Operation::Refresh
            }
            L2cCommand::Clear(args) => {
                change(&args);
                Operation::Clear
            }
            L2cCommand::Cleanup(args) => {
                change(&args);
                Operation::Cleanup
            }
            L2cCommand::Migrate(args) => {
                change(&args.change);
                Operation::Migrate(args.options())
            }
            L2cCommand::Status => Operation::MigrationStatus,
        }
    }
}

// =============================================================================
// Plans
// =============================================================================

fn print_cloud_plan(plan: &CloudPlan) {
    println!("Cloud resources ({}):", plan.base);
    println!("  bucket:              s3://{} ({})", plan.bucket, plan.region);
    println!("  catalog integration: {}", plan.names.catalog_integration);
    println!("  external volume:     {}", plan.names.external_volume);
    println!("  role:                {}", plan.names.sa_role);
    println!("  database.schema:     {}.{}", plan.names.database, plan.names.schema);
    if plan.recorded {
        println!("  (already recorded with this naming; statements are idempotent)");
    }
    println!();
    for sql in &plan.statements {
        println!("{}", sql.trim_end());
        println!();
    }
}

fn print_metadata_plan(plans: &[MetadataPlan]) {
    let rows: Vec<Vec<String>> = plans
        .iter()
        .map(|p| {
            vec![
                p.key.clone(),
                p.sf_table.clone(),
                p.current.clone().unwrap_or_else(|| "-".to_string()),
                p.latest.clone().unwrap_or_else(|| "(no metadata)".to_string()),
            ]
        })
        .collect();
    print_table(&["TABLE", "WAREHOUSE TABLE", "CURRENT", "LATEST"], &rows);
}

/// Exit code for a finished batch; any failed table fails the command.
fn finish(operation: &str, report: &BatchReport) -> Result<i32> {
    print_report(operation, report);
    let failed = report.failed().len();
    if failed == 0 {
        Ok(0)
    } else {
        Err(Error::command_failed(format!(
            "{} of {} tables failed; re-run plf {} to retry them",
            failed,
            report.outcomes.len(),
            operation
        )))
    }
}

/// Stop after the plan for `--dry-run`, otherwise ask.
fn gate(ctx: &Context, question: &str) -> Result<bool> {
    if ctx.dry_run {
        return Ok(false);
    }
    confirm(ctx, question)?;
    Ok(true)
}

/// [`gate`], then verify the cloud profile so a bad credential stops the
/// command before any table is touched.
async fn proceed(
    ctx: &Context,
    pipeline: &Pipeline<FileMigrationStore>,
    question: &str,
) -> Result<bool> {
    if !gate(ctx, question)? {
        return Ok(false);
    }
    let account = ctx.verify_cloud(pipeline.config()).await?;
    println!("Using AWS account {}", account);
    Ok(true)
}

// =============================================================================
// Commands
// =============================================================================

pub async fn inventory(ctx: &Context) -> Result<i32> {
    let pipeline = ctx.pipeline().await?;
    let rows: Vec<Vec<String>> = pipeline
        .inventory()
        .await?
        .into_iter()
        .map(|e| {
            vec![
                e.ident.namespace.clone(),
                e.ident.name.clone(),
                e.metadata_location
                    .or(e.error.map(|err| format!("error: {}", err)))
                    .unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    print_table(&["NAMESPACE", "TABLE", "METADATA"], &rows);
    Ok(0)
}

pub async fn setup_cloud(ctx: &Context) -> Result<i32> {
    let pipeline = ctx.pipeline().await?;
    print_cloud_plan(&pipeline.plan_setup_cloud()?);
    if !proceed(ctx, &pipeline, "Create these cloud resources?").await? {
        return Ok(0);
    }
    let state = pipeline.setup_cloud().await?;
    print_migration(&state);
    Ok(0)
}

pub async fn sync(ctx: &Context, options: SyncOptions) -> Result<i32> {
    let pipeline = ctx.pipeline().await?;
    let plans = pipeline.plan_sync(options.force).await?;
    if plans.is_empty() {
        println!("Every table is synced; use --force to copy again");
        return Ok(0);
    }
    let rows: Vec<Vec<String>> = plans
        .iter()
        .map(|(key, plan)| {
            vec![
                key.clone(),
                plan.keys.len().to_string(),
                plan.bytes.to_string(),
                plan.skipped.to_string(),
            ]
        })
        .collect();
    print_table(&["TABLE", "TO COPY", "BYTES", "UNCHANGED"], &rows);
    if options.skip_rewrite {
        println!("Metadata locations will keep pointing at the local bucket");
    }
    let question = format!(
        "Sync {} tables to s3://{}?",
        plans.len(),
        pipeline.config().bucket()
    );
    if !proceed(ctx, &pipeline, &question).await? {
        return Ok(0);
    }
    let report = pipeline.sync(options).await?;
    finish("l2c sync", &report)
}

pub async fn register(ctx: &Context) -> Result<i32> {
    let pipeline = ctx.pipeline().await?;
    let plans = pipeline.plan_register().await?;
    if plans.is_empty() {
        println!("Nothing to register");
        return Ok(0);
    }
    print_metadata_plan(&plans);
    if !proceed(ctx, &pipeline, &format!("Register {} tables?", plans.len())).await? {
        return Ok(0);
    }
    let report = pipeline.register().await?;
    finish("l2c register", &report)
}

pub async fn refresh(ctx: &Context) -> Result<i32> {
    let pipeline = ctx.pipeline().await?;
    let plans = pipeline.plan_refresh().await?;
    if plans.is_empty() {
        println!("Every registered table points at its latest metadata");
        return Ok(0);
    }
    print_metadata_plan(&plans);
    if !proceed(ctx, &pipeline, &format!("Refresh {} tables?", plans.len())).await? {
        return Ok(0);
    }
    let report = pipeline.refresh().await?;
    finish("l2c refresh", &report)
}

pub async fn clear(ctx: &Context) -> Result<i32> {
    let pipeline = ctx.pipeline().await?;
    let keys = pipeline.plan_clear()?;
    if keys.is_empty() {
        println!("No tables recorded");
        return Ok(0);
    }
    println!(
        "Objects under each table in s3://{} and its warehouse table will be removed:",
        pipeline.config().bucket()
    );
    for key in &keys {
        println!("  - {}", key);
    }
    if !proceed(ctx, &pipeline, &format!("Clear {} tables?", keys.len())).await? {
        return Ok(0);
    }
    let report = pipeline.clear().await?;
    finish("l2c clear", &report)
}

pub async fn cleanup(ctx: &Context) -> Result<i32> {
    let pipeline = ctx.pipeline().await?;
    let (bucket, statements) = pipeline.plan_cleanup()?;
    let keys = pipeline.plan_clear()?;
    println!("Cleanup removes:");
    println!("  - {} migrated tables", keys.len());
    println!("  - every object in s3://{} and the bucket itself", bucket);
    for sql in &statements {
        println!();
        println!("{}", sql.trim_end());
    }
    println!();
    if !proceed(ctx, &pipeline, "Remove all cloud resources?").await? {
        return Ok(0);
    }
    let state = pipeline.cleanup().await?;
    print_migration(&state);
    Ok(0)
}

pub async fn migrate(ctx: &Context, options: SyncOptions) -> Result<i32> {
    let pipeline = ctx.pipeline().await?;
    let state = pipeline.status()?;
    match (&state.aws, &state.warehouse) {
        (Some(aws), Some(_)) => println!("Cloud resources already set up: s3://{}", aws.bucket),
        _ => print_cloud_plan(&pipeline.plan_setup_cloud()?),
    }
    let plans = pipeline.plan_sync(options.force).await?;
    println!("{} tables to sync, then register", plans.len());
    if !proceed(ctx, &pipeline, "Migrate?").await? {
        return Ok(0);
    }
    let (synced, registered) = pipeline.migrate(options).await?;
    print_report("l2c sync", &synced);
    finish("l2c register", &registered).and_then(|code| {
        if synced.all_succeeded() {
            Ok(code)
        } else {
            Err(Error::command_failed(format!(
                "{} tables failed to sync; re-run plf l2c sync to retry them",
                synced.failed().len()
            )))
        }
    })
}

pub fn status(ctx: &Context) -> Result<i32> {
    let state = ctx.migration_store().load()?;
    print_migration(&state);
    Ok(0)
}
