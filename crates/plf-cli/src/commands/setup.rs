//! Local environment commands: init, setup, resume, replay, teardown, status
//!
//! Usage: plf setup [--runtime podman] [--dry-run]
//!
//! `setup` starts a run when none is active and resumes it; an interrupted
//! setup continues with `plf resume` from the first resource that is not DONE.

use clap::Args;
use plf_setup::{plan_run, PlannedStep, Run, RunStatus, RunStore, SetupStep};
use tracing::info;

use super::format::print_run;
use super::{confirm, Context, Operation};
use crate::Result;

/// Start a fresh setup manifest
#[derive(Args, Debug, Clone)]
pub struct InitArgs {
    /// Container runtime (docker or podman); detected when omitted
    #[arg(long, env = "PLF_CONTAINER_RUNTIME")]
    pub runtime: Option<String>,

    /// Replace an active run
    #[arg(long)]
    pub force: bool,

    /// Skip confirmation prompt
    #[arg(short = 'y', long = "yes")]
    pub yes: bool,
}

/// Create the environment, or finish a run that is already active
#[derive(Args, Debug, Clone)]
pub struct SetupArgs {
    /// Container runtime (docker or podman); detected when omitted
    #[arg(long, env = "PLF_CONTAINER_RUNTIME")]
    pub runtime: Option<String>,

    /// Print the steps that would run and exit
    #[arg(long)]
    pub dry_run: bool,
}

/// Continue an interrupted run
#[derive(Args, Debug, Clone)]
pub struct ResumeArgs {
    /// Print the steps that would run and exit
    #[arg(long)]
    pub dry_run: bool,
}

/// Delete the cluster and mark the run REMOVED
#[derive(Args, Debug, Clone)]
pub struct TeardownArgs {
    /// Skip confirmation prompt
    #[arg(short = 'y', long = "yes")]
    pub yes: bool,

    /// Print what would be removed and exit
    #[arg(long)]
    pub dry_run: bool,
}

impl InitArgs {
    pub fn apply(self, ctx: &mut Context) -> Operation {
        ctx.yes = self.yes;
        Operation::Init {
            runtime: self.runtime,
            force: self.force,
        }
    }
}

impl SetupArgs {
    pub fn apply(self, ctx: &mut Context) -> Operation {
        ctx.dry_run = self.dry_run;
        Operation::Setup {
            runtime: self.runtime,
        }
    }
}

impl ResumeArgs {
    pub fn apply(self, ctx: &mut Context) -> Operation {
        ctx.dry_run = self.dry_run;
        Operation::Resume
    }
}

impl TeardownArgs {
    pub fn apply(self, ctx: &mut Context) -> Operation {
        ctx.yes = self.yes;
        ctx.dry_run = self.dry_run;
        Operation::Teardown
    }
}

fn print_plan(steps: &[PlannedStep]) {
    if steps.is_empty() {
        println!("Nothing to do: every resource is DONE");
        return;
    }
    println!("Steps to run:");
    for (i, step) in steps.iter().enumerate() {
        println!("  {}. {}", i + 1, step);
    }
}

/// Plan for `setup`: the active run's pending steps, or every step of a new run.
fn setup_plan(ctx: &Context) -> Result<Vec<PlannedStep>> {
    let store = ctx.run_store();
    let run = store.load()?;
    if store.exists()? && run.status != RunStatus::Removed {
        let mut run = run;
        SetupStep::apply_implied(&mut run)?;
        Ok(plan_run(&run))
    } else {
        Ok(plan_run(&Run::default()))
    }
}

pub async fn init(ctx: &Context, runtime: Option<&str>, force: bool) -> Result<i32> {
    if force && ctx.run_store().exists()? {
        confirm(ctx, "Replace the existing setup manifest? Resource history is lost")?;
    }
    let (reconciler, runtime) = ctx.reconciler(runtime).await?;
    let run = reconciler.init(ctx.run_config(runtime), force)?;
    println!(
        "Initialised {} with {} PENDING resources",
        ctx.run_store().path().display(),
        run.resources.len()
    );
    Ok(0)
}

pub async fn setup(ctx: &Context, runtime: Option<&str>) -> Result<i32> {
    if ctx.dry_run {
        print_plan(&setup_plan(ctx)?);
        return Ok(0);
    }
    let (reconciler, runtime) = ctx.reconciler(runtime).await?;
    info!(runtime = runtime.as_str(), cluster = %ctx.settings.cluster_name, "Starting setup");
    let run = reconciler.setup(ctx.run_config(runtime)).await?;
    print_run(&run);
    Ok(0)
}

pub async fn resume(ctx: &Context) -> Result<i32> {
    if ctx.dry_run {
        let mut run = ctx.run_store().load()?;
        SetupStep::apply_implied(&mut run)?;
        print_plan(&plan_run(&run));
        return Ok(0);
    }
    let (reconciler, _) = ctx.reconciler(None).await?;
    let run = reconciler.resume().await?;
    print_run(&run);
    Ok(0)
}

/// Prints the decision; the exit code carries it for scripts.
pub async fn replay(ctx: &Context) -> Result<i32> {
    let (reconciler, _) = ctx.reconciler(None).await?;
    let decision = reconciler.replay().await?;
    println!("{}", decision.describe());
    Ok(decision.exit_code())
}

pub async fn teardown(ctx: &Context) -> Result<i32> {
    let run = ctx.run_store().load()?;
    println!("Cluster {} will be deleted:", run.config.cluster_name);
    println!("  - every resource inside it (object store, database, catalog, data)");
    println!("  - the run is kept and marked REMOVED");
    if ctx.dry_run {
        return Ok(0);
    }
    confirm(ctx, "Delete the cluster?")?;

    let (reconciler, _) = ctx.reconciler(None).await?;
    let run = reconciler.teardown().await?;
    println!("Run status: {}", run.status);
    Ok(0)
}

pub fn status(ctx: &Context) -> Result<i32> {
    let store = ctx.run_store();
    if !store.exists()? {
        println!("No setup manifest at {}; run plf setup", store.path().display());
        return Ok(0);
    }
    print_run(&store.load()?);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plf_setup::{ResourceStatus, RunConfig};

    fn context() -> (tempfile::TempDir, Context) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::load(dir.path()).unwrap();
        (dir, ctx)
    }

    #[test]
    fn setup_plan_without_a_run_covers_every_step() {
        let (_dir, ctx) = context();
        let plan = setup_plan(&ctx).unwrap();
        assert_eq!(plan.len(), SetupStep::ALL.len());
    }

    #[test]
    fn setup_plan_skips_done_resources() {
        let (_dir, ctx) = context();
        let mut run = Run::new(RunConfig::default());
        run.status = RunStatus::InProgress;
        run.resources[0].status = ResourceStatus::Done;
        ctx.run_store().save(&run).unwrap();

        let plan = setup_plan(&ctx).unwrap();
        assert_eq!(plan.len(), SetupStep::ALL.len() - 1);
        assert!(plan.iter().all(|p| p.resources.iter().all(|(ordinal, _)| *ordinal != 1)));
    }

    #[test]
    fn removed_run_plans_from_scratch() {
        let (_dir, ctx) = context();
        let mut run = Run::new(RunConfig::default());
        for resource in run.resources.iter_mut() {
            resource.status = ResourceStatus::Done;
        }
        run.status = RunStatus::Removed;
        ctx.run_store().save(&run).unwrap();

        assert_eq!(setup_plan(&ctx).unwrap().len(), SetupStep::ALL.len());
    }

    #[test]
    fn status_without_manifest_is_not_an_error() {
        let (_dir, ctx) = context();
        assert_eq!(status(&ctx).unwrap(), 0);
    }
}
