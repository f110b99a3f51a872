//! Resource reconciler
//!
//! Walks the setup steps in order, skipping those whose resources are
//! already DONE, and persists the run after every step before moving on.
//! A failed step stops the walk and leaves the run IN_PROGRESS so the next
//! resume re-attempts the same resource.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{error, info};

use crate::manifest::{Run, RunConfig, RunStatus};
use crate::provisioner::{cluster_present, ClusterProvisioner};
use crate::steps::SetupStep;
use crate::store::RunStore;
use crate::{Result, SetupError};

/// Performs the external calls behind one setup step.
///
/// Implementations must tolerate re-invocation: a step may have taken
/// effect in a previous process that died before the run was saved.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, step: SetupStep) -> Result<()>;
}

/// A step that resume would run, with the resources it would complete
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedStep {
    pub step: SetupStep,
    pub resources: Vec<(u8, String)>,
}

impl fmt::Display for PlannedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<String> = self
            .resources
            .iter()
            .map(|(ordinal, label)| format!("{ordinal}. {label}"))
            .collect();
        write!(f, "{} -> {}", self.step, labels.join(", "))
    }
}

/// Read-only verdict on what the environment needs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayDecision {
    /// Run is COMPLETE and the cluster is live
    NothingToDo,
    /// No run, or the last run was torn down
    FullSetupNeeded,
    /// Run is PENDING or IN_PROGRESS
    ResumeNeeded,
    /// Run is COMPLETE but the cluster is gone
    Inconsistent,
}

impl ReplayDecision {
    /// Process exit code reported by `plf replay`
    pub fn exit_code(self) -> i32 {
        match self {
            ReplayDecision::NothingToDo => 0,
            ReplayDecision::FullSetupNeeded => 10,
            ReplayDecision::ResumeNeeded => 11,
            ReplayDecision::Inconsistent => 1,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            ReplayDecision::NothingToDo => "environment is complete and running",
            ReplayDecision::FullSetupNeeded => "no active run; full setup needed (plf setup)",
            ReplayDecision::ResumeNeeded => "run is incomplete; resume needed (plf resume)",
            ReplayDecision::Inconsistent => {
                "manifest says COMPLETE but the cluster is missing; run plf teardown then plf setup"
            }
        }
    }
}

/// Drives a [`Run`] to COMPLETE through a [`StepExecutor`]
pub struct Reconciler<S: RunStore> {
    store: S,
    executor: Arc<dyn StepExecutor>,
    provisioner: Arc<dyn ClusterProvisioner>,
}

impl<S: RunStore> Reconciler<S> {
    pub fn new(
        store: S,
        executor: Arc<dyn StepExecutor>,
        provisioner: Arc<dyn ClusterProvisioner>,
    ) -> Self {
        Self {
            store,
            executor,
            provisioner,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Current run as stored
    pub fn status(&self) -> Result<Run> {
        self.store.load()
    }

    /// Steps resume would run, without side effects
    pub fn plan(&self) -> Result<Vec<PlannedStep>> {
        let mut run = self.store.load()?;
        SetupStep::apply_implied(&mut run)?;
        Ok(plan_run(&run))
    }

    /// Start a fresh run with every resource PENDING.
    ///
    /// Refuses to replace an active run unless `force` is set.
    pub fn init(&self, config: RunConfig, force: bool) -> Result<Run> {
        if self.store.exists()? && !force {
            let current = self.store.load()?;
            if current.status != RunStatus::Removed {
                return Err(SetupError::validation(format!(
                    "a run already exists with status {}; use plf resume, or --force to start over",
                    current.status
                )));
            }
        }
        let run = Run::new(config);
        self.store.save(&run)?;
        info!(cluster = %run.config.cluster_name, "Initialised setup manifest");
        Ok(run)
    }

    /// Init when there is no active run, then resume
    pub async fn setup(&self, config: RunConfig) -> Result<Run> {
        let active = self.store.exists()? && self.store.load()?.status != RunStatus::Removed;
        if !active {
            self.init(config, true)?;
        }
        self.resume().await
    }

    /// Run every pending step in order, saving after each.
    pub async fn resume(&self) -> Result<Run> {
        if !self.store.exists()? {
            return Err(SetupError::validation(
                "no setup manifest found; run plf setup first",
            ));
        }
        let mut run = self.store.load()?;
        if run.status == RunStatus::Removed {
            return Err(SetupError::validation(
                "the last run was torn down; run plf setup to start a new one",
            ));
        }

        let before = run.status;
        let mut changed = SetupStep::apply_implied(&mut run)?;
        run.refresh_status();
        changed |= run.status != before;

        let pending: Vec<SetupStep> = SetupStep::ALL
            .into_iter()
            .filter(|s| s.is_pending(&run))
            .collect();

        if pending.is_empty() {
            if changed {
                self.store.save(&run)?;
            }
            info!("All resources are DONE, nothing to resume");
            return Ok(run);
        }

        if run.status == RunStatus::Pending {
            run.status = RunStatus::InProgress;
            changed = true;
        }
        if changed {
            self.store.save(&run)?;
        }

        let total = pending.len();
        for (i, step) in pending.into_iter().enumerate() {
            let primary = step.primary().ordinal();
            info!("[Step {}/{}] {} ({})", i + 1, total, step, run.label(primary));

            if let Err(e) = self.executor.execute(step).await {
                error!(step = %step, resource = primary, error = %e, "Step failed");
                return Err(SetupError::Step {
                    step: step.name(),
                    ordinal: primary,
                    label: run.label(primary),
                    source: Box::new(e),
                });
            }

            for ordinal in step.completes() {
                run.mark_done(ordinal)?;
            }
            self.store.save(&run)?;
        }

        info!(status = %run.status, "Setup complete");
        Ok(run)
    }

    /// Delete the cluster and mark the run REMOVED, keeping resource history
    pub async fn teardown(&self) -> Result<Run> {
        if !self.store.exists()? {
            return Err(SetupError::validation("no setup manifest found; nothing to tear down"));
        }
        let mut run = self.store.load()?;
        let name = run.config.cluster_name.clone();
        if !name.is_empty() {
            info!(cluster = %name, "Deleting cluster");
            self.provisioner.delete(&name).await?;
        }
        if run.status != RunStatus::Removed {
            run.status = RunStatus::Removed;
            self.store.save(&run)?;
        }
        Ok(run)
    }

    /// Decide what the environment needs without changing anything
    pub async fn replay(&self) -> Result<ReplayDecision> {
        if !self.store.exists()? {
            return Ok(ReplayDecision::FullSetupNeeded);
        }
        let run = self.store.load()?;
        let decision = match run.status {
            RunStatus::Removed => ReplayDecision::FullSetupNeeded,
            RunStatus::Pending | RunStatus::InProgress => ReplayDecision::ResumeNeeded,
            RunStatus::Complete => {
                if cluster_present(self.provisioner.as_ref(), &run.config.cluster_name).await? {
                    ReplayDecision::NothingToDo
                } else {
                    ReplayDecision::Inconsistent
                }
            }
        };
        Ok(decision)
    }
}

/// Pending steps of `run` and the resources each would complete
pub fn plan_run(run: &Run) -> Vec<PlannedStep> {
    SetupStep::ALL
        .into_iter()
        .filter(|s| s.is_pending(run))
        .map(|step| PlannedStep {
            step,
            resources: step
                .completes()
                .filter(|o| !run.is_done(*o))
                .map(|o| (o, run.label(o)))
                .collect(),
        })
        .collect()
}
