//! plf CLI library

pub mod commands;
pub mod config;
pub mod error;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::host::{ClusterArgs, DoctorArgs, RuntimeArgs};
use commands::l2c::L2cArgs;
use commands::setup::{InitArgs, ResumeArgs, SetupArgs, TeardownArgs};
use commands::{Context, Operation};

/// plf - local Iceberg lakehouse and its migration to the cloud
#[derive(Parser, Debug)]
#[command(name = "plf")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Project directory holding `.env` and the state files
    #[arg(long, global = true, env = "PLF_WORK_DIR", default_value = ".")]
    pub work_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a fresh setup manifest with every resource PENDING
    Init(InitArgs),
    /// Create the local environment, resuming an active run
    Setup(SetupArgs),
    /// Continue an interrupted setup from the first pending resource
    Resume(ResumeArgs),
    /// Report what the environment needs (exit 0, 10, 11 or 1)
    Replay,
    /// Delete the cluster and mark the run REMOVED
    Teardown(TeardownArgs),
    /// Show the setup manifest
    Status,
    /// Check tools, runtime, ports and leftover clusters (exit 1 on issues)
    Doctor(DoctorArgs),
    /// Container runtime detection
    Runtime(RuntimeArgs),
    /// Inspect k3d clusters
    Cluster(ClusterArgs),
    /// Migrate local tables to the cloud
    L2c(L2cArgs),
}

impl Cli {
    /// Resolve the operation and its context from the parsed flags
    pub fn operation(self) -> Result<(Operation, Context)> {
        let mut ctx = Context::load(&self.work_dir)?;
        let operation = match self.command {
            Commands::Init(args) => args.apply(&mut ctx),
            Commands::Setup(args) => args.apply(&mut ctx),
            Commands::Resume(args) => args.apply(&mut ctx),
            Commands::Replay => Operation::Replay,
            Commands::Teardown(args) => args.apply(&mut ctx),
            Commands::Status => Operation::Status,
            Commands::Doctor(args) => args.apply(&mut ctx),
            Commands::Runtime(args) => args.apply(&mut ctx),
            Commands::Cluster(args) => args.apply(&mut ctx),
            Commands::L2c(args) => args.apply(&mut ctx),
        };
        Ok((operation, ctx))
    }

    /// Run the CLI command; the value is the process exit code.
    pub async fn run(self) -> Result<i32> {
        let (operation, ctx) = self.operation()?;
        operation.execute(&ctx).await
    }
}
