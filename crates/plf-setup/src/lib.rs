//! Resumable setup of the local lakehouse environment
//!
//! A [`Run`] records seven resources in creation order. The [`Reconciler`]
//! walks the pending ones through a [`StepExecutor`], saving the run after
//! every step so an interrupted setup resumes where it stopped.

pub mod catalog;
pub mod doctor;
pub mod error;
pub mod k3d;
pub mod kube_utils;
pub mod manifest;
pub mod manifests;
pub mod polaris;
pub mod provisioner;
pub mod reconciler;
pub mod runner;
pub mod runtime;
pub mod steps;
pub mod store;

pub use catalog::{
    CatalogError, CatalogService, CatalogSpec, Principal, PrincipalFile, TableIdent, TableInfo,
};
pub use doctor::{diagnose, DoctorReport, DoctorSpec, HostProbe, SystemProbe};
pub use error::{CommandErrorExt, Result, SetupError};
pub use manifest::{Resource, ResourceKind, ResourceStatus, Run, RunConfig, RunStatus};
pub use provisioner::{ClusterHandle, ClusterProvisioner, ClusterSpec, ProvisionError, ReadinessProbe};
pub use reconciler::{plan_run, PlannedStep, Reconciler, ReplayDecision, StepExecutor};
pub use runner::{LocalStack, StackConfig};
pub use steps::SetupStep;
pub use store::{FileRunStore, MemoryRunStore, RunStore};
