//! Setup steps and the resources each one completes

use std::fmt;

use crate::manifest::{ResourceKind, Run};
use crate::Result;

/// One unit of work against the external collaborators.
///
/// A step may complete several resources with a single call sequence
/// (object store and database come up together). A step may also imply a
/// later resource: bootstrapping the catalog service creates the root
/// principal, so the principal is DONE as soon as the catalog service is,
/// ahead of the catalog itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SetupStep {
    CreateCluster,
    WaitForStorage,
    DeployCatalogService,
    ConfigureCatalog,
    LoadDemoData,
}

impl SetupStep {
    /// Every step in execution order
    pub const ALL: [SetupStep; 5] = [
        SetupStep::CreateCluster,
        SetupStep::WaitForStorage,
        SetupStep::DeployCatalogService,
        SetupStep::ConfigureCatalog,
        SetupStep::LoadDemoData,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SetupStep::CreateCluster => "create-cluster",
            SetupStep::WaitForStorage => "wait-storage",
            SetupStep::DeployCatalogService => "deploy-catalog-service",
            SetupStep::ConfigureCatalog => "configure-catalog",
            SetupStep::LoadDemoData => "load-demo-data",
        }
    }

    /// Resources this step creates directly
    pub fn produces(self) -> &'static [ResourceKind] {
        match self {
            SetupStep::CreateCluster => &[ResourceKind::Cluster],
            SetupStep::WaitForStorage => &[ResourceKind::ObjectStore, ResourceKind::Database],
            SetupStep::DeployCatalogService => &[ResourceKind::CatalogService],
            SetupStep::ConfigureCatalog => &[ResourceKind::Catalog],
            SetupStep::LoadDemoData => &[ResourceKind::DemoData],
        }
    }

    /// Resources created as a side effect of this step
    pub fn implies(self) -> &'static [ResourceKind] {
        match self {
            SetupStep::DeployCatalogService => &[ResourceKind::Principal],
            _ => &[],
        }
    }

    /// Ordinals this step marks DONE on success, produced first
    pub fn completes(self) -> impl Iterator<Item = u8> {
        self.produces()
            .iter()
            .chain(self.implies())
            .map(|k| k.ordinal())
    }

    /// The resource a failure of this step is attributed to
    pub fn primary(self) -> ResourceKind {
        self.produces()[0]
    }

    /// A step runs when any resource it produces is still PENDING.
    pub fn is_pending(self, run: &Run) -> bool {
        self.produces().iter().any(|k| !run.is_done(k.ordinal()))
    }

    /// Mark implied resources DONE wherever their producer already is.
    ///
    /// Covers a crash between the producer's completion and the save, or a
    /// hand-edited manifest. Returns whether the run changed.
    pub fn apply_implied(run: &mut Run) -> Result<bool> {
        let mut changed = false;
        for step in SetupStep::ALL {
            if step.is_pending(run) {
                continue;
            }
            for kind in step.implies() {
                changed |= run.mark_done(kind.ordinal())?;
            }
        }
        Ok(changed)
    }
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
