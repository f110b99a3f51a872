//! The setup manifest: one Run and its ordered Resources
//!
//! Resources are created in ordinal order. A resource at position N may
//! depend on every resource before it. Status moves PENDING -> DONE once per
//! run; only a new run (or an explicit reset) puts it back to PENDING.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, SetupError};

/// Overall run status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    #[default]
    Pending,
    InProgress,
    Complete,
    Removed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "PENDING",
            RunStatus::InProgress => "IN_PROGRESS",
            RunStatus::Complete => "COMPLETE",
            RunStatus::Removed => "REMOVED",
        };
        f.write_str(s)
    }
}

/// Per-resource status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceStatus {
    #[default]
    Pending,
    Done,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceStatus::Pending => f.write_str("PENDING"),
            ResourceStatus::Done => f.write_str("DONE"),
        }
    }
}

/// The fixed set of resources a run creates
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Cluster,
    ObjectStore,
    Database,
    CatalogService,
    Catalog,
    Principal,
    DemoData,
}

impl ResourceKind {
    /// Every kind, in creation order
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Cluster,
        ResourceKind::ObjectStore,
        ResourceKind::Database,
        ResourceKind::CatalogService,
        ResourceKind::Catalog,
        ResourceKind::Principal,
        ResourceKind::DemoData,
    ];

    pub fn ordinal(self) -> u8 {
        match self {
            ResourceKind::Cluster => 1,
            ResourceKind::ObjectStore => 2,
            ResourceKind::Database => 3,
            ResourceKind::CatalogService => 4,
            ResourceKind::Catalog => 5,
            ResourceKind::Principal => 6,
            ResourceKind::DemoData => 7,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ResourceKind::Cluster => "k3d cluster",
            ResourceKind::ObjectStore => "RustFS",
            ResourceKind::Database => "PostgreSQL",
            ResourceKind::CatalogService => "Polaris",
            ResourceKind::Catalog => "Catalog",
            ResourceKind::Principal => "Principal",
            ResourceKind::DemoData => "Demo data",
        }
    }
}

/// One infrastructure unit in the run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub ordinal: u8,
    pub label: String,
    pub kind: ResourceKind,
    pub status: ResourceStatus,
}

impl Resource {
    fn pending(kind: ResourceKind) -> Self {
        Self {
            ordinal: kind.ordinal(),
            label: kind.label().to_string(),
            kind,
            status: ResourceStatus::Pending,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == ResourceStatus::Done
    }
}

/// Values recorded when the run was initialised
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_runtime: Option<String>,
    pub cluster_name: String,
    pub project_name: String,
}

/// One lifecycle of the local environment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub config: RunConfig,
    pub resources: Vec<Resource>,
}

impl Default for Run {
    fn default() -> Self {
        Self {
            status: RunStatus::Pending,
            created_at: None,
            updated_at: None,
            config: RunConfig::default(),
            resources: ResourceKind::ALL.into_iter().map(Resource::pending).collect(),
        }
    }
}

impl Run {
    /// A fresh run with every resource PENDING
    pub fn new(config: RunConfig) -> Self {
        Self {
            created_at: Some(Utc::now()),
            config,
            ..Default::default()
        }
    }

    pub fn resource(&self, ordinal: u8) -> Option<&Resource> {
        self.resources.iter().find(|r| r.ordinal == ordinal)
    }

    pub fn is_done(&self, ordinal: u8) -> bool {
        self.resource(ordinal).is_some_and(Resource::is_done)
    }

    pub fn all_done(&self) -> bool {
        self.resources.iter().all(Resource::is_done)
    }

    pub fn label(&self, ordinal: u8) -> String {
        self.resource(ordinal)
            .map(|r| r.label.clone())
            .unwrap_or_else(|| format!("resource {ordinal}"))
    }

    /// Set one resource's status. Returns whether anything changed.
    pub fn set_resource_status(&mut self, ordinal: u8, status: ResourceStatus) -> Result<bool> {
        let resource = self
            .resources
            .iter_mut()
            .find(|r| r.ordinal == ordinal)
            .ok_or_else(|| SetupError::validation(format!("unknown resource ordinal {ordinal}")))?;
        if resource.status == status {
            return Ok(false);
        }
        resource.status = status;
        self.refresh_status();
        Ok(true)
    }

    pub fn mark_done(&mut self, ordinal: u8) -> Result<bool> {
        self.set_resource_status(ordinal, ResourceStatus::Done)
    }

    /// Derive the overall status from the resources.
    ///
    /// COMPLETE iff every resource is DONE; IN_PROGRESS once any resource
    /// has left PENDING. A REMOVED run keeps its status until re-initialised.
    pub fn refresh_status(&mut self) {
        if self.status == RunStatus::Removed {
            return;
        }
        self.status = if self.all_done() {
            RunStatus::Complete
        } else if self.status == RunStatus::InProgress || self.resources.iter().any(Resource::is_done)
        {
            RunStatus::InProgress
        } else {
            RunStatus::Pending
        };
    }

    /// Structural checks applied to a loaded manifest
    pub fn validate(&self) -> std::result::Result<(), String> {
        for kind in ResourceKind::ALL {
            let matches: Vec<_> = self.resources.iter().filter(|r| r.kind == kind).collect();
            match matches.as_slice() {
                [r] if r.ordinal == kind.ordinal() => {}
                [r] => {
                    return Err(format!(
                        "resource {} must have ordinal {}, found {}",
                        kind.label(),
                        kind.ordinal(),
                        r.ordinal
                    ))
                }
                [] => return Err(format!("resource {} is missing", kind.label())),
                _ => return Err(format!("resource {} is listed more than once", kind.label())),
            }
        }
        if self.resources.len() != ResourceKind::ALL.len() {
            return Err(format!(
                "expected {} resources, found {}",
                ResourceKind::ALL.len(),
                self.resources.len()
            ));
        }
        if self.status == RunStatus::Complete && !self.all_done() {
            return Err("status is COMPLETE but some resources are PENDING".to_string());
        }
        Ok(())
    }
}
