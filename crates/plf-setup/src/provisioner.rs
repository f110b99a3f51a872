//! Cluster provisioner collaborator

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

/// What to create
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterSpec {
    pub name: String,
    pub k3s_version: String,
    /// host:container port pairs exposed through the cluster load balancer
    pub ports: Vec<(u16, u16)>,
    /// Directory of manifests the cluster applies on boot
    pub manifests_dir: Option<PathBuf>,
}

/// A cluster the provisioner knows about
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterHandle {
    pub name: String,
    pub servers_running: u32,
}

impl ClusterHandle {
    pub fn is_running(&self) -> bool {
        self.servers_running > 0
    }
}

/// Readiness conditions a caller can wait on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadinessProbe {
    /// Every node reports Ready
    ApiServer,
    /// The object store deployment is available
    ObjectStore,
    /// The metastore database deployment is available
    Database,
    /// The catalog service deployment is available
    CatalogService,
}

impl ReadinessProbe {
    /// (namespace, deployment) backing the probe, if any
    pub fn deployment(self) -> Option<(&'static str, &'static str)> {
        match self {
            ReadinessProbe::ApiServer => None,
            ReadinessProbe::ObjectStore => Some(("rustfs", "rustfs")),
            ReadinessProbe::Database => Some(("polaris", "postgresql")),
            ReadinessProbe::CatalogService => Some(("polaris", "polaris")),
        }
    }
}

impl fmt::Display for ReadinessProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.deployment() {
            None => f.write_str("cluster nodes"),
            Some((ns, name)) => write!(f, "deployment {ns}/{name}"),
        }
    }
}

/// Errors from the cluster provisioner
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionError {
    #[error("cluster {name} already exists")]
    AlreadyExists { name: String },

    #[error("cluster {name} not found")]
    NotFound { name: String },

    #[error("port conflict: {message}")]
    PortConflict { message: String },

    /// Leftover containers, networks or volumes from an earlier cluster
    #[error("stale resources from a previous cluster: {message}")]
    GhostResource { message: String },

    #[error("timeout after {seconds}s waiting for {what}")]
    Timeout { what: String, seconds: u64 },

    #[error("{message}")]
    Command { message: String },
}

impl ProvisionError {
    pub fn command(message: impl Into<String>) -> Self {
        ProvisionError::Command {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProvisionError::Timeout { .. })
    }
}

impl From<plf_common::Error> for ProvisionError {
    fn from(err: plf_common::Error) -> Self {
        match err {
            plf_common::Error::Timeout {
                description,
                seconds,
            } => ProvisionError::Timeout {
                what: description,
                seconds,
            },
            other => ProvisionError::command(other.to_string()),
        }
    }
}

/// Creates, inspects and deletes the local Kubernetes cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
    async fn create(&self, spec: &ClusterSpec) -> Result<ClusterHandle, ProvisionError>;

    /// Succeeds when the cluster does not exist.
    async fn delete(&self, name: &str) -> Result<(), ProvisionError>;

    async fn wait_ready(
        &self,
        name: &str,
        probe: ReadinessProbe,
        timeout: Duration,
    ) -> Result<(), ProvisionError>;

    async fn list(&self) -> Result<Vec<ClusterHandle>, ProvisionError>;
}

/// Whether a running cluster called `name` exists
pub async fn cluster_present(
    provisioner: &dyn ClusterProvisioner,
    name: &str,
) -> Result<bool, ProvisionError> {
    Ok(provisioner
        .list()
        .await?
        .iter()
        .any(|c| c.name == name && c.is_running()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stopped_cluster_is_not_present() {
        let mut provisioner = MockClusterProvisioner::new();
        provisioner.expect_list().returning(|| {
            Ok(vec![
                ClusterHandle { name: "polaris-dev".into(), servers_running: 0 },
                ClusterHandle { name: "other".into(), servers_running: 1 },
            ])
        });

        assert!(!cluster_present(&provisioner, "polaris-dev").await.unwrap());
        assert!(cluster_present(&provisioner, "other").await.unwrap());
        assert!(!cluster_present(&provisioner, "missing").await.unwrap());
    }

    #[test]
    fn common_timeout_maps_to_provision_timeout() {
        let err: ProvisionError = plf_common::Error::Timeout {
            description: "deployment polaris/polaris".into(),
            seconds: 300,
        }
        .into();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("polaris/polaris"));
    }
}
