//! k3d-backed cluster provisioner
//!
//! Shells out to the `k3d` binary. Everything after the API server is up
//! goes through kube-rs.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use plf_common::fs::write_atomic;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::kube_utils;
use crate::provisioner::{ClusterHandle, ClusterProvisioner, ClusterSpec, ProvisionError, ReadinessProbe};

/// Path inside the server node where k3s auto-applies manifests
const AUTO_DEPLOY_DIR: &str = "/var/lib/rancher/k3s/server/manifests/plf";

/// Provisioner driving the `k3d` CLI
#[derive(Clone, Debug)]
pub struct K3dProvisioner {
    kubeconfig: PathBuf,
    runtime_env: Vec<(String, String)>,
}

impl K3dProvisioner {
    /// `kubeconfig` is where the cluster's kubeconfig is exported;
    /// `runtime_env` is passed to every k3d invocation.
    pub fn new(kubeconfig: impl Into<PathBuf>, runtime_env: Vec<(String, String)>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            runtime_env,
        }
    }

    fn k3d(&self) -> Command {
        let mut cmd = Command::new("k3d");
        cmd.envs(self.runtime_env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd
    }

    /// Write the cluster's kubeconfig to the configured path
    pub async fn export_kubeconfig(&self, name: &str) -> Result<(), ProvisionError> {
        let output = self
            .k3d()
            .args(["kubeconfig", "get", name])
            .output()
            .await
            .map_err(|e| ProvisionError::command(format!("failed to run k3d: {}", e)))?;

        if !output.status.success() {
            return Err(ProvisionError::command(format!(
                "k3d kubeconfig get failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        write_atomic(&self.kubeconfig, &output.stdout)?;
        debug!(path = %self.kubeconfig.display(), "exported kubeconfig");
        Ok(())
    }
}

/// Arguments for `k3d cluster create`
pub fn create_args(spec: &ClusterSpec) -> Vec<String> {
    let mut args = vec![
        "cluster".to_string(),
        "create".to_string(),
        spec.name.clone(),
        "--image".to_string(),
        format!("rancher/k3s:{}", spec.k3s_version),
        "--servers".to_string(),
        "1".to_string(),
        "--kubeconfig-update-default=false".to_string(),
        "--kubeconfig-switch-context=false".to_string(),
        "--wait".to_string(),
    ];
    for (host, container) in &spec.ports {
        args.push("--port".to_string());
        args.push(format!("{}:{}@loadbalancer", host, container));
    }
    if let Some(dir) = &spec.manifests_dir {
        args.push("--volume".to_string());
        args.push(format!("{}:{}@server:0", dir.display(), AUTO_DEPLOY_DIR));
    }
    args
}

/// Map `k3d cluster create` stderr to a typed failure
pub fn classify_create_failure(name: &str, stderr: &str) -> ProvisionError {
    let lower = stderr.to_lowercase();
    if lower.contains("already exists") && lower.contains("cluster") {
        ProvisionError::AlreadyExists {
            name: name.to_string(),
        }
    } else if lower.contains("port is already allocated")
        || lower.contains("address already in use")
        || lower.contains("bind: address")
    {
        ProvisionError::PortConflict {
            message: stderr.trim().to_string(),
        }
    } else if lower.contains("already in use by container")
        || lower.contains("network with name")
        || (lower.contains("volume") && lower.contains("already exists"))
    {
        ProvisionError::GhostResource {
            message: stderr.trim().to_string(),
        }
    } else {
        ProvisionError::command(format!("k3d cluster create failed: {}", stderr.trim()))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct K3dCluster {
    name: String,
    #[serde(default)]
    servers_running: u32,
}

/// Parse `k3d cluster list -o json`
pub fn parse_cluster_list(json: &str) -> Result<Vec<ClusterHandle>, ProvisionError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let clusters: Vec<K3dCluster> = serde_json::from_str(json)
        .map_err(|e| ProvisionError::command(format!("unexpected k3d cluster list output: {}", e)))?;
    Ok(clusters
        .into_iter()
        .map(|c| ClusterHandle {
            name: c.name,
            servers_running: c.servers_running,
        })
        .collect())
}

#[async_trait]
impl ClusterProvisioner for K3dProvisioner {
    async fn create(&self, spec: &ClusterSpec) -> Result<ClusterHandle, ProvisionError> {
        if self.list().await?.iter().any(|c| c.name == spec.name) {
            return Err(ProvisionError::AlreadyExists {
                name: spec.name.clone(),
            });
        }

        info!("Creating k3d cluster: {}", spec.name);
        let output = self
            .k3d()
            .args(create_args(spec))
            .output()
            .await
            .map_err(|e| ProvisionError::command(format!("failed to run k3d: {}", e)))?;

        if !output.status.success() {
            return Err(classify_create_failure(
                &spec.name,
                &String::from_utf8_lossy(&output.stderr),
            ));
        }

        Ok(ClusterHandle {
            name: spec.name.clone(),
            servers_running: 1,
        })
    }

    async fn delete(&self, name: &str) -> Result<(), ProvisionError> {
        if !self.list().await?.iter().any(|c| c.name == name) {
            debug!(cluster = name, "cluster already absent");
            return Ok(());
        }

        info!("Deleting k3d cluster: {}", name);
        let output = self
            .k3d()
            .args(["cluster", "delete", name])
            .output()
            .await
            .map_err(|e| ProvisionError::command(format!("failed to run k3d: {}", e)))?;

        if !output.status.success() {
            return Err(ProvisionError::command(format!(
                "k3d cluster delete failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn wait_ready(
        &self,
        name: &str,
        probe: ReadinessProbe,
        timeout: Duration,
    ) -> Result<(), ProvisionError> {
        if probe == ReadinessProbe::ApiServer || !self.kubeconfig.exists() {
            self.export_kubeconfig(name).await?;
        }
        let client = kube_utils::create_client(&self.kubeconfig)
            .await
            .map_err(|e| ProvisionError::command(e.to_string()))?;

        info!("Waiting for {} (timeout {}s)", probe, timeout.as_secs());
        let result = match probe.deployment() {
            None => kube_utils::wait_for_nodes_ready(&client, timeout).await,
            Some((namespace, deployment)) => {
                kube_utils::wait_for_deployment(&client, deployment, namespace, timeout).await
            }
        };

        result.map_err(|e| match e {
            crate::SetupError::Common(common) => ProvisionError::from(common),
            other => ProvisionError::command(other.to_string()),
        })
    }

    async fn list(&self) -> Result<Vec<ClusterHandle>, ProvisionError> {
        let output = self
            .k3d()
            .args(["cluster", "list", "-o", "json"])
            .output()
            .await
            .map_err(|e| ProvisionError::command(format!("failed to run k3d: {}", e)))?;

        if !output.status.success() {
            return Err(ProvisionError::command(format!(
                "k3d cluster list failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        parse_cluster_list(&String::from_utf8_lossy(&output.stdout))
    }
}
