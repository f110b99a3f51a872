//! Kubernetes helpers using kube-rs
//!
//! Readiness waits and server-side apply against the local cluster, without
//! shelling out to kubectl.

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Pod, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use plf_common::{wait_with_timeout, PollConfig};
use tracing::{debug, trace};

use crate::{Result, SetupError};

/// Field manager for server-side apply
const FIELD_MANAGER: &str = "plf";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from a kubeconfig file
pub async fn create_client(kubeconfig: &Path) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(kubeconfig).map_err(|e| {
        SetupError::command_failed(format!(
            "failed to read kubeconfig {}: {}",
            kubeconfig.display(),
            e
        ))
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| SetupError::command_failed(format!("failed to load kubeconfig: {}", e)))?;
    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);
    Ok(Client::try_from(config)?)
}

fn is_true(status: &str) -> bool {
    status == "True"
}

/// Wait for at least one node, and every node, to report Ready
pub async fn wait_for_nodes_ready(client: &Client, timeout: Duration) -> Result<()> {
    let nodes: Api<Node> = Api::all(client.clone());

    wait_with_timeout(&PollConfig::new(timeout), "cluster nodes ready", || {
        let nodes = nodes.clone();
        async move {
            let list = match nodes.list(&ListParams::default()).await {
                Ok(list) => list,
                // API server still starting
                Err(e) => {
                    trace!(error = %e, "node list failed, retrying");
                    return Ok(None);
                }
            };
            if list.items.is_empty() {
                return Ok(None);
            }
            let all_ready = list.items.iter().all(|node| {
                node.status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .is_some_and(|conds| {
                        conds.iter().any(|c| c.type_ == "Ready" && is_true(&c.status))
                    })
            });
            Ok(all_ready.then_some(()))
        }
    })
    .await?;
    Ok(())
}

/// Wait for a deployment's available replicas to reach its desired count.
///
/// A deployment that does not exist yet keeps the wait going.
pub async fn wait_for_deployment(
    client: &Client,
    name: &str,
    namespace: &str,
    timeout: Duration,
) -> Result<()> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let description = format!("deployment {}/{}", namespace, name);

    wait_with_timeout(&PollConfig::new(timeout), &description, || {
        let deployments = deployments.clone();
        let name = name.to_string();
        async move {
            match deployments.get_opt(&name).await {
                Ok(Some(deployment)) => {
                    let desired = deployment
                        .spec
                        .as_ref()
                        .and_then(|s| s.replicas)
                        .unwrap_or(1);
                    let available = deployment
                        .status
                        .as_ref()
                        .and_then(|s| s.available_replicas)
                        .unwrap_or(0);
                    debug!(deployment = %name, desired, available, "deployment progress");
                    Ok((available >= desired && desired > 0).then_some(()))
                }
                Ok(None) => {
                    trace!("Deployment {} not found yet", name);
                    Ok(None)
                }
                Err(e) => Err(format!("failed to get deployment {}: {}", name, e)),
            }
        }
    })
    .await?;
    Ok(())
}

/// Name and phase of every pod in `namespace` matching `selector`
pub async fn pod_phases(
    client: &Client,
    namespace: &str,
    selector: &str,
) -> Result<Vec<(String, String)>> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let list = pods.list(&ListParams::default().labels(selector)).await?;
    Ok(list
        .items
        .iter()
        .map(|pod| (pod.metadata.name.clone().unwrap_or_default(), pod_phase(pod)))
        .collect())
}

pub fn pod_phase(pod: &Pod) -> String {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Outcome of a finished job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
}

/// Current outcome of a job, `None` while it is still running or absent
pub async fn job_outcome(client: &Client, name: &str, namespace: &str) -> Result<Option<JobOutcome>> {
    let jobs: Api<Job> = Api::namespaced(client.clone(), namespace);
    let Some(job) = jobs.get_opt(name).await? else {
        return Ok(None);
    };
    let Some(status) = job.status.as_ref() else {
        return Ok(None);
    };
    if status.succeeded.unwrap_or(0) > 0 {
        return Ok(Some(JobOutcome::Succeeded));
    }
    let failed = status
        .conditions
        .as_ref()
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Failed" && is_true(&c.status)));
    Ok(failed.then_some(JobOutcome::Failed))
}

/// Wait for a job to finish, failing if it failed
pub async fn wait_for_job(client: &Client, name: &str, namespace: &str, timeout: Duration) -> Result<()> {
    let description = format!("job {}/{}", namespace, name);
    let outcome = wait_with_timeout(&PollConfig::new(timeout), &description, || async move {
        job_outcome(client, name, namespace)
            .await
            .map_err(|e| e.to_string())
    })
    .await?;

    match outcome {
        JobOutcome::Succeeded => Ok(()),
        JobOutcome::Failed => Err(SetupError::command_failed(format!("{} failed", description))),
    }
}

/// Delete a job and its pods, returning once the job object is gone
pub async fn delete_job(client: &Client, name: &str, namespace: &str, timeout: Duration) -> Result<()> {
    let jobs: Api<Job> = Api::namespaced(client.clone(), namespace);
    if jobs.get_opt(name).await?.is_none() {
        return Ok(());
    }
    jobs.delete(name, &DeleteParams::background()).await?;

    let description = format!("job {}/{} deleted", namespace, name);
    wait_with_timeout(&PollConfig::new(timeout), &description, || {
        let jobs = jobs.clone();
        async move {
            match jobs.get_opt(name).await {
                Ok(None) => Ok(Some(())),
                Ok(Some(_)) => Ok(None),
                Err(e) => Err(e.to_string()),
            }
        }
    })
    .await?;
    Ok(())
}

/// Read one key of a secret as UTF-8, `None` if the secret or key is absent
pub async fn get_secret_string(
    client: &Client,
    name: &str,
    namespace: &str,
    key: &str,
) -> Result<Option<String>> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let Some(secret) = secrets.get_opt(name).await? else {
        return Ok(None);
    };
    let value = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned());
    Ok(value)
}

/// Parsed identity of one manifest document
#[derive(Clone, Debug)]
pub struct ManifestMetadata {
    pub value: serde_json::Value,
    pub name: String,
    pub namespace: Option<String>,
    pub api_resource: ApiResource,
}

/// Parse apiVersion into (group, version)
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lowercase plural used in API paths
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y') {
        format!("{}ies", stem)
    } else {
        format!("{}s", lower)
    }
}

/// Parse a single YAML manifest document
pub fn parse_manifest(manifest: &str) -> Result<ManifestMetadata> {
    let value: serde_json::Value = serde_yaml::from_str(manifest)
        .map_err(|e| SetupError::validation(format!("failed to parse manifest: {}", e)))?;

    let field = |pointer: &str| value.pointer(pointer).and_then(|v| v.as_str()).map(str::to_string);
    let api_version = field("/apiVersion")
        .ok_or_else(|| SetupError::validation("manifest missing apiVersion"))?;
    let kind = field("/kind").ok_or_else(|| SetupError::validation("manifest missing kind"))?;
    let name = field("/metadata/name")
        .ok_or_else(|| SetupError::validation("manifest missing metadata.name"))?;
    let namespace = field("/metadata/namespace");

    let (group, version) = parse_api_version(&api_version);
    let api_resource = ApiResource {
        group,
        version,
        plural: pluralize_kind(&kind),
        kind,
        api_version,
    };

    Ok(ManifestMetadata {
        value,
        name,
        namespace,
        api_resource,
    })
}

/// Apply one manifest with server-side apply
pub async fn apply_manifest(client: &Client, manifest: &str) -> Result<()> {
    let metadata = parse_manifest(manifest)?;
    let api: Api<DynamicObject> = match &metadata.namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &metadata.api_resource),
        None => Api::all_with(client.clone(), &metadata.api_resource),
    };

    api.patch(
        &metadata.name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&metadata.value),
    )
    .await
    .map_err(|e| {
        SetupError::command_failed(format!(
            "failed to apply {}/{}: {}",
            metadata.api_resource.kind, metadata.name, e
        ))
    })?;
    debug!(kind = %metadata.api_resource.kind, name = %metadata.name, "applied");
    Ok(())
}

/// Apply a multi-document YAML manifest (documents separated by ---)
pub async fn apply_manifests(client: &Client, manifests: &str) -> Result<()> {
    for doc in split_documents(manifests) {
        apply_manifest(client, doc).await?;
    }
    Ok(())
}

/// Documents of a multi-document YAML stream that carry an apiVersion
pub fn split_documents(manifests: &str) -> impl Iterator<Item = &str> {
    manifests
        .split("\n---")
        .map(str::trim)
        .filter(|doc| doc.contains("apiVersion"))
}
