//! Host prerequisites check
//!
//! [`diagnose`] inspects the host through a [`HostProbe`] and the cluster
//! provisioner and collects one [`Check`] per prerequisite. Every failed
//! check adds an issue; a report with no issues means setup can start.

use std::ffi::OsStr;
use std::path::PathBuf;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::provisioner::ClusterProvisioner;
use crate::runtime::{survey, ContainerRuntime, Detection};
use crate::{Result, SetupError};

/// Tools the local environment shells out to besides the container runtime
const REQUIRED_TOOLS: [&str; 2] = ["k3d", "kubectl"];

/// Facts about the host the checks depend on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostProbe: Send + Sync {
    /// Whether `tool` resolves to a file on `PATH`
    fn on_path(&self, tool: &str) -> bool;

    /// Whether the runtime's daemon answers
    async fn runtime_running(&self, runtime: ContainerRuntime) -> bool;

    /// Whether a local listener can bind `port`
    async fn port_free(&self, port: u16) -> bool;
}

/// The real host
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemProbe;

#[async_trait]
impl HostProbe for SystemProbe {
    fn on_path(&self, tool: &str) -> bool {
        find_on_path(tool, std::env::var_os("PATH").as_deref()).is_some()
    }

    async fn runtime_running(&self, runtime: ContainerRuntime) -> bool {
        runtime.is_available().await
    }

    async fn port_free(&self, port: u16) -> bool {
        tokio::net::TcpListener::bind(("127.0.0.1", port)).await.is_ok()
    }
}

/// First file named `tool` in the directories of `path`
pub fn find_on_path(tool: &str, path: Option<&OsStr>) -> Option<PathBuf> {
    std::env::split_paths(path?)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
}

/// What to check
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DoctorSpec {
    /// Configured runtime; `None` surveys the host
    pub runtime: Option<ContainerRuntime>,
    pub cluster_name: String,
    /// Host ports the cluster publishes, with what listens on them
    pub ports: Vec<(u16, String)>,
    /// Delete a stopped cluster instead of reporting it
    pub fix: bool,
}

/// One prerequisite
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Check {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

/// Outcome of [`diagnose`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DoctorReport {
    pub checks: Vec<Check>,
    pub issues: Vec<String>,
}

impl DoctorReport {
    fn pass(&mut self, name: impl Into<String>, detail: impl Into<String>) {
        self.checks.push(Check {
            name: name.into(),
            ok: true,
            detail: detail.into(),
        });
    }

    fn fail(
        &mut self,
        name: impl Into<String>,
        detail: impl Into<String>,
        issue: impl Into<String>,
    ) {
        self.checks.push(Check {
            name: name.into(),
            ok: false,
            detail: detail.into(),
        });
        self.issues.push(issue.into());
    }

    pub fn ok(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn exit_code(&self) -> i32 {
        if self.ok() {
            0
        } else {
            1
        }
    }

    pub fn to_json(&self) -> Result<String> {
        let value = serde_json::json!({
            "checks": self.checks,
            "issues": self.issues,
            "ok": self.ok(),
        });
        serde_json::to_string_pretty(&value).map_err(|e| {
            SetupError::command_failed(format!("failed to encode doctor report: {}", e))
        })
    }

    pub fn render_text(&self) -> String {
        let mut out = String::from("Environment check\n");
        for check in &self.checks {
            let status = if check.ok { "OK" } else { "FAIL" };
            out.push_str(&format!("  [{}] {}", status, check.name));
            if !check.detail.is_empty() {
                out.push_str(&format!(" ({})", check.detail));
            }
            out.push('\n');
        }
        if self.ok() {
            out.push_str("\nAll checks passed\n");
        } else {
            out.push_str("\nIssues:\n");
            for issue in &self.issues {
                out.push_str(&format!("  - {}\n", issue));
            }
        }
        out
    }
}

/// Run every check against the host.
pub async fn diagnose(
    probe: &dyn HostProbe,
    provisioner: &dyn ClusterProvisioner,
    spec: &DoctorSpec,
) -> DoctorReport {
    let mut report = DoctorReport::default();

    let runtime = match spec.runtime {
        Some(runtime) => Some(runtime),
        None => match survey(probe).await {
            Detection::Found { runtime, .. } => Some(runtime),
            other => {
                report.fail(
                    "runtime",
                    other.status(),
                    format!("{}; set PLF_CONTAINER_RUNTIME in .env", other.reason()),
                );
                None
            }
        },
    };

    let mut tools: Vec<&str> = runtime.map(ContainerRuntime::as_str).into_iter().collect();
    tools.extend(REQUIRED_TOOLS);
    for tool in tools {
        if probe.on_path(tool) {
            report.pass(format!("tool:{}", tool), "found");
        } else {
            report.fail(
                format!("tool:{}", tool),
                "not on PATH",
                format!("{} is not installed or not on PATH", tool),
            );
        }
    }

    if let Some(runtime) = runtime {
        if probe.runtime_running(runtime).await {
            report.pass(format!("runtime:{}", runtime), "running");
        } else {
            let start = match runtime {
                ContainerRuntime::Docker => "start Docker",
                ContainerRuntime::Podman => "run podman machine start",
            };
            report.fail(
                format!("runtime:{}", runtime),
                "not running",
                format!("{} is installed but not running; {}", runtime, start),
            );
        }
    }

    let cluster_running = check_cluster(&mut report, provisioner, spec).await;

    for (port, service) in &spec.ports {
        let name = format!("port:{}", port);
        if cluster_running {
            report.pass(name, format!("{}, published by the cluster", service));
        } else if probe.port_free(*port).await {
            report.pass(name, service.clone());
        } else {
            report.fail(
                name,
                format!("{}, in use", service),
                format!("port {} ({}) is in use by another process", port, service),
            );
        }
    }

    debug!(checks = report.checks.len(), issues = report.issues.len(), "doctor finished");
    report
}

/// Record the cluster check; true when the cluster is up.
async fn check_cluster(
    report: &mut DoctorReport,
    provisioner: &dyn ClusterProvisioner,
    spec: &DoctorSpec,
) -> bool {
    let name = format!("cluster:{}", spec.cluster_name);
    let clusters = match provisioner.list().await {
        Ok(clusters) => clusters,
        Err(e) => {
            report.fail(name, "unknown", format!("could not list clusters: {}", e));
            return false;
        }
    };

    match clusters.iter().find(|c| c.name == spec.cluster_name) {
        None => {
            report.pass(name, "not created");
            false
        }
        Some(cluster) if cluster.is_running() => {
            report.pass(name, "running");
            true
        }
        Some(_) if spec.fix => match provisioner.delete(&spec.cluster_name).await {
            Ok(()) => {
                info!(cluster = %spec.cluster_name, "deleted stopped cluster");
                report.pass(name, "stopped cluster deleted");
                false
            }
            Err(e) => {
                warn!(cluster = %spec.cluster_name, error = %e, "failed to delete stopped cluster");
                report.fail(
                    name,
                    "stopped",
                    format!("failed to delete stopped cluster {}: {}", spec.cluster_name, e),
                );
                false
            }
        },
        Some(_) => {
            report.fail(
                name,
                "stopped",
                format!(
                    "cluster {} exists but no server is running; run plf doctor --fix or k3d cluster delete {}",
                    spec.cluster_name, spec.cluster_name
                ),
            );
            false
        }
    }
}
