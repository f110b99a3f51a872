//! Container runtime selection

use std::fmt;
use std::str::FromStr;

use tokio::process::Command;
use tracing::debug;

use crate::doctor::HostProbe;
use crate::{CommandErrorExt, Result, SetupError};

/// Engine hosting the k3d node containers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerRuntime {
    Docker,
    Podman,
}

impl ContainerRuntime {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
        }
    }

    /// Whether the runtime's daemon answers
    pub async fn is_available(self) -> bool {
        Command::new(self.as_str())
            .arg("info")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Pick a runtime: explicit choice, then the first one that responds.
    pub async fn detect(preferred: Option<&str>) -> Result<Self> {
        if let Some(name) = preferred.filter(|s| !s.is_empty()) {
            let runtime: ContainerRuntime = name.parse()?;
            debug!(runtime = runtime.as_str(), "using configured container runtime");
            return Ok(runtime);
        }
        for runtime in [ContainerRuntime::Docker, ContainerRuntime::Podman] {
            if runtime.is_available().await {
                debug!(runtime = runtime.as_str(), "detected container runtime");
                return Ok(runtime);
            }
        }
        Err(SetupError::validation(
            "no container runtime found; start Docker or Podman, or pass --runtime",
        ))
    }

    /// Extra environment k3d needs to reach the runtime
    pub async fn k3d_env(self) -> Result<Vec<(String, String)>> {
        match self {
            ContainerRuntime::Docker => Ok(Vec::new()),
            ContainerRuntime::Podman => {
                let output = Command::new("podman")
                    .args(["info", "--format", "{{.Host.RemoteSocket.Path}}"])
                    .output()
                    .await
                    .cmd_err()?;
                if !output.status.success() {
                    return Err(SetupError::command_failed(format!(
                        "podman info failed: {}",
                        String::from_utf8_lossy(&output.stderr)
                    )));
                }
                let socket = String::from_utf8_lossy(&output.stdout).trim().to_string();
                Ok(vec![("DOCKER_HOST".to_string(), format!("unix://{}", socket))])
            }
        }
    }
}

/// What runtime detection found
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Detection {
    Found {
        runtime: ContainerRuntime,
        reason: String,
    },
    /// Both runtimes installed, neither running
    Choice { reason: String },
    Missing { reason: String },
}

impl Detection {
    pub fn runtime(&self) -> Option<ContainerRuntime> {
        match self {
            Detection::Found { runtime, .. } => Some(*runtime),
            _ => None,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Detection::Found { reason, .. }
            | Detection::Choice { reason }
            | Detection::Missing { reason } => reason,
        }
    }

    /// `found`, `choice` or `missing`
    pub fn status(&self) -> &'static str {
        match self {
            Detection::Found { .. } => "found",
            Detection::Choice { .. } => "choice",
            Detection::Missing { .. } => "missing",
        }
    }

    /// 0 when a runtime was picked, 2 when the operator must choose, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        match self {
            Detection::Found { .. } => 0,
            Detection::Choice { .. } => 2,
            Detection::Missing { .. } => 1,
        }
    }
}

/// Survey the host: a running runtime wins over an installed one, and
/// Docker wins a tie.
pub async fn survey(probe: &dyn HostProbe) -> Detection {
    let docker_running = probe.runtime_running(ContainerRuntime::Docker).await;
    let podman_running = probe.runtime_running(ContainerRuntime::Podman).await;
    let found = |runtime: ContainerRuntime, reason: &str| Detection::Found {
        runtime,
        reason: reason.to_string(),
    };

    match (docker_running, podman_running) {
        (true, true) => {
            return found(
                ContainerRuntime::Docker,
                "Docker and Podman are both running; using Docker",
            )
        }
        (true, false) => return found(ContainerRuntime::Docker, "Docker is running"),
        (false, true) => return found(ContainerRuntime::Podman, "Podman is running"),
        (false, false) => {}
    }

    match (probe.on_path("docker"), probe.on_path("podman")) {
        (true, true) => Detection::Choice {
            reason: "Docker and Podman are installed but neither is running".to_string(),
        },
        (true, false) => found(ContainerRuntime::Docker, "Docker is installed but not running"),
        (false, true) => found(ContainerRuntime::Podman, "Podman is installed but not running"),
        (false, false) => Detection::Missing {
            reason: "no container runtime found; install Docker or Podman".to_string(),
        },
    }
}

impl FromStr for ContainerRuntime {
    type Err = SetupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(ContainerRuntime::Docker),
            "podman" => Ok(ContainerRuntime::Podman),
            other => Err(SetupError::validation(format!(
                "unknown container runtime '{}': expected docker or podman",
                other
            ))),
        }
    }
}

impl fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
