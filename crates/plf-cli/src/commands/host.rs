//! Host and cluster inspection: doctor, runtime, cluster
//!
//! Usage: plf doctor [--fix] [--output json]
//!        plf runtime detect [--json] | plf runtime docker-host
//!        plf cluster list|status [--output json]

use clap::{Args, Subcommand, ValueEnum};
use plf_setup::kube_utils::{create_client, pod_phases};
use plf_setup::runtime::{survey, ContainerRuntime};
use plf_setup::{diagnose, ClusterHandle, ClusterProvisioner, DoctorSpec, SystemProbe};
use serde_json::json;
use tracing::debug;

use super::format::print_table;
use super::{CommandErrorExt, Context, Operation};
use crate::Result;

/// Output format for inspection commands
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable (default)
    #[default]
    Text,
    /// JSON
    Json,
}

/// Check that the host can run the local environment
#[derive(Args, Debug, Clone)]
pub struct DoctorArgs {
    /// Delete a stopped cluster left over from an earlier run
    #[arg(long)]
    pub fix: bool,

    #[arg(short = 'o', long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,
}

#[derive(Args, Debug, Clone)]
pub struct RuntimeArgs {
    #[command(subcommand)]
    pub command: RuntimeCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum RuntimeCommand {
    /// Detect the container runtime (exit 0 found, 2 choose one, 1 none)
    Detect {
        #[arg(long)]
        json: bool,
    },
    /// Print the DOCKER_HOST k3d needs, if any
    DockerHost,
}

#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    #[command(subcommand)]
    pub command: ClusterCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ClusterCommand {
    /// List k3d clusters
    List {
        #[arg(short = 'o', long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },
    /// Show the project cluster and its service pods (exit 1 when absent)
    Status {
        #[arg(short = 'o', long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },
}

impl DoctorArgs {
    pub fn apply(self, _ctx: &mut Context) -> Operation {
        Operation::Doctor {
            fix: self.fix,
            output: self.output,
        }
    }
}

impl RuntimeArgs {
    pub fn apply(self, _ctx: &mut Context) -> Operation {
        match self.command {
            RuntimeCommand::Detect { json } => Operation::RuntimeDetect { json },
            RuntimeCommand::DockerHost => Operation::DockerHost,
        }
    }
}

impl ClusterArgs {
    pub fn apply(self, _ctx: &mut Context) -> Operation {
        match self.command {
            ClusterCommand::List { output } => Operation::ClusterList { output },
            ClusterCommand::Status { output } => Operation::ClusterStatus { output },
        }
    }
}

/// Service pods reported by `cluster status`: (component, namespace, selector)
const COMPONENTS: [(&str, &str, &str); 3] = [
    ("rustfs", "rustfs", "app=rustfs"),
    ("postgresql", "polaris", "app=postgresql"),
    ("polaris", "polaris", "app.kubernetes.io/name=polaris"),
];

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).cmd_err()?);
    Ok(())
}

/// Cluster state word used by `cluster status`
pub fn cluster_state(cluster: Option<&ClusterHandle>) -> &'static str {
    match cluster {
        None => "not_found",
        Some(c) if c.is_running() => "running",
        Some(_) => "stopped",
    }
}

// =============================================================================
// Commands
// =============================================================================

pub async fn doctor(ctx: &Context, fix: bool, output: OutputFormat) -> Result<i32> {
    let s = &ctx.settings;
    let runtime = s
        .container_runtime
        .as_deref()
        .map(str::parse::<ContainerRuntime>)
        .transpose()?;
    let env = match runtime {
        Some(runtime) => runtime.k3d_env().await.unwrap_or_default(),
        None => Vec::new(),
    };
    let provisioner = ctx.provisioner(env);
    let spec = DoctorSpec {
        runtime,
        cluster_name: s.cluster_name.clone(),
        ports: s.published_ports(),
        fix,
    };

    let report = diagnose(&SystemProbe, &provisioner, &spec).await;
    match output {
        OutputFormat::Json => println!("{}", report.to_json()?),
        OutputFormat::Text => print!("{}", report.render_text()),
    }
    Ok(report.exit_code())
}

pub async fn runtime_detect(json: bool) -> Result<i32> {
    let detection = survey(&SystemProbe).await;
    debug!(status = detection.status(), reason = detection.reason(), "runtime detection");
    if json {
        print_json(&json!({
            "status": detection.status(),
            "runtime": detection.runtime().map(ContainerRuntime::as_str),
            "reason": detection.reason(),
        }))?;
    } else {
        match detection.runtime() {
            Some(runtime) => println!("{}", runtime),
            None => eprintln!("{}", detection.reason()),
        }
    }
    Ok(detection.exit_code())
}

pub async fn docker_host(ctx: &Context) -> Result<i32> {
    let runtime = ctx.runtime(None).await?;
    let env = runtime.k3d_env().await?;
    if let Some((_, host)) = env.iter().find(|(key, _)| key == "DOCKER_HOST") {
        println!("{}", host);
    }
    Ok(0)
}

pub async fn cluster_list(ctx: &Context, output: OutputFormat) -> Result<i32> {
    let clusters = ctx.cluster_provisioner(None).await?.list().await.cmd_err()?;
    match output {
        OutputFormat::Json => {
            let items: Vec<serde_json::Value> = clusters
                .iter()
                .map(|c| {
                    json!({
                        "name": c.name,
                        "servers_running": c.servers_running,
                        "state": cluster_state(Some(c)),
                    })
                })
                .collect();
            print_json(&serde_json::Value::Array(items))?;
        }
        OutputFormat::Text if clusters.is_empty() => println!("No clusters found"),
        OutputFormat::Text => {
            let rows: Vec<Vec<String>> = clusters
                .iter()
                .map(|c| {
                    vec![
                        c.name.clone(),
                        cluster_state(Some(c)).to_string(),
                        c.servers_running.to_string(),
                    ]
                })
                .collect();
            print_table(&["NAME", "STATE", "SERVERS RUNNING"], &rows);
        }
    }
    Ok(0)
}

pub async fn cluster_status(ctx: &Context, output: OutputFormat) -> Result<i32> {
    let name = &ctx.settings.cluster_name;
    let clusters = ctx.cluster_provisioner(None).await?.list().await.cmd_err()?;
    let cluster = clusters.iter().find(|c| &c.name == name);
    let state = cluster_state(cluster);

    let mut pods = Vec::new();
    if state == "running" {
        let client = create_client(&ctx.settings.kubeconfig()).await?;
        for (component, namespace, selector) in COMPONENTS {
            for (pod, phase) in pod_phases(&client, namespace, selector).await? {
                pods.push((component, pod, phase));
            }
        }
    }

    match output {
        OutputFormat::Json => {
            let items: Vec<serde_json::Value> = pods
                .iter()
                .map(|(component, pod, phase)| {
                    json!({ "component": component, "name": pod, "phase": phase })
                })
                .collect();
            print_json(&json!({ "cluster": name, "state": state, "pods": items }))?;
        }
        OutputFormat::Text => {
            println!("Cluster {}: {}", name, state);
            if !pods.is_empty() {
                println!();
                let rows: Vec<Vec<String>> = pods
                    .iter()
                    .map(|(component, pod, phase)| {
                        vec![component.to_string(), pod.clone(), phase.clone()]
                    })
                    .collect();
                print_table(&["COMPONENT", "POD", "PHASE"], &rows);
            }
        }
    }
    Ok(if cluster.is_some() { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_states() {
        let running = ClusterHandle {
            name: "polaris-dev".into(),
            servers_running: 1,
        };
        let stopped = ClusterHandle {
            servers_running: 0,
            ..running.clone()
        };
        assert_eq!(cluster_state(None), "not_found");
        assert_eq!(cluster_state(Some(&running)), "running");
        assert_eq!(cluster_state(Some(&stopped)), "stopped");
    }
}
