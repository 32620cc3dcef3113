//! Docker CLI runtime
//!
//! Drives the local docker daemon through the `docker` binary.

use std::collections::BTreeMap;
use std::process::Output;

use serde::Deserialize;
use tokio::process::Command;

use super::{
    ContainerFilter, ContainerInfo, ContainerRuntime, ContainerStatus, ExecOutput,
    NetworkAttachment, RunSpec, VolumeInfo,
};
use crate::error::{Error, Result};

/// Container runtime backed by the docker CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn output(&self, args: &[String]) -> Result<Output> {
        tracing::trace!("{} {}", self.binary, args.join(" "));
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Runtime(format!("failed to spawn {}: {}", self.binary, e)))?;
        Ok(output)
    }

    /// Run a docker command that must succeed, returning its stdout
    async fn checked(&self, args: &[String], subject: &str) -> Result<String> {
        let output = self.output(args).await?;
        if !output.status.success() {
            return Err(classify_failure(
                &String::from_utf8_lossy(&output.stderr),
                subject,
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run_args(spec: &RunSpec, detach: bool) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        if detach {
            args.push("--detach".into());
        }
        if spec.auto_remove {
            args.push("--rm".into());
        }
        args.push("--name".into());
        args.push(spec.name.clone());
        if let Some(network) = &spec.network {
            args.push("--network".into());
            args.push(network.clone());
        }
        for mount in &spec.mounts {
            args.push("--volume".into());
            args.push(mount.to_arg());
        }
        for port in &spec.ports {
            args.push("--publish".into());
            args.push(format!("{}:{}", port.host_port, port.container_port));
        }
        if let Some(entrypoint) = &spec.entrypoint {
            args.push("--entrypoint".into());
            args.push(entrypoint.clone());
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

/// Map docker's stderr onto the error taxonomy
fn classify_failure(stderr: &str, subject: &str) -> Error {
    let lower = stderr.to_lowercase();
    if lower.contains("no such container")
        || lower.contains("no such object")
        || lower.contains("no such volume")
    {
        Error::NotFound(subject.to_string())
    } else if lower.contains("volume is in use") {
        Error::VolumeInUse(subject.to_string())
    } else if lower.contains("is not running") {
        Error::NotRunning {
            name: subject.to_string(),
            status: "not running".to_string(),
        }
    } else {
        Error::Runtime(format!("{}: {}", subject, stderr.trim()))
    }
}

fn combined(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}

// ============ docker inspect JSON ============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectContainer {
    id: String,
    name: String,
    state: InspectState,
    #[serde(default)]
    config: Option<InspectConfig>,
    #[serde(default)]
    network_settings: Option<InspectNetworkSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    #[serde(default)]
    networks: Option<BTreeMap<String, InspectNetwork>>,
}

#[derive(Debug, Deserialize)]
struct InspectNetwork {
    #[serde(rename = "NetworkID", default)]
    network_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectVolume {
    name: String,
    #[serde(default)]
    mountpoint: Option<String>,
}

impl From<InspectContainer> for ContainerInfo {
    fn from(raw: InspectContainer) -> Self {
        let networks = raw
            .network_settings
            .and_then(|s| s.networks)
            .unwrap_or_default()
            .into_iter()
            .map(|(name, net)| NetworkAttachment {
                name,
                network_id: net.network_id,
            })
            .collect();

        ContainerInfo {
            id: raw.id,
            name: raw.name.trim_start_matches('/').to_string(),
            status: ContainerStatus::parse(&raw.state.status),
            networks,
            labels: raw.config.and_then(|c| c.labels).unwrap_or_default(),
        }
    }
}

pub(crate) fn parse_inspect_containers(json: &str) -> Result<Vec<ContainerInfo>> {
    let raw: Vec<InspectContainer> = serde_json::from_str(json)?;
    Ok(raw.into_iter().map(ContainerInfo::from).collect())
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerCli {
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerInfo>> {
        let mut args = vec!["ps".to_string(), "--quiet".into(), "--no-trunc".into()];
        if let Some(name) = &filter.name {
            args.push("--filter".into());
            args.push(format!("name={}", name));
        }
        if let Some((key, value)) = &filter.label {
            args.push("--filter".into());
            args.push(format!("label={}={}", key, value));
        }

        let ids: Vec<String> = self
            .checked(&args, "docker ps")
            .await?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec!["inspect".to_string(), "--type".into(), "container".into()];
        args.extend(ids);
        let json = self.checked(&args, "docker inspect").await?;
        parse_inspect_containers(&json)
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerInfo> {
        let args = vec![
            "inspect".to_string(),
            "--type".into(),
            "container".into(),
            name.to_string(),
        ];
        let json = self.checked(&args, name).await?;
        parse_inspect_containers(&json)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    async fn run_detached(&self, spec: &RunSpec) -> Result<String> {
        let args = Self::run_args(spec, true);
        let id = self.checked(&args, &spec.name).await?;
        Ok(id.trim().to_string())
    }

    async fn run_to_completion(&self, spec: &RunSpec) -> Result<ExecOutput> {
        let args = Self::run_args(spec, false);
        let output = self.output(&args).await?;
        // `docker run` mirrors the container's exit status
        let exit_code = output.status.code().map(i64::from).unwrap_or(-1);
        Ok(ExecOutput::new(exit_code, combined(&output)))
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        self.checked(&["stop".to_string(), name.to_string()], name)
            .await?;
        Ok(())
    }

    async fn wait_container(&self, name: &str) -> Result<i64> {
        let out = self
            .checked(&["wait".to_string(), name.to_string()], name)
            .await?;
        Ok(out.trim().parse().unwrap_or(0))
    }

    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput> {
        let mut args = vec!["exec".to_string(), name.to_string()];
        args.extend(command.iter().cloned());
        let output = self.output(&args).await?;
        let text = combined(&output);
        let exit_code = output.status.code().map(i64::from).unwrap_or(-1);

        // Daemon-side failures never reach the command inside the container
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("Error response from daemon") {
                return Err(classify_failure(&stderr, name));
            }
        }

        Ok(ExecOutput::new(exit_code, text))
    }

    async fn logs(&self, name: &str) -> Result<String> {
        let output = self
            .output(&["logs".to_string(), name.to_string()])
            .await?;
        if !output.status.success() {
            return Err(classify_failure(
                &String::from_utf8_lossy(&output.stderr),
                name,
            ));
        }
        Ok(combined(&output))
    }

    async fn inspect_volume(&self, name: &str) -> Result<VolumeInfo> {
        let args = vec!["volume".to_string(), "inspect".into(), name.to_string()];
        let json = self.checked(&args, name).await?;
        let raw: Vec<InspectVolume> = serde_json::from_str(&json)?;
        raw.into_iter()
            .next()
            .map(|v| VolumeInfo {
                name: v.name,
                mountpoint: v.mountpoint,
            })
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let args = vec!["volume".to_string(), "rm".into(), name.to_string()];
        self.checked(&args, name).await?;
        Ok(())
    }

    async fn create_volume(&self, name: &str) -> Result<VolumeInfo> {
        let args = vec!["volume".to_string(), "create".into(), name.to_string()];
        self.checked(&args, name).await?;
        self.inspect_volume(name).await
    }
}
