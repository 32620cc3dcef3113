//! Container Runtime Module
//!
//! The container and volume control surface the rotator consumes.
//! `DockerCli` drives a real docker daemon; `MockRuntime` keeps the
//! whole topology in memory for tests.

mod docker;
pub mod mock;

pub use docker::DockerCli;
pub use mock::{MockRuntime, RuntimeEvent};

use std::collections::BTreeMap;
use std::fmt;

use crate::error::Result;

/// Lifecycle status reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerStatus {
    /// Parse the status string reported by `docker inspect`
    pub fn parse(s: &str) -> Self {
        match s {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A network a container is attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    /// Network name
    pub name: String,
    /// Runtime network id
    pub network_id: String,
}

/// Runtime view of a container
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub networks: Vec<NetworkAttachment>,
    pub labels: BTreeMap<String, String>,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }
}

/// Runtime view of a volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub mountpoint: Option<String>,
}

/// A volume or host path mounted into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Volume name or absolute host path
    pub source: String,
    /// Path inside the container
    pub target: String,
}

impl Mount {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }

    /// `source:target`, as accepted by `docker run -v`
    pub fn to_arg(&self) -> String {
        format!("{}:{}", self.source, self.target)
    }
}

/// Container port published on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
}

/// Everything needed to launch a container
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    /// Network name or id
    pub network: Option<String>,
    pub mounts: Vec<Mount>,
    pub entrypoint: Option<String>,
    /// Arguments passed after the image
    pub command: Vec<String>,
    pub ports: Vec<PortBinding>,
    /// Remove the container once it stops
    pub auto_remove: bool,
}

impl RunSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }
}

/// Result of a command run inside (or as) a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    /// Combined stdout and stderr
    pub output: String,
}

impl ExecOutput {
    pub fn new(exit_code: i64, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Selects running containers
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    /// Substring match on the container name
    pub name: Option<String>,
    /// `key=value` label match
    pub label: Option<(String, String)>,
}

impl ContainerFilter {
    pub fn by_name(pattern: impl Into<String>) -> Self {
        Self {
            name: Some(pattern.into()),
            label: None,
        }
    }

    pub fn by_label(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: None,
            label: Some((key.into(), value.into())),
        }
    }
}

/// Container and volume control surface
///
/// Lookups return `Error::NotFound` when the object does not exist so
/// callers can tell a miss from a runtime failure.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Running containers matching the filter
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerInfo>>;

    /// Look up one container by name or id
    async fn inspect_container(&self, name: &str) -> Result<ContainerInfo>;

    /// Start a container in the background and return its id
    async fn run_detached(&self, spec: &RunSpec) -> Result<String>;

    /// Run a container until it exits
    async fn run_to_completion(&self, spec: &RunSpec) -> Result<ExecOutput>;

    async fn stop_container(&self, name: &str) -> Result<()>;

    /// Block until the container has stopped, returning its exit code
    async fn wait_container(&self, name: &str) -> Result<i64>;

    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput>;

    async fn logs(&self, name: &str) -> Result<String>;

    async fn inspect_volume(&self, name: &str) -> Result<VolumeInfo>;

    /// Fails with `Error::VolumeInUse` while a container references it
    async fn remove_volume(&self, name: &str) -> Result<()>;

    async fn create_volume(&self, name: &str) -> Result<VolumeInfo>;
}
