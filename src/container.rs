//! Container Controller
//!
//! Thin fail-fast facade over the container runtime: lookups,
//! stop-and-wait, exec, and data copies between volumes.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::runtime::{ContainerFilter, ContainerInfo, ContainerRuntime, ExecOutput, Mount, RunSpec};
use crate::volume::Volume;

/// Settings for the disposable copy helper
#[derive(Debug, Clone)]
pub struct CopyHelper {
    pub image: String,
    pub name: String,
}

impl Default for CopyHelper {
    fn default() -> Self {
        Self {
            image: "busybox:latest".to_string(),
            name: "copy-data".to_string(),
        }
    }
}

/// Facade over the container runtime
#[derive(Clone)]
pub struct ContainerController {
    runtime: Arc<dyn ContainerRuntime>,
    primary_pattern: String,
    /// When set, the primary is located by label instead of name
    primary_label: Option<(String, String)>,
    copy_helper: CopyHelper,
}

impl ContainerController {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, primary_pattern: impl Into<String>) -> Self {
        Self {
            runtime,
            primary_pattern: primary_pattern.into(),
            primary_label: None,
            copy_helper: CopyHelper::default(),
        }
    }

    pub fn with_primary_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.primary_label = Some((key.into(), value.into()));
        self
    }

    pub fn with_copy_helper(mut self, copy_helper: CopyHelper) -> Self {
        self.copy_helper = copy_helper;
        self
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Running containers whose name contains `pattern`
    pub async fn find_by_name_pattern(&self, pattern: &str) -> Result<Vec<ContainerInfo>> {
        self.runtime
            .list_containers(&ContainerFilter::by_name(pattern))
            .await
    }

    /// Running containers carrying the label `key=value`
    pub async fn find_by_label(&self, key: &str, value: &str) -> Result<Vec<ContainerInfo>> {
        self.runtime
            .list_containers(&ContainerFilter::by_label(key, value))
            .await
    }

    /// Exactly one running container matching `pattern`
    pub async fn find_one(&self, pattern: &str) -> Result<ContainerInfo> {
        single(self.find_by_name_pattern(pattern).await?, pattern)
    }

    pub fn require_running(container: &ContainerInfo) -> Result<()> {
        if container.is_running() {
            Ok(())
        } else {
            Err(Error::NotRunning {
                name: container.name.clone(),
                status: container.status.to_string(),
            })
        }
    }

    /// Locate the primary and check it is running
    pub async fn find_primary(&self) -> Result<ContainerInfo> {
        let primary = match &self.primary_label {
            Some((key, value)) => single(
                self.find_by_label(key, value).await?,
                &format!("{}={}", key, value),
            )?,
            None => self.find_one(&self.primary_pattern).await?,
        };
        Self::require_running(&primary)?;
        Ok(primary)
    }

    /// Look up a container by exact name, `None` if it does not exist
    pub async fn get(&self, name: &str) -> Result<Option<ContainerInfo>> {
        match self.runtime.inspect_container(name).await {
            Ok(c) => Ok(Some(c)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Stop a container and block until it is gone.
    ///
    /// Returns `false` when nothing by that name exists. A container that
    /// auto-removes between stop and wait counts as stopped.
    pub async fn stop_and_wait(&self, name: &str) -> Result<bool> {
        if self.get(name).await?.is_none() {
            tracing::debug!("{} does not exist, nothing to stop", name);
            return Ok(false);
        }

        tracing::info!("Stopping {}", name);
        match self.runtime.stop_container(name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(true),
            Err(e) => return Err(e),
        }

        match self.runtime.wait_container(name).await {
            Ok(code) => tracing::debug!("{} exited with {}", name, code),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        Ok(true)
    }

    /// `stop_and_wait` over several names
    pub async fn ensure_stopped(&self, names: &[String]) -> Result<()> {
        for name in names {
            self.stop_and_wait(name).await?;
        }
        Ok(())
    }

    pub async fn exec_in_container(&self, name: &str, command: &[String]) -> Result<ExecOutput> {
        tracing::debug!("exec in {}: {:?}", name, command);
        self.runtime.exec(name, command).await
    }

    pub async fn logs(&self, name: &str) -> Result<String> {
        self.runtime.logs(name).await
    }

    pub async fn run_detached(&self, spec: &RunSpec) -> Result<String> {
        tracing::info!("Starting {} ({})", spec.name, spec.image);
        self.runtime.run_detached(spec).await
    }

    /// Full recursive copy of `src` into `dest` through a disposable
    /// helper container. `dest` is expected to be empty.
    pub async fn copy_volume_data(&self, src: &Volume, dest: &Volume) -> Result<()> {
        let mut spec = RunSpec::new(&self.copy_helper.name, &self.copy_helper.image);
        spec.auto_remove = true;
        spec.mounts = vec![
            Mount::new(src.name(), "/src/"),
            Mount::new(dest.name(), "/dest/"),
        ];
        spec.command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "cd /src; tar cf - . | (cd /dest; tar xvf -)".to_string(),
        ];

        tracing::info!("Copying {} into {}", src, dest);
        let out = self.runtime.run_to_completion(&spec).await?;
        if !out.success() {
            tracing::error!("Copy helper output:\n{}", out.output);
            return Err(Error::CopyFailed {
                src: src.name().to_string(),
                dest: dest.name().to_string(),
                exit_code: out.exit_code,
                output: out.output,
            });
        }
        tracing::debug!("Copied {} entries", out.output.lines().count());
        Ok(())
    }

    /// Take ownership of a started container until the caller disarms it
    pub fn guard(&self, name: impl Into<String>) -> ContainerGuard {
        ContainerGuard {
            controller: self.clone(),
            name: name.into(),
            armed: true,
        }
    }
}

fn single(mut matches: Vec<ContainerInfo>, pattern: &str) -> Result<ContainerInfo> {
    match matches.len() {
        0 => Err(Error::NotFound(format!("no running container matches \"{}\"", pattern))),
        1 => Ok(matches.remove(0)),
        _ => Err(Error::AmbiguousMatch {
            pattern: pattern.to_string(),
            matches: matches.into_iter().map(|c| c.name).collect(),
        }),
    }
}

/// Scoped ownership of a freshly started container.
///
/// Call `disarm` once the container is healthy and handed over. Every
/// other exit path releases it: `release` stops and waits explicitly,
/// and dropping an armed guard schedules a best-effort stop.
pub struct ContainerGuard {
    controller: ContainerController,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    /// Keep the container running past the guard
    pub fn disarm(mut self) -> String {
        self.armed = false;
        std::mem::take(&mut self.name)
    }

    /// Stop and wait for the container, logging rather than returning errors
    pub async fn release(mut self) {
        self.armed = false;
        if let Err(e) = self.controller.stop_and_wait(&self.name).await {
            tracing::warn!("Failed to stop {}: {}", self.name, e);
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!("{} was abandoned before it became healthy, stopping it", self.name);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let controller = self.controller.clone();
            let name = std::mem::take(&mut self.name);
            handle.spawn(async move {
                if let Err(e) = controller.stop_and_wait(&name).await {
                    tracing::warn!("Failed to stop {}: {}", name, e);
                }
            });
        }
    }
}
