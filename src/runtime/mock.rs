//! In-memory container runtime
//!
//! Models containers, volumes and their contents closely enough to run
//! whole rotations without a docker daemon. Every call is recorded as a
//! `RuntimeEvent` so tests can assert on ordering.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::{
    ContainerFilter, ContainerInfo, ContainerRuntime, ContainerStatus, ExecOutput, Mount,
    NetworkAttachment, RunSpec, VolumeInfo,
};
use crate::error::{Error, Result};

/// A call made against the mock runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    Run { name: String, command: Vec<String> },
    RunToCompletion { name: String, image: String },
    Stop { name: String },
    Wait { name: String },
    Exec { name: String, command: Vec<String> },
    Logs { name: String },
    VolumeRemove { name: String },
    VolumeCreate { name: String },
}

#[derive(Debug, Clone)]
struct MockContainer {
    info: ContainerInfo,
    mounts: Vec<Mount>,
    auto_remove: bool,
    spec: Option<RunSpec>,
}

#[derive(Debug, Default)]
struct MockState {
    containers: BTreeMap<String, MockContainer>,
    volumes: BTreeMap<String, BTreeSet<String>>,
    exec_script: HashMap<String, VecDeque<std::result::Result<ExecOutput, String>>>,
    logs: HashMap<String, String>,
    events: Vec<RuntimeEvent>,
    fail_copies: bool,
    next_id: u64,
}

impl MockState {
    fn find(&self, name: &str) -> Option<&MockContainer> {
        self.containers
            .get(name)
            .or_else(|| self.containers.values().find(|c| c.info.id == name))
    }

    fn key_of(&self, name: &str) -> Option<String> {
        self.find(name).map(|c| c.info.name.clone())
    }

    fn volume_referenced(&self, volume: &str) -> bool {
        self.containers
            .values()
            .any(|c| c.mounts.iter().any(|m| m.source == volume))
    }

    fn ensure_named_volumes(&mut self, mounts: &[Mount]) {
        for mount in mounts {
            if !mount.source.starts_with('/') && !mount.source.starts_with('.') {
                self.volumes.entry(mount.source.clone()).or_default();
            }
        }
    }
}

/// In-memory runtime for tests
#[derive(Debug, Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

fn mount_source<'a>(mounts: &'a [Mount], target: &str) -> Option<&'a str> {
    mounts
        .iter()
        .find(|m| m.target.trim_end_matches('/') == target)
        .map(|m| m.source.as_str())
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an externally managed container (e.g. the primary)
    pub fn add_container(&self, name: &str, status: ContainerStatus, networks: &[(&str, &str)]) {
        let mut state = self.lock();
        state.next_id += 1;
        let info = ContainerInfo {
            id: format!("mock-{:04}", state.next_id),
            name: name.to_string(),
            status,
            networks: networks
                .iter()
                .map(|(name, id)| NetworkAttachment {
                    name: name.to_string(),
                    network_id: id.to_string(),
                })
                .collect(),
            labels: BTreeMap::new(),
        };
        state.containers.insert(
            name.to_string(),
            MockContainer {
                info,
                mounts: Vec::new(),
                auto_remove: false,
                spec: None,
            },
        );
    }

    /// Attach a label to an existing container
    pub fn set_label(&self, name: &str, key: &str, value: &str) {
        if let Some(c) = self.lock().containers.get_mut(name) {
            c.info.labels.insert(key.to_string(), value.to_string());
        }
    }

    /// Create a volume holding the given files
    pub fn add_volume(&self, name: &str, files: &[&str]) {
        self.lock().volumes.insert(
            name.to_string(),
            files.iter().map(|f| f.to_string()).collect(),
        );
    }

    /// Add a file to an existing volume, as a running server would
    pub fn write_file(&self, volume: &str, file: &str) {
        self.lock()
            .volumes
            .entry(volume.to_string())
            .or_default()
            .insert(file.to_string());
    }

    /// Files in a volume, or None if it does not exist
    pub fn volume_files(&self, name: &str) -> Option<Vec<String>> {
        self.lock()
            .volumes
            .get(name)
            .map(|files| files.iter().cloned().collect())
    }

    /// Queue exec results for a container name; unscripted execs succeed
    pub fn script_exec(&self, name: &str, results: Vec<ExecOutput>) {
        self.lock()
            .exec_script
            .entry(name.to_string())
            .or_default()
            .extend(results.into_iter().map(Ok));
    }

    /// Queue a runtime-level exec failure for a container name
    pub fn script_exec_error(&self, name: &str, message: &str) {
        self.lock()
            .exec_script
            .entry(name.to_string())
            .or_default()
            .push_back(Err(message.to_string()));
    }

    pub fn set_logs(&self, name: &str, logs: &str) {
        self.lock().logs.insert(name.to_string(), logs.to_string());
    }

    /// Make every run-to-completion helper exit non-zero
    pub fn fail_copies(&self, fail: bool) {
        self.lock().fail_copies = fail;
    }

    pub fn container(&self, name: &str) -> Option<ContainerInfo> {
        self.lock().find(name).map(|c| c.info.clone())
    }

    /// How a container was launched
    pub fn run_spec(&self, name: &str) -> Option<RunSpec> {
        self.lock().find(name).and_then(|c| c.spec.clone())
    }

    pub fn running_containers(&self) -> Vec<String> {
        self.lock()
            .containers
            .values()
            .filter(|c| c.info.is_running())
            .map(|c| c.info.name.clone())
            .collect()
    }

    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.lock().events.clear();
    }

    /// Number of execs issued against a container
    pub fn exec_count(&self, name: &str) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|e| matches!(e, RuntimeEvent::Exec { name: n, .. } if n == name))
            .count()
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerInfo>> {
        let state = self.lock();
        Ok(state
            .containers
            .values()
            .filter(|c| c.info.is_running())
            .filter(|c| {
                filter
                    .name
                    .as_ref()
                    .map_or(true, |pattern| c.info.name.contains(pattern.as_str()))
            })
            .filter(|c| {
                filter.label.as_ref().map_or(true, |(key, value)| {
                    c.info.labels.get(key).map_or(false, |v| v == value)
                })
            })
            .map(|c| c.info.clone())
            .collect())
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerInfo> {
        self.lock()
            .find(name)
            .map(|c| c.info.clone())
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    async fn run_detached(&self, spec: &RunSpec) -> Result<String> {
        let mut state = self.lock();
        state.events.push(RuntimeEvent::Run {
            name: spec.name.clone(),
            command: spec.command.clone(),
        });

        if state.containers.contains_key(&spec.name) {
            return Err(Error::Runtime(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }

        state.ensure_named_volumes(&spec.mounts);
        state.next_id += 1;
        let id = format!("mock-{:04}", state.next_id);
        let networks = spec
            .network
            .iter()
            .map(|n| NetworkAttachment {
                name: n.clone(),
                network_id: n.clone(),
            })
            .collect();

        state.containers.insert(
            spec.name.clone(),
            MockContainer {
                info: ContainerInfo {
                    id: id.clone(),
                    name: spec.name.clone(),
                    status: ContainerStatus::Running,
                    networks,
                    labels: BTreeMap::new(),
                },
                mounts: spec.mounts.clone(),
                auto_remove: spec.auto_remove,
                spec: Some(spec.clone()),
            },
        );
        Ok(id)
    }

    async fn run_to_completion(&self, spec: &RunSpec) -> Result<ExecOutput> {
        let mut state = self.lock();
        state.events.push(RuntimeEvent::RunToCompletion {
            name: spec.name.clone(),
            image: spec.image.clone(),
        });

        if state.containers.contains_key(&spec.name) {
            return Err(Error::Runtime(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }
        if state.fail_copies {
            return Ok(ExecOutput::new(1, "tar: write error: No space left on device"));
        }

        state.ensure_named_volumes(&spec.mounts);
        let src = mount_source(&spec.mounts, "/src").map(String::from);
        let dest = mount_source(&spec.mounts, "/dest").map(String::from);
        let mut output = String::new();
        if let (Some(src), Some(dest)) = (src, dest) {
            let files = state.volumes.get(&src).cloned().unwrap_or_default();
            for file in &files {
                output.push_str(&format!("./{}\n", file));
            }
            state.volumes.entry(dest).or_default().extend(files);
        }
        Ok(ExecOutput::new(0, output))
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.events.push(RuntimeEvent::Stop {
            name: name.to_string(),
        });
        let key = state
            .key_of(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        let auto_remove = state.containers.get(&key).map_or(false, |c| c.auto_remove);
        if auto_remove {
            state.containers.remove(&key);
        } else if let Some(c) = state.containers.get_mut(&key) {
            c.info.status = ContainerStatus::Exited;
        }
        Ok(())
    }

    async fn wait_container(&self, name: &str) -> Result<i64> {
        let mut state = self.lock();
        state.events.push(RuntimeEvent::Wait {
            name: name.to_string(),
        });
        match state.find(name) {
            Some(_) => Ok(0),
            None => Err(Error::NotFound(name.to_string())),
        }
    }

    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput> {
        let mut state = self.lock();
        state.events.push(RuntimeEvent::Exec {
            name: name.to_string(),
            command: command.to_vec(),
        });

        let container = state
            .find(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        if !container.info.is_running() {
            return Err(Error::NotRunning {
                name: name.to_string(),
                status: container.info.status.to_string(),
            });
        }

        let key = container.info.name.clone();
        match state.exec_script.get_mut(&key).and_then(VecDeque::pop_front) {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(Error::Runtime(message)),
            None => Ok(ExecOutput::new(0, "")),
        }
    }

    async fn logs(&self, name: &str) -> Result<String> {
        let mut state = self.lock();
        state.events.push(RuntimeEvent::Logs {
            name: name.to_string(),
        });
        let key = state
            .key_of(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        Ok(state.logs.get(&key).cloned().unwrap_or_default())
    }

    async fn inspect_volume(&self, name: &str) -> Result<VolumeInfo> {
        if self.lock().volumes.contains_key(name) {
            Ok(VolumeInfo {
                name: name.to_string(),
                mountpoint: Some(format!("/var/lib/docker/volumes/{}/_data", name)),
            })
        } else {
            Err(Error::NotFound(name.to_string()))
        }
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.events.push(RuntimeEvent::VolumeRemove {
            name: name.to_string(),
        });
        if !state.volumes.contains_key(name) {
            return Err(Error::NotFound(name.to_string()));
        }
        if state.volume_referenced(name) {
            return Err(Error::VolumeInUse(name.to_string()));
        }
        state.volumes.remove(name);
        Ok(())
    }

    async fn create_volume(&self, name: &str) -> Result<VolumeInfo> {
        {
            let mut state = self.lock();
            state.events.push(RuntimeEvent::VolumeCreate {
                name: name.to_string(),
            });
            state.volumes.entry(name.to_string()).or_default();
        }
        self.inspect_volume(name).await
    }
}
