//! Volume Manager
//!
//! Owns the lifecycle of the named data volumes replicas mount.

use std::sync::Arc;

use crate::error::Result;
use crate::replica::ReplicaIdentity;
use crate::runtime::ContainerRuntime;

/// Handle to a named persistent volume
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Volume {
    name: String,
}

impl Volume {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The data volume a replica identity owns
    pub fn for_identity(identity: ReplicaIdentity) -> Self {
        Self::new(identity.volume_name())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Creates and truncates replica data volumes
#[derive(Clone)]
pub struct VolumeManager {
    runtime: Arc<dyn ContainerRuntime>,
}

impl VolumeManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Remove the volume if it exists and recreate it empty.
    ///
    /// Fails with `VolumeInUse` if a container still references the
    /// volume; callers stop the owning replica first.
    pub async fn ensure_empty_volume(&self, name: &str) -> Result<Volume> {
        if self.exists(name).await? {
            tracing::debug!("Removing volume {}", name);
            match self.runtime.remove_volume(name).await {
                Ok(()) => {}
                // Gone between lookup and removal
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        let info = self.runtime.create_volume(name).await?;
        tracing::info!("Volume {} is empty", info.name);
        Ok(Volume::new(info.name))
    }

    /// Whether a volume with this name exists
    pub async fn exists(&self, name: &str) -> Result<bool> {
        match self.runtime.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::runtime::{MockRuntime, Mount, RunSpec};

    #[tokio::test]
    async fn test_ensure_empty_truncates_existing() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.add_volume("data-replica-3", &["ibdata1", "mysql.ibd"]);
        let volumes = VolumeManager::new(runtime.clone());

        let volume = volumes.ensure_empty_volume("data-replica-3").await.unwrap();
        assert_eq!(volume.name(), "data-replica-3");
        assert_eq!(runtime.volume_files("data-replica-3"), Some(vec![]));
    }

    #[tokio::test]
    async fn test_ensure_empty_creates_missing() {
        let runtime = Arc::new(MockRuntime::new());
        let volumes = VolumeManager::new(runtime.clone());

        assert!(!volumes.exists("data-replica-4").await.unwrap());
        volumes.ensure_empty_volume("data-replica-4").await.unwrap();
        assert!(volumes.exists("data-replica-4").await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_empty_is_idempotent() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.add_volume("data-replica-2", &["ibdata1"]);
        let volumes = VolumeManager::new(runtime.clone());

        for _ in 0..3 {
            volumes.ensure_empty_volume("data-replica-2").await.unwrap();
        }
        assert_eq!(runtime.volume_files("data-replica-2"), Some(vec![]));
    }

    #[tokio::test]
    async fn test_ensure_empty_refuses_attached_volume() {
        let runtime = Arc::new(MockRuntime::new());
        let mut spec = RunSpec::new("replica-3", "mysql:8");
        spec.mounts.push(Mount::new("data-replica-3", "/var/lib/mysql"));
        runtime.run_detached(&spec).await.unwrap();
        runtime.write_file("data-replica-3", "ibdata1");

        let volumes = VolumeManager::new(runtime.clone());
        let err = volumes.ensure_empty_volume("data-replica-3").await.unwrap_err();
        assert!(matches!(err, Error::VolumeInUse(_)));
        assert_eq!(runtime.volume_files("data-replica-3"), Some(vec!["ibdata1".to_string()]));
    }

    #[test]
    fn test_volume_for_identity() {
        assert_eq!(Volume::for_identity(ReplicaIdentity::new(3)).name(), "data-replica-3");
    }
}
