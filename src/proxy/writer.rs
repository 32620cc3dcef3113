//! Proxy Config Writer
//!
//! Points the nginx stream proxy at the active staging replica and
//! reloads it in place.

use std::path::PathBuf;

use crate::config::RotatorConfig;
use crate::container::ContainerController;
use crate::error::{Error, Result};
use crate::runtime::{Mount, PortBinding, RunSpec};

use super::ProxyRoute;

/// Proxy container and config file settings
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub container_name: String,
    pub image: String,
    /// Absolute host path of nginx.conf
    pub config_path: PathBuf,
    pub listen_port: u16,
    pub published_port: u16,
    pub network: String,
}

impl ProxySettings {
    pub fn from_config(config: &RotatorConfig) -> Self {
        Self {
            container_name: config.proxy.container_name.clone(),
            image: config.proxy.image.clone(),
            config_path: config.proxy_config_path(),
            listen_port: config.proxy.listen_port,
            published_port: config.proxy.published_port,
            network: config.proxy.network.clone(),
        }
    }
}

/// Writes the proxy routing config and drives the proxy container
#[derive(Clone)]
pub struct ProxyConfigWriter {
    containers: ContainerController,
    settings: ProxySettings,
}

impl ProxyConfigWriter {
    pub fn new(containers: ContainerController, settings: ProxySettings) -> Self {
        Self {
            containers,
            settings,
        }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    /// Overwrite the config file with a single route to `target`.
    ///
    /// Written in place: the proxy container bind-mounts this file, so
    /// replacing the inode would hide the change from it.
    pub async fn update_config(&self, target: &str) -> Result<ProxyRoute> {
        let route = ProxyRoute::new(target, self.settings.listen_port);
        tokio::fs::write(&self.settings.config_path, route.render()).await?;
        tracing::info!("Proxy route {} written to {:?}", route, self.settings.config_path);
        Ok(route)
    }

    /// The route currently in the config file
    pub async fn current_route(&self) -> Result<Option<ProxyRoute>> {
        match tokio::fs::read_to_string(&self.settings.config_path).await {
            Ok(content) => Ok(ProxyRoute::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Ask nginx to re-read its config without restarting the container
    pub async fn reload(&self) -> Result<()> {
        let command = vec!["nginx".to_string(), "-s".to_string(), "reload".to_string()];
        let out = self
            .containers
            .exec_in_container(&self.settings.container_name, &command)
            .await?;
        if !out.success() {
            tracing::error!("nginx reload output:\n{}", out.output);
            return Err(Error::ProxyReloadFailed {
                exit_code: out.exit_code,
                output: out.output,
            });
        }
        tracing::info!("Proxy {} reloaded", self.settings.container_name);
        Ok(())
    }

    /// Launch the proxy container with the current config file
    pub async fn start(&self) -> Result<String> {
        let mut spec = RunSpec::new(&self.settings.container_name, &self.settings.image);
        spec.network = Some(self.settings.network.clone());
        spec.auto_remove = true;
        spec.mounts = vec![Mount::new(
            self.settings.config_path.display().to_string(),
            "/etc/nginx/nginx.conf",
        )];
        spec.ports = vec![PortBinding {
            container_port: self.settings.listen_port,
            host_port: self.settings.published_port,
        }];
        self.containers.run_detached(&spec).await
    }

    /// Stop the proxy container if it is running
    pub async fn stop(&self) -> Result<bool> {
        self.containers
            .stop_and_wait(&self.settings.container_name)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    use crate::runtime::{ContainerStatus, ExecOutput, MockRuntime, RuntimeEvent};

    fn writer(runtime: &Arc<MockRuntime>, config_path: PathBuf) -> ProxyConfigWriter {
        let mut config = RotatorConfig::default();
        config.proxy.config_path = config_path;
        ProxyConfigWriter::new(
            ContainerController::new(runtime.clone(), "master"),
            ProxySettings::from_config(&config),
        )
    }

    #[tokio::test]
    async fn test_update_config_overwrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nginx.conf");
        std::fs::write(&path, "# hand edits\nworker_processes 4;\n").unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let proxy = writer(&runtime, path.clone());

        proxy.update_config("replica-3").await.unwrap();
        proxy.update_config("replica-4").await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("hand edits"));
        assert!(!content.contains("replica-3"));
        assert_eq!(
            proxy.current_route().await.unwrap(),
            Some(ProxyRoute::new("replica-4", 3306))
        );
    }

    #[tokio::test]
    async fn test_current_route_missing_file() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let proxy = writer(&runtime, dir.path().join("nginx.conf"));
        assert!(proxy.current_route().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_and_reload() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let proxy = writer(&runtime, dir.path().join("nginx.conf"));

        proxy.start().await.unwrap();
        let spec = runtime.run_spec("mysql-staging").unwrap();
        assert_eq!(spec.network.as_deref(), Some("mysql-cluster_default"));
        assert_eq!(
            spec.ports,
            vec![PortBinding {
                container_port: 3306,
                host_port: 3307
            }]
        );
        assert_eq!(spec.mounts[0].target, "/etc/nginx/nginx.conf");

        proxy.reload().await.unwrap();
        assert!(runtime.events().contains(&RuntimeEvent::Exec {
            name: "mysql-staging".into(),
            command: vec!["nginx".into(), "-s".into(), "reload".into()],
        }));
        // Reload never restarts the container
        assert!(!runtime
            .events()
            .contains(&RuntimeEvent::Stop { name: "mysql-staging".into() }));
    }

    #[tokio::test]
    async fn test_reload_failure() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        runtime.add_container("mysql-staging", ContainerStatus::Running, &[]);
        runtime.script_exec(
            "mysql-staging",
            vec![ExecOutput::new(1, "nginx: [emerg] host not found in upstream \"replica-9:3306\"")],
        );
        let proxy = writer(&runtime, dir.path().join("nginx.conf"));

        let err = proxy.reload().await.unwrap_err();
        assert!(matches!(err, Error::ProxyReloadFailed { exit_code: 1, .. }));
    }
}
