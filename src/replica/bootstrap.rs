//! Replica Bootstrapper
//!
//! Launches MySQL containers next to the primary and wires them up as
//! replicas, retrying the bootstrap until replication comes up or the
//! retry budget runs out.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::RotatorConfig;
use crate::container::ContainerController;
use crate::error::{Error, Result};
use crate::runtime::{Mount, RunSpec};
use crate::volume::{Volume, VolumeManager};

use super::{ReplicaIdentity, ReplicaRole, ReplicaStatus, RetryPolicy};

/// How MySQL replica containers are launched
#[derive(Debug, Clone)]
pub struct MysqlSettings {
    pub image: String,
    pub data_dir: String,
    /// Absolute host directory with the init script and entrypoint
    pub docker_data_dir: PathBuf,
    pub init_script: String,
    pub entrypoint_script: String,
    pub entrypoint: String,
}

impl MysqlSettings {
    pub fn from_config(config: &RotatorConfig) -> Self {
        Self {
            image: config.mysql.image.clone(),
            data_dir: config.mysql.data_dir.clone(),
            docker_data_dir: config.docker_data_dir(),
            init_script: config.mysql.init_script.clone(),
            entrypoint_script: config.mysql.entrypoint_script.clone(),
            entrypoint: config.mysql.entrypoint.clone(),
        }
    }
}

/// Fixed replication credentials
#[derive(Debug, Clone)]
pub struct ReplicationCredentials {
    pub source_host: String,
    pub user: String,
    pub password: String,
}

/// Escape a value for a single-quoted MySQL string literal
fn sql_quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "''")
}

/// `mysql -A -e <sql>`
pub fn mysql_command(sql: &str) -> Vec<String> {
    vec![
        "mysql".to_string(),
        "-A".to_string(),
        "-e".to_string(),
        sql.to_string(),
    ]
}

/// Starts MySQL containers and bootstraps replication on them
#[derive(Clone)]
pub struct Bootstrapper {
    containers: ContainerController,
    volumes: VolumeManager,
    mysql: MysqlSettings,
    credentials: ReplicationCredentials,
    retry: RetryPolicy,
    settle_delay: Duration,
    verify_status: bool,
}

impl Bootstrapper {
    pub fn new(containers: ContainerController, volumes: VolumeManager, config: &RotatorConfig) -> Self {
        Self {
            containers,
            volumes,
            mysql: MysqlSettings::from_config(config),
            credentials: ReplicationCredentials {
                source_host: config.replication.source_host.clone(),
                user: config.replication.user.clone(),
                password: config.replication.password.clone(),
            },
            retry: config.retry_policy(),
            settle_delay: config.settle_delay(),
            verify_status: config.replication.verify_status,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn containers(&self) -> &ContainerController {
        &self.containers
    }

    pub fn volumes(&self) -> &VolumeManager {
        &self.volumes
    }

    /// The statements that point a fresh replica at the primary
    pub fn bootstrap_sql(&self) -> String {
        format!(
            "CHANGE MASTER TO MASTER_HOST='{}', MASTER_USER='{}', MASTER_PASSWORD='{}'; \
             RESET REPLICA; START REPLICA;",
            sql_quote(&self.credentials.source_host),
            sql_quote(&self.credentials.user),
            sql_quote(&self.credentials.password),
        )
    }

    /// Launch `replica-{identity}` on the primary's network with `volume`
    /// as its data directory.
    pub async fn start_mysql(
        &self,
        identity: ReplicaIdentity,
        volume: &Volume,
        role: ReplicaRole,
    ) -> Result<String> {
        let primary = self.containers.find_primary().await?;
        let network = match primary.networks.as_slice() {
            [net] => net.network_id.clone(),
            [] => {
                return Err(Error::NotFound(format!(
                    "network of primary container {}",
                    primary.name
                )))
            }
            nets => {
                return Err(Error::MultiNetworkUnsupported {
                    name: primary.name.clone(),
                    count: nets.len(),
                })
            }
        };

        let host_dir = &self.mysql.docker_data_dir;
        let mut spec = RunSpec::new(identity.container_name(), &self.mysql.image);
        spec.network = Some(network);
        spec.auto_remove = true;
        spec.mounts = vec![
            Mount::new(volume.name(), &self.mysql.data_dir),
            Mount::new(
                host_dir.join(&self.mysql.init_script).display().to_string(),
                "/docker-entrypoint-initdb.d/init.sql",
            ),
            Mount::new(
                host_dir.join(&self.mysql.entrypoint_script).display().to_string(),
                &self.mysql.entrypoint,
            ),
        ];
        spec.entrypoint = Some(self.mysql.entrypoint.clone());
        spec.command = vec![format!("--server-id={}", identity)];
        if role.read_only() {
            spec.command.push("--read-only".to_string());
        }

        self.containers.run_detached(&spec).await?;
        tracing::info!(
            "Started {} ({})",
            spec.name,
            if role.read_only() { "read-only" } else { "read/write" }
        );
        Ok(spec.name)
    }

    /// Start a read-only replica of the primary and bootstrap replication.
    ///
    /// With `prune_data` the identity's volume is recreated empty first.
    /// If every attempt fails the container is stopped before the error
    /// is returned.
    pub async fn start_replica(&self, identity: ReplicaIdentity, prune_data: bool) -> Result<String> {
        let volume = if prune_data {
            self.volumes.ensure_empty_volume(&identity.volume_name()).await?
        } else {
            Volume::for_identity(identity)
        };

        let name = self.start_mysql(identity, &volume, ReplicaRole::AsyncReplica).await?;
        let guard = self.containers.guard(name.clone());

        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }

        let command = mysql_command(&self.bootstrap_sql());
        let mut last_output = String::new();

        for (attempt, delay) in self.retry.schedule() {
            tokio::time::sleep(delay).await;

            match self.containers.exec_in_container(&name, &command).await {
                Ok(out) if out.success() => match self.confirm_replication(identity).await {
                    Ok(()) => {
                        tracing::info!("Replication on {} started (attempt {})", name, attempt);
                        if !out.output.trim().is_empty() {
                            tracing::info!("{}", out.output.trim());
                        }
                        guard.disarm();
                        return Ok(name);
                    }
                    Err(reason) => {
                        tracing::warn!("Replication on {} not healthy yet: {}", name, reason);
                        last_output = reason;
                    }
                },
                Ok(out) => {
                    tracing::warn!(
                        "Bootstrap attempt {}/{} on {} exited with {}",
                        attempt,
                        self.retry.max_attempts(),
                        name,
                        out.exit_code
                    );
                    last_output = out.output;
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        "Bootstrap attempt {}/{} on {} failed: {}",
                        attempt,
                        self.retry.max_attempts(),
                        name,
                        e
                    );
                    last_output = e.to_string();
                }
                Err(e) => {
                    guard.release().await;
                    return Err(e);
                }
            }
        }

        let logs = self
            .containers
            .logs(&name)
            .await
            .unwrap_or_else(|e| format!("<logs unavailable: {}>", e));
        tracing::error!("Last bootstrap output from {}:\n{}", name, last_output);
        tracing::error!("Logs of {}:\n{}", name, logs);

        guard.release().await;
        Err(Error::ReplicationBootstrapFailed {
            identity: identity.server_id(),
            attempts: self.retry.max_attempts(),
            output: last_output,
            logs,
        })
    }

    /// When status verification is on, require a healthy replication channel
    async fn confirm_replication(&self, identity: ReplicaIdentity) -> std::result::Result<(), String> {
        if !self.verify_status {
            return Ok(());
        }
        match self.replica_status(identity).await {
            Ok(Some(status)) if status.is_healthy() => Ok(()),
            Ok(Some(status)) => Err(format!(
                "IO={} SQL={} {}",
                status.io_running,
                status.sql_running,
                status.last_error.unwrap_or_default()
            )),
            Ok(None) => Err("no replication channel configured".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Current replication status of a replica, None if it has no channel
    pub async fn replica_status(&self, identity: ReplicaIdentity) -> Result<Option<ReplicaStatus>> {
        let out = self
            .containers
            .exec_in_container(
                &identity.container_name(),
                &mysql_command("SHOW REPLICA STATUS\\G"),
            )
            .await?;
        if !out.success() {
            return Err(Error::Runtime(format!(
                "SHOW REPLICA STATUS on {} exited with {}: {}",
                identity.container_name(),
                out.exit_code,
                out.output.trim()
            )));
        }
        Ok(ReplicaStatus::parse(&out.output))
    }

    /// Poll `mysqladmin ping` under the retry policy until the server in
    /// `replica-{identity}` accepts connections.
    pub async fn wait_ready(&self, identity: ReplicaIdentity) -> Result<()> {
        let name = identity.container_name();
        let command = vec![
            "mysqladmin".to_string(),
            "ping".to_string(),
            "--silent".to_string(),
        ];
        let mut last_output = String::new();

        for (attempt, delay) in self.retry.schedule() {
            if attempt > 1 {
                tokio::time::sleep(delay).await;
            }
            match self.containers.exec_in_container(&name, &command).await {
                Ok(out) if out.success() => {
                    tracing::debug!("{} is accepting connections", name);
                    return Ok(());
                }
                Ok(out) => last_output = out.output,
                Err(e) if e.is_retryable() => last_output = e.to_string(),
                Err(e) => return Err(e),
            }
            tracing::debug!("{} not ready (attempt {})", name, attempt);
        }

        Err(Error::NotReady {
            name,
            attempts: self.retry.max_attempts(),
            output: last_output,
        })
    }

    /// Run `STOP REPLICA` or `START REPLICA` on a running replica.
    ///
    /// Returns whether the statement succeeded; a server without a
    /// replication channel reports failure without it being fatal.
    pub async fn replication_control(&self, identity: ReplicaIdentity, statement: &str) -> Result<bool> {
        let name = identity.container_name();
        let out = self
            .containers
            .exec_in_container(&name, &mysql_command(statement))
            .await?;
        if out.success() {
            tracing::debug!("{} on {}", statement, name);
        } else {
            tracing::warn!(
                "{} on {} exited with {}: {}",
                statement,
                name,
                out.exit_code,
                out.output.trim()
            );
        }
        Ok(out.success())
    }
}
