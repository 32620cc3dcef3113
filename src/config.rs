//! Replica Rotator Configuration
//!
//! This module provides configuration structures for the replica
//! rotator. Every section has defaults matching the reference
//! docker-compose topology, so the rotator runs without a config file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::replica::{Backoff, ReplicaIdentity, RetryPolicy};

/// Main rotator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RotatorConfig {
    /// Container runtime configuration
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// How to locate the primary
    #[serde(default)]
    pub primary: PrimaryConfig,

    /// Replication credentials and primary-replica identity
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// MySQL container launch settings
    #[serde(default)]
    pub mysql: MysqlConfig,

    /// Replication bootstrap retry settings
    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    /// Staging pair configuration
    #[serde(default)]
    pub staging: StagingConfig,

    /// Reverse proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Rotation ledger configuration
    #[serde(default)]
    pub state: StateConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Container runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Path or name of the docker binary
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,
}

/// Primary lookup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryConfig {
    /// Container name pattern that must match exactly one running container
    #[serde(default = "default_primary_pattern")]
    pub name_pattern: String,

    /// `key=value` label that identifies the primary instead of the name
    /// pattern, e.g. `com.docker.compose.service=master`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Host name replicas connect to (network name of the primary)
    #[serde(default = "default_primary_pattern")]
    pub source_host: String,

    /// Replication user
    #[serde(default = "default_replication_user")]
    pub user: String,

    /// Replication password
    #[serde(default = "default_replication_user")]
    pub password: String,

    /// Server id of the permanently-synced async replica
    #[serde(default = "default_primary_replica_id")]
    pub primary_replica_id: u32,

    /// Also require a healthy SHOW REPLICA STATUS before accepting a bootstrap
    #[serde(default)]
    pub verify_status: bool,
}

/// MySQL container configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MysqlConfig {
    /// MySQL image
    #[serde(default = "default_mysql_image")]
    pub image: String,

    /// Data directory inside the container
    #[serde(default = "default_mysql_data_dir")]
    pub data_dir: String,

    /// Host directory holding the init script and entrypoint
    #[serde(default = "default_docker_data_dir")]
    pub docker_data_dir: PathBuf,

    /// Init SQL file name inside docker_data_dir
    #[serde(default = "default_init_script")]
    pub init_script: String,

    /// Entrypoint script file name inside docker_data_dir
    #[serde(default = "default_entrypoint_script")]
    pub entrypoint_script: String,

    /// Path the entrypoint script is mounted at
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
}

/// Bootstrap retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Delay after starting the container, before the first attempt
    #[serde(default)]
    pub settle_delay_secs: u64,

    /// Number of bootstrap attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before each attempt (initial delay for exponential backoff)
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Backoff strategy (fixed, exponential)
    #[serde(default = "default_backoff")]
    pub backoff: String,

    /// Upper bound for exponential backoff
    #[serde(default = "default_max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,
}

/// Where a rotation copies data from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationSource {
    /// The currently active staging replica. It stays writable and
    /// serving during the copy, so the snapshot is not crash-consistent
    ActiveStaging,
    /// The permanently-synced async replica
    AsyncReplica,
}

/// Staging pair configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// The two staging server ids
    #[serde(default = "default_staging_identities")]
    pub identities: Vec<u32>,

    /// Data source for realigning the next staging replica
    #[serde(default = "default_rotation_source")]
    pub source: RotationSource,

    /// Image of the disposable copy helper
    #[serde(default = "default_copy_image")]
    pub copy_image: String,

    /// Name of the disposable copy helper
    #[serde(default = "default_copy_container")]
    pub copy_container: String,
}

/// Reverse proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy container name
    #[serde(default = "default_proxy_container")]
    pub container_name: String,

    /// Proxy image
    #[serde(default = "default_proxy_image")]
    pub image: String,

    /// Host path of the generated nginx config
    #[serde(default = "default_proxy_config_path")]
    pub config_path: PathBuf,

    /// Port the proxy listens on and forwards to
    #[serde(default = "default_mysql_port")]
    pub listen_port: u16,

    /// Host port published for clients
    #[serde(default = "default_published_port")]
    pub published_port: u16,

    /// Network the proxy container joins
    #[serde(default = "default_proxy_network")]
    pub network: String,
}

/// Rotation ledger configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    /// SQLite file recording completed rotations (disabled when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_docker_binary() -> String {
    "docker".to_string()
}

fn default_primary_pattern() -> String {
    "master".to_string()
}

fn default_replication_user() -> String {
    "replicator".to_string()
}

fn default_primary_replica_id() -> u32 {
    2
}

fn default_mysql_image() -> String {
    "mysql:8".to_string()
}

fn default_mysql_data_dir() -> String {
    "/var/lib/mysql".to_string()
}

fn default_docker_data_dir() -> PathBuf {
    PathBuf::from("../docker-data")
}

fn default_init_script() -> String {
    "init-slave.sql".to_string()
}

fn default_entrypoint_script() -> String {
    "entrypoint-slave.sh".to_string()
}

fn default_entrypoint() -> String {
    "/slave-entrypoint.sh".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    10
}

fn default_backoff() -> String {
    "fixed".to_string()
}

fn default_max_retry_delay_secs() -> u64 {
    60
}

fn default_staging_identities() -> Vec<u32> {
    vec![3, 4]
}

fn default_rotation_source() -> RotationSource {
    RotationSource::ActiveStaging
}

fn default_copy_image() -> String {
    "busybox:latest".to_string()
}

fn default_copy_container() -> String {
    "copy-data".to_string()
}

fn default_proxy_container() -> String {
    "mysql-staging".to_string()
}

fn default_proxy_image() -> String {
    "nginx:latest".to_string()
}

fn default_proxy_config_path() -> PathBuf {
    PathBuf::from("./nginx.conf")
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_published_port() -> u16 {
    3307
}

fn default_proxy_network() -> String {
    "mysql-cluster_default".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_binary: default_docker_binary(),
        }
    }
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            name_pattern: default_primary_pattern(),
            label: None,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            source_host: default_primary_pattern(),
            user: default_replication_user(),
            password: default_replication_user(),
            primary_replica_id: default_primary_replica_id(),
            verify_status: false,
        }
    }
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            image: default_mysql_image(),
            data_dir: default_mysql_data_dir(),
            docker_data_dir: default_docker_data_dir(),
            init_script: default_init_script(),
            entrypoint_script: default_entrypoint_script(),
            entrypoint: default_entrypoint(),
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            settle_delay_secs: 0,
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            backoff: default_backoff(),
            max_retry_delay_secs: default_max_retry_delay_secs(),
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            identities: default_staging_identities(),
            source: default_rotation_source(),
            copy_image: default_copy_image(),
            copy_container: default_copy_container(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            container_name: default_proxy_container(),
            image: default_proxy_image(),
            config_path: default_proxy_config_path(),
            listen_port: default_mysql_port(),
            published_port: default_published_port(),
            network: default_proxy_network(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl RotatorConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a file if it exists, otherwise use defaults
    pub fn load_or_default(path: &Path) -> crate::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: RotatorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.primary.name_pattern.is_empty() {
            return Err(crate::Error::Config("primary.name_pattern cannot be empty".into()));
        }

        if let Some(label) = &self.primary.label {
            if self.primary_label().is_none() {
                return Err(crate::Error::Config(format!(
                    "primary.label must look like key=value, got {:?}",
                    label
                )));
            }
        }

        if self.staging.identities.len() != 2 {
            return Err(crate::Error::Config(format!(
                "staging.identities must name exactly two replicas, got {}",
                self.staging.identities.len()
            )));
        }

        if self.staging.identities[0] == self.staging.identities[1] {
            return Err(crate::Error::Config(
                "staging.identities must be distinct".into(),
            ));
        }

        if self
            .staging
            .identities
            .contains(&self.replication.primary_replica_id)
        {
            return Err(crate::Error::Config(format!(
                "replication.primary_replica_id {} collides with a staging identity",
                self.replication.primary_replica_id
            )));
        }

        if self.bootstrap.max_attempts == 0 {
            return Err(crate::Error::Config("bootstrap.max_attempts must be at least 1".into()));
        }

        match self.bootstrap.backoff.as_str() {
            "fixed" | "exponential" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "bootstrap.backoff must be fixed or exponential, got {}",
                    other
                )))
            }
        }

        if self.proxy.listen_port == 0 {
            return Err(crate::Error::Config("proxy.listen_port cannot be 0".into()));
        }

        Ok(())
    }

    /// The primary's label selector split into key and value
    pub fn primary_label(&self) -> Option<(String, String)> {
        let (key, value) = self.primary.label.as_deref()?.split_once('=')?;
        if key.is_empty() {
            return None;
        }
        Some((key.to_string(), value.to_string()))
    }

    /// Identity of the permanently-synced async replica
    pub fn primary_replica(&self) -> ReplicaIdentity {
        ReplicaIdentity::new(self.replication.primary_replica_id)
    }

    /// The two staging identities, in rotation order
    pub fn staging_identities(&self) -> crate::Result<[ReplicaIdentity; 2]> {
        match self.staging.identities.as_slice() {
            [first, second] => Ok([ReplicaIdentity::new(*first), ReplicaIdentity::new(*second)]),
            other => Err(crate::Error::Config(format!(
                "staging.identities must name exactly two replicas, got {}",
                other.len()
            ))),
        }
    }

    /// Get settle delay as Duration
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.bootstrap.settle_delay_secs)
    }

    /// Build the bootstrap retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_secs(self.bootstrap.retry_delay_secs);
        let backoff = match self.bootstrap.backoff.as_str() {
            "exponential" => Backoff::Exponential {
                initial: delay,
                max: Duration::from_secs(self.bootstrap.max_retry_delay_secs),
            },
            _ => Backoff::Fixed(delay),
        };
        RetryPolicy::new(self.bootstrap.max_attempts, backoff)
    }

    /// Absolute host directory holding the MySQL init files
    pub fn docker_data_dir(&self) -> PathBuf {
        std::path::absolute(&self.mysql.docker_data_dir)
            .unwrap_or_else(|_| self.mysql.docker_data_dir.clone())
    }

    /// Absolute host path of the generated proxy config
    pub fn proxy_config_path(&self) -> PathBuf {
        std::path::absolute(&self.proxy.config_path)
            .unwrap_or_else(|_| self.proxy.config_path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[primary]
name_pattern = "mysql-primary"

[replication]
user = "repl"
password = "secret"
primary_replica_id = 12

[bootstrap]
max_attempts = 5
retry_delay_secs = 2
backoff = "exponential"

[staging]
identities = [13, 14]
source = "async-replica"

[proxy]
config_path = "/etc/rotator/nginx.conf"
"#;

        let config = RotatorConfig::from_str(toml).unwrap();
        assert_eq!(config.primary.name_pattern, "mysql-primary");
        assert_eq!(config.primary_replica(), ReplicaIdentity::new(12));
        assert_eq!(
            config.staging_identities().unwrap(),
            [ReplicaIdentity::new(13), ReplicaIdentity::new(14)]
        );
        assert_eq!(config.staging.source, RotationSource::AsyncReplica);
        assert_eq!(config.retry_policy().max_attempts(), 5);
        // Untouched sections keep their defaults
        assert_eq!(config.proxy.listen_port, 3306);
        assert_eq!(config.mysql.image, "mysql:8");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = RotatorConfig::from_str("").unwrap();
        assert_eq!(config.primary.name_pattern, "master");
        assert_eq!(config.primary_replica(), ReplicaIdentity::new(2));
        assert_eq!(
            config.staging_identities().unwrap(),
            [ReplicaIdentity::new(3), ReplicaIdentity::new(4)]
        );
        assert_eq!(config.staging.source, RotationSource::ActiveStaging);
        assert_eq!(config.proxy.container_name, "mysql-staging");
        assert_eq!(config.proxy.published_port, 3307);
        assert_eq!(config.retry_policy(), RetryPolicy::new(3, Backoff::Fixed(Duration::from_secs(10))));
    }

    #[test]
    fn test_primary_label() {
        let config =
            RotatorConfig::from_str("[primary]\nlabel = \"com.docker.compose.service=master\"\n").unwrap();
        assert_eq!(
            config.primary_label(),
            Some(("com.docker.compose.service".to_string(), "master".to_string()))
        );
        assert!(RotatorConfig::default().primary_label().is_none());
        assert!(RotatorConfig::from_str("[primary]\nlabel = \"master\"\n").is_err());
    }

    #[test]
    fn test_staging_identities_checks_length() {
        let mut config = RotatorConfig::default();
        config.staging.identities = vec![3];
        assert!(matches!(config.staging_identities(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_rejects_bad_staging_pair() {
        let err = RotatorConfig::from_str("[staging]\nidentities = [3, 3]\n").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));

        let err = RotatorConfig::from_str("[staging]\nidentities = [3, 4, 5]\n").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));

        let err = RotatorConfig::from_str("[staging]\nidentities = [2, 4]\n").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_rejects_zero_attempts_and_unknown_backoff() {
        assert!(RotatorConfig::from_str("[bootstrap]\nmax_attempts = 0\n").is_err());
        assert!(RotatorConfig::from_str("[bootstrap]\nbackoff = \"jitter\"\n").is_err());
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let rendered = RotatorConfig::default().to_toml().unwrap();
        let parsed = RotatorConfig::from_str(&rendered).unwrap();
        assert_eq!(parsed.staging.identities, vec![3, 4]);
    }
}
