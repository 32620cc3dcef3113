//! Replica Rotator Error Types

use thiserror::Error;

/// Result type alias for rotator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Rotator error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    // Lookup errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Multiple containers match \"{pattern}\": {matches:?}")]
    AmbiguousMatch { pattern: String, matches: Vec<String> },

    #[error("Container {name} is not running (status: {status})")]
    NotRunning { name: String, status: String },

    #[error("Container {name} is attached to {count} networks, only one is supported")]
    MultiNetworkUnsupported { name: String, count: usize },

    // Volume errors
    #[error("Volume {0} is still referenced by a container")]
    VolumeInUse(String),

    #[error("Copying {src} into {dest} failed (exit code {exit_code}): {output}")]
    CopyFailed {
        src: String,
        dest: String,
        exit_code: i64,
        output: String,
    },

    // Replication errors
    #[error("Unable to initialize replica {identity} after {attempts} attempts: {output}")]
    ReplicationBootstrapFailed {
        identity: u32,
        attempts: u32,
        output: String,
        logs: String,
    },

    #[error("{name} did not become ready after {attempts} attempts: {output}")]
    NotReady {
        name: String,
        attempts: u32,
        output: String,
    },

    // Rotation errors
    #[error("Invalid rotation target: {0}")]
    InvalidRotationTarget(String),

    #[error("Proxy reload failed (exit code {exit_code}): {output}")]
    ProxyReloadFailed { exit_code: i64, output: String },

    // Runtime errors
    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Failed to decode runtime output: {0}")]
    Json(#[from] serde_json::Error),

    // Ledger errors
    #[error("Ledger error: {0}")]
    Ledger(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error means "nothing there", which stop and prune
    /// operations treat as already done
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Check if a bootstrap attempt that hit this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Runtime(_) | Error::NotRunning { .. })
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Ledger(format!("SQLite error: {}", e))
    }
}
