//! Replica Rotator - MySQL staging replica rotation
//!
//! Keeps a pair of writable staging replicas of a production MySQL
//! primary and swaps them behind an nginx stream proxy on operator
//! command, so clients always see a freshly copied snapshot.
//!
//! # Architecture
//!
//! A read-only replica of the primary (the primary-replica) is
//! bootstrapped through binlog replication. Two staging replicas take
//! turns serving traffic: while one is active, the other is rebuilt by
//! copying a paused replica's data volume and then promoted by
//! rewriting the proxy config.
//!
//! # Features
//!
//! - Container and volume management through the docker CLI
//! - Replication bootstrap with configurable retry and backoff
//! - Proxy cutover only after the new replica answers pings
//! - Rotation history kept in SQLite
//! - In-memory runtime for running full rotations in tests

pub mod config;
pub mod container;
pub mod driver;
pub mod error;
pub mod proxy;
pub mod replica;
pub mod rotation;
pub mod runtime;
pub mod state;
pub mod volume;

pub use config::RotatorConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::RotatorConfig;
    pub use crate::container::ContainerController;
    pub use crate::driver::{Driver, OperatorInput, OperatorSignal};
    pub use crate::error::{Error, Result};
    pub use crate::proxy::{ProxyConfigWriter, ProxyRoute};
    pub use crate::replica::{Bootstrapper, ReplicaIdentity};
    pub use crate::rotation::{RotationController, RotationRecord};
    pub use crate::runtime::{ContainerRuntime, DockerCli};
    pub use crate::state::RotationLedger;
    pub use crate::volume::VolumeManager;
}
