//! Replica Module
//!
//! Replica identities, MySQL container launch and replication bootstrap.

mod bootstrap;
mod identity;
mod retry;
mod status;

pub use bootstrap::{mysql_command, Bootstrapper, MysqlSettings, ReplicationCredentials};
pub use identity::{ReplicaIdentity, ReplicaRole};
pub use retry::{Backoff, RetryPolicy};
pub use status::ReplicaStatus;
