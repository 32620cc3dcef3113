//! Replica identities and roles

use std::fmt;

use serde::{Deserialize, Serialize};

/// MySQL server id of a managed replica.
///
/// Each identity owns exactly one data volume and one container name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaIdentity(u32);

impl ReplicaIdentity {
    pub const fn new(server_id: u32) -> Self {
        Self(server_id)
    }

    pub fn server_id(&self) -> u32 {
        self.0
    }

    /// `data-replica-{id}`
    pub fn volume_name(&self) -> String {
        format!("data-replica-{}", self.0)
    }

    /// `replica-{id}`
    pub fn container_name(&self) -> String {
        format!("replica-{}", self.0)
    }
}

impl fmt::Display for ReplicaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ReplicaIdentity {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// What a replica container is for. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicaRole {
    /// Read-only, continuously replicating from the primary
    AsyncReplica,
    /// Writable, serves traffic while active
    Staging,
}

impl ReplicaRole {
    pub fn read_only(&self) -> bool {
        matches!(self, ReplicaRole::AsyncReplica)
    }
}
