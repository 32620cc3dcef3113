//! Rotation state: the staging pair, phases and completed rotations

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::replica::ReplicaIdentity;

/// Where a rotation currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationPhase {
    /// Active replica fixed, proxy in sync
    Idle,
    /// Source paused, target being stopped
    Realigning,
    /// Target volume being wiped and refilled
    Copying,
    /// Target restarting writable
    Promoting,
    /// Proxy being rewritten and reloaded
    Switching,
}

impl fmt::Display for RotationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RotationPhase::Idle => "idle",
            RotationPhase::Realigning => "realigning",
            RotationPhase::Copying => "copying",
            RotationPhase::Promoting => "promoting",
            RotationPhase::Switching => "switching",
        };
        f.write_str(name)
    }
}

/// The two staging replicas and which one serves traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingPair {
    members: [ReplicaIdentity; 2],
    active_index: usize,
}

impl StagingPair {
    /// New pair with the first member active
    pub fn new(first: ReplicaIdentity, second: ReplicaIdentity) -> Result<Self> {
        if first == second {
            return Err(Error::InvalidRotationTarget(format!(
                "staging pair needs two distinct replicas, got {} twice",
                first
            )));
        }
        Ok(Self {
            members: [first, second],
            active_index: 0,
        })
    }

    pub fn members(&self) -> [ReplicaIdentity; 2] {
        self.members
    }

    pub fn active_index(&self) -> usize {
        self.active_index
    }

    pub fn next_index(&self) -> usize {
        (self.active_index + 1) % self.members.len()
    }

    /// The member currently serving traffic
    pub fn active(&self) -> ReplicaIdentity {
        self.members[self.active_index]
    }

    /// The member the next rotation promotes
    pub fn next(&self) -> ReplicaIdentity {
        self.members[self.next_index()]
    }

    pub fn contains(&self, identity: ReplicaIdentity) -> bool {
        self.members.contains(&identity)
    }

    /// Make the other member active
    pub fn flip(&mut self) {
        self.active_index = self.next_index();
    }
}

/// A completed rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationRecord {
    /// 1-based count of rotations within one controller run
    pub sequence: u64,
    /// Replica whose data was copied
    pub source: ReplicaIdentity,
    /// Staging replica that served traffic before
    pub from: ReplicaIdentity,
    /// Staging replica serving traffic now
    pub to: ReplicaIdentity,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RotationRecord {
    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }
}
