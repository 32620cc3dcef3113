//! Rotation Module
//!
//! Blue/green rotation of the two staging replicas.

mod controller;
mod state;

pub use controller::RotationController;
pub use state::{RotationPhase, RotationRecord, StagingPair};
