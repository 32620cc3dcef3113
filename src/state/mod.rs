//! State Management Module
//!
//! Persistent tracking of completed rotations.

mod ledger;

pub use ledger::RotationLedger;
