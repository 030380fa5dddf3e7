//! Synchronized command rounds
//!
//! This module handles:
//! - Preparing an action on every robot at once
//! - Estimating each robot's clock offset from the prepare exchange
//! - Committing with per-robot offsets, or aborting everywhere
//! - Retrying commits a robot answered Busy

mod coordinator;
mod estimate;

pub use coordinator::{RoundOutcome, SyncCoordinator};
pub use estimate::ClockEstimate;
