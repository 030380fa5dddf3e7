//! DDD Shared Protocol
//!
//! This crate provides the synchronized command-dispatch core shared by the
//! robots and their leader: protocol types and codec, the robot-side handshake
//! state machine, the timed-command queue and the dispatch gate.

pub mod clock;
pub mod codec;
pub mod gate;
pub mod protocol;
pub mod queue;
pub mod sync;

// Re-export commonly used types at crate root
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use gate::{Dispatch, DispatchGate, Effect, GateTick, Orientation};
pub use protocol::{Action, SyncPhase, SyncRequest, SyncResponse, SyncVote, TimedCommand};
pub use sync::{SyncError, SyncStateMachine};

/// Timing parameters for the system
pub mod timing {
    /// Commands buffered between the link handler and the control loop
    pub const QUEUE_CAPACITY: usize = 4;

    /// Control loop period in milliseconds
    pub const TICK_INTERVAL_MS: u64 = 10;

    /// How far ahead of the prepare the leader schedules an action
    pub const DEFAULT_PREPARE_DELAY_MS: u32 = 3000;

    /// Uncommitted prepares are dropped after this long
    pub const PREPARE_TIMEOUT_MS: u32 = 5000;

    /// How often the link handler looks for expired prepares
    pub const PREPARE_SWEEP_INTERVAL_MS: u64 = 250;

    /// Wheel speed used for drive commands
    pub const DRIVE_SPEED: i16 = 70;

    /// Wheel speed used while spinning to find the dock
    pub const SEEK_SPEED: i16 = 60;

    /// Leader waits this long for a response
    pub const RESPONSE_TIMEOUT_MS: u64 = 2000;

    /// Commit retries after a Busy vote
    pub const COMMIT_MAX_RETRIES: u32 = 3;
}
