//! Protocol Types
//!
//! Message and command types exchanged between the leader and a robot.

use std::fmt;

/// Robot command vocabulary
///
/// `Disconnect` is a local sentinel injected when the link drops; it is never
/// accepted from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    Invalid = 0,
    LedOn = 1,
    LedOff = 2,
    DriveLeft = 3,
    DriveRight = 4,
    DriveForward = 5,
    DriveBackward = 6,
    DriveZero = 7,
    Go = 8,
    Stop = 9,
    Disconnect = 0xFF,
}

impl Action {
    /// Decode an action code, `None` if the code is outside the vocabulary
    pub fn from_code(code: u8) -> Option<Self> {
        use Action::*;
        let action = match code {
            0 => Invalid,
            1 => LedOn,
            2 => LedOff,
            3 => DriveLeft,
            4 => DriveRight,
            5 => DriveForward,
            6 => DriveBackward,
            7 => DriveZero,
            8 => Go,
            9 => Stop,
            0xFF => Disconnect,
            _ => return None,
        };
        Some(action)
    }

    /// Wire code of this action
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Priority and meta actions bypass time gating and mode restrictions
    pub fn is_priority(self) -> bool {
        use Action::*;
        match self {
            Go | Stop | Disconnect => true,
            Invalid | LedOn | LedOff | DriveLeft | DriveRight | DriveForward | DriveBackward
            | DriveZero => false,
        }
    }

    /// Whether the leader may schedule this action on a robot
    pub fn is_remote(self) -> bool {
        !matches!(self, Action::Invalid | Action::Disconnect)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Invalid => "INVALID",
            Action::LedOn => "LED ON",
            Action::LedOff => "LED OFF",
            Action::DriveLeft => "LEFT",
            Action::DriveRight => "RIGHT",
            Action::DriveForward => "FORWARD",
            Action::DriveBackward => "BACKWARD",
            Action::DriveZero => "ZERO",
            Action::Go => "GO",
            Action::Stop => "STOP",
            Action::Disconnect => "DISCONNECT",
        };
        f.write_str(name)
    }
}

/// Handshake phase of a sync request, carrying the phase-specific timing field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Stage an action; the leader wants it to run `delay_ms` after the origin timestamp
    Prepare { delay_ms: u32 },
    /// Commit the staged action, translating the leader's target by `offset_ms`
    Commit { offset_ms: i32 },
    /// Drop the staged action
    Abort,
    /// Unrecognized phase code
    Invalid(u8),
}

impl SyncPhase {
    pub const PREPARE: u8 = 1;
    pub const COMMIT: u8 = 2;
    pub const ABORT: u8 = 3;

    /// Wire code of the phase
    pub fn code(&self) -> u8 {
        match self {
            SyncPhase::Prepare { .. } => Self::PREPARE,
            SyncPhase::Commit { .. } => Self::COMMIT,
            SyncPhase::Abort => Self::ABORT,
            SyncPhase::Invalid(code) => *code,
        }
    }

    /// Raw value of the shared timing field
    pub fn timing_bits(&self) -> u32 {
        match self {
            SyncPhase::Prepare { delay_ms } => *delay_ms,
            SyncPhase::Commit { offset_ms } => *offset_ms as u32,
            SyncPhase::Abort | SyncPhase::Invalid(_) => 0,
        }
    }

    /// Rebuild a phase from its wire code and the raw timing field
    pub fn from_wire(code: u8, timing: u32) -> Self {
        match code {
            Self::PREPARE => SyncPhase::Prepare { delay_ms: timing },
            Self::COMMIT => SyncPhase::Commit {
                offset_ms: timing as i32,
            },
            Self::ABORT => SyncPhase::Abort,
            other => SyncPhase::Invalid(other),
        }
    }
}

/// Request written by the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRequest {
    /// Leader clock sample taken when the exchange started
    pub origin_timestamp: u32,
    pub phase: SyncPhase,
    /// Raw code of the action to stage; only meaningful for Prepare
    pub action_id: u8,
    /// Echoed in the response, wraps at 256
    pub sequence: u8,
}

impl SyncRequest {
    /// Create a prepare request
    pub fn prepare(origin_timestamp: u32, delay_ms: u32, action: Action, sequence: u8) -> Self {
        Self {
            origin_timestamp,
            phase: SyncPhase::Prepare { delay_ms },
            action_id: action.code(),
            sequence,
        }
    }

    /// Create a commit request
    pub fn commit(offset_ms: i32, sequence: u8) -> Self {
        Self {
            origin_timestamp: 0,
            phase: SyncPhase::Commit { offset_ms },
            action_id: 0,
            sequence,
        }
    }

    /// Create an abort request
    pub fn abort(sequence: u8) -> Self {
        Self {
            origin_timestamp: 0,
            phase: SyncPhase::Abort,
            action_id: 0,
            sequence,
        }
    }
}

/// Peripheral's answer to a sync request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncVote {
    Invalid = 0,
    VoteCommit = 1,
    VoteAbort = 2,
    Ack = 3,
    /// Command queue full; the leader may retry the commit
    Busy = 4,
    /// Commit without a live prepare carrying the same sequence
    Stale = 5,
}

impl SyncVote {
    /// Decode a vote code, mapping unknown codes to `Invalid`
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => SyncVote::VoteCommit,
            2 => SyncVote::VoteAbort,
            3 => SyncVote::Ack,
            4 => SyncVote::Busy,
            5 => SyncVote::Stale,
            _ => SyncVote::Invalid,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Response read back by the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncResponse {
    /// Peripheral clock sample taken at Prepare, zero otherwise
    pub peripheral_timestamp: u32,
    pub vote: SyncVote,
    pub sequence: u8,
}

impl SyncResponse {
    /// Response without a timestamp
    pub fn new(vote: SyncVote, sequence: u8) -> Self {
        Self {
            peripheral_timestamp: 0,
            vote,
            sequence,
        }
    }

    /// Response to a prepare, carrying the peripheral's clock sample
    pub fn stamped(peripheral_timestamp: u32, vote: SyncVote, sequence: u8) -> Self {
        Self {
            peripheral_timestamp,
            vote,
            sequence,
        }
    }
}

/// An action scheduled for an absolute instant on the robot's local clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedCommand {
    pub action: Action,
    pub target_time: u32,
}

impl TimedCommand {
    pub fn new(action: Action, target_time: u32) -> Self {
        Self {
            action,
            target_time,
        }
    }

    /// Whether the command may run at local time `now`
    pub fn is_due(&self, now: u32) -> bool {
        now >= self.target_time
    }

    /// Pack into a single word so a queue slot can be read and written atomically
    pub(crate) fn pack(self) -> u64 {
        (u64::from(self.action.code()) << 32) | u64::from(self.target_time)
    }

    pub(crate) fn unpack(raw: u64) -> Self {
        let code = (raw >> 32) as u8;
        Self {
            action: Action::from_code(code).unwrap_or(Action::Invalid),
            target_time: raw as u32,
        }
    }
}
