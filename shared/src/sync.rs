//! Sync Protocol State Machine
//!
//! Peripheral side of the prepare/commit/abort handshake. Runs in the link
//! handler's context and is the only producer of the timed-command queue.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::protocol::{Action, SyncPhase, SyncRequest, SyncResponse, SyncVote, TimedCommand};
use crate::queue::{Producer, QueueFull};

/// Reasons a request is refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("unrecognized sync phase {0}")]
    MalformedPhase(u8),

    #[error("action code {0} cannot be scheduled remotely")]
    UnsupportedAction(u8),

    #[error("no prepared action")]
    NothingPrepared,

    #[error("commit seq={got} does not match prepared seq={prepared}")]
    SequenceMismatch { prepared: u8, got: u8 },

    #[error("prepare seq={sequence} expired before commit")]
    PrepareExpired { sequence: u8 },

    #[error(transparent)]
    QueueFull(#[from] QueueFull),
}

impl SyncError {
    /// Vote reported to the leader for this refusal
    pub fn vote(&self) -> SyncVote {
        match self {
            SyncError::MalformedPhase(_) => SyncVote::Invalid,
            SyncError::UnsupportedAction(_) => SyncVote::VoteAbort,
            SyncError::NothingPrepared
            | SyncError::SequenceMismatch { .. }
            | SyncError::PrepareExpired { .. } => SyncVote::Stale,
            SyncError::QueueFull(_) => SyncVote::Busy,
        }
    }
}

/// The single staged-action slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedAction {
    pub action: Action,
    pub sequence: u8,
    /// Leader-clock instant the action should run at
    pub controller_target: u32,
    /// Local instant after which an uncommitted prepare is dropped
    pub deadline: u32,
    /// Set once the commit has been queued
    pub committed: bool,
}

/// Translate a leader-clock instant into the local clock domain
///
/// `offset_ms` is the estimated (local - leader) clock difference.
pub fn local_target(controller_target: u32, offset_ms: i32) -> u32 {
    let target = i64::from(controller_target) + i64::from(offset_ms);
    target.clamp(0, i64::from(u32::MAX)) as u32
}

/// Handshake state for one robot
pub struct SyncStateMachine<C: Clock, const N: usize> {
    clock: C,
    queue: Producer<N>,
    prepared: Option<PreparedAction>,
    prepare_timeout_ms: u32,
}

impl<C: Clock, const N: usize> SyncStateMachine<C, N> {
    /// Create a state machine feeding `queue`
    pub fn new(clock: C, queue: Producer<N>, prepare_timeout_ms: u32) -> Self {
        Self {
            clock,
            queue,
            prepared: None,
            prepare_timeout_ms,
        }
    }

    /// Currently staged action, if any
    pub fn prepared(&self) -> Option<&PreparedAction> {
        self.prepared.as_ref()
    }

    /// Number of commands waiting for the control loop
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Handle one request from the leader and build the response
    pub fn on_request(&mut self, request: &SyncRequest) -> SyncResponse {
        let sequence = request.sequence;
        match self.apply(request) {
            Ok(response) => response,
            Err(e) => {
                warn!("[sync] Refusing {:?} (seq={}): {}", request.phase, sequence, e);
                SyncResponse::new(e.vote(), sequence)
            }
        }
    }

    fn apply(&mut self, request: &SyncRequest) -> Result<SyncResponse, SyncError> {
        let sequence = request.sequence;
        match request.phase {
            SyncPhase::Prepare { delay_ms } => {
                let action = Action::from_code(request.action_id)
                    .filter(|a| a.is_remote())
                    .ok_or(SyncError::UnsupportedAction(request.action_id))?;
                let now = self.clock.now_ms();

                if let Some(old) = self.prepared.filter(|p| !p.committed) {
                    debug!(
                        "[sync] Prepare seq={} replaces uncommitted seq={} ({})",
                        sequence, old.sequence, old.action
                    );
                }

                self.prepared = Some(PreparedAction {
                    action,
                    sequence,
                    controller_target: request.origin_timestamp.saturating_add(delay_ms),
                    deadline: now.saturating_add(self.prepare_timeout_ms),
                    committed: false,
                });
                info!("[sync] Received prepare (cmd={}, seq={})", action, sequence);
                Ok(SyncResponse::stamped(now, SyncVote::VoteCommit, sequence))
            }
            SyncPhase::Commit { offset_ms } => {
                let now = self.clock.now_ms();
                let prepared = self.prepared.as_mut().ok_or(SyncError::NothingPrepared)?;

                if prepared.sequence != sequence {
                    return Err(SyncError::SequenceMismatch {
                        prepared: prepared.sequence,
                        got: sequence,
                    });
                }
                if prepared.committed {
                    debug!("[sync] Duplicate commit (seq={}), already queued", sequence);
                    return Ok(SyncResponse::new(SyncVote::Ack, sequence));
                }
                if now > prepared.deadline {
                    self.prepared = None;
                    return Err(SyncError::PrepareExpired { sequence });
                }

                let when = local_target(prepared.controller_target, offset_ms);
                self.queue.push(TimedCommand::new(prepared.action, when))?;
                prepared.committed = true;

                info!(
                    "[sync] Acknowledging commit (seq={}), {} should run in {} ms",
                    sequence,
                    prepared.action,
                    when.saturating_sub(now)
                );
                Ok(SyncResponse::new(SyncVote::Ack, sequence))
            }
            SyncPhase::Abort => {
                self.prepared = None;
                info!("[sync] Acknowledging abort (seq={})", sequence);
                Ok(SyncResponse::new(SyncVote::Ack, sequence))
            }
            SyncPhase::Invalid(code) => Err(SyncError::MalformedPhase(code)),
        }
    }

    /// Queue an unsynchronized command to run immediately
    pub fn submit_direct(&mut self, action: Action) -> Result<(), SyncError> {
        if !action.is_remote() {
            return Err(SyncError::UnsupportedAction(action.code()));
        }
        let now = self.clock.now_ms();
        self.queue.push(TimedCommand::new(action, now))?;
        debug!("[sync] Queued direct {} at t={}", action, now);
        Ok(())
    }

    /// Drop an uncommitted prepare whose deadline has passed
    ///
    /// Returns true if a prepare was dropped.
    pub fn expire_prepared(&mut self) -> bool {
        let now = self.clock.now_ms();
        match self.prepared {
            Some(p) if !p.committed && now > p.deadline => {
                warn!(
                    "[sync] Prepare seq={} ({}) timed out, treating as abort",
                    p.sequence, p.action
                );
                self.prepared = None;
                true
            }
            _ => false,
        }
    }

    /// Flush scheduled work and tell the control loop the link is gone
    pub fn on_disconnect(&mut self) {
        let now = self.clock.now_ms();
        self.prepared = None;
        self.queue.clear();
        // Cannot fail on an empty queue
        if let Err(e) = self.queue.push(TimedCommand::new(Action::Disconnect, now)) {
            warn!("[sync] Failed to queue disconnect: {}", e);
        }
        info!("[sync] Link lost, queue flushed");
    }
}
