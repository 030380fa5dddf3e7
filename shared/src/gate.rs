//! Dispatch Gate
//!
//! Runs once per control-loop tick and decides what happens to the head of
//! the timed-command queue:
//!
//! - priority actions (Go, Stop, Disconnect) run immediately in any mode
//! - regular actions wait for their target time while the robot accepts them
//! - regular actions that arrive while the robot does not accept them are dropped

use tracing::debug;

use crate::protocol::{Action, TimedCommand};
use crate::queue::Consumer;
use crate::timing;

/// Mounting direction of a robot; the pair faces each other, so one is mirrored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Normal,
    Reversed,
}

impl Orientation {
    /// Robot 0 drives normally, every other id is mirrored
    pub fn for_robot(robot_id: u8) -> Self {
        if robot_id == 0 {
            Orientation::Normal
        } else {
            Orientation::Reversed
        }
    }
}

/// Side effect the control loop applies for a dispatched action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    SetLed(bool),
    Drive { left: i16, right: i16 },
    /// Begin seeking the dock
    Start,
    /// Stop driving and power down
    Stop,
    /// Link lost; stop moving but keep the current mode
    Halt,
    /// Action outside the vocabulary; motors are zeroed
    Unhandled,
}

impl Effect {
    /// Map an action to its effect for a robot mounted with `orientation`
    pub fn for_action(action: Action, orientation: Orientation, speed: i16) -> Self {
        let ahead = match orientation {
            Orientation::Normal => speed,
            Orientation::Reversed => -speed,
        };
        match action {
            Action::LedOn => Effect::SetLed(true),
            Action::LedOff => Effect::SetLed(false),
            Action::DriveLeft => Effect::Drive {
                left: -speed,
                right: speed,
            },
            Action::DriveRight => Effect::Drive {
                left: speed,
                right: -speed,
            },
            Action::DriveForward => Effect::Drive {
                left: ahead,
                right: ahead,
            },
            Action::DriveBackward => Effect::Drive {
                left: -ahead,
                right: -ahead,
            },
            Action::DriveZero => Effect::Drive { left: 0, right: 0 },
            Action::Go => Effect::Start,
            Action::Stop => Effect::Stop,
            Action::Disconnect => Effect::Halt,
            Action::Invalid => Effect::Unhandled,
        }
    }
}

/// A command released by the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub command: TimedCommand,
    pub effect: Effect,
}

/// Outcome of one gate tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateTick {
    /// Nothing queued
    Idle,
    /// Head is a gated command that is not due yet; left in place
    Waiting { due_in_ms: u32 },
    Dispatched(Dispatch),
    /// Regular command dropped because the robot does not accept it in its current mode
    Discarded(TimedCommand),
}

/// Consumer side of the timed-command queue
pub struct DispatchGate<const N: usize> {
    queue: Consumer<N>,
    orientation: Orientation,
    drive_speed: i16,
}

impl<const N: usize> DispatchGate<N> {
    pub fn new(queue: Consumer<N>, orientation: Orientation) -> Self {
        Self {
            queue,
            orientation,
            drive_speed: timing::DRIVE_SPEED,
        }
    }

    /// Override the speed used for drive effects
    pub fn with_drive_speed(mut self, drive_speed: i16) -> Self {
        self.drive_speed = drive_speed;
        self
    }

    /// Commands still queued, including one left waiting
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Inspect the queue head at local time `now`
    ///
    /// `accepting` tells whether the robot is in the mode that takes regular commands.
    pub fn tick(&mut self, now: u32, accepting: bool) -> GateTick {
        // Reuses the item peeked on an earlier tick unless it was flushed
        let Some(head) = self.queue.peek() else {
            return GateTick::Idle;
        };

        if head.action.is_priority() {
            return self.release(head);
        }

        if !accepting {
            return match self.queue.pop() {
                Some(dropped) => {
                    debug!("[gate] Dropping {} outside accepting mode", dropped.action);
                    GateTick::Discarded(dropped)
                }
                None => GateTick::Idle,
            };
        }

        if head.is_due(now) {
            self.release(head)
        } else {
            GateTick::Waiting {
                due_in_ms: head.target_time - now,
            }
        }
    }

    fn release(&mut self, head: TimedCommand) -> GateTick {
        // A flush between peek and pop means the command must not run
        match self.queue.pop() {
            Some(command) => {
                debug_assert_eq!(command, head);
                GateTick::Dispatched(Dispatch {
                    command,
                    effect: Effect::for_action(command.action, self.orientation, self.drive_speed),
                })
            }
            None => GateTick::Idle,
        }
    }
}
