//! Robot mode and actuator state

use ddd_shared::{timing, Effect};
use tracing::{info, warn};

/// Robot operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RobotMode {
    /// Idle, motors off; waits for Go
    #[default]
    Off,
    /// Spinning in place until the dock sensor fires
    Seeking,
    /// On the dock; the only mode that takes regular commands
    Docked,
}

/// Dock contact sensor
pub trait DockSensor: Send {
    /// Polled once per tick while seeking
    fn is_docked(&mut self) -> bool;
}

/// Dock sensor that reports contact after a fixed number of polls
#[derive(Debug, Clone)]
pub struct SimulatedDock {
    after_ticks: u32,
    polls: u32,
}

impl SimulatedDock {
    pub fn after_ticks(after_ticks: u32) -> Self {
        Self {
            after_ticks,
            polls: 0,
        }
    }
}

impl DockSensor for SimulatedDock {
    fn is_docked(&mut self) -> bool {
        // Once docked the contact stays closed
        if self.polls < self.after_ticks {
            self.polls += 1;
        }
        self.polls >= self.after_ticks
    }
}

/// Actuator outputs plus the current mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RobotState {
    pub mode: RobotMode,
    pub led_on: bool,
    pub left_speed: i16,
    pub right_speed: i16,
}

impl RobotState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether regular (gated) commands are executed in the current mode
    pub fn accepts_commands(&self) -> bool {
        self.mode == RobotMode::Docked
    }

    /// Apply a dispatched effect
    pub fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::SetLed(on) => self.led_on = on,
            Effect::Drive { left, right } => self.set_speed(left, right),
            Effect::Start => match self.mode {
                RobotMode::Off => {
                    self.set_mode(RobotMode::Seeking);
                    self.set_speed(-timing::SEEK_SPEED, timing::SEEK_SPEED);
                }
                mode => info!("[robot] Go ignored while {:?}", mode),
            },
            Effect::Stop => {
                self.set_speed(0, 0);
                self.set_mode(RobotMode::Off);
            }
            Effect::Halt => self.set_speed(0, 0),
            Effect::Unhandled => {
                warn!("[robot] Unhandled command, stopping motors");
                self.set_speed(0, 0);
            }
        }
    }

    /// Advance the mode machine by one tick
    pub fn step(&mut self, dock: &mut impl DockSensor) {
        if self.mode == RobotMode::Seeking && dock.is_docked() {
            self.set_speed(0, 0);
            self.set_mode(RobotMode::Docked);
        }
    }

    fn set_speed(&mut self, left: i16, right: i16) {
        self.left_speed = left;
        self.right_speed = right;
    }

    fn set_mode(&mut self, mode: RobotMode) {
        if self.mode != mode {
            info!("[robot] {:?} -> {:?}", self.mode, mode);
            self.mode = mode;
        }
    }
}
