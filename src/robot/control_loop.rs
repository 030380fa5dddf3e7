//! Control loop task

use super::state::{DockSensor, RobotState};
use ddd_shared::{Clock, DispatchGate, GateTick};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Consumer context: drains the dispatch gate and drives the robot state
pub struct ControlLoop<C, D, const N: usize> {
    gate: DispatchGate<N>,
    robot: RobotState,
    clock: C,
    dock: D,
    state_tx: watch::Sender<RobotState>,
}

impl<C, D, const N: usize> ControlLoop<C, D, N>
where
    C: Clock,
    D: DockSensor,
{
    pub fn new(gate: DispatchGate<N>, clock: C, dock: D) -> Self {
        let robot = RobotState::new();
        let (state_tx, _) = watch::channel(robot);
        Self {
            gate,
            robot,
            clock,
            dock,
            state_tx,
        }
    }

    /// Current robot state
    pub fn robot(&self) -> &RobotState {
        &self.robot
    }

    /// Watch robot state changes from other tasks
    pub fn subscribe(&self) -> watch::Receiver<RobotState> {
        self.state_tx.subscribe()
    }

    /// Run one control period. Never blocks.
    pub fn tick(&mut self) -> GateTick {
        let now = self.clock.now_ms();
        let outcome = self.gate.tick(now, self.robot.accepts_commands());

        if let GateTick::Dispatched(dispatch) = outcome {
            let late = now.saturating_sub(dispatch.command.target_time);
            info!(
                "[robot] {} at {} (target {}, +{} ms)",
                dispatch.command.action, now, dispatch.command.target_time, late
            );
            self.robot.apply(dispatch.effect);
        }

        self.robot.step(&mut self.dock);

        let robot = self.robot;
        self.state_tx.send_if_modified(|published| {
            if *published == robot {
                false
            } else {
                *published = robot;
                true
            }
        });

        outcome
    }

    /// Tick forever at `period`
    pub async fn run(mut self, period: Duration) {
        info!("[robot] Control loop running every {:?}", period);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let GateTick::Discarded(command) = self.tick() {
                debug!(
                    "[robot] Discarded {} while {:?}",
                    command.action, self.robot.mode
                );
            }
        }
    }
}
