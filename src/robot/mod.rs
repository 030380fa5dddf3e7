//! Robot control side
//!
//! The control loop is the consumer context: every tick it asks the dispatch
//! gate for the next due command and applies the resulting effect to the
//! robot state.

mod control_loop;
mod state;

pub use control_loop::ControlLoop;
pub use state::{DockSensor, RobotMode, RobotState, SimulatedDock};
