//! Sessions with the peripheral robots
//!
//! This module handles:
//! - Connecting and reconnecting each robot
//! - Framed request/response exchanges with a response timeout
//! - Direct (unsynchronized) command delivery
//! - Recording round trip times per robot

mod connection;
mod manager;

pub use connection::PeripheralSession;
pub use manager::SessionManager;
