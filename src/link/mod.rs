//! Link to the leader
//!
//! This module handles:
//! - Accepting the leader over a pluggable transport
//! - Decoding sync requests and direct commands
//! - Writing sync responses back
//! - Flushing the command queue when the leader drops

mod server;

pub use server::{LinkEvent, LinkServer, LinkStatus};
