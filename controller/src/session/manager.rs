//! Session manager for the set of peripherals

use super::connection::PeripheralSession;
use ddd_shared::Action;
use futures::future::join_all;
use std::time::Duration;
use tracing::{error, info};

/// Owns one session per peripheral robot
pub struct SessionManager {
    sessions: Vec<PeripheralSession>,
}

impl SessionManager {
    /// Create sessions for `addrs`; robot N is `addrs[N]`
    pub fn new(addrs: &[String], response_timeout: Duration) -> Self {
        let sessions = addrs
            .iter()
            .enumerate()
            .map(|(id, addr)| PeripheralSession::new(id, addr.clone(), response_timeout))
            .collect();
        Self { sessions }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions(&self) -> &[PeripheralSession] {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut [PeripheralSession] {
        &mut self.sessions
    }

    /// Whether every peripheral currently has a link
    pub fn all_connected(&self) -> bool {
        self.sessions.iter().all(PeripheralSession::is_connected)
    }

    /// Connect, or reconnect, every peripheral that is down
    ///
    /// Returns true when all of them are up afterwards.
    pub async fn ensure_connected(&mut self) -> bool {
        let results = join_all(self.sessions.iter_mut().map(|session| async move {
            let was_connected = session.is_connected();
            let result = session.connect().await;
            (session.id, was_connected, result)
        }))
        .await;

        let mut all_up = true;
        for (id, was_connected, result) in results {
            match result {
                Ok(()) if !was_connected => info!("[leader] Robot {} link up", id),
                Ok(()) => {}
                Err(e) => {
                    error!("[leader] Robot {} unreachable: {}", id, e);
                    all_up = false;
                }
            }
        }
        all_up
    }

    /// Send a direct command to every connected peripheral
    ///
    /// Returns the number of robots it was delivered to.
    pub async fn send_direct_all(&mut self, action: Action) -> usize {
        let results = join_all(
            self.sessions
                .iter_mut()
                .filter(|session| session.is_connected())
                .map(|session| session.send_direct(action)),
        )
        .await;
        results.iter().filter(|result| result.is_ok()).count()
    }

    /// Close every link
    pub async fn disconnect_all(&mut self) {
        join_all(self.sessions.iter_mut().map(PeripheralSession::disconnect)).await;
    }
}
