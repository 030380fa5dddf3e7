//! Two-phase synchronized rounds across all peripherals

use super::estimate::ClockEstimate;
use crate::session::{PeripheralSession, SessionManager};
use anyhow::{bail, Result};
use ddd_shared::{timing, Action, Clock, SyncRequest, SyncVote};
use futures::future::join_all;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Pause before retrying a commit the robot answered Busy
const BUSY_BACKOFF: Duration = Duration::from_millis(100);

/// Result of one synchronized round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Every robot acknowledged; `target_ms` is on the leader clock
    Committed {
        sequence: u8,
        action: Action,
        target_ms: u32,
    },
    /// Some robot refused or failed to prepare; all were told to abort
    Aborted { sequence: u8, reason: String },
    /// Commit acknowledged by some robots only
    Diverged { sequence: u8, failed: Vec<usize> },
}

/// Runs prepare/commit/abort rounds against every peripheral at once
pub struct SyncCoordinator<C> {
    sessions: SessionManager,
    clock: C,
    sequence: u8,
    prepare_delay_ms: u32,
}

impl<C: Clock> SyncCoordinator<C> {
    /// `last_sequence` is the sequence number the first round follows
    pub fn new(sessions: SessionManager, clock: C, prepare_delay_ms: u32, last_sequence: u8) -> Self {
        Self {
            sessions,
            clock,
            sequence: last_sequence,
            prepare_delay_ms,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut SessionManager {
        &mut self.sessions
    }

    fn next_sequence(&mut self) -> u8 {
        // Wraps like the one-byte wire field
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    /// Schedule `action` on every robot at the same instant
    pub async fn run_round(&mut self, action: Action) -> RoundOutcome {
        let sequence = self.next_sequence();
        let t1 = self.clock.now_ms();
        let request = SyncRequest::prepare(t1, self.prepare_delay_ms, action, sequence);
        info!("[leader] Beginning 2PC sequence {} ({})", sequence, action);

        let clock = &self.clock;
        let prepares = join_all(
            self.sessions
                .sessions_mut()
                .iter_mut()
                .map(|session| prepare(session, clock, request)),
        )
        .await;

        let mut estimates = Vec::with_capacity(prepares.len());
        let mut refusals = Vec::new();
        for result in prepares {
            match result {
                Ok(estimate) => estimates.push(estimate),
                Err(e) => refusals.push(e.to_string()),
            }
        }

        if !refusals.is_empty() {
            let reason = refusals.join("; ");
            warn!("[leader] Aborting sequence {}: {}", sequence, reason);
            self.abort_all(sequence, None).await;
            return RoundOutcome::Aborted { sequence, reason };
        }

        let commits = join_all(
            self.sessions
                .sessions_mut()
                .iter_mut()
                .zip(&estimates)
                .map(|(session, estimate)| commit(session, sequence, estimate.offset_ms)),
        )
        .await;

        let failed: Vec<usize> = commits
            .into_iter()
            .enumerate()
            .filter_map(|(id, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    warn!("[leader] Robot {} commit failed: {}", id, e);
                    Some(id)
                }
            })
            .collect();

        if failed.is_empty() {
            let target_ms = t1.wrapping_add(self.prepare_delay_ms);
            info!("[leader] Sequence {} committed for t={}", sequence, target_ms);
            RoundOutcome::Committed {
                sequence,
                action,
                target_ms,
            }
        } else {
            // Clear the prepare a Busy robot still holds
            self.abort_all(sequence, Some(failed.as_slice())).await;
            RoundOutcome::Diverged { sequence, failed }
        }
    }

    /// Send an unsynchronized command to every connected robot
    pub async fn send_direct(&mut self, action: Action) -> usize {
        let delivered = self.sessions.send_direct_all(action).await;
        info!(
            "[leader] Sent {} directly to {}/{} robots",
            action,
            delivered,
            self.sessions.len()
        );
        delivered
    }

    async fn abort_all(&mut self, sequence: u8, only: Option<&[usize]>) {
        let results = join_all(
            self.sessions
                .sessions_mut()
                .iter_mut()
                .filter(|session| session.is_connected())
                .filter(|session| only.map_or(true, |ids| ids.contains(&session.id)))
                .map(|session| async move {
                    let id = session.id;
                    (id, session.transact(SyncRequest::abort(sequence)).await)
                }),
        )
        .await;

        for (id, result) in results {
            match result {
                Ok(response) if response.vote == SyncVote::Ack => {
                    debug!("[leader] Robot {} aborted sequence {}", id, sequence);
                }
                Ok(response) => warn!(
                    "[leader] Robot {} answered abort with {:?}",
                    id, response.vote
                ),
                Err(e) => warn!("[leader] Robot {} abort failed: {}", id, e),
            }
        }
    }
}

async fn prepare<C: Clock>(
    session: &mut PeripheralSession,
    clock: &C,
    request: SyncRequest,
) -> Result<ClockEstimate> {
    let t1 = request.origin_timestamp;
    let response = session.transact(request).await?;
    let t4 = clock.now_ms();

    let estimate = ClockEstimate::from_exchange(t1, response.peripheral_timestamp, t4);
    session.record_rtt(estimate.rtt_ms);
    info!(
        "[leader] Robot {} estimated RTT: {} ms, offset: {} ms",
        session.id, estimate.rtt_ms, estimate.offset_ms
    );

    if response.sequence != request.sequence {
        bail!(
            "robot {} answered seq={} for seq={}",
            session.id,
            response.sequence,
            request.sequence
        );
    }
    if response.vote != SyncVote::VoteCommit {
        bail!("robot {} voted {:?}", session.id, response.vote);
    }
    Ok(estimate)
}

async fn commit(session: &mut PeripheralSession, sequence: u8, offset_ms: i32) -> Result<()> {
    let request = SyncRequest::commit(offset_ms, sequence);
    let mut retries = 0;

    loop {
        let response = session.transact(request).await?;
        if response.sequence != sequence {
            bail!(
                "robot {} acknowledged seq={} for seq={}",
                session.id,
                response.sequence,
                sequence
            );
        }

        match response.vote {
            SyncVote::Ack => return Ok(()),
            SyncVote::Busy if retries < timing::COMMIT_MAX_RETRIES => {
                retries += 1;
                warn!(
                    "[leader] Robot {} busy, retrying commit seq={} ({}/{})",
                    session.id,
                    sequence,
                    retries,
                    timing::COMMIT_MAX_RETRIES
                );
                sleep(BUSY_BACKOFF).await;
            }
            vote => bail!("robot {} answered commit with {:?}", session.id, vote),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddd_shared::codec::{self, Frame, FrameDecoder};
    use ddd_shared::queue::{self, Consumer};
    use ddd_shared::{ManualClock, MonotonicClock, SyncStateMachine, TimedCommand};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::Instant;

    /// In-process robot: a real state machine behind a TCP listener
    ///
    /// Its clock is frozen at `clock_ms`; `prefill` commands that never come
    /// due are queued first.
    async fn spawn_peripheral<const N: usize>(clock_ms: u32, prefill: usize) -> (String, Consumer<N>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let (mut tx, rx) = queue::channel::<N>();
        for _ in 0..prefill {
            tx.push(TimedCommand::new(Action::LedOn, u32::MAX)).unwrap();
        }
        let mut sync = SyncStateMachine::new(ManualClock::new(clock_ms), tx, 5000);

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 64];
            loop {
                let n = match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                decoder.extend(&buf[..n]);
                while let Ok(Some(frame)) = decoder.decode_next() {
                    match frame {
                        Frame::Request(request) => {
                            let response = sync.on_request(&request);
                            let reply = codec::encode(&Frame::Response(response));
                            if stream.write_all(&reply).await.is_err() {
                                return;
                            }
                        }
                        Frame::Direct(action) => {
                            let _ = sync.submit_direct(action);
                        }
                        Frame::Response(_) => {}
                    }
                }
            }
        });

        (addr, rx)
    }

    async fn coordinator(addrs: &[String]) -> SyncCoordinator<MonotonicClock> {
        let mut sessions = SessionManager::new(addrs, Duration::from_secs(2));
        sessions.ensure_connected().await;
        SyncCoordinator::new(sessions, MonotonicClock::start(), 3000, 0)
    }

    #[tokio::test]
    async fn test_round_commits_on_both_robots() {
        let (addr0, mut rx0) = spawn_peripheral::<4>(100_000, 0).await;
        let (addr1, mut rx1) = spawn_peripheral::<4>(7_000, 0).await;
        let mut leader = coordinator(&[addr0, addr1]).await;
        assert!(leader.sessions().all_connected());

        let outcome = leader.run_round(Action::DriveForward).await;
        assert!(matches!(
            outcome,
            RoundOutcome::Committed { sequence: 1, action: Action::DriveForward, .. }
        ));

        // Each robot schedules the action `delay` after its own clock reading,
        // less half the measured round trip
        for (rx, robot_now) in [(&mut rx0, 100_000u32), (&mut rx1, 7_000)] {
            let command = rx.pop().expect("command queued");
            assert_eq!(command.action, Action::DriveForward);
            assert!(command.target_time <= robot_now + 3000);
            assert!(command.target_time + 500 >= robot_now + 3000);
        }

        for session in leader.sessions().sessions() {
            assert_eq!(session.recorded_rtts().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_refused_prepare_aborts_everywhere() {
        let (addr0, mut rx0) = spawn_peripheral::<4>(0, 0).await;
        let (addr1, mut rx1) = spawn_peripheral::<4>(0, 0).await;
        let mut leader = coordinator(&[addr0, addr1]).await;

        let outcome = leader.run_round(Action::Invalid).await;
        match outcome {
            RoundOutcome::Aborted { sequence, reason } => {
                assert_eq!(sequence, 1);
                assert!(reason.contains("VoteAbort"));
            }
            other => panic!("expected abort, got {:?}", other),
        }
        assert!(rx0.is_empty());
        assert!(rx1.is_empty());
    }

    #[tokio::test]
    async fn test_busy_robot_exhausts_retries() {
        let (addr0, mut rx0) = spawn_peripheral::<4>(0, 0).await;
        let (addr1, rx1) = spawn_peripheral::<1>(0, 1).await;
        let mut leader = coordinator(&[addr0, addr1]).await;

        let started = Instant::now();
        let outcome = leader.run_round(Action::LedOff).await;
        assert_eq!(outcome, RoundOutcome::Diverged { sequence: 1, failed: vec![1] });
        assert!(started.elapsed() >= BUSY_BACKOFF * timing::COMMIT_MAX_RETRIES);

        assert_eq!(rx0.pop().map(|c| c.action), Some(Action::LedOff));
        // Existing item untouched
        assert_eq!(rx1.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_robot_aborts_round() {
        let (addr0, mut rx0) = spawn_peripheral::<4>(0, 0).await;
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let mut sessions = SessionManager::new(&[addr0, closed], Duration::from_millis(500));
        assert!(!sessions.ensure_connected().await);
        let mut leader = SyncCoordinator::new(sessions, MonotonicClock::start(), 3000, 0);

        let outcome = leader.run_round(Action::DriveLeft).await;
        assert!(matches!(outcome, RoundOutcome::Aborted { .. }));
        assert!(rx0.is_empty());

        // The reachable robot is still usable afterwards
        let outcome = leader.run_round(Action::DriveLeft).await;
        assert!(matches!(outcome, RoundOutcome::Aborted { sequence: 2, .. }));
    }

    #[tokio::test]
    async fn test_direct_command_delivery() {
        let (addr0, mut rx0) = spawn_peripheral::<4>(0, 0).await;
        let mut leader = coordinator(&[addr0]).await;

        assert_eq!(leader.send_direct(Action::Go).await, 1);

        let deadline = Instant::now() + Duration::from_secs(2);
        while rx0.is_empty() {
            assert!(Instant::now() < deadline, "direct command never arrived");
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(rx0.pop(), Some(TimedCommand::new(Action::Go, 0)));
    }

    #[test]
    fn test_sequence_wraps() {
        let sessions = SessionManager::new(&[], Duration::from_secs(1));
        let mut leader = SyncCoordinator::new(sessions, ManualClock::new(0), 3000, 254);
        assert_eq!(leader.next_sequence(), 255);
        assert_eq!(leader.next_sequence(), 0);
    }
}
