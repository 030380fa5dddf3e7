//! Link server: accepts the leader and feeds the sync state machine
//!
//! This is the robot's wireless-event context. It is the only owner of the
//! [`SyncStateMachine`], and therefore of the queue's producer end.

use crate::transport::{TransportListener, TransportStream};
use anyhow::{anyhow, Result};
use ddd_shared::codec::{self, CodecError, Frame, FrameDecoder};
use ddd_shared::{timing, Clock, SyncStateMachine};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Events emitted by the link server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A leader connected
    Connected { peer: String },
    /// The leader went away; the queue has been flushed
    Disconnected { peer: String, reason: String },
    /// Accepting a connection failed
    AcceptFailed { reason: String },
}

/// Shared view of whether a leader is connected
#[derive(Debug, Clone, Default)]
pub struct LinkStatus(Arc<AtomicBool>);

impl LinkStatus {
    pub fn is_connected(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, connected: bool) {
        self.0.store(connected, Ordering::Release);
    }
}

/// Serves one leader connection at a time
pub struct LinkServer<L, C: Clock, const N: usize> {
    listener: L,
    sync: SyncStateMachine<C, N>,
    status: LinkStatus,
    event_tx: mpsc::Sender<LinkEvent>,
    accept_backoff: Duration,
}

impl<L, C, const N: usize> LinkServer<L, C, N>
where
    L: TransportListener,
    C: Clock + 'static,
{
    /// Create a link server and the channel its events are reported on
    pub fn new(listener: L, sync: SyncStateMachine<C, N>) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (event_tx, event_rx) = mpsc::channel(16);
        let server = Self {
            listener,
            sync,
            status: LinkStatus::default(),
            event_tx,
            accept_backoff: Duration::from_secs(1),
        };
        (server, event_rx)
    }

    /// Handle for querying the connection state
    pub fn status(&self) -> LinkStatus {
        self.status.clone()
    }

    /// Accept and serve leaders forever
    pub async fn run(mut self) {
        info!("[link] Waiting for leader over {}", self.listener.name());

        loop {
            let mut stream = match self.listener.accept().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("[link] Accept failed: {}", e);
                    emit(
                        &self.event_tx,
                        LinkEvent::AcceptFailed {
                            reason: e.to_string(),
                        },
                    )
                    .await;
                    tokio::time::sleep(self.accept_backoff).await;
                    continue;
                }
            };

            let peer = stream.peer();
            self.status.set(true);
            emit(&self.event_tx, LinkEvent::Connected { peer: peer.clone() }).await;

            let reason = match handle_connection(&mut stream, &mut self.sync).await {
                Ok(()) => "connection closed".to_string(),
                Err(e) => e.to_string(),
            };
            if let Err(e) = TransportStream::shutdown(&mut stream).await {
                debug!("[link] Shutdown after disconnect: {}", e);
            }

            self.status.set(false);
            self.sync.on_disconnect();
            emit(&self.event_tx, LinkEvent::Disconnected { peer, reason }).await;
        }
    }
}

async fn emit(event_tx: &mpsc::Sender<LinkEvent>, event: LinkEvent) {
    // Nobody listening is fine
    let _ = event_tx.send(event).await;
}

/// Serve an active leader connection until it drops
async fn handle_connection<S, C, const N: usize>(
    stream: &mut S,
    sync: &mut SyncStateMachine<C, N>,
) -> Result<()>
where
    S: TransportStream,
    C: Clock,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let mut decoder = FrameDecoder::new();
    let mut read_buf = vec![0u8; 256];

    let mut sweep = interval(Duration::from_millis(timing::PREPARE_SWEEP_INTERVAL_MS));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = sweep.tick() => {
                sync.expire_prepared();
            }

            result = reader.read(&mut read_buf) => {
                let n = match result {
                    Ok(0) => return Ok(()),
                    Ok(n) => n,
                    Err(e) => return Err(anyhow!("Read error: {}", e)),
                };
                decoder.extend(&read_buf[..n]);

                // Process all complete frames
                loop {
                    match decoder.decode_next() {
                        Ok(Some(frame)) => {
                            if let Some(reply) = handle_frame(frame, sync) {
                                writer.write_all(&codec::encode(&reply)).await?;
                            }
                        }
                        Ok(None) => break,
                        Err(e @ CodecError::InvalidLength(_)) => {
                            return Err(anyhow!("Lost framing: {}", e));
                        }
                        Err(e) => warn!("[link] Dropping malformed frame: {}", e),
                    }
                }
            }
        }
    }
}

/// Route one inbound frame, returning the reply to send, if any
fn handle_frame<C: Clock, const N: usize>(
    frame: Frame,
    sync: &mut SyncStateMachine<C, N>,
) -> Option<Frame> {
    match frame {
        Frame::Request(request) => {
            debug!(
                "[link] Request seq={} phase={:?}",
                request.sequence, request.phase
            );
            Some(Frame::Response(sync.on_request(&request)))
        }
        Frame::Direct(action) => {
            if let Err(e) = sync.submit_direct(action) {
                warn!("[link] Direct {} dropped: {}", action, e);
            }
            None
        }
        Frame::Response(_) => {
            warn!("[link] Leader sent a response frame, ignoring");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpTransportListener;
    use ddd_shared::queue::{self, Consumer};
    use ddd_shared::{Action, ManualClock, SyncRequest, SyncResponse, SyncVote, TimedCommand};
    use std::net::SocketAddr;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    async fn start() -> (SocketAddr, Consumer<4>, ManualClock, LinkStatus, mpsc::Receiver<LinkEvent>) {
        let clock = ManualClock::new(500);
        let (tx, rx) = queue::channel::<4>();
        let sync = SyncStateMachine::new(clock.clone(), tx, 5000);
        let listener = TcpTransportListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (server, events) = LinkServer::new(listener, sync);
        let status = server.status();
        tokio::spawn(server.run());
        (addr, rx, clock, status, events)
    }

    async fn next_event(events: &mut mpsc::Receiver<LinkEvent>) -> LinkEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    async fn exchange(stream: &mut TcpStream, decoder: &mut FrameDecoder, request: SyncRequest) -> SyncResponse {
        stream
            .write_all(&codec::encode(&Frame::Request(request)))
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        loop {
            if let Some(Frame::Response(resp)) = decoder.decode_next().unwrap() {
                return resp;
            }
            let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
                .await
                .expect("response timeout")
                .unwrap();
            assert!(n > 0, "robot closed the link");
            decoder.extend(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_handshake_over_link() {
        let (addr, mut rx, _clock, status, mut events) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(next_event(&mut events).await, LinkEvent::Connected { .. }));
        assert!(status.is_connected());

        let mut decoder = FrameDecoder::new();
        let vote = exchange(&mut stream, &mut decoder, SyncRequest::prepare(400, 600, Action::DriveForward, 5)).await;
        assert_eq!(vote, SyncResponse::stamped(500, SyncVote::VoteCommit, 5));

        let ack = exchange(&mut stream, &mut decoder, SyncRequest::commit(20, 5)).await;
        assert_eq!(ack, SyncResponse::new(SyncVote::Ack, 5));

        assert_eq!(rx.pop(), Some(TimedCommand::new(Action::DriveForward, 1020)));
    }

    #[tokio::test]
    async fn test_direct_command_and_disconnect() {
        let (addr, mut rx, _clock, status, mut events) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        next_event(&mut events).await;

        stream
            .write_all(&codec::encode(&Frame::Direct(Action::Go)))
            .await
            .unwrap();
        // Abort is answered, which also proves the direct frame was handled first
        let mut decoder = FrameDecoder::new();
        exchange(&mut stream, &mut decoder, SyncRequest::abort(1)).await;
        assert_eq!(rx.len(), 1);

        drop(stream);
        assert!(matches!(next_event(&mut events).await, LinkEvent::Disconnected { .. }));
        assert!(!status.is_connected());

        // Disconnect flushed the pending Go and left only the sentinel
        assert_eq!(rx.pop(), Some(TimedCommand::new(Action::Disconnect, 500)));
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn test_serves_next_leader_after_disconnect() {
        let (addr, _rx, _clock, _status, mut events) = start().await;

        let first = TcpStream::connect(addr).await.unwrap();
        next_event(&mut events).await;
        drop(first);
        next_event(&mut events).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(next_event(&mut events).await, LinkEvent::Connected { .. }));

        let mut decoder = FrameDecoder::new();
        let resp = exchange(&mut second, &mut decoder, SyncRequest::commit(0, 1)).await;
        assert_eq!(resp.vote, SyncVote::Stale);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let (addr, _rx, _clock, _status, mut events) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        next_event(&mut events).await;

        // Unknown channel, well-formed length
        stream.write_all(&[0, 0, 0, 2, 0x10, 0x00]).await.unwrap();

        let mut decoder = FrameDecoder::new();
        let request = SyncRequest {
            origin_timestamp: 0,
            phase: ddd_shared::SyncPhase::Invalid(9),
            action_id: 0,
            sequence: 77,
        };
        let resp = exchange(&mut stream, &mut decoder, request).await;
        assert_eq!(resp, SyncResponse::new(SyncVote::Invalid, 77));
    }
}
