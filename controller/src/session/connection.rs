//! Connection to a single peripheral

use anyhow::{anyhow, bail, Result};
use ddd_shared::codec::{self, Frame, FrameDecoder};
use ddd_shared::{Action, SyncRequest, SyncResponse};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

struct Link {
    stream: TcpStream,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
}

/// A peripheral robot as seen by the leader
pub struct PeripheralSession {
    /// Robot number
    pub id: usize,
    /// Address the robot listens on
    pub addr: String,
    link: Option<Link>,
    response_timeout: Duration,
    recorded_rtts: Vec<u32>,
}

impl PeripheralSession {
    /// Create a session without connecting
    pub fn new(id: usize, addr: impl Into<String>, response_timeout: Duration) -> Self {
        Self {
            id,
            addr: addr.into(),
            link: None,
            response_timeout,
            recorded_rtts: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Open the connection if it is not already up
    pub async fn connect(&mut self) -> Result<()> {
        if self.link.is_some() {
            return Ok(());
        }

        let stream = timeout(self.response_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| anyhow!("connect to {} timed out", self.addr))??;
        stream.set_nodelay(true)?;

        info!("[leader] Connected to robot {} at {}", self.id, self.addr);
        self.link = Some(Link {
            stream,
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; 256],
        });
        Ok(())
    }

    /// Drop the connection; the robot flushes its queue when it notices
    pub async fn disconnect(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.stream.shutdown().await {
                debug!("[leader] Shutdown of robot {}: {}", self.id, e);
            }
            info!("[leader] Disconnected from robot {}", self.id);
        }
    }

    /// Send an unsynchronized command, executed as soon as the robot reads it
    pub async fn send_direct(&mut self, action: Action) -> Result<()> {
        let result = match self.link.as_mut() {
            Some(link) => link
                .stream
                .write_all(&codec::encode(&Frame::Direct(action)))
                .await
                .map_err(Into::into),
            None => Err(anyhow!("robot {} not connected", self.id)),
        };
        self.drop_on_error(result)
    }

    /// Send a sync request and wait for its response
    pub async fn transact(&mut self, request: SyncRequest) -> Result<SyncResponse> {
        let Some(link) = self.link.as_mut() else {
            bail!("robot {} not connected", self.id);
        };
        let result = match timeout(self.response_timeout, exchange(link, request)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "robot {} did not answer seq={} within {:?}",
                self.id,
                request.sequence,
                self.response_timeout
            )),
        };
        self.drop_on_error(result)
    }

    /// Remember one round trip time measurement
    pub fn record_rtt(&mut self, rtt_ms: u32) {
        self.recorded_rtts.push(rtt_ms);
    }

    pub fn recorded_rtts(&self) -> &[u32] {
        &self.recorded_rtts
    }

    fn drop_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!("[leader] Dropping link to robot {}: {}", self.id, e);
            // A late response would desynchronize the stream
            self.link = None;
        }
        result
    }
}

async fn exchange(link: &mut Link, request: SyncRequest) -> Result<SyncResponse> {
    link.stream
        .write_all(&codec::encode(&Frame::Request(request)))
        .await?;

    loop {
        // First try to decode from existing buffer
        match link.decoder.decode_next()? {
            Some(Frame::Response(response)) => return Ok(response),
            Some(other) => warn!("[leader] Unexpected frame from robot: {:?}", other),
            None => {}
        }

        let n = link.stream.read(&mut link.read_buf).await?;
        if n == 0 {
            bail!("connection closed");
        }
        link.decoder.extend(&link.read_buf[..n]);
    }
}
