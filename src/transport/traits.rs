//! Transport trait abstraction for the leader link

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A point-to-point stream to the leader
#[async_trait]
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Close the transport gracefully
    async fn shutdown(&mut self) -> Result<()>;

    /// Human-readable identity of the remote end
    fn peer(&self) -> String;
}

/// Accepts incoming leader connections
#[async_trait]
pub trait TransportListener: Send {
    /// The stream type this listener produces
    type Stream: TransportStream;

    /// Wait for the next leader to connect
    async fn accept(&mut self) -> Result<Self::Stream>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
