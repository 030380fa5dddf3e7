//! TCP transport standing in for the radio link

use crate::transport::traits::{TransportListener, TransportStream};
use anyhow::Result;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

/// TCP stream wrapper implementing TransportStream
pub struct TcpTransportStream {
    inner: TcpStream,
    peer: SocketAddr,
}

impl TcpTransportStream {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            inner: stream,
            peer,
        }
    }
}

impl AsyncRead for TcpTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpTransportStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl TransportStream for TcpTransportStream {
    async fn shutdown(&mut self) -> Result<()> {
        tokio::io::AsyncWriteExt::shutdown(&mut self.inner).await?;
        Ok(())
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}

/// TCP listener accepting one leader connection at a time
pub struct TcpTransportListener {
    inner: TcpListener,
}

impl TcpTransportListener {
    /// Bind to `address`
    pub async fn bind(address: &str) -> Result<Self> {
        let inner = TcpListener::bind(address).await?;
        Ok(Self { inner })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    type Stream = TcpTransportStream;

    async fn accept(&mut self) -> Result<Self::Stream> {
        let (stream, peer) = self.inner.accept().await?;
        // Responses are tiny and latency-sensitive
        stream.set_nodelay(true)?;
        Ok(TcpTransportStream::new(stream, peer))
    }

    fn name(&self) -> &'static str {
        "TCP"
    }
}
