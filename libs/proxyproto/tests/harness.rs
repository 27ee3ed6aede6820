//! Test harness for proxyproto integration tests.
//!
//! Provides an in-memory connection with arbitrary endpoints, an acceptor fed
//! through a channel, and tracing setup.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{duplex, AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Mutex};

use proxyproto::{Acceptor, Connection, Endpoint};

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,proxyproto=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// In-memory stream that reports fixed endpoints.
pub struct MemoryConn {
    io: DuplexStream,
    local: Endpoint,
    remote: Endpoint,
}

impl MemoryConn {
    /// Returns the server side and the peer's end of the stream.
    pub fn pair(remote: Endpoint, local: Endpoint) -> (Self, DuplexStream) {
        let (server, client) = duplex(64 * 1024);
        (
            Self {
                io: server,
                local,
                remote,
            },
            client,
        )
    }

    pub fn tcp(remote: &str, local: &str) -> (Self, DuplexStream) {
        Self::pair(
            Endpoint::Tcp(remote.parse::<SocketAddr>().unwrap()),
            Endpoint::Tcp(local.parse::<SocketAddr>().unwrap()),
        )
    }
}

impl AsyncRead for MemoryConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl Connection for MemoryConn {
    fn local_endpoint(&self) -> io::Result<Endpoint> {
        Ok(self.local.clone())
    }

    fn remote_endpoint(&self) -> io::Result<Endpoint> {
        Ok(self.remote.clone())
    }
}

/// Acceptor that hands out connections pushed into a channel.
#[allow(dead_code)]
pub struct ChannelAcceptor {
    rx: Mutex<mpsc::Receiver<MemoryConn>>,
    local: Endpoint,
}

impl ChannelAcceptor {
    #[allow(dead_code)]
    pub fn new(local: &str) -> (Self, mpsc::Sender<MemoryConn>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Self {
                rx: Mutex::new(rx),
                local: Endpoint::Tcp(local.parse().unwrap()),
            },
            tx,
        )
    }
}

#[async_trait]
impl Acceptor for ChannelAcceptor {
    type Conn = MemoryConn;

    async fn accept(&self) -> io::Result<MemoryConn> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "acceptor closed"))
    }

    fn local_endpoint(&self) -> io::Result<Endpoint> {
        Ok(self.local.clone())
    }
}
