//! Connection wrapper that consumes a PROXY header before the payload.
//!
//! [`ProxiedConn`] parses the header lazily: the first read, [`header`]
//! call or endpoint query drives the parse, and every later call reuses the
//! cached outcome. Bytes that arrived together with the header are served
//! before anything else is read from the underlying stream.
//!
//! [`header`]: ProxiedConn::header

use std::future::{poll_fn, Future};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{sleep_until, Instant, Sleep};
use tracing::debug;

use crate::codec;
use crate::error::{ParseError, ParseErrorKind};
use crate::header::Header;
use crate::model::Endpoint;

/// Bytes pulled from the stream per read while the header is incomplete.
const PARSE_CHUNK: usize = 256;

/// A byte stream that knows its own endpoints.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {
    /// Endpoint this side of the connection is bound to.
    fn local_endpoint(&self) -> io::Result<Endpoint>;

    /// Endpoint of the peer.
    fn remote_endpoint(&self) -> io::Result<Endpoint>;
}

impl Connection for TcpStream {
    fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.local_addr().map(Endpoint::Tcp)
    }

    fn remote_endpoint(&self) -> io::Result<Endpoint> {
        self.peer_addr().map(Endpoint::Tcp)
    }
}

#[cfg(unix)]
impl Connection for tokio::net::UnixStream {
    fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.local_addr().map(|addr| unix_endpoint(&addr))
    }

    fn remote_endpoint(&self) -> io::Result<Endpoint> {
        self.peer_addr().map(|addr| unix_endpoint(&addr))
    }
}

/// Unnamed sockets map to an empty path.
#[cfg(unix)]
pub(crate) fn unix_endpoint(addr: &tokio::net::unix::SocketAddr) -> Endpoint {
    use std::os::unix::ffi::OsStrExt;

    use crate::model::{UnixAddr, UnixKind};

    let path = addr
        .as_pathname()
        .map(|p| p.as_os_str().as_bytes().to_vec())
        .unwrap_or_default();
    Endpoint::Unix(UnixAddr::new(UnixKind::Stream, path))
}

/// Deadline that governs header parsing.
///
/// The earlier of the header deadline and the caller's live read deadline;
/// `None` when neither is set.
pub fn effective_deadline(header: Option<Instant>, live: Option<Instant>) -> Option<Instant> {
    match (header, live) {
        (Some(h), Some(l)) => Some(h.min(l)),
        (h, l) => h.or(l),
    }
}

/// A resettable timer for an optional deadline.
#[derive(Default)]
struct Deadline {
    at: Option<Instant>,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Deadline {
    fn set(&mut self, at: Option<Instant>) {
        self.at = at;
        let Some(at) = at else {
            self.sleep = None;
            return;
        };
        if let Some(sleep) = self.sleep.as_mut() {
            sleep.as_mut().reset(at);
        } else {
            self.sleep = Some(Box::pin(sleep_until(at)));
        }
    }

    /// Returns true once the deadline has passed; otherwise registers a wakeup.
    fn poll_expired(&mut self, cx: &mut Context<'_>) -> bool {
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
            None => false,
        }
    }
}

/// Result of the one-shot header parse.
type Outcome = Result<Header, ParseError>;

/// A connection whose first bytes are a PROXY header.
pub struct ProxiedConn<C> {
    inner: C,
    /// Bytes read from `inner` but not yet returned to the caller.
    buf: BytesMut,
    /// `None` until the parse settles.
    outcome: Option<Outcome>,
    /// Bound on the whole parse, fixed at construction.
    header_deadline: Option<Instant>,
    /// Timer for the parse phase, tracking `effective_deadline`.
    parse_timer: Deadline,
    read_deadline: Deadline,
    write_deadline: Deadline,
}

impl<C: Connection> ProxiedConn<C> {
    /// Wrap `inner`, bounding the header parse by `header_deadline`.
    pub fn new(inner: C, header_deadline: Option<Instant>) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            outcome: None,
            header_deadline,
            parse_timer: Deadline::default(),
            read_deadline: Deadline::default(),
            write_deadline: Deadline::default(),
        }
    }

    /// Wrap `inner`, requiring the header within `timeout` from now.
    ///
    /// A zero timeout disables the header deadline.
    pub fn with_header_timeout(inner: C, timeout: Duration) -> Self {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        Self::new(inner, deadline)
    }

    /// The decoded header, parsing it first if necessary.
    ///
    /// On failure the error carries every byte consumed from the stream.
    pub async fn header(&mut self) -> Result<&Header, ParseError> {
        self.settle().await.as_ref().map_err(Clone::clone)
    }

    /// Destination from the header, or the raw local endpoint.
    pub async fn local_endpoint(&mut self) -> io::Result<Endpoint> {
        let from_header = self.settle().await.as_ref().ok().and_then(Header::destination);
        match from_header {
            Some(endpoint) => Ok(endpoint),
            None => self.inner.local_endpoint(),
        }
    }

    /// Source from the header, or the raw remote endpoint.
    pub async fn remote_endpoint(&mut self) -> io::Result<Endpoint> {
        let from_header = self.settle().await.as_ref().ok().and_then(Header::source);
        match from_header {
            Some(endpoint) => Ok(endpoint),
            None => self.inner.remote_endpoint(),
        }
    }

    /// Set both the read and the write deadline.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Set the read deadline; it also bounds a header parse still pending.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline.set(deadline);
    }

    /// Set the write deadline.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline.set(deadline);
    }

    /// The underlying connection.
    ///
    /// The parse reads ahead in chunks, so once it has started the stream may
    /// already be past the header. Those bytes are held by the wrapper and
    /// only come back through reads or [`into_parts`](Self::into_parts).
    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    /// The underlying connection plus the bytes the wrapper holds.
    ///
    /// After a successful parse these are the payload bytes that arrived with
    /// the header. After a failed parse they are every byte consumed from the
    /// stream, so the caller can fall back to treating it as header-less.
    pub fn into_parts(self) -> (C, BytesMut) {
        (self.inner, self.buf)
    }

    /// Drive the parse to completion and return the cached outcome.
    async fn settle(&mut self) -> &Outcome {
        let outcome = match self.outcome.take() {
            Some(outcome) => outcome,
            None => poll_fn(|cx| self.poll_parse(cx)).await,
        };
        &*self.outcome.insert(outcome)
    }

    fn poll_settle(&mut self, cx: &mut Context<'_>) -> Poll<&Outcome> {
        let outcome = match self.outcome.take() {
            Some(outcome) => outcome,
            None => ready!(self.poll_parse(cx)),
        };
        Poll::Ready(&*self.outcome.insert(outcome))
    }

    /// Read until the buffered bytes hold a header or prove there is none.
    fn poll_parse(&mut self, cx: &mut Context<'_>) -> Poll<Outcome> {
        loop {
            match codec::decode(&self.buf) {
                Ok(Some((header, consumed))) => {
                    self.buf.advance(consumed);
                    debug!(
                        version = header.version(),
                        source = ?header.source(),
                        destination = ?header.destination(),
                        buffered = self.buf.len(),
                        "PROXY header decoded"
                    );
                    self.parse_timer.set(None);
                    return Poll::Ready(Ok(header));
                }
                Ok(None) => {}
                Err(err) => return Poll::Ready(Err(self.fail(err))),
            }

            let deadline = effective_deadline(self.header_deadline, self.read_deadline.at);
            if self.parse_timer.at != deadline {
                self.parse_timer.set(deadline);
            }
            if self.parse_timer.poll_expired(cx) {
                let err = ParseError::new(ParseErrorKind::TimedOut, &self.buf);
                return Poll::Ready(Err(self.fail(err)));
            }

            let mut chunk = [0u8; PARSE_CHUNK];
            let mut read_buf = ReadBuf::new(&mut chunk);
            match Pin::new(&mut self.inner).poll_read(cx, &mut read_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(())) if read_buf.filled().is_empty() => {
                    let err = ParseError::new(ParseErrorKind::Truncated, &self.buf);
                    return Poll::Ready(Err(self.fail(err)));
                }
                Poll::Ready(Ok(())) => self.buf.extend_from_slice(read_buf.filled()),
                Poll::Ready(Err(e)) => {
                    let err = ParseError::io(&e, &self.buf);
                    return Poll::Ready(Err(self.fail(err)));
                }
            }
        }
    }

    /// The consumed bytes stay buffered for `into_parts`.
    fn fail(&mut self, err: ParseError) -> ParseError {
        let err = err.with_read(&self.buf);
        debug!(error = %err, read = err.read().len(), "PROXY header rejected");
        self.parse_timer.set(None);
        err
    }
}

impl<C: Connection> AsyncRead for ProxiedConn<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Err(err) = ready!(this.poll_settle(cx)) {
            return Poll::Ready(Err(err.clone().into()));
        }

        // Serve bytes that arrived with the header first
        if !this.buf.is_empty() {
            let n = this.buf.len().min(buf.remaining());
            buf.put_slice(&this.buf[..n]);
            this.buf.advance(n);
            return Poll::Ready(Ok(()));
        }

        if this.read_deadline.poll_expired(cx) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "read deadline exceeded",
            )));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<C: Connection> AsyncWrite for ProxiedConn<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_deadline.poll_expired(cx) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "write deadline exceeded",
            )));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
