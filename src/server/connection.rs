//! Accepted viewer connections
//!
//! hyper drives every connection; this wraps the socket underneath it with
//! the two rules a long-lived stream needs:
//! - a write that makes no progress for `write_timeout` fails with
//!   `TimedOut`, so a viewer that stopped reading loses its connection and
//!   its session
//! - once a whole request head has arrived, EOF on the read half is a
//!   half-close, not a hang-up: the response keeps flowing until a write
//!   fails. Every response closes its connection, so there is never a second
//!   request to wait for.

use axum::serve::Listener;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Sleep};
use tracing::{debug, trace, warn};

/// Pause after a failed accept, usually fd exhaustion
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// TCP listener handing out [`ViewerIo`] connections to `axum::serve`
pub struct ViewerListener {
    inner: TcpListener,
    write_timeout: Duration,
}

impl ViewerListener {
    pub fn new(inner: TcpListener, write_timeout: Duration) -> Self {
        Self {
            inner,
            write_timeout,
        }
    }
}

impl Listener for ViewerListener {
    type Io = ViewerIo<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.inner.accept().await {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    trace!(%peer, "Connection accepted");
                    return (ViewerIo::new(stream, self.write_timeout), peer);
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

/// Socket wrapper with a write-progress deadline and half-close tolerance
pub struct ViewerIo<S> {
    inner: S,
    write_timeout: Duration,
    stall: Option<Pin<Box<Sleep>>>,
    /// Last four bytes read, to spot the blank line ending the request head
    tail: u32,
    request_read: bool,
    read_closed: bool,
}

impl<S> ViewerIo<S> {
    pub fn new(inner: S, write_timeout: Duration) -> Self {
        Self {
            inner,
            write_timeout,
            stall: None,
            tail: 0,
            request_read: false,
            read_closed: false,
        }
    }

    fn scan_request(&mut self, data: &[u8]) {
        const CRLF_CRLF: u32 = u32::from_be_bytes(*b"\r\n\r\n");
        const LF_LF: u32 = u32::from_be_bytes(*b"\0\0\n\n");

        for &byte in data {
            if self.request_read {
                return;
            }
            self.tail = (self.tail << 8) | u32::from(byte);
            self.request_read = self.tail == CRLF_CRLF || self.tail & 0xffff == LF_LF;
        }
    }

    /// Called while the inner write is pending; fails once the deadline passes
    fn poll_stall(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        let timeout = self.write_timeout;
        let deadline = self.stall.get_or_insert_with(|| Box::pin(sleep(timeout)));

        if deadline.as_mut().poll(cx).is_pending() {
            return Poll::Pending;
        }

        self.stall = None;
        debug!(
            timeout_ms = timeout.as_millis() as u64,
            "Viewer stopped reading, dropping connection"
        );
        Poll::Ready(io::Error::new(
            io::ErrorKind::TimedOut,
            "viewer made no progress within the write timeout",
        ))
    }

    fn wrote<T>(&mut self, result: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        self.stall = None;
        result
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ViewerIo<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.read_closed {
            return Poll::Pending;
        }

        let before = buf.filled().len();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
        if !matches!(polled, Poll::Ready(Ok(()))) {
            return polled;
        }

        let read = buf.filled().len() - before;
        if read > 0 {
            this.scan_request(&buf.filled()[before..]);
        } else if buf.remaining() > 0 && this.request_read {
            trace!("Viewer half-closed its connection");
            this.read_closed = true;
            return Poll::Pending;
        }
        polled
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ViewerIo<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, data) {
            Poll::Pending => this.poll_stall(cx).map(Err),
            ready => this.wrote(ready),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write_vectored(cx, bufs) {
            Poll::Pending => this.poll_stall(cx).map(Err),
            ready => this.wrote(ready),
        }
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Pending => this.poll_stall(cx).map(Err),
            ready => {
                this.stall = None;
                ready
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
