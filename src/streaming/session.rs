//! Per-viewer stream sessions
//!
//! A session turns the latest-frame slot into one viewer's multipart body.
//! It is pulled by the connection: the next frame is read from the slot only
//! once the previous part has been taken, so a viewer that falls behind skips
//! straight to the newest frame instead of building a backlog. Whoever drives
//! the body owns the socket; dropping the body ends the session and gives its
//! place in the [`SessionRegistry`] back.

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use super::multipart::MultipartFormat;
use super::slot::{LatestFrameSlot, ReadOutcome, SlotError, NO_FRAME};

/// Tracks admitted stream sessions and enforces the optional cap
#[derive(Debug)]
pub struct SessionRegistry {
    max_sessions: Option<usize>,
    active: AtomicUsize,
    total: AtomicU64,
}

impl SessionRegistry {
    pub fn new(max_sessions: Option<usize>) -> Self {
        SessionRegistry {
            max_sessions,
            active: AtomicUsize::new(0),
            total: AtomicU64::new(0),
        }
    }

    /// Reserves a session slot, or `None` when the cap is reached.
    ///
    /// The slot is given back when the returned guard drops.
    pub fn try_admit(self: &Arc<Self>) -> Option<SessionGuard> {
        let max = self.max_sessions;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match max {
                Some(max) if n >= max => None,
                _ => Some(n + 1),
            })
            .ok()?;

        let id = self.total.fetch_add(1, Ordering::Relaxed) + 1;
        Some(SessionGuard {
            id,
            registry: Arc::clone(self),
        })
    }

    /// Number of sessions currently streaming
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Number of sessions admitted since creation
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn max_sessions(&self) -> Option<usize> {
        self.max_sessions
    }
}

/// Admission ticket for one session; releases its place on drop
#[derive(Debug)]
pub struct SessionGuard {
    id: u64,
    registry: Arc<SessionRegistry>,
}

impl SessionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Everything a session needs besides its connection
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub slot: Arc<LatestFrameSlot>,
    pub format: Arc<MultipartFormat>,
    /// Longest a session waits on the slot in one go
    pub liveness_timeout: Duration,
    /// Flips to `true` when the server is stopping
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Streaming,
    Closed,
}

/// Why a session ended. None of these are errors for the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The connection dropped the body: the viewer left, a write failed or
    /// a write made no progress within the write timeout
    ClientGone,
    /// Producer stopped and the slot was closed
    SlotClosed,
    /// Server is shutting down
    Shutdown,
}

/// One viewer: reads the latest-frame slot at its own pace and hands out the
/// multipart body chunk by chunk.
pub struct StreamSession {
    guard: SessionGuard,
    ctx: SessionContext,
    state: SessionState,
    pending: VecDeque<Bytes>,
    last_sent: u64,
    frames_sent: u64,
    bytes_sent: u64,
}

impl StreamSession {
    pub fn new(guard: SessionGuard, ctx: SessionContext) -> Self {
        debug!(session_id = guard.id(), "Stream session accepted");
        StreamSession {
            guard,
            ctx,
            state: SessionState::Accepted,
            pending: VecDeque::with_capacity(2),
            last_sent: NO_FRAME,
            frames_sent: 0,
            bytes_sent: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.guard.id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Next chunk of the multipart body.
    ///
    /// A part goes out as header, frame and trailer chunks; once its header
    /// is out the rest of the part follows even if shutdown fires meanwhile.
    pub async fn next_chunk(&mut self) -> Result<Bytes, SessionEnd> {
        if self.state == SessionState::Closed {
            return Err(SessionEnd::Shutdown);
        }
        if let Some(chunk) = self.pending.pop_front() {
            return Ok(chunk);
        }
        self.state = SessionState::Streaming;

        loop {
            if *self.ctx.shutdown.borrow() {
                return Err(SessionEnd::Shutdown);
            }

            let outcome = tokio::select! {
                outcome = self.ctx.slot.read_latest(self.last_sent, self.ctx.liveness_timeout) => outcome,
                changed = self.ctx.shutdown.changed() => match changed {
                    Ok(()) => continue,
                    Err(_) => return Err(SessionEnd::Shutdown),
                },
            };

            match outcome {
                Ok(ReadOutcome::Frame { frame, seq }) => {
                    let part = self.ctx.format.part(seq, frame);
                    self.last_sent = seq;
                    self.frames_sent += 1;
                    self.bytes_sent += part.wire_len() as u64;

                    let [header, data, trailer] = part.into_chunks();
                    self.pending.push_back(data);
                    self.pending.push_back(trailer);
                    return Ok(header);
                }
                Ok(ReadOutcome::NotYetAvailable) => {
                    trace!(session_id = self.id(), "No new frame within liveness timeout");
                }
                Err(SlotError::Closed) => return Err(SessionEnd::SlotClosed),
            }
        }
    }

    /// The session as an HTTP body stream. The stream ends on shutdown or
    /// when the slot closes; dropping it early counts as the client leaving.
    pub fn into_body(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        stream::unfold(self, |mut session| async move {
            match session.next_chunk().await {
                Ok(chunk) => Some((Ok(chunk), session)),
                Err(end) => {
                    session.close(end);
                    None
                }
            }
        })
    }

    /// Marks the session closed and logs how it went. Later calls are no-ops.
    pub fn close(&mut self, end: SessionEnd) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.pending.clear();

        info!(
            session_id = self.id(),
            frames_sent = self.frames_sent,
            bytes_sent = self.bytes_sent,
            last_seq = self.last_sent,
            reason = ?end,
            "Stream session closed"
        );
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.close(SessionEnd::ClientGone);
    }
}
