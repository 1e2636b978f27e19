//! Latest-frame slot: single-value frame distribution
//!
//! Holds at most one encoded frame and a sequence number that grows by one on
//! every publish. Sessions read it at their own pace; a session that falls
//! behind skips straight to the newest frame instead of working through a
//! backlog, so memory stays constant no matter how many clients are attached
//! or how slow they are.
//!
//! Publishing takes a short mutex to swap the frame and bump the sequence,
//! then wakes waiting readers. It never waits on a reader.

use crate::frame::Frame;
use parking_lot::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

/// Sequence number meaning "nothing received yet"
pub const NO_FRAME: u64 = 0;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    #[error("frame slot closed")]
    Closed,
}

/// Result of a read that did not hit a closed slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The newest frame, different from the one the caller already has
    Frame { frame: Frame, seq: u64 },
    /// Nothing newer arrived within the wait
    NotYetAvailable,
}

#[derive(Debug, Default)]
struct SlotState {
    current: Option<Frame>,
    seq: u64,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct LatestFrameSlot {
    state: Mutex<SlotState>,
    published: Notify,
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the held frame and returns its sequence number.
    ///
    /// Fails only once the slot is closed; the frame is dropped in that case.
    pub fn publish(&self, frame: Frame) -> Result<u64, SlotError> {
        let (seq, previous) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SlotError::Closed);
            }
            state.seq += 1;
            (state.seq, state.current.replace(frame))
        };
        // Superseded frame (or this reference to it) goes away outside the lock
        drop(previous);

        self.published.notify_waiters();
        Ok(seq)
    }

    /// Returns the current frame if its sequence differs from `since`,
    /// without waiting.
    pub fn try_read(&self, since: u64) -> Result<ReadOutcome, SlotError> {
        let state = self.state.lock();
        if state.closed {
            return Err(SlotError::Closed);
        }

        match &state.current {
            Some(frame) if state.seq != since => Ok(ReadOutcome::Frame {
                frame: frame.clone(),
                seq: state.seq,
            }),
            _ => Ok(ReadOutcome::NotYetAvailable),
        }
    }

    /// Returns the current frame if its sequence differs from `since`,
    /// otherwise waits up to `wait` for the next publish.
    ///
    /// `NotYetAvailable` after the wait lets the caller run its own liveness
    /// checks before asking again.
    pub async fn read_latest(&self, since: u64, wait: Duration) -> Result<ReadOutcome, SlotError> {
        // Register for the wake-up before looking, so a publish landing between
        // the look and the wait is not missed.
        let notified = self.published.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let outcome @ ReadOutcome::Frame { .. } = self.try_read(since)? {
            return Ok(outcome);
        }

        let _ = tokio::time::timeout(wait, notified).await;
        self.try_read(since)
    }

    /// Drops the held frame and releases every waiting reader with
    /// `SlotError::Closed`. Idempotent.
    pub fn close(&self) {
        let previous = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.current.take()
        };
        drop(previous);

        self.published.notify_waiters();
        debug!("Frame slot closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Sequence number of the newest published frame (`NO_FRAME` before any)
    pub fn current_seq(&self) -> u64 {
        self.state.lock().seq
    }
}
