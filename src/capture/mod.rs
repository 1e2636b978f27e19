//! Capture facility boundary
//!
//! The platform screen-mirroring facility lives outside this crate. It is
//! reached through two traits:
//! - [`CaptureSource`] grants (or denies) a capture session
//! - [`CaptureHandle`] delivers raw frames into a [`FrameSink`] until released
//!
//! Raw frames land in a single-entry mailbox, the same policy as an appsink
//! with `max-buffers=2 drop=true`: one frame pending plus the one being
//! encoded. A delivery that finds a frame still pending replaces it, so the
//! producer always picks up the newest buffer and never builds a backlog.

mod test_pattern;

pub use test_pattern::TestPatternSource;

use crate::frame::{CaptureParams, RawFrame};
use crate::streaming::stats::ProducerCounters;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture permission denied: {0}")]
    Denied(String),

    #[error("capture revoked: {0}")]
    Revoked(String),

    #[error("capture device error: {0}")]
    Device(String),
}

/// Grants capture sessions
pub trait CaptureSource: Send {
    /// Asks the platform for a capture grant. `CaptureError::Denied` when the
    /// user or OS refuses.
    fn request_capture(&mut self) -> Result<Box<dyn CaptureHandle>, CaptureError>;
}

/// One granted capture session
pub trait CaptureHandle: Send {
    fn params(&self) -> CaptureParams;

    /// Begins delivering raw frames to `sink`, from any thread, at the
    /// display's native cadence or slower.
    fn start(&mut self, sink: FrameSink) -> Result<(), CaptureError>;

    /// Stops delivery and frees platform resources. Must tolerate repeat calls.
    fn release(&mut self);
}

/// What the producer gets back from the mailbox
#[derive(Debug)]
pub(crate) enum Take {
    Frame(RawFrame),
    Failed(CaptureError),
    Closed,
    TimedOut,
}

#[derive(Default)]
struct MailboxState {
    pending: Option<RawFrame>,
    failure: Option<CaptureError>,
    closed: bool,
}

/// Single-entry hand-off between the capture callback and the producer
pub(crate) struct RawFrameMailbox {
    state: Mutex<MailboxState>,
    ready: Condvar,
    counters: Arc<ProducerCounters>,
}

impl RawFrameMailbox {
    pub(crate) fn new(counters: Arc<ProducerCounters>) -> Self {
        Self {
            state: Mutex::new(MailboxState::default()),
            ready: Condvar::new(),
            counters,
        }
    }

    fn deliver(&self, raw: RawFrame) -> bool {
        let replaced = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.pending.replace(raw)
        };

        self.counters.raw_frames_received.fetch_add(1, Ordering::Relaxed);
        if replaced.is_some() {
            self.counters.raw_frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        // Superseded buffer is released here, outside the lock
        drop(replaced);

        self.ready.notify_one();
        true
    }

    fn fail(&self, error: CaptureError) {
        {
            let mut state = self.state.lock();
            if state.closed || state.failure.is_some() {
                return;
            }
            state.failure = Some(error);
        }
        self.ready.notify_one();
    }

    /// Waits up to `timeout` for the newest raw frame.
    ///
    /// A capture failure wins over a pending frame: once the source is gone,
    /// a frame that was already queued is not worth encoding.
    pub(crate) fn take(&self, timeout: Duration) -> Take {
        let mut state = self.state.lock();

        loop {
            if let Some(error) = state.failure.take() {
                state.pending = None;
                return Take::Failed(error);
            }
            if state.closed {
                return Take::Closed;
            }
            if let Some(raw) = state.pending.take() {
                return Take::Frame(raw);
            }
            if self.ready.wait_for(&mut state, timeout).timed_out() {
                return match state.pending.take() {
                    Some(raw) if state.failure.is_none() && !state.closed => Take::Frame(raw),
                    _ => Take::TimedOut,
                };
            }
        }
    }

    pub(crate) fn close(&self) {
        let pending = {
            let mut state = self.state.lock();
            state.closed = true;
            state.pending.take()
        };
        drop(pending);
        self.ready.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Writer side of the raw-frame mailbox, handed to a [`CaptureHandle`].
///
/// Cheap to clone; safe to call from any capture thread.
#[derive(Clone)]
pub struct FrameSink {
    mailbox: Arc<RawFrameMailbox>,
}

impl FrameSink {
    pub(crate) fn new(mailbox: Arc<RawFrameMailbox>) -> Self {
        Self { mailbox }
    }

    /// Offers a raw frame. Returns `false` once the producer has stopped,
    /// which is the cue for the capture side to stop delivering.
    pub fn deliver(&self, raw: RawFrame) -> bool {
        self.mailbox.deliver(raw)
    }

    /// Reports an unrecoverable capture error (projection revoked, surface
    /// lost). The producer stops after seeing it.
    pub fn fail(&self, error: CaptureError) {
        self.mailbox.fail(error)
    }

    pub fn is_open(&self) -> bool {
        !self.mailbox.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use assert_matches::assert_matches;
    use std::thread;
    use std::time::Instant;

    fn raw(tag: u8) -> RawFrame {
        RawFrame::packed(vec![tag; 4], 2, 2, PixelFormat::Gray8)
    }

    fn mailbox() -> (Arc<RawFrameMailbox>, Arc<ProducerCounters>) {
        let counters = Arc::new(ProducerCounters::default());
        (Arc::new(RawFrameMailbox::new(Arc::clone(&counters))), counters)
    }

    #[test]
    fn test_newest_frame_wins() {
        let (mailbox, counters) = mailbox();
        let sink = FrameSink::new(Arc::clone(&mailbox));

        assert!(sink.deliver(raw(1)));
        assert!(sink.deliver(raw(2)));
        assert!(sink.deliver(raw(3)));

        assert_matches!(mailbox.take(Duration::from_millis(10)), Take::Frame(f) if f.data[0] == 3);
        assert_matches!(mailbox.take(Duration::from_millis(10)), Take::TimedOut);

        assert_eq!(counters.raw_frames_received.load(Ordering::Relaxed), 3);
        assert_eq!(counters.raw_frames_dropped.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_take_wakes_on_delivery() {
        let (mailbox, _) = mailbox();
        let sink = FrameSink::new(Arc::clone(&mailbox));

        let deliverer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            sink.deliver(raw(7));
        });

        let started = Instant::now();
        assert_matches!(mailbox.take(Duration::from_secs(5)), Take::Frame(f) if f.data[0] == 7);
        assert!(started.elapsed() < Duration::from_secs(2));
        deliverer.join().unwrap();
    }

    #[test]
    fn test_failure_preempts_pending_frame() {
        let (mailbox, _) = mailbox();
        let sink = FrameSink::new(Arc::clone(&mailbox));

        sink.deliver(raw(1));
        sink.fail(CaptureError::Revoked("projection stopped".into()));

        assert_matches!(
            mailbox.take(Duration::from_millis(10)),
            Take::Failed(CaptureError::Revoked(_))
        );
    }

    #[test]
    fn test_closed_mailbox_refuses_frames() {
        let (mailbox, _) = mailbox();
        let sink = FrameSink::new(Arc::clone(&mailbox));

        mailbox.close();

        assert!(!sink.is_open());
        assert!(!sink.deliver(raw(1)));
        assert_matches!(mailbox.take(Duration::from_millis(10)), Take::Closed);
    }
}
