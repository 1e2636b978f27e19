//! Frame producer loop: capture -> encode -> publish
//!
//! Runs on one dedicated blocking worker. Each iteration takes the newest raw
//! buffer from the capture mailbox, encodes it, publishes the result to the
//! latest-frame slot and drops the raw buffer before looking for the next.
//! A frame that fails to encode is skipped and the previous frame keeps being
//! served. A capture failure ends the loop.

use crate::capture::{CaptureError, CaptureHandle, FrameSink, RawFrameMailbox, Take};
use crate::encoder::FrameEncoder;
use crate::streaming::slot::LatestFrameSlot;
use crate::streaming::stats::ProducerCounters;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Idle,
    Capturing,
    Stopped,
}

/// How the loop ended
#[derive(Debug)]
pub enum ProducerExit {
    /// Stop was requested
    Requested,
    /// The capture facility failed or revoked access
    CaptureFailed(CaptureError),
}

pub struct FrameProducer {
    slot: Arc<LatestFrameSlot>,
    encoder: Box<dyn FrameEncoder>,
    counters: Arc<ProducerCounters>,
    /// How often the loop wakes without a frame to check for a stop request
    poll_interval: Duration,
    state: ProducerState,
}

impl FrameProducer {
    pub fn new(
        slot: Arc<LatestFrameSlot>,
        encoder: Box<dyn FrameEncoder>,
        counters: Arc<ProducerCounters>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            slot,
            encoder,
            counters,
            poll_interval,
            state: ProducerState::Idle,
        }
    }

    pub fn state(&self) -> ProducerState {
        self.state
    }

    /// Starts capture on `handle` and moves the loop onto a blocking worker.
    ///
    /// If capture refuses to start the handle is released and the slot closed
    /// before the error is returned.
    pub fn start(mut self, mut handle: Box<dyn CaptureHandle>) -> Result<ProducerTask, CaptureError> {
        let mailbox = Arc::new(RawFrameMailbox::new(Arc::clone(&self.counters)));

        if let Err(e) = handle.start(FrameSink::new(Arc::clone(&mailbox))) {
            error!(error = %e, "Capture failed to start");
            mailbox.close();
            handle.release();
            self.slot.close();
            self.state = ProducerState::Stopped;
            return Err(e);
        }

        let params = handle.params();
        info!(
            resolution = %format!("{}x{}", params.width, params.height),
            density = params.density,
            interval_ms = params.frame_interval.as_millis() as u64,
            "Frame producer capturing"
        );
        self.state = ProducerState::Capturing;

        let stop = Arc::new(AtomicBool::new(false));
        let loop_stop = Arc::clone(&stop);
        let join = tokio::task::spawn_blocking(move || self.run(handle, mailbox, loop_stop));

        Ok(ProducerTask { stop, join })
    }

    fn run(
        mut self,
        mut handle: Box<dyn CaptureHandle>,
        mailbox: Arc<RawFrameMailbox>,
        stop: Arc<AtomicBool>,
    ) -> ProducerExit {
        let exit = loop {
            if stop.load(Ordering::Acquire) {
                break ProducerExit::Requested;
            }

            match mailbox.take(self.poll_interval) {
                Take::Frame(raw) => {
                    match self.encoder.encode(&raw) {
                        Ok(frame) => {
                            let len = frame.len();
                            match self.slot.publish(frame) {
                                Ok(seq) => debug!(seq, bytes = len, "Frame published"),
                                // Closed from outside: the pipeline is going down
                                Err(_) => break ProducerExit::Requested,
                            }
                        }
                        Err(e) => {
                            self.counters.encode_errors.fetch_add(1, Ordering::Relaxed);
                            warn!(error = %e, ?raw, "Frame encode failed, keeping previous frame");
                        }
                    }
                    // Raw buffer goes back before the next one is taken
                    drop(raw);
                }
                Take::TimedOut => {}
                Take::Closed => break ProducerExit::Requested,
                Take::Failed(e) => break ProducerExit::CaptureFailed(e),
            }
        };

        self.state = ProducerState::Stopped;
        mailbox.close();
        self.slot.close();
        handle.release();

        match &exit {
            ProducerExit::Requested => info!("Frame producer stopped"),
            ProducerExit::CaptureFailed(e) => error!(error = %e, "Frame producer stopped on capture failure"),
        }
        exit
    }
}

/// Running producer loop
pub struct ProducerTask {
    stop: Arc<AtomicBool>,
    join: JoinHandle<ProducerExit>,
}

impl ProducerTask {
    /// Asks the loop to stop; it notices within one poll interval
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Cloneable stop switch, for callers that hand the task itself elsewhere
    pub fn stop_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Waits for the loop to end. A panicked loop counts as a capture failure.
    pub async fn join(self) -> ProducerExit {
        match self.join.await {
            Ok(exit) => exit,
            Err(e) => ProducerExit::CaptureFailed(CaptureError::Device(format!(
                "producer worker panicked: {}",
                e
            ))),
        }
    }
}
