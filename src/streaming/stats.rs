//! Pipeline statistics

use super::session::SessionRegistry;
use super::slot::LatestFrameSlot;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lock-free counters bumped by the capture and producer side
#[derive(Debug, Default)]
pub struct ProducerCounters {
    /// Raw buffers offered by the capture facility
    pub raw_frames_received: AtomicU64,

    /// Raw buffers superseded before the producer got to them
    pub raw_frames_dropped: AtomicU64,

    /// Raw buffers that failed to encode
    pub encode_errors: AtomicU64,
}

/// Point-in-time view of the whole pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub raw_frames_received: u64,
    pub raw_frames_dropped: u64,
    pub encode_errors: u64,

    /// Frames published to the slot; equal to the slot's current sequence
    pub frames_published: u64,

    /// Sessions currently streaming
    pub active_sessions: usize,

    /// Sessions admitted since start
    pub total_sessions: u64,
}

impl PipelineStats {
    /// Published frame rate between two snapshots
    pub fn calculate_fps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }

        let frames_delta = self.frames_published.saturating_sub(previous.frames_published);
        frames_delta as f64 / elapsed_secs
    }

    /// Share of raw buffers that never reached the encoder
    pub fn raw_drop_rate(&self) -> f64 {
        if self.raw_frames_received == 0 {
            return 0.0;
        }

        self.raw_frames_dropped as f64 / self.raw_frames_received as f64
    }
}

/// Cloneable reader over the live counters; stays valid after the pipeline stops
#[derive(Clone)]
pub struct StatsHandle {
    counters: Arc<ProducerCounters>,
    slot: Arc<LatestFrameSlot>,
    sessions: Arc<SessionRegistry>,
}

impl StatsHandle {
    pub(crate) fn new(
        counters: Arc<ProducerCounters>,
        slot: Arc<LatestFrameSlot>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            counters,
            slot,
            sessions,
        }
    }

    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            raw_frames_received: self.counters.raw_frames_received.load(Ordering::Relaxed),
            raw_frames_dropped: self.counters.raw_frames_dropped.load(Ordering::Relaxed),
            encode_errors: self.counters.encode_errors.load(Ordering::Relaxed),
            frames_published: self.slot.current_seq(),
            active_sessions: self.sessions.active(),
            total_sessions: self.sessions.total(),
        }
    }
}
