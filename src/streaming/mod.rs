//! Frame distribution: producer loop, latest-frame slot and per-client sessions

pub mod multipart;
pub mod producer;
pub mod session;
pub mod slot;
pub mod stats;

pub use multipart::{FramePart, MultipartFormat, DEFAULT_BOUNDARY};
pub use producer::{FrameProducer, ProducerExit, ProducerState, ProducerTask};
pub use session::{
    SessionContext, SessionEnd, SessionGuard, SessionRegistry, SessionState, StreamSession,
};
pub use slot::{LatestFrameSlot, ReadOutcome, SlotError, NO_FRAME};
pub use stats::{PipelineStats, StatsHandle};
