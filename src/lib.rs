//! Live screen capture streamed to browsers as MJPEG over HTTP
//!
//! One producer turns raw captured frames into JPEGs and publishes each to a
//! single latest-frame slot. Any number of viewers read that slot at their own
//! pace and receive a `multipart/x-mixed-replace` stream:
//! - Slow viewers skip frames instead of queueing them
//! - Memory stays constant regardless of viewer count
//! - The producer never waits on a viewer
//!
//! # Example
//!
//! ```no_run
//! use screencast_mjpeg::{Config, Pipeline, TestPatternSource};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let mut source = TestPatternSource::new(1280, 720, 30);
//!
//! let pipeline = Pipeline::start(&config, &mut source).await?;
//! println!("open http://{}/stream", pipeline.listen_addr());
//!
//! pipeline.stopped().await;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod encoder;
pub mod frame;
pub mod pipeline;
pub mod server;
pub mod streaming;

// Re-exports for convenience
pub use capture::{CaptureError, CaptureHandle, CaptureSource, FrameSink, TestPatternSource};
pub use config::{Config, ConfigError};
pub use encoder::{EncodeError, FrameEncoder, JpegFrameEncoder};
pub use frame::{CaptureParams, Frame, PixelFormat, RawFrame};
pub use pipeline::{Pipeline, PipelineState, StartError, StopReason};
pub use server::StreamingServer;
pub use streaming::{LatestFrameSlot, PipelineStats, StatsHandle};
