//! Lifecycle boundary: starts and stops producer and server together
//!
//! Start order is capture grant, listener bind, producer, server. Any step
//! failing undoes the earlier ones, so a failed start leaves nothing behind.
//! A supervisor task watches the producer; when it exits (stop requested or
//! capture lost) the server is shut down and the state flips to `Stopped`.

use crate::capture::{CaptureError, CaptureSource};
use crate::config::{Config, ConfigError};
use crate::encoder::{FrameEncoder, JpegFrameEncoder};
use crate::server::StreamingServer;
use crate::streaming::multipart::MultipartFormat;
use crate::streaming::producer::{FrameProducer, ProducerExit, ProducerTask};
use crate::streaming::session::{SessionContext, SessionRegistry};
use crate::streaming::slot::LatestFrameSlot;
use crate::streaming::stats::{PipelineStats, ProducerCounters, StatsHandle};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// How often the producer checks for a stop request while no frames arrive
const PRODUCER_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum StartError {
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    #[error("screen capture denied: {0}")]
    CaptureDenied(String),

    #[error("screen capture failed to start: {0}")]
    Capture(CaptureError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    CaptureFailed(String),
}

/// What an operator UI shows
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Running { listen_addr: SocketAddr },
    Stopped { reason: StopReason },
}

impl PipelineState {
    pub fn is_running(&self) -> bool {
        matches!(self, PipelineState::Running { .. })
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        match self {
            PipelineState::Stopped { reason } => Some(reason),
            PipelineState::Running { .. } => None,
        }
    }
}

/// A running capture-to-viewers pipeline
pub struct Pipeline {
    listen_addr: SocketAddr,
    state: watch::Receiver<PipelineState>,
    shutdown: Arc<watch::Sender<bool>>,
    producer_stop: Arc<AtomicBool>,
    stats: StatsHandle,
    supervisor: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Starts with a JPEG encoder at the configured quality
    pub async fn start(config: &Config, source: &mut dyn CaptureSource) -> Result<Self, StartError> {
        let encoder = JpegFrameEncoder::new(config.encoder.quality);
        Self::start_with_encoder(config, source, Box::new(encoder)).await
    }

    pub async fn start_with_encoder(
        config: &Config,
        source: &mut dyn CaptureSource,
        encoder: Box<dyn FrameEncoder>,
    ) -> Result<Self, StartError> {
        config.validate()?;

        // Permission first: a denied grant must not leave a listener behind
        let mut handle = source.request_capture().map_err(|e| match e {
            CaptureError::Denied(msg) => StartError::CaptureDenied(msg),
            other => StartError::Capture(other),
        })?;

        let slot = Arc::new(LatestFrameSlot::new());
        let counters = Arc::new(ProducerCounters::default());
        let registry = Arc::new(SessionRegistry::new(config.server.max_sessions));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown = Arc::new(shutdown_tx);

        let ctx = SessionContext {
            slot: Arc::clone(&slot),
            format: Arc::new(MultipartFormat::new(config.stream.boundary.clone())),
            liveness_timeout: config.stream.liveness_timeout(),
            shutdown: shutdown_rx.clone(),
        };

        let addr = config.server.listen_addr();
        let server = match StreamingServer::bind(addr, Arc::clone(&registry), ctx).await {
            Ok(server) => server
                .with_shutdown_timeout(config.server.shutdown_timeout())
                .with_write_timeout(config.stream.write_timeout()),
            Err(e) => {
                error!(%addr, error = %e, "Failed to bind streaming server");
                handle.release();
                return Err(StartError::Bind { addr, source: e });
            }
        };
        let listen_addr = server.local_addr();

        // Releases the handle and closes the slot itself on failure; the
        // unspawned server drops its listener on return.
        let producer = FrameProducer::new(
            Arc::clone(&slot),
            encoder,
            Arc::clone(&counters),
            PRODUCER_POLL_INTERVAL,
        )
        .start(handle)
        .map_err(StartError::Capture)?;
        let producer_stop = producer.stop_switch();

        let stats = StatsHandle::new(counters, slot, registry);
        let server_task = server.spawn();
        let stats_logger = match config.stream.stats_interval_secs {
            0 => None,
            secs => Some(spawn_stats_logger(
                stats.clone(),
                Duration::from_secs(secs),
                shutdown_rx,
            )),
        };

        let (state_tx, state_rx) = watch::channel(PipelineState::Running { listen_addr });
        let supervisor = tokio::spawn(supervise(
            producer,
            server_task,
            stats_logger,
            Arc::clone(&shutdown),
            state_tx,
        ));

        info!(%listen_addr, quality = config.encoder.quality, "Pipeline running");

        Ok(Self {
            listen_addr,
            state: state_rx,
            shutdown,
            producer_stop,
            stats,
            supervisor: Some(supervisor),
        })
    }

    /// Bound address, with an ephemeral port resolved
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.clone()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.snapshot()
    }

    pub fn stats_handle(&self) -> StatsHandle {
        self.stats.clone()
    }

    /// Resolves once everything has shut down, whatever the cause
    pub async fn stopped(&self) -> StopReason {
        let mut state = self.state.clone();
        let reason = match state.wait_for(|s| !s.is_running()).await {
            Ok(s) => s.stop_reason().cloned(),
            Err(_) => None,
        };
        reason.unwrap_or(StopReason::Requested)
    }

    /// Stops capture, closes every viewer connection and waits for all of it.
    ///
    /// Returns the reason the pipeline ended, which is `CaptureFailed` if
    /// capture had already died before this was called.
    pub async fn stop(mut self) -> StopReason {
        info!(listen_addr = %self.listen_addr, "Stopping pipeline");
        self.signal_stop();

        if let Some(supervisor) = self.supervisor.take() {
            if let Err(e) = supervisor.await {
                error!(error = %e, "Pipeline supervisor failed");
            }
        }

        self.state().stop_reason().cloned().unwrap_or(StopReason::Requested)
    }

    fn signal_stop(&self) {
        self.producer_stop.store(true, Ordering::Release);
        self.shutdown.send_replace(true);
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // Dropped without stop(): shut down in the background
        if self.supervisor.is_some() {
            self.signal_stop();
        }
    }
}

async fn supervise(
    producer: ProducerTask,
    server: JoinHandle<()>,
    stats_logger: Option<JoinHandle<()>>,
    shutdown: Arc<watch::Sender<bool>>,
    state: watch::Sender<PipelineState>,
) {
    let reason = match producer.join().await {
        ProducerExit::Requested => StopReason::Requested,
        ProducerExit::CaptureFailed(e) => {
            error!(error = %e, "Capture lost, stopping pipeline");
            StopReason::CaptureFailed(e.to_string())
        }
    };

    shutdown.send_replace(true);
    if let Err(e) = server.await {
        error!(error = %e, "Streaming server task failed");
    }
    if let Some(logger) = stats_logger {
        let _ = logger.await;
    }

    info!(?reason, "Pipeline stopped");
    state.send_replace(PipelineState::Stopped { reason });
}

fn spawn_stats_logger(
    stats: StatsHandle,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;

        let mut previous = stats.snapshot();
        let mut last = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let current = stats.snapshot();
                    let fps = current.calculate_fps(&previous, last.elapsed().as_secs_f64());
                    info!(
                        "Pipeline stats: fps={:.1}, published={}, raw_dropped={:.1}%, encode_errors={}, viewers={}, total_viewers={}",
                        fps,
                        current.frames_published,
                        current.raw_drop_rate() * 100.0,
                        current.encode_errors,
                        current.active_sessions,
                        current.total_sessions
                    );
                    previous = current;
                    last = Instant::now();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
