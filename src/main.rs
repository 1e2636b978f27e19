//! Screen streaming CLI application

use anyhow::{bail, Context, Result};
use clap::Parser;
use screencast_mjpeg::{Config, Pipeline, StopReason, TestPatternSource};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "screencast-mjpeg")]
#[command(about = "Serve live screen capture to any browser as an MJPEG stream")]
#[command(version)]
struct Cli {
    /// Path to configuration file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port, overrides server.port
    #[arg(short, long)]
    port: Option<u16>,

    /// JPEG quality 1-100, overrides encoder.quality
    #[arg(short, long)]
    quality: Option<u8>,

    /// Maximum concurrent viewers, overrides server.max_sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Stream a synthetic test pattern instead of the screen
    #[arg(long)]
    test_mode: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => {
                info!(config_path = %path.display(), "Loading configuration");
                Config::load(path)
                    .with_context(|| format!("failed to load {}", path.display()))?
            }
            None => Config::default(),
        };

        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(quality) = self.quality {
            config.encoder.quality = quality;
        }
        if let Some(max) = self.max_sessions {
            config.server.max_sessions = Some(max);
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    info!("Screencast MJPEG server starting");
    let config = cli.load_config()?;

    if !cli.test_mode {
        // The platform capture facility plugs in through `CaptureSource`;
        // this binary only ships the synthetic one.
        bail!("no screen capture backend available on this platform, run with --test-mode");
    }

    let capture = &config.capture;
    let mut source = TestPatternSource::new(capture.width, capture.height, capture.fps);

    let pipeline = Pipeline::start(&config, &mut source).await?;
    info!(
        "Streaming started on http://{}/stream, press Ctrl+C to stop",
        pipeline.listen_addr()
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down");
        }
        reason = pipeline.stopped() => {
            warn!(?reason, "Pipeline stopped on its own");
        }
    }

    let stats = pipeline.stats();
    match pipeline.stop().await {
        StopReason::Requested => {
            info!(
                frames = stats.frames_published,
                viewers = stats.total_sessions,
                "Stopped"
            );
            Ok(())
        }
        StopReason::CaptureFailed(e) => bail!("screen capture failed: {}", e),
    }
}
