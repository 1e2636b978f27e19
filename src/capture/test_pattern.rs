//! Synthetic capture source for `--test-mode` and tests
//!
//! Produces RGBA frames with rows padded to a 64-byte stride, like a
//! hardware image reader would, showing a gradient with a bar sweeping
//! across it so a viewer can tell the stream is live.

use super::{CaptureError, CaptureHandle, CaptureSource, FrameSink};
use crate::frame::{CaptureParams, PixelFormat, RawFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const ROW_ALIGN: usize = 64;

/// Capture source that always grants and renders a moving test pattern
#[derive(Debug, Clone)]
pub struct TestPatternSource {
    params: CaptureParams,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            params: CaptureParams {
                width,
                height,
                density: 160,
                frame_interval: Duration::from_secs(1) / fps.max(1),
            },
        }
    }
}

impl CaptureSource for TestPatternSource {
    fn request_capture(&mut self) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        info!(
            resolution = %format!("{}x{}", self.params.width, self.params.height),
            interval_ms = self.params.frame_interval.as_millis() as u64,
            "Test pattern capture granted"
        );
        Ok(Box::new(TestPatternHandle {
            params: self.params,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }))
    }
}

struct TestPatternHandle {
    params: CaptureParams,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureHandle for TestPatternHandle {
    fn params(&self) -> CaptureParams {
        self.params
    }

    fn start(&mut self, sink: FrameSink) -> Result<(), CaptureError> {
        if self.worker.is_some() {
            return Err(CaptureError::Device("test pattern already started".into()));
        }

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let params = self.params;

        let worker = thread::Builder::new()
            .name("test-pattern".into())
            .spawn(move || render_loop(params, sink, running))
            .map_err(|e| CaptureError::Device(format!("failed to spawn capture thread: {}", e)))?;

        self.worker = Some(worker);
        Ok(())
    }

    fn release(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Test pattern thread panicked");
            }
        }
        debug!("Test pattern capture released");
    }
}

impl Drop for TestPatternHandle {
    fn drop(&mut self) {
        self.release();
    }
}

fn render_loop(params: CaptureParams, sink: FrameSink, running: Arc<AtomicBool>) {
    let mut tick = 0u32;
    let mut next = Instant::now();

    while running.load(Ordering::Acquire) && sink.is_open() {
        if !sink.deliver(render(&params, tick)) {
            break;
        }
        tick = tick.wrapping_add(1);

        next += params.frame_interval;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else {
            // Fell behind, don't try to catch up with a burst
            next = now;
        }
    }
}

fn render(params: &CaptureParams, tick: u32) -> RawFrame {
    let width = params.width as usize;
    let height = params.height as usize;
    let stride = (width * 4).div_ceil(ROW_ALIGN) * ROW_ALIGN;
    let bar_x = (tick as usize * 8) % width.max(1);
    let bar_width = (width / 16).max(1);

    let mut data = vec![0u8; stride * height];
    for (y, row) in data.chunks_exact_mut(stride).enumerate() {
        let g = (y * 255 / height.max(1)) as u8;
        for (x, px) in row[..width * 4].chunks_exact_mut(4).enumerate() {
            let in_bar = x >= bar_x && x < bar_x + bar_width;
            let r = (x * 255 / width.max(1)) as u8;
            let (r, g, b) = if in_bar { (255, 255, 255) } else { (r, g, 96) };
            px.copy_from_slice(&[r, g, b, 255]);
        }
    }

    RawFrame {
        data: data.into(),
        width: params.width,
        height: params.height,
        stride,
        format: PixelFormat::Rgba8888,
    }
}
