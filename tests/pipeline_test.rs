//! End-to-end pipeline tests over real sockets
//!
//! Each test starts a full pipeline on an ephemeral loopback port and talks to
//! it as a browser would.

use parking_lot::Mutex;
use screencast_mjpeg::{
    CaptureError, CaptureHandle, CaptureParams, CaptureSource, Config, EncodeError, Frame,
    FrameEncoder, FrameSink, Pipeline, PipelineState, RawFrame, StartError, StopReason,
    TestPatternSource,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::{sleep, timeout};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;

fn test_config() -> Config {
    let mut config = Config::default();
    config.server.bind_ip = [127, 0, 0, 1].into();
    config.server.port = 0;
    config.server.shutdown_timeout_ms = 500;
    config.stream.stats_interval_secs = 0;
    config
}

fn pattern() -> TestPatternSource {
    TestPatternSource::new(WIDTH, HEIGHT, 30)
}

/// Capture source driven by the test: records the sink it was handed and
/// whether the handle was released.
#[derive(Clone, Default)]
struct ManualSource {
    deny: bool,
    sink: Arc<Mutex<Option<FrameSink>>>,
    released: Arc<AtomicBool>,
}

impl ManualSource {
    fn denying() -> Self {
        Self {
            deny: true,
            ..Default::default()
        }
    }

    fn sink(&self) -> FrameSink {
        self.sink.lock().clone().expect("capture not started")
    }
}

struct ManualHandle(ManualSource);

impl CaptureSource for ManualSource {
    fn request_capture(&mut self) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        if self.deny {
            return Err(CaptureError::Denied("user declined screen sharing".into()));
        }
        Ok(Box::new(ManualHandle(self.clone())))
    }
}

impl CaptureHandle for ManualHandle {
    fn params(&self) -> CaptureParams {
        CaptureParams {
            width: WIDTH,
            height: HEIGHT,
            density: 320,
            frame_interval: Duration::from_millis(33),
        }
    }

    fn start(&mut self, sink: FrameSink) -> Result<(), CaptureError> {
        *self.0.sink.lock() = Some(sink);
        Ok(())
    }

    fn release(&mut self) {
        self.0.released.store(true, Ordering::SeqCst);
    }
}

/// Minimal multipart client on top of a streamed HTTP response
struct StreamClient {
    response: reqwest::Response,
    buf: Vec<u8>,
}

impl StreamClient {
    async fn connect(addr: SocketAddr) -> Self {
        let response = reqwest::get(format!("http://{}/stream", addr)).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        Self {
            response,
            buf: Vec::new(),
        }
    }

    /// Pulls one more body chunk; false once the body has ended
    async fn fill(&mut self) -> bool {
        match self.response.chunk().await {
            Ok(Some(chunk)) => {
                self.buf.extend_from_slice(&chunk);
                true
            }
            Ok(None) | Err(_) => false,
        }
    }

    /// Next JPEG body, `None` once the server closed the stream
    async fn next_frame(&mut self) -> Option<Vec<u8>> {
        let head_len = loop {
            if let Some(pos) = find(&self.buf, b"\r\n\r\n") {
                break pos + 4;
            }
            if !self.fill().await {
                return None;
            }
        };

        let head = std::str::from_utf8(&self.buf[..head_len]).unwrap();
        assert!(head.starts_with("--frame\r\n"), "bad part head {:?}", head);
        let content_length: usize = head
            .lines()
            .find_map(|line| line.strip_prefix("Content-Length: "))
            .and_then(|value| value.trim().parse().ok())
            .expect("part without Content-Length");

        let part_len = head_len + content_length + 2;
        while self.buf.len() < part_len {
            if !self.fill().await {
                return None;
            }
        }

        assert_eq!(&self.buf[part_len - 2..part_len], b"\r\n");
        let body = self.buf[head_len..head_len + content_length].to_vec();
        self.buf.drain(..part_len);
        Some(body)
    }

    /// True if the server ended the stream
    async fn is_closed(&mut self) -> bool {
        timeout(Duration::from_secs(2), async { while self.fill().await {} })
            .await
            .is_ok()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

const PART_START: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n";

/// Sends a stream request over a raw socket
async fn raw_stream_request(stream: &mut TcpStream) {
    stream
        .write_all(b"GET /stream HTTP/1.1\r\nHost: test\r\n\r\n")
        .await
        .unwrap();
}

/// Counts part headers arriving on a raw socket until `parts` were seen
async fn read_parts(stream: &mut TcpStream, parts: usize) -> usize {
    let mut seen = Vec::new();
    let mut buf = [0u8; 8192];
    let reading = async {
        loop {
            let count = seen.windows(PART_START.len()).filter(|w| *w == PART_START).count();
            if count >= parts {
                return count;
            }
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return count,
                Ok(n) => seen.extend_from_slice(&buf[..n]),
            }
        }
    };
    timeout(Duration::from_secs(3), reading).await.unwrap_or(0)
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(3), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

#[tokio::test]
async fn test_viewer_receives_decodable_jpegs() {
    let mut source = pattern();
    let pipeline = Pipeline::start(&test_config(), &mut source).await.unwrap();

    let mut client = StreamClient::connect(pipeline.listen_addr()).await;
    for _ in 0..3 {
        let jpeg = timeout(Duration::from_secs(2), client.next_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (WIDTH, HEIGHT));
    }

    assert_eq!(pipeline.stop().await, StopReason::Requested);
}

#[tokio::test]
async fn test_info_page_and_stream_headers_over_http() {
    let mut source = pattern();
    let pipeline = Pipeline::start(&test_config(), &mut source).await.unwrap();
    let base = format!("http://{}", pipeline.listen_addr());

    let page = reqwest::get(format!("{}/", base)).await.unwrap();
    assert_eq!(page.status(), reqwest::StatusCode::OK);
    let body = page.text().await.unwrap();
    assert!(body.contains("Screen capture server is running"));

    let mut stream = reqwest::get(format!("{}/stream", base)).await.unwrap();
    assert_eq!(stream.status(), reqwest::StatusCode::OK);
    assert_eq!(
        stream.headers()["content-type"],
        "multipart/x-mixed-replace; boundary=frame"
    );
    assert_eq!(
        stream.headers()["cache-control"],
        "no-store, no-cache, must-revalidate"
    );
    assert_eq!(stream.headers()["access-control-allow-origin"], "*");

    let first = timeout(Duration::from_secs(2), stream.chunk())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(first.starts_with(b"--frame\r\n"));

    drop(stream);
    pipeline.stop().await;
}

#[tokio::test]
async fn test_denied_capture_binds_nothing() {
    // Find a free port, then make sure the failed start leaves it free
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let mut config = test_config();
    config.server.port = port;

    let mut source = ManualSource::denying();
    let result = Pipeline::start(&config, &mut source).await;

    match result {
        Err(StartError::CaptureDenied(msg)) => assert!(msg.contains("declined")),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("start succeeded without a capture grant"),
    }
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn test_bind_failure_releases_capture() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = test_config();
    config.server.port = occupied.local_addr().unwrap().port();

    let mut source = ManualSource::default();
    let result = Pipeline::start(&config, &mut source).await;

    match result {
        Err(StartError::Bind { addr, .. }) => assert_eq!(addr.port(), config.server.port),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("bound an occupied port"),
    }
    assert!(source.released.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_stop_closes_all_sessions() {
    let mut source = pattern();
    let pipeline = Pipeline::start(&test_config(), &mut source).await.unwrap();
    let addr = pipeline.listen_addr();
    let stats = pipeline.stats_handle();

    let mut clients = Vec::new();
    for _ in 0..5 {
        let mut client = StreamClient::connect(addr).await;
        client.next_frame().await.unwrap();
        clients.push(client);
    }
    assert_eq!(stats.snapshot().active_sessions, 5);

    let reason = timeout(Duration::from_secs(3), pipeline.stop())
        .await
        .expect("stop did not return");
    assert_eq!(reason, StopReason::Requested);

    assert_eq!(stats.snapshot().active_sessions, 0);
    assert_eq!(stats.snapshot().total_sessions, 5);
    for client in &mut clients {
        assert!(client.is_closed().await);
    }
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_capture_failure_stops_pipeline() {
    let mut source = ManualSource::default();
    let pipeline = Pipeline::start(&test_config(), &mut source).await.unwrap();
    let addr = pipeline.listen_addr();
    let mut state = pipeline.subscribe_state();
    assert!(state.borrow().is_running());

    let sink = source.sink();
    sink.deliver(RawFrame::packed(
        vec![128u8; (WIDTH * HEIGHT) as usize],
        WIDTH,
        HEIGHT,
        screencast_mjpeg::PixelFormat::Gray8,
    ));

    let mut client = StreamClient::connect(addr).await;
    client.next_frame().await.unwrap();

    sink.fail(CaptureError::Revoked("projection stopped".into()));

    let reason = timeout(Duration::from_secs(3), pipeline.stopped())
        .await
        .unwrap();
    assert_eq!(
        reason,
        StopReason::CaptureFailed("capture revoked: projection stopped".into())
    );
    state.changed().await.unwrap();
    assert_matches::assert_matches!(*state.borrow(), PipelineState::Stopped { .. });

    assert!(source.released.load(Ordering::SeqCst));
    assert!(!sink.is_open());
    assert!(client.is_closed().await);

    // stop() after the fact reports the original cause
    assert_matches::assert_matches!(pipeline.stop().await, StopReason::CaptureFailed(_));
}

/// Encoder producing large frames so a non-reading viewer backs up quickly
struct BulkyEncoder;

impl FrameEncoder for BulkyEncoder {
    fn encode(&mut self, raw: &RawFrame) -> Result<Frame, EncodeError> {
        let mut data = vec![0u8; 256 * 1024];
        data[0] = raw.data[0];
        Ok(Frame::new(data))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stalled_viewer_does_not_slow_others() {
    let mut source = pattern();
    let pipeline = Pipeline::start_with_encoder(&test_config(), &mut source, Box::new(BulkyEncoder))
        .await
        .unwrap();
    let addr = pipeline.listen_addr();
    let stats = pipeline.stats_handle();

    // Sends its request and then never reads
    let mut stalled = TcpStream::connect(addr).await.unwrap();
    raw_stream_request(&mut stalled).await;

    let mut reader = StreamClient::connect(addr).await;
    let started = stats.snapshot().frames_published;
    let mut received = 0;
    let reading = async {
        while reader.next_frame().await.is_some() {
            received += 1;
        }
    };
    let _ = timeout(Duration::from_secs(2), reading).await;

    let published = stats.snapshot().frames_published - started;
    assert!(published >= 30, "producer slowed down: {} frames in 2s", published);
    assert!(received >= 20, "reading viewer starved: {} frames in 2s", received);
    assert!(received as u64 <= published + 1);

    pipeline.stop().await;
}

#[tokio::test]
async fn test_session_cap() {
    let mut config = test_config();
    config.server.max_sessions = Some(2);

    let mut source = pattern();
    let pipeline = Pipeline::start(&config, &mut source).await.unwrap();
    let addr = pipeline.listen_addr();

    let _a = StreamClient::connect(addr).await;
    let _b = StreamClient::connect(addr).await;
    wait_until("two sessions", || pipeline.stats().active_sessions == 2).await;

    let response = reqwest::get(format!("http://{}/stream", addr)).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

    pipeline.stop().await;
}

#[tokio::test]
async fn test_half_closed_viewer_still_streams() {
    let mut source = pattern();
    let pipeline = Pipeline::start(&test_config(), &mut source).await.unwrap();

    let mut viewer = TcpStream::connect(pipeline.listen_addr()).await.unwrap();
    raw_stream_request(&mut viewer).await;
    // Nothing more to say after the request
    viewer.shutdown().await.unwrap();

    assert!(read_parts(&mut viewer, 3).await >= 3);
    assert_eq!(pipeline.stats().active_sessions, 1);

    pipeline.stop().await;
}

#[tokio::test]
async fn test_non_reading_viewer_gives_up_its_place() {
    let mut config = test_config();
    config.server.max_sessions = Some(1);
    config.stream.write_timeout_ms = 300;

    let mut source = pattern();
    let pipeline = Pipeline::start_with_encoder(&config, &mut source, Box::new(BulkyEncoder))
        .await
        .unwrap();
    let addr = pipeline.listen_addr();

    // Takes the only place, then never reads
    let socket = TcpSocket::new_v4().unwrap();
    socket.set_recv_buffer_size(4096).unwrap();
    let mut stalled = socket.connect(addr).await.unwrap();
    raw_stream_request(&mut stalled).await;
    wait_until("the stalled viewer to be admitted", || pipeline.stats().active_sessions == 1).await;

    timeout(Duration::from_secs(10), async {
        while pipeline.stats().active_sessions != 0 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("stalled viewer kept its place");

    let mut next = StreamClient::connect(addr).await;
    assert!(next.next_frame().await.is_some());
    assert_eq!(pipeline.stats().active_sessions, 1);

    drop(stalled);
    pipeline.stop().await;
}
