//! Streaming HTTP server
//!
//! An axum router on a [`ViewerListener`]:
//! - `GET /stream`: multipart MJPEG stream, one [`StreamSession`] per viewer
//! - anything else: small informational page
//!
//! Every response carries `Connection: close`, so a connection serves one
//! request. On shutdown the listener is dropped, so new connections are
//! refused, and session bodies end on their own. Connections get
//! `shutdown_timeout` to finish before the serve task is aborted; a viewer
//! stuck in a write is cut off by the connection write timeout regardless.

pub mod connection;

pub use connection::{ViewerIo, ViewerListener};

use crate::streaming::session::{SessionContext, SessionRegistry, StreamSession};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const STREAM_PATH: &str = "/stream";

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

const STREAM_CACHE_CONTROL: &str = "no-store, no-cache, must-revalidate";

/// Shared state for handlers
#[derive(Clone)]
struct AppState {
    registry: Arc<SessionRegistry>,
    ctx: SessionContext,
}

/// Routes and layers, without a listener
pub fn router(registry: Arc<SessionRegistry>, ctx: SessionContext) -> Router {
    let state = AppState { registry, ctx };

    Router::new()
        .route(STREAM_PATH, get(stream_handler))
        .fallback(info_handler)
        .layer(SetResponseHeaderLayer::overriding(
            header::CONNECTION,
            HeaderValue::from_static("close"),
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn stream_handler(State(state): State<AppState>) -> Response {
    let Some(guard) = state.registry.try_admit() else {
        warn!(
            max_sessions = ?state.registry.max_sessions(),
            "Session limit reached, refusing viewer"
        );
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, "1")],
            "503 Service Unavailable\n",
        )
            .into_response();
    };

    info!(
        session_id = guard.id(),
        active = state.registry.active(),
        "Viewer connected"
    );
    let session = StreamSession::new(guard, state.ctx.clone());

    (
        [
            (header::CONTENT_TYPE, state.ctx.format.content_type()),
            (header::CACHE_CONTROL, STREAM_CACHE_CONTROL.to_string()),
            (header::PRAGMA, "no-cache".to_string()),
            (header::EXPIRES, "0".to_string()),
        ],
        Body::from_stream(session.into_body()),
    )
        .into_response()
}

async fn info_handler(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Screen Capture</title>
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>
        body {{ font-family: sans-serif; margin: 0; padding: 20px; background: #111; color: #eee; text-align: center; }}
        img {{ max-width: 100%; border: 1px solid #444; }}
        a {{ color: #8cf; }}
    </style>
</head>
<body>
    <h1>Screen capture server is running</h1>
    <p>Stream: <a href="{path}">{path}</a></p>
    <p>Active viewers: {active} &middot; Frames published: {frames}</p>
    <img src="{path}" alt="screen stream">
</body>
</html>"#,
        path = STREAM_PATH,
        active = state.registry.active(),
        frames = state.ctx.slot.current_seq(),
    ))
}

pub struct StreamingServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    ctx: SessionContext,
    shutdown_timeout: Duration,
    write_timeout: Duration,
}

impl StreamingServer {
    /// Binds `addr`. Shutdown is driven by `ctx.shutdown` flipping to `true`.
    pub async fn bind(addr: SocketAddr, registry: Arc<SessionRegistry>, ctx: SessionContext) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            registry,
            ctx,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        })
    }

    /// How long connections get to wind down before the server gives up on them
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// How long a write to a viewer may make no progress before the
    /// connection is dropped
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Actual bound address (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let StreamingServer {
            listener,
            local_addr,
            registry,
            ctx,
            shutdown_timeout,
            write_timeout,
        } = self;

        let mut shutdown = ctx.shutdown.clone();
        let signal = {
            let mut shutdown = ctx.shutdown.clone();
            async move { wait_for_shutdown(&mut shutdown).await }
        };

        let app = router(Arc::clone(&registry), ctx);
        let listener = ViewerListener::new(listener, write_timeout);
        info!("Streaming server listening on http://{}{}", local_addr, STREAM_PATH);

        let mut serve = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
        });

        tokio::select! {
            result = &mut serve => {
                report_serve_exit(result);
                return;
            }
            _ = wait_for_shutdown(&mut shutdown) => {}
        }

        info!(active = registry.active(), "Streaming server stopping");
        match tokio::time::timeout(shutdown_timeout, &mut serve).await {
            Ok(result) => report_serve_exit(result),
            Err(_) => {
                warn!(
                    remaining = registry.active(),
                    timeout_ms = shutdown_timeout.as_millis() as u64,
                    "Connections did not close in time, aborting"
                );
                serve.abort();
                let _ = serve.await;
            }
        }

        info!(total_sessions = registry.total(), "Streaming server stopped");
    }
}

/// Resolves once shutdown is requested or its sender is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn report_serve_exit(result: Result<io::Result<()>, JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Streaming server failed"),
        Err(e) => error!(error = %e, "Streaming server task failed"),
    }
}
