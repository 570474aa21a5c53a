//! HTTP surface for the mutation server.
//!
//! Routes:
//! - `POST /v1/mutations` applies one [`SubmitRequest`]
//! - `GET /health` basic liveness
//! - `GET /health/detailed` circuit, admission and rate-limit state
//!
//! Every error is a JSON [`ErrorBody`](crate::wire::ErrorBody); retryable
//! errors with a hint also carry `Retry-After` (whole seconds, rounded up).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::service::{MutationService, ServiceError};
use crate::wire::{MUTATIONS_PATH, SubmitRequest};
use crate::{Error, Result};

/// Maximum request body size (256 KB). Payload limits are enforced later.
const MAX_REQUEST_BODY_BYTES: usize = 256 * 1024;
/// How often idle rate-limit buckets are dropped.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for the web server.
#[derive(Debug, Clone)]
pub struct WebServerConfig {
    listen: String,
    /// Must be set to `true` to bind on a non-localhost address.
    allow_public_bind: bool,
}

impl WebServerConfig {
    #[must_use]
    pub fn new(listen: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            allow_public_bind: false,
        }
    }

    /// Explicitly opt in to binding on a non-localhost address.
    #[must_use]
    pub fn with_dangerous_public_bind(mut self) -> Self {
        self.allow_public_bind = true;
        self
    }

    fn is_localhost(&self) -> bool {
        match self.listen.parse::<SocketAddr>() {
            Ok(addr) => addr.ip().is_loopback(),
            Err(_) => self.listen.starts_with("localhost:"),
        }
    }
}

/// Handle to a running web server.
#[derive(Debug)]
pub struct WebServerHandle {
    bound_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<std::io::Result<()>>,
    maintenance: tokio::task::JoinHandle<()>,
}

impl WebServerHandle {
    /// The address the server actually bound to.
    #[must_use]
    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.bound_addr)
    }

    /// Stop accepting connections, finish in-flight requests, and wait.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.maintenance.abort();
        handle_server_exit(self.join.await)
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = self.to_body();
        let mut response = (status, Json(&body)).into_response();
        if let Some(ms) = body.retry_after_ms {
            let secs = ms.div_ceil(1_000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

async fn log_requests(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    info!(
        target: "vetsync.web",
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis(),
        "web request"
    );
    response
}

async fn submit_mutation(State(service): State<Arc<MutationService>>, body: Bytes) -> Response {
    let request: SubmitRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return ServiceError::BadRequest(format!("invalid request body: {e}")).into_response();
        }
    };
    match service.submit(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn health(State(service): State<Arc<MutationService>>) -> Response {
    Json(service.health_basic()).into_response()
}

async fn health_detailed(State(service): State<Arc<MutationService>>) -> Response {
    match service.health_detailed().await {
        Ok(health) => Json(health).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn not_found() -> Response {
    ServiceError::NotFound.into_response()
}

/// Build the router. Exposed for embedding in a larger server.
pub fn build_router(service: Arc<MutationService>) -> Router {
    Router::new()
        .route(MUTATIONS_PATH, post(submit_mutation))
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(log_requests))
        .with_state(service)
}

/// Bind and serve in the background.
pub async fn start_web_server(
    config: WebServerConfig,
    service: Arc<MutationService>,
) -> Result<WebServerHandle> {
    if !config.is_localhost() && !config.allow_public_bind {
        return Err(Error::Runtime(format!(
            "refusing to bind on public address '{}'; pass --dangerous-bind-any to override",
            config.listen
        )));
    }
    if !config.is_localhost() {
        warn!(
            target: "vetsync.web",
            listen = %config.listen,
            "binding on a non-localhost address; the mutation endpoint is remotely reachable"
        );
    }

    let listener = TcpListener::bind(&config.listen).await?;
    let bound_addr = listener.local_addr()?;
    let app = build_router(Arc::clone(&service));

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let maintenance = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let pruned = service.resilience().rate_limiter.prune_idle();
            if pruned > 0 {
                tracing::debug!(pruned, "Pruned idle rate-limit buckets");
            }
        }
    });

    info!(target: "vetsync.web", bound_addr = %bound_addr, "web server listening");
    Ok(WebServerHandle {
        bound_addr,
        shutdown: shutdown_tx,
        join,
        maintenance,
    })
}

/// Run the web server until Ctrl+C or SIGTERM, then shut down gracefully.
pub async fn run_web_server(config: WebServerConfig, service: Arc<MutationService>) -> Result<()> {
    let handle = start_web_server(config, service).await?;
    println!("vetsync listening on {}", handle.base_url());
    wait_for_shutdown_signal().await?;
    info!(target: "vetsync.web", "shutdown signal received");
    handle.shutdown().await
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate())
            .map_err(|e| Error::Runtime(format!("SIGTERM handler failed: {e}")))?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| Error::Runtime(format!("Ctrl+C handler failed: {e}")))?;
        Ok(())
    }
}

fn handle_server_exit(
    result: std::result::Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(Error::Runtime(format!("web server error: {err}"))),
        Err(err) => Err(Error::Runtime(format!("web server join error: {err}"))),
    }
}
