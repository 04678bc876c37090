//! Metrics and health endpoint
//!
//! - `GET /metrics`: Prometheus text format
//! - `GET /healthz`: liveness, always 200 while the process serves
//! - `GET /readyz`: 200 once the Service cache has synced, 503 before

use crate::apis::metrics::gather_controller_metrics;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Readiness shared between the controller and the health endpoint
#[derive(Debug, Default)]
pub struct HealthState {
    ready: AtomicBool,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Route one request
pub async fn handle<B>(
    req: Request<B>,
    state: Arc<HealthState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::GET {
        return Ok(text_response(StatusCode::NOT_FOUND, "not found\n"));
    }

    let response = match req.uri().path() {
        "/metrics" => match gather_controller_metrics() {
            Ok(metrics) => {
                let mut response = text_response(StatusCode::OK, metrics);
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(METRICS_CONTENT_TYPE));
                response
            }
            Err(e) => {
                error!("{}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, e)
            }
        },
        "/healthz" => text_response(StatusCode::OK, "ok\n"),
        "/readyz" if state.is_ready() => text_response(StatusCode::OK, "ready\n"),
        "/readyz" => text_response(StatusCode::SERVICE_UNAVAILABLE, "cache not synced\n"),
        _ => text_response(StatusCode::NOT_FOUND, "not found\n"),
    };
    Ok(response)
}

/// Serve the endpoint on `listener` until `shutdown` is cancelled
pub async fn serve(listener: TcpListener, state: Arc<HealthState>, shutdown: CancellationToken) {
    match listener.local_addr() {
        Ok(addr) => info!("Metrics server listening on {}", addr),
        Err(e) => debug!("Metrics server address unavailable: {}", e),
    }

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        debug!("Accepted metrics connection from {}", peer_addr);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req: Request<Incoming>| {
                                handle(req, state.clone())
                            });

                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("Metrics accept error: {}", e),
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }

    info!("Metrics server stopped");
}
