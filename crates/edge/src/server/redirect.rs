//! Plaintext HTTP front: HTTP-01 tokens, per-host overrides, HTTPS redirect

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use edge_core::tracing::metrics::counter;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info};

use crate::common::error::Result;
use crate::common::hostname::normalize;

#[derive(Debug, Clone)]
struct HttpChallenge {
    token: String,
    body: String,
}

#[derive(Default)]
struct FrontState {
    challenges: HashMap<String, HttpChallenge>,
    handlers: HashMap<String, Router>,
}

/// HTTP listener that sends everything to HTTPS unless told otherwise
#[derive(Clone, Default)]
pub struct RedirectFront {
    state: Arc<RwLock<FrontState>>,
}

impl RedirectFront {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` at `/.well-known/acme-challenge/<token>` for `hostname`
    pub async fn set_challenge(&self, hostname: &str, token: &str, body: &str) {
        self.state.write().await.challenges.insert(
            normalize(hostname),
            HttpChallenge {
                token: token.to_ascii_lowercase(),
                body: body.to_string(),
            },
        );
    }

    pub async fn clear_challenge(&self, hostname: &str) {
        self.state
            .write()
            .await
            .challenges
            .remove(&normalize(hostname));
    }

    /// Serve `hostname` with `handler` instead of redirecting; `None` removes it
    pub async fn set_handler(&self, hostname: &str, handler: Option<Router>) {
        let hostname = normalize(hostname);
        let mut state = self.state.write().await;
        match handler {
            Some(handler) => {
                state.handlers.insert(hostname, handler);
            }
            None => {
                state.handlers.remove(&hostname);
            }
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/.well-known/acme-challenge/{token}", get(serve_challenge))
            .fallback(redirect_or_delegate)
            .with_state(self.clone())
    }

    /// Serve on `listener` until `shutdown` fires
    pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!("HTTP redirect front listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

/// Request host without port, lowercased
fn request_host(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let raw = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| uri.host())?;
    let host = if raw.starts_with('[') {
        raw.split_inclusive(']').next().unwrap_or(raw)
    } else {
        raw.split(':').next().unwrap_or(raw)
    };
    let host = normalize(host);
    (!host.is_empty()).then_some(host)
}

async fn serve_challenge(
    State(front): State<RedirectFront>,
    Path(token): Path<String>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let Some(host) = request_host(&headers, &uri) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let state = front.state.read().await;
    match state.challenges.get(&host) {
        Some(challenge) if challenge.token == token.to_ascii_lowercase() => {
            debug!("Serving HTTP-01 token for {}", host);
            challenge.body.clone().into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn redirect_or_delegate(State(front): State<RedirectFront>, request: Request) -> Response {
    let Some(host) = request_host(request.headers(), request.uri()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let handler = front.state.read().await.handlers.get(&host).cloned();
    if let Some(handler) = handler {
        return match handler.oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };
    }

    let path_and_query = request
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let target = format!("https://{host}{path_and_query}");
    counter("edge_http_redirects_total").increment();
    debug!("Redirecting to {}", target);

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(header::LOCATION, target)
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::BAD_REQUEST.into_response())
}
