//! Terminating handlers: consumers of the decrypted side of a connection

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use http::header::{HOST, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode, Uri};
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server;
use tower::Service;
use tracing::{debug, warn};

use crate::common::error::{EdgeError, Result};
use crate::common::types::ConnectionInfo;
use crate::server::conn::{BoxedIo, ConnWrapper};

/// A server-side TLS stream whose handshake the router completed
pub type TlsConnection = tokio_rustls::server::TlsStream<ConnWrapper<BoxedIo>>;

/// Receives decrypted connections for a terminating binding
///
/// The handler owns the connection and is responsible for closing it.
#[async_trait]
pub trait TerminatingHandler: Send + Sync {
    async fn handle(&self, conn: TlsConnection, info: ConnectionInfo) -> Result<()>;
}

/// Serves an axum router over the decrypted stream (HTTP/1.1 or HTTP/2)
///
/// Each request carries the [`ConnectionInfo`] of its connection as an
/// extension.
#[derive(Clone)]
pub struct HttpHandler {
    router: axum::Router,
}

impl HttpHandler {
    pub fn new(router: axum::Router) -> Self {
        Self { router }
    }
}

impl std::fmt::Debug for HttpHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpHandler").finish()
    }
}

#[async_trait]
impl TerminatingHandler for HttpHandler {
    async fn handle(&self, conn: TlsConnection, info: ConnectionInfo) -> Result<()> {
        let router = self.router.clone();
        let service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
            request.extensions_mut().insert(info);
            router.clone().call(request)
        });

        server::conn::auto::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(conn), service)
            .await
            .map_err(|e| EdgeError::Http(e.to_string()))?;

        debug!("HTTP connection from {} completed", info.peer_addr);
        Ok(())
    }
}

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Forwards decrypted HTTP requests to a plaintext backend
///
/// The original `Host` header is kept; the client address, scheme and host
/// are announced with `X-Forwarded-*` headers.
#[derive(Clone)]
pub struct ReverseProxyHandler {
    backend: Uri,
    client: Client<HttpConnector, Body>,
}

impl ReverseProxyHandler {
    /// `backend` must be an `http://host[:port]` URL
    pub fn new(backend: &str) -> Result<Self> {
        let backend: Uri = backend
            .parse()
            .map_err(|e| EdgeError::Config(format!("invalid backend {backend}: {e}")))?;
        if backend.scheme_str() != Some("http") || backend.authority().is_none() {
            return Err(EdgeError::Config(format!(
                "backend must be http://host[:port], got {backend}"
            )));
        }

        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Ok(Self { backend, client })
    }

    pub fn backend(&self) -> &Uri {
        &self.backend
    }

    async fn forward(&self, request: Request<Incoming>, info: ConnectionInfo) -> Response<Body> {
        let request = match self.rewrite(request, &info) {
            Ok(request) => request,
            Err(e) => {
                warn!("Could not rewrite request for {}: {}", self.backend, e);
                return status_response(StatusCode::BAD_REQUEST);
            }
        };

        match self.client.request(request).await {
            Ok(response) => response.map(Body::new),
            Err(e) => {
                warn!("Backend {} failed: {}", self.backend, e);
                status_response(StatusCode::BAD_GATEWAY)
            }
        }
    }

    fn rewrite(&self, request: Request<Incoming>, info: &ConnectionInfo) -> Result<Request<Body>> {
        let (mut parts, body) = request.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map_or("/", |pq| pq.as_str())
            .to_string();
        let mut uri = Uri::builder().scheme("http").path_and_query(path_and_query);
        if let Some(authority) = self.backend.authority() {
            uri = uri.authority(authority.clone());
        }
        let original_host = parts
            .headers
            .get(HOST)
            .cloned()
            .or_else(|| parts.uri.authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()));
        parts.uri = uri.build().map_err(|e| EdgeError::Http(e.to_string()))?;
        // HTTP/2 requests carry the host in :authority only.
        parts.version = http::Version::HTTP_11;

        let client_ip = info.peer_addr.ip().to_string();
        let forwarded_for = match parts.headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{prior}, {client_ip}"),
            None => client_ip,
        };
        let forwarded_for =
            HeaderValue::from_str(&forwarded_for).map_err(|e| EdgeError::Http(e.to_string()))?;
        parts.headers.insert(X_FORWARDED_FOR, forwarded_for);
        parts
            .headers
            .insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
        if let Some(host) = original_host {
            parts.headers.insert(X_FORWARDED_HOST, host.clone());
            parts.headers.insert(HOST, host);
        }

        Ok(Request::from_parts(parts, Body::new(body)))
    }
}

impl std::fmt::Debug for ReverseProxyHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseProxyHandler")
            .field("backend", &self.backend)
            .finish()
    }
}

#[async_trait]
impl TerminatingHandler for ReverseProxyHandler {
    async fn handle(&self, conn: TlsConnection, info: ConnectionInfo) -> Result<()> {
        let proxy = Arc::new(self.clone());
        let service = hyper::service::service_fn(move |request: Request<Incoming>| {
            let proxy = proxy.clone();
            async move { Ok::<_, std::convert::Infallible>(proxy.forward(request, info).await) }
        });

        server::conn::auto::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(conn), service)
            .await
            .map_err(|e| EdgeError::Http(e.to_string()))?;
        Ok(())
    }
}

fn status_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}
