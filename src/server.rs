//! HTTP server exposing the configured endpoints behind admission control.

use axum::extract::{ConnectInfo, Request};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::admission::{Admission, AdmissionLayer};
use crate::config::EndpointConfig;
use crate::error::{FloodgateError, Result};
use crate::ratelimit::RequestIdentity;

/// HTTP server for the configured endpoints.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Shared admission controller
    admission: Arc<Admission>,
    endpoints: Vec<EndpointConfig>,
}

impl HttpServer {
    pub fn new(
        addr: SocketAddr,
        admission: Arc<Admission>,
        endpoints: Vec<EndpointConfig>,
    ) -> Self {
        Self {
            addr,
            admission,
            endpoints,
        }
    }

    /// Build the router: one route per endpoint, each wrapped in its own
    /// admission layer, plus an unlimited health check.
    pub fn router(&self) -> Router {
        let mut router = Router::new().route("/health", get(|| async { "ok" }));

        for endpoint in &self.endpoints {
            let layer = AdmissionLayer::new(self.admission.clone(), endpoint.policy());
            let name = endpoint.name.clone();
            let delay = endpoint.response_delay();
            info!(
                endpoint = %endpoint.name,
                path = %endpoint.path,
                rate_limited = endpoint.rate_limited,
                enforce = endpoint.enforce,
                "Registering endpoint"
            );
            router = router.route(
                &endpoint.path,
                any(move || respond(name.clone(), delay)).layer(layer),
            );
        }

        router.layer(middleware::from_fn(resolve_identity))
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(
            addr = %self.addr,
            endpoints = self.endpoints.len(),
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(listener, self.router().into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                FloodgateError::Server(e.to_string())
            })
    }
}

/// Identify callers by peer address. Authentication is out of scope for the
/// server, so every caller is an anonymous client.
async fn resolve_identity(mut request: Request, next: Next) -> Response {
    if request.extensions().get::<RequestIdentity>().is_none() {
        let identity = match request.extensions().get::<ConnectInfo<SocketAddr>>() {
            Some(ConnectInfo(peer)) => RequestIdentity::anonymous(peer.ip().to_string()),
            None => RequestIdentity::default(),
        };
        request.extensions_mut().insert(identity);
    }
    next.run(request).await
}

async fn respond(endpoint: String, delay: Duration) -> impl IntoResponse {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    Json(serde_json::json!({ "endpoint": endpoint }))
}
