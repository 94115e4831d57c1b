//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::service::{router, DecisionService};
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{IdentityExtractor, TierRegistry};

/// HTTP server for the throttling decision API.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Routes to serve
    router: Router,
}

impl HttpServer {
    /// Create a server exposing the decision API for `registry`.
    pub fn new(
        addr: SocketAddr,
        registry: Arc<TierRegistry>,
        extractor: Arc<IdentityExtractor>,
    ) -> Self {
        let router = router(DecisionService::new(registry, extractor)).layer(TraceLayer::new_for_http());
        Self { addr, router }
    }

    /// Start the server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TurnstileError::Io(e)
        })?;

        info!(addr = %self.addr, "Starting HTTP server for throttle decisions");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
    }
}
