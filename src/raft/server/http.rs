//! HTTP transport between brokers
//!
//! Peers POST JSON-encoded [`GenericMessage`]s to `/raft/message`; the server
//! hands them to the [`ClusterRouter`]. Sends are fire-and-forget so a slow
//! peer never stalls the Raft node that produced the message.

use crate::raft::cluster_router::ClusterRouter;
use crate::raft::errors::TransportError;
use crate::raft::message::GenericMessage;
use crate::raft::transport::MessageSender;
use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use slog::{debug, error, info, warn, Logger};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Produces the JSON body served at `/health`.
pub type StatusProvider = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

#[derive(Clone)]
pub struct HttpServer {
    cluster_router: ClusterRouter,
    status: StatusProvider,
    logger: Logger,
}

impl HttpServer {
    pub fn new(cluster_router: ClusterRouter, status: StatusProvider, logger: Logger) -> Self {
        Self {
            cluster_router,
            status,
            logger,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/raft/message", post(handle_raft_message))
            .route("/health", get(handle_health))
            .with_state(self.clone())
    }

    pub async fn bind(address: &str) -> std::io::Result<TcpListener> {
        TcpListener::bind(address).await
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let address: Option<SocketAddr> = listener.local_addr().ok();
        info!(self.logger, "HTTP server listening"; "address" => ?address);
        let app = self.router();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| {
                error!(self.logger, "HTTP server error"; "error" => %e);
                e
            })
    }
}

async fn handle_raft_message(State(server): State<HttpServer>, Json(message): Json<GenericMessage>) -> Response {
    debug!(server.logger, "Received message via HTTP";
        "partition" => message.partition_id, "from" => message.from);

    match server.cluster_router.route_message(message) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            debug!(server.logger, "Failed to route message"; "error" => %e);
            (StatusCode::SERVICE_UNAVAILABLE, format!("Error: {}", e)).into_response()
        }
    }
}

async fn handle_health(State(server): State<HttpServer>) -> Response {
    Json((server.status)()).into_response()
}

/// HTTP client sending messages to peers at `http://host:port` addresses.
pub struct HttpMessageSender {
    client: reqwest::Client,
    logger: Logger,
}

impl HttpMessageSender {
    pub fn new(logger: Logger) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| TransportError::Other(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, logger })
    }

    fn url(address: &str) -> String {
        if address.starts_with("http://") || address.starts_with("https://") {
            format!("{}/raft/message", address.trim_end_matches('/'))
        } else {
            format!("http://{}/raft/message", address)
        }
    }
}

#[async_trait]
impl MessageSender for HttpMessageSender {
    async fn send(&self, address: &str, message: GenericMessage) -> Result<(), TransportError> {
        let url = Self::url(address);
        let body = serde_json::to_vec(&message).map_err(|e| TransportError::SerializationError {
            reason: e.to_string(),
        })?;
        let node_id = message.to;
        let client = self.client.clone();
        let logger = self.logger.clone();

        tokio::spawn(async move {
            let result = client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    debug!(logger, "Peer rejected message";
                        "node" => node_id, "status" => response.status().as_u16());
                }
                Err(e) => warn!(logger, "HTTP request failed"; "node" => node_id, "error" => %e),
            }
        });
        Ok(())
    }
}
