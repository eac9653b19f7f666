// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! WebSocket listener for a node.
//!
//! Every upgraded socket becomes an [`Endpoint`](crate::endpoint::Endpoint)
//! served by the node. `/health` reports a short JSON status.

use crate::node::Node;
use crate::transport::ws_link;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bind error: {0}")]
    Bind(String),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Accepts mesh links over WebSocket for one node.
pub struct NodeServer {
    node: Arc<Node>,
    running: AtomicBool,
}

impl NodeServer {
    pub fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            running: AtomicBool::new(false),
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// HTTP routes: the link route from config plus `/health`.
    pub fn router(&self) -> Router {
        let route = self.node.config().ws_route.clone();
        let mut router = Router::new().route(&route, get(ws_handler));
        if route != "/health" {
            router = router.route("/health", get(health_handler));
        }
        router
            .layer(TraceLayer::new_for_http())
            .with_state(self.node.clone())
    }

    /// Bind the configured address and serve until the node shuts down.
    pub async fn run(&self) -> Result<(), ServerError> {
        let config = self.node.config();
        let port = config
            .port
            .ok_or_else(|| ServerError::Config("no listener port configured".into()))?;
        let addr = SocketAddr::new(config.listen_address, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(format!("{}: {}", addr, e)))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }
        let local = listener.local_addr()?;
        info!(
            "[{}] Listening on ws://{}{}",
            self.node.id(),
            local,
            self.node.config().ws_route
        );

        let node = self.node.clone();
        let result = axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { node.shutdown_signal().await })
        .await;

        self.running.store(false, Ordering::SeqCst);
        info!("[{}] Listener stopped", self.node.id());
        result.map_err(ServerError::from)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(node): State<Arc<Node>>,
) -> impl IntoResponse {
    if node.is_shutting_down() {
        warn!("[{}] Refusing link from {}: shutting down", node.id(), addr);
        return (StatusCode::SERVICE_UNAVAILABLE, "Shutting down").into_response();
    }
    debug!("[{}] Upgrading link from {}", node.id(), addr);
    ws.on_upgrade(move |socket| async move {
        node.accept(ws_link(socket, addr.to_string()));
    })
    .into_response()
}

async fn health_handler(State(node): State<Arc<Node>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": if node.is_shutting_down() { "stopping" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "nodeId": node.id(),
        "zone": node.zone(),
        "roles": node.config().roles,
        "nodes": node.peers().node_count(),
        "consumers": node.peers().consumer_count(),
        "topics": node.topics().list_topics(),
    }))
}
