// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbound links: registry membership with reconnect, and direct node dials.

use super::handshake::{close_code_for, HelloOutcome};
use super::Node;
use crate::endpoint::Endpoint;
use crate::error::{ErrorPayload, MeshError, MeshResult};
use crate::protocol::close_code;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Consecutive redirects followed before backing off.
const MAX_REDIRECTS: u32 = 3;

/// Progress of a registry link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    /// Registry has acknowledged our declaration.
    Declared,
    Active,
}

type ConnectedCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle on a registry link kept alive in the background.
pub struct MeshConnection {
    state: watch::Receiver<ConnectionState>,
    failure: Arc<Mutex<Option<ErrorPayload>>>,
    stop: Arc<watch::Sender<bool>>,
    task: JoinHandle<()>,
}

impl MeshConnection {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Fatal error that ended the link, if any.
    pub fn failure(&self) -> Option<MeshError> {
        self.failure
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .map(MeshError::from_payload)
    }

    /// Wait until the link is active, or until it gives up for good.
    pub async fn connected(&self) -> MeshResult<()> {
        let mut rx = self.state.clone();
        loop {
            if *rx.borrow_and_update() == ConnectionState::Active {
                return Ok(());
            }
            if let Some(e) = self.failure() {
                return Err(e);
            }
            if rx.changed().await.is_err() {
                return Err(self.failure().unwrap_or(MeshError::ConnectionClosed));
            }
        }
    }

    /// Wait for a given state.
    pub async fn wait_for(&self, state: ConnectionState) -> MeshResult<()> {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == state)
            .await
            .map(|_| ())
            .map_err(|_| self.failure().unwrap_or(MeshError::ConnectionClosed))
    }

    /// Whether the reconnect loop has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the link and stop reconnecting.
    pub fn close(&self) {
        self.stop.send_replace(true);
    }
}

impl std::fmt::Debug for MeshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshConnection")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>, shutdown: &mut watch::Receiver<bool>) {
    let stopped = async {
        let _ = stop.wait_for(|s| *s).await;
    };
    let shut_down = async {
        let _ = shutdown.wait_for(|s| *s).await;
    };
    tokio::select! {
        _ = stopped => {}
        _ = shut_down => {}
    }
}

impl Node {
    /// Join the mesh through one registry, reconnecting with backoff.
    pub fn connect_to_registry(self: &Arc<Self>, url: &str) -> MeshConnection {
        self.start_connection(vec![url.to_string()], None)
    }

    /// Like [`Node::connect_to_registry`], calling `on_connected` once the
    /// first declaration has been acknowledged.
    pub fn connect_to_registry_with<F>(self: &Arc<Self>, url: &str, on_connected: F) -> MeshConnection
    where
        F: FnOnce() + Send + 'static,
    {
        self.start_connection(vec![url.to_string()], Some(Box::new(on_connected)))
    }

    /// Join the mesh through the configured registries, tried in order.
    pub fn connect_to_mesh(self: &Arc<Self>) -> MeshResult<MeshConnection> {
        if self.config.registry_urls.is_empty() {
            return Err(MeshError::InvalidRequest("no registry_urls configured".into()));
        }
        Ok(self.start_connection(self.config.registry_urls.clone(), None))
    }

    fn start_connection(
        self: &Arc<Self>,
        urls: Vec<String>,
        on_connected: Option<ConnectedCallback>,
    ) -> MeshConnection {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop = Arc::new(stop_tx);
        let failure = Arc::new(Mutex::new(None));
        let task = tokio::spawn(run_connection(
            self.clone(),
            urls,
            state_tx,
            failure.clone(),
            stop.clone(),
            stop_rx,
            on_connected,
        ));
        MeshConnection {
            state: state_rx,
            failure,
            stop,
            task,
        }
    }

    /// Dial a node directly. No reconnect; redirects are refused.
    pub async fn connect_to_node(self: &Arc<Self>, url: &str) -> MeshResult<Arc<Endpoint>> {
        let link = self.connector.connect(url).await?;
        let endpoint = self.spawn_endpoint(link, true);
        match self.node_hello(&endpoint).await {
            Ok(HelloOutcome::Joined(peer)) => {
                info!("[{}] Connected to node {} at {}", self.id(), peer, url);
                Ok(endpoint)
            }
            Ok(HelloOutcome::Redirect(_)) => {
                endpoint.close(close_code::REDIRECTED);
                Err(MeshError::NodeUnreachable(format!("{} redirected us", url)))
            }
            Err(e) => {
                endpoint.close(close_code_for(&e));
                Err(e)
            }
        }
    }

    async fn dial_registry(
        self: &Arc<Self>,
        url: &str,
        state: &watch::Sender<ConnectionState>,
    ) -> MeshResult<(Arc<Endpoint>, HelloOutcome)> {
        let link = self.connector.connect(url).await?;
        let endpoint = self.spawn_endpoint(link, true);
        state.send_replace(ConnectionState::Handshaking);
        match self.node_hello(&endpoint).await {
            Ok(outcome) => Ok((endpoint, outcome)),
            Err(e) => {
                endpoint.close(close_code_for(&e));
                Err(e)
            }
        }
    }
}

/// Registries to try after a redirect: the zone registries first, then the
/// original list in case those go away.
fn redirect_order(targets: Vec<String>, configured: &[String]) -> Vec<String> {
    let mut urls = targets;
    for url in configured {
        if !urls.contains(url) {
            urls.push(url.clone());
        }
    }
    urls
}

async fn run_connection(
    node: Arc<Node>,
    mut urls: Vec<String>,
    state: watch::Sender<ConnectionState>,
    failure: Arc<Mutex<Option<ErrorPayload>>>,
    // held so the stop channel outlives every external handle
    _stop_keep: Arc<watch::Sender<bool>>,
    mut stop: watch::Receiver<bool>,
    mut on_connected: Option<ConnectedCallback>,
) {
    let configured = urls.clone();
    let policy = node.config.reconnect_policy();
    let mut shutdown = node.shutdown_tx.subscribe();
    let mut index = 0usize;
    let mut attempt = 0u32;
    let mut redirects = 0u32;

    loop {
        if *stop.borrow() || *shutdown.borrow() {
            break;
        }
        let url = urls[index % urls.len()].clone();
        state.send_replace(ConnectionState::Connecting);
        debug!("[{}] Connecting to registry {}", node.id(), url);

        match node.dial_registry(&url, &state).await {
            Ok((endpoint, HelloOutcome::Joined(peer))) => {
                attempt = 0;
                redirects = 0;
                let stale = node.topology.stale_entry_cleanup(&node.peers.node_ids());
                if stale > 0 {
                    debug!("[{}] Dropped {} stale rows after rejoin", node.id(), stale);
                }
                state.send_replace(ConnectionState::Declared);
                if let Some(callback) = on_connected.take() {
                    callback();
                }
                state.send_replace(ConnectionState::Active);
                info!("[{}] Registry {} active at {}", node.id(), peer, url);

                tokio::select! {
                    code = endpoint.closed() => {
                        warn!("[{}] Registry {} link closed ({})", node.id(), peer, code);
                        state.send_replace(ConnectionState::Disconnected);
                    }
                    _ = stop_requested(&mut stop, &mut shutdown) => {
                        endpoint.close(close_code::NORMAL);
                        break;
                    }
                }
            }
            Ok((endpoint, HelloOutcome::Redirect(targets))) => {
                endpoint.close(close_code::REDIRECTED);
                redirects += 1;
                if redirects <= MAX_REDIRECTS {
                    info!("[{}] {} redirected us to {:?}", node.id(), url, targets);
                    urls = redirect_order(targets, &configured);
                    index = 0;
                    continue;
                }
                warn!("[{}] Too many redirects, backing off", node.id());
                redirects = 0;
                state.send_replace(ConnectionState::Disconnected);
            }
            Err(e) if e.is_fatal_for_connect() => {
                error!("[{}] Registry {} refused us: {}", node.id(), url, e);
                *failure.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.to_payload(None));
                state.send_replace(ConnectionState::Disconnected);
                return;
            }
            Err(e) => {
                warn!("[{}] Registry {} unavailable: {}", node.id(), url, e);
                state.send_replace(ConnectionState::Disconnected);
            }
        }

        let delay = policy.delay(attempt);
        attempt = attempt.saturating_add(1);
        index += 1;
        debug!("[{}] Reconnecting in {:?}", node.id(), delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop_requested(&mut stop, &mut shutdown) => break,
        }
    }
    state.send_replace(ConnectionState::Disconnected);
    debug!("[{}] Registry link loop ended", node.id());
}
