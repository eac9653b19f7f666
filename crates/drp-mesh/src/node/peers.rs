// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Live links of a node, indexed for routing.

use crate::endpoint::{Endpoint, EndpointId, PeerInfo};
use crate::protocol::{NodeId, Role};
use crate::router::EndpointDirectory;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Relay statistics.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStats {
    /// Commands forwarded on behalf of another node.
    pub commands_relayed: u64,
    /// Forwarding failures (no route, loop, dead link).
    pub relay_errors: u64,
    /// Topology packets sent to peers.
    pub topology_sent: u64,
}

#[derive(Default)]
struct Counters {
    commands_relayed: AtomicU64,
    relay_errors: AtomicU64,
    topology_sent: AtomicU64,
}

/// Node and consumer links of one node.
#[derive(Default)]
pub struct PeerTable {
    nodes: DashMap<NodeId, Arc<Endpoint>>,
    consumers: DashMap<EndpointId, Arc<Endpoint>>,
    counters: Counters,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node link. Returns the link it replaced, if any.
    pub fn add_node(&self, node_id: &str, endpoint: Arc<Endpoint>) -> Option<Arc<Endpoint>> {
        self.nodes.insert(node_id.to_string(), endpoint)
    }

    /// Forget whatever `endpoint` was registered as.
    ///
    /// A node entry is only removed when it still points at this endpoint,
    /// so a replaced link closing late does not evict its successor.
    pub fn remove_endpoint(&self, endpoint: &Endpoint) -> Option<NodeId> {
        self.consumers.remove(endpoint.id());
        let node_id = endpoint.peer_node_id()?;
        self.nodes
            .remove_if(&node_id, |_, ep| ep.id() == endpoint.id())
            .map(|(id, _)| id)
    }

    /// Live link to a node.
    pub fn node(&self, node_id: &str) -> Option<Arc<Endpoint>> {
        self.nodes
            .get(node_id)
            .map(|e| e.clone())
            .filter(|e| !e.is_closed())
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.node(node_id).is_some()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn live_nodes(&self) -> Vec<(NodeId, Arc<Endpoint>)> {
        self.nodes
            .iter()
            .filter(|e| !e.value().is_closed())
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn add_consumer(&self, endpoint: Arc<Endpoint>) {
        self.consumers.insert(endpoint.id().to_string(), endpoint);
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Connected peers that declared the Registry role.
    pub fn registry_link_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|e| match e.value().peer() {
                PeerInfo::Node(decl) => decl.has_role(Role::Registry),
                _ => false,
            })
            .count()
    }

    /// Every link, nodes and consumers.
    pub fn all_endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.nodes
            .iter()
            .map(|e| e.value().clone())
            .chain(self.consumers.iter().map(|e| e.value().clone()))
            .collect()
    }

    pub fn record_relayed(&self) {
        self.counters.commands_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay_error(&self) {
        self.counters.relay_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_topology_sent(&self, count: usize) {
        self.counters
            .topology_sent
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PeerStats {
        PeerStats {
            commands_relayed: self.counters.commands_relayed.load(Ordering::Relaxed),
            relay_errors: self.counters.relay_errors.load(Ordering::Relaxed),
            topology_sent: self.counters.topology_sent.load(Ordering::Relaxed),
        }
    }
}

fn summary(endpoint: &Endpoint) -> Value {
    json!({
        "endpointId": endpoint.id(),
        "remote": endpoint.remote(),
        "pendingCalls": endpoint.pending_count(),
        "streamHandlers": endpoint.stream_handler_count(),
        "stats": endpoint.stats(),
    })
}

impl EndpointDirectory for PeerTable {
    fn node_endpoints(&self) -> BTreeMap<NodeId, Value> {
        self.nodes
            .iter()
            .map(|e| {
                let mut value = summary(e.value());
                if let PeerInfo::Node(decl) = e.value().peer() {
                    value["declaration"] = json!(decl.redacted());
                }
                (e.key().clone(), value)
            })
            .collect()
    }

    fn consumer_endpoints(&self) -> BTreeMap<String, Value> {
        self.consumers
            .iter()
            .map(|e| {
                let mut value = summary(e.value());
                if let PeerInfo::Consumer { user: Some(user) } = e.value().peer() {
                    value["user"] = json!(user);
                }
                (e.key().clone(), value)
            })
            .collect()
    }
}
