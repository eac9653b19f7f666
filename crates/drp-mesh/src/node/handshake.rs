// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `hello` admission, both directions.

use super::Node;
use crate::auth::{AuthResponse, AUTHENTICATE};
use crate::endpoint::{Endpoint, PeerInfo};
use crate::error::{MeshError, MeshResult};
use crate::protocol::{
    close_code, verbs, CallerType, CmdPacket, HelloReply, HelloRequest, NodeDeclaration, NodeId,
    Role,
};
use crate::service::CallContext;
use crate::topology::{NodeTableEntry, TopologyCmd, TopologyEntry, TopologyPacket};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a node `hello` we sent came back with.
#[derive(Debug)]
pub(super) enum HelloOutcome {
    Joined(NodeId),
    /// Try these registries instead.
    Redirect(Vec<String>),
}

pub(super) fn user_agent() -> String {
    format!("drp-mesh/{}", env!("CARGO_PKG_VERSION"))
}

/// Close code matching a failed handshake.
pub(super) fn close_code_for(error: &MeshError) -> u16 {
    match error {
        MeshError::AuthFailed(_) => close_code::AUTH_FAILED,
        MeshError::DuplicateNodeId(_) => close_code::DUPLICATE_NODE,
        _ => close_code::NORMAL,
    }
}

impl Node {
    /// Answer a `hello` received on `endpoint`.
    pub(super) async fn accept_hello(
        self: &Arc<Self>,
        endpoint: &Arc<Endpoint>,
        request: HelloRequest,
    ) -> MeshResult<HelloReply> {
        if !matches!(endpoint.peer(), PeerInfo::Unknown) {
            return Err(MeshError::InvalidRequest("hello already completed".into()));
        }
        match request.declaration {
            Some(declaration) => self.accept_node(endpoint, declaration).await,
            None => self.accept_consumer(endpoint, request).await,
        }
    }

    async fn accept_node(
        self: &Arc<Self>,
        endpoint: &Arc<Endpoint>,
        declaration: NodeDeclaration,
    ) -> MeshResult<HelloReply> {
        let peer_id = declaration.node_id.clone();
        if declaration.domain != self.config.domain {
            warn!("[{}] Rejecting {}: domain mismatch", self.id(), peer_id);
            return Err(MeshError::AuthFailed("domain mismatch".into()));
        }
        if declaration.mesh_key != self.config.mesh_key {
            warn!("[{}] Rejecting {}: bad mesh key", self.id(), peer_id);
            return Err(MeshError::AuthFailed("mesh key mismatch".into()));
        }
        if peer_id == self.id() || self.peers.is_connected(&peer_id) {
            warn!("[{}] Rejecting duplicate node id {}", self.id(), peer_id);
            return Err(MeshError::DuplicateNodeId(peer_id));
        }
        if let Some(via) = self.live_twin_route(&declaration) {
            warn!(
                "[{}] Rejecting duplicate node id {}: another instance is reachable via {}",
                self.id(),
                peer_id,
                via
            );
            return Err(MeshError::DuplicateNodeId(peer_id));
        }

        if self.is_registry()
            && declaration.zone != self.zone()
            && !declaration.has_role(Role::Registry)
            && !declaration.has_role(Role::Relay)
        {
            let redirect: Vec<String> = self
                .topology
                .find_registries_in_zone(&declaration.zone)
                .into_iter()
                .filter_map(|n| n.node_url)
                .collect();
            if !redirect.is_empty() {
                info!(
                    "[{}] Redirecting {} to zone {} registries",
                    self.id(),
                    peer_id,
                    declaration.zone
                );
                return Ok(HelloReply {
                    declaration: self.declaration(),
                    redirect,
                    user: None,
                });
            }
        }

        let declaration = declaration.redacted();
        endpoint.set_peer(PeerInfo::Node(declaration.clone()));
        self.peers.add_node(&peer_id, endpoint.clone());
        info!(
            "[{}] Node {} joined from {} (zone {}, roles {:?})",
            self.id(),
            peer_id,
            endpoint.remote(),
            declaration.zone,
            declaration.roles
        );
        self.learn_peer(&declaration).await;

        // pull what the newcomer knows
        let node = self.clone();
        let link = endpoint.clone();
        tokio::spawn(async move {
            if let Err(e) = node.import_registry(&link).await {
                warn!("[{}] Registry import from {} failed: {}", node.id(), peer_id, e);
            }
        });

        Ok(HelloReply {
            declaration: self.declaration(),
            redirect: Vec::new(),
            user: None,
        })
    }

    async fn accept_consumer(
        self: &Arc<Self>,
        endpoint: &Arc<Endpoint>,
        request: HelloRequest,
    ) -> MeshResult<HelloReply> {
        if self.peers.consumer_count() >= self.config.max_consumers {
            return Err(MeshError::InvalidRequest("consumer limit reached".into()));
        }
        let user = match &self.config.authenticator_service {
            Some(service) => {
                let auth = request
                    .auth
                    .filter(|a| a.is_complete())
                    .ok_or_else(|| MeshError::AuthFailed("credentials required".into()))?;
                let ctx = CallContext::local(self.id());
                let answer = self
                    .service_command_ctx(service, AUTHENTICATE, serde_json::to_value(&auth)?, &ctx)
                    .await?;
                if answer.is_null() {
                    warn!("[{}] Consumer {} failed authentication", self.id(), endpoint.id());
                    return Err(MeshError::AuthFailed("invalid credentials".into()));
                }
                Some(serde_json::from_value::<AuthResponse>(answer)?)
            }
            None if self.config.allow_anonymous_consumers => None,
            None => {
                warn!("[{}] Consumer {} refused: no authenticator", self.id(), endpoint.id());
                return Err(MeshError::AuthFailed("no authenticator configured".into()));
            }
        };
        endpoint.set_peer(PeerInfo::Consumer { user: user.clone() });
        self.peers.add_consumer(endpoint.clone());
        info!(
            "[{}] Consumer {} connected from {} ({})",
            self.id(),
            endpoint.id(),
            endpoint.remote(),
            request.user_agent.as_deref().unwrap_or("unknown agent")
        );
        Ok(HelloReply {
            declaration: self.declaration(),
            redirect: Vec::new(),
            user,
        })
    }

    /// Peer through which a different process with the same node ID is
    /// still reachable.
    fn live_twin_route(&self, declaration: &NodeDeclaration) -> Option<NodeId> {
        let known = self.topology.node(&declaration.node_id)?;
        if known.instance_id.is_none() || known.instance_id == declaration.instance_id {
            return None;
        }
        known
            .learned_from
            .filter(|via| via != &declaration.node_id && self.peers.is_connected(via))
    }

    /// Record a directly connected peer and tell the others.
    async fn learn_peer(&self, declaration: &NodeDeclaration) {
        let packet = TopologyPacket {
            origin_node_id: declaration.node_id.clone(),
            cmd: TopologyCmd::Add,
            entry: TopologyEntry::Node(NodeTableEntry::from_declaration(declaration)),
        };
        let applied = self.topology.process_packet(packet, &declaration.node_id);
        self.advertise(applied, Some(&declaration.node_id)).await;
        self.publish_registry_event("register", &declaration.node_id, Some(declaration));
    }

    /// Import the peer's registry view.
    pub(super) async fn import_registry(&self, endpoint: &Endpoint) -> MeshResult<usize> {
        let peer_id = endpoint
            .peer_node_id()
            .ok_or_else(|| MeshError::InvalidRequest("registry import before hello".into()))?;
        let cmd = CmdPacket::new(verbs::GET_REGISTRY, json!({ "nodeId": self.id() }))
            .caller(CallerType::Node);
        let packets: Vec<TopologyPacket> = serde_json::from_value(endpoint.call(cmd).await?)?;
        let received = packets.len();
        let applied = self.apply_topology(packets, &peer_id).await;
        debug!(
            "[{}] Imported {}/{} topology rows from {}",
            self.id(),
            applied,
            received,
            peer_id
        );
        Ok(applied)
    }

    /// Send our `hello` on a link we dialed, then exchange registries.
    pub(super) async fn node_hello(self: &Arc<Self>, endpoint: &Arc<Endpoint>) -> MeshResult<HelloOutcome> {
        let request = HelloRequest {
            declaration: Some(self.declaration.clone()),
            auth: None,
            user_agent: Some(user_agent()),
        };
        let cmd = CmdPacket::new(verbs::HELLO, serde_json::to_value(request)?)
            .caller(CallerType::Node);
        let reply: HelloReply = serde_json::from_value(endpoint.call(cmd).await?)?;
        if !reply.redirect.is_empty() {
            return Ok(HelloOutcome::Redirect(reply.redirect));
        }

        let peer = reply.declaration;
        if peer.node_id == self.id() {
            return Err(MeshError::DuplicateNodeId(peer.node_id));
        }
        endpoint.set_peer(PeerInfo::Node(peer.clone()));
        if let Some(previous) = self.peers.add_node(&peer.node_id, endpoint.clone()) {
            if previous.id() != endpoint.id() {
                previous.close(close_code::GOING_AWAY);
            }
        }
        self.learn_peer(&peer).await;
        self.import_registry(endpoint).await?;
        self.declare_to(endpoint, &peer.node_id).await?;
        Ok(HelloOutcome::Joined(peer.node_id))
    }

    /// Push our advertisable rows to a peer and wait for it to take them.
    async fn declare_to(&self, endpoint: &Endpoint, peer_id: &str) -> MeshResult<()> {
        let packets = self.topology.get_registry(peer_id);
        if packets.is_empty() {
            return Ok(());
        }
        let count = packets.len();
        let cmd = CmdPacket::new(verbs::TOPOLOGY_UPDATE, serde_json::to_value(&packets)?)
            .caller(CallerType::Node);
        endpoint.call(cmd).await?;
        self.peers.record_topology_sent(count);
        Ok(())
    }
}
