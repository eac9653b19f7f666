// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mesh node.
//!
//! A node owns its links ([`Endpoint`]s), its local services and topics,
//! and a view of the mesh topology. Depending on its roles it also:
//!
//! - **Registry**: admits nodes, redirects cross-zone joins, publishes
//!   `RegistryUpdate` events
//! - **Broker**: resolves service calls and subscriptions for consumers
//! - **Relay**: forwards commands and topology between peers
//! - **Provider**: hosts services and streams

mod commands;
mod handshake;
mod mesh;
mod peers;
mod relay;

pub use mesh::{ConnectionState, MeshConnection};
pub use peers::{PeerStats, PeerTable};

use crate::auth::{AuthInfo, AuthResponse, UserInfo};
use crate::config::NodeConfig;
use crate::endpoint::{CommandDispatcher, Endpoint, EndpointId, EndpointObserver, PeerInfo};
use crate::error::{MeshError, MeshResult};
use crate::protocol::{
    close_code, verbs, CallerType, CmdPacket, NodeDeclaration, Role, Scope, StreamToken,
    REGISTRY_UPDATE_TOPIC,
};
use crate::router::CommandRouter;
use crate::service::{CallContext, Caller, Service, ServiceInfo};
use crate::subscription::Subscription;
use crate::topic::TopicManager;
use crate::topology::{
    NodeTableEntry, ServiceTableEntry, StreamTableEntry, TopologyEntry, TopologyPacket,
    TopologyTracker,
};
use crate::transport::{Connector, Link};
use async_trait::async_trait;
use dashmap::DashMap;
use relay::ServedStream;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// A mesh node.
pub struct Node {
    config: NodeConfig,
    declaration: NodeDeclaration,
    connector: Arc<dyn Connector>,
    topics: Arc<TopicManager>,
    topology: Arc<TopologyTracker>,
    router: CommandRouter,
    peers: PeerTable,
    /// Streams this node feeds to a peer, keyed by the peer's stream token.
    served: DashMap<(EndpointId, StreamToken), ServedStream>,
    shutdown_tx: watch::Sender<bool>,
    handle: Arc<NodeHandle>,
}

/// Weak back-reference handed to endpoints, so links do not keep the node alive.
struct NodeHandle(Weak<Node>);

#[async_trait]
impl CommandDispatcher for NodeHandle {
    async fn dispatch(&self, endpoint: Arc<Endpoint>, cmd: CmdPacket) -> MeshResult<Value> {
        let node = self.0.upgrade().ok_or(MeshError::ConnectionClosed)?;
        node.handle_cmd(endpoint, cmd).await
    }
}

impl EndpointObserver for NodeHandle {
    fn on_close(&self, endpoint: &Endpoint, code: u16) {
        if let Some(node) = self.0.upgrade() {
            node.endpoint_closed(endpoint, code);
        }
    }

    fn on_error(&self, endpoint: &Endpoint, error: &str) {
        warn!("[{}] Link error: {}", endpoint.id(), error);
    }
}

impl Node {
    /// Build a node. Nothing is dialed or listened on yet.
    pub fn new(config: NodeConfig, connector: Arc<dyn Connector>) -> MeshResult<Arc<Self>> {
        config.validate()?;
        let mut declaration = config.declaration();
        declaration.instance_id = Some(uuid::Uuid::new_v4().simple().to_string());
        let topics = Arc::new(TopicManager::new(
            &config.node_id,
            &config.zone,
            config.subscriber_queue_depth,
        ));
        let topology = Arc::new(TopologyTracker::new(
            &config.node_id,
            &config.zone,
            &config.roles,
        ));
        topology.add_local(TopologyEntry::Node(NodeTableEntry::from_declaration(
            &declaration,
        )));
        let router = CommandRouter::new(
            &config.node_id,
            declaration.node_url.clone(),
            topics.clone(),
            topology.clone(),
        );
        let (shutdown_tx, _) = watch::channel(false);

        let node = Arc::new_cyclic(|weak| Self {
            config,
            declaration,
            connector,
            topics,
            topology,
            router,
            peers: PeerTable::new(),
            served: DashMap::new(),
            shutdown_tx,
            handle: Arc::new(NodeHandle(weak.clone())),
        });

        if node.is_registry() {
            node.declare_stream(REGISTRY_UPDATE_TOPIC, "Node join and leave events")?;
        }
        info!(
            "[{}] Node ready (zone {}, roles {:?})",
            node.id(),
            node.zone(),
            node.config.roles
        );
        Ok(node)
    }

    pub fn id(&self) -> &str {
        &self.config.node_id
    }

    pub fn zone(&self) -> &str {
        &self.config.zone
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Declaration with the mesh key removed.
    pub fn declaration(&self) -> NodeDeclaration {
        self.declaration.redacted()
    }

    pub fn topics(&self) -> &Arc<TopicManager> {
        &self.topics
    }

    pub fn topology(&self) -> &Arc<TopologyTracker> {
        &self.topology
    }

    pub fn router(&self) -> &CommandRouter {
        &self.router
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn is_registry(&self) -> bool {
        self.config.has_role(Role::Registry)
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Host a service and advertise it to the mesh.
    pub async fn add_service(&self, service: Arc<dyn Service>) {
        let entry = ServiceTableEntry::hosted(
            self.id(),
            self.zone(),
            service.name(),
            &service.info(),
            service.list_commands(),
            service.classes().iter().map(|c| c.name().to_string()).collect(),
        );
        if self.router.add_service(service).is_some() {
            debug!("[{}] Replaced service {}", self.id(), entry.name);
        }
        let packet = self.topology.add_local(TopologyEntry::Service(entry));
        self.advertise(vec![packet], None).await;
    }

    /// Stop hosting a service.
    pub async fn remove_service(&self, name: &str) -> bool {
        if self.router.remove_service(name).is_none() {
            return false;
        }
        let entry = ServiceTableEntry::hosted(
            self.id(),
            self.zone(),
            name,
            &ServiceInfo::default(),
            Vec::new(),
            Vec::new(),
        );
        if let Some(packet) = self.topology.remove_local(TopologyEntry::Service(entry)) {
            self.advertise(vec![packet], None).await;
        }
        true
    }

    /// Declare a topic published here and advertise it.
    pub async fn add_stream(&self, topic: &str, description: &str) -> MeshResult<()> {
        let packet = self.declare_stream(topic, description)?;
        self.advertise(vec![packet], None).await;
        Ok(())
    }

    fn declare_stream(&self, topic: &str, description: &str) -> MeshResult<TopologyPacket> {
        self.topics.add_stream(topic, description)?;
        Ok(self
            .topology
            .add_local(TopologyEntry::Stream(StreamTableEntry {
                node_id: self.id().to_string(),
                topic: topic.to_string(),
                description: description.to_string(),
                scope: self.config.scope,
                zone: self.zone().to_string(),
                learned_from: None,
            })))
    }

    /// Publish to local subscribers. Returns how many accepted the payload.
    pub fn send_to_topic(&self, topic: &str, payload: Value) -> usize {
        self.topics.send_to_topic(topic, payload)
    }

    /// Commands reachable from this node.
    pub fn get_cmds(&self) -> Value {
        self.router.get_cmds()
    }

    /// Resolve a path, locally or wherever it leads.
    pub async fn path_cmd(
        self: &Arc<Self>,
        path: &[String],
        list_only: bool,
        params: Value,
    ) -> MeshResult<Value> {
        let ctx = CallContext::local(self.id());
        self.path_cmd_ctx(path, list_only, params, &ctx).await
    }

    /// Call a service command on the best available instance.
    pub async fn service_command(
        self: &Arc<Self>,
        service: &str,
        method: &str,
        params: Value,
    ) -> MeshResult<Value> {
        let ctx = CallContext::local(self.id());
        self.service_command_ctx(service, method, params, &ctx).await
    }

    /// Subscribe to the nearest publisher of `topic` within `scope`.
    pub async fn watch_stream(self: &Arc<Self>, topic: &str, scope: Scope) -> MeshResult<Subscription> {
        self.open_watch(topic, scope).await
    }

    /// Serve an inbound link.
    pub fn accept(&self, link: Link) -> Arc<Endpoint> {
        self.spawn_endpoint(link, false)
    }

    /// Serve every link arriving on `listener` until shutdown.
    pub async fn serve_links(self: Arc<Self>, mut listener: mpsc::UnboundedReceiver<Link>) {
        loop {
            tokio::select! {
                link = listener.recv() => match link {
                    Some(link) => {
                        self.accept(link);
                    }
                    None => break,
                },
                _ = self.shutdown_signal() => break,
            }
        }
        debug!("[{}] Link listener stopped", self.id());
    }

    /// Close every link and stop reconnecting.
    pub fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!("[{}] Shutting down", self.id());
        for endpoint in self.peers.all_endpoints() {
            endpoint.close(close_code::GOING_AWAY);
        }
    }

    /// Resolves once [`Node::shutdown`] has been called.
    pub async fn shutdown_signal(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    fn spawn_endpoint(&self, link: Link, dialed: bool) -> Arc<Endpoint> {
        let endpoint = Endpoint::spawn(
            link,
            self.handle.clone(),
            Some(self.handle.clone()),
            self.config.request_timeout(),
        );
        if dialed {
            endpoint.set_peer(PeerInfo::Dialed);
        }
        endpoint
    }

    /// Identity of a consumer connected on `endpoint`.
    fn consumer_identity(&self, endpoint: &Endpoint, user: Option<&AuthResponse>) -> AuthInfo {
        AuthInfo {
            broker: self.id().to_string(),
            endpoint_id: endpoint.id().to_string(),
            user: user.map(UserInfo::from),
        }
    }

    /// Who is behind a command. Node peers may vouch for a consumer they
    /// forward for; identity claims on consumer links are ignored.
    fn call_context(&self, endpoint: &Endpoint, peer: &PeerInfo, cmd: &CmdPacket) -> CallContext {
        let mut ctx = CallContext::local(self.id());
        ctx.caller = match peer {
            PeerInfo::Node(decl) => match &cmd.auth_info {
                Some(info) => Caller::Consumer(info.clone()),
                None => Caller::Node(decl.node_id.clone()),
            },
            PeerInfo::Consumer { user } => {
                Caller::Consumer(self.consumer_identity(endpoint, user.as_ref()))
            }
            PeerInfo::Unknown | PeerInfo::Dialed => Caller::Local,
        };
        ctx.path = cmd.joined_path();
        ctx
    }

    /// Send topology changes to every peer allowed to see them.
    async fn advertise(&self, packets: Vec<TopologyPacket>, exclude: Option<&str>) {
        if packets.is_empty() {
            return;
        }
        for (peer_id, endpoint) in self.peers.live_nodes() {
            if exclude == Some(peer_id.as_str()) {
                continue;
            }
            let batch: Vec<&TopologyPacket> = packets
                .iter()
                .filter(|p| self.topology.advertise_out_check(&p.entry, &peer_id))
                .collect();
            if batch.is_empty() {
                continue;
            }
            let count = batch.len();
            let cmd = CmdPacket::new(verbs::TOPOLOGY_UPDATE, json!(batch)).caller(CallerType::Node);
            match endpoint.send(cmd).await {
                Ok(()) => self.peers.record_topology_sent(count),
                Err(e) => debug!("[{}] Topology to {} not sent: {}", self.id(), peer_id, e),
            }
        }
    }

    /// Apply packets from `source` and pass the changes on.
    async fn apply_topology(&self, packets: Vec<TopologyPacket>, source: &str) -> usize {
        let applied: Vec<TopologyPacket> = packets
            .into_iter()
            .flat_map(|p| self.topology.process_packet(p, source))
            .collect();
        let count = applied.len();
        self.advertise(applied, Some(source)).await;
        count
    }

    fn publish_registry_event(&self, action: &str, node_id: &str, declaration: Option<&NodeDeclaration>) {
        if !self.is_registry() {
            return;
        }
        self.topics.send_to_topic(
            REGISTRY_UPDATE_TOPIC,
            json!({
                "action": action,
                "nodeId": node_id,
                "declaration": declaration,
            }),
        );
    }

    fn endpoint_closed(&self, endpoint: &Endpoint, code: u16) {
        let dropped = self.topics.remove_owner(endpoint.id());
        if dropped > 0 {
            debug!(
                "[{}] Dropped {} subscriptions of {}",
                self.id(),
                dropped,
                endpoint.id()
            );
        }
        self.release_served(endpoint.id());

        let Some(peer) = self.peers.remove_endpoint(endpoint) else {
            return;
        };
        info!("[{}] Node {} disconnected ({})", self.id(), peer, code);
        self.publish_registry_event("unregister", &peer, None);
        if self.is_shutting_down() {
            return;
        }
        let packets = self
            .topology
            .process_node_disconnect(&peer, self.peers.registry_link_count());
        if packets.is_empty() {
            return;
        }
        if let Some(node) = self.handle.0.upgrade() {
            tokio::spawn(async move {
                node.advertise(packets, Some(&peer)).await;
            });
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.config.node_id)
            .field("zone", &self.config.zone)
            .field("roles", &self.config.roles)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::FnService;
    use crate::transport::MemoryNetwork;

    fn node(id: &str, roles: &[Role]) -> Arc<Node> {
        let mut config = NodeConfig::new(id, roles, "z1");
        config.port = Some(8080);
        Node::new(config, Arc::new(MemoryNetwork::new())).unwrap()
    }

    #[tokio::test]
    async fn test_registry_declares_update_stream() {
        let registry = node("r1", &[Role::Registry]);
        assert!(registry.topics().is_declared(REGISTRY_UPDATE_TOPIC));
        let provider = node("p1", &[Role::Provider]);
        assert!(!provider.topics().is_declared(REGISTRY_UPDATE_TOPIC));
    }

    #[tokio::test]
    async fn test_local_service_command() {
        let node = node("p1", &[Role::Provider]);
        let greeter = FnService::builder("Greeter")
            .command("sayHi", |_params, ctx| async move {
                Ok(json!(format!("Hi from {}", ctx.node_id)))
            })
            .build();
        node.add_service(Arc::new(greeter)).await;
        let reply = node.service_command("Greeter", "sayHi", Value::Null).await.unwrap();
        assert_eq!(reply, json!("Hi from p1"));
        assert_eq!(node.topology().list_services()["Greeter"].len(), 1);

        assert!(node.remove_service("Greeter").await);
        assert!(matches!(
            node.service_command("Greeter", "sayHi", Value::Null).await,
            Err(MeshError::ServiceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_stream_rejected() {
        let node = node("p1", &[Role::Provider]);
        node.add_stream("dummy", "test data").await.unwrap();
        assert!(matches!(
            node.add_stream("dummy", "again").await,
            Err(MeshError::DuplicateTopic(_))
        ));
        assert_eq!(node.topology().list_streams()["dummy"].len(), 1);
    }

    #[tokio::test]
    async fn test_local_watch_stream() {
        let node = node("p1", &[Role::Provider]);
        node.add_stream("dummy", "test data").await.unwrap();
        let mut sub = node.watch_stream("dummy", Scope::Local).await.unwrap();
        assert_eq!(node.send_to_topic("dummy", json!({"n": 1})), 1);
        assert_eq!(sub.recv().await, Some(json!({"n": 1})));
        drop(sub);
        assert_eq!(node.topics().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_watch_unknown_topic() {
        let node = node("p1", &[Role::Provider]);
        assert!(matches!(
            node.watch_stream("nothing", Scope::Global).await,
            Err(MeshError::NoSuchTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let node = node("p1", &[Role::Provider]);
        assert!(!node.is_shutting_down());
        node.shutdown();
        node.shutdown_signal().await;
        assert!(node.is_shutting_down());
    }
}
