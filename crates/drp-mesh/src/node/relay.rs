// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Command forwarding and stream proxying.
//!
//! A command whose route targets another node is forwarded one hop at a
//! time. Every hop appends itself to the route history; a node that finds
//! itself already listed, or a history at the hop limit, fails the command
//! with [`MeshError::RoutingLoop`].
//!
//! Subscriptions are proxied hop by hop: each node subscribes upstream under
//! its own stream token and pipes frames back to the downstream token.

use super::Node;
use crate::endpoint::{Endpoint, EndpointId, PeerInfo, StreamEvent};
use crate::error::{MeshError, MeshResult};
use crate::protocol::{
    parse_params, verbs, CallerType, CmdPacket, NodeId, RouteOptions, Scope, StreamStatus,
    StreamToken, SubscribeParams, UnsubscribeParams,
};
use crate::subscription::Subscription;
use crate::topic::{SubscriberId, SubscribeOptions};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

/// A stream this node feeds to a downstream peer.
pub(crate) enum ServedStream {
    /// Fed from the local topic manager.
    Local {
        topic: String,
        id: SubscriberId,
        task: AbortHandle,
    },
    /// Fed from an upstream subscription.
    Proxy {
        topic: String,
        upstream: Arc<Endpoint>,
        token: StreamToken,
        target: NodeId,
        task: AbortHandle,
    },
}

impl ServedStream {
    fn release(self, node: &Node) {
        match self {
            ServedStream::Local { topic, id, task } => {
                task.abort();
                node.topics.unsubscribe(&topic, id);
            }
            ServedStream::Proxy {
                topic,
                upstream,
                token,
                target,
                task,
            } => {
                task.abort();
                upstream.delete_stream_handler(token);
                if upstream.is_closed() {
                    return;
                }
                let params = UnsubscribeParams {
                    topic_name: topic,
                    stream_token: token,
                };
                let cmd = CmdPacket::new(verbs::UNSUBSCRIBE, json!(params))
                    .route(RouteOptions::new(node.id(), target))
                    .caller(CallerType::Node);
                tokio::spawn(async move {
                    if let Err(e) = upstream.send(cmd).await {
                        debug!("[{}] Upstream unsubscribe not sent: {}", upstream.id(), e);
                    }
                });
            }
        }
    }
}

impl Node {
    /// Link to use for traffic addressed to `target`.
    ///
    /// Direct peer first, then the peer the target was learned from, then a
    /// fresh dial to the target's advertised URL.
    pub(super) async fn route_to(self: &Arc<Self>, target: &str) -> MeshResult<Arc<Endpoint>> {
        if target == self.id() {
            return Err(MeshError::InvalidRequest(format!(
                "{} cannot route to itself",
                target
            )));
        }
        if let Some(endpoint) = self.peers.node(target) {
            return Ok(endpoint);
        }
        if let Some(hop) = self.topology.next_hop(target) {
            if hop != target {
                if let Some(endpoint) = self.peers.node(&hop) {
                    return Ok(endpoint);
                }
            }
        }
        if let Some(url) = self.topology.node(target).and_then(|n| n.node_url) {
            debug!("[{}] Dialing {} at {}", self.id(), target, url);
            match self.connect_to_node(&url).await {
                Ok(endpoint) if endpoint.peer_node_id().as_deref() == Some(target) => {
                    return Ok(endpoint)
                }
                Ok(endpoint) => {
                    warn!(
                        "[{}] {} answered as {:?}, expected {}",
                        self.id(),
                        url,
                        endpoint.peer_node_id(),
                        target
                    );
                }
                Err(e) => debug!("[{}] Dial to {} failed: {}", self.id(), target, e),
            }
        }
        Err(MeshError::NodeUnreachable(target.to_string()))
    }

    /// Forward a command one hop closer to its target.
    pub(super) async fn relay_cmd(
        self: &Arc<Self>,
        endpoint: Arc<Endpoint>,
        mut cmd: CmdPacket,
    ) -> MeshResult<Value> {
        let target = cmd.target_node().unwrap_or_default().to_string();
        let mut route = cmd.route_options.take().unwrap_or_else(|| RouteOptions {
            src_node_id: endpoint.peer_node_id(),
            tgt_node_id: Some(target.clone()),
            route_history: Vec::new(),
        });
        if route.visited(self.id()) {
            self.peers.record_relay_error();
            warn!(
                "[{}] Loop: {} to {} already passed here ({})",
                self.id(),
                cmd.verb,
                target,
                route.route_history.join(" > ")
            );
            return Err(MeshError::RoutingLoop(format!(
                "{} revisited on the way to {}",
                self.id(),
                target
            )));
        }
        if route.route_history.len() >= self.config.max_hops {
            self.peers.record_relay_error();
            return Err(MeshError::RoutingLoop(format!(
                "hop limit {} reached on the way to {}",
                self.config.max_hops, target
            )));
        }
        route.route_history.push(self.id().to_string());
        if let PeerInfo::Consumer { user } = endpoint.peer() {
            cmd.auth_info = Some(self.consumer_identity(&endpoint, user.as_ref()));
        }

        if cmd.is_node_service() {
            match cmd.verb.as_str() {
                verbs::SUBSCRIBE => {
                    let params: SubscribeParams = parse_params(&cmd.verb, cmd.payload)?;
                    return self.open_upstream(&endpoint, params, &target, route).await;
                }
                verbs::UNSUBSCRIBE => {
                    let params: UnsubscribeParams = parse_params(&cmd.verb, cmd.payload)?;
                    return Ok(self.serve_unsubscribe(&endpoint, &params));
                }
                _ => {}
            }
        }

        let next = match self.route_to(&target).await {
            Ok(next) => next,
            Err(e) => {
                self.peers.record_relay_error();
                return Err(e);
            }
        };
        debug!(
            "[{}] Relaying {} to {} via {}",
            self.id(),
            cmd.verb,
            target,
            next.peer_node_id().unwrap_or_default()
        );
        cmd.route_options = Some(route);
        self.peers.record_relayed();
        next.call(cmd).await
    }

    /// `subscribe` from a peer: serve it locally or proxy it to a publisher.
    pub(super) async fn serve_subscribe(
        self: &Arc<Self>,
        endpoint: &Arc<Endpoint>,
        params: SubscribeParams,
        peer: &PeerInfo,
    ) -> MeshResult<Value> {
        let zone = params.zone.clone().unwrap_or_else(|| match peer {
            PeerInfo::Node(decl) => decl.zone.clone(),
            _ => self.zone().to_string(),
        });
        if self.topics.has_publisher(&params.topic_name) {
            return Ok(self.serve_local_stream(endpoint, params, zone));
        }
        let publisher = self
            .topology
            .find_stream_publishers(&params.topic_name, params.scope, &zone)
            .into_iter()
            .find(|p| p.node_id != self.id())
            .ok_or_else(|| MeshError::NoSuchTopic(params.topic_name.clone()))?;
        let route = RouteOptions::new(self.id(), &publisher.node_id);
        let params = SubscribeParams {
            zone: Some(zone),
            ..params
        };
        self.open_upstream(endpoint, params, &publisher.node_id, route)
            .await
    }

    fn serve_local_stream(
        self: &Arc<Self>,
        endpoint: &Arc<Endpoint>,
        params: SubscribeParams,
        zone: String,
    ) -> Value {
        let topic = params.topic_name;
        let token = params.stream_token;
        let (id, mut rx) = self.topics.subscribe(
            &topic,
            SubscribeOptions {
                owner: Some(endpoint.id().to_string()),
                scope: params.scope,
                zone: Some(zone),
            },
        );
        let key = (endpoint.id().to_string(), token);
        let downstream = endpoint.clone();
        let weak = Arc::downgrade(self);
        let pipe_key = key.clone();
        let task = tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                if downstream
                    .send_stream(token, StreamStatus::Data, value)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            if let Some(node) = weak.upgrade() {
                if let Some((_, served)) = node.served.remove(&pipe_key) {
                    served.release(&node);
                }
            }
        });
        let served = ServedStream::Local {
            topic: topic.clone(),
            id,
            task: task.abort_handle(),
        };
        self.track_served(endpoint, key, served, &task);
        info!(
            "[{}] {} subscribed to {} ({})",
            self.id(),
            endpoint.id(),
            topic,
            params.scope
        );
        json!({ "subscribed": true, "nodeId": self.id(), "topicName": topic })
    }

    /// Subscribe at `target` and pipe its frames to the downstream token.
    pub(super) async fn open_upstream(
        self: &Arc<Self>,
        endpoint: &Arc<Endpoint>,
        params: SubscribeParams,
        target: &str,
        route: RouteOptions,
    ) -> MeshResult<Value> {
        let upstream = self.route_to(target).await?;
        let (up_token, mut up_rx) = upstream.add_stream_handler();
        let request = SubscribeParams {
            topic_name: params.topic_name.clone(),
            scope: params.scope,
            stream_token: up_token,
            zone: params.zone.clone(),
        };
        let cmd = CmdPacket::new(verbs::SUBSCRIBE, serde_json::to_value(&request)?)
            .route(route)
            .caller(CallerType::Node);
        if let Err(e) = upstream.call(cmd).await {
            upstream.delete_stream_handler(up_token);
            return Err(e);
        }

        let down_token = params.stream_token;
        let key = (endpoint.id().to_string(), down_token);
        let downstream = endpoint.clone();
        let weak = Arc::downgrade(self);
        let pipe_key = key.clone();
        let task = tokio::spawn(async move {
            let mut downstream_gone = false;
            while let Some(event) = up_rx.recv().await {
                let sent = match event {
                    StreamEvent::Data(value) => {
                        downstream
                            .send_stream(down_token, StreamStatus::Data, value)
                            .await
                    }
                    StreamEvent::Closed(None) => {
                        let _ = downstream
                            .send_stream(down_token, StreamStatus::End, Value::Null)
                            .await;
                        break;
                    }
                    StreamEvent::Closed(Some(e)) => {
                        let _ = downstream.send_stream_error(down_token, &e).await;
                        break;
                    }
                };
                if sent.is_err() {
                    downstream_gone = true;
                    break;
                }
            }
            if let Some(node) = weak.upgrade() {
                if let Some((_, served)) = node.served.remove(&pipe_key) {
                    if downstream_gone {
                        served.release(&node);
                    }
                }
            }
        });
        let served = ServedStream::Proxy {
            topic: params.topic_name.clone(),
            upstream,
            token: up_token,
            target: target.to_string(),
            task: task.abort_handle(),
        };
        self.track_served(endpoint, key, served, &task);
        debug!(
            "[{}] Proxying {} from {} for {}",
            self.id(),
            params.topic_name,
            target,
            endpoint.id()
        );
        Ok(json!({ "subscribed": true, "nodeId": target, "topicName": params.topic_name }))
    }

    /// `unsubscribe` from a peer. Unknown tokens are not an error.
    pub(super) fn serve_unsubscribe(&self, endpoint: &Endpoint, params: &UnsubscribeParams) -> Value {
        let key = (endpoint.id().to_string(), params.stream_token);
        match self.served.remove(&key) {
            Some((_, served)) => {
                served.release(self);
                json!({ "unsubscribed": true })
            }
            None => json!({ "unsubscribed": false }),
        }
    }

    /// Record a served stream. The downstream may have closed, or the pipe
    /// may have ended, before the entry existed; release it then.
    fn track_served(
        &self,
        endpoint: &Endpoint,
        key: (EndpointId, StreamToken),
        served: ServedStream,
        task: &JoinHandle<()>,
    ) {
        self.served.insert(key.clone(), served);
        if endpoint.is_closed() || task.is_finished() {
            if let Some((_, served)) = self.served.remove(&key) {
                debug!("[{}] {} gone before stream was tracked", self.id(), key.0);
                served.release(self);
            }
        }
    }

    /// Release everything served to a closed endpoint.
    pub(super) fn release_served(&self, endpoint_id: &str) {
        let keys: Vec<(EndpointId, StreamToken)> = self
            .served
            .iter()
            .filter(|e| e.key().0 == endpoint_id)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, served)) = self.served.remove(&key) {
                served.release(self);
            }
        }
    }

    /// In-process subscription for [`Node::watch_stream`].
    pub(super) async fn open_watch(
        self: &Arc<Self>,
        topic: &str,
        scope: Scope,
    ) -> MeshResult<Subscription> {
        if self.topics.has_publisher(topic) {
            let (id, rx) = self.topics.subscribe(
                topic,
                SubscribeOptions {
                    owner: None,
                    scope,
                    zone: None,
                },
            );
            return Ok(Subscription::local(topic, self.topics.clone(), id, rx));
        }
        let publisher = self
            .topology
            .find_stream_publishers(topic, scope, self.zone())
            .into_iter()
            .find(|p| p.node_id != self.id())
            .ok_or_else(|| MeshError::NoSuchTopic(topic.to_string()))?;
        let upstream = self.route_to(&publisher.node_id).await?;
        let (token, rx) = upstream.add_stream_handler();
        let route = RouteOptions::new(self.id(), &publisher.node_id);
        let request = SubscribeParams {
            topic_name: topic.to_string(),
            scope,
            stream_token: token,
            zone: Some(self.zone().to_string()),
        };
        let cmd = CmdPacket::new(verbs::SUBSCRIBE, serde_json::to_value(&request)?)
            .route(route.clone())
            .caller(CallerType::Node);
        if let Err(e) = upstream.call(cmd).await {
            upstream.delete_stream_handler(token);
            return Err(e);
        }
        info!(
            "[{}] Watching {} from {} ({})",
            self.id(),
            topic,
            publisher.node_id,
            scope
        );
        Ok(Subscription::remote(
            topic,
            upstream,
            token,
            Some(route),
            CallerType::Node,
            rx,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::protocol::{close_code, Role};
    use crate::transport::MemoryNetwork;

    #[tokio::test]
    async fn test_subscribe_on_closed_link_is_released() {
        let mut config = NodeConfig::new("p1", &[Role::Provider], "z1");
        config.port = Some(8080);
        let node = Node::new(config, Arc::new(MemoryNetwork::new())).unwrap();
        node.add_stream("dummy", "test data").await.unwrap();

        let (near, _far) = MemoryNetwork::pair("p1", "c1");
        let endpoint = node.accept(near);
        // the close handler runs before the subscribe is tracked
        endpoint.close(close_code::NORMAL);

        let params = SubscribeParams {
            topic_name: "dummy".into(),
            scope: Scope::Local,
            stream_token: StreamToken(7),
            zone: None,
        };
        node.serve_subscribe(&endpoint, params, &PeerInfo::Consumer { user: None })
            .await
            .unwrap();
        assert!(node.served.is_empty());
        assert_eq!(node.topics().topic_subscriber_count("dummy"), 0);
    }
}
