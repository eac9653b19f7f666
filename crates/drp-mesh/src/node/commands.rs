// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Built-in verbs of the `DRP` service.

use super::Node;
use crate::endpoint::{Endpoint, PeerInfo};
use crate::error::{MeshError, MeshResult};
use crate::protocol::{
    parse_params, verbs, CallerType, CmdPacket, HelloRequest, PathCmdParams, RouteOptions,
    ServiceCommandParams, SubscribeParams, UnsubscribeParams,
};
use crate::router::{PathOutcome, ServiceRoute};
use crate::service::CallContext;
use crate::topology::TopologyPacket;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceNameParams {
    service_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassRecordsParams {
    service_name: String,
    class_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendToTopicParams {
    topic_name: String,
    #[serde(default)]
    topic_data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectToNodeParams {
    node_url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryParams {
    #[serde(default)]
    node_id: Option<String>,
}

/// Parse a payload that may be omitted entirely.
fn parse_optional<T: Default + serde::de::DeserializeOwned>(verb: &str, payload: Value) -> MeshResult<T> {
    if payload.is_null() {
        Ok(T::default())
    } else {
        parse_params(verb, payload)
    }
}

impl Node {
    /// Entry point for every command arriving on a link.
    pub(super) async fn handle_cmd(
        self: Arc<Self>,
        endpoint: Arc<Endpoint>,
        cmd: CmdPacket,
    ) -> MeshResult<Value> {
        let peer = endpoint.peer();
        if matches!(peer, PeerInfo::Unknown) && cmd.verb != verbs::HELLO && cmd.verb != verbs::PING {
            return Err(MeshError::AuthFailed(format!(
                "{} before hello",
                cmd.verb
            )));
        }
        if let Some(target) = cmd.target_node() {
            if target != self.id() {
                return self.relay_cmd(endpoint, cmd).await;
            }
        }

        let ctx = self.call_context(&endpoint, &peer, &cmd);
        if !cmd.is_node_service() {
            let service = cmd.service_name.clone().unwrap_or_default();
            return self
                .service_command_ctx(&service, &cmd.verb, cmd.payload, &ctx)
                .await;
        }

        let CmdPacket {
            verb,
            path_list,
            payload,
            ..
        } = cmd;
        debug!("[{}] {} from {}", self.id(), verb, endpoint.id());
        match verb.as_str() {
            verbs::HELLO => {
                let request: HelloRequest = parse_optional(&verb, payload)?;
                let reply = self.accept_hello(&endpoint, request).await?;
                Ok(serde_json::to_value(reply)?)
            }
            verbs::GET_CMDS => Ok(self.router.get_cmds()),
            verbs::PATH_CMD => {
                let params: PathCmdParams = parse_optional(&verb, payload)?;
                let path = path_list.unwrap_or_default();
                self.path_cmd_ctx(&path, params.list_only, params.params, &ctx)
                    .await
            }
            verbs::SERVICE_COMMAND => {
                let params: ServiceCommandParams = parse_params(&verb, payload)?;
                self.service_command_ctx(&params.service_name, &params.method, params.params, &ctx)
                    .await
            }
            verbs::SUBSCRIBE => {
                let params: SubscribeParams = parse_params(&verb, payload)?;
                self.serve_subscribe(&endpoint, params, &peer).await
            }
            verbs::UNSUBSCRIBE => {
                let params: UnsubscribeParams = parse_params(&verb, payload)?;
                Ok(self.serve_unsubscribe(&endpoint, &params))
            }
            verbs::TOPOLOGY_UPDATE => {
                let PeerInfo::Node(decl) = peer else {
                    return Err(MeshError::InvalidRequest(
                        "topologyUpdate is only accepted from nodes".into(),
                    ));
                };
                let packets: Vec<TopologyPacket> = parse_params(&verb, payload)?;
                let applied = self.apply_topology(packets, &decl.node_id).await;
                Ok(json!({ "applied": applied }))
            }
            verbs::GET_REGISTRY => {
                let params: RegistryParams = parse_optional(&verb, payload)?;
                let requester = endpoint
                    .peer_node_id()
                    .or(params.node_id)
                    .unwrap_or_default();
                Ok(serde_json::to_value(self.topology.get_registry(&requester))?)
            }
            verbs::GET_NODE_DECLARATION => Ok(serde_json::to_value(self.declaration())?),
            verbs::GET_TOPOLOGY => Ok(serde_json::to_value(self.topology.snapshot())?),
            verbs::LIST_CLIENT_CONNECTIONS => {
                use crate::router::EndpointDirectory;
                Ok(json!({
                    "nodes": self.peers.node_endpoints(),
                    "consumers": self.peers.consumer_endpoints(),
                    "stats": self.peers.stats(),
                }))
            }
            verbs::GET_SERVICE_DEFINITION => {
                let params: ServiceNameParams = parse_params(&verb, payload)?;
                self.router.service_definition(&params.service_name)
            }
            verbs::GET_SERVICE_DEFINITIONS => Ok(self.router.service_definitions()),
            verbs::GET_CLASS_RECORDS => {
                let params: ClassRecordsParams = parse_params(&verb, payload)?;
                self.router
                    .class_records(&params.service_name, &params.class_name, &ctx)
                    .await
            }
            verbs::SEND_TO_TOPIC => {
                let params: SendToTopicParams = parse_params(&verb, payload)?;
                let delivered = self.send_to_topic(&params.topic_name, params.topic_data);
                Ok(json!({ "delivered": delivered }))
            }
            verbs::GET_TOPIC_COUNTS => Ok(serde_json::to_value(self.topics.topic_counts())?),
            verbs::CONNECT_TO_NODE => {
                let params: ConnectToNodeParams = parse_params(&verb, payload)?;
                let endpoint = self.connect_to_node(&params.node_url).await?;
                Ok(json!({ "nodeId": endpoint.peer_node_id() }))
            }
            verbs::PING => Ok(json!("pong")),
            other => Err(MeshError::InvalidRequest(format!("unknown verb {}", other))),
        }
    }

    /// `pathCmd` on behalf of `ctx`, forwarding when the path leaves this node.
    pub(super) async fn path_cmd_ctx(
        self: &Arc<Self>,
        path: &[String],
        list_only: bool,
        params: Value,
        ctx: &CallContext,
    ) -> MeshResult<Value> {
        let forward_params = params.clone();
        match self
            .router
            .path_cmd(path, list_only, params, ctx, &self.peers)
            .await?
        {
            PathOutcome::Done(value) => Ok(value),
            PathOutcome::Forward { node_id, path } => {
                debug!("[{}] pathCmd {} continues on {}", self.id(), path.join("/"), node_id);
                let payload = PathCmdParams {
                    list_only,
                    params: forward_params,
                };
                let cmd = CmdPacket::new(verbs::PATH_CMD, serde_json::to_value(payload)?)
                    .path(path)
                    .auth(ctx.auth_info());
                self.call_node(&node_id, cmd).await
            }
        }
    }

    /// `serviceCommand` on behalf of `ctx`: local service first, then the mesh.
    pub(super) async fn service_command_ctx(
        self: &Arc<Self>,
        service: &str,
        method: &str,
        params: Value,
        ctx: &CallContext,
    ) -> MeshResult<Value> {
        match self.router.route_service(service)? {
            ServiceRoute::Local(local) => self.router.invoke_local(&local, method, params, ctx).await,
            ServiceRoute::Remote(entry) => {
                if !entry.client_cmds.is_empty() && !entry.client_cmds.iter().any(|c| c == method) {
                    return Err(MeshError::MethodNotFound {
                        service: service.to_string(),
                        method: method.to_string(),
                    });
                }
                let payload = ServiceCommandParams {
                    service_name: service.to_string(),
                    method: method.to_string(),
                    params,
                };
                let cmd = CmdPacket::new(verbs::SERVICE_COMMAND, serde_json::to_value(payload)?)
                    .auth(ctx.auth_info());
                self.call_node(&entry.node_id, cmd).await
            }
        }
    }

    /// Send a command to a specific node and wait for the answer.
    pub(super) async fn call_node(self: &Arc<Self>, target: &str, cmd: CmdPacket) -> MeshResult<Value> {
        let endpoint = self.route_to(target).await?;
        let cmd = cmd
            .route(RouteOptions::new(self.id(), target))
            .caller(CallerType::Node);
        endpoint.call(cmd).await
    }
}
