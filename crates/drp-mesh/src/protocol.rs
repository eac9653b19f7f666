// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mesh wire protocol.
//!
//! Every frame on a link is one JSON-encoded [`Packet`], tagged by `type`:
//!
//! ```json
//! {"type":"cmd","verb":"pathCmd","pathList":["Services"],"payload":{},"token":7}
//! {"type":"reply","token":7,"status":"ok","payload":{"pathItemList":[]}}
//! {"type":"stream","streamToken":3,"status":"data","payload":"tick"}
//! ```
//!
//! Request tokens and stream tokens are separate number spaces. Both are
//! chosen by the side that will receive the traffic, so a peer can never
//! steer a reply or a topic push into someone else's handler.

use crate::error::ErrorPayload;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Node identifier, unique mesh-wide.
pub type NodeId = String;

/// Built-in service name that addresses the node itself.
pub const NODE_SERVICE: &str = "DRP";

/// Well-known topic carrying registry join/leave events.
pub const REGISTRY_UPDATE_TOPIC: &str = "RegistryUpdate";

/// Built-in verbs understood by every node.
pub mod verbs {
    pub const HELLO: &str = "hello";
    pub const GET_CMDS: &str = "getCmds";
    pub const PATH_CMD: &str = "pathCmd";
    pub const SERVICE_COMMAND: &str = "serviceCommand";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const TOPOLOGY_UPDATE: &str = "topologyUpdate";
    pub const GET_REGISTRY: &str = "getRegistry";
    pub const GET_NODE_DECLARATION: &str = "getNodeDeclaration";
    pub const GET_TOPOLOGY: &str = "getTopology";
    pub const LIST_CLIENT_CONNECTIONS: &str = "listClientConnections";
    pub const GET_SERVICE_DEFINITION: &str = "getServiceDefinition";
    pub const GET_SERVICE_DEFINITIONS: &str = "getServiceDefinitions";
    pub const GET_CLASS_RECORDS: &str = "getClassRecords";
    pub const SEND_TO_TOPIC: &str = "sendToTopic";
    pub const GET_TOPIC_COUNTS: &str = "getTopicCounts";
    pub const CONNECT_TO_NODE: &str = "connectToNode";
    pub const PING: &str = "ping";

    /// Verbs listed by `getCmds` under the node service.
    pub const ALL: &[&str] = &[
        HELLO,
        GET_CMDS,
        PATH_CMD,
        SERVICE_COMMAND,
        SUBSCRIBE,
        UNSUBSCRIBE,
        TOPOLOGY_UPDATE,
        GET_REGISTRY,
        GET_NODE_DECLARATION,
        GET_TOPOLOGY,
        LIST_CLIENT_CONNECTIONS,
        GET_SERVICE_DEFINITION,
        GET_SERVICE_DEFINITIONS,
        GET_CLASS_RECORDS,
        SEND_TO_TOPIC,
        GET_TOPIC_COUNTS,
        CONNECT_TO_NODE,
        PING,
    ];
}

/// Close codes used when a link is torn down.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const ABNORMAL: u16 = 1006;
    pub const AUTH_FAILED: u16 = 4001;
    pub const DUPLICATE_NODE: u16 = 4002;
    pub const REDIRECTED: u16 = 4003;
}

/// Correlation id for a request awaiting its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(pub u64);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery id for pushed stream data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamToken(pub u64);

impl fmt::Display for StreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Node roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Registry,
    Broker,
    Provider,
    Consumer,
    Logger,
    Sidecar,
    Relay,
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "registry" => Ok(Role::Registry),
            "broker" => Ok(Role::Broker),
            "provider" => Ok(Role::Provider),
            "consumer" => Ok(Role::Consumer),
            "logger" => Ok(Role::Logger),
            "sidecar" => Ok(Role::Sidecar),
            "relay" => Ok(Role::Relay),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Visibility scope for services, streams and subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Local,
    Zone,
    #[default]
    Global,
}

impl std::str::FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Scope::Local),
            "zone" => Ok(Scope::Zone),
            "global" => Ok(Scope::Global),
            _ => Err(format!("Unknown scope: {}", s)),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scope::Local => "local",
            Scope::Zone => "zone",
            Scope::Global => "global",
        };
        f.write_str(s)
    }
}

/// One frame on a link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    Cmd(CmdPacket),
    Reply(ReplyPacket),
    Stream(StreamPacket),
}

/// Who issued a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerType {
    Node,
    Consumer,
}

/// Relay context carried by commands addressed to a remote node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tgt_node_id: Option<NodeId>,
    #[serde(default)]
    pub route_history: Vec<NodeId>,
}

impl RouteOptions {
    /// Route from `src` to `tgt`, with `src` as the first visited hop.
    pub fn new(src: impl Into<NodeId>, tgt: impl Into<NodeId>) -> Self {
        let src = src.into();
        Self {
            route_history: vec![src.clone()],
            src_node_id: Some(src),
            tgt_node_id: Some(tgt.into()),
        }
    }

    /// Whether the command has already passed through `node_id`.
    pub fn visited(&self, node_id: &str) -> bool {
        self.route_history.iter().any(|n| n == node_id)
    }
}

/// Command envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmdPacket {
    pub verb: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_list: Option<Vec<String>>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Token>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_type: Option<CallerType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_info: Option<crate::auth::AuthInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_options: Option<RouteOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_node_id: Option<NodeId>,
}

impl CmdPacket {
    pub fn new(verb: impl Into<String>, payload: Value) -> Self {
        Self {
            verb: verb.into(),
            service_name: None,
            path_list: None,
            payload,
            token: None,
            caller_type: None,
            auth_info: None,
            route_options: None,
            run_node_id: None,
        }
    }

    pub fn service(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    pub fn path(mut self, path_list: Vec<String>) -> Self {
        self.path_list = Some(path_list);
        self
    }

    pub fn caller(mut self, caller_type: CallerType) -> Self {
        self.caller_type = Some(caller_type);
        self
    }

    /// Consumer identity to carry past this hop.
    pub fn auth(mut self, auth_info: Option<crate::auth::AuthInfo>) -> Self {
        self.auth_info = auth_info;
        self
    }

    pub fn route(mut self, route: RouteOptions) -> Self {
        self.route_options = Some(route);
        self
    }

    /// Path joined with `/`, for error reports.
    pub fn joined_path(&self) -> Option<String> {
        self.path_list.as_ref().map(|p| p.join("/"))
    }

    /// Whether this command targets the node's built-in verbs.
    pub fn is_node_service(&self) -> bool {
        self.service_name
            .as_deref()
            .map(|s| s == NODE_SERVICE)
            .unwrap_or(true)
    }

    /// Final destination, if the command is addressed to a specific node.
    pub fn target_node(&self) -> Option<&str> {
        self.route_options
            .as_ref()
            .and_then(|r| r.tgt_node_id.as_deref())
            .or(self.run_node_id.as_deref())
    }
}

/// Terminal status of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// Reply to a tokened command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPacket {
    pub token: Token,
    pub status: ReplyStatus,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl ReplyPacket {
    pub fn ok(token: Token, payload: Value) -> Self {
        Self {
            token,
            status: ReplyStatus::Ok,
            payload,
            error: None,
        }
    }

    pub fn error(token: Token, error: ErrorPayload) -> Self {
        Self {
            token,
            status: ReplyStatus::Error,
            payload: Value::Null,
            error: Some(error),
        }
    }
}

/// Status of a stream frame. `End` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Data,
    End,
    Error,
}

/// Pushed topic data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamPacket {
    pub stream_token: StreamToken,
    pub status: StreamStatus,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// What a node announces about itself during `hello`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDeclaration {
    pub node_id: NodeId,
    pub roles: Vec<Role>,
    pub zone: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub mesh_key: Option<String>,
    #[serde(default)]
    pub node_url: Option<String>,
    #[serde(default)]
    pub scope: Scope,
    /// Random per process. Tells a second process claiming the same node ID
    /// apart from the same node reached over another path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl NodeDeclaration {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Copy with the mesh key removed, safe to hand to other nodes.
    pub fn redacted(&self) -> Self {
        Self {
            mesh_key: None,
            ..self.clone()
        }
    }
}

/// `hello` parameters. Nodes send a declaration; consumers send credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declaration: Option<NodeDeclaration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<crate::auth::AuthRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// `hello` answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloReply {
    pub declaration: NodeDeclaration,
    /// Registry URLs the caller should use instead of this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redirect: Vec<String>,
    /// Identity granted to an authenticated consumer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<crate::auth::AuthResponse>,
}

/// `pathCmd` payload; the path itself travels in `CmdPacket::path_list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathCmdParams {
    #[serde(default)]
    pub list_only: bool,
    #[serde(default)]
    pub params: Value,
}

/// `serviceCommand` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCommandParams {
    pub service_name: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// `subscribe` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeParams {
    pub topic_name: String,
    #[serde(default = "default_subscribe_scope")]
    pub scope: Scope,
    pub stream_token: StreamToken,
    /// Zone of the original subscriber, used for scoped delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
}

fn default_subscribe_scope() -> Scope {
    Scope::Local
}

/// `unsubscribe` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeParams {
    pub topic_name: String,
    pub stream_token: StreamToken,
}

/// One child of a resolved path in `listOnly` mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PathItem {
    pub name: String,
    #[serde(rename = "Type")]
    pub item_type: String,
    #[serde(default)]
    pub value: Value,
}

impl PathItem {
    pub fn new(name: impl Into<String>, item_type: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            item_type: item_type.into(),
            value,
        }
    }
}

/// Parse a JSON payload into a typed parameter struct.
pub fn parse_params<T: serde::de::DeserializeOwned>(verb: &str, payload: Value) -> crate::error::MeshResult<T> {
    serde_json::from_value(payload)
        .map_err(|e| crate::error::MeshError::InvalidRequest(format!("{}: {}", verb, e)))
}
