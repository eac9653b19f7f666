// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DRP Service Mesh
//!
//! Nodes joined by persistent WebSocket links, with correlated RPC, scoped
//! pub/sub and a replicated topology of nodes, services and streams.
//!
//! # Features
//!
//! - **Endpoints**: token-correlated commands with timeouts and stream handlers
//! - **Command router**: `pathCmd` tree, `serviceCommand`, `getCmds`
//! - **Topics**: local/zone/global scoped streams with bounded subscriber queues
//! - **Topology**: registry replication, advertise rules, service selection
//! - **Relay**: hop-by-hop forwarding with loop detection
//!
//! # Quick Start
//!
//! ```bash
//! # Registry on port 8080
//! drp-node --node-id reg1 --roles Registry,Broker --port 8080
//!
//! # Provider joining it
//! drp-node --node-id prov1 --roles Provider --registry ws://localhost:8080/ --demo
//!
//! # Call the demo service through the broker
//! drp-client --url ws://localhost:8080/ cmd Greeter sayHi
//! ```
//!
//! # Configuration File
//!
//! ```toml
//! node_id = "prov1"
//! roles = ["Provider"]
//! zone = "west"
//! mesh_key = "s3cret"
//! registry_urls = ["ws://registry-1:8080/"]
//! ```

pub mod auth;
pub mod config;
pub mod consumer;
pub mod endpoint;
pub mod error;
pub mod node;
pub mod protocol;
pub mod router;
pub mod server;
pub mod service;
pub mod subscription;
pub mod topic;
pub mod topology;
pub mod transport;

pub use auth::{
    AuthInfo, AuthRequest, AuthResponse, Authenticator, AuthenticatorService, StaticAuthenticator,
    UserInfo,
};
pub use config::{ConfigError, NodeConfig, ReconnectPolicy};
pub use consumer::Consumer;
pub use endpoint::{Endpoint, PeerInfo, StreamEvent};
pub use error::{ErrorKind, MeshError, MeshResult};
pub use node::{ConnectionState, MeshConnection, Node};
pub use protocol::{CmdPacket, NodeDeclaration, NodeId, Role, Scope};
pub use server::{NodeServer, ServerError};
pub use service::{
    CallContext, Caller, FnService, Permission, PermissionSet, Service, ServiceInfo, UmlAttribute,
    UmlClass,
};
pub use subscription::Subscription;
pub use topic::TopicManager;
pub use topology::{TopologySnapshot, TopologyTracker};
pub use transport::{Connector, Link, MemoryNetwork, WsConnector};
