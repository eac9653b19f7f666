// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Consumer side of a broker link.

use crate::auth::{AuthRequest, AuthResponse};
use crate::endpoint::{Endpoint, PeerInfo, RejectCommands};
use crate::error::MeshResult;
use crate::protocol::{
    close_code, verbs, CallerType, CmdPacket, HelloReply, HelloRequest, NodeDeclaration,
    PathCmdParams, Scope, ServiceCommandParams, SubscribeParams,
};
use crate::subscription::Subscription;
use crate::topology::TopologySnapshot;
use crate::transport::Connector;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A client attached to one broker node.
pub struct Consumer {
    endpoint: Arc<Endpoint>,
    broker: NodeDeclaration,
    user: Option<AuthResponse>,
}

impl Consumer {
    /// Dial `url` and say hello as a consumer.
    pub async fn connect(
        connector: &dyn Connector,
        url: &str,
        auth: Option<AuthRequest>,
        timeout: Duration,
    ) -> MeshResult<Self> {
        let link = connector.connect(url).await?;
        let endpoint = Endpoint::spawn(link, Arc::new(RejectCommands), None, timeout);
        endpoint.set_peer(PeerInfo::Dialed);

        let request = HelloRequest {
            declaration: None,
            auth,
            user_agent: Some(format!("drp-consumer/{}", env!("CARGO_PKG_VERSION"))),
        };
        let hello = CmdPacket::new(verbs::HELLO, serde_json::to_value(request)?)
            .caller(CallerType::Consumer);
        let reply = match endpoint.call(hello).await {
            Ok(value) => serde_json::from_value::<HelloReply>(value)?,
            Err(e) => {
                endpoint.close(close_code::AUTH_FAILED);
                return Err(e);
            }
        };
        endpoint.set_peer(PeerInfo::Node(reply.declaration.clone()));
        info!(
            "Consumer {} attached to broker {} at {}",
            endpoint.id(),
            reply.declaration.node_id,
            url
        );
        Ok(Self {
            endpoint,
            broker: reply.declaration,
            user: reply.user,
        })
    }

    pub fn broker(&self) -> &NodeDeclaration {
        &self.broker
    }

    /// Identity granted by the broker's authenticator.
    pub fn user(&self) -> Option<&AuthResponse> {
        self.user.as_ref()
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.endpoint.is_closed()
    }

    /// Send a raw command and wait for its reply.
    pub async fn send_cmd(&self, cmd: CmdPacket) -> MeshResult<Value> {
        self.endpoint.call(cmd.caller(CallerType::Consumer)).await
    }

    pub async fn path_cmd(&self, path: &[&str], list_only: bool, params: Value) -> MeshResult<Value> {
        let payload = PathCmdParams { list_only, params };
        let cmd = CmdPacket::new(verbs::PATH_CMD, serde_json::to_value(payload)?)
            .path(path.iter().map(|s| s.to_string()).collect());
        self.send_cmd(cmd).await
    }

    pub async fn service_command(&self, service: &str, method: &str, params: Value) -> MeshResult<Value> {
        let payload = ServiceCommandParams {
            service_name: service.to_string(),
            method: method.to_string(),
            params,
        };
        let cmd = CmdPacket::new(verbs::SERVICE_COMMAND, serde_json::to_value(payload)?);
        self.send_cmd(cmd).await
    }

    pub async fn get_cmds(&self) -> MeshResult<Value> {
        self.send_cmd(CmdPacket::new(verbs::GET_CMDS, Value::Null)).await
    }

    pub async fn topology(&self) -> MeshResult<TopologySnapshot> {
        let value = self
            .send_cmd(CmdPacket::new(verbs::GET_TOPOLOGY, Value::Null))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Subscribe through the broker, which finds the publisher.
    pub async fn watch_stream(&self, topic: &str, scope: Scope) -> MeshResult<Subscription> {
        let (token, rx) = self.endpoint.add_stream_handler();
        let params = SubscribeParams {
            topic_name: topic.to_string(),
            scope,
            stream_token: token,
            zone: None,
        };
        let cmd = CmdPacket::new(verbs::SUBSCRIBE, serde_json::to_value(params)?);
        if let Err(e) = self.send_cmd(cmd).await {
            self.endpoint.delete_stream_handler(token);
            return Err(e);
        }
        debug!("[{}] Watching {} ({})", self.endpoint.id(), topic, scope);
        Ok(Subscription::remote(
            topic,
            self.endpoint.clone(),
            token,
            None,
            CallerType::Consumer,
            rx,
        ))
    }

    /// Close the link. Outstanding calls fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.endpoint.close(close_code::NORMAL);
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.endpoint.close(close_code::NORMAL);
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("endpoint", &self.endpoint.id())
            .field("broker", &self.broker.node_id)
            .finish_non_exhaustive()
    }
}
