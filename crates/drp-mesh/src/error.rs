// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for mesh operations.
//!
//! [`MeshError`] is what every public operation returns. When an error has to
//! cross a link it is flattened into an [`ErrorPayload`] (kind + message +
//! originating path) and rebuilt on the receiving side, so a caller can still
//! tell a missing service from a missing method after a broker hop.

use crate::config::ConfigError;
use crate::protocol::Token;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors surfaced by endpoints, routers and nodes.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Path not found: {path}")]
    PathNotFound { path: String },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Method not found: {service}.{method}")]
    MethodNotFound { service: String, method: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Topic already declared: {0}")]
    DuplicateTopic(String),

    #[error("No publisher reachable for topic: {0}")]
    NoSuchTopic(String),

    #[error("Remote error [{kind}]: {message}")]
    Remote {
        kind: ErrorKind,
        message: String,
        path: Option<String>,
    },

    #[error("Routing loop detected: {0}")]
    RoutingLoop(String),

    #[error("Node ID already registered in mesh: {0}")]
    DuplicateNodeId(String),

    #[error("Node unreachable: {0}")]
    NodeUnreachable(String),

    #[error("Token {0} already in use")]
    TokenInUse(Token),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Wire-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AuthFailed,
    Unauthorized,
    PathNotFound,
    ServiceNotFound,
    MethodNotFound,
    Timeout,
    ConnectionClosed,
    DuplicateTopic,
    NoSuchTopic,
    RoutingLoop,
    DuplicateNode,
    NodeUnreachable,
    InvalidRequest,
    HandlerFailed,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AuthFailed => "AUTH_FAILED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::PathNotFound => "PATH_NOT_FOUND",
            Self::ServiceNotFound => "SERVICE_NOT_FOUND",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::Timeout => "TIMEOUT",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::DuplicateTopic => "DUPLICATE_TOPIC",
            Self::NoSuchTopic => "NO_SUCH_TOPIC",
            Self::RoutingLoop => "ROUTING_LOOP",
            Self::DuplicateNode => "DUPLICATE_NODE",
            Self::NodeUnreachable => "NODE_UNREACHABLE",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::HandlerFailed => "HANDLER_FAILED",
            Self::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

/// Structured error carried in `reply` and `stream` packets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl MeshError {
    /// Wire kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthFailed(_) => ErrorKind::AuthFailed,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::PathNotFound { .. } => ErrorKind::PathNotFound,
            Self::ServiceNotFound(_) => ErrorKind::ServiceNotFound,
            Self::MethodNotFound { .. } => ErrorKind::MethodNotFound,
            Self::Timeout => ErrorKind::Timeout,
            Self::ConnectionClosed => ErrorKind::ConnectionClosed,
            Self::DuplicateTopic(_) => ErrorKind::DuplicateTopic,
            Self::NoSuchTopic(_) => ErrorKind::NoSuchTopic,
            Self::Remote { kind, .. } => *kind,
            Self::RoutingLoop(_) => ErrorKind::RoutingLoop,
            Self::DuplicateNodeId(_) => ErrorKind::DuplicateNode,
            Self::NodeUnreachable(_) => ErrorKind::NodeUnreachable,
            Self::InvalidRequest(_) | Self::Json(_) => ErrorKind::InvalidRequest,
            Self::Handler(_) => ErrorKind::HandlerFailed,
            Self::TokenInUse(_) | Self::Transport(_) | Self::Config(_) => ErrorKind::Internal,
        }
    }

    /// Flatten into a wire payload, tagging it with the path it was raised at.
    pub fn to_payload(&self, path: Option<&str>) -> ErrorPayload {
        let (message, own_path) = match self {
            Self::PathNotFound { path } => (path.clone(), Some(path.clone())),
            Self::Remote { message, path, .. } => (message.clone(), path.clone()),
            Self::MethodNotFound { service, method } => (format!("{}.{}", service, method), None),
            Self::AuthFailed(s)
            | Self::Unauthorized(s)
            | Self::ServiceNotFound(s)
            | Self::DuplicateTopic(s)
            | Self::NoSuchTopic(s)
            | Self::RoutingLoop(s)
            | Self::DuplicateNodeId(s)
            | Self::NodeUnreachable(s)
            | Self::Handler(s) => (s.clone(), None),
            _ => (self.to_string(), None),
        };
        ErrorPayload {
            kind: self.kind(),
            message,
            path: own_path.or_else(|| path.map(str::to_string)),
        }
    }

    /// Rebuild a typed error from a wire payload.
    ///
    /// Routing kinds come back as their own variants; anything raised inside
    /// a handler stays a [`MeshError::Remote`].
    pub fn from_payload(payload: ErrorPayload) -> Self {
        let ErrorPayload {
            kind,
            message,
            path,
        } = payload;
        match kind {
            ErrorKind::AuthFailed => Self::AuthFailed(message),
            ErrorKind::Unauthorized => Self::Unauthorized(message),
            ErrorKind::PathNotFound => Self::PathNotFound {
                path: path.unwrap_or(message),
            },
            ErrorKind::ServiceNotFound => Self::ServiceNotFound(message),
            ErrorKind::MethodNotFound => {
                let (service, method) = split_method(&message);
                Self::MethodNotFound { service, method }
            }
            ErrorKind::Timeout => Self::Timeout,
            ErrorKind::ConnectionClosed => Self::ConnectionClosed,
            ErrorKind::DuplicateTopic => Self::DuplicateTopic(message),
            ErrorKind::NoSuchTopic => Self::NoSuchTopic(message),
            ErrorKind::RoutingLoop => Self::RoutingLoop(message),
            ErrorKind::DuplicateNode => Self::DuplicateNodeId(message),
            ErrorKind::NodeUnreachable => Self::NodeUnreachable(message),
            kind => Self::Remote {
                kind,
                message,
                path,
            },
        }
    }

    /// Failure inside a command handler.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// Whether a node should stop reconnecting after this error.
    pub fn is_fatal_for_connect(&self) -> bool {
        matches!(self, Self::AuthFailed(_) | Self::DuplicateNodeId(_))
    }
}

/// Split a `service.method` pair; services never contain dots.
fn split_method(message: &str) -> (String, String) {
    match message.split_once('.') {
        Some((service, method)) => (service.to_string(), method.to_string()),
        None => (String::new(), message.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_kinds_survive_the_wire() {
        let err = MeshError::MethodNotFound {
            service: "Greeter".into(),
            method: "sayHo".into(),
        };
        let payload = err.to_payload(None);
        assert_eq!(payload.kind, ErrorKind::MethodNotFound);

        match MeshError::from_payload(payload) {
            MeshError::MethodNotFound { service, method } => {
                assert_eq!(service, "Greeter");
                assert_eq!(method, "sayHo");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_handler_failure_becomes_remote() {
        let err = MeshError::handler("disk full");
        let payload = err.to_payload(Some("Services/Docs/ClientCmds/save"));
        assert_eq!(payload.kind, ErrorKind::HandlerFailed);
        assert_eq!(payload.path.as_deref(), Some("Services/Docs/ClientCmds/save"));

        match MeshError::from_payload(payload) {
            MeshError::Remote {
                kind,
                message,
                path,
            } => {
                assert_eq!(kind, ErrorKind::HandlerFailed);
                assert!(message.contains("disk full"));
                assert_eq!(path.as_deref(), Some("Services/Docs/ClientCmds/save"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_path_not_found_keeps_first_missing_segment() {
        let err = MeshError::PathNotFound {
            path: "Services/Nope".into(),
        };
        let payload = err.to_payload(Some("ignored"));
        assert_eq!(payload.path.as_deref(), Some("Services/Nope"));
        match MeshError::from_payload(payload) {
            MeshError::PathNotFound { path } => assert_eq!(path, "Services/Nope"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unauthorized_survives_the_wire() {
        let payload = MeshError::Unauthorized("execute on Vault".into()).to_payload(None);
        assert_eq!(serde_json::to_value(payload.kind).unwrap(), "UNAUTHORIZED");
        match MeshError::from_payload(payload) {
            MeshError::Unauthorized(message) => assert_eq!(message, "execute on Vault"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_kind_wire_format() {
        let json = serde_json::to_string(&ErrorKind::NoSuchTopic).unwrap();
        assert_eq!(json, "\"NO_SUCH_TOPIC\"");
        assert_eq!(ErrorKind::NoSuchTopic.to_string(), "NO_SUCH_TOPIC");
    }

    #[test]
    fn test_fatal_connect_errors() {
        assert!(MeshError::AuthFailed("bad key".into()).is_fatal_for_connect());
        assert!(MeshError::DuplicateNodeId("n1".into()).is_fatal_for_connect());
        assert!(!MeshError::Timeout.is_fatal_for_connect());
    }
}
