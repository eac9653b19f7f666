// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node configuration.
//!
//! Loaded from TOML; every field has a default so a minimal file only needs
//! the roles and registry URL:
//!
//! ```toml
//! roles = ["Provider"]
//! zone = "west"
//! mesh_key = "s3cret"
//! registry_urls = ["ws://registry-1:8080/"]
//! ```

use crate::protocol::{NodeDeclaration, Role, Scope};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid value: {0}")]
    Invalid(String),
}

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Mesh-wide unique identifier
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default = "default_roles")]
    pub roles: Vec<Role>,

    #[serde(default = "default_zone")]
    pub zone: String,

    #[serde(default)]
    pub domain: Option<String>,

    /// Pre-shared mesh admission key
    #[serde(default)]
    pub mesh_key: Option<String>,

    /// Scope advertised for this node's own entry
    #[serde(default)]
    pub scope: Scope,

    #[serde(default = "default_listen_address")]
    pub listen_address: IpAddr,

    /// Listener port; `None` means this node accepts no inbound links
    #[serde(default)]
    pub port: Option<u16>,

    /// URL other nodes use to reach this one
    #[serde(default)]
    pub listening_url: Option<String>,

    #[serde(default = "default_ws_route")]
    pub ws_route: String,

    /// Registries to join, tried in order
    #[serde(default)]
    pub registry_urls: Vec<String>,

    /// Service used to authenticate consumer hellos
    #[serde(default)]
    pub authenticator_service: Option<String>,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_secs: u64,

    #[serde(default = "default_reconnect_step")]
    pub reconnect_step_secs: u64,

    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_secs: u64,

    /// Relay hop limit
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,

    /// Per-subscriber queue depth before payloads are dropped
    #[serde(default = "default_subscriber_queue_depth")]
    pub subscriber_queue_depth: usize,

    #[serde(default = "default_max_consumers")]
    pub max_consumers: usize,

    /// Admit consumers without credentials when no authenticator is set
    #[serde(default = "default_allow_anonymous")]
    pub allow_anonymous_consumers: bool,
}

fn default_allow_anonymous() -> bool {
    true
}

fn default_node_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "node".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

fn default_roles() -> Vec<Role> {
    vec![Role::Provider]
}

fn default_zone() -> String {
    "default".to_string()
}

fn default_listen_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_ws_route() -> String {
    "/".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_reconnect_initial() -> u64 {
    10
}

fn default_reconnect_step() -> u64 {
    10
}

fn default_reconnect_max() -> u64 {
    300
}

fn default_max_hops() -> usize {
    8
}

fn default_subscriber_queue_depth() -> usize {
    256
}

fn default_max_consumers() -> usize {
    1000
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            roles: default_roles(),
            zone: default_zone(),
            domain: None,
            mesh_key: None,
            scope: Scope::Global,
            listen_address: default_listen_address(),
            port: None,
            listening_url: None,
            ws_route: default_ws_route(),
            registry_urls: Vec::new(),
            authenticator_service: None,
            request_timeout_ms: default_request_timeout_ms(),
            reconnect_initial_secs: default_reconnect_initial(),
            reconnect_step_secs: default_reconnect_step(),
            reconnect_max_secs: default_reconnect_max(),
            max_hops: default_max_hops(),
            subscriber_queue_depth: default_subscriber_queue_depth(),
            max_consumers: default_max_consumers(),
            allow_anonymous_consumers: default_allow_anonymous(),
        }
    }
}

impl NodeConfig {
    /// Config with a fixed identity, handy for tests and embedding.
    pub fn new(node_id: impl Into<String>, roles: &[Role], zone: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            roles: roles.to_vec(),
            zone: zone.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial: Duration::from_secs(self.reconnect_initial_secs),
            step: Duration::from_secs(self.reconnect_step_secs),
            max: Duration::from_secs(self.reconnect_max_secs),
        }
    }

    /// What this node announces in `hello`.
    pub fn declaration(&self) -> NodeDeclaration {
        NodeDeclaration {
            node_id: self.node_id.clone(),
            roles: self.roles.clone(),
            zone: self.zone.clone(),
            domain: self.domain.clone(),
            mesh_key: self.mesh_key.clone(),
            node_url: self.listening_url.clone(),
            scope: self.scope,
            instance_id: None,
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid("node_id cannot be empty".into()));
        }
        if self.roles.is_empty() {
            return Err(ConfigError::Invalid("at least one role is required".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_ms cannot be 0".into(),
            ));
        }
        if self.max_hops == 0 {
            return Err(ConfigError::Invalid("max_hops cannot be 0".into()));
        }
        if self.subscriber_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "subscriber_queue_depth cannot be 0".into(),
            ));
        }
        if self.reconnect_max_secs < self.reconnect_initial_secs {
            return Err(ConfigError::Invalid(
                "reconnect_max_secs must be >= reconnect_initial_secs".into(),
            ));
        }
        if self.has_role(Role::Registry) && self.port.is_none() {
            return Err(ConfigError::Invalid(
                "Registry role requires a listener port".into(),
            ));
        }
        if !self.ws_route.starts_with('/') {
            return Err(ConfigError::Invalid("ws_route must start with '/'".into()));
        }
        Ok(())
    }
}

/// Linear reconnect backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub step: Duration,
    pub max: Duration,
}

impl ReconnectPolicy {
    /// Delay before the given retry (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let grown = self.initial.saturating_add(self.step.saturating_mul(attempt));
        grown.min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.roles, vec![Role::Provider]);
        assert_eq!(config.max_hops, 8);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_minimal_toml() {
        let config = NodeConfig::from_toml_str(
            r#"
            node_id = "reg-1"
            roles = ["Registry", "Broker"]
            zone = "west"
            port = 8080
            registry_urls = ["ws://reg-2:8080/"]
            "#,
        )
        .unwrap();
        assert_eq!(config.node_id, "reg-1");
        assert!(config.has_role(Role::Broker));
        assert_eq!(config.port, Some(8080));
        assert_eq!(config.ws_route, "/");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_round_trip() {
        let config = NodeConfig::new("p-1", &[Role::Provider], "east");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml_string().unwrap().as_bytes())
            .unwrap();

        let loaded = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded.node_id, "p-1");
        assert_eq!(loaded.zone, "east");
    }

    #[test]
    fn test_missing_file() {
        let err = NodeConfig::from_file(Path::new("/nonexistent/drp.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let empty_id = NodeConfig {
            node_id: " ".into(),
            ..Default::default()
        };
        assert!(empty_id.validate().is_err());

        let no_roles = NodeConfig {
            roles: vec![],
            ..Default::default()
        };
        assert!(no_roles.validate().is_err());

        let zero_hops = NodeConfig {
            max_hops: 0,
            ..Default::default()
        };
        assert!(zero_hops.validate().is_err());

        let registry_without_port = NodeConfig::new("r", &[Role::Registry], "z");
        assert!(registry_without_port.validate().is_err());

        let backwards_backoff = NodeConfig {
            reconnect_initial_secs: 60,
            reconnect_max_secs: 30,
            ..Default::default()
        };
        assert!(backwards_backoff.validate().is_err());
    }

    #[test]
    fn test_anonymous_consumers_default_on() {
        assert!(NodeConfig::default().allow_anonymous_consumers);
        let parsed: NodeConfig = toml::from_str(
            r#"
            node_id = "b1"
            roles = ["Broker"]
            allow_anonymous_consumers = false
            "#,
        )
        .unwrap();
        assert!(!parsed.allow_anonymous_consumers);
    }

    #[test]
    fn test_linear_backoff() {
        let policy = NodeConfig::default().reconnect_policy();
        assert_eq!(policy.delay(0), Duration::from_secs(10));
        assert_eq!(policy.delay(1), Duration::from_secs(20));
        assert_eq!(policy.delay(5), Duration::from_secs(60));
        assert_eq!(policy.delay(1000), Duration::from_secs(300));
    }

    #[test]
    fn test_declaration_from_config() {
        let mut config = NodeConfig::new("b-1", &[Role::Broker], "z1");
        config.mesh_key = Some("k".into());
        config.listening_url = Some("ws://b-1:8080/".into());
        let decl = config.declaration();
        assert_eq!(decl.node_id, "b-1");
        assert_eq!(decl.mesh_key.as_deref(), Some("k"));
        assert_eq!(decl.node_url.as_deref(), Some("ws://b-1:8080/"));
    }
}
