// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Consumer authentication.
//!
//! Any [`Authenticator`] can be published on the mesh through
//! [`AuthenticatorService`]; nodes configured with `authenticator_service`
//! call its `authenticate` command during a consumer `hello`.

use crate::error::{MeshError, MeshResult};
use crate::protocol::NodeId;
use crate::service::{CallContext, Service, ServiceInfo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Command exposed by authenticator services.
pub const AUTHENTICATE: &str = "authenticate";

/// Credentials offered by a consumer.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl std::fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRequest")
            .field("user_name", &self.user_name)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish()
    }
}

impl AuthRequest {
    pub fn password(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_name: Some(user.into()),
            password: Some(password.into()),
            token: None,
        }
    }

    pub fn token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Default::default()
        }
    }

    /// At least one usable credential is present.
    pub fn is_complete(&self) -> bool {
        (self.user_name.is_some() && self.password.is_some()) || self.token.is_some()
    }
}

/// Identity granted after a successful authentication.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthResponse {
    pub user_name: String,
    pub token: String,
    pub full_name: String,
    #[serde(default)]
    pub groups: BTreeSet<String>,
}

impl std::fmt::Debug for AuthResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthResponse")
            .field("user_name", &self.user_name)
            .field("full_name", &self.full_name)
            .field("groups", &self.groups)
            .finish_non_exhaustive()
    }
}

/// Authenticated identity without the session token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserInfo {
    pub user_name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub groups: BTreeSet<String>,
}

impl From<&AuthResponse> for UserInfo {
    fn from(response: &AuthResponse) -> Self {
        Self {
            user_name: response.user_name.clone(),
            full_name: response.full_name.clone(),
            groups: response.groups.clone(),
        }
    }
}

impl UserInfo {
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }
}

/// Consumer identity carried on commands a broker forwards to other nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthInfo {
    /// Node the consumer is connected to.
    pub broker: NodeId,
    /// Consumer connection id on the broker.
    pub endpoint_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
}

impl AuthInfo {
    pub fn user_name(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.user_name.as_str())
    }
}

/// Something that can check consumer credentials.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// `Ok(None)` means the credentials were refused.
    async fn authenticate(&self, request: &AuthRequest) -> MeshResult<Option<AuthResponse>>;
}

/// Publishes an [`Authenticator`] as a mesh service.
pub struct AuthenticatorService {
    name: String,
    info: ServiceInfo,
    inner: Arc<dyn Authenticator>,
}

impl AuthenticatorService {
    pub fn new(name: impl Into<String>, inner: Arc<dyn Authenticator>) -> Self {
        Self {
            name: name.into(),
            info: ServiceInfo {
                service_type: "Authenticator".into(),
                ..Default::default()
            },
            inner,
        }
    }

    pub fn with_info(mut self, info: ServiceInfo) -> Self {
        self.info = info;
        self
    }
}

#[async_trait]
impl Service for AuthenticatorService {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> ServiceInfo {
        self.info.clone()
    }

    fn list_commands(&self) -> Vec<String> {
        vec![AUTHENTICATE.to_string()]
    }

    async fn invoke(&self, method: &str, params: Value, _ctx: &CallContext) -> MeshResult<Value> {
        if method != AUTHENTICATE {
            return Err(MeshError::MethodNotFound {
                service: self.name.clone(),
                method: method.to_string(),
            });
        }
        let request: AuthRequest = crate::protocol::parse_params(AUTHENTICATE, params)?;
        let response = self.inner.authenticate(&request).await?;
        Ok(serde_json::to_value(response)?)
    }
}

/// Accepts fixed user/password pairs and issued tokens. Used by the demo node.
#[derive(Default)]
pub struct StaticAuthenticator {
    users: std::collections::HashMap<String, (String, AuthResponse)>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(
        mut self,
        user: &str,
        password: &str,
        full_name: &str,
        groups: &[&str],
    ) -> Self {
        let response = AuthResponse {
            user_name: user.to_string(),
            token: uuid::Uuid::new_v4().simple().to_string(),
            full_name: full_name.to_string(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
        };
        self.users
            .insert(user.to_string(), (password.to_string(), response));
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, request: &AuthRequest) -> MeshResult<Option<AuthResponse>> {
        if let (Some(user), Some(password)) = (&request.user_name, &request.password) {
            return Ok(self
                .users
                .get(user)
                .filter(|(expected, _)| expected == password)
                .map(|(_, response)| response.clone()));
        }
        if let Some(token) = &request.token {
            return Ok(self
                .users
                .values()
                .find(|(_, response)| &response.token == token)
                .map(|(_, response)| response.clone()));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn authenticator() -> StaticAuthenticator {
        StaticAuthenticator::new().with_user("alice", "pw", "Alice Liddell", &["Users", "Admins"])
    }

    #[tokio::test]
    async fn test_password_login() {
        let auth = authenticator();
        let ok = auth
            .authenticate(&AuthRequest::password("alice", "pw"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ok.full_name, "Alice Liddell");
        assert!(ok.groups.contains("Admins"));

        let refused = auth
            .authenticate(&AuthRequest::password("alice", "nope"))
            .await
            .unwrap();
        assert!(refused.is_none());
    }

    #[tokio::test]
    async fn test_token_login_reuses_issued_token() {
        let auth = authenticator();
        let first = auth
            .authenticate(&AuthRequest::password("alice", "pw"))
            .await
            .unwrap()
            .unwrap();
        let again = auth
            .authenticate(&AuthRequest::token(first.token.clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.user_name, "alice");
    }

    #[tokio::test]
    async fn test_service_wrapper() {
        let svc = AuthenticatorService::new("TestAuthenticator", Arc::new(authenticator()));
        assert_eq!(svc.list_commands(), vec!["authenticate".to_string()]);

        let ctx = CallContext::local("node-a");
        let reply = svc
            .invoke(AUTHENTICATE, json!({"UserName": "alice", "Password": "pw"}), &ctx)
            .await
            .unwrap();
        assert_eq!(reply["UserName"], "alice");

        let refused = svc
            .invoke(AUTHENTICATE, json!({"Token": "bogus"}), &ctx)
            .await
            .unwrap();
        assert!(refused.is_null());

        assert!(matches!(
            svc.invoke("logout", Value::Null, &ctx).await,
            Err(MeshError::MethodNotFound { .. })
        ));
    }

    #[test]
    fn test_forwarded_identity_drops_token() {
        let response = AuthResponse {
            user_name: "alice".into(),
            token: "secret".into(),
            full_name: "Alice Liddell".into(),
            groups: ["Users".to_string()].into_iter().collect(),
        };
        let info = AuthInfo {
            broker: "r1".into(),
            endpoint_id: "ep-1".into(),
            user: Some(UserInfo::from(&response)),
        };
        let wire = serde_json::to_value(&info).unwrap();
        assert_eq!(wire["broker"], "r1");
        assert_eq!(wire["user"]["UserName"], "alice");
        assert!(!wire.to_string().contains("secret"));
        assert!(info.user.as_ref().unwrap().in_group("Users"));
        assert_eq!(info.user_name(), Some("alice"));
    }

    #[test]
    fn test_request_completeness() {
        assert!(AuthRequest::password("a", "b").is_complete());
        assert!(AuthRequest::token("t").is_complete());
        assert!(!AuthRequest {
            user_name: Some("a".into()),
            ..Default::default()
        }
        .is_complete());
    }
}
