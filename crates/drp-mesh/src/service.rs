// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Services, client commands and UML classes.
//!
//! A [`Service`] is the unit a Provider hosts: a named set of client commands
//! plus optional [`UmlClass`] record sets. Closure-backed services are built
//! with [`FnService::builder`]:
//!
//! ```rust,no_run
//! use drp_mesh::service::FnService;
//! use serde_json::json;
//!
//! let greeter = FnService::builder("Greeter")
//!     .command("sayHi", |_params, ctx| async move {
//!         Ok(json!({ "pathItem": format!("Hello from {}", ctx.node_id) }))
//!     })
//!     .build();
//! ```

use crate::auth::{AuthInfo, UserInfo};
use crate::error::{MeshError, MeshResult};
use crate::protocol::{NodeId, Scope};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Availability flag advertised for a service instance.
pub const STATUS_AVAILABLE: u8 = 1;

/// Advertised properties of a service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    #[serde(default)]
    pub service_type: String,
    #[serde(default)]
    pub scope: Scope,
    /// Zone override; defaults to the hosting node's zone.
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub sticky: bool,
    #[serde(default = "default_status")]
    pub status: u8,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
}

fn default_priority() -> u32 {
    10
}

fn default_weight() -> u32 {
    10
}

fn default_status() -> u8 {
    STATUS_AVAILABLE
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service_type: String::new(),
            scope: Scope::Global,
            zone: None,
            priority: default_priority(),
            weight: default_weight(),
            sticky: false,
            status: default_status(),
            dependencies: Vec::new(),
            version: None,
        }
    }
}

/// Who is invoking a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Caller {
    /// Code running inside this process.
    Local,
    /// Another mesh node.
    Node(NodeId),
    /// A consumer, connected here or forwarded by the broker named in the
    /// identity.
    Consumer(AuthInfo),
}

impl Caller {
    pub fn user(&self) -> Option<&UserInfo> {
        match self {
            Caller::Consumer(info) => info.user.as_ref(),
            _ => None,
        }
    }
}

/// Per-invocation context handed to command handlers.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Node executing the command.
    pub node_id: NodeId,
    pub caller: Caller,
    /// Command path as the caller addressed it.
    pub path: Option<String>,
}

impl CallContext {
    pub fn local(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            caller: Caller::Local,
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Identity to attach when this call is forwarded to another node.
    pub fn auth_info(&self) -> Option<AuthInfo> {
        match &self.caller {
            Caller::Consumer(info) => Some(info.clone()),
            _ => None,
        }
    }
}

/// What a caller wants to do with a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Read class records.
    Read,
    /// Run a client command.
    Execute,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Operation::Read => "read",
            Operation::Execute => "execute",
        })
    }
}

/// Rights granted to one user or group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub execute: bool,
}

impl Permission {
    pub fn read() -> Self {
        Self { read: true, execute: false }
    }

    pub fn execute() -> Self {
        Self { read: false, execute: true }
    }

    pub fn all() -> Self {
        Self { read: true, execute: true }
    }

    fn grants(&self, op: Operation) -> bool {
        match op {
            Operation::Read => self.read,
            Operation::Execute => self.execute,
        }
    }
}

/// Access list for a service. Services without one are open to every caller.
///
/// Local code always passes. Other nodes and anonymous consumers never do;
/// an authenticated consumer passes on a grant to its user name or to any of
/// its groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionSet {
    #[serde(default)]
    pub users: BTreeMap<String, Permission>,
    #[serde(default)]
    pub groups: BTreeMap<String, Permission>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, name: &str, permission: Permission) -> Self {
        self.users.insert(name.to_string(), permission);
        self
    }

    pub fn group(mut self, name: &str, permission: Permission) -> Self {
        self.groups.insert(name.to_string(), permission);
        self
    }

    pub fn allows(&self, caller: &Caller, op: Operation) -> bool {
        let user = match caller {
            Caller::Local => return true,
            Caller::Node(_) => return false,
            Caller::Consumer(info) => match &info.user {
                Some(user) => user,
                None => return false,
            },
        };
        if self.users.get(&user.user_name).is_some_and(|p| p.grants(op)) {
            return true;
        }
        user.groups
            .iter()
            .filter_map(|g| self.groups.get(g))
            .any(|p| p.grants(op))
    }
}

/// Fail with `Unauthorized` unless `ctx` may perform `op` on `service`.
pub fn authorize(service: &dyn Service, ctx: &CallContext, op: Operation) -> MeshResult<()> {
    match service.permissions() {
        Some(set) if !set.allows(&ctx.caller, op) => {
            Err(MeshError::Unauthorized(format!("{} on {}", op, service.name())))
        }
        _ => Ok(()),
    }
}

/// A hosted service.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn info(&self) -> ServiceInfo {
        ServiceInfo::default()
    }

    /// Client command names, in display order.
    fn list_commands(&self) -> Vec<String>;

    /// Run one client command.
    async fn invoke(&self, method: &str, params: Value, ctx: &CallContext) -> MeshResult<Value>;

    fn classes(&self) -> Vec<Arc<UmlClass>> {
        Vec::new()
    }

    fn permissions(&self) -> Option<PermissionSet> {
        None
    }
}

/// Look up a class by name on a service.
pub fn find_class(service: &dyn Service, name: &str) -> Option<Arc<UmlClass>> {
    service.classes().into_iter().find(|c| c.name() == name)
}

/// Definition document returned by `getServiceDefinition`.
pub fn service_definition(service: &dyn Service, node_id: &str) -> Value {
    let info = service.info();
    let classes: Map<String, Value> = service
        .classes()
        .iter()
        .map(|c| (c.name().to_string(), c.definition()))
        .collect();
    json!({
        "Name": service.name(),
        "Type": info.service_type,
        "NodeID": node_id,
        "Scope": info.scope,
        "Zone": info.zone,
        "Priority": info.priority,
        "Weight": info.weight,
        "Sticky": info.sticky,
        "Status": info.status,
        "Dependencies": info.dependencies,
        "Version": info.version,
        "ClientCmds": service.list_commands(),
        "Classes": classes,
    })
}

/// Boxed async command handler.
pub type CommandFn =
    Arc<dyn Fn(Value, CallContext) -> BoxFuture<'static, MeshResult<Value>> + Send + Sync>;

/// Service whose client commands are closures.
pub struct FnService {
    name: String,
    info: ServiceInfo,
    commands: BTreeMap<String, CommandFn>,
    order: Vec<String>,
    classes: Vec<Arc<UmlClass>>,
    permissions: Option<PermissionSet>,
}

impl FnService {
    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            service: FnService {
                name: name.into(),
                info: ServiceInfo::default(),
                commands: BTreeMap::new(),
                order: Vec::new(),
                classes: Vec::new(),
                permissions: None,
            },
        }
    }
}

/// Builder for [`FnService`].
pub struct ServiceBuilder {
    service: FnService,
}

impl ServiceBuilder {
    /// Register a client command.
    pub fn command<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Value, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MeshResult<Value>> + Send + 'static,
    {
        let boxed: CommandFn = Arc::new(move |params, ctx| Box::pin(handler(params, ctx)));
        if self.service.commands.insert(name.to_string(), boxed).is_none() {
            self.service.order.push(name.to_string());
        }
        self
    }

    pub fn class(mut self, class: UmlClass) -> Self {
        self.service.classes.push(Arc::new(class));
        self
    }

    pub fn info(mut self, info: ServiceInfo) -> Self {
        self.service.info = info;
        self
    }

    pub fn service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service.info.service_type = service_type.into();
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.service.info.scope = scope;
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.service.info.priority = priority;
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.service.info.weight = weight;
        self
    }

    pub fn permissions(mut self, permissions: PermissionSet) -> Self {
        self.service.permissions = Some(permissions);
        self
    }

    pub fn build(self) -> FnService {
        self.service
    }
}

#[async_trait]
impl Service for FnService {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> ServiceInfo {
        self.info.clone()
    }

    fn list_commands(&self) -> Vec<String> {
        self.order.clone()
    }

    async fn invoke(&self, method: &str, params: Value, ctx: &CallContext) -> MeshResult<Value> {
        let handler = self
            .commands
            .get(method)
            .cloned()
            .ok_or_else(|| MeshError::MethodNotFound {
                service: self.name.clone(),
                method: method.to_string(),
            })?;
        handler(params, ctx.clone()).await
    }

    fn classes(&self) -> Vec<Arc<UmlClass>> {
        self.classes.clone()
    }

    fn permissions(&self) -> Option<PermissionSet> {
        self.permissions.clone()
    }
}

/// Key restriction flags on a class attribute ("PK,FK,MK").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyRestriction {
    #[serde(rename = "PK")]
    PrimaryKey,
    #[serde(rename = "FK")]
    ForeignKey,
    #[serde(rename = "MK")]
    MultiKey,
}

/// One class attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UmlAttribute {
    pub name: String,
    #[serde(rename = "Type")]
    pub attr_type: String,
    #[serde(default)]
    pub multiplicity: Option<String>,
    #[serde(default)]
    pub restrictions: Vec<KeyRestriction>,
}

impl UmlAttribute {
    pub fn new(name: &str, attr_type: &str) -> Self {
        Self {
            name: name.to_string(),
            attr_type: attr_type.to_string(),
            multiplicity: None,
            restrictions: Vec::new(),
        }
    }

    pub fn multiplicity(mut self, m: &str) -> Self {
        self.multiplicity = Some(m.to_string());
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.restrictions.push(KeyRestriction::PrimaryKey);
        self
    }

    pub fn foreign_key(mut self) -> Self {
        self.restrictions.push(KeyRestriction::ForeignKey);
        self
    }

    pub fn is_primary_key(&self) -> bool {
        self.restrictions.contains(&KeyRestriction::PrimaryKey)
    }
}

#[derive(Debug, Default)]
struct RecordCache {
    records: BTreeMap<String, Value>,
    loaded: bool,
}

/// Class schema plus its in-memory record set.
///
/// The record set sits behind its own lock so `add_record` can run while
/// other commands read the same class.
#[derive(Debug)]
pub struct UmlClass {
    name: String,
    stereotypes: Vec<String>,
    attributes: Vec<UmlAttribute>,
    primary_key: Option<String>,
    cache: RwLock<RecordCache>,
}

impl UmlClass {
    /// Primary key is taken from the first attribute flagged `PK`.
    pub fn new(name: &str, stereotypes: &[&str], attributes: Vec<UmlAttribute>) -> Self {
        let primary_key = attributes
            .iter()
            .find(|a| a.is_primary_key())
            .map(|a| a.name.clone());
        Self {
            name: name.to_string(),
            stereotypes: stereotypes.iter().map(|s| s.to_string()).collect(),
            attributes,
            primary_key,
            cache: RwLock::new(RecordCache::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_key(&self) -> Option<&str> {
        self.primary_key.as_deref()
    }

    pub fn attributes(&self) -> &[UmlAttribute] {
        &self.attributes
    }

    /// Schema document, attributes in declaration order.
    pub fn definition(&self) -> Value {
        let attributes: Map<String, Value> = self
            .attributes
            .iter()
            .map(|a| {
                (
                    a.name.clone(),
                    serde_json::to_value(a).unwrap_or(Value::Null),
                )
            })
            .collect();
        json!({
            "Name": self.name,
            "Stereotypes": self.stereotypes,
            "Attributes": attributes,
            "PrimaryKey": self.primary_key,
        })
    }

    /// Insert or replace a record, keyed by its primary key.
    pub async fn add_record(&self, record: Value, service_name: &str) -> MeshResult<String> {
        let pk_field = self.primary_key.as_deref().ok_or_else(|| {
            MeshError::InvalidRequest(format!("Class {} has no primary key", self.name))
        })?;
        let Value::Object(mut fields) = record else {
            return Err(MeshError::InvalidRequest(format!(
                "{} record must be an object",
                self.name
            )));
        };
        let key = match fields.get(pk_field) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(MeshError::InvalidRequest(format!(
                    "{} record missing primary key {}",
                    self.name, pk_field
                )))
            }
        };
        fields.insert("_objClass".into(), Value::String(self.name.clone()));
        fields.insert("_serviceName".into(), Value::String(service_name.to_string()));
        fields.insert(
            "_snapTime".into(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );

        self.cache
            .write()
            .await
            .records
            .insert(key.clone(), Value::Object(fields));
        Ok(key)
    }

    pub async fn get_record(&self, key: &str) -> Option<Value> {
        self.cache.read().await.records.get(key).cloned()
    }

    pub async fn record_keys(&self) -> Vec<String> {
        self.cache.read().await.records.keys().cloned().collect()
    }

    /// All records keyed by primary key.
    pub async fn records(&self) -> Map<String, Value> {
        self.cache
            .read()
            .await
            .records
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn record_count(&self) -> usize {
        self.cache.read().await.records.len()
    }

    /// Whether the record set is authoritative.
    pub async fn is_loaded(&self) -> bool {
        self.cache.read().await.loaded
    }

    pub async fn set_loaded(&self, loaded: bool) {
        self.cache.write().await.loaded = loaded;
    }

    pub async fn clear(&self) {
        let mut cache = self.cache.write().await;
        cache.records.clear();
        cache.loaded = false;
    }
}
