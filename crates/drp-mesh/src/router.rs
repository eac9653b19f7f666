// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Command path resolution.
//!
//! The path tree of a node:
//!
//! ```text
//! NodeID
//! NodeURL
//! Services/<svc>/Info
//!               /ClientCmds/<cmd>
//!               /Classes/<cls>/Definition
//!                             /Records/<pk>/...
//! Streams/<topic>
//! Endpoints/Nodes/<nodeId>/...     (forwarded to that peer)
//!          /Consumers
//! Mesh/Topology
//!     /Streams
//!     /Services/<svc>/...          (forwarded to the best provider)
//!     /Providers/<nodeId>/...      (forwarded to that node)
//! ```
//!
//! Once a JSON value is reached, remaining segments index into it.

use crate::error::{ErrorKind, MeshError, MeshResult};
use crate::protocol::{verbs, NodeId, PathItem, Role, NODE_SERVICE};
use crate::service::{authorize, find_class, service_definition, CallContext, Operation, Service};
use crate::topic::TopicManager;
use crate::topology::{ServiceTableEntry, TopologyTracker};
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Connected endpoints, as seen by the `Endpoints` branch.
pub trait EndpointDirectory: Send + Sync {
    /// Directly connected nodes with a summary value each.
    fn node_endpoints(&self) -> BTreeMap<NodeId, Value>;
    /// Connected consumers with a summary value each.
    fn consumer_endpoints(&self) -> BTreeMap<String, Value>;
}

/// Directory with no connections, for routers used outside a node.
pub struct NoEndpoints;

impl EndpointDirectory for NoEndpoints {
    fn node_endpoints(&self) -> BTreeMap<NodeId, Value> {
        BTreeMap::new()
    }

    fn consumer_endpoints(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }
}

/// Where a path ended up.
pub enum Resolved {
    Listing(Vec<PathItem>),
    Value(Value),
    Command {
        service: Arc<dyn Service>,
        method: String,
    },
    /// Continue on another node with this path.
    Remote { node_id: NodeId, path: Vec<String> },
}

/// Result of a local `pathCmd`.
#[derive(Debug)]
pub enum PathOutcome {
    Done(Value),
    Forward { node_id: NodeId, path: Vec<String> },
}

/// Where a service call should go.
pub enum ServiceRoute {
    Local(Arc<dyn Service>),
    Remote(ServiceTableEntry),
}

/// Resolves paths and service commands against one node's state.
pub struct CommandRouter {
    node_id: NodeId,
    node_url: Option<String>,
    services: RwLock<BTreeMap<String, Arc<dyn Service>>>,
    topics: Arc<TopicManager>,
    topology: Arc<TopologyTracker>,
}

impl CommandRouter {
    pub fn new(
        node_id: impl Into<NodeId>,
        node_url: Option<String>,
        topics: Arc<TopicManager>,
        topology: Arc<TopologyTracker>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_url,
            services: RwLock::new(BTreeMap::new()),
            topics,
            topology,
        }
    }

    /// Register a service, replacing any previous one with the same name.
    pub fn add_service(&self, service: Arc<dyn Service>) -> Option<Arc<dyn Service>> {
        let name = service.name().to_string();
        debug!("[{}] Service {} registered", self.node_id, name);
        self.services
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name, service)
    }

    pub fn remove_service(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name)
    }

    pub fn service(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
    }

    pub fn services(&self) -> Vec<Arc<dyn Service>> {
        self.services
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Local service first, then the best mesh instance.
    pub fn route_service(&self, name: &str) -> MeshResult<ServiceRoute> {
        if let Some(service) = self.service(name) {
            return Ok(ServiceRoute::Local(service));
        }
        self.topology
            .find_instance_of_service(name)
            .filter(|s| s.node_id != self.node_id)
            .map(ServiceRoute::Remote)
            .ok_or_else(|| MeshError::ServiceNotFound(name.to_string()))
    }

    /// Run a command on a local service.
    pub async fn invoke_local(
        &self,
        service: &Arc<dyn Service>,
        method: &str,
        params: Value,
        ctx: &CallContext,
    ) -> MeshResult<Value> {
        if !service.list_commands().iter().any(|c| c == method) {
            return Err(MeshError::MethodNotFound {
                service: service.name().to_string(),
                method: method.to_string(),
            });
        }
        authorize(service.as_ref(), ctx, Operation::Execute)?;
        let origin = format!("Services/{}/ClientCmds/{}", service.name(), method);
        let outcome = AssertUnwindSafe(service.invoke(method, params, ctx))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(MeshError::Handler(message))) => Err(MeshError::Remote {
                kind: ErrorKind::HandlerFailed,
                message,
                path: Some(origin),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("[{}] Handler {} panicked", self.node_id, origin);
                Err(MeshError::Remote {
                    kind: ErrorKind::HandlerFailed,
                    message: "handler panicked".into(),
                    path: Some(origin),
                })
            }
        }
    }

    /// `serviceCommand` against local services only.
    pub async fn service_command(
        &self,
        service_name: &str,
        method: &str,
        params: Value,
        ctx: &CallContext,
    ) -> MeshResult<Value> {
        let service = self
            .service(service_name)
            .ok_or_else(|| MeshError::ServiceNotFound(service_name.to_string()))?;
        self.invoke_local(&service, method, params, ctx).await
    }

    /// Commands reachable from this node, keyed by service.
    pub fn get_cmds(&self) -> Value {
        let mut out = Map::new();
        out.insert(
            NODE_SERVICE.to_string(),
            json!(verbs::ALL.iter().map(|v| v.to_string()).collect::<Vec<_>>()),
        );
        for (name, instances) in self.topology.list_services() {
            if let Some(first) = instances.into_iter().find(|s| s.status == crate::service::STATUS_AVAILABLE) {
                out.insert(name, json!(first.client_cmds));
            }
        }
        for service in self.services() {
            out.insert(service.name().to_string(), json!(service.list_commands()));
        }
        Value::Object(out)
    }

    /// Definitions of all local services.
    pub fn service_definitions(&self) -> Value {
        let defs: Map<String, Value> = self
            .services()
            .iter()
            .map(|s| (s.name().to_string(), service_definition(s.as_ref(), &self.node_id)))
            .collect();
        Value::Object(defs)
    }

    pub fn service_definition(&self, name: &str) -> MeshResult<Value> {
        self.service(name)
            .map(|s| service_definition(s.as_ref(), &self.node_id))
            .ok_or_else(|| MeshError::ServiceNotFound(name.to_string()))
    }

    /// Records of one class of a local service.
    pub async fn class_records(
        &self,
        service_name: &str,
        class_name: &str,
        ctx: &CallContext,
    ) -> MeshResult<Value> {
        let service = self
            .service(service_name)
            .ok_or_else(|| MeshError::ServiceNotFound(service_name.to_string()))?;
        authorize(service.as_ref(), ctx, Operation::Read)?;
        let class = find_class(service.as_ref(), class_name).ok_or_else(|| {
            MeshError::PathNotFound {
                path: format!("Services/{}/Classes/{}", service_name, class_name),
            }
        })?;
        Ok(Value::Object(class.records().await))
    }

    /// Resolve and, unless `list_only`, execute a path locally.
    pub async fn path_cmd(
        &self,
        path: &[String],
        list_only: bool,
        params: Value,
        ctx: &CallContext,
        dir: &dyn EndpointDirectory,
    ) -> MeshResult<PathOutcome> {
        let resolved = self.resolve(path, ctx, dir).await?;
        let value = match resolved {
            Resolved::Listing(items) => json!({ "pathItemList": items }),
            Resolved::Value(value) if list_only => json!({ "pathItemList": children_of(&value) }),
            Resolved::Value(value) => json!({ "pathItem": value }),
            Resolved::Command { .. } if list_only => json!({ "pathItemList": [] }),
            Resolved::Command { service, method } => {
                self.invoke_local(&service, &method, params, ctx).await?
            }
            Resolved::Remote { node_id, path } => {
                return Ok(PathOutcome::Forward { node_id, path })
            }
        };
        Ok(PathOutcome::Done(value))
    }

    /// Walk a path without executing anything.
    pub async fn resolve(
        &self,
        path: &[String],
        ctx: &CallContext,
        dir: &dyn EndpointDirectory,
    ) -> MeshResult<Resolved> {
        let mut path = path;
        // Mesh/Providers/<self>/... is just a local path
        while path.len() >= 3 && path[0] == "Mesh" && path[1] == "Providers" && path[2] == self.node_id {
            path = &path[3..];
        }
        let segs: Vec<&str> = path.iter().map(String::as_str).collect();
        let missing = |depth: usize| MeshError::PathNotFound {
            path: segs[..=depth.min(segs.len().saturating_sub(1))].join("/"),
        };

        match segs.as_slice() {
            [] => Ok(Resolved::Listing(vec![
                PathItem::new("NodeID", "String", json!(self.node_id)),
                PathItem::new("NodeURL", "String", json!(self.node_url)),
                PathItem::new("Services", "Branch", Value::Null),
                PathItem::new("Streams", "Branch", Value::Null),
                PathItem::new("Endpoints", "Branch", Value::Null),
                PathItem::new("Mesh", "Branch", Value::Null),
            ])),
            ["NodeID", rest @ ..] => descend(json!(self.node_id), rest, &segs, 1),
            ["NodeURL", rest @ ..] => descend(json!(self.node_url), rest, &segs, 1),

            ["Services"] => Ok(Resolved::Listing(
                self.service_names()
                    .into_iter()
                    .map(|n| PathItem::new(n, "Service", Value::Null))
                    .collect(),
            )),
            ["Services", name, rest @ ..] => {
                let service = self.service(name).ok_or_else(|| missing(1))?;
                self.resolve_service(service, rest, &segs, 2, ctx).await
            }

            ["Streams"] => Ok(Resolved::Listing(
                self.topics
                    .list_topics()
                    .into_iter()
                    .map(|t| PathItem::new(t, "Stream", Value::Null))
                    .collect(),
            )),
            ["Streams", topic, rest @ ..] => {
                let info = self.topics.topic_info(topic).ok_or_else(|| missing(1))?;
                descend(serde_json::to_value(info)?, rest, &segs, 2)
            }

            ["Endpoints"] => Ok(Resolved::Listing(vec![
                PathItem::new("Nodes", "Branch", Value::Null),
                PathItem::new("Consumers", "Branch", Value::Null),
            ])),
            ["Endpoints", "Nodes"] => Ok(Resolved::Listing(
                dir.node_endpoints()
                    .into_iter()
                    .map(|(id, v)| PathItem::new(id, "Node", v))
                    .collect(),
            )),
            ["Endpoints", "Nodes", node_id, rest @ ..] => {
                if !dir.node_endpoints().contains_key(*node_id) {
                    return Err(missing(2));
                }
                Ok(Resolved::Remote {
                    node_id: node_id.to_string(),
                    path: rest.iter().map(|s| s.to_string()).collect(),
                })
            }
            ["Endpoints", "Consumers", rest @ ..] => {
                let consumers: Map<String, Value> = dir.consumer_endpoints().into_iter().collect();
                descend(Value::Object(consumers), rest, &segs, 2)
            }

            ["Mesh"] => Ok(Resolved::Listing(vec![
                PathItem::new("Topology", "Branch", Value::Null),
                PathItem::new("Streams", "Branch", Value::Null),
                PathItem::new("Services", "Branch", Value::Null),
                PathItem::new("Providers", "Branch", Value::Null),
            ])),
            ["Mesh", "Topology", rest @ ..] => {
                descend(serde_json::to_value(self.topology.snapshot())?, rest, &segs, 2)
            }
            ["Mesh", "Streams", rest @ ..] => {
                descend(serde_json::to_value(self.topology.list_streams())?, rest, &segs, 2)
            }
            ["Mesh", "Services"] => {
                let mut names: Vec<String> = self.topology.list_services().into_keys().collect();
                for local in self.service_names() {
                    if !names.contains(&local) {
                        names.push(local);
                    }
                }
                names.sort();
                Ok(Resolved::Listing(
                    names
                        .into_iter()
                        .map(|n| PathItem::new(n, "Service", Value::Null))
                        .collect(),
                ))
            }
            ["Mesh", "Services", name, rest @ ..] => match self.route_service(name) {
                Ok(ServiceRoute::Local(service)) => {
                    self.resolve_service(service, rest, &segs, 3, ctx).await
                }
                Ok(ServiceRoute::Remote(entry)) => {
                    let mut path = vec!["Services".to_string(), name.to_string()];
                    path.extend(rest.iter().map(|s| s.to_string()));
                    Ok(Resolved::Remote {
                        node_id: entry.node_id,
                        path,
                    })
                }
                Err(_) => Err(missing(2)),
            },
            ["Mesh", "Providers"] => Ok(Resolved::Listing(
                self.topology
                    .nodes()
                    .into_iter()
                    .filter(|n| n.has_role(Role::Provider))
                    .map(|n| PathItem::new(n.node_id.clone(), "Node", json!(n.zone)))
                    .collect(),
            )),
            ["Mesh", "Providers", node_id, rest @ ..] => {
                if !self.topology.has_node(node_id) {
                    return Err(missing(2));
                }
                Ok(Resolved::Remote {
                    node_id: node_id.to_string(),
                    path: rest.iter().map(|s| s.to_string()).collect(),
                })
            }

            ["Endpoints", ..] | ["Mesh", ..] => Err(missing(1)),
            _ => Err(missing(0)),
        }
    }

    async fn resolve_service(
        &self,
        service: Arc<dyn Service>,
        rest: &[&str],
        segs: &[&str],
        depth: usize,
        ctx: &CallContext,
    ) -> MeshResult<Resolved> {
        let missing = |offset: usize| MeshError::PathNotFound {
            path: segs[..=depth + offset].join("/"),
        };
        match rest {
            [] => Ok(Resolved::Listing(vec![
                PathItem::new("Info", "Branch", Value::Null),
                PathItem::new("ClientCmds", "Branch", Value::Null),
                PathItem::new("Classes", "Branch", Value::Null),
            ])),
            ["Info", more @ ..] => descend(
                service_definition(service.as_ref(), &self.node_id),
                more,
                segs,
                depth + 1,
            ),
            ["ClientCmds"] => Ok(Resolved::Listing(
                service
                    .list_commands()
                    .into_iter()
                    .map(|c| PathItem::new(c, "Command", Value::Null))
                    .collect(),
            )),
            ["ClientCmds", cmd] => {
                if !service.list_commands().iter().any(|c| c == cmd) {
                    return Err(missing(1));
                }
                Ok(Resolved::Command {
                    method: cmd.to_string(),
                    service,
                })
            }
            ["ClientCmds", _, _, ..] => Err(missing(2)),
            ["Classes"] => Ok(Resolved::Listing(
                service
                    .classes()
                    .iter()
                    .map(|c| PathItem::new(c.name(), "Class", Value::Null))
                    .collect(),
            )),
            ["Classes", class_name, more @ ..] => {
                let class = find_class(service.as_ref(), class_name).ok_or_else(|| missing(1))?;
                match more {
                    [] => Ok(Resolved::Listing(vec![
                        PathItem::new("Definition", "Branch", Value::Null),
                        PathItem::new("Records", "Branch", json!(class.record_count().await)),
                    ])),
                    ["Definition", tail @ ..] => descend(class.definition(), tail, segs, depth + 3),
                    ["Records", tail @ ..] => {
                        authorize(service.as_ref(), ctx, Operation::Read)?;
                        descend(Value::Object(class.records().await), tail, segs, depth + 3)
                    }
                    _ => Err(missing(2)),
                }
            }
            _ => Err(missing(0)),
        }
    }
}

/// Index into a JSON value; `consumed` is how many path segments led here.
fn descend(value: Value, rest: &[&str], segs: &[&str], consumed: usize) -> MeshResult<Resolved> {
    let mut current = value;
    for (i, seg) in rest.iter().enumerate() {
        let next = match &mut current {
            Value::Object(map) => map.remove(*seg),
            Value::Array(items) => seg
                .parse::<usize>()
                .ok()
                .filter(|idx| *idx < items.len())
                .map(|idx| items.swap_remove(idx)),
            _ => None,
        };
        current = next.ok_or_else(|| MeshError::PathNotFound {
            path: segs[..=consumed + i].join("/"),
        })?;
    }
    Ok(Resolved::Value(current))
}

/// `listOnly` view of a JSON value.
fn children_of(value: &Value) -> Vec<PathItem> {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| PathItem::new(k.clone(), json_type(v), scalar_or_null(v)))
            .collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| PathItem::new(i.to_string(), json_type(v), scalar_or_null(v)))
            .collect(),
        _ => Vec::new(),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Boolean",
        Value::Number(_) => "Number",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

fn scalar_or_null(value: &Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) => Value::Null,
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{FnService, UmlAttribute, UmlClass};
    use crate::topology::{StreamTableEntry, TopologyCmd, TopologyEntry, TopologyPacket};
    use crate::protocol::Scope;

    fn p(path: &str) -> Vec<String> {
        path.split('/').filter(|s| !s.is_empty()).map(String::from).collect()
    }

    fn router() -> CommandRouter {
        let topics = Arc::new(TopicManager::new("prov-1", "z1", 8));
        let topology = Arc::new(TopologyTracker::new("prov-1", "z1", &[Role::Provider]));
        let router = CommandRouter::new(
            "prov-1",
            Some("mem://prov-1".into()),
            topics,
            topology,
        );
        let greeter = FnService::builder("Greeter")
            .command("sayHi", |_p, ctx| async move {
                Ok(json!({ "pathItem": format!("Hello from {}", ctx.node_id) }))
            })
            .command("explode", |_p, _c| async move { Err(MeshError::handler("kaboom")) })
            .class(UmlClass::new(
                "Person",
                &[],
                vec![
                    UmlAttribute::new("id", "string").primary_key(),
                    UmlAttribute::new("tags", "string").multiplicity("*"),
                ],
            ))
            .build();
        router.add_service(Arc::new(greeter));
        router
    }

    async fn run(router: &CommandRouter, path: &str, list_only: bool) -> MeshResult<Value> {
        let ctx = CallContext::local("prov-1");
        match router
            .path_cmd(&p(path), list_only, Value::Null, &ctx, &NoEndpoints)
            .await?
        {
            PathOutcome::Done(v) => Ok(v),
            PathOutcome::Forward { node_id, .. } => panic!("unexpected forward to {}", node_id),
        }
    }

    #[tokio::test]
    async fn test_path_cmd_matches_direct_invocation() {
        let router = router();
        let via_path = run(&router, "Services/Greeter/ClientCmds/sayHi", false)
            .await
            .unwrap();
        let ctx = CallContext::local("prov-1");
        let direct = router
            .service_command("Greeter", "sayHi", Value::Null, &ctx)
            .await
            .unwrap();
        assert_eq!(via_path, direct);
        assert_eq!(direct["pathItem"], "Hello from prov-1");
    }

    #[tokio::test]
    async fn test_list_only_does_not_invoke() {
        let router = router();
        let root = run(&router, "", true).await.unwrap();
        let names: Vec<&str> = root["pathItemList"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["Name"].as_str().unwrap())
            .collect();
        assert_eq!(names, ["NodeID", "NodeURL", "Services", "Streams", "Endpoints", "Mesh"]);

        let cmds = run(&router, "Services/Greeter/ClientCmds", true).await.unwrap();
        assert_eq!(cmds["pathItemList"][0]["Name"], "sayHi");
        assert_eq!(cmds["pathItemList"][0]["Type"], "Command");

        let listed = run(&router, "Services/Greeter/ClientCmds/explode", true)
            .await
            .unwrap();
        assert_eq!(listed["pathItemList"], json!([]));
    }

    #[tokio::test]
    async fn test_path_not_found_reports_first_missing_segment() {
        let router = router();
        for (path, missing) in [
            ("Services/Nope/ClientCmds/sayHi", "Services/Nope"),
            ("Services/Greeter/ClientCmds/sayBye", "Services/Greeter/ClientCmds/sayBye"),
            ("Services/Greeter/Bogus", "Services/Greeter/Bogus"),
            ("Bogus/Thing", "Bogus"),
            ("Mesh/Nothing", "Mesh/Nothing"),
            ("Endpoints/Nodes/ghost/Services", "Endpoints/Nodes/ghost"),
        ] {
            match run(&router, path, false).await {
                Err(MeshError::PathNotFound { path: got }) => assert_eq!(got, missing, "{}", path),
                other => panic!("{}: unexpected {:?}", path, other.map(|_| ())),
            }
        }
    }

    #[tokio::test]
    async fn test_service_command_distinguishes_misses() {
        let router = router();
        let ctx = CallContext::local("prov-1");
        assert!(matches!(
            router.service_command("Nope", "sayHi", Value::Null, &ctx).await,
            Err(MeshError::ServiceNotFound(_))
        ));
        assert!(matches!(
            router.service_command("Greeter", "sayBye", Value::Null, &ctx).await,
            Err(MeshError::MethodNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_handler_failure_is_tagged() {
        let router = router();
        let ctx = CallContext::local("prov-1");
        match router.service_command("Greeter", "explode", Value::Null, &ctx).await {
            Err(MeshError::Remote { kind, message, path }) => {
                assert_eq!(kind, ErrorKind::HandlerFailed);
                assert_eq!(message, "kaboom");
                assert_eq!(path.as_deref(), Some("Services/Greeter/ClientCmds/explode"));
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let router = router();
        router.add_service(Arc::new(
            FnService::builder("Fragile")
                .command("crash", |_p, _c| async move {
                    if true {
                        panic!("bug");
                    }
                    Ok(Value::Null)
                })
                .build(),
        ));
        let ctx = CallContext::local("prov-1");
        assert!(matches!(
            router.service_command("Fragile", "crash", Value::Null, &ctx).await,
            Err(MeshError::Remote { kind: ErrorKind::HandlerFailed, .. })
        ));
    }

    #[tokio::test]
    async fn test_class_records_and_json_descent() {
        let router = router();
        let svc = router.service("Greeter").unwrap();
        let class = find_class(svc.as_ref(), "Person").unwrap();
        class
            .add_record(json!({"id": "p1", "tags": ["a", "b"]}), "Greeter")
            .await
            .unwrap();

        let tag = run(&router, "Services/Greeter/Classes/Person/Records/p1/tags/1", false)
            .await
            .unwrap();
        assert_eq!(tag["pathItem"], "b");

        let record = run(&router, "Services/Greeter/Classes/Person/Records/p1", true)
            .await
            .unwrap();
        let names: Vec<&str> = record["pathItemList"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["Name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"_objClass"));

        assert!(matches!(
            run(&router, "Services/Greeter/Classes/Person/Records/p1/tags/9", false).await,
            Err(MeshError::PathNotFound { .. })
        ));

        let ctx = CallContext::local("prov-1");
        let records = router.class_records("Greeter", "Person", &ctx).await.unwrap();
        assert_eq!(records["p1"]["_serviceName"], "Greeter");
    }

    #[tokio::test]
    async fn test_protected_service_checks_caller() {
        use crate::auth::{AuthInfo, UserInfo};
        use crate::service::{Caller, Permission, PermissionSet};

        let router = router();
        router.add_service(Arc::new(
            FnService::builder("Vault")
                .command("open", |_p, _c| async move { Ok(json!("opened")) })
                .class(UmlClass::new("Secret", &[], vec![UmlAttribute::new("id", "string").primary_key()]))
                .permissions(
                    PermissionSet::new()
                        .group("Keyholders", Permission::execute())
                        .user("auditor", Permission::read()),
                )
                .build(),
        ));
        let as_user = |name: &str, groups: &[&str]| {
            let mut ctx = CallContext::local("prov-1");
            ctx.caller = Caller::Consumer(AuthInfo {
                broker: "r1".into(),
                endpoint_id: "ep-1".into(),
                user: Some(UserInfo {
                    user_name: name.into(),
                    full_name: String::new(),
                    groups: groups.iter().map(|g| g.to_string()).collect(),
                }),
            });
            ctx
        };
        let open = p("Services/Vault/ClientCmds/open");
        let records = p("Services/Vault/Classes/Secret/Records");

        let mut node = CallContext::local("prov-1");
        node.caller = Caller::Node("prov-2".into());
        assert!(matches!(
            router.path_cmd(&open, false, Value::Null, &node, &NoEndpoints).await,
            Err(MeshError::Unauthorized(_))
        ));

        let keyholder = as_user("kim", &["Keyholders"]);
        assert!(router.service_command("Vault", "open", Value::Null, &keyholder).await.is_ok());
        assert!(matches!(
            router.path_cmd(&records, false, Value::Null, &keyholder, &NoEndpoints).await,
            Err(MeshError::Unauthorized(_))
        ));

        let auditor = as_user("auditor", &[]);
        assert!(router.path_cmd(&records, false, Value::Null, &auditor, &NoEndpoints).await.is_ok());
        assert!(router.class_records("Vault", "Secret", &auditor).await.is_ok());
        assert!(matches!(
            router.service_command("Vault", "open", Value::Null, &auditor).await,
            Err(MeshError::Unauthorized(_))
        ));

        // descriptive branches stay open
        let listing = p("Services/Vault/ClientCmds");
        assert!(router.path_cmd(&listing, true, Value::Null, &node, &NoEndpoints).await.is_ok());
    }

    #[tokio::test]
    async fn test_get_cmds_reflects_live_services() {
        let router = router();
        let before = router.get_cmds();
        assert!(before.get("Late").is_none());
        assert!(before["DRP"].as_array().unwrap().contains(&json!("pathCmd")));

        router.add_service(Arc::new(
            FnService::builder("Late")
                .command("wave", |_p, _c| async move { Ok(json!("o/")) })
                .build(),
        ));
        assert_eq!(router.get_cmds()["Late"], json!(["wave"]));
        assert!(run(&router, "Services/Late/ClientCmds/wave", false).await.is_ok());
    }

    #[tokio::test]
    async fn test_mesh_branches_forward() {
        let router = router();
        let stream = StreamTableEntry {
            node_id: "far".into(),
            topic: "dummy".into(),
            description: "d".into(),
            scope: Scope::Global,
            zone: "z2".into(),
            learned_from: None,
        };
        router.topology.process_packet(
            TopologyPacket {
                origin_node_id: "far".into(),
                cmd: TopologyCmd::Add,
                entry: TopologyEntry::Stream(stream),
            },
            "far",
        );
        let streams = run(&router, "Mesh/Streams/dummy/0/nodeId", false).await.unwrap();
        assert_eq!(streams["pathItem"], "far");

        let ctx = CallContext::local("prov-1");
        let own = router
            .path_cmd(&p("Mesh/Providers/prov-1/NodeID"), false, Value::Null, &ctx, &NoEndpoints)
            .await
            .unwrap();
        assert!(matches!(own, PathOutcome::Done(v) if v["pathItem"] == "prov-1"));

        let local_svc = router
            .path_cmd(&p("Mesh/Services/Greeter/ClientCmds/sayHi"), false, Value::Null, &ctx, &NoEndpoints)
            .await
            .unwrap();
        assert!(matches!(local_svc, PathOutcome::Done(_)));
    }
}
