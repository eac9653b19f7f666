// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mesh topology tables.
//!
//! Every node keeps three tables (nodes, services, streams). Entries carry
//! the peer they were learned from; that is what makes next-hop routing,
//! delete authority and advertise filtering possible without a global view.
//!
//! Rules:
//! - an indirect add never replaces an entry learned from its own node
//! - a delete is honoured only from the peer the entry was learned from
//! - deleting a node cascades to its services, its streams and every node
//!   learned through it

use crate::protocol::{NodeDeclaration, NodeId, Role, Scope};
use crate::service::ServiceInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// One known node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTableEntry {
    pub node_id: NodeId,
    #[serde(default)]
    pub proxy_node_id: Option<NodeId>,
    pub roles: Vec<Role>,
    #[serde(default)]
    pub node_url: Option<String>,
    #[serde(default)]
    pub scope: Scope,
    pub zone: String,
    #[serde(default)]
    pub learned_from: Option<NodeId>,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl NodeTableEntry {
    pub fn from_declaration(decl: &NodeDeclaration) -> Self {
        Self {
            node_id: decl.node_id.clone(),
            proxy_node_id: None,
            roles: decl.roles.clone(),
            node_url: decl.node_url.clone(),
            scope: decl.scope,
            zone: decl.zone.clone(),
            learned_from: None,
            last_seen: Utc::now(),
            instance_id: decl.instance_id.clone(),
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

/// One service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTableEntry {
    pub instance_id: String,
    pub node_id: NodeId,
    #[serde(default)]
    pub proxy_node_id: Option<NodeId>,
    pub name: String,
    #[serde(default)]
    pub service_type: String,
    #[serde(default)]
    pub sticky: bool,
    pub priority: u32,
    pub weight: u32,
    #[serde(default)]
    pub scope: Scope,
    pub zone: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub status: u8,
    #[serde(default)]
    pub client_cmds: Vec<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub learned_from: Option<NodeId>,
}

impl ServiceTableEntry {
    /// Entry for a service hosted on `node_id`.
    pub fn hosted(
        node_id: &str,
        zone: &str,
        name: &str,
        info: &ServiceInfo,
        client_cmds: Vec<String>,
        classes: Vec<String>,
    ) -> Self {
        Self {
            instance_id: format!("{}-{}", node_id, name),
            node_id: node_id.to_string(),
            proxy_node_id: None,
            name: name.to_string(),
            service_type: info.service_type.clone(),
            sticky: info.sticky,
            priority: info.priority,
            weight: info.weight,
            scope: info.scope,
            zone: info.zone.clone().unwrap_or_else(|| zone.to_string()),
            dependencies: info.dependencies.clone(),
            status: info.status,
            client_cmds,
            classes,
            learned_from: None,
        }
    }
}

/// One published stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamTableEntry {
    pub node_id: NodeId,
    pub topic: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scope: Scope,
    pub zone: String,
    #[serde(default)]
    pub learned_from: Option<NodeId>,
}

/// Any table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "entry", rename_all = "lowercase")]
pub enum TopologyEntry {
    Node(NodeTableEntry),
    Service(ServiceTableEntry),
    Stream(StreamTableEntry),
}

impl TopologyEntry {
    pub fn node_id(&self) -> &str {
        match self {
            Self::Node(e) => &e.node_id,
            Self::Service(e) => &e.node_id,
            Self::Stream(e) => &e.node_id,
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            Self::Node(e) => e.scope,
            Self::Service(e) => e.scope,
            Self::Stream(e) => e.scope,
        }
    }

    pub fn zone(&self) -> &str {
        match self {
            Self::Node(e) => &e.zone,
            Self::Service(e) => &e.zone,
            Self::Stream(e) => &e.zone,
        }
    }

    pub fn learned_from(&self) -> Option<&str> {
        match self {
            Self::Node(e) => e.learned_from.as_deref(),
            Self::Service(e) => e.learned_from.as_deref(),
            Self::Stream(e) => e.learned_from.as_deref(),
        }
    }

    fn set_learned_from(&mut self, source: Option<NodeId>) {
        match self {
            Self::Node(e) => e.learned_from = source,
            Self::Service(e) => e.learned_from = source,
            Self::Stream(e) => e.learned_from = source,
        }
    }

    /// Learned from the node it describes.
    fn is_direct(&self) -> bool {
        self.learned_from().map(|l| l == self.node_id()).unwrap_or(true)
    }
}

/// Table operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyCmd {
    Add,
    Update,
    Delete,
}

/// Unit of topology exchange, carried by `topologyUpdate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyPacket {
    pub origin_node_id: NodeId,
    pub cmd: TopologyCmd,
    #[serde(flatten)]
    pub entry: TopologyEntry,
}

/// Full table dump, returned by `getTopology`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologySnapshot {
    pub nodes: Vec<NodeTableEntry>,
    pub services: Vec<ServiceTableEntry>,
    pub streams: Vec<StreamTableEntry>,
}

/// How a node is reached from here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "via")]
pub enum Reachability {
    Local,
    Direct,
    ViaRelay(NodeId),
}

#[derive(Default)]
struct Tables {
    nodes: HashMap<NodeId, NodeTableEntry>,
    /// instance_id -> entry
    services: HashMap<String, ServiceTableEntry>,
    /// (node_id, topic) -> entry
    streams: HashMap<(NodeId, String), StreamTableEntry>,
}

impl Tables {
    fn get(&self, entry: &TopologyEntry) -> Option<TopologyEntry> {
        match entry {
            TopologyEntry::Node(e) => self.nodes.get(&e.node_id).cloned().map(TopologyEntry::Node),
            TopologyEntry::Service(e) => self
                .services
                .get(&e.instance_id)
                .cloned()
                .map(TopologyEntry::Service),
            TopologyEntry::Stream(e) => self
                .streams
                .get(&(e.node_id.clone(), e.topic.clone()))
                .cloned()
                .map(TopologyEntry::Stream),
        }
    }

    fn put(&mut self, entry: TopologyEntry) {
        match entry {
            TopologyEntry::Node(e) => {
                self.nodes.insert(e.node_id.clone(), e);
            }
            TopologyEntry::Service(e) => {
                self.services.insert(e.instance_id.clone(), e);
            }
            TopologyEntry::Stream(e) => {
                self.streams.insert((e.node_id.clone(), e.topic.clone()), e);
            }
        }
    }

    fn remove(&mut self, entry: &TopologyEntry) -> bool {
        match entry {
            TopologyEntry::Node(e) => self.nodes.remove(&e.node_id).is_some(),
            TopologyEntry::Service(e) => self.services.remove(&e.instance_id).is_some(),
            TopologyEntry::Stream(e) => self
                .streams
                .remove(&(e.node_id.clone(), e.topic.clone()))
                .is_some(),
        }
    }

    /// Remove a node with everything hanging off it. Returns removed rows.
    fn remove_node_cascade(&mut self, node_id: &str) -> Vec<TopologyEntry> {
        let mut removed = Vec::new();
        let mut queue = vec![node_id.to_string()];
        let mut seen = HashSet::new();
        while let Some(id) = queue.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.remove(&id) {
                removed.push(TopologyEntry::Node(node));
            }
            let services: Vec<String> = self
                .services
                .values()
                .filter(|s| s.node_id == id)
                .map(|s| s.instance_id.clone())
                .collect();
            for key in services {
                if let Some(s) = self.services.remove(&key) {
                    removed.push(TopologyEntry::Service(s));
                }
            }
            let streams: Vec<(NodeId, String)> = self
                .streams
                .keys()
                .filter(|(n, _)| *n == id)
                .cloned()
                .collect();
            for key in streams {
                if let Some(s) = self.streams.remove(&key) {
                    removed.push(TopologyEntry::Stream(s));
                }
            }
            queue.extend(
                self.nodes
                    .values()
                    .filter(|n| n.learned_from.as_deref() == Some(id.as_str()))
                    .map(|n| n.node_id.clone()),
            );
        }
        removed
    }
}

/// Topology view of one node.
pub struct TopologyTracker {
    node_id: NodeId,
    zone: String,
    roles: Vec<Role>,
    tables: RwLock<Tables>,
}

impl TopologyTracker {
    pub fn new(node_id: impl Into<NodeId>, zone: impl Into<String>, roles: &[Role]) -> Self {
        Self {
            node_id: node_id.into(),
            zone: zone.into(),
            roles: roles.to_vec(),
            tables: RwLock::new(Tables::default()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|p| p.into_inner())
    }

    fn packet(&self, cmd: TopologyCmd, entry: TopologyEntry) -> TopologyPacket {
        TopologyPacket {
            origin_node_id: self.node_id.clone(),
            cmd,
            entry,
        }
    }

    /// Record something this node owns. Returns the packet to advertise.
    pub fn add_local(&self, mut entry: TopologyEntry) -> TopologyPacket {
        entry.set_learned_from(None);
        if let TopologyEntry::Node(n) = &mut entry {
            n.last_seen = Utc::now();
        }
        self.write().put(entry.clone());
        self.packet(TopologyCmd::Add, entry)
    }

    /// Remove something this node owns. Returns the packet to advertise.
    pub fn remove_local(&self, entry: TopologyEntry) -> Option<TopologyPacket> {
        self.write()
            .remove(&entry)
            .then(|| self.packet(TopologyCmd::Delete, entry))
    }

    /// Apply a packet received from peer `source`.
    ///
    /// Returns the changes actually applied, re-originated from this node,
    /// for relaying to other peers.
    pub fn process_packet(&self, packet: TopologyPacket, source: &str) -> Vec<TopologyPacket> {
        let TopologyPacket { cmd, mut entry, .. } = packet;
        if entry.node_id() == self.node_id {
            return Vec::new();
        }
        entry.set_learned_from(Some(source.to_string()));

        let mut tables = self.write();
        match cmd {
            TopologyCmd::Add | TopologyCmd::Update => {
                if let Some(existing) = tables.get(&entry) {
                    if existing.is_direct() && !entry.is_direct() {
                        debug!(
                            "[{}] Ignoring indirect {:?} for {} from {}",
                            self.node_id,
                            cmd,
                            entry.node_id(),
                            source
                        );
                        return Vec::new();
                    }
                    if same_entry(&existing, &entry) {
                        if let TopologyEntry::Node(mut seen) = existing {
                            seen.last_seen = Utc::now();
                            tables.put(TopologyEntry::Node(seen));
                        }
                        return Vec::new();
                    }
                }
                if let TopologyEntry::Node(n) = &mut entry {
                    n.last_seen = Utc::now();
                }
                tables.put(entry.clone());
                vec![self.packet(cmd, entry)]
            }
            TopologyCmd::Delete => {
                let Some(existing) = tables.get(&entry) else {
                    return Vec::new();
                };
                if existing.learned_from() != Some(source) {
                    debug!(
                        "[{}] Ignoring delete for {} from non-source {}",
                        self.node_id,
                        entry.node_id(),
                        source
                    );
                    return Vec::new();
                }
                match &existing {
                    TopologyEntry::Node(n) => tables
                        .remove_node_cascade(&n.node_id)
                        .into_iter()
                        .filter(|e| matches!(e, TopologyEntry::Node(_)))
                        .map(|e| self.packet(TopologyCmd::Delete, e))
                        .collect(),
                    _ => {
                        tables.remove(&existing);
                        vec![self.packet(TopologyCmd::Delete, existing)]
                    }
                }
            }
        }
    }

    /// Whether `entry` may be advertised to `target`.
    pub fn advertise_out_check(&self, entry: &TopologyEntry, target: &str) -> bool {
        let tables = self.read();
        self.advertise_check_locked(&tables, entry, target)
    }

    fn advertise_check_locked(&self, tables: &Tables, entry: &TopologyEntry, target: &str) -> bool {
        let Some(target_node) = tables.nodes.get(target) else {
            return true;
        };
        match entry.scope() {
            Scope::Local => return false,
            Scope::Zone if entry.zone() != target_node.zone => return false,
            _ => {}
        }
        if entry.node_id() == target || entry.learned_from() == Some(target) {
            return false;
        }
        if entry.node_id() == self.node_id {
            return true;
        }
        if self.roles.contains(&Role::Registry)
            && (!target_node.has_role(Role::Registry) || entry.is_direct())
        {
            return true;
        }
        self.roles.contains(&Role::Relay)
    }

    /// Everything `requesting_node` is allowed to import from us.
    pub fn get_registry(&self, requesting_node: &str) -> Vec<TopologyPacket> {
        let tables = self.read();
        let mut entries: Vec<TopologyEntry> = Vec::new();
        entries.extend(tables.nodes.values().cloned().map(TopologyEntry::Node));
        entries.extend(tables.services.values().cloned().map(TopologyEntry::Service));
        entries.extend(tables.streams.values().cloned().map(TopologyEntry::Stream));
        // nodes first so services and streams land on known owners
        entries.sort_by_key(|e| !matches!(e, TopologyEntry::Node(_)));
        entries
            .into_iter()
            .filter(|e| self.advertise_check_locked(&tables, e, requesting_node))
            .map(|e| self.packet(TopologyCmd::Add, e))
            .collect()
    }

    /// A peer link dropped.
    ///
    /// When it was the last registry link of a non-registry node the tables
    /// are kept until the next registry import; otherwise the peer and
    /// everything learned through it is removed.
    pub fn process_node_disconnect(
        &self,
        peer: &str,
        remaining_registry_links: usize,
    ) -> Vec<TopologyPacket> {
        let mut tables = self.write();
        let peer_is_registry = tables
            .nodes
            .get(peer)
            .map(|n| n.has_role(Role::Registry))
            .unwrap_or(false);
        if peer_is_registry
            && remaining_registry_links == 0
            && !self.roles.contains(&Role::Registry)
        {
            info!(
                "[{}] Lost last registry {}, keeping topology until reconnect",
                self.node_id, peer
            );
            return Vec::new();
        }
        tables
            .remove_node_cascade(peer)
            .into_iter()
            .filter(|e| matches!(e, TopologyEntry::Node(_)))
            .map(|e| self.packet(TopologyCmd::Delete, e))
            .collect()
    }

    /// Drop rows learned from peers that are no longer connected.
    pub fn stale_entry_cleanup(&self, connected_peers: &[NodeId]) -> usize {
        let connected: HashSet<&str> = connected_peers.iter().map(String::as_str).collect();
        let stale = |learned: &Option<NodeId>| match learned {
            Some(l) => !connected.contains(l.as_str()),
            None => false,
        };
        let mut tables = self.write();
        let before = tables.nodes.len() + tables.services.len() + tables.streams.len();
        tables.nodes.retain(|_, n| !stale(&n.learned_from));
        tables.services.retain(|_, s| !stale(&s.learned_from));
        tables.streams.retain(|_, s| !stale(&s.learned_from));
        let removed = before - (tables.nodes.len() + tables.services.len() + tables.streams.len());
        if removed > 0 {
            debug!("[{}] Removed {} stale topology rows", self.node_id, removed);
        }
        removed
    }

    /// Best available instance of a service.
    ///
    /// Preference order: local zone, local scope, lowest priority, then a
    /// weighted random pick among the remaining ties.
    pub fn find_instance_of_service(&self, name: &str) -> Option<ServiceTableEntry> {
        let tables = self.read();
        let mut candidates: Vec<&ServiceTableEntry> = tables
            .services
            .values()
            .filter(|s| s.name == name && s.status == crate::service::STATUS_AVAILABLE)
            .filter(|s| s.scope != Scope::Zone || s.zone == self.zone)
            .collect();
        if candidates.iter().any(|s| s.zone == self.zone) {
            candidates.retain(|s| s.zone == self.zone);
        }
        if candidates.iter().any(|s| s.scope == Scope::Local) {
            candidates.retain(|s| s.scope == Scope::Local);
        }
        let best = candidates.iter().map(|s| s.priority).min()?;
        candidates.retain(|s| s.priority == best);
        // stable order for the weighted pick
        candidates.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        let total: u64 = candidates.iter().map(|s| s.weight as u64).sum();
        if total == 0 {
            return candidates.first().map(|s| (*s).clone());
        }
        let mut pick = fastrand::u64(0..total);
        for s in &candidates {
            if pick < s.weight as u64 {
                return Some((*s).clone());
            }
            pick -= s.weight as u64;
        }
        candidates.last().map(|s| (*s).clone())
    }

    /// Publishers of `topic` visible from `zone` within `scope`, same zone first.
    pub fn find_stream_publishers(
        &self,
        topic: &str,
        scope: Scope,
        zone: &str,
    ) -> Vec<StreamTableEntry> {
        let tables = self.read();
        let mut found: Vec<StreamTableEntry> = tables
            .streams
            .values()
            .filter(|s| s.topic == topic)
            .filter(|s| s.scope != Scope::Zone || s.zone == zone)
            .filter(|s| match scope {
                Scope::Local => s.node_id == self.node_id,
                Scope::Zone => s.zone == zone,
                Scope::Global => true,
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            (a.zone != zone, a.node_id != self.node_id, &a.node_id).cmp(&(
                b.zone != zone,
                b.node_id != self.node_id,
                &b.node_id,
            ))
        });
        found
    }

    /// Peer to forward traffic for `target` to.
    pub fn next_hop(&self, target: &str) -> Option<NodeId> {
        self.read()
            .nodes
            .get(target)
            .map(|n| n.learned_from.clone().unwrap_or_else(|| n.node_id.clone()))
    }

    pub fn reachability(&self, target: &str) -> Option<Reachability> {
        if target == self.node_id {
            return Some(Reachability::Local);
        }
        let tables = self.read();
        let node = tables.nodes.get(target)?;
        Some(match node.learned_from.as_deref() {
            None => Reachability::Direct,
            Some(l) if l == target => Reachability::Direct,
            Some(l) => Reachability::ViaRelay(l.to_string()),
        })
    }

    pub fn node(&self, node_id: &str) -> Option<NodeTableEntry> {
        self.read().nodes.get(node_id).cloned()
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.read().nodes.contains_key(node_id)
    }

    pub fn nodes(&self) -> Vec<NodeTableEntry> {
        let mut nodes: Vec<NodeTableEntry> = self.read().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn find_registries_in_zone(&self, zone: &str) -> Vec<NodeTableEntry> {
        self.nodes()
            .into_iter()
            .filter(|n| n.zone == zone && n.has_role(Role::Registry))
            .collect()
    }

    /// Providers of each service name.
    pub fn list_services(&self) -> BTreeMap<String, Vec<ServiceTableEntry>> {
        let mut out: BTreeMap<String, Vec<ServiceTableEntry>> = BTreeMap::new();
        for s in self.read().services.values() {
            out.entry(s.name.clone()).or_default().push(s.clone());
        }
        for v in out.values_mut() {
            v.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        }
        out
    }

    /// Publishers of each topic.
    pub fn list_streams(&self) -> BTreeMap<String, Vec<StreamTableEntry>> {
        let mut out: BTreeMap<String, Vec<StreamTableEntry>> = BTreeMap::new();
        for s in self.read().streams.values() {
            out.entry(s.topic.clone()).or_default().push(s.clone());
        }
        for v in out.values_mut() {
            v.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        }
        out
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        let tables = self.read();
        let mut snapshot = TopologySnapshot {
            nodes: tables.nodes.values().cloned().collect(),
            services: tables.services.values().cloned().collect(),
            streams: tables.streams.values().cloned().collect(),
        };
        snapshot.nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        snapshot
            .services
            .sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        snapshot
            .streams
            .sort_by(|a, b| (&a.node_id, &a.topic).cmp(&(&b.node_id, &b.topic)));
        snapshot
    }
}

/// Equal apart from the last-seen stamp.
fn same_entry(a: &TopologyEntry, b: &TopologyEntry) -> bool {
    match (a, b) {
        (TopologyEntry::Node(x), TopologyEntry::Node(y)) => {
            let mut y = y.clone();
            y.last_seen = x.last_seen;
            *x == y
        }
        _ => a == b,
    }
}
