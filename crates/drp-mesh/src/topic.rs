// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic fan-out.
//!
//! Each subscriber gets its own bounded queue; publication never waits on a
//! subscriber. A full queue loses that payload for that subscriber only, a
//! closed queue unsubscribes it.

use crate::endpoint::EndpointId;
use crate::error::{MeshError, MeshResult};
use crate::protocol::{NodeId, Scope};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Identifies one subscription within a [`TopicManager`].
pub type SubscriberId = u64;

const HISTORY_LEN: usize = 10;

/// Who is subscribing and how far they want data to travel.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Endpoint the subscription belongs to; `None` for in-process watchers.
    pub owner: Option<EndpointId>,
    pub scope: Scope,
    /// Zone of the subscriber when it is not this node's zone.
    pub zone: Option<String>,
}

struct Subscriber {
    owner: Option<EndpointId>,
    scope: Scope,
    zone: Option<String>,
    tx: mpsc::Sender<Value>,
}

#[derive(Default)]
struct TopicState {
    description: Option<String>,
    subscribers: HashMap<SubscriberId, Subscriber>,
    received: u64,
    sent: u64,
    dropped: u64,
    history: VecDeque<Value>,
}

/// Per-topic counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicCounts {
    pub subscribers: usize,
    pub received: u64,
    pub sent: u64,
    pub dropped: u64,
}

/// Topic details for the `Streams/<topic>` path.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TopicInfo {
    pub name: String,
    pub description: Option<String>,
    pub declared: bool,
    pub subscriber_count: usize,
    pub received_count: u64,
    pub sent_count: u64,
    pub dropped_count: u64,
    pub last_ten: Vec<Value>,
}

/// Local topics of one node.
pub struct TopicManager {
    node_id: NodeId,
    zone: String,
    topics: DashMap<String, TopicState>,
    next_id: AtomicU64,
    queue_depth: usize,
}

impl TopicManager {
    pub fn new(node_id: impl Into<NodeId>, zone: impl Into<String>, queue_depth: usize) -> Self {
        Self {
            node_id: node_id.into(),
            zone: zone.into(),
            topics: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Declare a topic this node publishes.
    pub fn add_stream(&self, topic: &str, description: &str) -> MeshResult<()> {
        let mut state = self.topics.entry(topic.to_string()).or_default();
        if state.description.is_some() {
            return Err(MeshError::DuplicateTopic(topic.to_string()));
        }
        state.description = Some(description.to_string());
        debug!("[{}] Declared stream {}", self.node_id, topic);
        Ok(())
    }

    pub fn is_declared(&self, topic: &str) -> bool {
        self.topics
            .get(topic)
            .map(|t| t.description.is_some())
            .unwrap_or(false)
    }

    /// Declared here, or has seen at least one publication.
    pub fn has_publisher(&self, topic: &str) -> bool {
        self.topics
            .get(topic)
            .map(|t| t.description.is_some() || t.received > 0)
            .unwrap_or(false)
    }

    /// Publish to every subscriber whose scope admits this node.
    ///
    /// Returns how many subscribers accepted the payload.
    pub fn send_to_topic(&self, topic: &str, payload: Value) -> usize {
        let mut state = self.topics.entry(topic.to_string()).or_default();
        state.received += 1;
        if state.history.len() == HISTORY_LEN {
            state.history.pop_front();
        }
        state.history.push_back(payload.clone());

        let mut delivered = 0;
        let mut dropped = 0;
        let mut gone = Vec::new();
        for (id, sub) in state.subscribers.iter() {
            if !self.in_scope(sub) {
                continue;
            }
            match sub.tx.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped += 1;
                    warn!(
                        "[{}] Subscriber {} on {} is full, dropping payload",
                        self.node_id, id, topic
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(*id),
            }
        }
        for id in gone {
            state.subscribers.remove(&id);
            debug!("[{}] Removed closed subscriber {} on {}", self.node_id, id, topic);
        }
        state.sent += delivered as u64;
        state.dropped += dropped;
        delivered
    }

    fn in_scope(&self, sub: &Subscriber) -> bool {
        match sub.scope {
            Scope::Local | Scope::Global => true,
            Scope::Zone => sub.zone.as_deref().map(|z| z == self.zone).unwrap_or(true),
        }
    }

    /// Add a subscriber; the topic is created if needed.
    pub fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions,
    ) -> (SubscriberId, mpsc::Receiver<Value>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let mut state = self.topics.entry(topic.to_string()).or_default();
        state.subscribers.insert(
            id,
            Subscriber {
                owner: options.owner,
                scope: options.scope,
                zone: options.zone,
                tx,
            },
        );
        debug!("[{}] Subscriber {} added to {}", self.node_id, id, topic);
        (id, rx)
    }

    pub fn unsubscribe(&self, topic: &str, id: SubscriberId) -> bool {
        self.topics
            .get_mut(topic)
            .map(|mut t| t.subscribers.remove(&id).is_some())
            .unwrap_or(false)
    }

    /// Drop every subscription owned by an endpoint.
    pub fn remove_owner(&self, owner: &str) -> usize {
        let mut removed = 0;
        for mut topic in self.topics.iter_mut() {
            let before = topic.subscribers.len();
            topic
                .subscribers
                .retain(|_, s| s.owner.as_deref() != Some(owner));
            removed += before - topic.subscribers.len();
        }
        if removed > 0 {
            debug!(
                "[{}] Removed {} subscriptions of {}",
                self.node_id, removed, owner
            );
        }
        removed
    }

    /// Subscribers across all topics.
    pub fn subscriber_count(&self) -> usize {
        self.topics.iter().map(|t| t.subscribers.len()).sum()
    }

    pub fn topic_subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }

    pub fn topic_counts(&self) -> BTreeMap<String, TopicCounts> {
        self.topics
            .iter()
            .map(|t| {
                (
                    t.key().clone(),
                    TopicCounts {
                        subscribers: t.subscribers.len(),
                        received: t.received,
                        sent: t.sent,
                        dropped: t.dropped,
                    },
                )
            })
            .collect()
    }

    pub fn topic_info(&self, topic: &str) -> Option<TopicInfo> {
        self.topics.get(topic).map(|t| TopicInfo {
            name: topic.to_string(),
            description: t.description.clone(),
            declared: t.description.is_some(),
            subscriber_count: t.subscribers.len(),
            received_count: t.received,
            sent_count: t.sent,
            dropped_count: t.dropped,
            last_ten: t.history.iter().cloned().collect(),
        })
    }

    /// Topic names, sorted.
    pub fn list_topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    /// Declared topics with their descriptions.
    pub fn declared_streams(&self) -> Vec<(String, String)> {
        let mut streams: Vec<(String, String)> = self
            .topics
            .iter()
            .filter_map(|t| {
                t.description
                    .as_ref()
                    .map(|d| (t.key().clone(), d.clone()))
            })
            .collect();
        streams.sort();
        streams
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> TopicManager {
        TopicManager::new("node-1", "z1", 4)
    }

    #[test]
    fn test_duplicate_topic() {
        let tm = manager();
        tm.add_stream("dummy", "Test stream").unwrap();
        assert!(matches!(
            tm.add_stream("dummy", "again"),
            Err(MeshError::DuplicateTopic(t)) if t == "dummy"
        ));
        assert!(tm.is_declared("dummy"));
        assert_eq!(tm.declared_streams(), vec![("dummy".into(), "Test stream".into())]);
    }

    #[tokio::test]
    async fn test_fan_out_exactly_once() {
        let tm = manager();
        let (_a, mut rx_a) = tm.subscribe("dummy", SubscribeOptions::default());
        let (_b, mut rx_b) = tm.subscribe("dummy", SubscribeOptions::default());

        assert_eq!(tm.send_to_topic("dummy", json!(1)), 2);
        assert_eq!(rx_a.recv().await.unwrap(), json!(1));
        assert_eq!(rx_b.recv().await.unwrap(), json!(1));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let tm = manager();
        let (id, mut rx) = tm.subscribe("dummy", SubscribeOptions::default());
        assert!(tm.unsubscribe("dummy", id));
        assert!(!tm.unsubscribe("dummy", id));
        assert_eq!(tm.send_to_topic("dummy", json!("x")), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let tm = manager();
        let (_slow, _slow_rx) = tm.subscribe("t", SubscribeOptions::default());
        let (_fast, mut fast_rx) = tm.subscribe("t", SubscribeOptions::default());

        for i in 0..10 {
            tm.send_to_topic("t", json!(i));
            assert_eq!(fast_rx.recv().await.unwrap(), json!(i));
        }
        let counts = tm.topic_counts();
        assert_eq!(counts["t"].received, 10);
        assert_eq!(counts["t"].dropped, 6);
    }

    #[test]
    fn test_closed_subscriber_is_removed() {
        let tm = manager();
        let (_id, rx) = tm.subscribe("t", SubscribeOptions::default());
        drop(rx);
        assert_eq!(tm.send_to_topic("t", json!(1)), 0);
        assert_eq!(tm.subscriber_count(), 0);
    }

    #[test]
    fn test_zone_scope_filter() {
        let tm = manager();
        let (_same, _r1) = tm.subscribe(
            "t",
            SubscribeOptions {
                scope: Scope::Zone,
                zone: Some("z1".into()),
                ..Default::default()
            },
        );
        let (_other, _r2) = tm.subscribe(
            "t",
            SubscribeOptions {
                scope: Scope::Zone,
                zone: Some("z2".into()),
                ..Default::default()
            },
        );
        assert_eq!(tm.send_to_topic("t", json!(1)), 1);
    }

    #[test]
    fn test_remove_owner() {
        let tm = manager();
        let owned = |o: &str| SubscribeOptions {
            owner: Some(o.to_string()),
            ..Default::default()
        };
        let (_a, _ra) = tm.subscribe("x", owned("ep-1"));
        let (_b, _rb) = tm.subscribe("y", owned("ep-1"));
        let (_c, _rc) = tm.subscribe("y", owned("ep-2"));
        assert_eq!(tm.remove_owner("ep-1"), 2);
        assert_eq!(tm.subscriber_count(), 1);
        assert_eq!(tm.topic_subscriber_count("y"), 1);
    }

    #[test]
    fn test_history_keeps_last_ten() {
        let tm = manager();
        for i in 0..15 {
            tm.send_to_topic("h", json!(i));
        }
        let info = tm.topic_info("h").unwrap();
        assert_eq!(info.last_ten.len(), 10);
        assert_eq!(info.last_ten[0], json!(5));
        assert!(!info.declared);
        assert!(tm.has_publisher("h"));
        assert!(!tm.has_publisher("nothing"));
    }
}
