// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Handle returned by `watch_stream`.

use crate::endpoint::{Endpoint, StreamEvent};
use crate::error::MeshError;
use crate::protocol::{verbs, CallerType, CmdPacket, RouteOptions, StreamToken, UnsubscribeParams};
use crate::topic::{SubscriberId, TopicManager};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

enum Source {
    Local {
        topics: Arc<TopicManager>,
        id: SubscriberId,
        rx: mpsc::Receiver<Value>,
    },
    Remote {
        endpoint: Arc<Endpoint>,
        token: StreamToken,
        route: Option<RouteOptions>,
        caller: CallerType,
        rx: mpsc::Receiver<StreamEvent>,
    },
}

/// A live topic subscription.
///
/// Dropping it unsubscribes; no payload is delivered after that.
pub struct Subscription {
    topic: String,
    source: Option<Source>,
    closed: Option<MeshError>,
    ended: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("ended", &self.ended)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub(crate) fn local(
        topic: &str,
        topics: Arc<TopicManager>,
        id: SubscriberId,
        rx: mpsc::Receiver<Value>,
    ) -> Self {
        Self {
            topic: topic.to_string(),
            source: Some(Source::Local { topics, id, rx }),
            closed: None,
            ended: false,
        }
    }

    pub(crate) fn remote(
        topic: &str,
        endpoint: Arc<Endpoint>,
        token: StreamToken,
        route: Option<RouteOptions>,
        caller: CallerType,
        rx: mpsc::Receiver<StreamEvent>,
    ) -> Self {
        Self {
            topic: topic.to_string(),
            source: Some(Source::Remote {
                endpoint,
                token,
                route,
                caller,
                rx,
            }),
            closed: None,
            ended: false,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next payload; `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Value> {
        if self.ended {
            return None;
        }
        let next = match self.source.as_mut()? {
            Source::Local { rx, .. } => rx.recv().await,
            Source::Remote { rx, .. } => match rx.recv().await {
                Some(StreamEvent::Data(value)) => Some(value),
                Some(StreamEvent::Closed(reason)) => {
                    self.closed = reason;
                    None
                }
                None => None,
            },
        };
        if next.is_none() {
            self.ended = true;
        }
        next
    }

    /// Why the stream ended, when it ended with an error.
    pub fn close_reason(&self) -> Option<&MeshError> {
        self.closed.as_ref()
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Stop receiving. Same as dropping the handle.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        match self.source.take() {
            Some(Source::Local { topics, id, .. }) => {
                topics.unsubscribe(&self.topic, id);
            }
            Some(Source::Remote {
                endpoint,
                token,
                route,
                caller,
                ..
            }) => {
                endpoint.delete_stream_handler(token);
                if self.ended || endpoint.is_closed() {
                    return;
                }
                let params = UnsubscribeParams {
                    topic_name: self.topic.clone(),
                    stream_token: token,
                };
                let mut cmd = CmdPacket::new(
                    verbs::UNSUBSCRIBE,
                    serde_json::to_value(params).unwrap_or(Value::Null),
                )
                .caller(caller);
                cmd.route_options = route;
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            if let Err(e) = endpoint.send(cmd).await {
                                debug!("[{}] Unsubscribe not sent: {}", endpoint.id(), e);
                            }
                        });
                    }
                    Err(_) => debug!("No runtime to send unsubscribe for {}", self.topic),
                }
            }
            None => {}
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
