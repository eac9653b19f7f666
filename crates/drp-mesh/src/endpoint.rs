// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RPC state for one persistent link.
//!
//! An [`Endpoint`] owns:
//! - request correlation (`Token` -> pending reply slot)
//! - stream handlers (`StreamToken` -> delivery queue)
//! - the reader task that dispatches inbound commands concurrently
//!
//! Closing an endpoint fails every outstanding call with
//! [`MeshError::ConnectionClosed`] and ends every stream handler.

use crate::auth::AuthResponse;
use crate::error::{MeshError, MeshResult};
use crate::protocol::{
    close_code, CmdPacket, NodeDeclaration, Packet, ReplyPacket, ReplyStatus, StreamPacket,
    StreamStatus, StreamToken, Token,
};
use crate::transport::{Inbound, Link, Outbound};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Short connection identifier used in logs and tables.
pub type EndpointId = String;

/// Queue depth of each stream handler.
pub const STREAM_QUEUE_DEPTH: usize = 256;

/// Delivered to a stream handler.
#[derive(Debug)]
pub enum StreamEvent {
    Data(Value),
    /// Terminal. `None` is a clean end.
    Closed(Option<MeshError>),
}

/// Handles commands arriving on an endpoint.
#[async_trait]
pub trait CommandDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, endpoint: Arc<Endpoint>, cmd: CmdPacket) -> MeshResult<Value>;
}

/// Lifecycle hooks. Each fires at most once per event.
pub trait EndpointObserver: Send + Sync + 'static {
    fn on_open(&self, _endpoint: &Endpoint) {}
    fn on_close(&self, _endpoint: &Endpoint, _code: u16) {}
    fn on_error(&self, _endpoint: &Endpoint, _error: &str) {}
}

/// Dispatcher for endpoints that never serve commands.
#[derive(Debug, Default)]
pub struct RejectCommands;

#[async_trait]
impl CommandDispatcher for RejectCommands {
    async fn dispatch(&self, _endpoint: Arc<Endpoint>, cmd: CmdPacket) -> MeshResult<Value> {
        Err(MeshError::InvalidRequest(format!(
            "this endpoint does not accept commands ({})",
            cmd.verb
        )))
    }
}

/// What the other side of the link turned out to be.
#[derive(Debug, Clone, Default)]
pub enum PeerInfo {
    #[default]
    Unknown,
    /// We opened this link and have not finished `hello` yet.
    Dialed,
    Node(NodeDeclaration),
    Consumer { user: Option<AuthResponse> },
}

/// Endpoint counters snapshot.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointStats {
    pub commands_sent: u64,
    pub replies_received: u64,
    pub late_replies: u64,
    pub commands_handled: u64,
    pub stream_frames_received: u64,
    pub stream_frames_dropped: u64,
}

#[derive(Default)]
struct Counters {
    commands_sent: AtomicU64,
    replies_received: AtomicU64,
    late_replies: AtomicU64,
    commands_handled: AtomicU64,
    stream_frames_received: AtomicU64,
    stream_frames_dropped: AtomicU64,
}

/// One side of a persistent link.
pub struct Endpoint {
    id: EndpointId,
    remote: String,
    outbound: mpsc::Sender<Outbound>,
    pending: DashMap<Token, oneshot::Sender<MeshResult<Value>>>,
    streams: DashMap<StreamToken, mpsc::Sender<StreamEvent>>,
    next_token: AtomicU64,
    next_stream: AtomicU64,
    closed: AtomicBool,
    closed_tx: watch::Sender<Option<u16>>,
    default_timeout: Duration,
    peer: RwLock<PeerInfo>,
    observer: Option<Arc<dyn EndpointObserver>>,
    counters: Counters,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Take ownership of a link and start reading it.
    pub fn spawn(
        link: Link,
        dispatcher: Arc<dyn CommandDispatcher>,
        observer: Option<Arc<dyn EndpointObserver>>,
        default_timeout: Duration,
    ) -> Arc<Self> {
        let Link {
            outbound,
            inbound,
            remote,
        } = link;
        let (closed_tx, closed_rx) = watch::channel(None);
        let endpoint = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            remote,
            outbound,
            pending: DashMap::new(),
            streams: DashMap::new(),
            next_token: AtomicU64::new(1),
            next_stream: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            closed_tx,
            default_timeout,
            peer: RwLock::new(PeerInfo::Unknown),
            observer,
            counters: Counters::default(),
        });

        debug!("[{}] Link open to {}", endpoint.id, endpoint.remote);
        if let Some(observer) = &endpoint.observer {
            observer.on_open(&endpoint);
        }
        tokio::spawn(read_loop(endpoint.clone(), inbound, dispatcher, closed_rx));
        endpoint
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the endpoint is closed, with the close code.
    pub async fn closed(&self) -> u16 {
        let mut rx = self.closed_tx.subscribe();
        loop {
            if let Some(code) = *rx.borrow_and_update() {
                return code;
            }
            if rx.changed().await.is_err() {
                return close_code::ABNORMAL;
            }
        }
    }

    pub fn peer(&self) -> PeerInfo {
        match self.peer.read() {
            Ok(p) => p.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_peer(&self, peer: PeerInfo) {
        match self.peer.write() {
            Ok(mut p) => *p = peer,
            Err(poisoned) => *poisoned.into_inner() = peer,
        }
    }

    /// Node ID of the peer, once it has said hello as a node.
    pub fn peer_node_id(&self) -> Option<String> {
        match self.peer() {
            PeerInfo::Node(decl) => Some(decl.node_id),
            _ => None,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stream_handler_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stats(&self) -> EndpointStats {
        let c = &self.counters;
        EndpointStats {
            commands_sent: c.commands_sent.load(Ordering::Relaxed),
            replies_received: c.replies_received.load(Ordering::Relaxed),
            late_replies: c.late_replies.load(Ordering::Relaxed),
            commands_handled: c.commands_handled.load(Ordering::Relaxed),
            stream_frames_received: c.stream_frames_received.load(Ordering::Relaxed),
            stream_frames_dropped: c.stream_frames_dropped.load(Ordering::Relaxed),
        }
    }

    /// Send a command and wait for its reply.
    pub async fn call(&self, cmd: CmdPacket) -> MeshResult<Value> {
        self.call_with_timeout(cmd, self.default_timeout).await
    }

    pub async fn call_with_timeout(&self, cmd: CmdPacket, timeout: Duration) -> MeshResult<Value> {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.call_with_token(cmd, token, timeout).await
    }

    /// Send a command under a caller-chosen token.
    ///
    /// Fails fast with [`MeshError::TokenInUse`] if the token is still
    /// outstanding.
    pub async fn call_with_token(
        &self,
        mut cmd: CmdPacket,
        token: Token,
        timeout: Duration,
    ) -> MeshResult<Value> {
        if self.is_closed() {
            return Err(MeshError::ConnectionClosed);
        }

        let (tx, rx) = oneshot::channel();
        match self.pending.entry(token) {
            Entry::Occupied(_) => return Err(MeshError::TokenInUse(token)),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        // close() may have drained the table between the check and the insert
        if self.is_closed() {
            self.pending.remove(&token);
            return Err(MeshError::ConnectionClosed);
        }

        cmd.token = Some(token);
        let verb = cmd.verb.clone();
        if self.outbound.send(Outbound::Packet(Packet::Cmd(cmd))).await.is_err() {
            self.pending.remove(&token);
            return Err(MeshError::ConnectionClosed);
        }
        self.counters.commands_sent.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MeshError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&token);
                debug!("[{}] {} (token {}) timed out", self.id, verb, token);
                Err(MeshError::Timeout)
            }
        }
    }

    /// Send a command without waiting for a reply.
    pub async fn send(&self, mut cmd: CmdPacket) -> MeshResult<()> {
        cmd.token = None;
        self.outbound
            .send(Outbound::Packet(Packet::Cmd(cmd)))
            .await
            .map_err(|_| MeshError::ConnectionClosed)?;
        self.counters.commands_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Register a handler for pushed stream data.
    ///
    /// The token is allocated here, never by the remote.
    pub fn add_stream_handler(&self) -> (StreamToken, mpsc::Receiver<StreamEvent>) {
        let token = StreamToken(self.next_stream.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
        if self.is_closed() {
            let _ = tx.try_send(StreamEvent::Closed(Some(MeshError::ConnectionClosed)));
        } else {
            self.streams.insert(token, tx);
        }
        (token, rx)
    }

    /// Remove a stream handler. Unknown tokens are ignored.
    pub fn delete_stream_handler(&self, token: StreamToken) -> bool {
        self.streams.remove(&token).is_some()
    }

    /// Push one frame to the peer's stream handler.
    pub async fn send_stream(
        &self,
        token: StreamToken,
        status: StreamStatus,
        payload: Value,
    ) -> MeshResult<()> {
        let packet = StreamPacket {
            stream_token: token,
            status,
            payload,
            error: None,
        };
        self.push_stream(packet).await
    }

    pub async fn send_stream_error(&self, token: StreamToken, error: &MeshError) -> MeshResult<()> {
        let packet = StreamPacket {
            stream_token: token,
            status: StreamStatus::Error,
            payload: Value::Null,
            error: Some(error.to_payload(None)),
        };
        self.push_stream(packet).await
    }

    async fn push_stream(&self, packet: StreamPacket) -> MeshResult<()> {
        if self.is_closed() {
            return Err(MeshError::ConnectionClosed);
        }
        self.outbound
            .send(Outbound::Packet(Packet::Stream(packet)))
            .await
            .map_err(|_| MeshError::ConnectionClosed)
    }

    /// Close the link and release everything registered on it.
    pub fn close(&self, code: u16) {
        if !self.is_closed() {
            let _ = self.outbound.try_send(Outbound::Close(code));
        }
        self.shutdown(code);
    }

    fn shutdown(&self, code: u16) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let tokens: Vec<Token> = self.pending.iter().map(|e| *e.key()).collect();
        for token in tokens {
            if let Some((_, tx)) = self.pending.remove(&token) {
                let _ = tx.send(Err(MeshError::ConnectionClosed));
            }
        }
        let streams: Vec<StreamToken> = self.streams.iter().map(|e| *e.key()).collect();
        for token in streams {
            if let Some((_, tx)) = self.streams.remove(&token) {
                let _ = tx.try_send(StreamEvent::Closed(Some(MeshError::ConnectionClosed)));
            }
        }
        self.closed_tx.send_replace(Some(code));
        info!("[{}] Link to {} closed ({})", self.id, self.remote, code);
        if let Some(observer) = &self.observer {
            observer.on_close(self, code);
        }
    }

    fn handle_reply(&self, reply: ReplyPacket) {
        let Some((_, tx)) = self.pending.remove(&reply.token) else {
            self.counters.late_replies.fetch_add(1, Ordering::Relaxed);
            debug!(
                "[{}] Dropping reply for retired token {}",
                self.id, reply.token
            );
            return;
        };
        self.counters.replies_received.fetch_add(1, Ordering::Relaxed);
        let result = match reply.status {
            ReplyStatus::Ok => Ok(reply.payload),
            ReplyStatus::Error => Err(reply
                .error
                .map(MeshError::from_payload)
                .unwrap_or_else(|| MeshError::handler("remote error without details"))),
        };
        let _ = tx.send(result);
    }

    fn handle_stream(&self, packet: StreamPacket) {
        self.counters
            .stream_frames_received
            .fetch_add(1, Ordering::Relaxed);
        let token = packet.stream_token;
        match packet.status {
            StreamStatus::Data => {
                let Some(tx) = self.streams.get(&token).map(|t| t.clone()) else {
                    debug!("[{}] No handler for stream {}", self.id, token);
                    return;
                };
                match tx.try_send(StreamEvent::Data(packet.payload)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.counters
                            .stream_frames_dropped
                            .fetch_add(1, Ordering::Relaxed);
                        warn!("[{}] Stream {} handler full, dropping frame", self.id, token);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        self.streams.remove(&token);
                    }
                }
            }
            StreamStatus::End | StreamStatus::Error => {
                if let Some((_, tx)) = self.streams.remove(&token) {
                    let err = packet.error.map(MeshError::from_payload);
                    let _ = tx.try_send(StreamEvent::Closed(err));
                }
            }
        }
    }
}

async fn read_loop(
    endpoint: Arc<Endpoint>,
    mut inbound: mpsc::Receiver<Inbound>,
    dispatcher: Arc<dyn CommandDispatcher>,
    mut closed_rx: watch::Receiver<Option<u16>>,
) {
    loop {
        let event = tokio::select! {
            event = inbound.recv() => event,
            _ = closed_rx.changed() => break,
        };
        match event {
            Some(Inbound::Packet(Packet::Cmd(cmd))) => {
                let endpoint = endpoint.clone();
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { serve_command(endpoint, dispatcher, cmd).await });
            }
            Some(Inbound::Packet(Packet::Reply(reply))) => endpoint.handle_reply(reply),
            Some(Inbound::Packet(Packet::Stream(packet))) => endpoint.handle_stream(packet),
            Some(Inbound::Error(e)) => {
                warn!("[{}] Link error: {}", endpoint.id, e);
                if let Some(observer) = &endpoint.observer {
                    observer.on_error(&endpoint, &e);
                }
            }
            Some(Inbound::Closed(code)) => {
                endpoint.shutdown(code);
                break;
            }
            None => {
                endpoint.shutdown(close_code::ABNORMAL);
                break;
            }
        }
    }
}

async fn serve_command(endpoint: Arc<Endpoint>, dispatcher: Arc<dyn CommandDispatcher>, cmd: CmdPacket) {
    let token = cmd.token;
    let path = cmd.joined_path();
    let verb = cmd.verb.clone();
    let result = dispatcher.dispatch(endpoint.clone(), cmd).await;
    endpoint
        .counters
        .commands_handled
        .fetch_add(1, Ordering::Relaxed);

    let Some(token) = token else {
        if let Err(e) = result {
            debug!("[{}] Untokened {} failed: {}", endpoint.id, verb, e);
        }
        return;
    };
    let reply = match result {
        Ok(payload) => ReplyPacket::ok(token, payload),
        Err(e) => {
            debug!("[{}] {} failed: {}", endpoint.id, verb, e);
            ReplyPacket::error(token, e.to_payload(path.as_deref()))
        }
    };
    if endpoint
        .outbound
        .send(Outbound::Packet(Packet::Reply(reply)))
        .await
        .is_err()
    {
        debug!("[{}] Reply for {} lost, link closed", endpoint.id, verb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::verbs;
    use crate::transport::MemoryNetwork;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Echoes payloads; `sleep` waits forever, `fail` errors.
    struct Echo;

    #[async_trait]
    impl CommandDispatcher for Echo {
        async fn dispatch(&self, _ep: Arc<Endpoint>, cmd: CmdPacket) -> MeshResult<Value> {
            match cmd.verb.as_str() {
                "sleep" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Value::Null)
                }
                "fail" => Err(MeshError::handler("boom")),
                _ => Ok(cmd.payload),
            }
        }
    }

    #[derive(Default)]
    struct CountingObserver {
        opens: AtomicUsize,
        closes: AtomicUsize,
    }

    impl EndpointObserver for CountingObserver {
        fn on_open(&self, _endpoint: &Endpoint) {
            self.opens.fetch_add(1, Ordering::SeqCst);
        }
        fn on_close(&self, _endpoint: &Endpoint, _code: u16) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pair() -> (Arc<Endpoint>, Arc<Endpoint>) {
        let (a, b) = MemoryNetwork::pair("a", "b");
        let a = Endpoint::spawn(a, Arc::new(Echo), None, Duration::from_secs(5));
        let b = Endpoint::spawn(b, Arc::new(Echo), None, Duration::from_secs(5));
        (a, b)
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (a, _b) = pair();
        let reply = a
            .call(CmdPacket::new(verbs::PING, json!({"n": 1})))
            .await
            .unwrap();
        assert_eq!(reply["n"], 1);
        assert_eq!(a.pending_count(), 0);
        assert_eq!(a.stats().replies_received, 1);
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_correlated() {
        let (a, _b) = pair();
        let mut tasks = Vec::new();
        for i in 0..32 {
            let a = a.clone();
            tasks.push(tokio::spawn(async move {
                a.call(CmdPacket::new("echo", json!(i))).await.unwrap()
            }));
        }
        for (i, t) in tasks.into_iter().enumerate() {
            assert_eq!(t.await.unwrap(), json!(i));
        }
    }

    #[tokio::test]
    async fn test_remote_error_is_typed() {
        let (a, _b) = pair();
        let err = a
            .call(CmdPacket::new("fail", Value::Null).path(vec!["Services".into(), "X".into()]))
            .await
            .unwrap_err();
        match err {
            MeshError::Remote { message, path, .. } => {
                assert_eq!(message, "boom");
                assert_eq!(path.as_deref(), Some("Services/X"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_releases_token_and_drops_late_reply() {
        let (a, _b) = pair();
        let err = a
            .call_with_timeout(CmdPacket::new("sleep", Value::Null), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Timeout));
        assert_eq!(a.pending_count(), 0);

        // a reply for the retired token must be ignored
        a.handle_reply(ReplyPacket::ok(Token(1), json!("late")));
        assert_eq!(a.stats().late_replies, 1);
    }

    #[tokio::test]
    async fn test_token_reuse_fails_fast() {
        let (a, _b) = pair();
        let a2 = a.clone();
        let first = tokio::spawn(async move {
            a2.call_with_token(
                CmdPacket::new("sleep", Value::Null),
                Token(99),
                Duration::from_secs(5),
            )
            .await
        });
        while a.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        let err = a
            .call_with_token(CmdPacket::new("echo", Value::Null), Token(99), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::TokenInUse(Token(99))));

        a.close(close_code::NORMAL);
        assert!(matches!(first.await.unwrap(), Err(MeshError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_calls() {
        let (a, b) = pair();
        let mut calls = Vec::new();
        for _ in 0..3 {
            let a = a.clone();
            calls.push(tokio::spawn(async move {
                a.call(CmdPacket::new("sleep", Value::Null)).await
            }));
        }
        while a.pending_count() < 3 {
            tokio::task::yield_now().await;
        }
        let (_token, mut stream) = a.add_stream_handler();

        a.close(close_code::GOING_AWAY);
        for c in calls {
            assert!(matches!(c.await.unwrap(), Err(MeshError::ConnectionClosed)));
        }
        assert!(matches!(
            stream.recv().await,
            Some(StreamEvent::Closed(Some(MeshError::ConnectionClosed)))
        ));
        assert_eq!(a.stream_handler_count(), 0);
        assert_eq!(b.closed().await, close_code::GOING_AWAY);
        assert!(a.call(CmdPacket::new("echo", Value::Null)).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_handler_delivery_and_removal() {
        let (a, b) = pair();
        let (token, mut rx) = a.add_stream_handler();

        b.send_stream(token, StreamStatus::Data, json!("tick"))
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            StreamEvent::Data(v) => assert_eq!(v, json!("tick")),
            other => panic!("unexpected {:?}", other),
        }

        assert!(a.delete_stream_handler(token));
        assert!(!a.delete_stream_handler(token));
        b.send_stream(token, StreamStatus::Data, json!("late"))
            .await
            .unwrap();
        // the handler is gone; the sender half is dropped with it
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_end_is_terminal() {
        let (a, b) = pair();
        let (token, mut rx) = a.add_stream_handler();
        b.send_stream(token, StreamStatus::End, Value::Null)
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(StreamEvent::Closed(None))));
        assert_eq!(a.stream_handler_count(), 0);
    }

    #[tokio::test]
    async fn test_observer_fires_once() {
        let observer = Arc::new(CountingObserver::default());
        let (a, b) = MemoryNetwork::pair("a", "b");
        let a = Endpoint::spawn(a, Arc::new(Echo), Some(observer.clone()), Duration::from_secs(1));
        let _b = Endpoint::spawn(b, Arc::new(Echo), None, Duration::from_secs(1));

        a.close(close_code::NORMAL);
        a.close(close_code::NORMAL);
        assert_eq!(a.closed().await, close_code::NORMAL);
        assert_eq!(observer.opens.load(Ordering::SeqCst), 1);
        assert_eq!(observer.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reject_commands() {
        let (a, b) = MemoryNetwork::pair("a", "b");
        let a = Endpoint::spawn(a, Arc::new(Echo), None, Duration::from_secs(1));
        let _b = Endpoint::spawn(b, Arc::new(RejectCommands), None, Duration::from_secs(1));
        assert!(matches!(
            a.call(CmdPacket::new(verbs::PING, Value::Null)).await,
            Err(MeshError::Remote { .. })
        ));
    }
}
