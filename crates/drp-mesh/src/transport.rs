// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Persistent message links.
//!
//! A [`Link`] is the channel pair an [`Endpoint`](crate::endpoint::Endpoint)
//! drives. Three providers exist:
//!
//! - [`ws_link`]: an accepted axum WebSocket (server side)
//! - [`WsConnector`]: outbound dials through tokio-tungstenite
//! - [`MemoryNetwork`]: in-process links for embedded meshes and tests

use crate::error::{MeshError, MeshResult};
use crate::protocol::{close_code, Packet};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-link channel depth.
pub const LINK_QUEUE_DEPTH: usize = 256;

/// Frames going out on a link.
#[derive(Debug, Clone)]
pub enum Outbound {
    Packet(Packet),
    /// Close the link with this code.
    Close(u16),
}

/// Events coming in from a link. `Closed` is always the last one.
#[derive(Debug, Clone)]
pub enum Inbound {
    Packet(Packet),
    /// Undecodable frame or transport fault; the link may still be usable.
    Error(String),
    Closed(u16),
}

/// One end of a persistent bidirectional connection.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::Sender<Outbound>,
    pub inbound: mpsc::Receiver<Inbound>,
    /// Peer address or URL, for logs.
    pub remote: String,
}

/// Dials links by URL.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> MeshResult<Link>;
}

/// WebSocket message as the pump sees it.
enum WsFrame {
    Text(String),
    Binary(Vec<u8>),
    Close(u16),
    Control,
}

/// Message type of one WebSocket stack.
trait WsMessage: Send + Unpin + 'static {
    fn text(json: String) -> Self;
    fn close(code: u16) -> Self;
    fn into_frame(self) -> WsFrame;
}

impl WsMessage for axum::extract::ws::Message {
    fn text(json: String) -> Self {
        Self::Text(json)
    }

    fn close(code: u16) -> Self {
        Self::Close(Some(axum::extract::ws::CloseFrame {
            code,
            reason: "".into(),
        }))
    }

    fn into_frame(self) -> WsFrame {
        match self {
            Self::Text(text) => WsFrame::Text(text),
            Self::Binary(bytes) => WsFrame::Binary(bytes),
            Self::Close(frame) => WsFrame::Close(frame.map(|f| f.code).unwrap_or(close_code::NORMAL)),
            Self::Ping(_) | Self::Pong(_) => WsFrame::Control,
        }
    }
}

impl WsMessage for tokio_tungstenite::tungstenite::Message {
    fn text(json: String) -> Self {
        Self::Text(json)
    }

    fn close(code: u16) -> Self {
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
        use tokio_tungstenite::tungstenite::protocol::CloseFrame;

        Self::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        }))
    }

    fn into_frame(self) -> WsFrame {
        match self {
            Self::Text(text) => WsFrame::Text(text),
            Self::Binary(bytes) => WsFrame::Binary(bytes),
            Self::Close(frame) => WsFrame::Close(
                frame
                    .map(|f| u16::from(f.code))
                    .unwrap_or(close_code::NORMAL),
            ),
            _ => WsFrame::Control,
        }
    }
}

/// Drive a WebSocket from a pair of link channels.
fn ws_pump<S, M, E>(socket: S, remote: String) -> Link
where
    S: Sink<M> + Stream<Item = Result<M, E>> + Send + 'static,
    M: WsMessage,
    E: std::fmt::Display + Send + 'static,
{
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(LINK_QUEUE_DEPTH);
    let (in_tx, in_rx) = mpsc::channel::<Inbound>(LINK_QUEUE_DEPTH);

    let log_remote = remote.clone();
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            match frame {
                Outbound::Packet(packet) => match serde_json::to_string(&packet) {
                    Ok(json) => {
                        if ws_tx.send(M::text(json)).await.is_err() {
                            debug!("[{}] WebSocket send failed, closing", log_remote);
                            break;
                        }
                    }
                    Err(e) => warn!("[{}] Failed to serialize packet: {}", log_remote, e),
                },
                Outbound::Close(code) => {
                    let _ = ws_tx.send(M::close(code)).await;
                    break;
                }
            }
        }
    });

    let log_remote = remote.clone();
    tokio::spawn(async move {
        let mut code = close_code::ABNORMAL;
        while let Some(msg) = ws_rx.next().await {
            let event = match msg.map(WsMessage::into_frame) {
                Ok(WsFrame::Text(text)) => decode(&text),
                Ok(WsFrame::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => decode(text),
                    Err(_) => Inbound::Error("binary frame is not UTF-8".into()),
                },
                Ok(WsFrame::Close(received)) => {
                    code = received;
                    break;
                }
                Ok(WsFrame::Control) => continue,
                Err(e) => {
                    debug!("[{}] WebSocket error: {}", log_remote, e);
                    break;
                }
            };
            if in_tx.send(event).await.is_err() {
                return;
            }
        }
        let _ = in_tx.send(Inbound::Closed(code)).await;
    });

    Link {
        outbound: out_tx,
        inbound: in_rx,
        remote,
    }
}

/// Wrap an accepted axum WebSocket into a [`Link`].
pub fn ws_link(socket: axum::extract::ws::WebSocket, remote: String) -> Link {
    ws_pump(socket, remote)
}

fn decode(text: &str) -> Inbound {
    match serde_json::from_str::<Packet>(text) {
        Ok(packet) => Inbound::Packet(packet),
        Err(e) => Inbound::Error(format!("Invalid JSON: {}", e)),
    }
}

/// Dials `ws://` and `wss://` URLs.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> MeshResult<Link> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| MeshError::NodeUnreachable(format!("{}: {}", url, e)))?;
        Ok(ws_pump(stream, url.to_string()))
    }
}

/// In-process network: URLs map to listeners, links are channel pairs.
///
/// Every packet is JSON encoded and decoded on the way through so in-memory
/// meshes see the same wire surface as WebSocket ones.
#[derive(Debug, Default, Clone)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<String, mpsc::UnboundedSender<Link>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting links at `url`. Dropping the receiver stops listening.
    pub fn listen(&self, url: &str) -> mpsc::UnboundedReceiver<Link> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.insert(url.to_string(), tx);
        rx
    }

    pub fn unlisten(&self, url: &str) {
        self.listeners.remove(url);
    }

    /// Two connected link ends.
    pub fn pair(a_name: &str, b_name: &str) -> (Link, Link) {
        let (a_out_tx, a_out_rx) = mpsc::channel::<Outbound>(LINK_QUEUE_DEPTH);
        let (b_out_tx, b_out_rx) = mpsc::channel::<Outbound>(LINK_QUEUE_DEPTH);
        let (a_in_tx, a_in_rx) = mpsc::channel::<Inbound>(LINK_QUEUE_DEPTH);
        let (b_in_tx, b_in_rx) = mpsc::channel::<Inbound>(LINK_QUEUE_DEPTH);

        tokio::spawn(pump(a_out_rx, b_in_tx));
        tokio::spawn(pump(b_out_rx, a_in_tx));

        (
            Link {
                outbound: a_out_tx,
                inbound: a_in_rx,
                remote: b_name.to_string(),
            },
            Link {
                outbound: b_out_tx,
                inbound: b_in_rx,
                remote: a_name.to_string(),
            },
        )
    }
}

async fn pump(mut from: mpsc::Receiver<Outbound>, to: mpsc::Sender<Inbound>) {
    while let Some(frame) = from.recv().await {
        let event = match frame {
            Outbound::Packet(packet) => match serde_json::to_string(&packet) {
                Ok(json) => decode(&json),
                Err(e) => Inbound::Error(e.to_string()),
            },
            Outbound::Close(code) => {
                let _ = to.send(Inbound::Closed(code)).await;
                return;
            }
        };
        if to.send(event).await.is_err() {
            return;
        }
    }
    let _ = to.send(Inbound::Closed(close_code::ABNORMAL)).await;
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn connect(&self, url: &str) -> MeshResult<Link> {
        let listener = self
            .listeners
            .get(url)
            .map(|l| l.clone())
            .ok_or_else(|| MeshError::NodeUnreachable(url.to_string()))?;
        let (local, remote) = Self::pair("memory-client", url);
        if listener.send(remote).is_err() {
            self.listeners.remove(url);
            return Err(MeshError::NodeUnreachable(url.to_string()));
        }
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ReplyPacket, Token};
    use serde_json::json;

    #[test]
    fn test_close_codes_survive_both_stacks() {
        use axum::extract::ws::Message as AxumMessage;
        use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

        let server_side = <AxumMessage as WsMessage>::close(close_code::DUPLICATE_NODE);
        assert!(matches!(server_side.into_frame(), WsFrame::Close(c) if c == close_code::DUPLICATE_NODE));
        let client_side = <TungsteniteMessage as WsMessage>::close(close_code::DUPLICATE_NODE);
        assert!(matches!(client_side.into_frame(), WsFrame::Close(c) if c == close_code::DUPLICATE_NODE));
        assert!(matches!(TungsteniteMessage::Ping(Vec::new()).into_frame(), WsFrame::Control));
        assert!(matches!(
            <AxumMessage as WsMessage>::text("{}".into()).into_frame(),
            WsFrame::Text(t) if t == "{}"
        ));
    }

    #[tokio::test]
    async fn test_memory_pair_delivers_and_closes() {
        let (a, mut b) = MemoryNetwork::pair("a", "b");
        a.outbound
            .send(Outbound::Packet(Packet::Reply(ReplyPacket::ok(
                Token(1),
                json!("hi"),
            ))))
            .await
            .unwrap();
        match b.inbound.recv().await.unwrap() {
            Inbound::Packet(Packet::Reply(r)) => assert_eq!(r.payload, json!("hi")),
            other => panic!("unexpected {:?}", other),
        }

        a.outbound.send(Outbound::Close(4001)).await.unwrap();
        assert!(matches!(b.inbound.recv().await, Some(Inbound::Closed(4001))));
    }

    #[tokio::test]
    async fn test_dropped_sender_is_abnormal_close() {
        let (a, mut b) = MemoryNetwork::pair("a", "b");
        drop(a);
        assert!(matches!(
            b.inbound.recv().await,
            Some(Inbound::Closed(close_code::ABNORMAL))
        ));
    }

    #[tokio::test]
    async fn test_connect_requires_listener() {
        let net = MemoryNetwork::new();
        assert!(matches!(
            net.connect("mem://nowhere").await,
            Err(MeshError::NodeUnreachable(_))
        ));

        let mut incoming = net.listen("mem://reg");
        let _client = net.connect("mem://reg").await.unwrap();
        let accepted = incoming.recv().await.unwrap();
        assert_eq!(accepted.remote, "memory-client");

        drop(incoming);
        assert!(net.connect("mem://reg").await.is_err());
    }
}
