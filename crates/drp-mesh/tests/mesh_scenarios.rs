// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multi-node scenarios over the in-memory transport.

use drp_mesh::auth::{AuthInfo, AuthRequest, AuthenticatorService, StaticAuthenticator, UserInfo};
use drp_mesh::protocol::{verbs, ServiceCommandParams, REGISTRY_UPDATE_TOPIC};
use drp_mesh::service::{Caller, FnService, Permission, PermissionSet};
use drp_mesh::topology::{NodeTableEntry, TopologyCmd, TopologyEntry, TopologyPacket};
use drp_mesh::{
    CmdPacket, ConnectionState, Consumer, MemoryNetwork, MeshConnection, MeshError, Node, NodeConfig,
    NodeServer, Role, Scope, WsConnector,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

fn url(id: &str) -> String {
    format!("mem://{}", id)
}

fn config(id: &str, roles: &[Role], zone: &str) -> NodeConfig {
    let mut config = NodeConfig::new(id, roles, zone);
    config.port = Some(8080);
    config.listening_url = Some(url(id));
    config.request_timeout_ms = 5_000;
    config.reconnect_initial_secs = 1;
    config.reconnect_step_secs = 1;
    config.reconnect_max_secs = 1;
    config
}

fn start(net: &MemoryNetwork, config: NodeConfig) -> Arc<Node> {
    let node = Node::new(config, Arc::new(net.clone())).unwrap();
    tokio::spawn(node.clone().serve_links(net.listen(&url(node.id()))));
    node
}

async fn join(node: &Arc<Node>, registry: &str) -> MeshConnection {
    let conn = node.connect_to_registry(&url(registry));
    timeout(WAIT, conn.connected()).await.unwrap().unwrap();
    conn
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn greeter() -> Arc<FnService> {
    Arc::new(
        FnService::builder("Greeter")
            .command("sayHi", |_params, ctx| async move {
                Ok(json!({ "pathItem": format!("Hello from {}", ctx.node_id) }))
            })
            .command("showParams", |params, _ctx| async move {
                Ok(json!({ "pathItem": params }))
            })
            .build(),
    )
}

#[tokio::test]
async fn test_broker_proxy_matches_direct_call() {
    let net = MemoryNetwork::new();
    let registry = start(&net, config("r1", &[Role::Registry, Role::Broker], "z1"));
    let provider = start(&net, config("p1", &[Role::Provider], "z1"));
    provider.add_service(greeter()).await;
    let conn = join(&provider, "r1").await;
    assert_eq!(conn.state(), ConnectionState::Active);
    assert!(registry.peers().is_connected("p1"));

    let consumer = Consumer::connect(&net, &url("r1"), None, WAIT).await.unwrap();
    assert_eq!(consumer.broker().node_id, "r1");

    let proxied = consumer
        .service_command("Greeter", "sayHi", json!({}))
        .await
        .unwrap();
    let direct = provider
        .service_command("Greeter", "sayHi", json!({}))
        .await
        .unwrap();
    assert_eq!(proxied, direct);
    assert_eq!(proxied["pathItem"], "Hello from p1");

    let echoed = consumer
        .path_cmd(
            &["Mesh", "Services", "Greeter", "ClientCmds", "showParams"],
            false,
            json!({ "n": 7 }),
        )
        .await
        .unwrap();
    assert_eq!(echoed["pathItem"], json!({ "n": 7 }));

    let missing = consumer
        .service_command("Greeter", "sayBye", Value::Null)
        .await;
    assert!(matches!(missing, Err(MeshError::MethodNotFound { .. })));

    let listing = consumer.path_cmd(&["Endpoints", "Nodes"], true, Value::Null).await.unwrap();
    let names: Vec<&str> = listing["pathItemList"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["Name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["p1"]);
}

#[tokio::test]
async fn test_watch_across_zones_through_registries() {
    let net = MemoryNetwork::new();
    let _r1 = start(&net, config("r1", &[Role::Registry, Role::Broker], "z1"));
    let r2 = start(&net, config("r2", &[Role::Registry], "z2"));
    let _r2_link = join(&r2, "r1").await;

    let publisher = start(&net, config("p2", &[Role::Provider], "z2"));
    publisher.add_stream("dummy", "test data").await.unwrap();
    let _p2_link = join(&publisher, "r2").await;

    let watcher = start(&net, config("c1", &[Role::Provider], "z1"));
    let _c1_link = join(&watcher, "r1").await;

    let topology = watcher.topology().clone();
    eventually("dummy to reach z1", move || {
        !topology
            .find_stream_publishers("dummy", Scope::Global, "z1")
            .is_empty()
    })
    .await;

    assert!(matches!(
        watcher.watch_stream("dummy", Scope::Zone).await,
        Err(MeshError::NoSuchTopic(_))
    ));

    let mut sub = watcher.watch_stream("dummy", Scope::Global).await.unwrap();
    assert_eq!(publisher.topics().subscriber_count(), 1);
    assert_eq!(publisher.send_to_topic("dummy", json!({ "seq": 1 })), 1);
    let got = timeout(WAIT, sub.recv()).await.unwrap();
    assert_eq!(got, Some(json!({ "seq": 1 })));

    sub.unsubscribe();
    let topics = publisher.topics().clone();
    eventually("upstream unsubscribe", move || topics.subscriber_count() == 0).await;
    assert_eq!(publisher.send_to_topic("dummy", json!({ "seq": 2 })), 0);
}

#[tokio::test]
async fn test_relay_bridges_zones_for_consumer() {
    let net = MemoryNetwork::new();
    let _r1 = start(&net, config("r1", &[Role::Registry], "z1"));
    let r2 = start(&net, config("r2", &[Role::Registry, Role::Broker], "z2"));

    let publisher = start(&net, config("p1", &[Role::Provider], "z1"));
    publisher.add_stream("dummy", "test data").await.unwrap();
    let _p1_link = join(&publisher, "r1").await;

    let relay = start(&net, config("x1", &[Role::Relay], "z1"));
    let _x1_z1 = join(&relay, "r1").await;
    let _x1_z2 = join(&relay, "r2").await;

    let topology = r2.topology().clone();
    eventually("dummy to reach z2", move || {
        !topology
            .find_stream_publishers("dummy", Scope::Global, "z2")
            .is_empty()
    })
    .await;
    assert_eq!(r2.topology().next_hop("p1").as_deref(), Some("x1"));

    let consumer = Consumer::connect(&net, &url("r2"), None, WAIT).await.unwrap();
    assert!(matches!(
        consumer.watch_stream("dummy", Scope::Zone).await,
        Err(MeshError::NoSuchTopic(_))
    ));

    let mut sub = consumer.watch_stream("dummy", Scope::Global).await.unwrap();
    assert_eq!(publisher.send_to_topic("dummy", json!("tick")), 1);
    assert_eq!(timeout(WAIT, sub.recv()).await.unwrap(), Some(json!("tick")));
    assert_eq!(relay.peers().node_count(), 2);
}

#[tokio::test]
async fn test_publisher_teardown_closes_consumer_stream() {
    let net = MemoryNetwork::new();
    let broker = start(&net, config("r1", &[Role::Registry, Role::Broker], "z1"));
    let publisher = start(&net, config("p1", &[Role::Provider], "z1"));
    publisher.add_stream("dummy", "test data").await.unwrap();
    let _link = join(&publisher, "r1").await;

    let consumer = Consumer::connect(&net, &url("r1"), None, WAIT).await.unwrap();
    let mut sub = consumer.watch_stream("dummy", Scope::Global).await.unwrap();
    assert_eq!(publisher.send_to_topic("dummy", json!(1)), 1);
    assert_eq!(timeout(WAIT, sub.recv()).await.unwrap(), Some(json!(1)));

    publisher.shutdown();
    assert_eq!(timeout(WAIT, sub.recv()).await.unwrap(), None);
    assert!(matches!(sub.close_reason(), Some(MeshError::ConnectionClosed)));
    assert!(sub.is_ended());

    let peers = broker.clone();
    eventually("broker to drop p1", move || !peers.peers().is_connected("p1")).await;
    assert!(!consumer.is_closed());
    assert!(matches!(
        consumer.watch_stream("dummy", Scope::Global).await,
        Err(MeshError::NoSuchTopic(_))
    ));
}

#[tokio::test]
async fn test_consumer_close_fails_outstanding_calls() {
    let net = MemoryNetwork::new();
    let _broker = start(&net, config("r1", &[Role::Registry, Role::Broker], "z1"));
    let provider = start(&net, config("p1", &[Role::Provider], "z1"));
    provider
        .add_service(Arc::new(
            FnService::builder("Slow")
                .command("wait", |_params, _ctx| async move {
                    sleep(Duration::from_secs(60)).await;
                    Ok(Value::Null)
                })
                .build(),
        ))
        .await;
    provider.add_stream("dummy", "test data").await.unwrap();
    let _link = join(&provider, "r1").await;

    let consumer = Arc::new(Consumer::connect(&net, &url("r1"), None, WAIT).await.unwrap());
    let mut sub = consumer.watch_stream("dummy", Scope::Global).await.unwrap();
    assert_eq!(provider.topics().subscriber_count(), 1);

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.service_command("Slow", "wait", Value::Null).await })
        })
        .collect();
    eventually("calls in flight", || consumer.endpoint().pending_count() == 3).await;

    consumer.close();
    for call in calls {
        let result = timeout(WAIT, call).await.unwrap().unwrap();
        assert!(matches!(result, Err(MeshError::ConnectionClosed)));
    }
    assert_eq!(timeout(WAIT, sub.recv()).await.unwrap(), None);

    let topics = provider.topics().clone();
    eventually("provider subscriber released", move || {
        topics.subscriber_count() == 0
    })
    .await;
}

#[tokio::test]
async fn test_bad_mesh_key_is_fatal() {
    let net = MemoryNetwork::new();
    let mut registry_config = config("r1", &[Role::Registry], "z1");
    registry_config.mesh_key = Some("s3cret".into());
    let registry = start(&net, registry_config);

    let mut intruder_config = config("p1", &[Role::Provider], "z1");
    intruder_config.mesh_key = Some("guess".into());
    let intruder = start(&net, intruder_config);

    let conn = intruder.connect_to_registry(&url("r1"));
    let result = timeout(WAIT, conn.connected()).await.unwrap();
    assert!(matches!(result, Err(MeshError::AuthFailed(_))));
    assert!(matches!(conn.failure(), Some(MeshError::AuthFailed(_))));
    assert!(!registry.peers().is_connected("p1"));
}

#[tokio::test]
async fn test_duplicate_node_id_rejected() {
    let net = MemoryNetwork::new();
    let registry = start(&net, config("r1", &[Role::Registry], "z1"));
    let first = start(&net, config("dup", &[Role::Provider], "z1"));
    let _first_link = join(&first, "r1").await;

    let mut twin_config = config("dup", &[Role::Provider], "z1");
    twin_config.listening_url = Some(url("dup-twin"));
    let twin = Node::new(twin_config, Arc::new(net.clone())).unwrap();
    let conn = twin.connect_to_registry(&url("r1"));
    let result = timeout(WAIT, conn.connected()).await.unwrap();
    assert!(matches!(result, Err(MeshError::DuplicateNodeId(_))));

    assert!(matches!(conn.failure(), Some(MeshError::DuplicateNodeId(_))));
    sleep(Duration::from_millis(50)).await;
    assert!(registry.peers().is_connected("dup"));
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_duplicate_node_id_rejected_across_registries() {
    let net = MemoryNetwork::new();
    let r1 = start(&net, config("r1", &[Role::Registry], "z1"));
    let r2 = start(&net, config("r2", &[Role::Registry], "z1"));
    let _peering = join(&r2, "r1").await;

    let first = start(&net, config("dup", &[Role::Provider], "z1"));
    let _first_link = join(&first, "r1").await;
    let topology = r2.topology().clone();
    eventually("dup to reach r2", move || topology.has_node("dup")).await;

    let mut twin_config = config("dup", &[Role::Provider], "z1");
    twin_config.listening_url = Some(url("dup-twin"));
    let twin = Node::new(twin_config, Arc::new(net.clone())).unwrap();
    let conn = twin.connect_to_registry(&url("r2"));
    let result = timeout(WAIT, conn.connected()).await.unwrap();
    assert!(matches!(result, Err(MeshError::DuplicateNodeId(_))));
    assert!(!r2.peers().is_connected("dup"));
    assert_eq!(r2.topology().next_hop("dup").as_deref(), Some("r1"));
    assert!(r1.peers().is_connected("dup"));

    // the same process may still hold links to both registries
    let _second_link = join(&first, "r2").await;
    assert!(r2.peers().is_connected("dup"));
}

#[tokio::test]
async fn test_relay_loop_is_detected() {
    let net = MemoryNetwork::new();
    let a = start(&net, config("a", &[Role::Registry, Role::Relay], "z1"));
    let b = start(&net, config("b", &[Role::Relay], "z1"));
    let _link = join(&b, "a").await;

    // each side believes the other can reach the ghost
    let ghost = NodeTableEntry::from_declaration(
        &NodeConfig::new("ghost", &[Role::Provider], "z1").declaration(),
    );
    for (node, via) in [(&a, "b"), (&b, "a")] {
        node.topology().process_packet(
            TopologyPacket {
                origin_node_id: via.to_string(),
                cmd: TopologyCmd::Add,
                entry: TopologyEntry::Node(ghost.clone()),
            },
            via,
        );
    }

    let path: Vec<String> = ["Mesh", "Providers", "ghost", "NodeID"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let result = a.path_cmd(&path, false, Value::Null).await;
    assert!(matches!(result, Err(MeshError::RoutingLoop(_))));
    assert!(a.peers().stats().relay_errors + b.peers().stats().relay_errors >= 1);
}

#[tokio::test]
async fn test_cross_zone_join_is_redirected() {
    let net = MemoryNetwork::new();
    let r1 = start(&net, config("r1", &[Role::Registry], "z1"));
    let r2 = start(&net, config("r2", &[Role::Registry], "z2"));
    let _r2_link = join(&r2, "r1").await;
    assert_eq!(r1.topology().find_registries_in_zone("z2").len(), 1);

    let provider = start(&net, config("p2", &[Role::Provider], "z2"));
    let _link = join(&provider, "r1").await;
    assert!(provider.peers().is_connected("r2"));
    assert!(!provider.peers().is_connected("r1"));

    // with its zone registry gone the provider falls back to the one it was given
    r2.shutdown();
    let p2 = provider.clone();
    eventually("p2 to rejoin r1", move || p2.peers().is_connected("r1")).await;
    assert!(r1.peers().is_connected("p2"));
}

#[tokio::test]
async fn test_registry_publishes_join_and_leave() {
    let net = MemoryNetwork::new();
    let registry = start(&net, config("r1", &[Role::Registry], "z1"));
    let mut events = registry
        .watch_stream(REGISTRY_UPDATE_TOPIC, Scope::Local)
        .await
        .unwrap();

    let provider = start(&net, config("p1", &[Role::Provider], "z1"));
    let link = join(&provider, "r1").await;
    let joined = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(joined["action"], "register");
    assert_eq!(joined["nodeId"], "p1");

    link.close();
    let left = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(left["action"], "unregister");
    assert_eq!(left["nodeId"], "p1");
    let topology = registry.topology().clone();
    eventually("p1 removed", move || !topology.has_node("p1")).await;
}

#[tokio::test]
async fn test_consumer_authentication() {
    let net = MemoryNetwork::new();
    let mut broker_config = config("b1", &[Role::Broker], "z1");
    broker_config.authenticator_service = Some("Authenticator".into());
    let broker = start(&net, broker_config);
    let users = StaticAuthenticator::new().with_user("alice", "pw", "Alice", &["admins"]);
    broker
        .add_service(Arc::new(AuthenticatorService::new(
            "Authenticator",
            Arc::new(users),
        )))
        .await;

    let anonymous = Consumer::connect(&net, &url("b1"), None, WAIT).await;
    assert!(matches!(anonymous, Err(MeshError::AuthFailed(_))));

    let wrong = Consumer::connect(&net, &url("b1"), Some(AuthRequest::password("alice", "nope")), WAIT).await;
    assert!(matches!(wrong, Err(MeshError::AuthFailed(_))));

    let alice = Consumer::connect(&net, &url("b1"), Some(AuthRequest::password("alice", "pw")), WAIT)
        .await
        .unwrap();
    assert_eq!(alice.user().unwrap().full_name, "Alice");
    assert_eq!(broker.peers().consumer_count(), 1);
}

#[tokio::test]
async fn test_closed_broker_refuses_anonymous_consumers() {
    let net = MemoryNetwork::new();
    let mut closed = config("b1", &[Role::Broker], "z1");
    closed.allow_anonymous_consumers = false;
    let broker = start(&net, closed);

    let refused = Consumer::connect(&net, &url("b1"), None, WAIT).await;
    assert!(matches!(refused, Err(MeshError::AuthFailed(_))));
    assert_eq!(broker.peers().consumer_count(), 0);
}

#[tokio::test]
async fn test_consumer_identity_reaches_provider() {
    let net = MemoryNetwork::new();
    let mut registry_config = config("r1", &[Role::Registry, Role::Broker], "z1");
    registry_config.authenticator_service = Some("Authenticator".into());
    let registry = start(&net, registry_config);
    let users = StaticAuthenticator::new()
        .with_user("alice", "pw", "Alice", &["users"])
        .with_user("bob", "pw", "Bob", &["guests"]);
    registry
        .add_service(Arc::new(AuthenticatorService::new("Authenticator", Arc::new(users))))
        .await;

    let provider = start(&net, config("p1", &[Role::Provider], "z1"));
    provider
        .add_service(Arc::new(
            FnService::builder("Who")
                .command("whoami", |_params, ctx| async move {
                    match &ctx.caller {
                        Caller::Consumer(info) => Ok(json!({
                            "user": info.user_name(),
                            "broker": info.broker,
                        })),
                        other => Err(MeshError::handler(format!("not a consumer: {:?}", other))),
                    }
                })
                .permissions(PermissionSet::new().group("users", Permission::execute()))
                .build(),
        ))
        .await;
    let _provider_link = join(&provider, "r1").await;
    // a second broker that admits anonymous consumers
    let open_broker = start(&net, config("b2", &[Role::Broker], "z1"));
    let _broker_link = join(&open_broker, "r1").await;
    let topology = open_broker.topology().clone();
    eventually("Who to reach b2", move || topology.find_instance_of_service("Who").is_some()).await;

    let alice = Consumer::connect(&net, &url("r1"), Some(AuthRequest::password("alice", "pw")), WAIT)
        .await
        .unwrap();
    let me = alice.service_command("Who", "whoami", Value::Null).await.unwrap();
    assert_eq!(me, json!({ "user": "alice", "broker": "r1" }));
    let by_path = alice
        .path_cmd(&["Mesh", "Services", "Who", "ClientCmds", "whoami"], false, Value::Null)
        .await
        .unwrap();
    assert_eq!(by_path, me);

    let bob = Consumer::connect(&net, &url("r1"), Some(AuthRequest::password("bob", "pw")), WAIT)
        .await
        .unwrap();
    let refused = bob.service_command("Who", "whoami", Value::Null).await;
    assert!(matches!(refused, Err(MeshError::Unauthorized(_))));

    let anonymous = Consumer::connect(&net, &url("b2"), None, WAIT).await.unwrap();
    let refused = anonymous.service_command("Who", "whoami", Value::Null).await;
    assert!(matches!(refused, Err(MeshError::Unauthorized(_))));

    // identity claimed by the consumer itself is not trusted
    let payload = ServiceCommandParams {
        service_name: "Who".into(),
        method: "whoami".into(),
        params: Value::Null,
    };
    let forged = CmdPacket::new(verbs::SERVICE_COMMAND, serde_json::to_value(payload).unwrap()).auth(Some(AuthInfo {
        broker: "r1".into(),
        endpoint_id: "forged".into(),
        user: Some(UserInfo {
            user_name: "alice".into(),
            full_name: "Alice".into(),
            groups: ["users".to_string()].into_iter().collect(),
        }),
    }));
    let refused = anonymous.send_cmd(forged).await;
    assert!(matches!(refused, Err(MeshError::Unauthorized(_))));
}

#[tokio::test]
async fn test_websocket_loopback() {
    let node = Node::new(
        NodeConfig::new("ws1", &[Role::Broker, Role::Provider], "z1"),
        Arc::new(WsConnector),
    )
    .unwrap();
    node.add_service(greeter()).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = NodeServer::new(node.clone());
    let serving = tokio::spawn(async move { server.serve(listener).await });

    let consumer = Consumer::connect(&WsConnector, &format!("ws://{}/", addr), None, WAIT)
        .await
        .unwrap();
    let reply = consumer
        .service_command("Greeter", "showParams", json!(["a", 1]))
        .await
        .unwrap();
    assert_eq!(reply["pathItem"], json!(["a", 1]));
    let cmds = consumer.get_cmds().await.unwrap();
    assert!(cmds.get("Greeter").is_some());

    node.shutdown();
    timeout(WAIT, serving).await.unwrap().unwrap().unwrap();
}
