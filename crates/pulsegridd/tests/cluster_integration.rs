//! Cluster integration tests.
//!
//! Multi-node scenarios: heartbeats and registry, surveys with slow and
//! silent peers, subscription propagation, publication fan-out, cluster
//! wide disconnects and peer shutdown.
//!
//! Every node runs in-process and shares one memory bus; no sockets.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use pulse_core::{Disconnect, NodeIdentity, PulseConfig};
use pulsegrid_cluster::{Broker, MemoryBus, NotificationEvent, SurveyEvent, SurveyReply};
use pulsegrid_control as control;
use pulsegrid_hub::{
    Client, Command, ConnectReply, Credentials, Handlers, Node, Outbound, PublishReply, Reply,
    Request, SubscribeReply,
};
use pulsegrid_metrics::NoopObserver;

fn handlers(user: &'static str) -> Handlers {
    Handlers::new()
        .on_connecting(Arc::new(move |_| {
            Box::pin(async move {
                Ok(ConnectReply {
                    credentials: Some(Credentials {
                        user: user.into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                })
            })
        }))
        .on_subscribe(Arc::new(|_| Box::pin(async { Ok(SubscribeReply::default()) })))
        .on_publish(Arc::new(|_| Box::pin(async { Ok(PublishReply::default()) })))
}

fn make_node(bus: &MemoryBus, id: &str, user: &'static str) -> Node {
    let node = Node::with_identity(
        NodeIdentity::with_id(id, "pulsegrid", "0.1.0"),
        &PulseConfig::default(),
        Arc::new(bus.broker()),
        Arc::new(NoopObserver),
    )
    .unwrap();
    node.set_handlers(handlers(user));
    node.start().unwrap();
    node
}

/// Exchange one round of heartbeats so every node knows every other.
async fn form_cluster(nodes: &[&Node]) {
    for node in nodes {
        node.coordinator().publish_node_info().unwrap();
    }
    settle().await;
}

/// Let broker deliveries run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

async fn next_reply(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Reply {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame in time")
            .expect("channel open");
        if let Outbound::Reply(reply) = frame {
            return reply;
        }
    }
}

async fn connect(node: &Node) -> (Arc<Client>, mpsc::UnboundedReceiver<Outbound>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = node.connect(tx);
    client
        .dispatch(Command::new(
            1,
            Request::Connect {
                token: String::new(),
                data: vec![],
                name: "it".into(),
                version: "1".into(),
                channels: vec![],
            },
        ))
        .unwrap();
    let reply = next_reply(&mut rx).await;
    assert!(reply.result.is_ok(), "connect failed: {reply:?}");
    (client, rx)
}

async fn subscribe(client: &Arc<Client>, rx: &mut mpsc::UnboundedReceiver<Outbound>, id: u32, channel: &str) {
    client
        .dispatch(Command::new(
            id,
            Request::Subscribe {
                channel: channel.into(),
                token: String::new(),
                data: vec![],
                recover: false,
            },
        ))
        .unwrap();
    let reply = next_reply(rx).await;
    assert!(reply.result.is_ok(), "subscribe failed: {reply:?}");
}

// ── Registry ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn heartbeats_form_the_registry() {
    let bus = MemoryBus::new();
    let a = make_node(&bus, "node-a", "u1");
    let b = make_node(&bus, "node-b", "u2");
    let c = make_node(&bus, "node-c", "u3");
    form_cluster(&[&a, &b, &c]).await;

    let mut peers = a.registry().peer_ids();
    peers.sort();
    assert_eq!(peers, vec!["node-b".to_string(), "node-c".to_string()]);
    assert_eq!(b.registry().cluster_size(), 3);
}

#[tokio::test(start_paused = true)]
async fn peer_shutdown_drops_it_and_its_memberships() {
    let bus = MemoryBus::new();
    let a = make_node(&bus, "node-a", "u1");
    let b = make_node(&bus, "node-b", "u2");
    form_cluster(&[&a, &b]).await;

    let (client, mut rx) = connect(&b).await;
    subscribe(&client, &mut rx, 2, "news").await;
    settle().await;
    assert_eq!(a.hub().num_subscribers("news"), 1);

    b.shutdown();
    settle().await;

    assert!(a.registry().get("node-b").is_none());
    assert_eq!(a.hub().num_subscribers("news"), 0);
}

// ── Surveys ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn survey_returns_answers_that_arrived_before_the_deadline() {
    let bus = MemoryBus::new();
    let a = make_node(&bus, "node-a", "u1");
    let b = make_node(&bus, "node-b", "u2");
    let c = make_node(&bus, "node-c", "u3");

    a.on_survey(Arc::new(|_| Box::pin(async { SurveyReply::ok(b"a".to_vec()) })));
    b.on_survey(Arc::new(|event: SurveyEvent| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            SurveyReply::ok(format!("b:{}", event.op).into_bytes())
        })
    }));
    c.on_survey(Arc::new(|_| Box::pin(std::future::pending())));
    form_cluster(&[&a, &b, &c]).await;

    let started = tokio::time::Instant::now();
    let replies = a
        .coordinator()
        .survey("stats", vec![], Duration::from_millis(200))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(replies.len(), 2);
    assert_eq!(replies["node-a"].data, b"a".to_vec());
    assert_eq!(replies["node-b"].code, 0);
    assert_eq!(replies["node-b"].data, b"b:stats".to_vec());
    assert!(!replies.contains_key("node-c"));
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(250));
}

#[tokio::test(start_paused = true)]
async fn survey_finishes_early_when_everyone_answered() {
    let bus = MemoryBus::new();
    let a = make_node(&bus, "node-a", "u1");
    let b = make_node(&bus, "node-b", "u2");
    for node in [&a, &b] {
        node.on_survey(Arc::new(|_| Box::pin(async { SurveyReply::default() })));
    }
    form_cluster(&[&a, &b]).await;

    let started = tokio::time::Instant::now();
    let replies = a.survey("ping", vec![]).await.unwrap();
    assert_eq!(replies.len(), 2);
    assert!(started.elapsed() < Duration::from_secs(2));
}

// ── Subscriptions ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn subscription_propagates_to_peers() {
    let bus = MemoryBus::new();
    let a = make_node(&bus, "node-a", "u1");
    let b = make_node(&bus, "node-b", "u2");
    form_cluster(&[&a, &b]).await;

    let (client, mut rx) = connect(&a).await;
    subscribe(&client, &mut rx, 2, "news").await;
    settle().await;

    assert_eq!(b.hub().channels(), vec!["news".to_string()]);
    assert!(b.hub().num_subscribers("news") > 0);
}

#[tokio::test(start_paused = true)]
async fn node_ignores_its_own_control_messages() {
    let bus = MemoryBus::new();
    let a = make_node(&bus, "node-a", "u1");
    let b = make_node(&bus, "node-b", "u2");
    form_cluster(&[&a, &b]).await;

    let (client, mut rx) = connect(&a).await;
    subscribe(&client, &mut rx, 2, "news").await;
    settle().await;

    // Only the local connection; the echoed Subscribe was not applied.
    assert_eq!(a.hub().num_subscribers("news"), 1);
    assert!(a.registry().get("node-a").is_none());
}

#[tokio::test(start_paused = true)]
async fn repeated_unsubscribe_is_idempotent() {
    let bus = MemoryBus::new();
    let a = make_node(&bus, "node-a", "u1");
    let b = make_node(&bus, "node-b", "u2");
    let c = make_node(&bus, "node-c", "u3");
    form_cluster(&[&a, &b, &c]).await;

    let (client_a, mut rx_a) = connect(&a).await;
    subscribe(&client_a, &mut rx_a, 2, "news").await;
    let (client_c, mut rx_c) = connect(&c).await;
    subscribe(&client_c, &mut rx_c, 2, "news").await;
    settle().await;
    assert_eq!(b.hub().num_subscribers("news"), 2);

    let message: control::ControlMessage = control::Unsubscribe {
        user: "u1".into(),
        channel: "news".into(),
    }
    .into();
    let envelope = control::encode_envelope("node-a", &message).unwrap();
    let broker = bus.broker();
    for _ in 0..2 {
        broker
            .publish(b.coordinator().control_topic(), Bytes::from(envelope.clone()))
            .unwrap();
        settle().await;
        assert_eq!(b.hub().num_subscribers("news"), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn publication_reaches_subscribers_on_other_nodes() {
    let bus = MemoryBus::new();
    let a = make_node(&bus, "node-a", "u1");
    let b = make_node(&bus, "node-b", "u2");
    form_cluster(&[&a, &b]).await;

    let (reader, mut reader_rx) = connect(&a).await;
    subscribe(&reader, &mut reader_rx, 2, "news").await;

    let (writer, mut writer_rx) = connect(&b).await;
    writer
        .dispatch(Command::new(
            2,
            Request::Publish {
                channel: "news".into(),
                data: b"hello".to_vec(),
            },
        ))
        .unwrap();
    assert!(next_reply(&mut writer_rx).await.result.is_ok());

    let frame = tokio::time::timeout(Duration::from_secs(1), reader_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        frame,
        Outbound::Publication {
            channel: "news".into(),
            data: Bytes::from_static(b"hello"),
        }
    );
}

// ── Disconnects ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn disconnect_user_closes_connections_on_every_node() {
    let bus = MemoryBus::new();
    let a = make_node(&bus, "node-a", "banned");
    let b = make_node(&bus, "node-b", "banned");
    form_cluster(&[&a, &b]).await;

    let (on_a, _rx_a) = connect(&a).await;
    let (on_b, mut rx_b) = connect(&b).await;

    let reason = Disconnect::new(3503, "banned");
    let closed = a.hub().disconnect_user("banned", &[], &reason).unwrap();
    assert_eq!(closed, 1);
    settle().await;

    assert_eq!(on_a.state(), pulsegrid_hub::ConnectionState::Closed);
    assert_eq!(on_b.state(), pulsegrid_hub::ConnectionState::Closed);
    assert_eq!(rx_b.recv().await, Some(Outbound::Disconnect(reason)));
    assert_eq!(b.hub().num_clients(), 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_can_target_single_client() {
    let bus = MemoryBus::new();
    let a = make_node(&bus, "node-a", "u1");
    let b = make_node(&bus, "node-b", "u1");
    form_cluster(&[&a, &b]).await;

    let (first, _rx1) = connect(&b).await;
    let (second, _rx2) = connect(&b).await;

    a.hub()
        .disconnect_user("u1", &[first.id().to_string()], &Disconnect::new(3503, "kick"))
        .unwrap();
    settle().await;

    assert_eq!(first.state(), pulsegrid_hub::ConnectionState::Closed);
    assert_eq!(second.state(), pulsegrid_hub::ConnectionState::Connected);
}

// ── Notifications ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn notification_reaches_peers_only() {
    let bus = MemoryBus::new();
    let a = make_node(&bus, "node-a", "u1");
    let b = make_node(&bus, "node-b", "u2");

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    a.on_notification(Arc::new(move |event: NotificationEvent| {
        let _ = tx_a.send(event.op);
    }));
    b.on_notification(Arc::new(move |event: NotificationEvent| {
        let _ = tx_b.send(event.op);
    }));

    a.notify("reload", b"{}".to_vec()).unwrap();
    settle().await;

    assert_eq!(rx_b.try_recv().unwrap(), "reload");
    assert!(rx_a.try_recv().is_err());
}
