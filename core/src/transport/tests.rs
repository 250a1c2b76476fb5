use super::*;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::Profile;
use crate::node::WorkerNodes;
use crate::state::State;
use crate::task::TaskPayload;

struct Harness {
    addr: SocketAddr,
    nodes: Arc<WorkerNodes>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    shutdown: CancellationToken,
    serving: tokio::task::JoinHandle<()>,
}

impl Harness {
    async fn start(token: Option<&str>) -> Self {
        let nodes = Arc::new(WorkerNodes::new());
        let (tx, events) = mpsc::unbounded_channel();
        let server = MasterServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&nodes),
            token.map(str::to_string),
            tx,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let serving = tokio::spawn(server.serve(shutdown.clone()));
        Self {
            addr,
            nodes,
            events,
            shutdown,
            serving,
        }
    }

    async fn next_event(&mut self) -> ServerEvent {
        timeout(Duration::from_secs(2), self.events.recv())
            .await
            .expect("event before deadline")
            .expect("event channel open")
    }
}

#[test]
fn test_message_wire_shape() {
    let json = serde_json::to_value(Message::SpawningComplete { user_count: 5 }).unwrap();
    assert_eq!(
        json,
        serde_json::json!({"type": "spawning_complete", "data": {"user_count": 5}})
    );

    let json = serde_json::to_value(Message::Stop).unwrap();
    assert_eq!(json, serde_json::json!({"type": "stop"}));

    let parsed: Message = serde_json::from_str(r#"{"type":"quit"}"#).unwrap();
    assert_eq!(parsed, Message::Quit);
}

#[test]
fn test_spawn_message_roundtrip() {
    let message = Message::Spawn {
        profile: Profile::new(5, 2.0),
        tasks: TaskPayload::new(b"[]".to_vec()),
    };
    let json = serde_json::to_string(&Envelope::new("node-1", message.clone())).unwrap();
    let parsed: Envelope = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.node_id, "node-1");
    assert_eq!(parsed.message, message);
}

#[tokio::test]
async fn test_register_stream_and_sign_out() {
    let mut harness = Harness::start(None).await;
    let client = WorkerClient::new(harness.addr, None, NodeInfo::local("worker-1"));

    client.register().await.unwrap();
    assert_eq!(
        harness.next_event().await,
        ServerEvent::Registered("worker-1".into())
    );
    let node = harness.nodes.get("worker-1").unwrap();
    assert_eq!(node.state(), State::Init);
    assert_eq!(node.info().ip, "127.0.0.1");

    let (mut rx, mut tx) = client.open_stream().await.unwrap();
    tx.send(Message::Spawning).await.unwrap();
    assert_eq!(
        harness.next_event().await,
        ServerEvent::Message(Envelope::new("worker-1", Message::Spawning))
    );

    // Wait for the server to attach the stream before pushing to it.
    for _ in 0..50 {
        if node.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    node.send(Message::Stop).unwrap();
    let received = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, Some(Message::Stop));

    drop(tx);
    drop(rx);
    assert_eq!(
        harness.next_event().await,
        ServerEvent::Disconnected("worker-1".into())
    );

    client.sign_out().await.unwrap();
    assert_eq!(
        harness.next_event().await,
        ServerEvent::SignedOut("worker-1".into())
    );
    assert!(harness.nodes.is_empty());
    harness.shutdown.cancel();
}

#[tokio::test]
async fn test_serve_flushes_queued_messages_before_returning() {
    let mut harness = Harness::start(None).await;
    let client = WorkerClient::new(harness.addr, None, NodeInfo::local("worker-1"));
    client.register().await.unwrap();
    harness.next_event().await;

    let node = harness.nodes.get("worker-1").unwrap();
    let (mut rx, _tx) = client.open_stream().await.unwrap();
    for _ in 0..50 {
        if node.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    node.send(Message::Quit).unwrap();
    harness.shutdown.cancel();
    timeout(Duration::from_secs(5), harness.serving)
        .await
        .expect("serve returns after shutdown")
        .unwrap();

    assert!(!node.is_connected());
    let received = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, Some(Message::Quit));
}

#[tokio::test]
async fn test_invalid_token_rejected() {
    let harness = Harness::start(Some("secret")).await;

    let bad = WorkerClient::new(harness.addr, Some("wrong".into()), NodeInfo::local("w"));
    assert!(matches!(
        bad.register().await,
        Err(crate::SwarmError::Transport(_))
    ));
    assert!(harness.nodes.is_empty());

    let good = WorkerClient::new(harness.addr, Some("secret".into()), NodeInfo::local("w"));
    good.register().await.unwrap();
    assert_eq!(harness.nodes.len(), 1);
    harness.shutdown.cancel();
}

#[tokio::test]
async fn test_stream_for_unknown_node_rejected() {
    let harness = Harness::start(None).await;
    let client = WorkerClient::new(harness.addr, None, NodeInfo::local("ghost"));
    assert!(client.open_stream().await.is_err());
    harness.shutdown.cancel();
}
