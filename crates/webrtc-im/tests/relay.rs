//! Far-peer negotiation through a minimal forwarding relay.

use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use webrtc_im::config::RelayConfig;
use webrtc_im::relay::*;
use webrtc_im::{
    ChannelPayload, ConnectionEvent, ConnectionManager, ConnectionMode, DeviceClass,
    LocalityClassifier, Locality, MockNetwork, PeerId, RelayCarrier, StaticIdentityResolver,
    Subscription,
};

const TIMEOUT: Duration = Duration::from_secs(2);

type Clients = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>>;

fn frame(event: &str, seq: Option<u64>, payload: serde_json::Value) -> Message {
    let frame = RelayFrame {
        event: event.to_string(),
        seq,
        payload,
    };
    Message::Text(serde_json::to_string(&frame).unwrap())
}

fn forward_event(event: &str) -> Option<&'static str> {
    match event {
        EVENT_SEND_OFFER => Some(EVENT_FORWARD_OFFER),
        EVENT_SEND_ANSWER => Some(EVENT_FORWARD_ANSWER),
        EVENT_SEND_ICE => Some(EVENT_FORWARD_ICE),
        EVENT_SEND_MESSAGE => Some(EVENT_FORWARD_MESSAGE),
        _ => None,
    }
}

/// Relay that forwards every request to its `target`, acking with 0
async fn forwarding_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let clients: Clients = Arc::new(Mutex::new(HashMap::new()));

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let clients = clients.clone();
            tokio::spawn(async move {
                let ws = accept_async(stream).await.unwrap();
                let (mut write, mut read) = ws.split();
                let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
                tokio::spawn(async move {
                    while let Some(msg) = rx.recv().await {
                        if write.send(msg).await.is_err() {
                            break;
                        }
                    }
                });

                while let Some(Ok(Message::Text(text))) = read.next().await {
                    let request: RelayFrame = serde_json::from_str(&text).unwrap();
                    if request.event == EVENT_JOIN_ROOM {
                        let id = request.payload["id"].as_str().unwrap().to_string();
                        clients.lock().await.insert(id, tx.clone());
                    } else if let Some(event) = forward_event(&request.event) {
                        let target = request.payload["target"].as_str().unwrap_or_default();
                        if let Some(peer) = clients.lock().await.get(target) {
                            let _ = peer.send(frame(event, None, request.payload.clone()));
                        }
                    }
                    let _ = tx.send(frame(EVENT_ACK, request.seq, json!({"code": 0})));
                }
            });
        }
    });

    format!("ws://{}", addr)
}

async fn far_endpoint(
    url: &str,
    id: &str,
    network: &MockNetwork,
) -> (ConnectionManager, Subscription<ConnectionEvent>) {
    let config = RelayConfig {
        url: Some(url.to_string()),
        token: Some("test".to_string()),
        ack_timeout_ms: 1000,
    };
    let relay = RelayCarrier::connect(&config, id.into(), DeviceClass::Desktop)
        .await
        .unwrap();
    let classifier = LocalityClassifier::new(vec![Arc::new(StaticIdentityResolver::new(
        "198.51.100.1",
    ))]);
    let manager = ConnectionManager::builder(id.into(), Arc::new(network.factory()))
        .far(Arc::new(relay))
        .classifier(Arc::new(classifier))
        .build();
    let events = manager.subscribe();
    (manager, events)
}

async fn next_message(events: &mut Subscription<ConnectionEvent>) -> (PeerId, ChannelPayload) {
    loop {
        let event = events
            .recv_timeout(TIMEOUT)
            .await
            .expect("timed out waiting for message");
        if let ConnectionEvent::Message { from, payload } = event {
            return (from, payload);
        }
    }
}

#[tokio::test]
async fn test_far_webrtc_over_relay() {
    let url = forwarding_relay().await;
    let network = MockNetwork::new();
    let (a, _a_events) = far_endpoint(&url, "alice", &network).await;
    let (b, mut b_events) = far_endpoint(&url, "bob", &network).await;

    let mode = a.connect(&"bob".into(), Locality::Far).await.unwrap();
    assert_eq!(mode, ConnectionMode::FarWebrtc);

    tokio::time::timeout(TIMEOUT, a.wait_ready()).await.unwrap().unwrap();
    tokio::time::timeout(TIMEOUT, b.wait_ready()).await.unwrap().unwrap();
    assert_eq!(b.active_mode().await, Some(ConnectionMode::FarWebrtc));

    a.send_text("across the internet").await.unwrap();
    let (from, payload) = next_message(&mut b_events).await;
    assert_eq!(from.as_str(), "alice");
    assert_eq!(payload, ChannelPayload::Text("across the internet".to_string()));

    // Both sides trickle one candidate through the relay
    let trickled = async {
        while !network
            .connections()
            .iter()
            .all(|c| c.added_candidates().len() == 1)
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(TIMEOUT, trickled).await.unwrap();
}

#[tokio::test]
async fn test_relay_fallback_text() {
    let url = forwarding_relay().await;
    let network = MockNetwork::new();
    let (a, _a_events) = far_endpoint(&url, "alice", &network).await;
    let (b, mut b_events) = far_endpoint(&url, "bob", &network).await;

    // No broadcast carrier, so a near hint cannot negotiate
    assert_eq!(
        a.connect(&"bob".into(), Locality::Near).await.unwrap(),
        ConnectionMode::RelayFallback
    );
    b.connect(&"alice".into(), Locality::Near).await.unwrap();

    a.send_text("via relay").await.unwrap();
    let (from, payload) = next_message(&mut b_events).await;
    assert_eq!(from.as_str(), "alice");
    assert_eq!(payload, ChannelPayload::Text("via relay".to_string()));
    assert!(network.connections().is_empty());

    a.shutdown().await;
    assert!(matches!(
        a.send_text("closed").await,
        Err(webrtc_im::ConnectionError::NoActiveSession)
    ));
}
