//! End-to-end tests for a link session: negotiation over a hand-rolled relay,
//! then RPC over the resulting tube.
//!
//! Everything runs in-process on the mock network.

use peerpouch_types::config::TransportConfig;
use peerpouch_wire::transport::PeerConnectionFactory;
use peerpouch_wire::{
    Function, LinkEvent, LinkOptions, LinkRole, LinkState, MockNetwork, PeerLink, RpcHandler,
    RpcValue, Tube,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Pump a link's events: relay signals into `peer`, hand over the tube.
fn pump(
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    peer: PeerLink,
) -> oneshot::Receiver<Tube> {
    let (tube_tx, tube_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut tube_tx = Some(tube_tx);
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Signal(payload) => peer.receive_signal(&payload.to_value()).await,
                LinkEvent::Connected(tube) => {
                    if let Some(tx) = tube_tx.take() {
                        let _ = tx.send(tube);
                    }
                }
                LinkEvent::Closed => break,
            }
        }
    });
    tube_rx
}

async fn connected_links() -> (PeerLink, Tube, PeerLink, Tube) {
    let network = MockNetwork::new();
    let config = TransportConfig::default();
    let (client, client_events) = PeerLink::open(
        network.create(&config).await.unwrap(),
        LinkOptions {
            role: LinkRole::Initiator,
            local_id: "peer-1".into(),
            peer_id: "share-1".into(),
            label: config.channel_label.clone(),
        },
    )
    .await
    .unwrap();
    let (server, server_events) = PeerLink::open(
        network.create(&config).await.unwrap(),
        LinkOptions {
            role: LinkRole::Responder,
            local_id: "share-1".into(),
            peer_id: "peer-1".into(),
            label: config.channel_label.clone(),
        },
    )
    .await
    .unwrap();

    let client_tube = pump(client_events, server.clone());
    let server_tube = pump(server_events, client.clone());
    let timeout = Duration::from_secs(2);
    let client_tube = tokio::time::timeout(timeout, client_tube)
        .await
        .expect("client never connected")
        .unwrap();
    let server_tube = tokio::time::timeout(timeout, server_tube)
        .await
        .expect("server never connected")
        .unwrap();
    (client, client_tube, server, server_tube)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_links_connect_through_relay() {
    let (client, _ct, server, _st) = connected_links().await;
    assert_eq!(client.state(), LinkState::Connected);
    assert_eq!(server.state(), LinkState::Connected);
    assert_eq!(client.role(), LinkRole::Initiator);
    assert_eq!(server.peer_id(), "peer-1");
}

#[tokio::test]
async fn test_bootstrap_exposes_api_to_client() {
    let (_client, client_tube, _server, server_tube) = connected_links().await;

    // Server side: one kept "echo" method taking (value, callback).
    let server_rpc = RpcHandler::new(server_tube);
    let echo = Function::kept(|mut args| {
        let cb = args.pop();
        let value = args.pop().unwrap_or_default();
        if let Some(RpcValue::Function(cb)) = cb {
            cb.call(vec![RpcValue::Null, value])?;
        }
        Ok(())
    });

    // Client side: wait for the bootstrap to learn the api.
    let (api_tx, mut api_rx) = mpsc::unbounded_channel();
    let _client_rpc = RpcHandler::with_bootstrap(client_tube, move |args| {
        let _ = api_tx.send(args);
    });

    server_rpc
        .bootstrap(vec![RpcValue::object([(
            "api",
            RpcValue::object([("echo", RpcValue::Function(echo))]),
        )])])
        .unwrap();

    let args = tokio::time::timeout(Duration::from_secs(2), api_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let echo = args[0]
        .get("api")
        .and_then(|api| api.get("echo"))
        .and_then(RpcValue::as_function)
        .cloned()
        .expect("api.echo should be a function");

    for word in ["one", "two"] {
        let (reply_tx, reply_rx) = oneshot::channel();
        let reply_tx = std::sync::Mutex::new(Some(reply_tx));
        let cb = Function::new(move |args| {
            if let Some(tx) = reply_tx.lock().unwrap().take() {
                let _ = tx.send(args[1].to_json());
            }
            Ok(())
        });
        echo.call(vec![RpcValue::from(word), RpcValue::Function(cb)])
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), reply_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, serde_json::json!(word));
    }
}

#[tokio::test]
async fn test_closing_client_closes_server() {
    let (client, _ct, server, _st) = connected_links().await;
    client.close().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while server.state() != LinkState::Closed {
        assert!(tokio::time::Instant::now() < deadline, "server never closed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
