//! End-to-end tests over real sockets on the loopback interface.

use std::sync::Arc;
use std::time::Duration;

use messenger_network::node::{MessengerNode, PeerEvent};
use messenger_network::reconnect::{ReconnectEvent, ReconnectPolicy, MAX_ATTEMPTS};
use messenger_network::NetworkError;
use messenger_types::PeerId;
use tokio::sync::mpsc;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

async fn next_event(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> PeerEvent {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a peer event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_end_to_end_hello_world() {
    let (listener, mut listener_events) = MessengerNode::new("listener").unwrap();
    let (client, mut client_events) = MessengerNode::new("client").unwrap();

    let port = listener.listen(0).await.unwrap();
    let listener_peer = client.connect("127.0.0.1", port).await.unwrap();
    assert_eq!(&listener_peer, listener.local_id());

    // Both sides report the connection.
    let client_seen = match next_event(&mut listener_events).await {
        PeerEvent::Connected(summary) => summary.id,
        other => panic!("expected Connected, got {:?}", other),
    };
    assert_eq!(&client_seen, client.local_id());
    assert!(matches!(
        next_event(&mut client_events).await,
        PeerEvent::Connected(_)
    ));

    // A broadcast from the client lands on the listener, decrypted and
    // attributed.
    assert_eq!(client.broadcast("hello world").await, 1);
    match next_event(&mut listener_events).await {
        PeerEvent::MessageReceived { peer_id, message } => {
            assert_eq!(&peer_id, client.local_id());
            assert_eq!(message.content(), Some("hello world"));
            assert_eq!(message.sender, "client");
            assert!(message.signature.is_some());
        }
        other => panic!("expected MessageReceived, got {:?}", other),
    }

    // The same message is also on the listener's incoming queue.
    let queued = listener.queue().try_dequeue_incoming().unwrap();
    assert_eq!(queued.content(), Some("hello world"));

    // Disconnecting the client surfaces on the listener within the timeout.
    client.disconnect(&listener_peer).await;
    assert!(matches!(
        next_event(&mut client_events).await,
        PeerEvent::Disconnected(_)
    ));
    match next_event(&mut listener_events).await {
        PeerEvent::Disconnected(summary) => assert_eq!(&summary.id, client.local_id()),
        other => panic!("expected Disconnected, got {:?}", other),
    }
    assert_eq!(listener.connected_count().await, 0);
}

#[tokio::test]
async fn test_direct_send_reaches_only_the_addressed_peer() {
    let (server, mut server_events) = MessengerNode::new("server").unwrap();
    let (client, mut client_events) = MessengerNode::new("client").unwrap();

    let port = server.listen(0).await.unwrap();
    client.connect("127.0.0.1", port).await.unwrap();

    let client_id = match next_event(&mut server_events).await {
        PeerEvent::Connected(summary) => summary.id,
        other => panic!("expected Connected, got {:?}", other),
    };

    server.send_to(&client_id, "just for you").await.unwrap();
    loop {
        match next_event(&mut client_events).await {
            PeerEvent::MessageReceived { message, .. } => {
                assert_eq!(message.content(), Some("just for you"));
                break;
            }
            PeerEvent::Connected(_) => continue,
            other => panic!("expected MessageReceived, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_broadcast_reaches_every_connected_peer() {
    let (hub, mut hub_events) = MessengerNode::new("hub").unwrap();
    let port = hub.listen(0).await.unwrap();

    const PEERS: usize = 20;
    let mut clients = Vec::new();
    for i in 0..PEERS {
        let (client, events) = MessengerNode::new(format!("client-{}", i)).unwrap();
        client.connect("127.0.0.1", port).await.unwrap();
        clients.push((client, events));
    }

    // Wait until the hub has registered all of them.
    for _ in 0..PEERS {
        assert!(matches!(
            next_event(&mut hub_events).await,
            PeerEvent::Connected(_)
        ));
    }
    assert_eq!(hub.connected_count().await, PEERS);

    assert_eq!(hub.broadcast("fan out").await, PEERS);

    for (_, events) in &mut clients {
        loop {
            match next_event(events).await {
                PeerEvent::MessageReceived { message, .. } => {
                    assert_eq!(message.content(), Some("fan out"));
                    assert_eq!(message.sender, "hub");
                    break;
                }
                PeerEvent::Connected(_) => continue,
                other => panic!("expected MessageReceived, got {:?}", other),
            }
        }
    }
}

#[tokio::test]
async fn test_concurrent_disconnects_fire_one_event() {
    let (server, mut server_events) = MessengerNode::new("server").unwrap();
    let (client, _client_events) = MessengerNode::new("client").unwrap();

    let port = server.listen(0).await.unwrap();
    client.connect("127.0.0.1", port).await.unwrap();

    let peer_id = match next_event(&mut server_events).await {
        PeerEvent::Connected(summary) => summary.id,
        other => panic!("expected Connected, got {:?}", other),
    };

    // Many racing disconnect paths for the same peer.
    let mut racers = Vec::new();
    for _ in 0..8 {
        let server = server.clone();
        let peer_id = peer_id.clone();
        racers.push(tokio::spawn(async move { server.disconnect(&peer_id).await }));
    }
    let mut winners = 0;
    for racer in racers {
        if racer.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    // Allow any stray cleanup to land, then count disconnect events.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut disconnects = 0;
    while let Ok(event) = server_events.try_recv() {
        if matches!(event, PeerEvent::Disconnected(_)) {
            disconnects += 1;
        }
    }
    assert_eq!(disconnects, 1);
}

#[tokio::test]
async fn test_reconnect_succeeds_and_resets_counter() {
    let (server, _server_events) = MessengerNode::new("server").unwrap();
    let (client, _client_events) = MessengerNode::new("client").unwrap();
    let port = server.listen(0).await.unwrap();

    // The address book knows the server under some prior identity.
    let stale_id = PeerId::from("stale001");
    client.register_discovered_peer(stale_id.clone(), "127.0.0.1".to_string(), port);

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let policy = ReconnectPolicy::new(event_tx);

    assert!(policy.try_reconnect(&client, &stale_id).await);
    assert_eq!(policy.attempt_count(&stale_id), 0, "success clears the counter");

    assert_eq!(events.recv().await, Some(ReconnectEvent::Attempt(stale_id.clone(), 1)));
    assert_eq!(events.recv().await, Some(ReconnectEvent::Success(stale_id)));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_exhaustion_fires_failed() {
    let (client, _client_events) = MessengerNode::new("client").unwrap();

    // A port with nothing behind it; every attempt fails.
    let unreachable = PeerId::from("gone0001");
    client.register_discovered_peer(unreachable.clone(), "127.0.0.1".to_string(), 1);

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let policy = ReconnectPolicy::new(event_tx);

    assert!(!policy.try_reconnect(&client, &unreachable).await);
    assert_eq!(policy.attempt_count(&unreachable), MAX_ATTEMPTS);

    let mut attempts = 0;
    let mut failed = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            ReconnectEvent::Attempt(_, n) => {
                attempts += 1;
                assert_eq!(n, attempts);
            }
            ReconnectEvent::Failed(_) => failed += 1,
            ReconnectEvent::Success(_) => panic!("reconnect cannot succeed"),
        }
    }
    assert_eq!(attempts, MAX_ATTEMPTS);
    assert_eq!(failed, 1);
}

#[tokio::test]
async fn test_reconnect_sequences_do_not_interleave() {
    let (client, _client_events) = MessengerNode::new("client").unwrap();
    let peer = PeerId::from("gone0002");
    client.register_discovered_peer(peer.clone(), "127.0.0.1".to_string(), 1);

    let (event_tx, _events) = mpsc::unbounded_channel();
    let policy = Arc::new(ReconnectPolicy::new(event_tx));

    let first = {
        let policy = Arc::clone(&policy);
        let client = client.clone();
        let peer = peer.clone();
        tokio::spawn(async move { policy.try_reconnect(&client, &peer).await })
    };
    // Give the first sequence time to claim the in-flight slot.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The competing call must bail out immediately instead of interleaving.
    let started = std::time::Instant::now();
    assert!(!policy.try_reconnect(&client, &peer).await);
    assert!(started.elapsed() < Duration::from_millis(500));

    first.abort();
}

#[tokio::test]
async fn test_shutdown_closes_queues_and_peers() {
    let (server, _server_events) = MessengerNode::new("server").unwrap();
    let (client, mut client_events) = MessengerNode::new("client").unwrap();

    let port = server.listen(0).await.unwrap();
    client.connect("127.0.0.1", port).await.unwrap();
    assert!(matches!(
        next_event(&mut client_events).await,
        PeerEvent::Connected(_)
    ));

    server.shutdown().await;

    // The client notices the dropped connection.
    loop {
        if matches!(next_event(&mut client_events).await, PeerEvent::Disconnected(_)) {
            break;
        }
    }

    // Enqueueing into the shut-down node fails loudly.
    let err = server
        .queue()
        .enqueue_outgoing(messenger_types::Message::plain("server", "late"))
        .unwrap_err();
    assert!(matches!(err, NetworkError::QueueClosed));

    // New outbound work is refused.
    assert!(matches!(
        server.connect("127.0.0.1", port).await,
        Err(NetworkError::Shutdown)
    ));
}
