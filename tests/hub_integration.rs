//! Hub integration tests
//!
//! Exercise the registry, heartbeat monitor, broadcast router and presence
//! behavior together, without standing up a server or real sockets. The
//! transport side of every connection is a plain channel receiver, and time
//! is driven by a manual clock so eviction is deterministic.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio_test::assert_ok;

use studio_hub::config::HubConfig;
use studio_hub::hub::{
    BroadcastRouter, ConnectionHandle, ConnectionRegistry, EventPublisher, HeartbeatMonitor,
    ManualClock, Outbound, SubscriptionManager,
};
use studio_hub::ws::message::{Envelope, MessageKind, CAPABILITIES};
use studio_hub::ws::session::{finalize_disconnect, Session, SessionState};

struct TestHub {
    clock: Arc<ManualClock>,
    registry: Arc<ConnectionRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    router: Arc<BroadcastRouter>,
    publisher: Arc<EventPublisher>,
}

fn create_hub() -> TestHub {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
    ));
    let registry = Arc::new(ConnectionRegistry::new(clock.clone()));
    let subscriptions = Arc::new(SubscriptionManager::new());
    let router = Arc::new(BroadcastRouter::new(registry.clone(), subscriptions.clone()));
    let publisher = Arc::new(EventPublisher::new(
        registry.clone(),
        subscriptions.clone(),
        router.clone(),
    ));

    TestHub {
        clock,
        registry,
        subscriptions,
        router,
        publisher,
    }
}

fn connect(hub: &TestHub, user_id: &str) -> (Arc<ConnectionHandle>, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(16);
    let connection = Arc::new(ConnectionHandle::new(user_id, tx, hub.registry.now()));
    assert_ok!(hub.registry.register(connection.clone()));
    (connection, rx)
}

fn expect_envelope(outbound: Outbound) -> Envelope {
    match outbound {
        Outbound::Envelope(envelope) => envelope,
        other => panic!("expected envelope, got {:?}", other),
    }
}

// =============================================================================
// Registry consistency
// =============================================================================

#[test]
fn registry_and_user_index_stay_consistent() {
    let hub = create_hub();
    let (a1, _rx1) = connect(&hub, "alice");
    let (a2, _rx2) = connect(&hub, "alice");
    let (b1, _rx3) = connect(&hub, "bob");

    // Present in primary map iff present in the user index
    for connection in hub.registry.all() {
        assert!(hub
            .registry
            .connections_for_user(&connection.user_id)
            .iter()
            .any(|c| c.id == connection.id));
    }

    hub.registry.unregister(a1.id).unwrap();
    assert!(hub.registry.get(a1.id).is_none());
    assert!(!hub
        .registry
        .connections_for_user("alice")
        .iter()
        .any(|c| c.id == a1.id));

    hub.registry.unregister(b1.id).unwrap();
    hub.registry.unregister(a2.id).unwrap();

    let stats = hub.registry.stats();
    assert_eq!(stats.connection_count, 0);
    assert_eq!(stats.user_count, 0);
}

// =============================================================================
// Heartbeat eviction
// =============================================================================

#[tokio::test]
async fn silent_connection_is_evicted_on_next_sweep() {
    let hub = create_hub();
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let monitor = HeartbeatMonitor::new(
        HubConfig {
            sweep_interval: 30,
            idle_timeout: 60,
        },
        hub.registry.clone(),
        shutdown_rx,
    );

    let (silent, mut silent_rx) = connect(&hub, "alice");
    let (pinger, _pinger_rx) = connect(&hub, "bob");

    // Within the window: nobody is touched
    hub.clock.advance(Duration::seconds(45));
    assert_eq!(monitor.sweep().await, 0);

    // bob pings, alice stays quiet past the 60s threshold
    hub.registry.mark_alive(pinger.id);
    hub.clock.advance(Duration::seconds(30));
    assert_eq!(monitor.sweep().await, 1);

    match silent_rx.try_recv().unwrap() {
        Outbound::Close { code, reason } => {
            assert_eq!(code, 1000);
            assert_eq!(reason, "heartbeat timeout");
        }
        other => panic!("expected close command, got {:?}", other),
    }

    // The close command flows into the shared teardown path
    finalize_disconnect(&hub.registry, &hub.subscriptions, &hub.router, silent.id).await;
    assert!(hub.registry.get(silent.id).is_none());
    assert_eq!(hub.registry.stats().connection_count, 1);
}

// =============================================================================
// Channel isolation
// =============================================================================

#[tokio::test]
async fn publish_to_channel_only_reaches_subscribers() {
    let hub = create_hub();
    let (subscriber, mut subscriber_rx) = connect(&hub, "alice");
    let (_bystander, mut bystander_rx) = connect(&hub, "bob");

    hub.subscriptions.subscribe(subscriber.id, "generation:1");

    let report = hub
        .publisher
        .publish_to_channel(
            "generation:1",
            MessageKind::GenerationProgress,
            json!({"progress": 25}),
        )
        .await;

    assert_eq!(report.delivered, 1);
    let envelope = expect_envelope(subscriber_rx.try_recv().unwrap());
    assert_eq!(envelope.kind, MessageKind::GenerationProgress);
    assert!(bystander_rx.try_recv().is_err());
}

#[tokio::test]
async fn publish_to_channel_delivers_payload_exactly_once() {
    let hub = create_hub();
    let (subscriber, mut rx) = connect(&hub, "u1");
    hub.subscriptions.subscribe(subscriber.id, "generation:42");

    hub.publisher
        .publish_to_channel(
            "generation:42",
            MessageKind::GenerationProgress,
            json!({"progress": 50}),
        )
        .await;

    let envelope = expect_envelope(rx.try_recv().unwrap());
    assert_eq!(envelope.kind, MessageKind::GenerationProgress);
    assert_eq!(envelope.data["progress"], 50);
    assert!(rx.try_recv().is_err());
}

// =============================================================================
// Presence
// =============================================================================

#[tokio::test]
async fn only_last_connection_triggers_offline_broadcast() {
    let hub = create_hub();
    let (first, _rx1) = connect(&hub, "alice");
    let (second, _rx2) = connect(&hub, "alice");
    let (_observer, mut observer_rx) = connect(&hub, "bob");

    // First disconnect: alice still has a live connection, no broadcast
    finalize_disconnect(&hub.registry, &hub.subscriptions, &hub.router, first.id).await;
    assert_eq!(hub.registry.connections_for_user("alice").len(), 1);
    assert!(observer_rx.try_recv().is_err());

    // Second disconnect: exactly one offline broadcast
    finalize_disconnect(&hub.registry, &hub.subscriptions, &hub.router, second.id).await;
    let envelope = expect_envelope(observer_rx.try_recv().unwrap());
    assert_eq!(envelope.kind, MessageKind::UserPresence);
    assert_eq!(envelope.user_id, "alice");
    assert_eq!(envelope.data["status"], "offline");
    assert!(observer_rx.try_recv().is_err());
}

#[tokio::test]
async fn teardown_clears_subscriptions_with_registration() {
    let hub = create_hub();
    let (connection, _rx) = connect(&hub, "alice");
    hub.subscriptions.subscribe(connection.id, "generation:3");

    finalize_disconnect(
        &hub.registry,
        &hub.subscriptions,
        &hub.router,
        connection.id,
    )
    .await;

    assert!(hub.subscriptions.subscribers_of("generation:3").is_empty());
    assert!(hub.subscriptions.channels_of(connection.id).is_empty());
}

#[tokio::test]
async fn to_all_except_never_echoes_to_excluded_user() {
    let hub = create_hub();
    let (_own1, mut own_rx1) = connect(&hub, "alice");
    let (_own2, mut own_rx2) = connect(&hub, "alice");
    let (_other, mut other_rx) = connect(&hub, "bob");

    let envelope = Envelope::from_user(
        MessageKind::UserPresence,
        "alice",
        json!({"status": "online"}),
        hub.registry.now(),
    );
    let report = hub.router.to_all_except(envelope, Some("alice")).await;

    assert_eq!(report.delivered, 1);
    assert!(own_rx1.try_recv().is_err());
    assert!(own_rx2.try_recv().is_err());
    assert!(other_rx.try_recv().is_ok());
}

// =============================================================================
// Handshake
// =============================================================================

#[tokio::test]
async fn tokenless_connect_is_acked_with_capabilities() {
    let hub = create_hub();
    let mut session = Session::new(
        hub.registry.clone(),
        hub.subscriptions.clone(),
        hub.router.clone(),
    );
    session.authenticated();

    let (tx, _rx) = mpsc::channel(16);
    let connection = Arc::new(ConnectionHandle::new("u1", tx, hub.registry.now()));
    let connection_id = connection.id;

    let ack = session.activate(connection).unwrap();

    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(ack.kind, MessageKind::ConnectionAck);
    assert_eq!(ack.data["connectionId"], json!(connection_id));
    assert_eq!(
        ack.data["capabilities"],
        json!(["generation_progress", "gallery_update", "notification", "user_presence"])
    );
    assert_eq!(
        CAPABILITIES.len(),
        ack.data["capabilities"].as_array().unwrap().len()
    );
    assert!(hub.registry.get(connection_id).is_some());
}
