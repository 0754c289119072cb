//! End-to-end acceptance scenarios
//!
//! Each test drives a full resilience system through one field scenario:
//! 1. Clean traffic raises a channel to `active` with a high score
//! 2. A flapping peer is quarantined, then admitted on probation
//! 3. Widespread failure trips emergency mode
//! 4. The layer join rule picks the least-ready layer
//! 5. Critical memory pressure sheds idle channels only

use crate::test_utils::{test_config, wait_until, Harness};
use bytes::Bytes;
use lifeline_core::Layer;
use lifeline_edge::MemoryPressure;
use lifeline_mesh::{ChannelState, FailureReason, LayerState, TransportEvent};
use lifeline_runtime::{ConnectOutcome, SendOutcome};
use std::time::Duration;

#[tokio::test]
async fn test_clean_exchanges_activate_channel() {
    let harness = Harness::start(test_config());
    harness.transport.set_latency("peer-a", 20.0);
    let payload = Bytes::from(vec![7u8; 4096]);

    for _ in 0..10 {
        let results = harness
            .system
            .send(payload.clone(), &["peer-a".to_string()], false)
            .await
            .unwrap();
        assert!(results[0].1.is_delivered(), "send failed: {:?}", results[0].1);
        harness.clock.advance(100);
    }

    let channel = harness.system.pool().channel("peer-a").await.unwrap().unwrap();
    assert_eq!(channel.state, ChannelState::Active);
    assert!((channel.metrics.reliability - 1.0).abs() < 1e-9);
    assert!(channel.quality_score >= 0.9, "score {}", channel.quality_score);
    assert_eq!(channel.metrics.error_rate, 0.0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_rapid_disconnects_quarantine_peer() {
    let harness = Harness::start(test_config());
    let system = &harness.system;
    let peer = "peer-b".to_string();

    system
        .handle_transport_event(TransportEvent::PeerConnected {
            peer_id: peer.clone(),
        })
        .await
        .unwrap();
    for _ in 0..5 {
        harness.clock.advance(1_000);
        system
            .handle_transport_event(TransportEvent::PeerDisconnected {
                peer_id: peer.clone(),
                reason: "link lost".to_string(),
            })
            .await
            .unwrap();
    }
    // Fifth disconnect at t = 6000
    let quarantined_at = 6_000;
    let duration = 30_000;

    wait_until("quarantine to reach the pool", || async move {
        system
            .pool()
            .channel("peer-b")
            .await
            .unwrap()
            .and_then(|c| c.quarantined_until)
            .is_some()
    })
    .await;
    let channel = system.pool().channel("peer-b").await.unwrap().unwrap();
    assert_eq!(channel.quarantined_until, Some(quarantined_at + duration));
    assert_eq!(channel.state, ChannelState::Failed);

    // Halfway through the quarantine
    harness.clock.set(quarantined_at + duration / 2);
    let outcome = system.connect("peer-b").await.unwrap();
    assert!(matches!(outcome, ConnectOutcome::Rejected { .. }), "{outcome:?}");
    system
        .handle_transport_event(TransportEvent::PeerConnected {
            peer_id: peer.clone(),
        })
        .await
        .unwrap();
    let channel = system.pool().channel("peer-b").await.unwrap().unwrap();
    assert_eq!(channel.state, ChannelState::Failed);

    // Just after expiry: admitted into recovery, once per probe interval
    harness.clock.set(quarantined_at + duration + 1);
    let outcome = system.connect("peer-b").await.unwrap();
    assert_eq!(
        outcome,
        ConnectOutcome::Connected {
            state: ChannelState::Recovering
        }
    );
    let again = system.connect("peer-b").await.unwrap();
    assert!(matches!(again, ConnectOutcome::Deferred { .. }), "{again:?}");
    harness.shutdown().await;
}

#[tokio::test]
async fn test_widespread_failure_enters_emergency_mode() {
    let harness = Harness::start(test_config());
    let pool = harness.system.pool();

    for i in 0..1_000 {
        pool.acquire(&format!("peer-{i:04}")).await.unwrap();
    }
    for i in 0..200 {
        pool.report_failure(&format!("peer-{i:04}"), FailureReason::ChecksumMismatch)
            .await
            .unwrap();
    }
    let report = harness.system.get_system_status_report().await.unwrap();
    assert!(!report.emergency_mode);

    for i in 200..300 {
        pool.report_failure(&format!("peer-{i:04}"), FailureReason::ChecksumMismatch)
            .await
            .unwrap();
    }
    let report = harness.system.get_system_status_report().await.unwrap();
    assert!(report.emergency_mode);
    assert_eq!(report.per_channel_health.len(), 1_000);
    let failed = report
        .per_channel_health
        .iter()
        .filter(|c| c.state == ChannelState::Failed)
        .count();
    assert_eq!(failed, 300);

    let diagnostics = harness.system.perform_diagnostics().await.unwrap();
    assert!(!diagnostics.is_healthy());
    assert!(diagnostics.issues.iter().any(|i| i.contains("emergency mode")));

    let recovery = harness.system.perform_emergency_recovery().await.unwrap();
    assert_eq!(recovery.evicted_channels, 1_000);
    let report = harness.system.get_system_status_report().await.unwrap();
    assert!(!report.emergency_mode);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_layer_join_takes_least_ready_layer() {
    let mut config = test_config();
    // Keep the router from overwriting the mesh report during the test
    config.pool.tick_interval_ms = 600_000;
    let harness = Harness::start(config);
    let system = &harness.system;
    let mut subscription = system.subscribe().await.unwrap();

    // Let the router's startup mesh report land first
    tokio::time::sleep(Duration::from_millis(100)).await;
    system
        .report_layer_state(Layer::Physical, LayerState::Connecting, 2)
        .await
        .unwrap();
    system
        .report_layer_state(Layer::Mesh, LayerState::Connecting, 2)
        .await
        .unwrap();
    system
        .report_layer_state(Layer::Application, LayerState::Ready, 1)
        .await
        .unwrap();
    let layers = system.perform_diagnostics().await.unwrap().layers;
    assert!(layers
        .iter()
        .any(|l| l.layer == Layer::Application && l.effective_state == LayerState::Ready));
    assert_eq!(system.current_state(), LayerState::Disconnected);

    harness.clock.advance(5_001);
    let change = tokio::time::timeout(Duration::from_secs(3), subscription.receiver.recv())
        .await
        .expect("no state change committed")
        .expect("subscription closed");
    assert_eq!(change.to, LayerState::Connecting);
    assert_eq!(system.current_state(), LayerState::Connecting);

    assert!(system.unsubscribe(subscription.token).await.unwrap());
    harness.shutdown().await;
}

#[tokio::test]
async fn test_critical_memory_pressure_sheds_idle_channels() {
    let harness = Harness::start(test_config());
    let system = &harness.system;

    for i in 0..50 {
        system.pool().acquire(&format!("idle-{i:02}")).await.unwrap();
    }
    let active: Vec<String> = (0..5).map(|i| format!("active-{i}")).collect();
    let results = system
        .send(Bytes::from_static(b"hello"), &active, false)
        .await
        .unwrap();
    assert!(results.iter().all(|(_, o)| o.is_delivered()));
    assert_eq!(system.pool().snapshot().await.unwrap().total_channels, 55);

    system
        .report_memory_pressure(MemoryPressure::Critical)
        .await
        .unwrap();
    wait_until("idle channels to be evicted", || async move {
        system.pool().snapshot().await.unwrap().total_channels == 5
    })
    .await;

    let report = system.pool().snapshot().await.unwrap();
    assert!(report.channels.iter().all(|c| c.state == ChannelState::Active));
    let ids: Vec<&str> = report.channels.iter().map(|c| c.peer_id.as_str()).collect();
    assert_eq!(ids, active.iter().map(String::as_str).collect::<Vec<_>>());

    let after = system
        .send(Bytes::from_static(b"still here"), &active, false)
        .await
        .unwrap();
    assert!(after
        .iter()
        .all(|(_, o)| matches!(o, SendOutcome::Delivered { .. })));
    harness.shutdown().await;
}
