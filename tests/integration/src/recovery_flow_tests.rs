//! Recovery, delivery-failure and load-shedding flows across crates

use crate::test_utils::{test_config, wait_until, Harness};
use bytes::Bytes;
use lifeline_edge::ResourceSample;
use lifeline_mesh::frame::{FrameHeader, FRAME_TYPE_DATA};
use lifeline_mesh::{ChannelState, DeliveryFailure, EvictReason, FailureReason, TransportEvent};
use lifeline_runtime::SendOutcome;
use std::time::Duration;

fn targets(peer: &str) -> Vec<String> {
    vec![peer.to_string()]
}

#[tokio::test]
async fn test_queued_messages_flush_after_recovery() {
    let mut config = test_config();
    config.pool.verify_clean_exchanges = 1;
    let harness = Harness::start(config);
    let system = &harness.system;
    let transport = &harness.transport;

    transport.fail_next("peer-a", FailureReason::ChecksumMismatch);
    let first = system
        .send(Bytes::from_static(b"first"), &targets("peer-a"), false)
        .await
        .unwrap();
    assert_eq!(first[0].1.label(), "failed");

    let queued = system
        .send(Bytes::from_static(b"second"), &targets("peer-a"), false)
        .await
        .unwrap();
    assert!(matches!(queued[0].1, SendOutcome::Queued { .. }));
    assert_eq!(transport.sent_to("peer-a"), 0);

    // Link comes back: recovery probe, verification, then the queue drains
    system
        .handle_transport_event(TransportEvent::PeerConnected {
            peer_id: "peer-a".into(),
        })
        .await
        .unwrap();

    wait_until("queued message to be flushed", || async move {
        transport.sent().iter().any(|(peer, frame)| {
            peer == "peer-a"
                && FrameHeader::parse(frame)
                    .ok()
                    .flatten()
                    .is_some_and(|h| h.frame_type == FRAME_TYPE_DATA)
                && frame.ends_with(b"second")
        })
    })
    .await;

    let channel = system.pool().channel("peer-a").await.unwrap().unwrap();
    assert!(channel.routable);
    assert_eq!(channel.queued_messages, 0);
    assert!(matches!(
        channel.state,
        ChannelState::Recovered | ChannelState::Active
    ));
    assert!(system.metrics().probes >= 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_eviction_reports_undeliverable_messages() {
    let harness = Harness::start(test_config());
    let system = &harness.system;
    let mut failures = system.subscribe_delivery_failures();

    harness
        .transport
        .fail_next("peer-a", FailureReason::ChecksumMismatch);
    system
        .send(Bytes::from_static(b"first"), &targets("peer-a"), false)
        .await
        .unwrap();
    let queued = system
        .send(Bytes::from_static(b"second"), &targets("peer-a"), false)
        .await
        .unwrap();
    let SendOutcome::Queued { message_id } = queued[0].1 else {
        panic!("expected a queued send, got {:?}", queued[0].1);
    };

    let report = system
        .pool()
        .evict("peer-a", EvictReason::Explicit)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.peer_id, "peer-a");

    let notice = tokio::time::timeout(Duration::from_secs(3), failures.recv())
        .await
        .expect("no delivery failure notice")
        .unwrap();
    assert_eq!(notice.peer_id, "peer-a");
    assert_eq!(notice.message_ids, vec![message_id]);
    assert_eq!(
        notice.reason,
        DeliveryFailure::ChannelEvicted(EvictReason::Explicit)
    );
    harness.shutdown().await;
}

#[tokio::test]
async fn test_admission_bounds_concurrent_operations() {
    let mut config = test_config();
    config.max_concurrent_operations = 2;
    config.edge.admission.min_limit = 1;
    let harness = Harness::start(config);

    let peers: Vec<String> = (0..10).map(|i| format!("peer-{i}")).collect();
    let results = harness
        .system
        .send(Bytes::from_static(b"x"), &peers, false)
        .await
        .unwrap();
    assert!(results.iter().all(|(_, o)| o.is_delivered()));

    let stats = harness.system.admission().stats();
    assert!(stats.peak_in_flight <= 2, "peak {}", stats.peak_in_flight);
    assert_eq!(stats.admitted, 10);
    assert_eq!(stats.in_flight, 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_resource_exhaustion_throttles_sends() {
    let harness = Harness::start(test_config());
    let system = &harness.system;

    system
        .report_resource_usage(ResourceSample {
            cpu: 0.95,
            memory: 0.4,
            network: 0.2,
        })
        .await
        .unwrap();

    let peers: Vec<String> = (0..10).map(|i| format!("peer-{i}")).collect();
    let results = system.send(Bytes::from_static(b"x"), &peers, false).await.unwrap();
    let delivered = results.iter().filter(|(_, o)| o.is_delivered()).count();
    let throttled = results
        .iter()
        .filter(|(_, o)| matches!(o, SendOutcome::Throttled { .. }))
        .count();
    assert_eq!(delivered, 5);
    assert_eq!(throttled, 5);

    let status = system.get_system_status_report().await.unwrap();
    assert!(status.active_handler_actions.contains_key("resource_exhaustion"));

    // Pressure gone: no more metering
    system
        .report_resource_usage(ResourceSample {
            cpu: 0.3,
            memory: 0.3,
            network: 0.1,
        })
        .await
        .unwrap();
    let results = system.send(Bytes::from_static(b"y"), &peers, false).await.unwrap();
    assert!(results.iter().all(|(_, o)| o.is_delivered()));
    harness.shutdown().await;
}

#[tokio::test]
async fn test_status_report_serializes_for_the_app() {
    let harness = Harness::start(test_config());
    harness
        .system
        .send(Bytes::from_static(b"x"), &targets("peer-a"), false)
        .await
        .unwrap();

    let report = harness.system.get_system_status_report().await.unwrap();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["per_channel_health"][0]["peer_id"], "peer-a");
    assert_eq!(json["per_channel_health"][0]["state"], "active");
    assert_eq!(json["overall_state"], "disconnected");
    harness.shutdown().await;
}
