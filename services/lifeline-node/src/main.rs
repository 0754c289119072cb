use anyhow::{bail, Context, Result};
use bytes::Bytes;
use lifeline_core::{logging, Layer, PeerId, ResilienceConfig};
use lifeline_mesh::{LayerState, LoopbackTransport, TokioClock, TransportEvent};
use lifeline_runtime::ResilienceSystem;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const NODE_PROTOCOL_VERSION: u32 = 1;
const NODE_RUNTIME_VERSION: u32 = 1;

/// Peers the demo loop talks to
const DEMO_PEERS: [&str; 3] = ["relay-1", "relay-2", "relay-3"];

/// Peer whose link drops every few heartbeats
const FLAKY_PEER: &str = "relay-flaky";

/// Heartbeats between status reports
const STATUS_EVERY: u64 = 10;

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    runtime_version: u32,
    protocol_version: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let config = match parse_config_path(&args)? {
        Some(path) => ResilienceConfig::from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ResilienceConfig::default(),
    };
    if config.node.json_logs {
        logging::init_json_with_filter(&config.node.log_level);
    } else {
        logging::init_with_filter(&config.node.log_level);
    }

    let heartbeat = Duration::from_millis(config.pool.tick_interval_ms.max(100));
    info!(
        node_id = %config.node.node_id,
        max_concurrent_operations = config.max_concurrent_operations,
        "Lifeline node starting"
    );

    let transport = LoopbackTransport::new();
    transport.set_latency(FLAKY_PEER, 400.0);
    let system = ResilienceSystem::start(config, Arc::new(transport.clone()), TokioClock::shared())?;

    let mut changes = system.subscribe().await?;
    tokio::spawn(async move {
        while let Some(change) = changes.receiver.recv().await {
            info!(from = %change.from, to = %change.to, "Network state changed");
        }
    });

    tokio::select! {
        result = run_demo(&system, &transport, heartbeat) => {
            if let Err(e) = result {
                warn!(error = %e, "Demo loop stopped");
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for ctrl-c")?;
            info!("Interrupt received");
        }
    }

    system.shutdown().await;
    Ok(())
}

async fn run_demo(
    system: &ResilienceSystem,
    transport: &LoopbackTransport,
    heartbeat: Duration,
) -> Result<()> {
    let mut peers: Vec<PeerId> = DEMO_PEERS.iter().map(|p| p.to_string()).collect();
    peers.push(FLAKY_PEER.to_string());

    for peer in &peers {
        let outcome = system.connect(peer).await?;
        info!(peer_id = %peer, ?outcome, "Connect");
    }

    let mut interval = tokio::time::interval(heartbeat);
    let mut beat: u64 = 0;
    loop {
        interval.tick().await;
        beat += 1;

        system
            .report_layer_state(Layer::Physical, LayerState::Ready, peers.len())
            .await?;
        system
            .report_layer_state(Layer::Application, LayerState::Ready, peers.len())
            .await?;

        // Flap the flaky link: down on every fourth beat, back on the next
        if beat % 4 == 0 {
            transport.set_reachable(FLAKY_PEER, false);
            system
                .handle_transport_event(TransportEvent::PeerDisconnected {
                    peer_id: FLAKY_PEER.to_string(),
                    reason: "link lost".to_string(),
                })
                .await?;
        } else if beat % 4 == 1 && beat > 1 {
            transport.set_reachable(FLAKY_PEER, true);
            system
                .handle_transport_event(TransportEvent::PeerConnected {
                    peer_id: FLAKY_PEER.to_string(),
                })
                .await?;
        }

        let payload = Bytes::from(format!("heartbeat {beat}"));
        for (peer, outcome) in system.send(payload, &peers, false).await? {
            if !outcome.is_delivered() {
                info!(peer_id = %peer, outcome = outcome.label(), "Heartbeat not delivered");
            }
        }

        if beat % STATUS_EVERY == 0 {
            let report = system.get_system_status_report().await?;
            info!(
                state = %report.overall_state,
                emergency = report.emergency_mode,
                "Status {}",
                serde_json::to_string(&report)?
            );
        }
    }
}

fn parse_config_path(args: &[String]) -> Result<Option<PathBuf>> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            return match args_iter.next() {
                Some(path) => Ok(Some(PathBuf::from(path))),
                None => bail!("--config was provided without a path"),
            };
        }
    }
    Ok(None)
}
