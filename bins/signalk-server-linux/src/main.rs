use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};
use signalk_core::defaults::defaults_to_deltas;
use signalk_core::{resolve_self_identity, StaticSchema};
use signalk_providers::{DiscoveryBridge, DiscoveryConfig, FileReplayProvider, TcpDeltaProvider, TcpTransportConfig};
use signalk_server::{ServerConfig, ServerEvent, SignalKServer};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULTS_LABEL: &str = "defaults";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,signalk_server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("SignalK hub starting...");

    // Self identity and defaults
    let defaults = defaults_from_env();
    let (identity, seed) = resolve_self_identity(&defaults).context("invalid self identity")?;
    tracing::info!("Self context: {}", identity.context());

    let config = ServerConfig {
        self_context: identity.context(),
        ..ServerConfig::default()
    };

    let server = SignalKServer::new(config, Arc::new(StaticSchema::builtin()));
    let event_tx = server.event_sender();
    let statistics = server.statistics();
    let hub_handle = tokio::spawn(server.run());

    for delta in seed.into_iter().chain(defaults_to_deltas(&defaults)?) {
        event_tx
            .send(ServerEvent::delta(DEFAULTS_LABEL, delta))
            .await
            .context("hub stopped before defaults were sent")?;
    }

    // Providers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut providers: Vec<JoinHandle<()>> = Vec::new();

    for (i, link) in tcp_links_from_env()?.into_iter().enumerate() {
        let label = format!("tcp{}", i);
        tracing::info!("Provider {}: {}", label, link.address());
        let handle = TcpDeltaProvider::new(label.as_str(), link).spawn(event_tx.clone(), shutdown_rx.clone());
        providers.push(tokio::spawn(async move {
            match handle.await {
                Ok(Err(e)) => tracing::error!("Provider {} failed: {}", label, e),
                Err(e) => tracing::error!("Provider {} panicked: {}", label, e),
                Ok(Ok(())) => {}
            }
        }));
    }

    if let Ok(path) = std::env::var("SIGNALK_REPLAY") {
        let handle = FileReplayProvider::new("replay", path)
            .with_interval(Duration::from_millis(100))
            .repeat(true)
            .spawn(event_tx.clone(), shutdown_rx.clone());
        providers.push(tokio::spawn(async move {
            match handle.await {
                Ok(Err(e)) => tracing::error!("Replay failed: {}", e),
                Err(e) => tracing::error!("Replay panicked: {}", e),
                Ok(Ok(sent)) => tracing::info!("Replay sent {} deltas", sent),
            }
        }));
    }

    let discovery = discovery_from_env();
    if discovery.autodiscover || !discovery.hosts.is_empty() {
        let handle = DiscoveryBridge::new(discovery).spawn(event_tx.clone(), shutdown_rx.clone());
        providers.push(tokio::spawn(async move {
            match handle.await {
                Ok(Err(e)) => tracing::error!("Discovery failed: {}", e),
                Err(e) => tracing::error!("Discovery panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }));
    }

    // Periodic statistics
    let mut stats_shutdown = shutdown_rx.clone();
    let stats_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let snapshot = statistics.snapshot();
                    tracing::info!(
                        "{} deltas ({:.1}/s), {} paths, {} rejected",
                        snapshot.deltas_handled,
                        snapshot.delta_rate,
                        snapshot.number_of_available_paths,
                        snapshot.fragments_rejected
                    );
                }
                _ = stats_shutdown.changed() => break,
            }
        }
    });

    tracing::info!("SignalK hub ready");
    drop(event_tx);

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl+C, shutting down...");

    let _ = shutdown_tx.send(true);
    for provider in providers {
        let _ = provider.await;
    }
    let _ = stats_handle.await;
    let _ = hub_handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Defaults document built from `SIGNALK_MMSI`, `SIGNALK_UUID` and `SIGNALK_NAME`.
fn defaults_from_env() -> Value {
    let mut own = serde_json::Map::new();
    for (var, field) in [
        ("SIGNALK_MMSI", "mmsi"),
        ("SIGNALK_UUID", "uuid"),
        ("SIGNALK_NAME", "name"),
    ] {
        if let Ok(value) = std::env::var(var) {
            own.insert(field.to_string(), Value::String(value));
        }
    }
    json!({ "vessels": { "self": own } })
}

/// TCP links from `SIGNALK_TCP`, a comma separated list of `host:port`.
fn tcp_links_from_env() -> anyhow::Result<Vec<TcpTransportConfig>> {
    let Ok(list) = std::env::var("SIGNALK_TCP") else {
        return Ok(Vec::new());
    };
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (host, port) = entry
                .rsplit_once(':')
                .with_context(|| format!("expected host:port in SIGNALK_TCP, got {entry}"))?;
            let port = port
                .parse()
                .with_context(|| format!("invalid port in SIGNALK_TCP entry {entry}"))?;
            Ok(TcpTransportConfig::new(host, port))
        })
        .collect()
}

/// Peer discovery from `SIGNALK_PEERS` and `SIGNALK_AUTODISCOVER`.
fn discovery_from_env() -> DiscoveryConfig {
    let hosts = std::env::var("SIGNALK_PEERS")
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|host| !host.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let autodiscover = std::env::var("SIGNALK_AUTODISCOVER")
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);

    DiscoveryConfig {
        hosts,
        autodiscover,
        ..DiscoveryConfig::default()
    }
}
