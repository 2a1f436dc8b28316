//! SignalK delta hub.
//!
//! The hub is a single worker task draining an mpsc queue of events from
//! providers. For each delta it:
//! - normalizes context, source and timestamp
//! - splits the delta into single-item fragments
//! - publishes each fragment on the distribution bus, ingesting any
//!   synthesized metadata into the cache first
//! - ingests the fragment into the delta cache
//!
//! Processing of one delta completes before the next is dequeued.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use signalk_core::{resolve_context, CacheError, Delta, DeltaCache, MetadataLookup, Source};
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::statistics::HubStatistics;
use crate::streambundle::{BusError, BusHandle, StreamBundle};

/// Configuration for the SignalK hub.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Server name sent in Hello messages.
    pub name: String,
    /// SignalK version.
    pub version: String,
    /// Self vessel context, `vessels.<urn>`.
    pub self_context: String,
    /// Capacity of every bus channel.
    pub channel_capacity: usize,
    /// Capacity of the provider event queue.
    pub event_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "signalk-server-rust".to_string(),
            version: signalk_core::store::SIGNALK_VERSION.to_string(),
            self_context: "vessels.urn:mrn:signalk:uuid:00000000-0000-0000-0000-000000000000".to_string(),
            channel_capacity: 1024,
            event_queue: 1024,
        }
    }
}

/// Events that can be sent to the hub.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A delta was received from a provider.
    DeltaReceived { source_label: String, delta: Delta },
}

impl ServerEvent {
    pub fn delta(source_label: impl Into<String>, delta: Delta) -> Self {
        Self::DeltaReceived {
            source_label: source_label.into(),
            delta,
        }
    }
}

/// Errors for a single fragment. Logged by the hub, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Bus, cache and counters, owned by the worker.
struct Hub {
    self_context: String,
    bundle: StreamBundle,
    cache: Arc<RwLock<DeltaCache>>,
    statistics: Arc<HubStatistics>,
}

impl Hub {
    async fn handle_message(&mut self, source_label: &str, mut delta: Delta) {
        normalize(&mut delta, source_label, &self.self_context, &now());
        self.statistics.record_delta();

        let shared = Arc::clone(&self.cache);
        let mut cache = shared.write().await;
        for fragment in delta.fragments() {
            if let Err(e) = self.handle_fragment(&mut cache, &fragment) {
                self.statistics.record_rejected();
                warn!("Rejected fragment from {}: {}", source_label, e);
            }
        }
        self.statistics.set_active_paths(cache.store().path_count());
    }

    fn handle_fragment(&mut self, cache: &mut DeltaCache, fragment: &Delta) -> Result<(), ServerError> {
        let statistics = &self.statistics;
        let mut rejected_meta = None;
        let published = self.bundle.publish(fragment, |meta| {
            statistics.record_meta();
            if let Err(e) = cache.ingest(&meta) {
                rejected_meta = Some(e);
            }
        });
        if let Some(e) = rejected_meta {
            statistics.record_rejected();
            warn!("Rejected schema metadata: {}", e);
        }
        // a fan-out failure still leaves the fragment in the cache
        cache.ingest(fragment)?;
        published?;
        Ok(())
    }
}

/// The SignalK delta hub.
pub struct SignalKServer {
    config: ServerConfig,
    hub: Hub,
    /// Channel for receiving events from providers.
    event_tx: mpsc::Sender<ServerEvent>,
    event_rx: mpsc::Receiver<ServerEvent>,
}

impl SignalKServer {
    /// Create a hub using `metadata` for schema lookups.
    pub fn new(config: ServerConfig, metadata: Arc<dyn MetadataLookup>) -> Self {
        let bundle = StreamBundle::new(&config.self_context, metadata, config.channel_capacity);
        let cache = DeltaCache::new(&config.self_context);
        let (event_tx, event_rx) = mpsc::channel(config.event_queue.max(1));

        Self {
            hub: Hub {
                self_context: config.self_context.clone(),
                bundle,
                cache: Arc::new(RwLock::new(cache)),
                statistics: Arc::new(HubStatistics::new()),
            },
            config,
            event_tx,
            event_rx,
        }
    }

    /// Get a sender for submitting events to the hub.
    pub fn event_sender(&self) -> mpsc::Sender<ServerEvent> {
        self.event_tx.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn self_context(&self) -> &str {
        &self.config.self_context
    }

    /// Read access to the delta cache.
    pub fn cache(&self) -> Arc<RwLock<DeltaCache>> {
        self.hub.cache.clone()
    }

    /// Subscriber side of the distribution bus.
    pub fn bus(&self) -> BusHandle {
        self.hub.bundle.handle()
    }

    pub fn statistics(&self) -> Arc<HubStatistics> {
        self.hub.statistics.clone()
    }

    /// Handle one delta directly, bypassing the event queue.
    pub async fn handle_message(&mut self, source_label: &str, delta: Delta) {
        self.hub.handle_message(source_label, delta).await;
    }

    /// Run the worker until every event sender has been dropped.
    pub async fn run(self) {
        let Self {
            mut hub,
            event_tx,
            mut event_rx,
            ..
        } = self;
        drop(event_tx);
        info!("SignalK hub running for {}", hub.self_context);

        let mut rate = tokio::time::interval(Duration::from_secs(1));
        rate.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        Some(ServerEvent::DeltaReceived { source_label, delta }) => {
                            debug!("Delta from {}", source_label);
                            hub.handle_message(&source_label, delta).await;
                        }
                        None => break,
                    }
                }
                _ = rate.tick() => hub.statistics.update_rate(),
            }
        }
        info!("SignalK hub stopped");
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Fill in context, `$source` and timestamp the way providers leave them out.
fn normalize(delta: &mut Delta, source_label: &str, self_context: &str, now: &str) {
    delta.context = Some(resolve_context(delta.context.as_deref(), self_context));
    for update in &mut delta.updates {
        if update.source_ref.is_none() {
            update.source_ref = Some(match &update.source {
                Some(source) => Source {
                    label: source_label.to_string(),
                    ..source.clone()
                }
                .source_ref(),
                None => source_label.to_string(),
            });
        }
        if update.timestamp.is_none() {
            update.timestamp = Some(now.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use signalk_core::{NoMetadata, PathValue, StaticSchema, Update};

    const SELF: &str = "vessels.urn:mrn:signalk:uuid:c0d79334-4e25-4245-8892-54e8ccc8021d";

    fn config() -> ServerConfig {
        ServerConfig {
            self_context: SELF.to_string(),
            ..ServerConfig::default()
        }
    }

    fn source(label: &str) -> Source {
        Source {
            label: label.to_string(),
            source_type: Some("NMEA0183".to_string()),
            src: None,
            can_name: None,
            pgn: None,
            sentence: Some("RMC".to_string()),
            talker: Some("GP".to_string()),
            ais_type: None,
        }
    }

    #[test]
    fn test_normalize_fills_missing_fields() {
        let mut delta = Delta {
            context: None,
            updates: vec![
                Update::from_values(vec![PathValue::new("a", json!(1))]),
                Update {
                    source: Some(source("ttyUSB0")),
                    ..Update::from_values(vec![PathValue::new("b", json!(2))])
                },
                Update::from_values(vec![PathValue::new("c", json!(3))])
                    .with_source_ref("n2k.115")
                    .with_timestamp("2014-05-03T09:14:11.096Z"),
            ],
        };

        normalize(&mut delta, "serial", SELF, "2024-01-17T10:30:00.000Z");

        assert_eq!(delta.context.as_deref(), Some(SELF));
        let refs: Vec<_> = delta.updates.iter().map(|u| u.source_ref.as_deref()).collect();
        assert_eq!(refs, vec![Some("serial"), Some("serial.GP"), Some("n2k.115")]);
        let stamps: Vec<_> = delta.updates.iter().map(|u| u.timestamp.as_deref()).collect();
        assert_eq!(
            stamps,
            vec![
                Some("2024-01-17T10:30:00.000Z"),
                Some("2024-01-17T10:30:00.000Z"),
                Some("2014-05-03T09:14:11.096Z")
            ]
        );
    }

    #[test]
    fn test_normalize_keeps_foreign_context() {
        let mut delta = Delta::new("vessels.urn:mrn:imo:mmsi:230099999", vec![]);
        normalize(&mut delta, "ais", SELF, "2024-01-17T10:30:00.000Z");
        assert_eq!(delta.context.as_deref(), Some("vessels.urn:mrn:imo:mmsi:230099999"));

        let mut delta = Delta::new("vessels.self", vec![]);
        normalize(&mut delta, "ais", SELF, "2024-01-17T10:30:00.000Z");
        assert_eq!(delta.context.as_deref(), Some(SELF));
    }

    #[tokio::test]
    async fn test_rejected_fragment_does_not_stop_the_rest() {
        let mut server = SignalKServer::new(config(), Arc::new(NoMetadata));
        let delta = Delta::new(
            SELF,
            vec![Update::from_values(vec![
                PathValue::new("", json!(5)),
                PathValue::new("navigation.speedOverGround", json!(3.85)),
            ])],
        );

        server.handle_message("test", delta).await;

        let snapshot = server.statistics().snapshot();
        assert_eq!(snapshot.deltas_handled, 1);
        assert_eq!(snapshot.fragments_rejected, 1);

        let cache = server.cache();
        let cache = cache.read().await;
        let own = cache.build_full(Some(SELF), &[]).unwrap();
        assert_eq!(own["navigation"]["speedOverGround"]["value"], 3.85);
        assert_eq!(own["navigation"]["speedOverGround"]["$source"], "test");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_context_is_self_for_bus_and_cache() {
        let mut server = SignalKServer::new(config(), Arc::new(StaticSchema::builtin()));
        let bus = server.bus();
        let mut general = bus.subscribe_general("navigation.speedOverGround");
        let mut own = bus.subscribe_self_values("navigation.speedOverGround");
        let mut meta = bus.subscribe_general("navigation.speedOverGround.meta");
        let delta = Delta::new(
            "",
            vec![Update::from_values(vec![PathValue::new(
                "navigation.speedOverGround",
                json!(3.85),
            )])],
        );

        server.handle_message("test", delta).await;

        assert_eq!(general.try_recv().unwrap().context, SELF);
        assert_eq!(own.try_recv().unwrap(), json!(3.85));
        assert_eq!(meta.try_recv().unwrap().context, SELF);
        assert_eq!(
            bus.available_paths(),
            vec!["navigation.speedOverGround.meta", "navigation.speedOverGround"]
        );

        let cache = server.cache();
        let cache = cache.read().await;
        let own = cache.build_full(Some(SELF), &[]).unwrap();
        assert_eq!(own["navigation"]["speedOverGround"]["value"], 3.85);
        assert_eq!(own["navigation"]["speedOverGround"]["meta"]["units"], "m/s");
    }

    #[tokio::test]
    async fn test_run_drains_queue_until_senders_dropped() {
        let server = SignalKServer::new(config(), Arc::new(StaticSchema::builtin()));
        let tx = server.event_sender();
        let cache = server.cache();
        let statistics = server.statistics();
        let worker = tokio::spawn(server.run());

        for speed in [1.0, 2.0, 3.0] {
            let delta = Delta::new(
                "vessels.self",
                vec![Update::from_values(vec![PathValue::new(
                    "navigation.speedOverGround",
                    json!(speed),
                )])],
            );
            tx.send(ServerEvent::delta("gps", delta)).await.unwrap();
        }
        drop(tx);
        worker.await.unwrap();

        let cache = cache.read().await;
        let own = cache.build_full(Some(SELF), &[]).unwrap();
        assert_eq!(own["navigation"]["speedOverGround"]["value"], 3.0);
        assert_eq!(own["navigation"]["speedOverGround"]["meta"]["units"], "m/s");
        // one schema fragment plus three values
        assert_eq!(cache.len(), 4);
        assert_eq!(statistics.snapshot().meta_emitted, 1);
        assert_eq!(statistics.snapshot().deltas_handled, 3);
    }
}
