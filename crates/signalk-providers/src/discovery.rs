//! Peer discovery bridge.
//!
//! Keeps a WebSocket subscription open to every known peer SignalK server.
//! Peers come from configured seed hosts and, with autodiscovery on, from
//! `_signalk-ws._tcp` mDNS announcements. The active host set is the union
//! of both; whenever it changes the bridge reconciles the running peer
//! connections against it.
//!
//! Every delta received from a peer is forwarded to the hub like a local
//! provider's output. Hello messages are ignored and malformed frames are
//! dropped with a warning.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use futures::StreamExt;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use serde::Deserialize;
use signalk_protocol::{decode_frame, decode_server_message, CodecError, ServerMessage};
use signalk_server::ServerEvent;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::duration_secs;
use crate::retry::{Decision, RetryPolicy, DEFAULT_MAX_RETRIES};

/// Path and query of the peer stream endpoint.
pub const STREAM_PATH: &str = "/signalk/v1/stream?subscribe=all";

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),
}

/// Configuration of the discovery bridge.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryConfig {
    /// Seed hosts, e.g. `ws://10.0.0.5:3000` or `10.0.0.5:3000`.
    pub hosts: Vec<String>,
    pub autodiscover: bool,
    pub service_type: String,
    pub max_retries: u32,
    #[serde(deserialize_with = "duration_secs")]
    pub cooldown: Duration,
    /// Pause before reconnecting to a peer.
    #[serde(deserialize_with = "duration_secs")]
    pub retry_delay: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            autodiscover: false,
            service_type: "_signalk-ws._tcp.local.".to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            cooldown: Duration::from_secs(150),
            retry_delay: Duration::from_secs(1),
        }
    }
}

// ============================================================================
// Host set
// ============================================================================

/// Normalize a host to a WebSocket base URL.
///
/// Trailing slashes are removed, `http`/`https` become `ws`/`wss` and a
/// bare `host:port` gets `ws://`.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if let Some(rest) = host.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = host.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if host.starts_with("ws://") || host.starts_with("wss://") {
        host.to_string()
    } else {
        format!("ws://{host}")
    }
}

/// The first IPv4 address of a service, if any.
pub fn pick_ipv4<I>(addresses: I) -> Option<Ipv4Addr>
where
    I: IntoIterator<Item = IpAddr>,
{
    let mut found: Vec<Ipv4Addr> = addresses
        .into_iter()
        .filter_map(|ip| match ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .collect();
    found.sort_unstable();
    found.into_iter().next()
}

/// Seed hosts plus hosts discovered on the network.
#[derive(Debug, Clone, Default)]
pub struct HostSet {
    seeds: BTreeSet<String>,
    /// mDNS full name to host URL.
    discovered: BTreeMap<String, String>,
}

impl HostSet {
    pub fn new<I, S>(seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            seeds: seeds.into_iter().map(|s| normalize_host(s.as_ref())).collect(),
            discovered: BTreeMap::new(),
        }
    }

    /// Record a discovered service. Returns false if nothing changed.
    pub fn discover(&mut self, fullname: &str, url: &str) -> bool {
        let url = normalize_host(url);
        self.discovered.insert(fullname.to_string(), url.clone()) != Some(url)
    }

    /// Forget a service. Returns its URL if it was known.
    pub fn forget(&mut self, fullname: &str) -> Option<String> {
        self.discovered.remove(fullname)
    }

    /// Seeds ∪ discovered, deduplicated.
    pub fn active(&self) -> BTreeSet<String> {
        self.seeds
            .iter()
            .chain(self.discovered.values())
            .cloned()
            .collect()
    }
}

/// Changes needed to bring running peers in line with the host set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub to_start: Vec<String>,
    pub to_stop: Vec<String>,
}

pub fn reconcile<'a, I>(running: I, desired: &BTreeSet<String>) -> Reconciliation
where
    I: IntoIterator<Item = &'a String>,
{
    let running: BTreeSet<&String> = running.into_iter().collect();
    Reconciliation {
        to_start: desired
            .iter()
            .filter(|host| !running.contains(host))
            .cloned()
            .collect(),
        to_stop: running
            .into_iter()
            .filter(|host| !desired.contains(*host))
            .cloned()
            .collect(),
    }
}

// ============================================================================
// mDNS watcher
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum PeerEvent {
    Up { fullname: String, url: String },
    Down { fullname: String },
}

fn watch_mdns(service_type: &str, tx: mpsc::Sender<PeerEvent>) -> Result<ServiceDaemon, DiscoveryError> {
    let daemon = ServiceDaemon::new()?;
    let receiver = daemon.browse(service_type)?;
    info!("Browsing for {}", service_type);

    tokio::spawn(async move {
        while let Ok(event) = receiver.recv_async().await {
            let peer = match event {
                ServiceEvent::ServiceResolved(info) => {
                    let Some(ip) = pick_ipv4(info.get_addresses().iter().copied()) else {
                        debug!("Ignoring {} without IPv4 address", info.get_fullname());
                        continue;
                    };
                    PeerEvent::Up {
                        fullname: info.get_fullname().to_string(),
                        url: format!("{}:{}", ip, info.get_port()),
                    }
                }
                ServiceEvent::ServiceRemoved(_, fullname) => PeerEvent::Down { fullname },
                _ => continue,
            };
            if tx.send(peer).await.is_err() {
                break;
            }
        }
    });

    Ok(daemon)
}

// ============================================================================
// Bridge
// ============================================================================

struct Peer {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Peer {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Connects to peer servers and forwards their deltas to the hub.
#[derive(Debug, Clone)]
pub struct DiscoveryBridge {
    config: DiscoveryConfig,
}

impl DiscoveryBridge {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    /// Run until `shutdown` is set. Peer connections are torn down on exit.
    pub fn spawn(
        self,
        events: mpsc::Sender<ServerEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<Result<(), DiscoveryError>> {
        let (peer_tx, peer_rx) = mpsc::channel(32);
        self.spawn_with_peers(peer_tx, peer_rx, events, shutdown)
    }

    /// Like [`spawn`](Self::spawn), with host set changes read from `peer_rx`.
    /// The mDNS watcher, when enabled, reports through `peer_tx`.
    fn spawn_with_peers(
        self,
        peer_tx: mpsc::Sender<PeerEvent>,
        mut peer_rx: mpsc::Receiver<PeerEvent>,
        events: mpsc::Sender<ServerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<Result<(), DiscoveryError>> {
        tokio::spawn(async move {
            let mut hosts = HostSet::new(&self.config.hosts);
            let mut peers: HashMap<String, Peer> = HashMap::new();

            let daemon = if self.config.autodiscover {
                Some(watch_mdns(&self.config.service_type, peer_tx)?)
            } else {
                drop(peer_tx);
                None
            };

            self.apply(&hosts, &mut peers, &events).await;

            loop {
                tokio::select! {
                    Some(event) = peer_rx.recv() => {
                        let changed = match event {
                            PeerEvent::Up { fullname, url } => {
                                let changed = hosts.discover(&fullname, &url);
                                if changed {
                                    info!("Discovered peer {} at {}", fullname, url);
                                }
                                changed
                            }
                            PeerEvent::Down { fullname } => {
                                let removed = hosts.forget(&fullname);
                                if let Some(url) = &removed {
                                    info!("Peer {} at {} went away", fullname, url);
                                }
                                removed.is_some()
                            }
                        };
                        if changed {
                            self.apply(&hosts, &mut peers, &events).await;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }

            for (_, peer) in peers.drain() {
                peer.stop().await;
            }
            if let Some(daemon) = daemon {
                if let Err(e) = daemon.shutdown() {
                    warn!("Failed to stop mDNS browser: {}", e);
                }
            }
            Ok(())
        })
    }

    async fn apply(&self, hosts: &HostSet, peers: &mut HashMap<String, Peer>, events: &mpsc::Sender<ServerEvent>) {
        let plan = reconcile(peers.keys(), &hosts.active());

        for url in plan.to_stop {
            if let Some(peer) = peers.remove(&url) {
                debug!("Disconnecting from {}", url);
                peer.stop().await;
            }
        }
        for url in plan.to_start {
            let (shutdown, shutdown_rx) = watch::channel(false);
            let policy = RetryPolicy::new(true, self.config.max_retries, self.config.cooldown);
            let task = tokio::spawn(peer_loop(
                url.clone(),
                policy,
                self.config.retry_delay,
                events.clone(),
                shutdown_rx,
            ));
            peers.insert(url, Peer { shutdown, task });
        }
    }
}

/// How a peer session ended.
enum SessionEnd {
    Closed,
    Error(tokio_tungstenite::tungstenite::Error),
    Shutdown,
    HubClosed,
}

async fn peer_loop(
    url: String,
    mut policy: RetryPolicy,
    retry_delay: Duration,
    events: mpsc::Sender<ServerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let stream_url = format!("{url}{STREAM_PATH}");

    loop {
        if *shutdown.borrow() {
            break;
        }

        debug!("Connecting to {}", stream_url);
        let connected = tokio::select! {
            result = tokio_tungstenite::connect_async(stream_url.as_str()) => result,
            _ = shutdown.changed() => break,
        };

        let decision = match connected {
            Ok((mut ws, _)) => {
                info!("Connected to peer {}", url);
                policy.on_connected();

                let end = loop {
                    let msg = tokio::select! {
                        msg = ws.next() => msg,
                        _ = shutdown.changed() => {
                            let _ = ws.close(None).await;
                            break SessionEnd::Shutdown;
                        }
                    };
                    let decoded = match msg {
                        Some(Ok(Message::Text(text))) => decode_server_message(&text),
                        Some(Ok(Message::Binary(bytes))) => decode_frame(&bytes),
                        Some(Ok(Message::Close(_))) | None => break SessionEnd::Closed,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => break SessionEnd::Error(e),
                    };
                    if !forward(&url, decoded, &events).await {
                        break SessionEnd::HubClosed;
                    }
                };

                match end {
                    SessionEnd::Closed => {
                        info!("Peer {} closed the connection", url);
                        policy.on_close()
                    }
                    SessionEnd::Error(e) => {
                        warn!("Peer {}: {}", url, e);
                        policy.on_error()
                    }
                    SessionEnd::Shutdown | SessionEnd::HubClosed => break,
                }
            }
            Err(e) => {
                warn!("Failed to connect to peer {}: {}", url, e);
                policy.on_error()
            }
        };

        let pause = match decision {
            Decision::Reconnect => retry_delay,
            Decision::Suspend(cooldown) => {
                warn!("Peer {}: too many errors, suspending for {:?}", url, cooldown);
                cooldown
            }
            Decision::Stop => break,
        };
        tokio::select! {
            _ = tokio::time::sleep(pause) => {
                if matches!(decision, Decision::Suspend(_)) {
                    policy.on_cooldown_elapsed();
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    debug!("Peer loop for {} stopped", url);
}

/// Forward a decoded frame. Returns false once the hub is gone.
async fn forward(
    url: &str,
    decoded: Result<ServerMessage, CodecError>,
    events: &mpsc::Sender<ServerEvent>,
) -> bool {
    match decoded {
        Ok(ServerMessage::Delta(delta)) => events.send(ServerEvent::delta(url, delta)).await.is_ok(),
        Ok(ServerMessage::Hello(hello)) => {
            debug!("Hello from {} ({:?})", url, hello.name);
            true
        }
        Err(e) => {
            warn!("Dropping malformed frame from {}: {}", url, e);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("10.0.0.5:3000"), "ws://10.0.0.5:3000");
        assert_eq!(normalize_host("10.0.0.5:3000/"), "ws://10.0.0.5:3000");
        assert_eq!(normalize_host("http://demo.signalk.org/"), "ws://demo.signalk.org");
        assert_eq!(normalize_host("https://demo.signalk.org"), "wss://demo.signalk.org");
        assert_eq!(normalize_host("ws://boat.local:3000"), "ws://boat.local:3000");
        assert_eq!(normalize_host("wss://boat.local"), "wss://boat.local");
    }

    #[test]
    fn test_pick_ipv4_skips_ipv6() {
        let addresses: Vec<IpAddr> = vec![
            "fe80::1".parse().unwrap(),
            "192.168.1.20".parse().unwrap(),
            "10.0.0.5".parse().unwrap(),
        ];
        assert_eq!(pick_ipv4(addresses), Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(pick_ipv4(vec!["::1".parse::<IpAddr>().unwrap()]), None);
    }

    #[test]
    fn test_host_set_union() {
        let mut hosts = HostSet::new(["10.0.0.5:3000/", "ws://10.0.0.6:3000"]);

        assert!(hosts.discover("boat._signalk-ws._tcp.local.", "10.0.0.7:3000"));
        assert!(!hosts.discover("boat._signalk-ws._tcp.local.", "10.0.0.7:3000"));
        // a discovered seed is not duplicated
        assert!(hosts.discover("seed._signalk-ws._tcp.local.", "10.0.0.5:3000"));
        assert_eq!(
            hosts.active().into_iter().collect::<Vec<_>>(),
            vec!["ws://10.0.0.5:3000", "ws://10.0.0.6:3000", "ws://10.0.0.7:3000"]
        );

        assert_eq!(
            hosts.forget("boat._signalk-ws._tcp.local."),
            Some("ws://10.0.0.7:3000".to_string())
        );
        assert_eq!(hosts.forget("boat._signalk-ws._tcp.local."), None);
        // forgetting the discovered copy of a seed keeps the seed
        hosts.forget("seed._signalk-ws._tcp.local.");
        assert!(hosts.active().contains("ws://10.0.0.5:3000"));
        assert_eq!(hosts.active().len(), 2);
    }

    #[test]
    fn test_reconcile() {
        let running = vec!["ws://a:1".to_string(), "ws://b:1".to_string()];
        let desired: BTreeSet<String> = ["ws://b:1", "ws://c:1"].iter().map(|s| s.to_string()).collect();

        let plan = reconcile(&running, &desired);
        assert_eq!(plan.to_start, vec!["ws://c:1"]);
        assert_eq!(plan.to_stop, vec!["ws://a:1"]);

        assert_eq!(reconcile(&desired.iter().cloned().collect::<Vec<_>>(), &desired), Reconciliation::default());
    }

    #[tokio::test]
    async fn test_peer_that_goes_away_is_disconnected() {
        use futures::SinkExt;
        use tokio::net::TcpListener;
        use tokio::time::timeout;

        const FULLNAME: &str = "boat._signalk-ws._tcp.local.";

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, mut events) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (peer_tx, peer_rx) = mpsc::channel(8);
        let config = DiscoveryConfig {
            retry_delay: Duration::from_millis(50),
            ..DiscoveryConfig::default()
        };
        let bridge = DiscoveryBridge::new(config).spawn_with_peers(peer_tx.clone(), peer_rx, events_tx, shutdown_rx);

        peer_tx
            .send(PeerEvent::Up {
                fullname: FULLNAME.to_string(),
                url: addr.to_string(),
            })
            .await
            .unwrap();
        let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("Timeout waiting for peer connection")
            .unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::Text(
            r#"{"context":"vessels.urn:mrn:imo:mmsi:230099999","updates":[{"values":[{"path":"navigation.speedOverGround","value":3.85}]}]}"#
                .to_string(),
        ))
        .await
        .unwrap();

        let event = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        match event {
            ServerEvent::DeltaReceived { source_label, .. } => assert_eq!(source_label, format!("ws://{addr}")),
        }

        peer_tx
            .send(PeerEvent::Down {
                fullname: FULLNAME.to_string(),
            })
            .await
            .unwrap();

        // the bridge closes the session itself
        timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await
        .expect("Session to the removed peer stayed open");
        // and does not come back
        assert!(timeout(Duration::from_millis(300), listener.accept()).await.is_err());

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(5), bridge).await.unwrap().unwrap().unwrap();
    }

    #[test]
    fn test_config_defaults() {
        let config: DiscoveryConfig = serde_json::from_str(r#"{"hosts": ["10.0.0.5:3000"]}"#).unwrap();
        assert!(!config.autodiscover);
        assert_eq!(config.service_type, "_signalk-ws._tcp.local.");
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.retry_delay, Duration::from_secs(1));
    }
}
