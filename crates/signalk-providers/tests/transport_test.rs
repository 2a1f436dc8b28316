//! Integration tests for the TCP link and the TCP delta provider.
//!
//! These tests run against real loopback listeners.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use signalk_core::NoMetadata;
use signalk_providers::{LinkState, LinkStatus, TcpDeltaProvider, TcpTransport, TcpTransportConfig};
use signalk_server::{ServerConfig, SignalKServer};

const SELF: &str = "vessels.urn:mrn:signalk:uuid:c0d79334-4e25-4245-8892-54e8ccc8021d";

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// A port with nothing listening on it.
async fn closed_port() -> u16 {
    let (listener, port) = listener().await;
    drop(listener);
    port
}

async fn accept(listener: &TcpListener) -> TcpStream {
    timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("Timeout waiting for connection")
        .unwrap()
        .0
}

/// Wait until the link status satisfies `pred`.
async fn wait_for<F>(status: &mut watch::Receiver<LinkStatus>, pred: F) -> LinkStatus
where
    F: Fn(&LinkStatus) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let current = *status.borrow_and_update();
            if pred(&current) {
                return current;
            }
            status.changed().await.expect("link task ended");
        }
    })
    .await
    .expect("Timeout waiting for link status")
}

/// Read from the link until `expected` has been seen.
async fn recv_until(data: &mut mpsc::Receiver<Bytes>, expected: &str) -> String {
    let mut received = String::new();
    timeout(Duration::from_secs(5), async {
        while !received.contains(expected) {
            let chunk = data.recv().await.expect("link stream ended");
            received.push_str(std::str::from_utf8(&chunk).unwrap());
        }
    })
    .await
    .expect("Timeout waiting for data");
    received
}

fn config(port: u16) -> TcpTransportConfig {
    TcpTransportConfig {
        cooldown: Duration::from_millis(600),
        ..TcpTransportConfig::new("127.0.0.1", port)
    }
}

// ============================================================================
// Link transport
// ============================================================================

#[tokio::test]
async fn test_forwards_bytes_and_reconnects_after_close() {
    let (listener, port) = listener().await;
    let (transport, mut data) = TcpTransport::spawn(config(port));
    let mut status = transport.status();

    let mut first = accept(&listener).await;
    first.write_all(b"$GPRMC,first\r\n").await.unwrap();
    assert_eq!(recv_until(&mut data, "first\r\n").await, "$GPRMC,first\r\n");
    drop(first);

    let mut second = accept(&listener).await;
    wait_for(&mut status, |s| s.state == LinkState::Connected && s.attempts == 2).await;
    second.write_all(b"second\n").await.unwrap();
    recv_until(&mut data, "second\n").await;

    transport.write(Bytes::from_static(b"outbound\n")).await.unwrap();
    let mut buf = [0u8; 9];
    timeout(Duration::from_secs(5), second.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"outbound\n");

    transport.shutdown().await;
    assert_eq!(*status.borrow(), LinkStatus { state: LinkState::Closed, attempts: 2 });
}

#[tokio::test]
async fn test_retry_bound_and_cooldown() {
    let port = closed_port().await;
    let config = TcpTransportConfig {
        max_retries: 3,
        ..config(port)
    };
    let (transport, _data) = TcpTransport::spawn(config);
    let mut status = transport.status();

    let suspended = wait_for(&mut status, |s| s.state == LinkState::Suspended).await;
    assert_eq!(suspended.attempts, 3);

    // no attempts while suspended
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        *status.borrow(),
        LinkStatus { state: LinkState::Suspended, attempts: 3 }
    );

    // attempts resume after the cooldown and the bound applies again
    wait_for(&mut status, |s| s.attempts > 3).await;
    let suspended = wait_for(&mut status, |s| {
        s.state == LinkState::Suspended && s.attempts > 3
    })
    .await;
    assert_eq!(suspended.attempts, 6);

    transport.shutdown().await;
    assert_eq!(status.borrow().state, LinkState::Closed);
}

#[tokio::test]
async fn test_one_shot_link_stays_closed() {
    let (listener, port) = listener().await;
    let config = TcpTransportConfig {
        reconnect: false,
        ..config(port)
    };
    let (transport, mut data) = TcpTransport::spawn(config);
    let mut status = transport.status();

    let mut socket = accept(&listener).await;
    socket.write_all(b"only\n").await.unwrap();
    drop(socket);

    recv_until(&mut data, "only\n").await;
    let closed = wait_for(&mut status, |s| s.state == LinkState::Closed).await;
    assert_eq!(closed.attempts, 1);
    assert!(timeout(Duration::from_millis(200), listener.accept()).await.is_err());
}

#[tokio::test]
async fn test_stale_link_is_reset() {
    let (listener, port) = listener().await;
    let config = TcpTransportConfig {
        timeout: Duration::from_millis(100),
        stale_after: Duration::from_millis(50),
        ..config(port)
    };
    let (transport, _data) = TcpTransport::spawn(config);
    let mut status = transport.status();

    // the peer never sends anything
    let _silent = accept(&listener).await;
    let _reconnected = accept(&listener).await;
    let current = wait_for(&mut status, |s| s.attempts >= 2).await;
    assert!(current.attempts >= 2);

    transport.shutdown().await;
}

#[tokio::test]
async fn test_one_shot_stale_link_stays_closed() {
    let (listener, port) = listener().await;
    let config = TcpTransportConfig {
        reconnect: false,
        timeout: Duration::from_millis(100),
        stale_after: Duration::from_millis(50),
        ..config(port)
    };
    let (transport, _data) = TcpTransport::spawn(config);
    let mut status = transport.status();

    let _silent = accept(&listener).await;
    let closed = wait_for(&mut status, |s| s.state == LinkState::Closed).await;
    assert_eq!(closed.attempts, 1);
    assert!(timeout(Duration::from_secs(1), listener.accept()).await.is_err());

    transport.shutdown().await;
}

// ============================================================================
// TCP delta provider
// ============================================================================

#[tokio::test]
async fn test_tcp_provider_feeds_hub() {
    let (listener, port) = listener().await;
    let server = SignalKServer::new(
        ServerConfig {
            self_context: SELF.to_string(),
            ..ServerConfig::default()
        },
        Arc::new(NoMetadata),
    );
    let cache = server.cache();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let provider = TcpDeltaProvider::new("nmea-gw", config(port)).spawn(server.event_sender(), shutdown_rx);
    let hub = tokio::spawn(server.run());

    let mut socket = accept(&listener).await;
    socket
        .write_all(b"{\"updates\":[{\"values\":[{\"path\":\"navigation.speed")
        .await
        .unwrap();
    socket
        .write_all(b"OverGround\",\"value\":3.85}]}]}\nnot json\n{\"context\":\"vessels.self\",\"updates\":[{\"values\":[{\"path\":\"environment.depth.belowKeel\",\"value\":2.1}]}]}\n")
        .await
        .unwrap();

    timeout(Duration::from_secs(5), async {
        loop {
            if cache.read().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Timeout waiting for deltas");

    shutdown_tx.send(true).unwrap();
    provider.await.unwrap().unwrap();
    hub.await.unwrap();

    let cache = cache.read().await;
    let own = cache.build_full(Some(SELF), &[]).unwrap();
    assert_eq!(own["navigation"]["speedOverGround"]["value"], 3.85);
    assert_eq!(own["navigation"]["speedOverGround"]["$source"], "nmea-gw");
    assert_eq!(own["environment"]["depth"]["belowKeel"]["value"], 2.1);
}
