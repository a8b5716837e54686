//! Engine sessions over the TCP backend on localhost

use std::sync::Arc;
use std::time::Duration;

use bluechat_core::{
    ConnectionEngine, ConnectionEvent, DeviceRegistry, DiscoveryController, EngineConfig,
    EventStream, Message, PeerDevice,
};
use bluechat_platform::{TcpRadio, TcpRadioConfig};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn engine_for(radio: &Arc<TcpRadio>) -> ConnectionEngine {
    let config = EngineConfig::default();
    let discovery = DiscoveryController::new(radio.clone(), DeviceRegistry::new(), config.clone());
    ConnectionEngine::new(radio.clone(), discovery, config).expect("valid config")
}

async fn next(events: &mut EventStream) -> Option<ConnectionEvent> {
    timeout(WAIT, events.next_event())
        .await
        .expect("event should arrive within timeout")
}

async fn bound_peer(radio: &TcpRadio) -> PeerDevice {
    let addr = timeout(WAIT, async {
        loop {
            if let Some(addr) = radio.bound_addr() {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("listener should bind");
    PeerDevice::named("server", addr.to_string())
}

#[tokio::test]
async fn test_chat_over_localhost() {
    let server_radio = TcpRadio::new(TcpRadioConfig::new().with_listen_addr("127.0.0.1:0"));
    let client_radio = TcpRadio::new(TcpRadioConfig::new().with_listen_addr("127.0.0.1:0"));
    let server = engine_for(&server_radio);
    let client = engine_for(&client_radio);

    let mut server_events = server.listen();
    let peer = bound_peer(&server_radio).await;
    let mut client_events = client.dial(peer);

    assert_eq!(next(&mut client_events).await, Some(ConnectionEvent::Established));
    assert_eq!(next(&mut server_events).await, Some(ConnectionEvent::Established));

    assert_eq!(client.send("hello").await, Some(Message::local("hello")));
    assert_eq!(
        next(&mut server_events).await,
        Some(ConnectionEvent::TransferSucceeded(Message::remote("hello")))
    );

    client.release();
    assert_eq!(
        next(&mut server_events).await,
        Some(ConnectionEvent::failed("Connection lost"))
    );
}

#[tokio::test]
async fn test_dial_refused_reports_connection_failed() {
    // Bind and drop to find a port with nothing listening
    let vacant = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    let radio = TcpRadio::new(TcpRadioConfig::new());
    let engine = engine_for(&radio);
    let mut events = engine.dial(PeerDevice::new(None, vacant.to_string()));

    assert_eq!(
        next(&mut events).await,
        Some(ConnectionEvent::failed("Connection failed"))
    );
    assert_eq!(next(&mut events).await, None);
}

#[tokio::test]
async fn test_discovery_lists_configured_peers() {
    let radio = TcpRadio::new(
        TcpRadioConfig::new()
            .with_peer(PeerDevice::named("desk", "127.0.0.1:9001"))
            .with_peer(PeerDevice::named("laptop", "127.0.0.1:9002")),
    );
    let engine = engine_for(&radio);

    engine.discovery().start_discovery().await.unwrap();
    let mut snapshots = engine.discovery().registry().subscribe();
    let snapshot = timeout(WAIT, snapshots.wait_for(|s| s.scanned.len() == 2))
        .await
        .unwrap()
        .unwrap()
        .clone();

    assert_eq!(snapshot.paired.len(), 2);
    assert!(snapshot.find("127.0.0.1:9002").is_some());
    engine.discovery().stop_discovery().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_release_then_listen_reuses_fixed_port() {
    const ADDR: &str = "127.0.0.1:47911";
    let radio = TcpRadio::new(TcpRadioConfig::new().with_listen_addr(ADDR));
    let engine = engine_for(&radio);

    for round in 0..20 {
        let mut events = engine.listen();

        // Being reachable proves the endpoint is bound for this round
        let stream = timeout(WAIT, async {
            loop {
                match tokio::net::TcpStream::connect(ADDR).await {
                    Ok(stream) => return stream,
                    Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            }
        })
        .await
        .expect("listener should accept");
        assert_eq!(
            next(&mut events).await,
            Some(ConnectionEvent::Established),
            "round {round}"
        );

        engine.release();
        assert_eq!(next(&mut events).await, None, "round {round}");
        drop(stream);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_immediate_relisten_does_not_report_server_closed() {
    const ADDR: &str = "127.0.0.1:47912";
    let radio = TcpRadio::new(TcpRadioConfig::new().with_listen_addr(ADDR));
    let engine = engine_for(&radio);

    for _ in 0..20 {
        let first = engine.listen();
        tokio::time::sleep(Duration::from_millis(2)).await;
        engine.release();
        drop(first);
    }

    let mut events = engine.listen();
    let _client = timeout(WAIT, async {
        loop {
            match tokio::net::TcpStream::connect(ADDR).await {
                Ok(stream) => return stream,
                Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    })
    .await
    .expect("listener should accept");
    assert_eq!(next(&mut events).await, Some(ConnectionEvent::Established));
    engine.release();
}
