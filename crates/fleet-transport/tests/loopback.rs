//! Loopback tests: real TCP (and TLS) connections between transports in
//! one process.

use std::time::Duration;

use fleet_core::types::{HostAndPort, NodeDescriptor, ServiceId};
use fleet_transport::{
    CertificateAuthority, Packet, ServiceClient, TlsSettings, Transport, TransportConfig,
    TransportError, TransportEvent, handler,
};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

const SECRET: &str = "loopback-secret";
const WAIT: Duration = Duration::from_secs(5);

fn descriptor(id: &str) -> NodeDescriptor {
    NodeDescriptor {
        id: id.to_string(),
        listeners: vec![HostAndPort::new("127.0.0.1", 0)],
    }
}

fn transport(id: &str, peers: &[&str]) -> Transport {
    Transport::new(
        TransportConfig::new(descriptor(id), SECRET)
            .with_peers(peers.iter().map(|p| p.to_string())),
    )
}

async fn listen(transport: &Transport) -> HostAndPort {
    let addr = transport
        .listen(&HostAndPort::new("127.0.0.1", 0))
        .await
        .unwrap();
    HostAndPort::new("127.0.0.1", addr.port())
}

async fn next_event(rx: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for transport event")
        .unwrap()
}

/// Forward every packet on `channel` into an mpsc receiver.
fn capture(transport: &Transport, channel: &str) -> mpsc::UnboundedReceiver<Packet> {
    let (tx, rx) = mpsc::unbounded_channel();
    transport.register_handler(
        channel,
        handler(move |_, packet| {
            let tx = tx.clone();
            async move {
                tx.send(packet)?;
                Ok(())
            }
        }),
    );
    rx
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Packet>) -> Packet {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for packet")
        .unwrap()
}

fn test_service_id(node: &str) -> ServiceId {
    ServiceId {
        unique_id: Uuid::new_v4(),
        task_name: "Lobby".to_string(),
        task_service_id: 1,
        node_id: node.to_string(),
    }
}

#[tokio::test]
async fn peers_connect_and_exchange_packets() {
    let a = transport("node-a", &["node-b"]);
    let b = transport("node-b", &["node-a"]);
    let addr = listen(&a).await;

    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();
    let mut inbox = capture(&a, "test");

    assert!(b.connect(&addr).await);
    assert_eq!(
        next_event(&mut b_events).await,
        TransportEvent::PeerConnected {
            node_id: "node-a".into()
        }
    );
    assert_eq!(
        next_event(&mut a_events).await,
        TransportEvent::PeerConnected {
            node_id: "node-b".into()
        }
    );
    assert!(a.is_connected("node-b"));
    assert_eq!(b.connected_peers(), vec!["node-a".to_string()]);

    assert!(b.send("node-a", Packet::json("test", &"hello").unwrap()));
    let packet = recv(&mut inbox).await;
    assert_eq!(packet.decode::<String>().unwrap(), "hello");
}

#[tokio::test]
async fn send_to_unknown_peer_fails() {
    let a = transport("node-a", &[]);
    assert!(!a.send("node-z", Packet::json("test", &1).unwrap()));
    let err = a
        .send_and_await("node-z", Packet::json("test", &1).unwrap(), WAIT)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::NotConnected(_)));
    assert_eq!(a.pending_requests(), 0);
}

#[tokio::test]
async fn wrong_secret_is_rejected() {
    let a = transport("node-a", &["node-b"]);
    let addr = listen(&a).await;

    let b = Transport::new(
        TransportConfig::new(descriptor("node-b"), "wrong").with_peers(["node-a".to_string()]),
    );
    assert!(!b.connect(&addr).await);
    assert!(!b.is_connected("node-a"));
    assert!(!a.is_connected("node-b"));
}

#[tokio::test]
async fn unconfigured_peer_is_rejected() {
    let a = transport("node-a", &[]);
    let addr = listen(&a).await;

    let b = transport("node-b", &["node-a"]);
    assert!(!b.connect(&addr).await);
}

#[tokio::test]
async fn connect_to_closed_port_returns_false() {
    let a = transport("node-a", &["node-b"]);
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    assert!(!a.connect(&HostAndPort::new("127.0.0.1", port)).await);
}

#[tokio::test]
async fn request_response_roundtrip() {
    let a = transport("node-a", &["node-b"]);
    let b = transport("node-b", &["node-a"]);
    let addr = listen(&a).await;

    a.register_handler(
        "echo",
        handler(|ctx, packet| async move {
            let value: i64 = packet.decode()?;
            ctx.reply(packet.reply(&(value * 2))?);
            Ok(())
        }),
    );

    assert!(b.connect(&addr).await);
    let response = b
        .send_and_await("node-a", Packet::json("echo", &21).unwrap(), WAIT)
        .await
        .unwrap();
    assert_eq!(response.decode::<i64>().unwrap(), 42);
    assert_eq!(b.pending_requests(), 0);
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let a = transport("node-a", &["node-b"]);
    let b = transport("node-b", &["node-a"]);
    let addr = listen(&a).await;
    let _inbox = capture(&a, "void");

    assert!(b.connect(&addr).await);
    let err = b
        .send_and_await(
            "node-a",
            Packet::json("void", &()).unwrap(),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout));
    assert_eq!(b.pending_requests(), 0);
}

#[tokio::test]
async fn failing_handlers_do_not_break_the_connection() {
    let a = transport("node-a", &["node-b"]);
    let b = transport("node-b", &["node-a"]);
    let addr = listen(&a).await;

    a.register_handler(
        "test",
        handler(|_, _| async { Err(anyhow::anyhow!("boom")) }),
    );
    a.register_handler(
        "test",
        handler(|_, packet| async move {
            if packet.channel == "test" {
                panic!("handler panic");
            }
            Ok(())
        }),
    );
    let mut inbox = capture(&a, "test");

    assert!(b.connect(&addr).await);
    for i in 0..3 {
        assert!(b.send("node-a", Packet::json("test", &i).unwrap()));
        assert_eq!(recv(&mut inbox).await.decode::<i32>().unwrap(), i);
    }
    assert!(a.is_connected("node-b"));
}

#[tokio::test]
async fn shutdown_emits_disconnect_on_the_other_side() {
    let a = transport("node-a", &["node-b"]);
    let b = transport("node-b", &["node-a"]);
    let addr = listen(&a).await;
    let mut a_events = a.subscribe();

    assert!(b.connect(&addr).await);
    assert!(matches!(
        next_event(&mut a_events).await,
        TransportEvent::PeerConnected { .. }
    ));

    b.shutdown();
    assert_eq!(
        next_event(&mut a_events).await,
        TransportEvent::PeerDisconnected {
            node_id: "node-b".into()
        }
    );
    assert!(!a.is_connected("node-b"));
}

#[tokio::test]
async fn mutual_dial_keeps_one_working_connection() {
    let a = transport("node-a", &["node-b"]);
    let b = transport("node-b", &["node-a"]);
    let a_addr = listen(&a).await;
    let b_addr = listen(&b).await;
    let mut a_inbox = capture(&a, "test");
    let mut b_inbox = capture(&b, "test");

    assert!(a.connect(&b_addr).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(b.connect(&a_addr).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(a.send("node-b", Packet::json("test", &"to-b").unwrap()));
    assert!(b.send("node-a", Packet::json("test", &"to-a").unwrap()));
    assert_eq!(recv(&mut b_inbox).await.decode::<String>().unwrap(), "to-b");
    assert_eq!(recv(&mut a_inbox).await.decode::<String>().unwrap(), "to-a");
    assert!(a.is_connected("node-b"));
    assert!(b.is_connected("node-a"));
}

#[tokio::test]
async fn service_client_receives_broadcasts() {
    let a = transport("node-a", &[]);
    let addr = listen(&a).await;
    let mut events = a.subscribe();
    let mut inbox = capture(&a, "fleet:messages");

    let service_id = test_service_id("node-a");
    let mut client = ServiceClient::connect(&addr, service_id.clone(), SECRET, None, WAIT)
        .await
        .unwrap();
    assert_eq!(client.node().id, "node-a");
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::ServiceConnected {
            service_id: service_id.clone()
        }
    );

    a.broadcast(Packet::json("fleet:messages", &"hi workers").unwrap());
    let packet = tokio::time::timeout(WAIT, client.recv()).await.unwrap().unwrap();
    assert_eq!(packet.decode::<String>().unwrap(), "hi workers");

    assert!(client.send(Packet::json("fleet:messages", &"hi node").unwrap()));
    assert_eq!(recv(&mut inbox).await.decode::<String>().unwrap(), "hi node");

    drop(client);
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::ServiceDisconnected { service_id }
    );
}

#[tokio::test]
async fn service_client_with_wrong_secret_fails() {
    let a = transport("node-a", &[]);
    let addr = listen(&a).await;

    let result =
        ServiceClient::connect(&addr, test_service_id("node-a"), "wrong", None, WAIT).await;
    assert!(matches!(result, Err(TransportError::Handshake(_))));
}

#[tokio::test]
async fn tls_peers_exchange_packets() {
    let ca = CertificateAuthority::generate().unwrap();
    let ca_pem = ca.pair().cert_pem;
    let node_a = ca.issue("node-a", &["127.0.0.1".to_string()]).unwrap();
    let node_b = ca.issue("node-b", &["127.0.0.1".to_string()]).unwrap();

    let a = Transport::new(
        TransportConfig::new(descriptor("node-a"), SECRET)
            .with_peers(["node-b".to_string()])
            .with_tls(TlsSettings::from_pem(&node_a.cert_pem, &node_a.key_pem, &ca_pem).unwrap()),
    );
    let b = Transport::new(
        TransportConfig::new(descriptor("node-b"), SECRET)
            .with_peers(["node-a".to_string()])
            .with_tls(TlsSettings::from_pem(&node_b.cert_pem, &node_b.key_pem, &ca_pem).unwrap()),
    );
    let addr = listen(&a).await;
    let mut inbox = capture(&a, "test");

    assert!(b.connect(&addr).await);
    assert!(b.send("node-a", Packet::json("test", &"sealed").unwrap()));
    assert_eq!(recv(&mut inbox).await.decode::<String>().unwrap(), "sealed");
}

#[tokio::test]
async fn plain_client_cannot_reach_tls_listener() {
    let ca = CertificateAuthority::generate().unwrap();
    let node_a = ca.issue("node-a", &["127.0.0.1".to_string()]).unwrap();
    let a = Transport::new(
        TransportConfig::new(descriptor("node-a"), SECRET)
            .with_peers(["node-b".to_string()])
            .with_tls(
                TlsSettings::from_pem(&node_a.cert_pem, &node_a.key_pem, &ca.pair().cert_pem)
                    .unwrap(),
            ),
    );
    let addr = listen(&a).await;

    let mut b_config =
        TransportConfig::new(descriptor("node-b"), SECRET).with_peers(["node-a".to_string()]);
    b_config.handshake_timeout = Duration::from_millis(500);
    let b = Transport::new(b_config);
    assert!(!b.connect(&addr).await);
}
