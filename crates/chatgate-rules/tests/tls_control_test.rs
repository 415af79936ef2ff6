//! Rule dispatch over real TLS control connections
//!
//! rule source ──TLS──▶ RuleDispatcher ──▶ Firewall

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chatgate_proto::{FrameCodec, RuleEvent, RuleKind, RuleSpec};
use chatgate_rules::{
    ControlResources, ControlSource, DispatchEnd, DispatchError, DispatcherConfig, Firewall,
    RuleDispatcher,
};
use chatgate_transport::{acceptor_from_der, Endpoint, TlsClientConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn test_acceptor() -> TlsAcceptor {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let certs: Vec<CertificateDer<'static>> = vec![cert.cert.der().clone()];
    let key = PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());
    acceptor_from_der(certs, key).unwrap()
}

#[derive(Default)]
struct RecordingFirewall {
    calls: Mutex<Vec<(RuleKind, u16, IpAddr)>>,
}

impl RecordingFirewall {
    fn calls(&self) -> Vec<(RuleKind, u16, IpAddr)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Firewall for RecordingFirewall {
    async fn insert(&self, port: u16, ip: IpAddr) {
        self.calls.lock().unwrap().push((RuleKind::Insert, port, ip));
    }

    async fn delete(&self, port: u16, ip: IpAddr) {
        self.calls.lock().unwrap().push((RuleKind::Delete, port, ip));
    }
}

/// Rule source stand-in: accepts one TLS connection, writes the given frames
/// and closes
async fn rule_source(frames: Vec<Vec<u8>>) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = test_acceptor();

    let handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(socket).await.unwrap();
        for frame in frames {
            tls.write_all(&frame).await.unwrap();
        }
        tls.flush().await.unwrap();
        let _ = tls.shutdown().await;
    });

    (addr, handle)
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn frame<T: serde::Serialize>(msg: &T) -> Vec<u8> {
    FrameCodec::default().encode(msg).unwrap().to_vec()
}

#[tokio::test]
async fn test_single_control_stream_drives_firewall() {
    init_tracing();
    let (addr, source) = rule_source(vec![
        frame(&RuleEvent::insert(80, ip("1.2.3.4"))),
        frame(&RuleEvent::delete(80, ip("1.2.3.4"))),
    ])
    .await;

    let resources = ControlResources::new(&DispatcherConfig::default());
    let dispatcher = RuleDispatcher::connect(
        &ControlSource::Single(Endpoint::new("127.0.0.1", addr.port())),
        &TlsClientConfig::insecure(),
        &resources,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let firewall = RecordingFirewall::default();
    let outcome = tokio::time::timeout(Duration::from_secs(5), dispatcher.run(&firewall))
        .await
        .expect("dispatcher did not stop");

    assert_eq!(outcome.ended_by, DispatchEnd::StreamEnded("control"));
    assert_eq!(outcome.applied, 2);
    assert_eq!(
        firewall.calls(),
        vec![
            (RuleKind::Insert, 80, ip("1.2.3.4")),
            (RuleKind::Delete, 80, ip("1.2.3.4")),
        ]
    );
    source.await.unwrap();
}

#[tokio::test]
async fn test_split_control_streams_imply_kind() {
    init_tracing();
    let (inserts, insert_source) =
        rule_source(vec![frame(&RuleSpec { port: 443, ip: ip("10.0.0.7") })]).await;

    // The delete source stays open until the insert has been applied
    let delete_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let deletes = delete_listener.local_addr().unwrap();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let delete_source = tokio::spawn(async move {
        let (socket, _) = delete_listener.accept().await.unwrap();
        let mut tls = test_acceptor().accept(socket).await.unwrap();
        tls.write_all(&frame(&RuleSpec { port: 443, ip: ip("10.0.0.8") }))
            .await
            .unwrap();
        tls.flush().await.unwrap();
        let _ = release_rx.await;
    });

    let resources = ControlResources::new(&DispatcherConfig::default());
    let dispatcher = RuleDispatcher::connect(
        &ControlSource::Split {
            inserts: Endpoint::new("127.0.0.1", inserts.port()),
            deletes: Endpoint::new("127.0.0.1", deletes.port()),
        },
        &TlsClientConfig::insecure(),
        &resources,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let firewall = Arc::new(RecordingFirewall::default());
    let running = {
        let firewall = firewall.clone();
        tokio::spawn(async move { dispatcher.run(&*firewall).await })
    };

    // Insert stream ends on its own after one rule; that ends the dispatcher
    let outcome = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("dispatcher did not stop")
        .unwrap();
    let _ = release_tx.send(());
    insert_source.await.unwrap();
    delete_source.await.unwrap();

    assert_eq!(outcome.ended_by, DispatchEnd::StreamEnded("insert"));
    let calls = firewall.calls();
    assert!(calls.contains(&(RuleKind::Insert, 443, ip("10.0.0.7"))));
    assert!(calls
        .iter()
        .all(|call| *call == (RuleKind::Insert, 443, ip("10.0.0.7"))
            || *call == (RuleKind::Delete, 443, ip("10.0.0.8"))));
}

#[tokio::test]
async fn test_unreachable_stream_fails_connect() {
    init_tracing();
    let (inserts, _source) = rule_source(Vec::new()).await;

    // Bind then drop to get a port nobody listens on
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let deletes = unused.local_addr().unwrap();
    drop(unused);

    let resources = ControlResources::new(&DispatcherConfig::default());
    let result = RuleDispatcher::connect(
        &ControlSource::Split {
            inserts: Endpoint::new("127.0.0.1", inserts.port()),
            deletes: Endpoint::new("127.0.0.1", deletes.port()),
        },
        &TlsClientConfig::insecure(),
        &resources,
        &CancellationToken::new(),
    )
    .await;

    match result {
        Err(DispatchError::Dial { stream, .. }) => assert_eq!(stream, "delete"),
        Ok(_) => panic!("connect succeeded without a delete stream"),
    }
}
