//! Routing, rejection, passthrough and certificate swap tests for the SNI router

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
use tokio::net::TcpListener;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, ClientConnection, RootCertStore};
use tokio_util::sync::CancellationToken;

use crate::common::error::Result;
use crate::common::hostname::HostnamePattern;
use crate::common::types::{ConnectionInfo, ConnectionMetric, ConnectionOutcome};
use crate::server::dial::TcpDialer;
use crate::server::handler::{TerminatingHandler, TlsConnection};
use crate::server::router::{Binding, RouterConfig, SniRouter, accept_backoff};

struct GreetingHandler;

#[async_trait]
impl TerminatingHandler for GreetingHandler {
    async fn handle(&self, mut conn: TlsConnection, _info: ConnectionInfo) -> Result<()> {
        conn.write_all(b"hello from edge").await?;
        conn.shutdown().await?;
        Ok(())
    }
}

fn pattern(s: &str) -> HostnamePattern {
    HostnamePattern::parse(s).unwrap()
}

fn self_signed(names: &[&str]) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let names: Vec<String> = names.iter().map(ToString::to_string).collect();
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(names).unwrap();
    (
        cert.der().clone(),
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
    )
}

fn client_config(roots: &[CertificateDer<'static>]) -> Arc<ClientConfig> {
    let mut store = RootCertStore::empty();
    for root in roots {
        store.add(root.clone()).unwrap();
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    Arc::new(
        ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(store)
            .with_no_client_auth(),
    )
}

fn client_hello(sni: &str) -> Vec<u8> {
    let name = ServerName::try_from(sni.to_string()).unwrap();
    let mut conn = ClientConnection::new(client_config(&[]), name).unwrap();
    let mut hello = Vec::new();
    conn.write_tls(&mut hello).unwrap();
    hello
}

fn peer() -> ConnectionInfo {
    ConnectionInfo::public("192.0.2.44:50000".parse().unwrap())
}

fn unreachable_dialer() -> Binding {
    Binding::passthrough(TcpDialer::new("127.0.0.1:9"))
}

#[tokio::test]
async fn test_exact_match_wins_over_wildcard() {
    let router = SniRouter::new(RouterConfig::default());
    router
        .add_handler(&pattern("*.example.com"), unreachable_dialer())
        .await;
    router
        .add_handler(&pattern("www.example.com"), Binding::terminating(GreetingHandler))
        .await;

    let key = |sni: &'static str| {
        let router = router.clone();
        async move { router.lookup_binding(sni, false).await.map(|(k, _)| k) }
    };

    assert_eq!(key("www.example.com").await.as_deref(), Some("www.example.com"));
    assert_eq!(key("WWW.Example.com").await.as_deref(), Some("www.example.com"));
    assert_eq!(key("api.example.com").await.as_deref(), Some("*.example.com"));
    assert_eq!(key("example.com").await, None);
    assert_eq!(key("a.b.example.com").await, None);
    assert_eq!(key("www.example.org").await, None);
    assert_eq!(key("*.example.com").await, None);
    assert_eq!(key("").await, None);
}

#[tokio::test]
async fn test_rebinding_replaces_kind_and_delete_removes() {
    let router = SniRouter::new(RouterConfig::default());
    let www = pattern("www.example.com");

    router.add_handler(&www, unreachable_dialer()).await;
    router
        .add_handler(&www, Binding::terminating(GreetingHandler))
        .await;
    let (_, binding) = router.lookup_binding("www.example.com", false).await.unwrap();
    assert!(matches!(binding, Binding::Terminating(_)));

    router.mark_internal(&www).await;
    router.delete_handler(&www).await;
    assert!(router.lookup_binding("www.example.com", true).await.is_none());

    // The internal flag went with the binding.
    router.add_handler(&www, unreachable_dialer()).await;
    assert!(router.lookup_binding("www.example.com", false).await.is_some());
}

#[tokio::test]
async fn test_unknown_hostname_gets_zero_bytes() {
    let router = SniRouter::new(RouterConfig::default());
    router
        .add_handler(&pattern("*.example.com"), Binding::terminating(GreetingHandler))
        .await;

    let (mut client, server) = duplex(64 * 1024);
    let serve = tokio::spawn({
        let router = router.clone();
        async move { router.serve(Box::new(server), peer()).await }
    });

    client.write_all(&client_hello("unknown.example.org")).await.unwrap();
    let mut received = Vec::new();
    client.read_to_end(&mut received).await.unwrap();

    assert!(received.is_empty());
    assert_eq!(serve.await.unwrap(), ConnectionOutcome::UnknownHostname);
}

#[tokio::test]
async fn test_terminating_without_certificate_writes_nothing() {
    let router = SniRouter::new(RouterConfig::default());
    router
        .add_handler(&pattern("www.example.com"), Binding::terminating(GreetingHandler))
        .await;

    let (mut client, server) = duplex(64 * 1024);
    let serve = tokio::spawn({
        let router = router.clone();
        async move { router.serve(Box::new(server), peer()).await }
    });

    client.write_all(&client_hello("www.example.com")).await.unwrap();
    let mut received = Vec::new();
    client.read_to_end(&mut received).await.unwrap();

    assert!(received.is_empty());
    assert_eq!(serve.await.unwrap(), ConnectionOutcome::HandshakeFailed);
}

#[tokio::test]
async fn test_passthrough_replays_client_hello_exactly_once() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();

    let router = SniRouter::new(RouterConfig::default());
    router
        .add_handler(
            &pattern("*.example.com"),
            Binding::passthrough(TcpDialer::new(backend_addr.to_string())),
        )
        .await;

    let backend_task = tokio::spawn(async move {
        let (mut conn, _) = backend.accept().await.unwrap();
        let mut received = Vec::new();
        conn.read_to_end(&mut received).await.unwrap();
        conn.write_all(b"backend-reply").await.unwrap();
        received
    });

    let (mut client, server) = duplex(64 * 1024);
    let serve = tokio::spawn({
        let router = router.clone();
        async move { router.serve(Box::new(server), peer()).await }
    });

    let hello = client_hello("app.example.com");
    client.write_all(&hello).await.unwrap();
    client.write_all(b"after-hello").await.unwrap();
    client.shutdown().await.unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();

    let mut expected = hello.clone();
    expected.extend_from_slice(b"after-hello");
    assert_eq!(backend_task.await.unwrap(), expected);
    assert_eq!(reply, b"backend-reply");
    assert_eq!(serve.await.unwrap(), ConnectionOutcome::Forwarded);
}

#[tokio::test]
async fn test_terminating_handshake_uses_installed_chain() {
    let (cert, key) = self_signed(&["www.example.com"]);
    let router = SniRouter::new(RouterConfig::default());
    let www = pattern("www.example.com");
    router
        .add_handler(&www, Binding::terminating(GreetingHandler))
        .await;
    router
        .install_certificate(&www, vec![cert.clone()], key)
        .await
        .unwrap();

    let (client, server) = duplex(64 * 1024);
    let serve = tokio::spawn({
        let router = router.clone();
        async move { router.serve(Box::new(server), peer()).await }
    });

    let connector = TlsConnector::from(client_config(&[cert.clone()]));
    let name = ServerName::try_from("www.example.com").unwrap();
    let mut tls = connector.connect(name, client).await.unwrap();
    assert_eq!(
        tls.get_ref().1.peer_certificates().unwrap()[0].as_ref(),
        cert.as_ref()
    );

    let mut greeting = Vec::new();
    tls.read_to_end(&mut greeting).await.unwrap();
    assert_eq!(greeting, b"hello from edge");
    assert_eq!(serve.await.unwrap(), ConnectionOutcome::Terminated);
}

#[tokio::test]
async fn test_certificate_swap_is_atomic_for_handshakes() {
    let (cert_a, key_a) = self_signed(&["a.example.com"]);
    let (cert_b, key_b) = self_signed(&["a.example.com"]);
    let wildcard = pattern("*.example.com");

    let router = SniRouter::new(RouterConfig::default());
    router
        .add_handler(&wildcard, Binding::terminating(GreetingHandler))
        .await;
    router
        .install_certificate(&wildcard, vec![cert_a.clone()], key_a.clone_key())
        .await
        .unwrap();

    let installer = tokio::spawn({
        let router = router.clone();
        let (cert_a, cert_b) = (cert_a.clone(), cert_b.clone());
        async move {
            for round in 0..50 {
                let (cert, key) = if round % 2 == 0 {
                    (cert_b.clone(), key_b.clone_key())
                } else {
                    (cert_a.clone(), key_a.clone_key())
                };
                router
                    .install_certificate(&wildcard, vec![cert], key)
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
        }
    });

    let config = client_config(&[cert_a.clone(), cert_b.clone()]);
    let mut handshakes = Vec::new();
    for _ in 0..20 {
        let router = router.clone();
        let config = config.clone();
        handshakes.push(tokio::spawn(async move {
            let (client, server) = duplex(64 * 1024);
            let serve = tokio::spawn(async move { router.serve(Box::new(server), peer()).await });
            let name = ServerName::try_from("a.example.com").unwrap();
            let mut tls = TlsConnector::from(config).connect(name, client).await.unwrap();
            let presented = tls.get_ref().1.peer_certificates().unwrap()[0].clone();
            let mut greeting = Vec::new();
            tls.read_to_end(&mut greeting).await.unwrap();
            assert_eq!(serve.await.unwrap(), ConnectionOutcome::Terminated);
            presented
        }));
    }

    for handshake in handshakes {
        let presented = handshake.await.unwrap();
        assert!(presented == cert_a || presented == cert_b);
    }
    installer.await.unwrap();
}

#[tokio::test]
async fn test_internal_only_pattern_hidden_from_public() {
    let (cert, key) = self_signed(&["dev.example.com"]);
    let dev = pattern("*.example.com");
    let router = SniRouter::new(RouterConfig::default());
    router
        .add_handler(&dev, Binding::terminating(GreetingHandler))
        .await;
    router.install_certificate(&dev, vec![cert], key).await.unwrap();
    router.mark_internal(&dev).await;

    let (mut client, server) = duplex(64 * 1024);
    let serve = tokio::spawn({
        let router = router.clone();
        async move { router.serve(Box::new(server), peer()).await }
    });
    client.write_all(&client_hello("dev.example.com")).await.unwrap();
    let mut received = Vec::new();
    client.read_to_end(&mut received).await.unwrap();
    assert!(received.is_empty());
    assert_eq!(serve.await.unwrap(), ConnectionOutcome::UnknownHostname);

    assert!(router.lookup_binding("dev.example.com", true).await.is_some());
}

#[tokio::test]
async fn test_proxy_header_sets_reported_client_address() {
    let config = RouterConfig {
        proxy_protocol: true,
        ..RouterConfig::default()
    };
    let router = SniRouter::new(config);
    let seen: Arc<Mutex<Vec<ConnectionMetric>>> = Arc::default();
    router
        .set_metric_callback({
            let seen = seen.clone();
            Arc::new(move |metric: &ConnectionMetric| seen.lock().unwrap().push(metric.clone()))
        })
        .await;

    let (mut client, server) = duplex(64 * 1024);
    let serve = tokio::spawn({
        let router = router.clone();
        async move { router.serve(Box::new(server), peer()).await }
    });
    client
        .write_all(b"PROXY TCP4 198.51.100.9 203.0.113.5 5555 443\r\n")
        .await
        .unwrap();
    client.write_all(&client_hello("nobody.example.com")).await.unwrap();
    let mut received = Vec::new();
    client.read_to_end(&mut received).await.unwrap();
    assert_eq!(serve.await.unwrap(), ConnectionOutcome::UnknownHostname);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].client_addr, "198.51.100.9:5555".parse().unwrap());
    assert_eq!(seen[0].hostname.as_deref(), Some("nobody.example.com"));
    assert_eq!(seen[0].outcome.code(), 666);
}

#[tokio::test]
async fn test_malformed_proxy_header_fails_connection() {
    let config = RouterConfig {
        proxy_protocol: true,
        ..RouterConfig::default()
    };
    let router = SniRouter::new(config);

    let (mut client, server) = duplex(64 * 1024);
    let serve = tokio::spawn({
        let router = router.clone();
        async move { router.serve(Box::new(server), peer()).await }
    });
    client.write_all(b"PROXY TCP4 bogus\r\n").await.unwrap();
    let mut received = Vec::new();
    client.read_to_end(&mut received).await.unwrap();

    assert!(received.is_empty());
    assert_eq!(serve.await.unwrap(), ConnectionOutcome::ProxyHeaderInvalid);
}

#[tokio::test]
async fn test_garbage_instead_of_client_hello_is_handshake_failure() {
    let router = SniRouter::new(RouterConfig::default());

    let (mut client, server) = duplex(64 * 1024);
    let serve = tokio::spawn({
        let router = router.clone();
        async move { router.serve(Box::new(server), peer()).await }
    });
    client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
    let mut received = Vec::new();
    client.read_to_end(&mut received).await.unwrap();

    assert!(received.is_empty());
    assert_eq!(serve.await.unwrap(), ConnectionOutcome::HandshakeFailed);
}

#[tokio::test]
async fn test_accept_loop_serves_and_stops_on_cancel() {
    let (cert, key) = self_signed(&["www.example.com"]);
    let www = pattern("www.example.com");
    let router = SniRouter::new(RouterConfig::default());
    router
        .add_handler(&www, Binding::terminating(GreetingHandler))
        .await;
    router
        .install_certificate(&www, vec![cert.clone()], key)
        .await
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let accept_loop = tokio::spawn({
        let router = router.clone();
        let shutdown = shutdown.clone();
        async move { router.run(listener, false, shutdown).await }
    });

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let name = ServerName::try_from("www.example.com").unwrap();
    let mut tls = TlsConnector::from(client_config(&[cert]))
        .connect(name, stream)
        .await
        .unwrap();
    let mut greeting = Vec::new();
    tls.read_to_end(&mut greeting).await.unwrap();
    assert_eq!(greeting, b"hello from edge");

    shutdown.cancel();
    accept_loop.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_accept_backoff_waits_unless_shut_down() {
    let shutdown = CancellationToken::new();
    let started = tokio::time::Instant::now();
    assert!(accept_backoff(&shutdown).await);
    assert!(started.elapsed() >= std::time::Duration::from_millis(100));

    shutdown.cancel();
    let started = tokio::time::Instant::now();
    assert!(!accept_backoff(&shutdown).await);
    assert!(started.elapsed() < std::time::Duration::from_millis(100));
}
