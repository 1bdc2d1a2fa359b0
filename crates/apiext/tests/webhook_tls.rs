#![forbid(unsafe_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use emissary_apiext::{ca, server, webhook, ApiExtConfig, CertAuthority, CrdOutcome, CrdPatchController};
use emissary_core::{Clock, ManualClock};
use emissary_kubehub::fake::FakeCluster;
use emissary_kubehub::{CanonicalCache, Client};
use rcgen::RsaKeySize;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const SNI: &str = "emissary-apiext.emissary-system.svc";

fn connector(ca_pem: &str) -> TlsConnector {
    let der = ::pem::parse(ca_pem.as_bytes()).unwrap();
    let mut roots = RootCertStore::empty();
    roots.add(CertificateDer::from(der.contents().to_vec())).unwrap();
    let cfg = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(cfg))
}

async fn start(authority: Arc<CertAuthority>, cancel: CancellationToken) -> (SocketAddr, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(server::serve_https(listener, authority, webhook::router(), cancel));
    (addr, task)
}

fn review_body() -> String {
    serde_json::json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "ConversionReview",
        "request": {
            "uid": "abc-123",
            "desiredAPIVersion": "getambassador.io/v3alpha1",
            "objects": [{ "apiVersion": "getambassador.io/v2", "kind": "Mapping", "metadata": { "name": "m" } }]
        }
    })
    .to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn converts_over_tls_with_a_leaf_for_the_sni() {
    let clock = ManualClock::new(Utc::now());
    let authority = Arc::new(CertAuthority::new(Arc::new(clock.clone()), 2048));
    let ca = ca::generate_ca(clock.now(), RsaKeySize::_2048).unwrap();
    let tls = connector(&ca.cert_pem);
    authority.set_ca(Some(ca));

    let cancel = CancellationToken::new();
    let (addr, task) = start(authority.clone(), cancel.clone()).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut conn = tls.connect(ServerName::try_from(SNI).unwrap(), stream).await.unwrap();
    assert_eq!(conn.get_ref().1.protocol_version(), Some(rustls::ProtocolVersion::TLSv1_3));

    let body = review_body();
    let req = format!(
        "POST /webhooks/crd/convert HTTP/1.1\r\nHost: {SNI}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    conn.write_all(req.as_bytes()).await.unwrap();
    let mut raw = String::new();
    conn.read_to_string(&mut raw).await.unwrap();
    assert!(raw.starts_with("HTTP/1.1 200"), "{raw}");
    let json = raw.split("\r\n\r\n").nth(1).unwrap();
    let out: serde_json::Value = serde_json::from_str(json).unwrap();
    assert_eq!(out["response"]["uid"], "abc-123");
    assert_eq!(out["response"]["result"]["status"], "Success");
    assert_eq!(out["response"]["convertedObjects"][0]["apiVersion"], "getambassador.io/v3alpha1");
    assert_eq!(authority.cached_leaves(), 1);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(7), task).await.unwrap().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_without_sni_or_ca_is_refused() {
    let clock = ManualClock::new(Utc::now());
    let authority = Arc::new(CertAuthority::new(Arc::new(clock.clone()), 2048));
    let ca = ca::generate_ca(clock.now(), RsaKeySize::_2048).unwrap();
    let tls = connector(&ca.cert_pem);

    let cancel = CancellationToken::new();
    let (addr, task) = start(authority.clone(), cancel.clone()).await;

    // no CA installed
    let stream = TcpStream::connect(addr).await.unwrap();
    assert!(tls.connect(ServerName::try_from(SNI).unwrap(), stream).await.is_err());

    // an IP server name sends no SNI
    authority.set_ca(Some(ca));
    let stream = TcpStream::connect(addr).await.unwrap();
    let ip = ServerName::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST).into());
    assert!(tls.connect(ip, stream).await.is_err());
    assert_eq!(authority.cached_leaves(), 0);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(7), task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn probes_report_ca_and_crd_state() {
    let fake = Arc::new(FakeCluster::new());
    let client = Client::with_cache(fake.clone(), Arc::new(CanonicalCache::default()));
    let clock = ManualClock::new(Utc::now());
    let authority = Arc::new(CertAuthority::new(Arc::new(clock.clone()), 2048));
    let cfg = ApiExtConfig::default();
    let crds = Arc::new(CrdPatchController::new(Arc::new(client), authority.clone(), &cfg));
    let router = server::probe_router(crds.clone());

    let get = |path: &'static str| {
        let router = router.clone();
        async move { router.oneshot(Request::builder().uri(path).body(Body::empty()).unwrap()).await.unwrap().status() }
    };
    assert_eq!(get("/probes/live").await, StatusCode::OK);
    assert_eq!(get("/probes/ready").await, StatusCode::INTERNAL_SERVER_ERROR);

    authority.set_ca(Some(ca::generate_ca(clock.now(), RsaKeySize::_2048).unwrap()));
    // no qualifying CRDs: vacuously ready
    assert_eq!(get("/probes/ready").await, StatusCode::OK);

    fake.apply(
        serde_json::from_value(serde_json::json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": { "name": "mappings.getambassador.io" },
            "spec": {
                "group": "getambassador.io",
                "names": { "kind": "Mapping", "plural": "mappings" },
                "scope": "Namespaced",
                "versions": [
                    { "name": "v2", "served": true, "storage": false },
                    { "name": "v3alpha1", "served": true, "storage": true }
                ]
            }
        }))
        .unwrap(),
    )
    .unwrap();
    assert_eq!(get("/probes/ready").await, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(crds.reconcile("mappings.getambassador.io").await.unwrap(), CrdOutcome::Patched);
    assert_eq!(get("/probes/ready").await, StatusCode::OK);
}
