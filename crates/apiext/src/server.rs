//! HTTPS conversion webhook and HTTP probe servers.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::authority::CertAuthority;
use crate::crd_controller::CrdPatchController;

pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
pub const CA_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Hands out the certificate picked before the handshake resumed. `None`
/// makes rustls abort the handshake with an alert.
#[derive(Debug)]
struct Picked(Option<Arc<CertifiedKey>>);

impl ResolvesServerCert for Picked {
    fn resolve(&self, _hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> { self.0.clone() }
}

/// TLS 1.3 only, HTTP/1.1.
pub fn tls_config(key: Option<Arc<CertifiedKey>>) -> Result<Arc<ServerConfig>, rustls::Error> {
    let mut cfg = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(Picked(key)));
    cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(cfg))
}

/// Poll until the authority holds a CA. False when cancelled first.
pub async fn wait_for_ca(authority: &CertAuthority, cancel: &CancellationToken) -> bool {
    let mut logged = false;
    while !authority.is_ready() {
        if !logged {
            info!("apiext: waiting for CA before serving");
            logged = true;
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(CA_POLL_INTERVAL) => {}
        }
    }
    true
}

async fn serve_tls_connection(
    stream: TcpStream,
    authority: Arc<CertAuthority>,
    router: Router,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await.context("reading client hello")?;
    let sni = start.client_hello().server_name().map(str::to_string);
    let key = match authority.get_certificate(sni.as_deref()).await {
        Ok(key) => Some(key),
        Err(e) => {
            warn!(server_name = ?sni, error = %e, "apiext: no certificate for handshake");
            None
        }
    };
    let tls = start.into_stream(tls_config(key)?).await.context("TLS handshake")?;
    let conn = http1::Builder::new().serve_connection(TokioIo::new(tls), TowerToHyperService::new(router));
    tokio::pin!(conn);
    tokio::select! {
        res = conn.as_mut() => res.context("serving connection")?,
        _ = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await.context("draining connection")?;
        }
    }
    Ok(())
}

/// Accept TLS connections until cancelled, then give open connections
/// [`SHUTDOWN_GRACE`] to finish.
pub async fn serve_https(
    listener: TcpListener,
    authority: Arc<CertAuthority>,
    router: Router,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "apiext: webhook listening");
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let (authority, router, cancel) = (Arc::clone(&authority), router.clone(), cancel.clone());
                    conns.spawn(async move {
                        if let Err(e) = serve_tls_connection(stream, authority, router, cancel).await {
                            debug!(peer = %peer, error = %e, "apiext: connection ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "apiext: accept failed"),
            },
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
        }
    }
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async { while conns.join_next().await.is_some() {} }).await;
    if drained.is_err() {
        warn!(open = conns.len(), "apiext: shutdown grace elapsed, aborting connections");
        conns.abort_all();
    }
    Ok(())
}

pub fn probe_router(crds: Arc<CrdPatchController>) -> Router {
    Router::new().route("/probes/live", get(live)).route("/probes/ready", get(ready)).with_state(crds)
}

async fn live() -> (StatusCode, &'static str) { (StatusCode::OK, "Living!\n") }

async fn ready(State(crds): State<Arc<CrdPatchController>>) -> (StatusCode, &'static str) {
    match crds.crds_ready().await {
        Ok(true) => (StatusCode::OK, "Ready!\n"),
        Ok(false) => (StatusCode::INTERNAL_SERVER_ERROR, "Not ready\n"),
        Err(e) => {
            warn!(error = %e, "apiext: readiness check failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Not ready\n")
        }
    }
}

/// Plain HTTP probes, drained for at most [`SHUTDOWN_GRACE`] on cancel.
pub async fn serve_probes(listener: TcpListener, router: Router, cancel: CancellationToken) -> anyhow::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "apiext: probes listening");
    let shutdown = cancel.clone();
    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .into_future();
    let deadline = async {
        cancel.cancelled().await;
        tokio::time::sleep(SHUTDOWN_GRACE).await;
    };
    tokio::select! {
        res = server => res.context("probe server")?,
        _ = deadline => warn!("apiext: probe server drain timed out"),
    }
    Ok(())
}

pub async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr).await.with_context(|| format!("binding {addr}"))
}
