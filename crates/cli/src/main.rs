use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use emissary_apiext::ApiExtConfig;
use emissary_core::snapshot::{AmbassadorMeta, ConfigSnapshot, KubernetesSnapshot};
use emissary_core::{Query, SystemClock};
use emissary_gateway::DispatcherConfig;
use emissary_health::{probe_routes, EnvoyProbe, HealthMachine, HttpEnvoyProbe};
use emissary_kubehub::{Client, KatesError};
use emissary_store::{Accumulator, AccumulatorConfig};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "emissary", version, about = "Emissary-ingress control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the CRD conversion webhook, CA manager and CA bundle injector
    Apiext {
        #[arg(long, env = "APIEXT_NAMESPACE")]
        namespace: Option<String>,
        #[arg(long, env = "APIEXT_HTTPS_PORT")]
        https_port: Option<u16>,
        #[arg(long, env = "APIEXT_HTTP_PORT")]
        http_port: Option<u16>,
    },
    /// Watch the cluster and emit a sanitised config snapshot on every change
    Watch {
        /// Namespace to watch (default: all)
        #[arg(long = "ns", env = "AMBASSADOR_NAMESPACE")]
        namespace: Option<String>,
        /// Write snapshots here instead of stdout
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
        /// Serve check_alive/check_ready here
        #[arg(long = "health-addr", default_value = "0.0.0.0:8877")]
        health_addr: SocketAddr,
    },
    /// One envoy ready check; exits 0 when ready, 1 otherwise
    Ready,
}

fn init_tracing() {
    let env = std::env::var("EMISSARY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("EMISSARY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid EMISSARY_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancelled on SIGINT or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "cannot listen for SIGTERM");
                    let _ = tokio::signal::ctrl_c().await;
                    token.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        token.cancel();
    });
    cancel
}

/// One query per snapshot field; the query name is the field name.
fn snapshot_queries(namespace: Option<&str>) -> Vec<Query> {
    const KINDS: &[(&str, &str)] = &[
        ("services", "Service"),
        ("endpoints", "Endpoints"),
        ("listeners", "Listener.getambassador.io"),
        ("hosts", "Host.getambassador.io"),
        ("mappings", "Mapping.getambassador.io"),
        ("tcpmappings", "TCPMapping.getambassador.io"),
        ("modules", "Module.getambassador.io"),
        ("tlscontexts", "TLSContext.getambassador.io"),
        ("ingresses", "Ingress.networking.k8s.io"),
        ("ingressclasses", "IngressClass.networking.k8s.io"),
        ("gateways", "Gateway.gateway.networking.k8s.io"),
        ("httproutes", "HTTPRoute.gateway.networking.k8s.io"),
        ("secrets", "Secret"),
        ("configMaps", "ConfigMap"),
    ];
    KINDS
        .iter()
        .map(|(name, kind)| {
            let q = Query::new(*name, *kind);
            // ingress classes are cluster-scoped
            match namespace {
                Some(ns) if *name != "ingressclasses" => q.in_namespace(ns),
                _ => q,
            }
        })
        .collect()
}

/// Drop queries whose kind the cluster does not serve.
async fn served_queries(client: &Client, queries: Vec<Query>) -> Result<Vec<Query>> {
    let mut out = Vec::with_capacity(queries.len());
    for q in queries {
        match client.mapping_for(&q.kind).await {
            Ok(_) => out.push(q),
            Err(KatesError::InvalidKind(_)) => warn!(query = %q.name, kind = %q.kind, "kind not served; skipping"),
            Err(e) => return Err(e).with_context(|| format!("resolving {}", q.kind)),
        }
    }
    Ok(out)
}

async fn cluster_id(client: &Client) -> String {
    match client.get("Namespace", None, "default").await {
        Ok(ns) => ns.uid().unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "cannot read default namespace; cluster id left empty");
            String::new()
        }
    }
}

async fn emit(snapshot: &ConfigSnapshot, output: Option<&PathBuf>) -> Result<()> {
    let json = serde_json::to_string_pretty(snapshot)?;
    match output {
        Some(path) => {
            let tmp = path.with_extension("tmp");
            tokio::fs::write(&tmp, json.as_bytes()).await.with_context(|| format!("writing {}", tmp.display()))?;
            tokio::fs::rename(&tmp, path).await.with_context(|| format!("renaming to {}", path.display()))?;
        }
        None => println!("{json}"),
    }
    Ok(())
}

async fn run_watch(namespace: Option<String>, output: Option<PathBuf>, health_addr: SocketAddr) -> Result<()> {
    let cancel = shutdown_token();
    let client = Client::try_default().await.context("connecting to cluster")?;
    let queries = served_queries(&client, snapshot_queries(namespace.as_deref())).await?;
    let meta = AmbassadorMeta {
        cluster_id: cluster_id(&client).await,
        ambassador_version: env!("CARGO_PKG_VERSION").to_string(),
        resolvers: DispatcherConfig::from_env().endpoint_resolvers,
        ..AmbassadorMeta::default()
    };

    let health = Arc::new(HealthMachine::from_env());
    let listener = tokio::net::TcpListener::bind(health_addr).await.with_context(|| format!("binding {health_addr}"))?;
    let probes = {
        let (router, cancel) = (probe_routes(Arc::clone(&health)), cancel.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).with_graceful_shutdown(async move { cancel.cancelled().await }).await
        })
    };
    info!(addr = %health_addr, queries = queries.len(), "watch: started");

    let mut acc = Accumulator::watch_with(&client, queries, &cancel, AccumulatorConfig::from_env()).await?;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            token = acc.changed().recv() => if token.is_none() { break },
        }
        let mut snapshot = ConfigSnapshot { ambassador_meta: Some(meta.clone()), ..ConfigSnapshot::default() };
        let mut kubernetes = KubernetesSnapshot::default();
        acc.filtered_update(&mut kubernetes, &mut snapshot.deltas, |_| true)?;
        snapshot.kubernetes = kubernetes;
        snapshot.sanitize();
        health.note_snapshot_sent();
        emit(&snapshot, output.as_ref()).await?;
        health.note_snapshot_processed();
        info!(objects = snapshot.kubernetes.object_count(), deltas = snapshot.deltas.len(), "watch: snapshot emitted");
    }
    acc.shutdown().await;
    probes.await.context("probe server task")?.context("probe server")?;
    Ok(())
}

async fn run_apiext(namespace: Option<String>, https_port: Option<u16>, http_port: Option<u16>) -> Result<()> {
    let mut cfg = ApiExtConfig::from_env();
    if let Some(ns) = namespace {
        cfg.namespace = ns;
    }
    cfg.https_port = https_port.unwrap_or(cfg.https_port);
    cfg.http_port = http_port.unwrap_or(cfg.http_port);
    let cancel = shutdown_token();
    let client = Client::try_default().await.context("connecting to cluster")?;
    emissary_apiext::run(client, Arc::new(SystemClock), cfg, cancel).await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Apiext { namespace, https_port, http_port } => run_apiext(namespace, https_port, http_port).await,
        Commands::Watch { namespace, output, health_addr } => run_watch(namespace, output, health_addr).await,
        Commands::Ready => {
            let probe = HttpEnvoyProbe::from_env();
            if probe.ready().await {
                println!("envoy is ready");
                Ok(())
            } else {
                eprintln!("envoy is not ready ({})", probe.url());
                std::process::exit(1);
            }
        }
    }
}
