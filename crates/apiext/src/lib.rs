//! Emissary apiext: mints and rotates a self-signed CA, serves the CRD
//! conversion webhook with per-SNI leaf certificates, and injects the CA
//! bundle into every CRD that needs conversion.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use emissary_core::Clock;
use emissary_kubehub::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod authority;
pub mod ca;
mod cacert_controller;
pub mod config;
mod crd_controller;
mod error;
mod leader;
mod manager;
pub mod server;
mod stores;
pub mod webhook;

pub use authority::CertAuthority;
pub use ca::{CaCert, LeafCert};
pub use cacert_controller::CaSecretController;
pub use config::ApiExtConfig;
pub use crd_controller::{ca_bundle, canonical_conversion, needs_conversion, CrdOutcome, CrdPatchController};
pub use error::ApiExtError;
pub use leader::LeaderElector;
pub use manager::{CaAction, CaManager};
pub use stores::{CrdStore, SecretStore};

/// Run every apiext loop until `cancel` fires.
pub async fn run(client: Client, clock: Arc<dyn Clock>, cfg: ApiExtConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    info!(namespace = %cfg.namespace, identity = %cfg.identity, "apiext: starting");
    let authority = Arc::new(CertAuthority::new(Arc::clone(&clock), cfg.rsa_bits));
    let secrets = CaSecretController::new(Arc::clone(&authority), Arc::clone(&clock), &cfg);
    let crds = Arc::new(CrdPatchController::new(Arc::new(client.clone()), Arc::clone(&authority), &cfg));
    let elector = LeaderElector::new(client.clone(), Arc::clone(&clock), &cfg);
    let manager = CaManager::new(Arc::new(client.clone()), Arc::clone(&clock), &cfg);

    let https = server::bind(cfg.https_port).await?;
    let http = server::bind(cfg.http_port).await?;

    let leading = elector.run_while_leader(cancel.clone(), |term| {
        let manager = &manager;
        async move { manager.run(term).await }
    });
    let serving = async {
        let res = tokio::try_join!(
            server::serve_probes(http, server::probe_router(Arc::clone(&crds)), cancel.clone()),
            async {
                if !server::wait_for_ca(&authority, &cancel).await {
                    return Ok(());
                }
                server::serve_https(https, Arc::clone(&authority), webhook::router(), cancel.clone()).await
            },
        )
        .map(|_| ());
        if res.is_err() {
            cancel.cancel();
        }
        res
    };
    let controllers = async {
        let res = tokio::try_join!(secrets.run(&client, cancel.clone()), crds.run(&client, cancel.clone())).map(|_| ());
        if let Err(e) = &res {
            warn!(error = %e, "apiext: controller failed, shutting down");
            cancel.cancel();
        }
        res
    };

    let (_, served, controlled) = tokio::join!(leading, serving, controllers);
    served.context("apiext servers")?;
    controlled.context("apiext controllers")?;
    info!("apiext: stopped");
    Ok(())
}
