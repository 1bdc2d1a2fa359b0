//! Watches the CA Secret and installs whatever it holds into the authority.

use std::sync::Arc;

use anyhow::Context;
use emissary_core::{Clock, Query};
use emissary_kubehub::Client;
use emissary_store::Accumulator;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::authority::CertAuthority;
use crate::ca;
use crate::config::ApiExtConfig;

#[derive(Debug, Default, Deserialize)]
struct View {
    #[serde(default)]
    secret: Vec<Secret>,
}

pub struct CaSecretController {
    authority: Arc<CertAuthority>,
    clock: Arc<dyn Clock>,
    namespace: String,
    name: String,
}

impl CaSecretController {
    pub fn new(authority: Arc<CertAuthority>, clock: Arc<dyn Clock>, cfg: &ApiExtConfig) -> Self {
        Self { authority, clock, namespace: cfg.namespace.clone(), name: cfg.ca_secret_name.clone() }
    }

    pub fn query(&self) -> Query {
        Query::new("secret", "Secret").in_namespace(&self.namespace).with_fields(format!("metadata.name={}", self.name))
    }

    /// Install the CA held by the watched Secret, or nothing when it is
    /// gone or unparseable. Returns whether the authority changed.
    pub fn install(&self, secrets: &[Secret]) -> bool {
        let found = secrets.iter().find(|s| s.name_any() == self.name);
        let next = match found {
            None => None,
            Some(secret) => match ca::parse_ca_secret(secret, self.clock.now()) {
                Ok(ca) => Some(ca),
                Err(e) => {
                    warn!(secret = %self.name, error = %e, "apiext: CA secret unusable");
                    None
                }
            },
        };
        self.authority.set_ca(next)
    }

    pub async fn run(&self, client: &Client, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut acc = Accumulator::watch(client, vec![self.query()], &cancel).await.context("watching CA secret")?;
        info!(namespace = %self.namespace, secret = %self.name, "apiext: watching CA secret");
        let mut view = View::default();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                token = acc.changed().recv() => if token.is_none() { break },
            }
            acc.update(&mut view).context("reading CA secret snapshot")?;
            self.install(&view.secret);
        }
        acc.shutdown().await;
        Ok(())
    }
}
