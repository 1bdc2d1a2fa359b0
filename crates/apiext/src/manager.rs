//! Leader-only loop keeping the CA Secret present and unexpired.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use emissary_core::Clock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ca::{self, CaCert};
use crate::config::{key_size_for, ApiExtConfig};
use crate::stores::SecretStore;
use crate::ApiExtError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaAction {
    Created,
    Renewed,
    Kept,
}

pub struct CaManager {
    store: Arc<dyn SecretStore>,
    clock: Arc<dyn Clock>,
    namespace: String,
    name: String,
    rsa_bits: u32,
    interval: Duration,
}

impl CaManager {
    pub fn new(store: Arc<dyn SecretStore>, clock: Arc<dyn Clock>, cfg: &ApiExtConfig) -> Self {
        Self {
            store,
            clock,
            namespace: cfg.namespace.clone(),
            name: cfg.ca_secret_name.clone(),
            rsa_bits: cfg.rsa_bits,
            interval: cfg.ca_check_interval,
        }
    }

    async fn generate(&self, now: DateTime<Utc>) -> Result<CaCert, ApiExtError> {
        let bits = self.rsa_bits;
        let ca = tokio::task::spawn_blocking(move || ca::generate_ca(now, key_size_for(bits)))
            .await
            .map_err(|e| ApiExtError::CertGeneration(e.to_string()))??;
        metrics::counter!("apiext_ca_generated_total", 1u64);
        Ok(ca)
    }

    /// One pass: create the Secret if missing, regenerate it in place when it
    /// is unparseable or within the renewal window.
    pub async fn reconcile(&self) -> Result<CaAction, ApiExtError> {
        let now = self.clock.now();
        let Some(secret) = self.store.get_secret(&self.namespace, &self.name).await? else {
            let ca = self.generate(now).await?;
            self.store.create_secret(&ca::ca_secret(&ca, &self.namespace, &self.name)).await?;
            info!(secret = %self.name, not_after = %ca.not_after, "apiext: created CA secret");
            return Ok(CaAction::Created);
        };
        match ca::parse_ca_secret(&secret, now) {
            Ok(ca) if !ca.needs_renewal(now) => return Ok(CaAction::Kept),
            Ok(ca) => info!(secret = %self.name, not_after = %ca.not_after, "apiext: CA nearing expiry, renewing"),
            Err(e) => warn!(secret = %self.name, error = %e, "apiext: stored CA unusable, regenerating"),
        }
        let ca = self.generate(now).await?;
        self.store.patch_secret_data(&self.namespace, &self.name, ca::secret_data(&ca)).await?;
        info!(secret = %self.name, not_after = %ca.not_after, "apiext: renewed CA secret");
        Ok(CaAction::Renewed)
    }

    /// Reconcile now and on every tick until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            if let Err(e) = self.reconcile().await {
                warn!(error = %e, "apiext: CA manager pass failed");
            }
        }
        info!("apiext: CA manager stopped");
    }
}
