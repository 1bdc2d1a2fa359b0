//! Lease-based leader election.
//!
//! Acquire and renew go through resourceVersion compare-and-swap: a Lease
//! that changed between read and write fails with 409 and the attempt
//! counts as lost rather than as an error.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use emissary_core::Clock;
use emissary_kubehub::{from_dynamic, to_dynamic, Client};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ApiExtConfig;
use crate::ApiExtError;

pub struct LeaderElector {
    client: Client,
    clock: Arc<dyn Clock>,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    retry_period: Duration,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    pub fn new(client: Client, clock: Arc<dyn Clock>, cfg: &ApiExtConfig) -> Self {
        Self {
            client,
            clock,
            lease_name: cfg.leader_election_id.clone(),
            namespace: cfg.namespace.clone(),
            identity: cfg.identity.clone(),
            lease_duration: cfg.lease_duration,
            retry_period: cfg.retry_period,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn identity(&self) -> &str { &self.identity }

    pub fn is_leader(&self) -> bool { self.is_leader.load(Ordering::SeqCst) }

    async fn get_lease(&self) -> Result<Option<Lease>, ApiExtError> {
        match self.client.get("Lease", Some(&self.namespace), &self.lease_name).await {
            Ok(obj) => Ok(Some(from_dynamic(&obj)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn lease(&self, now: DateTime<Utc>, resource_version: Option<String>, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    /// Write `lease`, treating a 409 as "someone else got there first".
    async fn write(&self, lease: &Lease, create: bool) -> Result<bool, ApiExtError> {
        let obj = to_dynamic(lease)?;
        let res = if create { self.client.create(&obj).await } else { self.client.update(&obj).await };
        match res {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// One election round: create, renew or take over the Lease.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, ApiExtError> {
        let now = self.clock.now();
        let Some(existing) = self.get_lease().await? else {
            let won = self.write(&self.lease(now, None, 0), true).await?;
            if won {
                info!(identity = %self.identity, lease = %self.lease_name, "apiext: created lease");
            }
            return Ok(won);
        };

        let spec = existing.spec.clone().unwrap_or_default();
        if spec.holder_identity.as_deref() == Some(self.identity.as_str()) {
            let mut renewed = existing.clone();
            renewed.spec = Some(LeaseSpec { renew_time: Some(MicroTime(now)), ..spec });
            let ok = self.write(&renewed, false).await?;
            if !ok {
                warn!(identity = %self.identity, "apiext: lease renewal conflict");
            }
            return Ok(ok);
        }

        let expired = match (spec.holder_identity.as_deref(), &spec.renew_time, spec.lease_duration_seconds) {
            (None, _, _) => true,
            (Some(_), Some(rt), Some(secs)) => rt.0 + chrono::Duration::seconds(i64::from(secs)) < now,
            _ => true,
        };
        if !expired {
            return Ok(false);
        }
        let transitions = spec.lease_transitions.unwrap_or(0) + 1;
        let won = self.write(&self.lease(now, existing.metadata.resource_version.clone(), transitions), false).await?;
        if won {
            info!(identity = %self.identity, transitions, "apiext: took over lease");
        }
        Ok(won)
    }

    /// Retry until the lease is ours. False when cancelled first.
    async fn acquire(&self, cancel: &CancellationToken) -> bool {
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => return true,
                Ok(false) => debug!(identity = %self.identity, "apiext: lease held elsewhere"),
                Err(e) => warn!(identity = %self.identity, error = %e, "apiext: lease acquire failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.retry_period) => {}
            }
        }
    }

    /// Renew every retry period; returns once a renewal fails or `term` fires.
    async fn hold(&self, term: &CancellationToken) {
        loop {
            tokio::select! {
                _ = term.cancelled() => return,
                _ = tokio::time::sleep(self.retry_period) => {}
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "apiext: lease renewal failed");
                    return;
                }
            }
        }
    }

    /// Run `work` for as long as this replica leads. Each term gets its own
    /// token, cancelled when leadership is lost; the lease is released on
    /// shutdown.
    pub async fn run_while_leader<F, Fut>(&self, cancel: CancellationToken, mut work: F)
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = ()>,
    {
        info!(identity = %self.identity, lease = %self.lease_name, "apiext: waiting for leadership");
        while self.acquire(&cancel).await {
            info!(identity = %self.identity, "apiext: leadership acquired");
            self.is_leader.store(true, Ordering::SeqCst);
            let term = cancel.child_token();
            let fut = work(term.clone());
            tokio::pin!(fut);
            let lost = tokio::select! {
                _ = &mut fut => false,
                _ = self.hold(&term) => true,
            };
            if lost {
                term.cancel();
                fut.await;
            } else {
                self.hold(&term).await;
            }
            self.is_leader.store(false, Ordering::SeqCst);
            if cancel.is_cancelled() {
                break;
            }
            warn!(identity = %self.identity, "apiext: leadership lost");
        }
        if let Err(e) = self.release().await {
            warn!(identity = %self.identity, error = %e, "apiext: lease release failed");
        }
    }

    /// Clear the holder so another replica can take over without waiting
    /// out the lease.
    pub async fn release(&self) -> Result<(), ApiExtError> {
        let Some(mut lease) = self.get_lease().await? else { return Ok(()) };
        let Some(spec) = lease.spec.as_mut() else { return Ok(()) };
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return Ok(());
        }
        spec.holder_identity = None;
        spec.renew_time = None;
        if self.write(&lease, false).await? {
            info!(identity = %self.identity, "apiext: lease released");
        }
        Ok(())
    }
}
