//! Keeps every multi-version CRD in the target group pointed at this webhook
//! with the current CA bundle.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use emissary_core::{Delta, Query};
use emissary_kubehub::Client;
use emissary_store::Accumulator;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceConversion, CustomResourceDefinition, ServiceReference, WebhookClientConfig, WebhookConversion,
};
use k8s_openapi::ByteString;
use kube::core::DynamicObject;
use kube::ResourceExt;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::authority::CertAuthority;
use crate::config::{ApiExtConfig, CONVERT_PATH};
use crate::stores::{CrdStore, CRD_KIND};
use crate::ApiExtError;

/// What the API server needs to call us for conversions.
pub fn canonical_conversion(cfg: &ApiExtConfig, ca_pem: &str) -> CustomResourceConversion {
    CustomResourceConversion {
        strategy: "Webhook".to_string(),
        webhook: Some(WebhookConversion {
            client_config: Some(WebhookClientConfig {
                ca_bundle: Some(ByteString(ca_pem.as_bytes().to_vec())),
                service: Some(ServiceReference {
                    namespace: cfg.namespace.clone(),
                    name: cfg.service_name.clone(),
                    path: Some(CONVERT_PATH.to_string()),
                    port: Some(443),
                }),
                url: None,
            }),
            conversion_review_versions: vec!["v1".to_string()],
        }),
    }
}

/// In the target group and serving more than one version.
pub fn needs_conversion(crd: &CustomResourceDefinition, group: &str) -> bool {
    crd.spec.group == group && crd.spec.versions.iter().filter(|v| v.served).count() > 1
}

pub fn ca_bundle(crd: &CustomResourceDefinition) -> Option<&[u8]> {
    crd.spec
        .conversion
        .as_ref()?
        .webhook
        .as_ref()?
        .client_config
        .as_ref()?
        .ca_bundle
        .as_ref()
        .map(|b| b.0.as_slice())
}

#[derive(Debug, Default, Deserialize)]
struct View {
    #[serde(default)]
    crds: Vec<DynamicObject>,
}

/// How one reconcile ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrdOutcome {
    /// Gone, outside the group, or serving a single version.
    Ignored,
    /// Already carried the canonical conversion config.
    InSync,
    /// Written with the canonical conversion config.
    Patched,
    /// Try again after the delay.
    Requeue(Duration),
}

pub struct CrdPatchController {
    store: Arc<dyn CrdStore>,
    authority: Arc<CertAuthority>,
    cfg: ApiExtConfig,
}

impl CrdPatchController {
    pub fn new(store: Arc<dyn CrdStore>, authority: Arc<CertAuthority>, cfg: &ApiExtConfig) -> Self {
        Self { store, authority, cfg: cfg.clone() }
    }

    /// Bring one CRD in line.
    pub async fn reconcile(&self, name: &str) -> Result<CrdOutcome, ApiExtError> {
        let Some(mut crd) = self.store.get_crd(name).await? else { return Ok(CrdOutcome::Ignored) };
        if !needs_conversion(&crd, &self.cfg.crd_group) {
            debug!(crd = %name, "apiext: CRD needs no conversion webhook");
            return Ok(CrdOutcome::Ignored);
        }
        let Some(ca) = self.authority.current() else {
            debug!(crd = %name, "apiext: no CA yet, requeueing");
            return Ok(CrdOutcome::Requeue(self.cfg.requeue_after));
        };
        let want = canonical_conversion(&self.cfg, &ca.cert_pem);
        if crd.spec.conversion.as_ref() == Some(&want) {
            return Ok(CrdOutcome::InSync);
        }
        crd.spec.conversion = Some(want);
        match self.store.replace_crd(&crd).await {
            Ok(_) => {
                metrics::counter!("apiext_crd_patched_total", 1u64);
                info!(crd = %name, "apiext: patched CRD conversion config");
                Ok(CrdOutcome::Patched)
            }
            Err(e) if e.is_conflict() => {
                debug!(crd = %name, "apiext: CRD update conflict, requeueing");
                Ok(CrdOutcome::Requeue(self.cfg.requeue_after))
            }
            Err(e) => Err(e),
        }
    }

    /// CA present and every qualifying CRD carrying it.
    pub async fn crds_ready(&self) -> Result<bool, ApiExtError> {
        let Some(ca) = self.authority.current() else { return Ok(false) };
        let crds = self.store.list_crds().await?;
        Ok(crds
            .iter()
            .filter(|c| needs_conversion(c, &self.cfg.crd_group))
            .all(|c| ca_bundle(c) == Some(ca.cert_pem.as_bytes())))
    }

    fn handle(&self, queue: &mut BTreeMap<String, Instant>, name: &str, res: Result<CrdOutcome, ApiExtError>) {
        match res {
            Ok(CrdOutcome::Requeue(after)) => {
                queue.insert(name.to_string(), Instant::now() + after);
            }
            Ok(_) => {
                queue.remove(name);
            }
            Err(e) if e.is_unauthorized() => {
                warn!(crd = %name, error = %e, "apiext: not allowed to update CRD, giving up");
                queue.remove(name);
            }
            Err(e) => {
                warn!(crd = %name, error = %e, "apiext: CRD reconcile failed, requeueing");
                queue.insert(name.to_string(), Instant::now() + self.cfg.requeue_after);
            }
        }
    }

    pub async fn run(&self, client: &Client, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut acc = Accumulator::watch(client, vec![Query::new("crds", CRD_KIND)], &cancel)
            .await
            .context("watching CRDs")?;
        let mut ca_rx = self.authority.subscribe();
        let group = self.cfg.crd_group.clone();
        info!(group = %group, "apiext: watching CRDs");

        let mut view = View::default();
        let mut known: BTreeSet<String> = BTreeSet::new();
        let mut queue: BTreeMap<String, Instant> = BTreeMap::new();
        loop {
            let next_due = queue.values().min().copied();
            tokio::select! {
                _ = cancel.cancelled() => break,
                token = acc.changed().recv() => {
                    if token.is_none() { break }
                    let mut deltas: Vec<Delta> = Vec::new();
                    acc.filtered_update(&mut view, &mut deltas, |o| o.data["spec"]["group"].as_str() == Some(group.as_str()))
                        .context("reading CRD snapshot")?;
                    known = view.crds.iter().map(|c| c.name_any()).collect();
                    let now = Instant::now();
                    for d in deltas.iter().filter(|d| known.contains(d.name())) {
                        queue.insert(d.name().to_string(), now);
                    }
                }
                Ok(()) = ca_rx.changed() => {
                    let now = Instant::now();
                    for name in &known {
                        queue.insert(name.clone(), now);
                    }
                }
                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    let now = Instant::now();
                    let due: Vec<String> = queue.iter().filter(|(_, at)| **at <= now).map(|(n, _)| n.clone()).collect();
                    for name in due {
                        let res = self.reconcile(&name).await;
                        self.handle(&mut queue, &name, res);
                    }
                }
            }
        }
        acc.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca;
    use crate::stores::MockCrdStore;
    use chrono::{DateTime, Utc};
    use emissary_core::{Clock, ManualClock};
    use emissary_kubehub::KatesError;
    use rcgen::RsaKeySize;

    fn crd(group: &str, versions: &[&str]) -> CustomResourceDefinition {
        let versions: Vec<serde_json::Value> = versions
            .iter()
            .enumerate()
            .map(|(i, v)| serde_json::json!({ "name": v, "served": true, "storage": i == 0 }))
            .collect();
        serde_json::from_value(serde_json::json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": { "name": format!("mappings.{group}"), "resourceVersion": "1" },
            "spec": {
                "group": group,
                "names": { "kind": "Mapping", "plural": "mappings" },
                "scope": "Namespaced",
                "versions": versions
            }
        }))
        .unwrap()
    }

    fn authority_with_ca() -> Arc<CertAuthority> {
        let clock = ManualClock::new(DateTime::<Utc>::from_timestamp(1_760_000_000, 0).unwrap());
        let authority = CertAuthority::new(Arc::new(clock.clone()), 2048);
        authority.set_ca(Some(ca::generate_ca(clock.now(), RsaKeySize::_2048).unwrap()));
        Arc::new(authority)
    }

    fn controller(store: MockCrdStore, authority: Arc<CertAuthority>) -> CrdPatchController {
        CrdPatchController::new(Arc::new(store), authority, &ApiExtConfig::default())
    }

    #[test]
    fn canonical_conversion_points_at_the_service() {
        let conv = canonical_conversion(&ApiExtConfig::default(), "PEM");
        let v = serde_json::to_value(&conv).unwrap();
        assert_eq!(v["strategy"], "Webhook");
        let cc = &v["webhook"]["clientConfig"];
        assert_eq!(cc["service"]["namespace"], "emissary-system");
        assert_eq!(cc["service"]["name"], "emissary-apiext");
        assert_eq!(cc["service"]["path"], "/webhooks/crd/convert");
        assert_eq!(cc["service"]["port"], 443);
        assert_eq!(cc["caBundle"], "UEVN");
        assert_eq!(v["webhook"]["conversionReviewVersions"], serde_json::json!(["v1"]));
    }

    #[tokio::test]
    async fn patches_multi_version_crds_once() {
        let authority = authority_with_ca();
        let pem = authority.current().unwrap().cert_pem.clone();
        let mut store = MockCrdStore::new();
        store.expect_get_crd().times(1).returning(|_| Ok(Some(crd("getambassador.io", &["v2", "v3alpha1"]))));
        store.expect_replace_crd().times(1).returning(move |c| {
            assert_eq!(ca_bundle(c), Some(pem.as_bytes()));
            Ok(c.clone())
        });
        let ctl = controller(store, authority.clone());
        assert_eq!(ctl.reconcile("mappings.getambassador.io").await.unwrap(), CrdOutcome::Patched);

        // already canonical: no write
        let mut patched = crd("getambassador.io", &["v2", "v3alpha1"]);
        patched.spec.conversion = Some(canonical_conversion(&ApiExtConfig::default(), &authority.current().unwrap().cert_pem));
        let mut store = MockCrdStore::new();
        store.expect_get_crd().returning(move |_| Ok(Some(patched.clone())));
        store.expect_replace_crd().never();
        assert_eq!(controller(store, authority).reconcile("mappings.getambassador.io").await.unwrap(), CrdOutcome::InSync);
    }

    #[tokio::test]
    async fn skips_single_version_foreign_and_missing_crds() {
        for found in [Some(crd("getambassador.io", &["v2"])), Some(crd("example.com", &["v1", "v2"])), None] {
            let mut store = MockCrdStore::new();
            store.expect_get_crd().returning(move |_| Ok(found.clone()));
            store.expect_replace_crd().never();
            assert_eq!(controller(store, authority_with_ca()).reconcile("x").await.unwrap(), CrdOutcome::Ignored);
        }
    }

    #[tokio::test]
    async fn requeues_without_ca_and_on_conflict() {
        let clock = ManualClock::new(Utc::now());
        let empty = Arc::new(CertAuthority::new(Arc::new(clock), 2048));
        let mut store = MockCrdStore::new();
        store.expect_get_crd().returning(|_| Ok(Some(crd("getambassador.io", &["v2", "v3alpha1"]))));
        store.expect_replace_crd().never();
        assert_eq!(controller(store, empty).reconcile("x").await.unwrap(), CrdOutcome::Requeue(Duration::from_secs(10)));

        let mut store = MockCrdStore::new();
        store.expect_get_crd().returning(|_| Ok(Some(crd("getambassador.io", &["v2", "v3alpha1"]))));
        store.expect_replace_crd().returning(|_| Err(KatesError::from_status(409, "conflict").into()));
        assert_eq!(controller(store, authority_with_ca()).reconcile("x").await.unwrap(), CrdOutcome::Requeue(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn unauthorized_is_dropped_other_errors_requeue() {
        let ctl = controller(MockCrdStore::new(), authority_with_ca());
        let mut queue = BTreeMap::from([("a".to_string(), Instant::now())]);
        ctl.handle(&mut queue, "a", Err(KatesError::from_status(403, "forbidden").into()));
        assert!(queue.is_empty());
        ctl.handle(&mut queue, "a", Err(KatesError::from_status(500, "boom").into()));
        assert!(queue.contains_key("a"));
        ctl.handle(&mut queue, "a", Ok(CrdOutcome::Requeue(Duration::from_secs(10))));
        assert!(queue.contains_key("a"));
        ctl.handle(&mut queue, "a", Ok(CrdOutcome::Patched));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn readiness_requires_the_current_bundle_everywhere() {
        let authority = authority_with_ca();
        let pem = authority.current().unwrap().cert_pem.clone();
        let mut good = crd("getambassador.io", &["v2", "v3alpha1"]);
        good.spec.conversion = Some(canonical_conversion(&ApiExtConfig::default(), &pem));
        let stale = crd("getambassador.io", &["v2", "v3alpha1"]);
        let single = crd("getambassador.io", &["v2"]);

        let (g, s) = (good.clone(), single.clone());
        let mut store = MockCrdStore::new();
        store.expect_list_crds().returning(move || Ok(vec![g.clone(), s.clone()]));
        assert!(controller(store, authority.clone()).crds_ready().await.unwrap());

        let mut store = MockCrdStore::new();
        store.expect_list_crds().returning(move || Ok(vec![good.clone(), stale.clone()]));
        assert!(!controller(store, authority).crds_ready().await.unwrap());
    }
}
