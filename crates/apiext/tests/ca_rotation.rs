#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use emissary_apiext::{ApiExtConfig, CaAction, CaManager, CaSecretController, CertAuthority, CrdPatchController};
use emissary_core::{Clock, SystemClock};
use emissary_kubehub::fake::FakeCluster;
use emissary_kubehub::{CanonicalCache, Client};
use kube::core::DynamicObject;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;

fn crd(plural: &str, group: &str, versions: &[&str]) -> DynamicObject {
    let versions: Vec<serde_json::Value> = versions
        .iter()
        .enumerate()
        .map(|(i, v)| serde_json::json!({ "name": v, "served": true, "storage": i == 0 }))
        .collect();
    serde_json::from_value(serde_json::json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": { "name": format!("{plural}.{group}") },
        "spec": {
            "group": group,
            "names": { "kind": plural, "plural": plural },
            "scope": "Namespaced",
            "versions": versions
        }
    }))
    .unwrap()
}

fn bundle_of(fake: &FakeCluster, name: &str) -> Option<String> {
    let obj = fake.objects("CustomResourceDefinition").into_iter().find(|c| c.name_any() == name)?;
    obj.data["spec"]["conversion"]["webhook"]["clientConfig"]["caBundle"].as_str().map(str::to_string)
}

fn stored_ca(fake: &FakeCluster, cfg: &ApiExtConfig) -> Option<String> {
    let secret = fake.objects("Secret").into_iter().find(|s| s.name_any() == cfg.ca_secret_name)?;
    secret.data["data"]["tls.crt"].as_str().map(str::to_string)
}

async fn eventually<F: Fn() -> bool>(what: &str, f: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while !f() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

const PATCHED: [&str; 3] = ["mappings.getambassador.io", "hosts.getambassador.io", "listeners.getambassador.io"];

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rotated_ca_reaches_every_multi_version_crd() {
    let fake = Arc::new(FakeCluster::new());
    let client = Client::with_cache(fake.clone(), Arc::new(CanonicalCache::default()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cfg = ApiExtConfig { rsa_bits: 2048, ..ApiExtConfig::default() };

    for plural in ["mappings", "hosts", "listeners"] {
        fake.apply(crd(plural, "getambassador.io", &["v2", "v3alpha1"])).unwrap();
    }
    fake.apply(crd("devportals", "getambassador.io", &["v3alpha1"])).unwrap();
    fake.apply(crd("widgets", "example.com", &["v1", "v2"])).unwrap();

    let authority = Arc::new(CertAuthority::new(clock.clone(), cfg.rsa_bits));
    let crds = Arc::new(CrdPatchController::new(Arc::new(client.clone()), authority.clone(), &cfg));
    let secrets = CaSecretController::new(authority.clone(), clock.clone(), &cfg);
    let manager = CaManager::new(Arc::new(client.clone()), clock.clone(), &cfg);

    let cancel = CancellationToken::new();
    let tasks = {
        let (c1, c2, k1, k2) = (client.clone(), client.clone(), cancel.clone(), cancel.clone());
        let crds = crds.clone();
        vec![
            tokio::spawn(async move { secrets.run(&c1, k1).await }),
            tokio::spawn(async move { crds.run(&c2, k2).await }),
        ]
    };

    // nothing to inject yet
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(PATCHED.iter().all(|n| bundle_of(&fake, n).is_none()));
    assert!(!crds.crds_ready().await.unwrap());

    assert_eq!(manager.reconcile().await.unwrap(), CaAction::Created);
    let first = stored_ca(&fake, &cfg).unwrap();
    eventually("first bundle on every CRD", || PATCHED.iter().all(|n| bundle_of(&fake, n).as_deref() == Some(first.as_str()))).await;
    assert!(authority.is_ready());
    assert!(crds.crds_ready().await.unwrap());
    assert_eq!(manager.reconcile().await.unwrap(), CaAction::Kept);

    // untouched: single version, foreign group
    assert!(bundle_of(&fake, "devportals.getambassador.io").is_none());
    assert!(bundle_of(&fake, "widgets.example.com").is_none());

    // secret deleted out from under us: the webhook drops its CA, the
    // leader mints a new one and every CRD follows
    fake.remove("Secret", Some(&cfg.namespace), &cfg.ca_secret_name).unwrap();
    eventually("authority cleared", || !authority.is_ready()).await;
    assert_eq!(manager.reconcile().await.unwrap(), CaAction::Created);
    let second = stored_ca(&fake, &cfg).unwrap();
    assert_ne!(first, second);
    eventually("second bundle on every CRD", || PATCHED.iter().all(|n| bundle_of(&fake, n).as_deref() == Some(second.as_str()))).await;
    assert!(crds.crds_ready().await.unwrap());

    cancel.cancel();
    for t in tasks {
        tokio::time::timeout(Duration::from_secs(5), t).await.unwrap().unwrap().unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupt_secret_clears_the_authority_until_repaired() {
    let fake = Arc::new(FakeCluster::new());
    let client = Client::with_cache(fake.clone(), Arc::new(CanonicalCache::default()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cfg = ApiExtConfig { rsa_bits: 2048, ..ApiExtConfig::default() };
    let authority = Arc::new(CertAuthority::new(clock.clone(), cfg.rsa_bits));
    let secrets = CaSecretController::new(authority.clone(), clock.clone(), &cfg);
    let manager = CaManager::new(Arc::new(client.clone()), clock.clone(), &cfg);

    let junk: DynamicObject = serde_json::from_value(serde_json::json!({
        "apiVersion": "v1", "kind": "Secret",
        "metadata": { "name": cfg.ca_secret_name, "namespace": cfg.namespace },
        "type": "kubernetes.io/tls",
        "data": { "tls.crt": "bm90IGEgY2VydA==", "tls.key": "bm90IGEga2V5" }
    }))
    .unwrap();
    fake.apply(junk).unwrap();

    let cancel = CancellationToken::new();
    let task = {
        let (client, cancel) = (client.clone(), cancel.clone());
        tokio::spawn(async move { secrets.run(&client, cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!authority.is_ready());

    assert_eq!(manager.reconcile().await.unwrap(), CaAction::Renewed);
    eventually("authority loaded", || authority.is_ready()).await;
    let stored = base64::engine::general_purpose::STANDARD.decode(stored_ca(&fake, &cfg).unwrap()).unwrap();
    assert_eq!(authority.current().unwrap().cert_pem.as_bytes(), stored.as_slice());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
}
