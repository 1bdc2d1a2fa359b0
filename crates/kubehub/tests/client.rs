#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use emissary_core::Query;
use emissary_kubehub::fake::FakeCluster;
use emissary_kubehub::{CanonicalCache, Client, KatesError, Mapping, PatchBody};
use kube::core::DynamicObject;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;

fn cm(name: &str, value: &str) -> DynamicObject {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "v1", "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": "default" },
        "data": { "value": value }
    }))
    .unwrap()
}

fn client() -> (Arc<FakeCluster>, Client) {
    let fake = Arc::new(FakeCluster::new());
    let client = Client::with_cache(fake.clone(), Arc::new(CanonicalCache::default()));
    (fake, client)
}

#[tokio::test]
async fn writes_land_in_the_canonical_cache() {
    let (_fake, client) = client();
    let created = client.create(&cm("a", "1")).await.unwrap();
    let uid = created.uid().unwrap();
    assert_eq!(client.canonical().get(&uid), Some(Some(created.clone())));

    let mut next = created.clone();
    next.data["data"]["value"] = "2".into();
    let updated = client.update(&next).await.unwrap();
    assert_eq!(client.canonical().get(&uid).unwrap().unwrap().resource_version(), updated.resource_version());

    let patched = client
        .patch(&updated, PatchBody::Merge(serde_json::json!({ "data": { "value": "3" } })))
        .await
        .unwrap();
    assert_eq!(client.canonical().get(&uid).unwrap().unwrap().data["data"]["value"], "3");
    assert_ne!(patched.resource_version(), updated.resource_version());

    client.delete(&patched).await.unwrap();
    assert_eq!(client.canonical().get(&uid), Some(None));
}

#[tokio::test]
async fn upsert_creates_then_merges_and_survives_conflicts() {
    let (fake, client) = client();
    let first = client.upsert(&cm("a", "1")).await.unwrap();
    assert_eq!(first.data["data"]["value"], "1");

    fake.inject_conflicts(2);
    let second = client.upsert(&cm("a", "2")).await.unwrap();
    assert_eq!(second.uid(), first.uid());
    assert_eq!(second.data["data"]["value"], "2");

    fake.inject_conflicts(10);
    let err = client.upsert(&cm("a", "3")).await.unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn get_and_list_resolve_short_names() {
    let (_fake, client) = client();
    client.create(&cm("a", "1")).await.unwrap();
    client.create(&cm("b", "1")).await.unwrap();
    let got = client.get("cm", Some("default"), "a").await.unwrap();
    assert_eq!(got.name_any(), "a");
    let all = client.list(&Query::new("cms", "configmaps").in_namespace("default")).await.unwrap();
    assert_eq!(all.len(), 2);
    let err = client.get("cm", Some("default"), "zzz").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn unknown_kinds_are_rediscovered_after_invalidation() {
    let (fake, client) = client();
    let err = client.mapping_for("Widget").await.unwrap_err();
    assert!(matches!(err, KatesError::InvalidKind(_)));
    fake.add_mapping(Mapping::new("example.com", "v1", "Widget", "widgets", true));
    // discovery just ran; a second miss inside the interval does not rediscover
    assert!(client.mapping_for("Widget").await.is_err());
    client.invalidate_cache();
    assert_eq!(client.mapping_for("widgets").await.unwrap().group, "example.com");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wait_for_polls_until_kind_is_served() {
    let (fake, client) = client();
    let cancel = CancellationToken::new();
    let waiter = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.wait_for(&cancel, "Gadget").await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    fake.add_mapping(Mapping::new("example.com", "v1", "Gadget", "gadgets", true));
    let m = tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap().unwrap();
    assert_eq!(m.plural, "gadgets");

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    assert!(client.wait_for(&cancelled, "Nope").await.is_err());
}
