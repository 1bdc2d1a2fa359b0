#![forbid(unsafe_code)]

mod common;

use std::time::Duration;

use common::*;
use emissary_core::{DeltaType, Query};
use emissary_kubehub::Client;
use emissary_store::Accumulator;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;

async fn bootstrapped(client: &Client, cancel: &CancellationToken) -> Accumulator {
    let mut acc = Accumulator::watch(client, vec![Query::new("cms", "ConfigMap").in_namespace("default")], cancel)
        .await
        .unwrap();
    assert!(next_token(&mut acc).await);
    let mut snap = Snap::default();
    acc.update(&mut snap).unwrap();
    acc
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn another_client_write_is_visible_before_the_watch_delivers_it() {
    let (fake, cache, writer) = setup();
    let reader = Client::with_cache(writer.backend(), cache.clone());
    let cancel = CancellationToken::new();
    let acc = bootstrapped(&reader, &cancel).await;

    fake.hold_watch_events();
    let created = writer.create(&cm("fresh")).await.unwrap();
    let mut snap = Snap::default();
    assert!(acc.update(&mut snap).unwrap());
    assert_eq!(snap.names(), vec!["fresh".to_string()]);

    let mut next = created.clone();
    next.data["data"]["value"] = "2".into();
    let updated = writer.update(&next).await.unwrap();
    assert!(acc.update(&mut snap).unwrap());
    assert_eq!(snap.cms[0].resource_version(), updated.resource_version());
    assert_eq!(snap.cms[0].data["data"]["value"], "2");

    // watch catches up: the view stays the same and the cache entry retires
    fake.release_watch_events();
    tokio::time::sleep(Duration::from_millis(200)).await;
    acc.update(&mut snap).unwrap();
    assert_eq!(snap.cms.len(), 1);
    assert_eq!(snap.cms[0].resource_version(), updated.resource_version());
    assert!(cache.get(&created.uid().unwrap()).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_delete_hides_object_until_watch_confirms() {
    let (fake, cache, client) = setup();
    let doomed = client.create(&cm("doomed")).await.unwrap();
    let cancel = CancellationToken::new();
    let acc = bootstrapped(&client, &cancel).await;

    fake.hold_watch_events();
    client.delete(&doomed).await.unwrap();
    let mut snap = Snap::default();
    let mut deltas = Vec::new();
    assert!(acc.filtered_update(&mut snap, &mut deltas, |_| true).unwrap());
    assert!(snap.cms.is_empty());
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].delta_type, DeltaType::Delete);

    fake.release_watch_events();
    tokio::time::sleep(Duration::from_millis(200)).await;
    deltas.clear();
    acc.filtered_update(&mut snap, &mut deltas, |_| true).unwrap();
    assert!(snap.cms.is_empty());
    // the delete was already reported once
    assert!(deltas.is_empty());
    assert!(cache.get(&doomed.uid().unwrap()).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_outside_the_query_are_not_overlaid() {
    let (fake, _cache, client) = setup();
    let cancel = CancellationToken::new();
    let acc = bootstrapped(&client, &cancel).await;

    fake.hold_watch_events();
    client.create(&cm_with("elsewhere", "other", "1")).await.unwrap();
    let mut snap = Snap::default();
    assert!(!acc.update(&mut snap).unwrap());
    assert!(snap.cms.is_empty());
}
