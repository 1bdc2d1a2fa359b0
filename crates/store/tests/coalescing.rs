#![forbid(unsafe_code)]

mod common;

use std::time::{Duration, Instant};

use common::*;
use emissary_core::{DeltaType, Query};
use emissary_store::{Accumulator, AccumulatorConfig};
use kube::ResourceExt;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bursts_collapse_into_one_pending_token() {
    let (fake, _cache, client) = setup();
    let cancel = CancellationToken::new();
    let mut acc = Accumulator::watch(&client, vec![Query::new("cms", "ConfigMap")], &cancel).await.unwrap();
    assert!(next_token(&mut acc).await);
    let mut snap = Snap::default();
    acc.update(&mut snap).unwrap();

    for i in 0..20 {
        fake.apply(cm(&format!("cm-{i:02}"))).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(next_token(&mut acc).await);
    assert!(matches!(acc.changed().try_recv(), Err(TryRecvError::Empty)));

    let mut deltas = Vec::new();
    assert!(acc.filtered_update(&mut snap, &mut deltas, |_| true).unwrap());
    assert_eq!(snap.cms.len(), 20);
    assert_eq!(deltas.len(), 20);
    assert!(deltas.iter().all(|d| d.delta_type == DeltaType::Add));
    assert_eq!(deltas[0].name(), "cm-00");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn max_interval_spaces_notifications() {
    let (fake, _cache, client) = setup();
    let cancel = CancellationToken::new();
    let cfg = AccumulatorConfig { max_interval: Some(Duration::from_millis(500)), ..AccumulatorConfig::default() };
    let mut acc = Accumulator::watch_with(&client, vec![Query::new("cms", "ConfigMap")], &cancel, cfg).await.unwrap();
    assert!(next_token(&mut acc).await);
    let first = Instant::now();

    fake.apply(cm("late")).unwrap();
    assert!(next_token(&mut acc).await);
    assert!(first.elapsed() >= Duration::from_millis(400));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn filtered_objects_still_count_as_changes() {
    let (fake, _cache, client) = setup();
    let cancel = CancellationToken::new();
    let mut acc = Accumulator::watch(&client, vec![Query::new("cms", "ConfigMap")], &cancel).await.unwrap();
    assert!(next_token(&mut acc).await);
    let mut snap = Snap::default();
    acc.update(&mut snap).unwrap();

    fake.apply(cm("hidden")).unwrap();
    assert!(next_token(&mut acc).await);
    let mut deltas = Vec::new();
    let changed = acc.filtered_update(&mut snap, &mut deltas, |o| o.name_any() != "hidden").unwrap();
    assert!(changed);
    assert!(snap.cms.is_empty());
    assert_eq!(deltas.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_errors_and_relists_are_survived() {
    let (fake, _cache, client) = setup();
    fake.apply(cm("keep")).unwrap();
    fake.apply(cm("gone")).unwrap();
    let cancel = CancellationToken::new();
    let mut acc = Accumulator::watch(&client, vec![Query::new("cms", "ConfigMap")], &cancel).await.unwrap();
    assert!(next_token(&mut acc).await);
    let mut snap = Snap::default();
    acc.update(&mut snap).unwrap();
    assert_eq!(snap.cms.len(), 2);

    fake.inject_watch_error("connection reset");
    fake.remove("ConfigMap", Some("default"), "gone");
    fake.relist();
    assert!(next_token(&mut acc).await);
    let mut deltas = Vec::new();
    acc.filtered_update(&mut snap, &mut deltas, |_| true).unwrap();
    assert_eq!(snap.names(), vec!["keep".to_string()]);
    assert!(deltas.iter().any(|d| d.name() == "gone" && d.delta_type == DeltaType::Delete));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_closes_watches() {
    let (fake, _cache, client) = setup();
    let cancel = CancellationToken::new();
    let mut acc = Accumulator::watch(&client, vec![Query::new("cms", "ConfigMap")], &cancel).await.unwrap();
    assert!(next_token(&mut acc).await);
    assert_eq!(fake.active_watches(), 1);
    acc.shutdown().await;
    assert_eq!(fake.active_watches(), 0);
}
