#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use emissary_kubehub::fake::FakeCluster;
use emissary_kubehub::{CanonicalCache, Client};
use emissary_store::Accumulator;
use kube::core::DynamicObject;
use kube::ResourceExt;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Snap {
    pub cms: Vec<DynamicObject>,
    pub secrets: Vec<DynamicObject>,
}

impl Snap {
    pub fn names(&self) -> Vec<String> { self.cms.iter().map(|o| o.name_any()).collect() }
}

pub fn cm(name: &str) -> DynamicObject {
    cm_with(name, "default", "1")
}

pub fn cm_with(name: &str, ns: &str, value: &str) -> DynamicObject {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "v1", "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": ns, "labels": { "app": "web" } },
        "data": { "value": value }
    }))
    .unwrap()
}

pub fn setup() -> (Arc<FakeCluster>, Arc<CanonicalCache>, Client) {
    let fake = Arc::new(FakeCluster::new());
    let cache = Arc::new(CanonicalCache::default());
    let client = Client::with_cache(fake.clone(), cache.clone());
    (fake, cache, client)
}

pub async fn next_token(acc: &mut Accumulator) -> bool {
    matches!(tokio::time::timeout(Duration::from_secs(3), acc.changed().recv()).await, Ok(Some(())))
}

pub async fn no_token_within(acc: &mut Accumulator, ms: u64) -> bool {
    tokio::time::timeout(Duration::from_millis(ms), acc.changed().recv()).await.is_err()
}
