//! In-memory API server used by tests across the workspace.
//!
//! Objects get uids and monotonically increasing resourceVersions. Watch
//! delivery can be held back to simulate watch lag, and errors, conflicts
//! and relists can be injected.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use emissary_core::CompiledQuery;
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::DynamicObject;
use kube::ResourceExt;
use tokio::sync::mpsc;

use crate::kube_backend::with_types;
use crate::{KatesError, KubeBackend, Mapping, PatchBody, ResourceWatcher, WatchEvent};

type Key = (String, String, Option<String>, String);
type Item = Result<WatchEvent, KatesError>;

struct FakeWatch {
    mapping: Mapping,
    query: CompiledQuery,
    tx: mpsc::UnboundedSender<Item>,
}

#[derive(Default)]
struct FakeState {
    mappings: Vec<Mapping>,
    objects: BTreeMap<Key, DynamicObject>,
    next_rv: u64,
    watches: Vec<FakeWatch>,
    hold: bool,
    held: Vec<(usize, Item)>,
    conflicts: usize,
    discoveries: usize,
}

pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl Default for FakeCluster {
    fn default() -> Self { Self::new() }
}

fn key(m: &Mapping, ns: Option<&str>, name: &str) -> Key {
    (m.group.clone(), m.kind.clone(), if m.namespaced { ns.map(str::to_string) } else { None }, name.to_string())
}

/// The kinds the control plane touches.
pub fn standard_mappings() -> Vec<Mapping> {
    let amb = |kind: &str, plural: &str| Mapping::new("getambassador.io", "v3alpha1", kind, plural, true);
    vec![
        Mapping::new("", "v1", "Service", "services", true).with_short_names(&["svc"]),
        Mapping::new("", "v1", "Endpoints", "endpoints", true).with_short_names(&["ep"]),
        Mapping::new("", "v1", "Secret", "secrets", true),
        Mapping::new("", "v1", "ConfigMap", "configmaps", true).with_short_names(&["cm"]),
        Mapping::new("", "v1", "Pod", "pods", true).with_short_names(&["po"]),
        Mapping::new("", "v1", "Namespace", "namespaces", false).with_short_names(&["ns"]),
        Mapping::new("apps", "v1", "Deployment", "deployments", true).with_short_names(&["deploy"]),
        Mapping::new("networking.k8s.io", "v1", "Ingress", "ingresses", true).with_short_names(&["ing"]),
        Mapping::new("networking.k8s.io", "v1", "IngressClass", "ingressclasses", false),
        Mapping::new("coordination.k8s.io", "v1", "Lease", "leases", true),
        Mapping::new("apiextensions.k8s.io", "v1", "CustomResourceDefinition", "customresourcedefinitions", false)
            .with_short_names(&["crd", "crds"]),
        Mapping::new("gateway.networking.k8s.io", "v1", "Gateway", "gateways", true),
        Mapping::new("gateway.networking.k8s.io", "v1", "HTTPRoute", "httproutes", true),
        amb("Mapping", "mappings"),
        amb("Host", "hosts"),
        amb("Listener", "listeners"),
        amb("Module", "modules"),
        amb("TCPMapping", "tcpmappings"),
        amb("TLSContext", "tlscontexts"),
    ]
}

impl FakeState {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn send(&mut self, idx: usize, item: Item) {
        if self.hold {
            self.held.push((idx, item));
        } else if let Some(w) = self.watches.get(idx) {
            let _ = w.tx.send(item);
        }
    }

    /// Fan an object transition out to every interested watch.
    fn notify(&mut self, mapping: &Mapping, before: Option<&DynamicObject>, after: Option<&DynamicObject>) {
        let mut out = Vec::new();
        for (idx, w) in self.watches.iter().enumerate() {
            if w.mapping.group != mapping.group || w.mapping.kind != mapping.kind {
                continue;
            }
            let was = before.map(|o| w.query.matches(o)).unwrap_or(false);
            match after {
                Some(o) if w.query.matches(o) => out.push((idx, Ok(WatchEvent::Applied(o.clone())))),
                Some(o) if was => out.push((idx, Ok(WatchEvent::Deleted(o.clone())))),
                None if was => {
                    if let Some(b) = before {
                        out.push((idx, Ok(WatchEvent::Deleted(b.clone()))));
                    }
                }
                _ => {}
            }
        }
        for (idx, item) in out {
            self.send(idx, item);
        }
    }

    fn matching(&self, mapping: &Mapping, query: &CompiledQuery) -> Vec<DynamicObject> {
        self.objects
            .iter()
            .filter(|((g, k, _, _), _)| *g == mapping.group && *k == mapping.kind)
            .map(|(_, o)| o)
            .filter(|o| query.matches(o))
            .cloned()
            .collect()
    }

    fn find_mapping(&self, mapping: &Mapping) -> Result<Mapping, KatesError> {
        self.mappings
            .iter()
            .find(|m| m.group == mapping.group && m.kind == mapping.kind)
            .cloned()
            .ok_or_else(|| KatesError::from_status(404, format!("the server could not find the requested resource ({})", mapping.plural)))
    }

    fn upsert_object(&mut self, mapping: &Mapping, mut obj: DynamicObject, require_rv: bool) -> Result<DynamicObject, KatesError> {
        let name = obj.metadata.name.clone().ok_or_else(|| KatesError::Invalid("object has no metadata.name".into()))?;
        let k = key(mapping, obj.metadata.namespace.as_deref(), &name);
        let before = self.objects.get(&k).cloned();
        let Some(prev) = before.as_ref() else {
            return Err(KatesError::from_status(404, format!("{} {:?} not found", mapping.plural, name)));
        };
        if require_rv {
            if let Some(rv) = obj.resource_version() {
                if Some(rv) != prev.resource_version() {
                    return Err(KatesError::from_status(409, format!("the object {:?} has been modified", name)));
                }
            }
        }
        obj = with_types(obj, mapping);
        obj.metadata.uid = prev.metadata.uid.clone();
        obj.metadata.creation_timestamp = prev.metadata.creation_timestamp.clone();
        obj.metadata.resource_version = Some(self.bump());
        self.objects.insert(k, obj.clone());
        self.notify(mapping, before.as_ref(), Some(&obj));
        Ok(obj)
    }
}

impl FakeCluster {
    pub fn new() -> Self { Self::with_mappings(standard_mappings()) }

    pub fn with_mappings(mappings: Vec<Mapping>) -> Self {
        Self { state: Mutex::new(FakeState { mappings, next_rv: 100, ..Default::default() }) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> { self.state.lock().unwrap_or_else(|p| p.into_inner()) }

    /// Start serving a new kind (as if a CRD was installed).
    pub fn add_mapping(&self, mapping: Mapping) { self.lock().mappings.push(mapping); }

    pub fn discovery_count(&self) -> usize { self.lock().discoveries }

    /// Queue watch events instead of delivering them.
    pub fn hold_watch_events(&self) { self.lock().hold = true; }

    /// Deliver everything queued, in order, and stop holding.
    pub fn release_watch_events(&self) {
        let mut st = self.lock();
        st.hold = false;
        let held = std::mem::take(&mut st.held);
        for (idx, item) in held {
            st.send(idx, item);
        }
    }

    /// The next `n` replace calls fail with a conflict.
    pub fn inject_conflicts(&self, n: usize) { self.lock().conflicts = n; }

    pub fn inject_watch_error(&self, message: &str) {
        let mut st = self.lock();
        for idx in 0..st.watches.len() {
            st.send(idx, Err(KatesError::Transient(message.to_string())));
        }
    }

    /// Make every watch relist, as after an expired resourceVersion.
    pub fn relist(&self) {
        let mut st = self.lock();
        for idx in 0..st.watches.len() {
            let items = st.matching(&st.watches[idx].mapping, &st.watches[idx].query);
            st.send(idx, Ok(WatchEvent::Restarted(items)));
        }
    }

    pub fn active_watches(&self) -> usize {
        self.lock().watches.iter().filter(|w| !w.tx.is_closed()).count()
    }

    /// Server-side view of all objects of a kind (plural or kind name).
    pub fn objects(&self, kind: &str) -> Vec<DynamicObject> {
        let st = self.lock();
        st.objects
            .iter()
            .filter(|((_, k, _, _), _)| {
                st.mappings.iter().any(|m| m.kind == *k && (m.kind.eq_ignore_ascii_case(kind) || m.plural == kind))
            })
            .map(|(_, o)| o.clone())
            .collect()
    }

    /// Write an object as some other actor would (no client, no canonical cache).
    pub fn apply(&self, obj: DynamicObject) -> Result<DynamicObject, KatesError> {
        let mapping = self.mapping_of(&obj)?;
        let mut st = self.lock();
        let name = obj.name_any();
        if st.objects.contains_key(&key(&mapping, obj.metadata.namespace.as_deref(), &name)) {
            st.upsert_object(&mapping, obj, false)
        } else {
            insert_new(&mut st, &mapping, obj)
        }
    }

    /// Delete as some other actor would.
    pub fn remove(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        let mut st = self.lock();
        let mapping = st.mappings.iter().find(|m| m.kind == kind || m.plural == kind).cloned()?;
        let gone = st.objects.remove(&key(&mapping, namespace, name))?;
        st.notify(&mapping, Some(&gone), None);
        Some(gone)
    }

    fn mapping_of(&self, obj: &DynamicObject) -> Result<Mapping, KatesError> {
        let types = obj.types.as_ref().ok_or_else(|| KatesError::Invalid("object has no apiVersion/kind".into()))?;
        let (group, _) = emissary_core::split_api_version(&types.api_version);
        self.lock()
            .mappings
            .iter()
            .find(|m| m.group == group && m.kind == types.kind)
            .cloned()
            .ok_or_else(|| KatesError::InvalidKind(types.kind.clone()))
    }
}

fn insert_new(st: &mut FakeState, mapping: &Mapping, obj: DynamicObject) -> Result<DynamicObject, KatesError> {
    let name = obj.metadata.name.clone().ok_or_else(|| KatesError::Invalid("object has no metadata.name".into()))?;
    let k = key(mapping, obj.metadata.namespace.as_deref(), &name);
    if st.objects.contains_key(&k) {
        return Err(KatesError::from_status(409, format!("{} {:?} already exists", mapping.plural, name)));
    }
    let mut obj = with_types(obj, mapping);
    obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
    obj.metadata.resource_version = Some(st.bump());
    obj.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
    st.objects.insert(k, obj.clone());
    st.notify(mapping, None, Some(&obj));
    Ok(obj)
}

fn apply_patch(raw: &mut serde_json::Value, patch: &PatchBody) -> Result<(), KatesError> {
    match patch {
        PatchBody::Merge(p) => json_patch::merge(raw, p),
        PatchBody::Json(ops) => {
            let ops: json_patch::Patch =
                serde_json::from_value(ops.clone()).map_err(|e| KatesError::Invalid(format!("json patch: {}", e)))?;
            json_patch::patch(raw, &ops.0).map_err(|e| KatesError::Invalid(e.to_string()))?;
        }
    }
    Ok(())
}

#[async_trait]
impl ResourceWatcher for FakeCluster {
    async fn list(&self, mapping: &Mapping, query: &CompiledQuery) -> Result<Vec<DynamicObject>, KatesError> {
        let st = self.lock();
        let mapping = st.find_mapping(mapping)?;
        Ok(st.matching(&mapping, query))
    }

    fn watch(&self, mapping: &Mapping, query: &CompiledQuery) -> BoxStream<'static, Result<WatchEvent, KatesError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut st = self.lock();
        let initial = st.matching(mapping, query);
        st.watches.push(FakeWatch { mapping: mapping.clone(), query: query.clone(), tx });
        let idx = st.watches.len() - 1;
        st.send(idx, Ok(WatchEvent::Restarted(initial)));
        futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }
}

#[async_trait]
impl KubeBackend for FakeCluster {
    async fn discover(&self) -> Result<Vec<Mapping>, KatesError> {
        let mut st = self.lock();
        st.discoveries += 1;
        Ok(st.mappings.clone())
    }

    async fn get(&self, mapping: &Mapping, namespace: Option<&str>, name: &str) -> Result<DynamicObject, KatesError> {
        self.lock()
            .objects
            .get(&key(mapping, namespace, name))
            .cloned()
            .ok_or_else(|| KatesError::from_status(404, format!("{} {:?} not found", mapping.plural, name)))
    }

    async fn create(&self, mapping: &Mapping, obj: &DynamicObject) -> Result<DynamicObject, KatesError> {
        let mut st = self.lock();
        let mapping = st.find_mapping(mapping)?;
        insert_new(&mut st, &mapping, obj.clone())
    }

    async fn replace(&self, mapping: &Mapping, obj: &DynamicObject) -> Result<DynamicObject, KatesError> {
        let mut st = self.lock();
        if st.conflicts > 0 {
            st.conflicts -= 1;
            return Err(KatesError::from_status(409, "injected conflict"));
        }
        let mapping = st.find_mapping(mapping)?;
        st.upsert_object(&mapping, obj.clone(), true)
    }

    async fn replace_status(&self, mapping: &Mapping, obj: &DynamicObject) -> Result<DynamicObject, KatesError> {
        let mut st = self.lock();
        let mapping = st.find_mapping(mapping)?;
        let name = obj.name_any();
        let mut live = st
            .objects
            .get(&key(&mapping, obj.metadata.namespace.as_deref(), &name))
            .cloned()
            .ok_or_else(|| KatesError::from_status(404, format!("{} {:?} not found", mapping.plural, name)))?;
        if let Some(status) = obj.data.get("status") {
            live.data["status"] = status.clone();
        }
        live.metadata.resource_version = obj.metadata.resource_version.clone().or(live.metadata.resource_version);
        st.upsert_object(&mapping, live, true)
    }

    async fn patch(&self, mapping: &Mapping, namespace: Option<&str>, name: &str, patch: &PatchBody)
        -> Result<DynamicObject, KatesError> {
        let mut st = self.lock();
        let mapping = st.find_mapping(mapping)?;
        let live = st
            .objects
            .get(&key(&mapping, namespace, name))
            .cloned()
            .ok_or_else(|| KatesError::from_status(404, format!("{} {:?} not found", mapping.plural, name)))?;
        let mut raw = serde_json::to_value(&live)?;
        apply_patch(&mut raw, patch)?;
        let patched: DynamicObject = serde_json::from_value(raw)?;
        st.upsert_object(&mapping, patched, false)
    }

    async fn delete(&self, mapping: &Mapping, namespace: Option<&str>, name: &str)
        -> Result<Option<DynamicObject>, KatesError> {
        let mut st = self.lock();
        let mapping = st.find_mapping(mapping)?;
        let gone = st
            .objects
            .remove(&key(&mapping, namespace, name))
            .ok_or_else(|| KatesError::from_status(404, format!("{} {:?} not found", mapping.plural, name)))?;
        st.notify(&mapping, Some(&gone), None);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emissary_core::Query;

    fn cm(name: &str) -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "default", "labels": { "app": "x" } },
            "data": { "k": "v" }
        }))
        .unwrap()
    }

    fn cm_mapping() -> Mapping { Mapping::new("", "v1", "ConfigMap", "configmaps", true) }

    #[tokio::test]
    async fn watch_starts_with_list_then_live_events() {
        let fake = FakeCluster::new();
        fake.apply(cm("a")).unwrap();
        let q = Query::new("cms", "ConfigMap").compile().unwrap();
        let mut w = fake.watch(&cm_mapping(), &q);
        match w.next().await.unwrap().unwrap() {
            WatchEvent::Restarted(items) => assert_eq!(items.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
        fake.apply(cm("b")).unwrap();
        assert!(matches!(w.next().await.unwrap().unwrap(), WatchEvent::Applied(o) if o.name_any() == "b"));
        fake.remove("ConfigMap", Some("default"), "a").unwrap();
        assert!(matches!(w.next().await.unwrap().unwrap(), WatchEvent::Deleted(o) if o.name_any() == "a"));
    }

    #[tokio::test]
    async fn replace_checks_resource_version() {
        let fake = FakeCluster::new();
        let created = fake.create(&cm_mapping(), &cm("a")).await.unwrap();
        let mut stale = created.clone();
        stale.metadata.resource_version = Some("1".into());
        let err = fake.replace(&cm_mapping(), &stale).await.unwrap_err();
        assert!(err.is_conflict());
        let ok = fake.replace(&cm_mapping(), &created).await.unwrap();
        assert_ne!(ok.resource_version(), created.resource_version());
        assert_eq!(ok.uid(), created.uid());
    }

    #[tokio::test]
    async fn merge_and_json_patches_apply() {
        let fake = FakeCluster::new();
        fake.create(&cm_mapping(), &cm("a")).await.unwrap();
        let out = fake
            .patch(&cm_mapping(), Some("default"), "a", &PatchBody::Merge(serde_json::json!({ "data": { "k": null, "n": "1" } })))
            .await
            .unwrap();
        assert!(out.data["data"].get("k").is_none());
        assert_eq!(out.data["data"]["n"], "1");
        let ops = serde_json::json!([{ "op": "replace", "path": "/data/n", "value": "2" }]);
        let out = fake.patch(&cm_mapping(), Some("default"), "a", &PatchBody::Json(ops)).await.unwrap();
        assert_eq!(out.data["data"]["n"], "2");

        let ops = serde_json::json!([
            { "op": "add", "path": "/metadata/finalizers", "value": [] },
            { "op": "add", "path": "/metadata/finalizers/-", "value": "a" },
            { "op": "add", "path": "/metadata/finalizers/-", "value": "b" },
            { "op": "test", "path": "/data/n", "value": "2" }
        ]);
        let out = fake.patch(&cm_mapping(), Some("default"), "a", &PatchBody::Json(ops)).await.unwrap();
        assert_eq!(out.finalizers(), &["a".to_string(), "b".to_string()][..]);
    }

    #[tokio::test]
    async fn failed_json_patch_leaves_the_object_alone() {
        let fake = FakeCluster::new();
        let created = fake.create(&cm_mapping(), &cm("a")).await.unwrap();
        for ops in [
            serde_json::json!([{ "op": "remove", "path": "/data/missing" }]),
            serde_json::json!([{ "op": "test", "path": "/metadata/name", "value": "b" }]),
            serde_json::json!([{ "op": "frobnicate", "path": "/data" }]),
        ] {
            let err = fake.patch(&cm_mapping(), Some("default"), "a", &PatchBody::Json(ops)).await.unwrap_err();
            assert!(matches!(err, KatesError::Invalid(_)), "{err:?}");
        }
        let live = fake.objects("ConfigMap").pop().unwrap();
        assert_eq!(live.resource_version(), created.resource_version());
    }

    #[tokio::test]
    async fn held_events_are_released_in_order() {
        let fake = FakeCluster::new();
        let q = Query::new("cms", "ConfigMap").compile().unwrap();
        fake.hold_watch_events();
        let mut w = fake.watch(&cm_mapping(), &q);
        fake.apply(cm("a")).unwrap();
        let pending = tokio::time::timeout(std::time::Duration::from_millis(50), w.next()).await;
        assert!(pending.is_err());
        fake.release_watch_events();
        assert!(matches!(w.next().await.unwrap().unwrap(), WatchEvent::Restarted(items) if items.is_empty()));
        assert!(matches!(w.next().await.unwrap().unwrap(), WatchEvent::Applied(_)));
    }
}
