//! The dispatcher: per-kind transforms in, one consistent snapshot out.
//!
//! Each resource is compiled on its own, so a change to one resource can
//! only ever affect the compiled config stored under its own key. That is
//! what makes fault isolation cheap: a failing transform keeps the previous
//! config for its key and nothing else moves.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use kube::core::DynamicObject;
use kube::ResourceExt;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::compiled::{CompiledConfig, CompiledItem, Source};
use crate::xds::{Cluster, ClusterLoadAssignment, Listener, RouteConfiguration, Snapshot, VirtualHost};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("duplicate transform for kind {0:?}")]
    DuplicateTransform(String),
    #[error("no transform for kind: {0:?}")]
    NoTransform(String),
    #[error("error processing {key}: {message}")]
    TransformFailure { key: String, message: String },
    #[error("internal error processing {key}: {message}")]
    InternalError { key: String, message: String },
    #[error("error converting YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

type Transform = Box<dyn Fn(&DynamicObject) -> anyhow::Result<CompiledConfig> + Send + Sync>;

pub const DEFAULT_ENDPOINT_RESOLVERS: [&str; 2] = ["endpoint", "kubernetes-endpoint"];

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Resolvers that exist even when nothing declares them. A cluster ref
    /// without an explicit resolver uses the first one.
    pub endpoint_resolvers: Vec<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self { Self { endpoint_resolvers: DEFAULT_ENDPOINT_RESOLVERS.iter().map(|s| s.to_string()).collect() } }
}

impl DispatcherConfig {
    /// Defaults overridden by `EMISSARY_ENDPOINT_RESOLVERS` (comma separated, may be empty).
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        match lookup("EMISSARY_ENDPOINT_RESOLVERS") {
            Some(s) => Self {
                endpoint_resolvers: s.split(',').map(str::trim).filter(|r| !r.is_empty()).map(String::from).collect(),
            },
            None => Self::default(),
        }
    }
}

/// `kind:namespace:name`.
pub fn resource_key(kind: &str, namespace: &str, name: &str) -> String { format!("{}:{}:{}", kind, namespace, name) }

fn object_key(obj: &DynamicObject) -> (String, String) {
    let kind = obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default();
    let key = resource_key(&kind, &obj.namespace().unwrap_or_default(), &obj.name_any());
    (kind, key)
}

#[derive(Default)]
struct Inner {
    configs: BTreeMap<String, CompiledConfig>,
    /// Last transform failure per key, until the key compiles or goes away.
    failures: BTreeMap<String, CompiledItem>,
    change_count: u64,
    version: String,
    snapshot: Option<Arc<Snapshot>>,
    endpoint_watches: BTreeSet<String>,
}

impl Inner {
    fn invalidate(&mut self) { self.snapshot = None; }

    fn build(&mut self, resolvers: &[String]) {
        self.change_count += 1;
        self.version = format!("v{}", self.change_count);
        metrics::counter!("dispatcher_snapshot_builds_total", 1u64);

        let mut load_assignments: BTreeMap<String, ClusterLoadAssignment> = BTreeMap::new();
        let mut cluster_paths: BTreeMap<String, String> = BTreeMap::new();
        let mut watches = BTreeSet::new();
        for config in self.configs.values() {
            for la in config.load_assignments.iter().filter_map(|l| l.load_assignment.as_ref()) {
                load_assignments.insert(la.cluster_name.clone(), la.clone());
            }
            for route in &config.routes {
                for r in &route.cluster_refs {
                    cluster_paths.insert(r.name.clone(), r.endpoint_path.clone());
                    let resolver = r.resolver.as_deref().or(resolvers.first().map(String::as_str));
                    let watched = resolver.is_some_and(|res| resolvers.iter().any(|known| known == res));
                    if watched && !route.namespace.is_empty() {
                        watches.insert(format!("{}:{}", route.namespace, r.name));
                    }
                }
            }
        }

        let mut clusters = Vec::with_capacity(cluster_paths.len());
        let mut endpoints = Vec::with_capacity(cluster_paths.len());
        for (name, path) in cluster_paths {
            let key = if path.is_empty() { name.clone() } else { path.clone() };
            endpoints.push(load_assignments.get(&key).cloned().unwrap_or_else(|| ClusterLoadAssignment::empty(key)));
            clusters.push(Cluster::eds(name, path));
        }

        let mut listeners = Vec::new();
        let mut routes = Vec::new();
        for config in self.configs.values() {
            for lst in &config.listeners {
                let Some(listener) = &lst.listener else { continue };
                listeners.push(listener.clone());
                let Some(rds) = listener.rds_name() else { continue };
                let selected = self
                    .configs
                    .values()
                    .flat_map(|c| c.routes.iter())
                    .filter(|r| (lst.predicate)(r))
                    .flat_map(|r| r.routes.iter().cloned())
                    .collect();
                routes.push(RouteConfiguration {
                    name: rds.to_string(),
                    virtual_hosts: vec![VirtualHost { name: rds.to_string(), domains: lst.domains.clone(), routes: selected }],
                });
            }
        }

        let snapshot = Snapshot { version: self.version.clone(), endpoints, clusters, routes, listeners };
        match snapshot.consistent() {
            Ok(()) => {
                debug!(version = %self.version, listeners = snapshot.listeners.len(), clusters = snapshot.clusters.len(), "dispatcher: snapshot built");
                self.snapshot = Some(Arc::new(snapshot));
                self.endpoint_watches = watches;
            }
            Err(e) => {
                metrics::counter!("dispatcher_inconsistent_total", 1u64);
                let dump = serde_json::to_string(&snapshot).unwrap_or_default();
                error!(version = %self.version, error = %e, snapshot = %dump, "dispatcher: snapshot inconsistency");
            }
        }
    }
}

pub struct Dispatcher {
    cfg: DispatcherConfig,
    transforms: FxHashMap<String, Transform>,
    inner: Mutex<Inner>,
}

impl Default for Dispatcher {
    fn default() -> Self { Self::new() }
}

impl Dispatcher {
    pub fn new() -> Self { Self::with_config(DispatcherConfig::default()) }

    pub fn with_config(cfg: DispatcherConfig) -> Self {
        Self { cfg, transforms: FxHashMap::default(), inner: Mutex::new(Inner::default()) }
    }

    pub fn endpoint_resolvers(&self) -> &[String] { &self.cfg.endpoint_resolvers }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(|p| p.into_inner()) }

    /// Register `transform` for `kind`. Objects are decoded into `K` before
    /// the transform sees them.
    pub fn register<K, F>(&mut self, kind: &str, transform: F) -> Result<(), DispatchError>
    where
        K: DeserializeOwned + 'static,
        F: Fn(&K) -> anyhow::Result<CompiledConfig> + Send + Sync + 'static,
    {
        if self.transforms.contains_key(kind) {
            return Err(DispatchError::DuplicateTransform(kind.to_string()));
        }
        let xform: Transform = Box::new(move |obj: &DynamicObject| {
            let typed: K = serde_json::from_value(serde_json::to_value(obj)?)?;
            transform(&typed)
        });
        self.transforms.insert(kind.to_string(), xform);
        Ok(())
    }

    pub fn is_registered(&self, kind: &str) -> bool { self.transforms.contains_key(kind) }

    /// Compile `obj` and store the result under its key. A failing transform
    /// leaves the previous result for that key in place.
    pub fn upsert(&self, obj: &DynamicObject) -> Result<(), DispatchError> {
        let (kind, key) = object_key(obj);
        let xform = self.transforms.get(&kind).ok_or_else(|| DispatchError::NoTransform(kind.clone()))?;
        metrics::counter!("dispatcher_upserts_total", 1u64, "kind" => kind.clone());

        let source = Source::from_parts(&kind, &obj.namespace().unwrap_or_default(), &obj.name_any());
        let outcome = match catch_unwind(AssertUnwindSafe(|| xform(obj))) {
            Ok(Ok(config)) => Ok(config),
            Ok(Err(e)) => Err(DispatchError::TransformFailure { key: key.clone(), message: format!("{:#}", e) }),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(DispatchError::InternalError { key: key.clone(), message })
            }
        };

        let mut inner = self.lock();
        match outcome {
            Ok(config) => {
                inner.failures.remove(&key);
                inner.configs.insert(key, config);
                inner.invalidate();
                Ok(())
            }
            Err(e) => {
                metrics::counter!("dispatcher_transform_errors_total", 1u64, "kind" => kind);
                warn!(key = %key, error = %e, "dispatcher: transform failed, keeping previous config");
                inner.failures.insert(key, CompiledItem::with_error(source, e.to_string()));
                Err(e)
            }
        }
    }

    /// Parse a stream of YAML documents and upsert each one, stopping at
    /// the first failure.
    pub fn upsert_yaml(&self, manifests: &str) -> Result<(), DispatchError> {
        let mut objs = Vec::new();
        for doc in serde_yaml::Deserializer::from_str(manifests) {
            let value = serde_yaml::Value::deserialize(doc)?;
            if value.is_null() {
                continue;
            }
            objs.push(serde_yaml::from_value::<DynamicObject>(value)?);
        }
        for obj in &objs {
            self.upsert(obj)?;
        }
        Ok(())
    }

    pub fn delete(&self, obj: &DynamicObject) {
        let (_, key) = object_key(obj);
        self.delete_by_key(&key);
    }

    pub fn delete_key(&self, kind: &str, namespace: &str, name: &str) { self.delete_by_key(&resource_key(kind, namespace, name)); }

    fn delete_by_key(&self, key: &str) {
        let mut inner = self.lock();
        inner.configs.remove(key);
        inner.failures.remove(key);
        inner.invalidate();
        info!(key = %key, "dispatcher: deleted");
    }

    /// Every compiled item with an error, plus transform failures, ordered by key.
    pub fn get_errors(&self) -> Vec<CompiledItem> {
        let inner = self.lock();
        let keys: BTreeSet<&String> = inner.configs.keys().chain(inner.failures.keys()).collect();
        let mut out = Vec::new();
        for key in keys {
            if let Some(failure) = inner.failures.get(key) {
                out.push(failure.clone());
            }
            if let Some(config) = inner.configs.get(key) {
                out.extend(config.errors());
            }
        }
        out
    }

    /// The current version and snapshot, assembling one if anything changed
    /// since the last call. `None` when the assembled snapshot was inconsistent.
    pub fn get_snapshot(&self) -> (String, Option<Arc<Snapshot>>) {
        let mut inner = self.lock();
        if inner.snapshot.is_none() {
            inner.build(&self.cfg.endpoint_resolvers);
        }
        (inner.version.clone(), inner.snapshot.clone())
    }

    pub fn get_listener(&self, name: &str) -> Option<Listener> {
        let (_, snap) = self.get_snapshot();
        snap.and_then(|s| s.listener(name).cloned())
    }

    pub fn get_route_configuration(&self, name: &str) -> Option<RouteConfiguration> {
        let (_, snap) = self.get_snapshot();
        snap.and_then(|s| s.route_configuration(name).cloned())
    }

    /// Whether endpoints for `namespace/name` feed some cluster in the last
    /// good snapshot.
    pub fn is_watched(&self, namespace: &str, name: &str) -> bool {
        self.lock().endpoint_watches.contains(&format!("{}:{}", namespace, name))
    }
}
