//! Seams between the client and whatever actually talks to an API server.

use async_trait::async_trait;
use emissary_core::CompiledQuery;
use futures::stream::BoxStream;
use kube::core::DynamicObject;

use crate::{KatesError, Mapping};

/// Watch stream item, mirroring the kube-runtime watcher events.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Applied(DynamicObject),
    Deleted(DynamicObject),
    /// A complete (re)list. The first one marks the watch as synced.
    Restarted(Vec<DynamicObject>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatchBody {
    /// RFC 7386 JSON merge patch.
    Merge(serde_json::Value),
    /// RFC 6902 JSON patch (array of operations).
    Json(serde_json::Value),
}

/// List+watch for one resource kind, constrained by a query.
#[async_trait]
pub trait ResourceWatcher: Send + Sync + 'static {
    async fn list(&self, mapping: &Mapping, query: &CompiledQuery) -> Result<Vec<DynamicObject>, KatesError>;

    /// Endless stream: starts with `Restarted(initial list)`, then live events.
    /// Transient failures show up as `Err` items; the stream keeps going.
    fn watch(&self, mapping: &Mapping, query: &CompiledQuery) -> BoxStream<'static, Result<WatchEvent, KatesError>>;
}

/// Discovery and writes on top of [`ResourceWatcher`].
#[async_trait]
pub trait KubeBackend: ResourceWatcher {
    async fn discover(&self) -> Result<Vec<Mapping>, KatesError>;
    async fn get(&self, mapping: &Mapping, namespace: Option<&str>, name: &str) -> Result<DynamicObject, KatesError>;
    async fn create(&self, mapping: &Mapping, obj: &DynamicObject) -> Result<DynamicObject, KatesError>;
    async fn replace(&self, mapping: &Mapping, obj: &DynamicObject) -> Result<DynamicObject, KatesError>;
    async fn replace_status(&self, mapping: &Mapping, obj: &DynamicObject) -> Result<DynamicObject, KatesError>;
    async fn patch(&self, mapping: &Mapping, namespace: Option<&str>, name: &str, patch: &PatchBody)
        -> Result<DynamicObject, KatesError>;
    /// Returns the object when it still exists afterwards (pending finalizers).
    async fn delete(&self, mapping: &Mapping, namespace: Option<&str>, name: &str)
        -> Result<Option<DynamicObject>, KatesError>;
}
