//! Client: REST mapping plus writes that keep the canonical cache current.

use std::sync::Arc;
use std::time::{Duration, Instant};

use emissary_core::Query;
use kube::core::DynamicObject;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{CanonicalCache, KatesError, KubeApiBackend, KubeBackend, Mapping, PatchBody, RestMapper};

/// Upsert gives up after this many conflicting attempts.
pub const UPSERT_MAX_ATTEMPTS: usize = 5;

#[derive(Clone)]
pub struct Client {
    backend: Arc<dyn KubeBackend>,
    mapper: Arc<RestMapper>,
    canonical: Arc<CanonicalCache>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("canonical_entries", &self.canonical.len()).finish()
    }
}

impl Client {
    /// Client sharing the process-wide canonical cache.
    pub fn new(backend: Arc<dyn KubeBackend>) -> Self { Self::with_cache(backend, CanonicalCache::global()) }

    pub fn with_cache(backend: Arc<dyn KubeBackend>, canonical: Arc<CanonicalCache>) -> Self {
        Self { backend, mapper: Arc::new(RestMapper::new()), canonical }
    }

    /// Client for the ambient kubeconfig / in-cluster config.
    pub async fn try_default() -> Result<Self, KatesError> {
        Ok(Self::new(Arc::new(KubeApiBackend::try_default().await?)))
    }

    pub fn backend(&self) -> Arc<dyn KubeBackend> { Arc::clone(&self.backend) }
    pub fn canonical(&self) -> &Arc<CanonicalCache> { &self.canonical }

    pub async fn mapping_for(&self, kind: &str) -> Result<Mapping, KatesError> {
        self.mapper.resolve(self.backend.as_ref(), kind).await
    }

    async fn mapping_for_object(&self, obj: &DynamicObject) -> Result<Mapping, KatesError> {
        let types = obj.types.as_ref().ok_or_else(|| KatesError::Invalid(format!("{} has no apiVersion/kind", obj.name_any())))?;
        match self.mapping_for(&format!("{}/{}", types.api_version, types.kind)).await {
            Err(KatesError::InvalidKind(k)) => {
                // served, but not at the preferred version
                let (group, version) = emissary_core::split_api_version(&types.api_version);
                let reference = if group.is_empty() { types.kind.clone() } else { format!("{}.{}", types.kind, group) };
                let mut m = self.mapping_for(&reference).await.map_err(|_| KatesError::InvalidKind(k))?;
                m.version = version.to_string();
                Ok(m)
            }
            other => other,
        }
    }

    pub fn invalidate_cache(&self) { self.mapper.invalidate(); }

    /// Poll discovery once per second until `kind` is served or `cancel` fires.
    pub async fn wait_for(&self, cancel: &CancellationToken, kind: &str) -> Result<Mapping, KatesError> {
        loop {
            match self.mapping_for(kind).await {
                Ok(m) => return Ok(m),
                Err(KatesError::InvalidKind(_)) => {
                    debug!(kind = %kind, "client: waiting for kind to be served");
                }
                Err(e) => return Err(e),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(KatesError::InvalidKind(kind.to_string())),
                _ = tokio::time::sleep(Duration::from_secs(1)) => self.invalidate_cache(),
            }
        }
    }

    pub async fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> Result<DynamicObject, KatesError> {
        let m = self.mapping_for(kind).await?;
        self.backend.get(&m, namespace, name).await
    }

    pub async fn list(&self, query: &Query) -> Result<Vec<DynamicObject>, KatesError> {
        let m = self.mapping_for(&query.kind).await?;
        let compiled = query
            .compile()
            .map_err(|source| KatesError::InvalidQuery { query: query.name.clone(), source })?;
        self.backend.list(&m, &compiled).await
    }

    pub async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, KatesError> {
        let m = self.mapping_for_object(obj).await?;
        let t0 = Instant::now();
        let out = self.backend.create(&m, obj).await?;
        self.canonical.record_write(&out);
        metrics::counter!("kube_writes_total", 1u64, "op" => "create");
        info!(kind = %m.kind, name = %out.name_any(), took_ms = %t0.elapsed().as_millis(), "client: created");
        Ok(out)
    }

    pub async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, KatesError> {
        let m = self.mapping_for_object(obj).await?;
        let out = self.backend.replace(&m, obj).await?;
        self.record_if_moved(obj, &out);
        metrics::counter!("kube_writes_total", 1u64, "op" => "update");
        debug!(kind = %m.kind, name = %out.name_any(), rv = ?out.resource_version(), "client: updated");
        Ok(out)
    }

    pub async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, KatesError> {
        let m = self.mapping_for_object(obj).await?;
        let out = self.backend.replace_status(&m, obj).await?;
        self.record_if_moved(obj, &out);
        metrics::counter!("kube_writes_total", 1u64, "op" => "update_status");
        Ok(out)
    }

    /// Patch the object identified by `target`'s kind, namespace and name.
    pub async fn patch(&self, target: &DynamicObject, patch: PatchBody) -> Result<DynamicObject, KatesError> {
        let m = self.mapping_for_object(target).await?;
        let name = target.metadata.name.as_deref().ok_or_else(|| KatesError::Invalid("patch target has no name".into()))?;
        let out = self.backend.patch(&m, target.metadata.namespace.as_deref(), name, &patch).await?;
        self.record_if_moved(target, &out);
        metrics::counter!("kube_writes_total", 1u64, "op" => "patch");
        Ok(out)
    }

    /// Create `obj`, or merge its labels, annotations and body over the live
    /// object. Conflicts refetch and retry.
    pub async fn upsert(&self, obj: &DynamicObject) -> Result<DynamicObject, KatesError> {
        let m = self.mapping_for_object(obj).await?;
        let name = obj.metadata.name.as_deref().ok_or_else(|| KatesError::Invalid("upsert object has no name".into()))?;
        let ns = obj.metadata.namespace.as_deref();
        let mut last = None;
        for attempt in 1..=UPSERT_MAX_ATTEMPTS {
            let live = match self.backend.get(&m, ns, name).await {
                Ok(live) => live,
                Err(e) if e.is_not_found() => match self.create(obj).await {
                    Ok(out) => return Ok(out),
                    // raced with another creator
                    Err(e) if e.is_conflict() => { last = Some(e); continue; }
                    Err(e) => return Err(e),
                },
                Err(e) => return Err(e),
            };
            let merged = merge_over(&live, obj);
            match self.backend.replace(&m, &merged).await {
                Ok(out) => {
                    self.record_if_moved(&live, &out);
                    metrics::counter!("kube_writes_total", 1u64, "op" => "upsert");
                    return Ok(out);
                }
                Err(e) if e.is_conflict() => {
                    warn!(kind = %m.kind, name = %name, attempt, "client: upsert conflict, retrying");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| KatesError::Conflict(name.to_string())))
    }

    pub async fn delete(&self, obj: &DynamicObject) -> Result<(), KatesError> {
        let m = self.mapping_for_object(obj).await?;
        let name = obj.metadata.name.as_deref().ok_or_else(|| KatesError::Invalid("delete target has no name".into()))?;
        let ns = obj.metadata.namespace.as_deref();
        let uid = match obj.uid() {
            Some(uid) => Some(uid),
            None => self.backend.get(&m, ns, name).await.ok().and_then(|o| o.uid()),
        };
        self.backend.delete(&m, ns, name).await?;
        if let Some(uid) = uid {
            self.canonical.record_delete(&uid);
        }
        metrics::counter!("kube_writes_total", 1u64, "op" => "delete");
        debug!(kind = %m.kind, name = %name, "client: deleted");
        Ok(())
    }

    fn record_if_moved(&self, before: &DynamicObject, after: &DynamicObject) {
        if before.resource_version() != after.resource_version() {
            self.canonical.record_write(after);
        }
    }
}

/// Overlay labels, annotations and non-metadata top-level fields of `desired` on `live`.
fn merge_over(live: &DynamicObject, desired: &DynamicObject) -> DynamicObject {
    let mut out = live.clone();
    if !desired.labels().is_empty() {
        out.labels_mut().extend(desired.labels().clone());
    }
    if !desired.annotations().is_empty() {
        out.annotations_mut().extend(desired.annotations().clone());
    }
    if let (Some(dst), Some(src)) = (out.data.as_object_mut(), desired.data.as_object()) {
        for (k, v) in src {
            if k != "status" {
                dst.insert(k.clone(), v.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_live_identity_and_status() {
        let live: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": "c", "namespace": "d", "uid": "u", "resourceVersion": "3", "labels": { "a": "1" } },
            "data": { "x": "old" }, "status": { "s": true }
        }))
        .unwrap();
        let desired: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": "c", "namespace": "d", "labels": { "b": "2" } },
            "data": { "x": "new" }, "status": { "s": false }
        }))
        .unwrap();
        let m = merge_over(&live, &desired);
        assert_eq!(m.resource_version().as_deref(), Some("3"));
        assert_eq!(m.uid().as_deref(), Some("u"));
        assert_eq!(m.labels().len(), 2);
        assert_eq!(m.data["data"]["x"], "new");
        assert_eq!(m.data["status"]["s"], true);
    }
}
