//! REST mapping: resolve user-facing kind references to served resources.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use kube::core::{ApiResource, GroupVersionKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{KatesError, KubeBackend};

/// Discovery is not re-run more often than this after a miss.
pub const MIN_REDISCOVERY_INTERVAL: Duration = Duration::from_secs(1);

/// One served resource as reported by discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mapping {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub singular: String,
    pub short_names: Vec<String>,
    pub namespaced: bool,
}

impl Mapping {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            singular: kind.to_lowercase(),
            short_names: Vec::new(),
            namespaced,
        }
    }

    pub fn with_short_names(mut self, names: &[&str]) -> Self {
        self.short_names = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn gvk_key(&self) -> String { format!("{}/{}", self.api_version(), self.kind) }

    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, &self.kind);
        ApiResource::from_gvk_with_plural(&gvk, &self.plural)
    }

    fn matches_name(&self, name: &str) -> bool {
        self.kind.eq_ignore_ascii_case(name)
            || self.plural.eq_ignore_ascii_case(name)
            || self.singular.eq_ignore_ascii_case(name)
            || self.short_names.iter().any(|s| s.eq_ignore_ascii_case(name))
    }

    fn matches_reference(&self, reference: &str) -> bool {
        let parts: Vec<&str> = reference.split('/').collect();
        match parts.as_slice() {
            [version, kind] => self.group.is_empty() && self.version == *version && self.kind == *kind,
            [group, version, kind] => self.group == *group && self.version == *version && self.kind == *kind,
            [name] => match name.split_once('.') {
                Some((n, group)) => self.group == group && self.matches_name(n),
                None => self.matches_name(name),
            },
            _ => false,
        }
    }
}

/// Resolve a reference against a discovery result. Accepts `Kind`, plural,
/// singular, short names, `name.group`, `v1/Kind` and `group/v1/Kind`.
pub fn find_mapping<'a>(mappings: &'a [Mapping], reference: &str) -> Option<&'a Mapping> {
    mappings.iter().find(|m| m.matches_reference(reference))
}

#[derive(Debug, Default)]
struct MapperState {
    mappings: Vec<Mapping>,
    refreshed_at: Option<Instant>,
}

/// Cached discovery with rediscovery on misses.
#[derive(Debug)]
pub struct RestMapper {
    state: ArcSwap<MapperState>,
    refresh: tokio::sync::Mutex<()>,
}

impl Default for RestMapper {
    fn default() -> Self { Self::new() }
}

impl RestMapper {
    pub fn new() -> Self { Self { state: ArcSwap::from_pointee(MapperState::default()), refresh: tokio::sync::Mutex::new(()) } }

    pub fn cached(&self) -> Vec<Mapping> { self.state.load().mappings.clone() }

    /// Drop the cached discovery so the next lookup re-runs it.
    pub fn invalidate(&self) {
        self.state.store(Arc::new(MapperState::default()));
        debug!("mapper: cache invalidated");
    }

    pub async fn resolve(&self, backend: &dyn KubeBackend, reference: &str) -> Result<Mapping, KatesError> {
        if let Some(m) = find_mapping(&self.state.load().mappings, reference) {
            return Ok(m.clone());
        }
        self.refresh_if_stale(backend).await?;
        find_mapping(&self.state.load().mappings, reference)
            .cloned()
            .ok_or_else(|| KatesError::InvalidKind(reference.to_string()))
    }

    async fn refresh_if_stale(&self, backend: &dyn KubeBackend) -> Result<(), KatesError> {
        let _guard = self.refresh.lock().await;
        let fresh = self
            .state
            .load()
            .refreshed_at
            .map(|t| t.elapsed() < MIN_REDISCOVERY_INTERVAL)
            .unwrap_or(false);
        if fresh {
            return Ok(());
        }
        let t0 = Instant::now();
        let mappings = backend.discover().await?;
        info!(resources = mappings.len(), took_ms = %t0.elapsed().as_millis(), "mapper: discovery refreshed");
        self.state.store(Arc::new(MapperState { mappings, refreshed_at: Some(Instant::now()) }));
        Ok(())
    }
}
