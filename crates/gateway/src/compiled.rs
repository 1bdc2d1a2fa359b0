//! Compiled config: the intermediate form a transform produces for one
//! resource. Every item carries the source it came from.

use std::fmt;
use std::sync::Arc;

use kube::ResourceExt;

use crate::xds::{Cluster, ClusterLoadAssignment, Listener, Route};

/// Where a compiled item came from, as shown in diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Source(String);

impl Source {
    pub fn new(location: impl Into<String>) -> Self { Self(location.into()) }

    /// `"<Kind> <name>.<namespace>"`.
    pub fn from_parts(kind: &str, namespace: &str, name: &str) -> Self { Self(format!("{} {}.{}", kind, name, namespace)) }

    pub fn from_resource<K: ResourceExt>(kind: &str, obj: &K) -> Self {
        Self::from_parts(kind, &obj.namespace().unwrap_or_default(), &obj.name_any())
    }

    /// `"<item> <n> in <parent>"`.
    pub fn nth(&self, item: &str, n: usize) -> Self { Self(format!("{} {} in {}", item, n, self.0)) }

    /// `"<item> in <parent>"`.
    pub fn within(&self, item: &str) -> Self { Self(format!("{} in {}", item, self.0)) }

    pub fn location(&self) -> &str { &self.0 }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledItem {
    pub source: Source,
    pub error: Option<String>,
}

impl CompiledItem {
    pub fn new(source: Source) -> Self { Self { source, error: None } }

    pub fn with_error(source: Source, error: impl Into<String>) -> Self { Self { source, error: Some(error.into()) } }

    pub fn has_error(&self) -> bool { self.error.as_deref().is_some_and(|e| !e.is_empty()) }
}

/// Decides which compiled routes a listener's route configuration picks up.
pub type RoutePredicate = Arc<dyn Fn(&CompiledRoute) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct CompiledListener {
    pub item: CompiledItem,
    /// `None` when the transform could not produce one; the item says why.
    pub listener: Option<Listener>,
    pub domains: Vec<String>,
    pub predicate: RoutePredicate,
}

impl CompiledListener {
    /// A listener that serves every route on every domain.
    pub fn new(item: CompiledItem, listener: Listener) -> Self {
        Self { item, listener: Some(listener), domains: vec!["*".to_string()], predicate: Arc::new(|_| true) }
    }

    pub fn failed(item: CompiledItem) -> Self {
        Self { item, listener: None, domains: vec!["*".to_string()], predicate: Arc::new(|_| true) }
    }

    pub fn with_domains(mut self, domains: Vec<String>) -> Self {
        self.domains = domains;
        self
    }

    pub fn with_predicate(mut self, predicate: impl Fn(&CompiledRoute) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }
}

impl fmt::Debug for CompiledListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledListener")
            .field("item", &self.item)
            .field("listener", &self.listener.as_ref().map(|l| &l.name))
            .field("domains", &self.domains)
            .finish_non_exhaustive()
    }
}

/// A reference from a route to a cluster whose endpoints live at `endpoint_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRef {
    pub item: CompiledItem,
    pub name: String,
    pub endpoint_path: String,
    /// Which endpoint resolver feeds the cluster; `None` is the implicit one.
    pub resolver: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRoute {
    pub item: CompiledItem,
    pub namespace: String,
    pub routes: Vec<Route>,
    pub cluster_refs: Vec<ClusterRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledCluster {
    pub item: CompiledItem,
    pub cluster: Option<Cluster>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledLoadAssignment {
    pub item: CompiledItem,
    pub load_assignment: Option<ClusterLoadAssignment>,
}

#[derive(Debug, Clone)]
pub struct CompiledConfig {
    pub item: CompiledItem,
    pub listeners: Vec<CompiledListener>,
    pub routes: Vec<CompiledRoute>,
    pub clusters: Vec<CompiledCluster>,
    pub load_assignments: Vec<CompiledLoadAssignment>,
}

impl CompiledConfig {
    pub fn new(source: Source) -> Self {
        Self { item: CompiledItem::new(source), listeners: Vec::new(), routes: Vec::new(), clusters: Vec::new(), load_assignments: Vec::new() }
    }

    /// Items carrying an error, in config, listener, route, clusterRef,
    /// cluster, load assignment order.
    pub fn errors(&self) -> Vec<CompiledItem> {
        let mut out = Vec::new();
        let mut push = |item: &CompiledItem| {
            if item.has_error() {
                out.push(item.clone());
            }
        };
        push(&self.item);
        self.listeners.iter().for_each(|l| push(&l.item));
        self.routes.iter().for_each(|r| push(&r.item));
        self.routes.iter().flat_map(|r| r.cluster_refs.iter()).for_each(|c| push(&c.item));
        self.clusters.iter().for_each(|c| push(&c.item));
        self.load_assignments.iter().for_each(|l| push(&l.item));
        out
    }
}
