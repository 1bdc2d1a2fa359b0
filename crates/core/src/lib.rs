//! Emissary core types shared by the watch, dispatch and apiext planes.

#![forbid(unsafe_code)]

use kube::core::{DynamicObject, TypeMeta};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

pub mod clock;
pub mod selector;
pub mod snapshot;

pub use clock::{Clock, ManualClock, SystemClock};
pub use selector::{FieldSelector, LabelSelector, SelectorError};

/// Stable object identity (`metadata.uid`).
pub type Uid = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeltaType {
    Add,
    Update,
    Delete,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeltaMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
}

/// Compact record of one add/update/delete seen for a single object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    #[serde(flatten)]
    pub type_meta: TypeMeta,
    pub metadata: DeltaMeta,
    pub delta_type: DeltaType,
}

impl Delta {
    pub fn from_object(obj: &DynamicObject, delta_type: DeltaType) -> Self {
        let type_meta = obj.types.clone().unwrap_or(TypeMeta { api_version: String::new(), kind: String::new() });
        let creation_timestamp = obj.metadata.creation_timestamp.as_ref().map(|t| t.0.to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
        Self {
            type_meta,
            metadata: DeltaMeta { name: obj.name_any(), namespace: obj.namespace(), creation_timestamp },
            delta_type,
        }
    }

    pub fn kind(&self) -> &str { &self.type_meta.kind }
    pub fn name(&self) -> &str { &self.metadata.name }
}

/// A watch request. `name` is the key results are delivered under.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub name: String,
    pub kind: String,
    /// `None` watches all namespaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
}

impl Query {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { name: name.into(), kind: kind.into(), ..Default::default() }
    }

    pub fn in_namespace(mut self, ns: impl Into<String>) -> Self { self.namespace = Some(ns.into()); self }
    pub fn with_labels(mut self, sel: impl Into<String>) -> Self { self.label_selector = Some(sel.into()); self }
    pub fn with_fields(mut self, sel: impl Into<String>) -> Self { self.field_selector = Some(sel.into()); self }

    /// Parse both selectors; malformed selectors fail here rather than at watch time.
    pub fn compile(&self) -> Result<CompiledQuery, SelectorError> {
        let labels = match self.label_selector.as_deref() {
            Some(s) => s.parse::<LabelSelector>()?,
            None => LabelSelector::default(),
        };
        let fields = match self.field_selector.as_deref() {
            Some(s) => s.parse::<FieldSelector>()?,
            None => FieldSelector::default(),
        };
        Ok(CompiledQuery { query: self.clone(), labels, fields })
    }
}

#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub query: Query,
    pub labels: LabelSelector,
    pub fields: FieldSelector,
}

impl CompiledQuery {
    /// Local evaluation of namespace, label and field constraints.
    pub fn matches(&self, obj: &DynamicObject) -> bool {
        if let Some(ns) = self.query.namespace.as_deref() {
            if obj.metadata.namespace.as_deref() != Some(ns) { return false; }
        }
        self.labels.matches(obj.labels()) && self.fields.matches(obj)
    }
}

/// Split `group/version` (or bare `version` for the core group).
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.rsplit_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    }
}

/// Parse a resourceVersion as its integer ordering key.
pub fn parse_resource_version(rv: &str) -> Option<u64> { rv.trim().parse::<u64>().ok() }

/// `Some(a >= b)` when both versions are integers; `None` when either is opaque.
pub fn resource_version_gteq(a: &str, b: &str) -> Option<bool> {
    Some(parse_resource_version(a)? >= parse_resource_version(b)?)
}
