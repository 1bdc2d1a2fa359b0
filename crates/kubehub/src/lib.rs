//! Emissary kubehub: discovery, REST mapping, read-write coherent client and
//! watch backends.

#![forbid(unsafe_code)]

mod backend;
mod canonical;
mod client;
mod error;
#[cfg(feature = "fake")]
pub mod fake;
mod kube_backend;
mod mapper;

pub use backend::{KubeBackend, PatchBody, ResourceWatcher, WatchEvent};
pub use canonical::{CanonicalCache, CanonicalEntry, Reconciled, CANONICAL_MAX_AGE};
pub use client::{Client, UPSERT_MAX_ATTEMPTS};
pub use error::KatesError;
pub use kube_backend::KubeApiBackend;
pub use mapper::{find_mapping, Mapping, RestMapper, MIN_REDISCOVERY_INTERVAL};

use kube::core::DynamicObject;

/// Convert any typed resource into the dynamic form the client writes.
pub fn to_dynamic<K: serde::Serialize>(obj: &K) -> Result<DynamicObject, KatesError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Convert a dynamic object into a typed resource.
pub fn from_dynamic<K: serde::de::DeserializeOwned>(obj: &DynamicObject) -> Result<K, KatesError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}
