//! Config snapshot document handed to the configuration daemon.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use k8s_openapi::ByteString;
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

use crate::Delta;

pub const REDACTED: &str = "<REDACTED>";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(rename = "AmbassadorMeta", default, skip_serializing_if = "Option::is_none")]
    pub ambassador_meta: Option<AmbassadorMeta>,
    #[serde(rename = "Kubernetes", default)]
    pub kubernetes: KubernetesSnapshot,
    #[serde(rename = "Consul", default)]
    pub consul: ConsulSnapshot,
    #[serde(rename = "Deltas", default)]
    pub deltas: Vec<Delta>,
    #[serde(rename = "Invalid", default)]
    pub invalid: Vec<DynamicObject>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AmbassadorMeta {
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub ambassador_id: String,
    #[serde(default)]
    pub ambassador_version: String,
    #[serde(default)]
    pub kube_version: String,
    #[serde(default)]
    pub sidecar_ready: bool,
    /// Endpoint resolvers that are active without an explicit resolver resource.
    #[serde(default)]
    pub resolvers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsulSnapshot {
    #[serde(default)]
    pub endpoints: BTreeMap<String, serde_json::Value>,
}

/// Field names double as Accumulator query names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesSnapshot {
    pub services: Vec<Service>,
    pub endpoints: Vec<Endpoints>,
    pub listeners: Vec<DynamicObject>,
    pub hosts: Vec<DynamicObject>,
    pub mappings: Vec<DynamicObject>,
    pub tcpmappings: Vec<DynamicObject>,
    pub modules: Vec<DynamicObject>,
    pub tlscontexts: Vec<DynamicObject>,
    pub ingresses: Vec<Ingress>,
    pub ingressclasses: Vec<IngressClass>,
    pub gateways: Vec<DynamicObject>,
    pub httproutes: Vec<DynamicObject>,
    pub secrets: Vec<Secret>,
    #[serde(rename = "configMaps")]
    pub config_maps: Vec<ConfigMap>,
    pub annotations: Vec<DynamicObject>,
}

impl KubernetesSnapshot {
    pub fn object_count(&self) -> usize {
        self.services.len()
            + self.endpoints.len()
            + self.listeners.len()
            + self.hosts.len()
            + self.mappings.len()
            + self.tcpmappings.len()
            + self.modules.len()
            + self.tlscontexts.len()
            + self.ingresses.len()
            + self.ingressclasses.len()
            + self.gateways.len()
            + self.httproutes.len()
            + self.secrets.len()
            + self.config_maps.len()
            + self.annotations.len()
    }
}

impl ConfigSnapshot {
    /// Redact secrets and shrink invalid objects in place.
    pub fn sanitize(&mut self) {
        for s in self.kubernetes.secrets.iter_mut() {
            sanitize_secret(s);
        }
        self.invalid = self.invalid.iter().map(sanitize_invalid).collect();
    }
}

/// Replace every data value with the redaction marker and strip bookkeeping metadata.
pub fn sanitize_secret(secret: &mut Secret) {
    if let Some(data) = secret.data.as_mut() {
        for v in data.values_mut() {
            *v = ByteString(REDACTED.as_bytes().to_vec());
        }
    }
    secret.string_data = None;
    let meta = &mut secret.metadata;
    meta.managed_fields = None;
    meta.resource_version = None;
    meta.labels = None;
    meta.annotations = None;
}

/// Keep only identity and the `errors` field of an object that failed validation.
pub fn sanitize_invalid(obj: &DynamicObject) -> DynamicObject {
    let mut out = DynamicObject {
        types: obj.types.clone(),
        metadata: Default::default(),
        data: serde_json::json!({}),
    };
    out.metadata.name = obj.metadata.name.clone();
    out.metadata.namespace = obj.metadata.namespace.clone();
    if let Some(errors) = obj.data.get("errors") {
        out.data["errors"] = errors.clone();
    }
    out
}
