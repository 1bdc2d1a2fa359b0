//! Backend over a live API server via `kube`.

use async_trait::async_trait;
use emissary_core::CompiledQuery;
use futures::{stream::BoxStream, StreamExt};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{DynamicObject, TypeMeta},
    runtime::{watcher, WatchStreamExt},
};
use tracing::{debug, info};

use crate::{KatesError, KubeBackend, Mapping, PatchBody, ResourceWatcher, WatchEvent};

#[derive(Clone)]
pub struct KubeApiBackend {
    client: kube::Client,
}

impl KubeApiBackend {
    pub fn new(client: kube::Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self, KatesError> {
        let client = kube::Client::try_default().await?;
        Ok(Self { client })
    }

    pub fn kube_client(&self) -> kube::Client { self.client.clone() }

    fn api(&self, mapping: &Mapping, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = mapping.api_resource();
        match (mapping.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

/// List items frequently arrive without type information.
pub(crate) fn with_types(mut obj: DynamicObject, mapping: &Mapping) -> DynamicObject {
    if obj.types.as_ref().map(|t| t.kind.is_empty()).unwrap_or(true) {
        obj.types = Some(TypeMeta { api_version: mapping.api_version(), kind: mapping.kind.clone() });
    }
    obj
}

fn object_key(obj: &DynamicObject) -> Result<(Option<String>, String), KatesError> {
    let name = obj.metadata.name.clone().ok_or_else(|| KatesError::Invalid("object has no metadata.name".into()))?;
    Ok((obj.metadata.namespace.clone(), name))
}

fn list_params(query: &CompiledQuery) -> ListParams {
    let mut lp = ListParams::default();
    if !query.labels.is_empty() { lp = lp.labels(&query.labels.to_string()); }
    if !query.fields.is_empty() { lp = lp.fields(&query.fields.to_string()); }
    lp
}

#[async_trait]
impl ResourceWatcher for KubeApiBackend {
    async fn list(&self, mapping: &Mapping, query: &CompiledQuery) -> Result<Vec<DynamicObject>, KatesError> {
        let api = self.api(mapping, query.query.namespace.as_deref());
        let list = api.list(&list_params(query)).await?;
        Ok(list.items.into_iter().map(|o| with_types(o, mapping)).collect())
    }

    fn watch(&self, mapping: &Mapping, query: &CompiledQuery) -> BoxStream<'static, Result<WatchEvent, KatesError>> {
        let api = self.api(mapping, query.query.namespace.as_deref());
        let mut cfg = watcher::Config::default();
        if !query.labels.is_empty() { cfg = cfg.labels(&query.labels.to_string()); }
        if !query.fields.is_empty() { cfg = cfg.fields(&query.fields.to_string()); }
        info!(kind = %mapping.gvk_key(), ns = ?query.query.namespace, "kube: watch started");
        let mapping = mapping.clone();
        watcher::watcher(api, cfg)
            .default_backoff()
            .map(move |ev| match ev {
                Ok(watcher::Event::Applied(o)) => Ok(WatchEvent::Applied(with_types(o, &mapping))),
                Ok(watcher::Event::Deleted(o)) => Ok(WatchEvent::Deleted(with_types(o, &mapping))),
                Ok(watcher::Event::Restarted(list)) => {
                    debug!(kind = %mapping.kind, count = list.len(), "kube: watch restart");
                    Ok(WatchEvent::Restarted(list.into_iter().map(|o| with_types(o, &mapping)).collect()))
                }
                Err(e) => Err(KatesError::from(e)),
            })
            .boxed()
    }
}

#[async_trait]
impl KubeBackend for KubeApiBackend {
    async fn discover(&self) -> Result<Vec<Mapping>, KatesError> {
        let mut out = Vec::new();
        let core = self.client.list_core_api_versions().await?;
        for version in core.versions {
            let list = self.client.list_core_api_resources(&version).await?;
            push_resources(&mut out, "", &version, list.resources);
        }
        let groups = self.client.list_api_groups().await?;
        for group in groups.groups {
            let Some(gv) = group.preferred_version.or_else(|| group.versions.into_iter().next()) else { continue };
            let list = match self.client.list_api_group_resources(&gv.group_version).await {
                Ok(list) => list,
                // aggregated APIs that are down should not break discovery
                Err(e) => {
                    debug!(group = %gv.group_version, error = %e, "kube: skipping unavailable group");
                    continue;
                }
            };
            push_resources(&mut out, &group.name, &gv.version, list.resources);
        }
        Ok(out)
    }

    async fn get(&self, mapping: &Mapping, namespace: Option<&str>, name: &str) -> Result<DynamicObject, KatesError> {
        let obj = self.api(mapping, namespace).get(name).await?;
        Ok(with_types(obj, mapping))
    }

    async fn create(&self, mapping: &Mapping, obj: &DynamicObject) -> Result<DynamicObject, KatesError> {
        let (ns, _) = object_key(obj)?;
        let out = self.api(mapping, ns.as_deref()).create(&PostParams::default(), obj).await?;
        Ok(with_types(out, mapping))
    }

    async fn replace(&self, mapping: &Mapping, obj: &DynamicObject) -> Result<DynamicObject, KatesError> {
        let (ns, name) = object_key(obj)?;
        let out = self.api(mapping, ns.as_deref()).replace(&name, &PostParams::default(), obj).await?;
        Ok(with_types(out, mapping))
    }

    async fn replace_status(&self, mapping: &Mapping, obj: &DynamicObject) -> Result<DynamicObject, KatesError> {
        let (ns, name) = object_key(obj)?;
        let body = serde_json::to_vec(obj)?;
        let out = self.api(mapping, ns.as_deref()).replace_status(&name, &PostParams::default(), body).await?;
        Ok(with_types(out, mapping))
    }

    async fn patch(&self, mapping: &Mapping, namespace: Option<&str>, name: &str, patch: &PatchBody)
        -> Result<DynamicObject, KatesError> {
        let api = self.api(mapping, namespace);
        let pp = PatchParams::default();
        let out = match patch {
            PatchBody::Merge(v) => api.patch(name, &pp, &Patch::Merge(v)).await?,
            PatchBody::Json(v) => {
                let ops = serde_json::from_value(v.clone())?;
                api.patch(name, &pp, &Patch::<serde_json::Value>::Json(ops)).await?
            }
        };
        Ok(with_types(out, mapping))
    }

    async fn delete(&self, mapping: &Mapping, namespace: Option<&str>, name: &str)
        -> Result<Option<DynamicObject>, KatesError> {
        let res = self.api(mapping, namespace).delete(name, &DeleteParams::default()).await?;
        Ok(res.left().map(|o| with_types(o, mapping)))
    }
}

fn push_resources(out: &mut Vec<Mapping>, group: &str, version: &str, resources: Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResource>) {
    for r in resources {
        // subresources such as pods/status
        if r.name.contains('/') {
            continue;
        }
        let singular = if r.singular_name.is_empty() { r.kind.to_lowercase() } else { r.singular_name };
        out.push(Mapping {
            group: group.to_string(),
            version: version.to_string(),
            kind: r.kind,
            plural: r.name,
            singular,
            short_names: r.short_names.unwrap_or_default(),
            namespaced: r.namespaced,
        });
    }
}
