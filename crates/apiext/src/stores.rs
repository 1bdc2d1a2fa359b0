//! Narrow views of the cluster the CA manager and CRD controller write through.

use std::collections::BTreeMap;

use async_trait::async_trait;
use emissary_core::Query;
use emissary_kubehub::{from_dynamic, to_dynamic, Client, PatchBody};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::ByteString;
use kube::core::DynamicObject;

#[cfg(test)]
use mockall::automock;

use crate::ApiExtError;

pub const CRD_KIND: &str = "CustomResourceDefinition";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// `None` when the Secret does not exist.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ApiExtError>;

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, ApiExtError>;

    /// Merge-patch `data` into an existing Secret.
    async fn patch_secret_data(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, ByteString>,
    ) -> Result<Secret, ApiExtError>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait CrdStore: Send + Sync {
    /// `None` when the CRD does not exist.
    async fn get_crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>, ApiExtError>;

    async fn list_crds(&self) -> Result<Vec<CustomResourceDefinition>, ApiExtError>;

    async fn replace_crd(&self, crd: &CustomResourceDefinition) -> Result<CustomResourceDefinition, ApiExtError>;
}

fn not_found_as_none<T>(r: Result<T, emissary_kubehub::KatesError>) -> Result<Option<T>, ApiExtError> {
    match r {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl SecretStore for Client {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ApiExtError> {
        match not_found_as_none(self.get("Secret", Some(namespace), name).await)? {
            Some(obj) => Ok(Some(from_dynamic(&obj)?)),
            None => Ok(None),
        }
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, ApiExtError> {
        Ok(from_dynamic(&self.create(&to_dynamic(secret)?).await?)?)
    }

    async fn patch_secret_data(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, ByteString>,
    ) -> Result<Secret, ApiExtError> {
        let target = to_dynamic(&Secret {
            metadata: kube::core::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        })?;
        let body = serde_json::json!({ "data": data });
        Ok(from_dynamic(&self.patch(&target, PatchBody::Merge(body)).await?)?)
    }
}

#[async_trait]
impl CrdStore for Client {
    async fn get_crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>, ApiExtError> {
        match not_found_as_none(self.get(CRD_KIND, None, name).await)? {
            Some(obj) => Ok(Some(from_dynamic(&obj)?)),
            None => Ok(None),
        }
    }

    async fn list_crds(&self) -> Result<Vec<CustomResourceDefinition>, ApiExtError> {
        let objs: Vec<DynamicObject> = self.list(&Query::new("crds", CRD_KIND)).await?;
        objs.iter().map(|o| from_dynamic(o).map_err(ApiExtError::from)).collect()
    }

    async fn replace_crd(&self, crd: &CustomResourceDefinition) -> Result<CustomResourceDefinition, ApiExtError> {
        Ok(from_dynamic(&self.update(&to_dynamic(crd)?).await?)?)
    }
}
