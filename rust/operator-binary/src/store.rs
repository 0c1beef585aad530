//! Persists [`Certificate`]s and their `Secret`s

use std::fmt::{Debug, Display};

use async_trait::async_trait;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret,
    kube::{
        self,
        api::{DeleteParams, Patch, PatchParams, PostParams},
        Api,
    },
};

use tracing::debug;

use crate::{
    crd::{Certificate, ObjectKey},
    utils::Unloggable,
};

/// An error returned by a [`CertificateStore`], with the concrete error type erased.
pub struct StoreError(Box<dyn std::error::Error + Send + Sync>);

impl StoreError {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Box::new(err))
    }
}

impl Debug for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Write access to the backing store of [`Certificate`]s and `Secret`s.
///
/// Every method returns the object as persisted, so that callers can keep their caches up to date.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn create_certificate(&self, certificate: &Certificate) -> Result<Certificate, StoreError>;

    async fn update_certificate(&self, certificate: &Certificate) -> Result<Certificate, StoreError>;

    async fn update_certificate_status(
        &self,
        certificate: &Certificate,
    ) -> Result<Certificate, StoreError>;

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, StoreError>;

    async fn update_secret(&self, secret: &Secret) -> Result<Secret, StoreError>;

    async fn delete_secret(&self, key: &ObjectKey) -> Result<(), StoreError>;
}

#[derive(Debug, Snafu)]
pub enum KubeStoreError {
    #[snafu(display("{kind} has no namespace"))]
    NoNamespace { kind: &'static str },

    #[snafu(display("{kind} has no name"))]
    NoName { kind: &'static str },

    #[snafu(display("create request failed"))]
    Create { source: kube::Error },

    #[snafu(display("replace request failed"))]
    Update { source: kube::Error },

    #[snafu(display("status patch failed"))]
    UpdateStatus { source: kube::Error },

    #[snafu(display("delete request failed"))]
    Delete { source: kube::Error },
}

impl From<KubeStoreError> for StoreError {
    fn from(err: KubeStoreError) -> Self {
        StoreError::new(err)
    }
}

/// A [`CertificateStore`] backed by the Kubernetes API.
#[derive(Debug)]
pub struct KubeStore {
    // Not secret per se, but Client isn't Debug
    client: Unloggable<kube::Client>,
}

impl KubeStore {
    pub fn new(client: kube::Client) -> Self {
        Self {
            client: Unloggable(client),
        }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.0.clone(), namespace)
    }
}

fn key_of(meta: &kube::api::ObjectMeta, kind: &'static str) -> Result<ObjectKey, KubeStoreError> {
    Ok(ObjectKey::new(
        meta.namespace.as_deref().context(NoNamespaceSnafu { kind })?,
        meta.name.as_deref().context(NoNameSnafu { kind })?,
    ))
}

const KIND_CERTIFICATE: &str = "Certificate";
const KIND_SECRET: &str = "Secret";

#[async_trait]
impl CertificateStore for KubeStore {
    async fn create_certificate(&self, certificate: &Certificate) -> Result<Certificate, StoreError> {
        let key = key_of(&certificate.metadata, KIND_CERTIFICATE)?;
        Ok(self
            .api::<Certificate>(&key.namespace)
            .create(&PostParams::default(), certificate)
            .await
            .context(CreateSnafu)?)
    }

    async fn update_certificate(&self, certificate: &Certificate) -> Result<Certificate, StoreError> {
        let key = key_of(&certificate.metadata, KIND_CERTIFICATE)?;
        Ok(self
            .api::<Certificate>(&key.namespace)
            .replace(&key.name, &PostParams::default(), certificate)
            .await
            .context(UpdateSnafu)?)
    }

    async fn update_certificate_status(
        &self,
        certificate: &Certificate,
    ) -> Result<Certificate, StoreError> {
        let key = key_of(&certificate.metadata, KIND_CERTIFICATE)?;
        let patch = serde_json::json!({ "status": certificate.status });
        Ok(self
            .api::<Certificate>(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context(UpdateStatusSnafu)?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        let key = key_of(&secret.metadata, KIND_SECRET)?;
        Ok(self
            .api::<Secret>(&key.namespace)
            .create(&PostParams::default(), secret)
            .await
            .context(CreateSnafu)?)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        let key = key_of(&secret.metadata, KIND_SECRET)?;
        Ok(self
            .api::<Secret>(&key.namespace)
            .replace(&key.name, &PostParams::default(), secret)
            .await
            .context(UpdateSnafu)?)
    }

    async fn delete_secret(&self, key: &ObjectKey) -> Result<(), StoreError> {
        match self
            .api::<Secret>(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            // Usually already garbage collected through its owner reference
            Err(err) if is_not_found(&err) => {
                debug!(secret = %key, "Secret was already deleted");
                Ok(())
            }
            Err(err) => Err(KubeStoreError::Delete { source: err }.into()),
        }
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}
