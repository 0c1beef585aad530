//! Converges materialized `Secret`s towards their [`Certificate`] definitions
//!
//! The [`CertificateManager`] keeps an index of all known [`Certificate`]s and `Secret`s, joined by
//! [`ObjectKey`]. Changes to either are delivered as [`Event`]s, and each event reconciles the
//! affected Certificate against its Secret. Definitions are declared through
//! [`CertificateManager::ensure`] and [`CertificateManager::ensure_ca`], which may be called by
//! several independent owners for the same Certificate.
//!
//! The manager must only be driven from one task at a time, see [`crate::controller`].

use std::collections::{BTreeMap, BTreeSet};

use snafu::{ensure, OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::OwnerReference,
    },
    kube::api::ObjectMeta,
    time::Duration,
};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info, warn};

use crate::{
    context::ControllerContext,
    crd::{
        Certificate, CertificateSpec, ObjectKey, Readiness, ANNOTATION_CONTROLLED,
        ANNOTATION_HOSTS, LABEL_CERTIFICATE,
    },
    hosts::HostChanges,
    material::{self, CertificateAuthority, Usage, DEFAULT_CERT_LIFETIME},
    owner::{certificate_owner_reference, merge_owner_references},
    store::{CertificateStore, StoreError},
    utils::error_full_message,
    validate::{is_secret_controlled, is_secret_correct},
};

const KIND_CERTIFICATE: &str = "Certificate";
const KIND_SECRET: &str = "Secret";

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to create Certificate {certificate}"))]
    CreateCertificate {
        source: StoreError,
        certificate: ObjectKey,
    },

    #[snafu(display("failed to update Certificate {certificate}"))]
    UpdateCertificate {
        source: StoreError,
        certificate: ObjectKey,
    },

    #[snafu(display("failed to update status of Certificate {certificate}"))]
    UpdateStatus {
        source: StoreError,
        certificate: ObjectKey,
    },

    #[snafu(display("Secret {secret} exists but is not controlled by the operator"))]
    NotControlled { secret: ObjectKey },

    #[snafu(display("Certificate {certificate} is neither signing nor names a CA"))]
    MissingCa { certificate: ObjectKey },

    #[snafu(display("CA {ca} not found"))]
    CaNotFound { ca: ObjectKey },

    #[snafu(display("failed to load CA from Secret {ca}"))]
    LoadCa {
        source: material::Error,
        ca: ObjectKey,
    },

    #[snafu(display("failed to generate key material for Certificate {certificate}"))]
    GenerateMaterial {
        source: material::Error,
        certificate: ObjectKey,
    },

    #[snafu(display("failed to create Secret {secret}"))]
    CreateSecret { source: StoreError, secret: ObjectKey },

    #[snafu(display("failed to update Secret {secret}"))]
    UpdateSecret { source: StoreError, secret: ObjectKey },

    #[snafu(display("failed to delete Secret {secret}"))]
    DeleteSecret { source: StoreError, secret: ObjectKey },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// A short, stable name for the kind of error, used as the reason of status conditions.
    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

/// A change to a watched object. An absent object means that it has been deleted.
#[derive(Clone, Debug)]
pub enum Event {
    Certificate {
        key: ObjectKey,
        certificate: Option<Certificate>,
    },
    Secret {
        key: ObjectKey,
        secret: Option<Secret>,
    },
}

impl Event {
    pub fn key(&self) -> &ObjectKey {
        match self {
            Event::Certificate { key, .. } | Event::Secret { key, .. } => key,
        }
    }
}

/// What a caller asks [`CertificateManager::ensure`] for.
#[derive(Clone, Debug, Default)]
pub struct LeafRequest {
    pub ca: String,
    pub subject: String,
    pub hosts: BTreeSet<String>,
    pub client: bool,
    pub server: bool,
}

pub struct CertificateManager<S> {
    definitions: BTreeMap<ObjectKey, Certificate>,
    secrets: BTreeMap<ObjectKey, Secret>,
    store: S,
    context: Option<Box<dyn ControllerContext>>,
    certificate_lifetime: Duration,
}

impl<S: CertificateStore> CertificateManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            definitions: BTreeMap::new(),
            secrets: BTreeMap::new(),
            store,
            context: None,
            certificate_lifetime: DEFAULT_CERT_LIFETIME,
        }
    }

    pub fn with_context(mut self, context: impl ControllerContext + 'static) -> Self {
        self.context = Some(Box::new(context));
        self
    }

    pub fn with_certificate_lifetime(mut self, lifetime: Duration) -> Self {
        self.certificate_lifetime = lifetime;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn definition(&self, key: &ObjectKey) -> Option<&Certificate> {
        self.definitions.get(key)
    }

    pub fn secret(&self, key: &ObjectKey) -> Option<&Secret> {
        self.secrets.get(key)
    }

    pub fn is_controlled(&self, namespace: &str) -> bool {
        self.context
            .as_ref()
            .map_or(true, |context| context.is_controlled(namespace))
    }

    /// Declares a self-signed signing Certificate.
    pub async fn ensure_ca(
        &mut self,
        namespace: &str,
        name: &str,
        subject: &str,
        owner_references: &[OwnerReference],
    ) -> Result<()> {
        let spec = CertificateSpec {
            subject: subject.to_string(),
            signing: true,
            ..CertificateSpec::default()
        };
        self.ensure_definition(ObjectKey::new(namespace, name), spec, owner_references)
            .await
    }

    /// Declares a Certificate signed by the CA named in `request`.
    ///
    /// If the Certificate is shared with other owners, its hosts become the union of what each
    /// owner requested. The first of `owner_references` identifies the caller, whose previously
    /// requested hosts are dropped if they are no longer requested.
    pub async fn ensure(
        &mut self,
        namespace: &str,
        name: &str,
        request: LeafRequest,
        owner_references: &[OwnerReference],
    ) -> Result<()> {
        let spec = CertificateSpec {
            subject: request.subject,
            signing: false,
            ca: Some(request.ca),
            hosts: request.hosts,
            client: request.client,
            server: request.server,
            owner_hosts: BTreeMap::new(),
        };
        self.ensure_definition(ObjectKey::new(namespace, name), spec, owner_references)
            .await
    }

    async fn ensure_definition(
        &mut self,
        key: ObjectKey,
        requested: CertificateSpec,
        owner_references: &[OwnerReference],
    ) -> Result<()> {
        let owner_uid = owner_references
            .first()
            .map(|reference| reference.uid.as_str());
        let result = match self.definitions.get(&key) {
            Some(current) => {
                let mut updated = current.clone();
                let mut changed = merge_owner_references(
                    updated
                        .metadata
                        .owner_references
                        .get_or_insert_with(Vec::new),
                    owner_references,
                );
                let spec = merge_spec(&key, &updated.spec, requested, owner_uid);
                if spec != updated.spec {
                    updated.spec = spec;
                    changed = true;
                }
                if let Some(context) = &self.context {
                    changed |= context.set_labels(
                        &key.namespace,
                        &key.name,
                        KIND_CERTIFICATE,
                        updated.metadata.labels.get_or_insert_with(BTreeMap::new),
                    );
                    changed |= context.set_annotations(
                        &key.namespace,
                        &key.name,
                        KIND_CERTIFICATE,
                        updated.metadata.annotations.get_or_insert_with(BTreeMap::new),
                    );
                }
                if !changed {
                    return Ok(());
                }
                self.store
                    .update_certificate(&updated)
                    .await
                    .context(UpdateCertificateSnafu {
                        certificate: key.clone(),
                    })
            }
            None => {
                let mut spec = requested;
                if let Some(uid) = owner_uid {
                    spec.owner_hosts.insert(uid.to_string(), spec.hosts.clone());
                }
                let mut owners = Vec::new();
                merge_owner_references(&mut owners, owner_references);
                let mut labels = BTreeMap::from([(LABEL_CERTIFICATE.to_string(), "true".to_string())]);
                let mut annotations =
                    BTreeMap::from([(ANNOTATION_CONTROLLED.to_string(), "true".to_string())]);
                if let Some(context) = &self.context {
                    context.set_labels(&key.namespace, &key.name, KIND_CERTIFICATE, &mut labels);
                    context.set_annotations(
                        &key.namespace,
                        &key.name,
                        KIND_CERTIFICATE,
                        &mut annotations,
                    );
                }
                let certificate = Certificate {
                    metadata: ObjectMeta {
                        name: Some(key.name.clone()),
                        namespace: Some(key.namespace.clone()),
                        owner_references: Some(owners),
                        labels: Some(labels),
                        annotations: Some(annotations),
                        ..ObjectMeta::default()
                    },
                    spec,
                    status: None,
                };
                self.store
                    .create_certificate(&certificate)
                    .await
                    .context(CreateCertificateSnafu {
                        certificate: key.clone(),
                    })
            }
        };
        match result {
            Ok(persisted) => {
                info!(
                    certificate = %key,
                    hosts = ?persisted.spec.hosts,
                    "saved Certificate"
                );
                self.definitions.insert(key, persisted);
                Ok(())
            }
            Err(err) => {
                warn!(
                    certificate = %key,
                    error = &err as &dyn std::error::Error,
                    "failed to save Certificate"
                );
                Err(err)
            }
        }
    }

    /// Processes a single change notification.
    ///
    /// Errors encountered while reconciling are recorded on the Certificate's status rather than
    /// returned; only failures to record them, and failures to delete Secrets, are returned.
    pub async fn handle(&mut self, event: Event) -> Result<()> {
        if !self.is_controlled(&event.key().namespace) {
            return Ok(());
        }
        match event {
            Event::Certificate {
                key,
                certificate: Some(certificate),
            } => {
                self.definitions.insert(key.clone(), certificate);
                self.reconcile(&key).await?;
                self.reconcile_dependents(&key).await;
                Ok(())
            }
            Event::Certificate {
                key,
                certificate: None,
            } => self.certificate_deleted(&key).await,
            Event::Secret {
                key,
                secret: Some(secret),
            } => {
                self.secrets.insert(key.clone(), secret);
                if self.definitions.contains_key(&key) {
                    self.reconcile(&key).await?;
                    self.reconcile_dependents(&key).await;
                }
                Ok(())
            }
            Event::Secret { key, secret: None } => {
                debug!(secret = %key, "Secret deleted");
                self.secrets.remove(&key);
                Ok(())
            }
        }
    }

    /// Rebuilds the indexes from a full listing of both kinds, and reconciles every Certificate.
    pub async fn recover(&mut self, certificates: Vec<Certificate>, secrets: Vec<Secret>) {
        for secret in secrets {
            let key = ObjectKey::of(&secret);
            if self.is_controlled(&key.namespace) {
                self.secrets.insert(key, secret);
            }
        }
        for certificate in certificates {
            let key = certificate.key();
            if self.is_controlled(&key.namespace) {
                self.definitions.insert(key, certificate);
            }
        }
        // CAs first, so that their leaves can be signed in the same pass
        let mut keys = self.definitions.keys().cloned().collect::<Vec<_>>();
        keys.sort_by_key(|key| !self.definitions[key].spec.signing);
        info!(
            certificates = keys.len(),
            secrets = self.secrets.len(),
            "recovering Certificates"
        );
        for key in keys {
            if let Err(err) = self.reconcile(&key).await {
                warn!(
                    certificate = %key,
                    error = &err as &dyn std::error::Error,
                    "failed to reconcile Certificate during recovery"
                );
            }
        }
    }

    async fn reconcile(&mut self, key: &ObjectKey) -> Result<()> {
        let Some(certificate) = self.definitions.get(key).cloned() else {
            return Ok(());
        };
        let result = match self.secrets.get(key).cloned() {
            Some(secret) => self.update_secret(key, &certificate, secret).await,
            None => self.create_secret(key, &certificate).await,
        };
        let readiness = match &result {
            Ok(()) => Readiness::Ready,
            Err(err) => {
                warn!(
                    certificate = %key,
                    error = err as &dyn std::error::Error,
                    "failed to reconcile Certificate"
                );
                Readiness::Error {
                    reason: err.category().to_string(),
                    message: error_full_message(err),
                }
            }
        };
        self.update_status(key, certificate, &readiness).await
    }

    /// Retries leaves that are waiting for the CA at `ca_key` to be materialized.
    async fn reconcile_dependents(&mut self, ca_key: &ObjectKey) {
        let is_materialized_ca = self
            .definitions
            .get(ca_key)
            .is_some_and(|ca| ca.spec.signing)
            && self.secrets.contains_key(ca_key);
        if !is_materialized_ca {
            return;
        }
        let dependents = self
            .definitions
            .iter()
            .filter(|(key, certificate)| {
                key.namespace == ca_key.namespace
                    && !certificate.spec.signing
                    && certificate.spec.ca.as_deref() == Some(ca_key.name.as_str())
                    && !self.secrets.contains_key(*key)
            })
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in dependents {
            debug!(certificate = %key, ca = %ca_key, "CA is now available");
            if let Err(err) = self.reconcile(&key).await {
                warn!(
                    certificate = %key,
                    error = &err as &dyn std::error::Error,
                    "failed to reconcile Certificate"
                );
            }
        }
    }

    async fn update_status(
        &mut self,
        key: &ObjectKey,
        mut certificate: Certificate,
        readiness: &Readiness,
    ) -> Result<()> {
        let status = certificate
            .status
            .clone()
            .unwrap_or_default()
            .with_readiness(readiness);
        if certificate.status.as_ref() == Some(&status) {
            return Ok(());
        }
        certificate.status = Some(status);
        let updated = self
            .store
            .update_certificate_status(&certificate)
            .await
            .context(UpdateStatusSnafu {
                certificate: key.clone(),
            })?;
        self.definitions.insert(key.clone(), updated);
        Ok(())
    }

    async fn update_secret(
        &mut self,
        key: &ObjectKey,
        certificate: &Certificate,
        mut secret: Secret,
    ) -> Result<()> {
        let controlled = is_secret_controlled(&secret);
        let mut changed = false;
        if !is_secret_correct(certificate, &secret) {
            ensure!(controlled, NotControlledSnafu { secret: key.clone() });
            info!(secret = %key, "regenerating Secret");
            let regenerated = self.generate_secret(key, certificate)?;
            secret.data = regenerated.data;
            secret
                .metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(
                    ANNOTATION_HOSTS.to_string(),
                    join_hosts(&certificate.spec.hosts),
                );
            changed = true;
        }
        if let (true, Some(context)) = (controlled, &self.context) {
            changed |= context.set_labels(
                &key.namespace,
                &key.name,
                KIND_SECRET,
                secret.metadata.labels.get_or_insert_with(BTreeMap::new),
            );
            changed |= context.set_annotations(
                &key.namespace,
                &key.name,
                KIND_SECRET,
                secret.metadata.annotations.get_or_insert_with(BTreeMap::new),
            );
        }
        if !changed {
            return Ok(());
        }
        let updated = self
            .store
            .update_secret(&secret)
            .await
            .context(UpdateSecretSnafu { secret: key.clone() })?;
        info!(
            secret = %key,
            hosts = ?certificate.spec.hosts,
            "updated Secret"
        );
        self.secrets.insert(key.clone(), updated);
        Ok(())
    }

    async fn create_secret(&mut self, key: &ObjectKey, certificate: &Certificate) -> Result<()> {
        let mut secret = self.generate_secret(key, certificate)?;
        let mut labels = BTreeMap::from([(LABEL_CERTIFICATE.to_string(), "true".to_string())]);
        let mut annotations = BTreeMap::from([
            (ANNOTATION_CONTROLLED.to_string(), "true".to_string()),
            (
                ANNOTATION_HOSTS.to_string(),
                join_hosts(&certificate.spec.hosts),
            ),
        ]);
        if let Some(context) = &self.context {
            context.set_labels(&key.namespace, &key.name, KIND_SECRET, &mut labels);
            context.set_annotations(&key.namespace, &key.name, KIND_SECRET, &mut annotations);
        }
        secret.metadata.labels = Some(labels);
        secret.metadata.annotations = Some(annotations);
        let created = self
            .store
            .create_secret(&secret)
            .await
            .context(CreateSecretSnafu { secret: key.clone() })?;
        info!(
            secret = %key,
            hosts = ?certificate.spec.hosts,
            "created Secret"
        );
        self.secrets.insert(key.clone(), created);
        Ok(())
    }

    fn generate_secret(&self, key: &ObjectKey, certificate: &Certificate) -> Result<Secret> {
        let spec = &certificate.spec;
        let material = if spec.signing {
            material::generate_self_signed(&spec.subject, self.certificate_lifetime)
        } else {
            let ca_name = spec.ca.as_deref().context(MissingCaSnafu {
                certificate: key.clone(),
            })?;
            let ca_key = key.sibling(ca_name);
            let ca_secret = self
                .secrets
                .get(&ca_key)
                .context(CaNotFoundSnafu { ca: ca_key.clone() })?;
            let empty = BTreeMap::new();
            let ca = CertificateAuthority::from_secret_data(
                ca_secret.data.as_ref().unwrap_or(&empty),
            )
            .context(LoadCaSnafu { ca: ca_key })?;
            material::generate_signed(
                &spec.subject,
                &spec.hosts,
                Usage {
                    client: spec.client,
                    server: spec.server,
                },
                self.certificate_lifetime,
                &ca,
            )
        }
        .and_then(material::Material::into_secret_data)
        .context(GenerateMaterialSnafu {
            certificate: key.clone(),
        })?;
        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(key.name.clone()),
                namespace: Some(key.namespace.clone()),
                owner_references: Some(vec![certificate_owner_reference(certificate)]),
                ..ObjectMeta::default()
            },
            data: Some(material),
            ..Secret::default()
        })
    }

    async fn certificate_deleted(&mut self, key: &ObjectKey) -> Result<()> {
        debug!(certificate = %key, "Certificate deleted");
        self.definitions.remove(key);
        let Some(secret) = self.secrets.get(key) else {
            return Ok(());
        };
        if !is_secret_controlled(secret) {
            info!(secret = %key, "not deleting Secret that is not controlled by the operator");
            return Ok(());
        }
        if let Err(err) = self.store.delete_secret(key).await {
            warn!(
                secret = %key,
                error = &err as &dyn std::error::Error,
                "failed to delete Secret"
            );
            return Err(err).context(DeleteSecretSnafu { secret: key.clone() });
        }
        info!(secret = %key, "deleted Secret");
        self.secrets.remove(key);
        Ok(())
    }
}

/// Computes the [`CertificateSpec`] resulting from an owner requesting `requested`, given `current`.
fn merge_spec(
    key: &ObjectKey,
    current: &CertificateSpec,
    requested: CertificateSpec,
    owner_uid: Option<&str>,
) -> CertificateSpec {
    let previously = owner_uid.and_then(|uid| current.owner_hosts.get(uid));
    let hosts = HostChanges::between(previously, &requested.hosts).apply(key, &current.hosts);
    let mut owner_hosts = current.owner_hosts.clone();
    if let Some(uid) = owner_uid {
        owner_hosts.insert(uid.to_string(), requested.hosts.clone());
    }
    CertificateSpec {
        hosts,
        owner_hosts,
        ..requested
    }
}

fn join_hosts(hosts: &BTreeSet<String>) -> String {
    hosts.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}
