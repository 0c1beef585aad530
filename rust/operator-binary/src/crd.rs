use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
};

use serde::{Deserialize, Serialize};
use stackable_operator::{
    kube::{CustomResource, Resource},
    schemars::{self, JsonSchema},
};

/// Label put on every [`Certificate`] created by the operator.
pub const LABEL_CERTIFICATE: &str = "certificates.stackable.tech/certificate";

/// Marks an object as managed by the operator, and therefore safe to overwrite.
pub const ANNOTATION_CONTROLLED: &str = "certificates.stackable.tech/controlled";

/// The hosts that a materialized Secret was last generated for.
pub const ANNOTATION_HOSTS: &str = "certificates.stackable.tech/hosts";

pub const SECRET_KEY_CERT: &str = "tls.crt";
pub const SECRET_KEY_KEY: &str = "tls.key";
pub const SECRET_KEY_CA: &str = "ca.crt";

/// A Certificate describes a TLS certificate that should be materialized as a `Secret` of the
/// same name.
///
/// Certificates are either signing (self-signed CAs), or leaves that are signed by the signing
/// Certificate named in `ca`. Certificates are usually managed by other controllers rather than
/// written by hand, and may be shared between several owners that each request their own set of
/// hosts.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "certificates.stackable.tech",
    version = "v1alpha1",
    kind = "Certificate",
    namespaced,
    status = "CertificateStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    /// The common name of the certificate.
    pub subject: String,

    /// Whether this is a self-signed CA that can be used to sign other Certificates.
    #[serde(default)]
    pub signing: bool,

    /// The name of the signing Certificate in the same namespace. Required unless `signing` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,

    /// DNS names and IP addresses that the certificate must be valid for.
    #[serde(default)]
    pub hosts: BTreeSet<String>,

    /// Whether the certificate will be used for client authentication.
    #[serde(default)]
    pub client: bool,

    /// Whether the certificate will be used for server authentication.
    #[serde(default)]
    pub server: bool,

    /// The hosts most recently requested by each owner, keyed by owner UID.
    ///
    /// This lets an owner drop hosts that it requested earlier without affecting hosts
    /// requested by other owners of the same Certificate.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub owner_hosts: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    #[serde(default)]
    pub conditions: Vec<CertificateCondition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
}

pub const CONDITION_READY: &str = "Ready";

/// The outcome of the most recent reconciliation of a [`Certificate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Error { reason: String, message: String },
}

impl From<&Readiness> for CertificateCondition {
    fn from(readiness: &Readiness) -> Self {
        match readiness {
            Readiness::Ready => CertificateCondition {
                type_: CONDITION_READY.to_string(),
                status: ConditionStatus::True,
                reason: CONDITION_READY.to_string(),
                message: None,
            },
            Readiness::Error { reason, message } => CertificateCondition {
                type_: CONDITION_READY.to_string(),
                status: ConditionStatus::False,
                reason: reason.clone(),
                message: Some(message.clone()),
            },
        }
    }
}

impl CertificateStatus {
    /// Returns a copy of `self` with the `Ready` condition replaced by `readiness`.
    pub fn with_readiness(&self, readiness: &Readiness) -> Self {
        let mut conditions = self
            .conditions
            .iter()
            .filter(|cond| cond.type_ != CONDITION_READY)
            .cloned()
            .collect::<Vec<_>>();
        conditions.push(readiness.into());
        Self { conditions }
    }

    pub fn ready_condition(&self) -> Option<&CertificateCondition> {
        self.conditions
            .iter()
            .find(|cond| cond.type_ == CONDITION_READY)
    }
}

impl Certificate {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::of(self)
    }

    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(CertificateStatus::ready_condition)
            .is_some_and(|cond| cond.status == ConditionStatus::True)
    }
}

/// Identifies an object within a namespace, used to join [`Certificate`]s with their `Secret`s.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of<K: Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        Self::new(
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        )
    }

    /// A sibling object in the same namespace.
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self::new(self.namespace.clone(), name)
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
