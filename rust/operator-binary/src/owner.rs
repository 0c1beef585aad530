//! Owner reference bookkeeping for [`Certificate`]s and their `Secret`s

use stackable_operator::{
    k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference, kube::Resource,
};

use crate::crd::Certificate;

/// Adds the references in `added` that `current` doesn't already contain.
///
/// References are identified by their UID only. A reference whose UID is already present is left
/// as it is, even if its kind or name differ.
///
/// Returns whether `current` was modified.
pub fn merge_owner_references(current: &mut Vec<OwnerReference>, added: &[OwnerReference]) -> bool {
    let mut changed = false;
    for reference in added {
        if !current.iter().any(|existing| existing.uid == reference.uid) {
            current.push(reference.clone());
            changed = true;
        }
    }
    changed
}

/// The owner reference that ties a materialized `Secret` to its [`Certificate`].
pub fn certificate_owner_reference(certificate: &Certificate) -> OwnerReference {
    OwnerReference {
        api_version: Certificate::api_version(&()).into_owned(),
        kind: Certificate::kind(&()).into_owned(),
        name: certificate.metadata.name.clone().unwrap_or_default(),
        uid: certificate.metadata.uid.clone().unwrap_or_default(),
        ..OwnerReference::default()
    }
}

/// Whether any of `references` points at a [`Certificate`].
pub fn has_certificate_owner(references: &[OwnerReference]) -> bool {
    let api_version = Certificate::api_version(&());
    let kind = Certificate::kind(&());
    references
        .iter()
        .any(|reference| reference.kind == kind && reference.api_version == api_version)
}
