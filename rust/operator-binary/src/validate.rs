//! Decides whether a materialized `Secret` still satisfies its [`Certificate`]

use std::{
    collections::HashSet,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use openssl::{nid::Nid, x509::X509Ref};
use stackable_operator::k8s_openapi::api::core::v1::Secret;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::{
    crd::{Certificate, ANNOTATION_CONTROLLED, SECRET_KEY_CERT},
    material::{self, Address},
    owner::has_certificate_owner,
    utils::asn1time_to_offsetdatetime,
};

/// Whether `secret` is managed by the operator, and may therefore be overwritten or deleted.
pub fn is_secret_controlled(secret: &Secret) -> bool {
    let has_annotation = secret
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|annotations| annotations.contains_key(ANNOTATION_CONTROLLED));
    has_annotation
        || secret
            .metadata
            .owner_references
            .as_deref()
            .is_some_and(has_certificate_owner)
}

/// Whether the certificate in `secret` is still valid for `certificate`.
pub fn is_secret_correct(certificate: &Certificate, secret: &Secret) -> bool {
    is_secret_correct_at(certificate, secret, OffsetDateTime::now_utc())
}

/// Like [`is_secret_correct`], but checks expiry relative to `now`.
pub fn is_secret_correct_at(certificate: &Certificate, secret: &Secret, now: OffsetDateTime) -> bool {
    let key = certificate.key();
    let Some(data) = secret
        .data
        .as_ref()
        .and_then(|data| data.get(SECRET_KEY_CERT))
    else {
        debug!(certificate = %key, "Secret has no certificate");
        return false;
    };
    let cert = match material::decode_certificate(&data.0) {
        Ok(cert) => cert,
        Err(err) => {
            warn!(
                certificate = %key,
                error = &err as &dyn std::error::Error,
                "bad certificate in Secret"
            );
            return false;
        }
    };
    match asn1time_to_offsetdatetime(cert.not_after()) {
        Ok(not_after) if not_after < now => {
            warn!(certificate = %key, %not_after, "certificate has expired");
            return false;
        }
        Ok(_) => {}
        Err(err) => {
            warn!(
                certificate = %key,
                error = &err as &dyn std::error::Error,
                "unable to read certificate expiry"
            );
            return false;
        }
    }
    if common_name(&cert).as_deref() != Some(certificate.spec.subject.as_str()) {
        debug!(certificate = %key, "certificate subject has changed");
        return false;
    }
    let valid_for = ValidHosts::of(&cert);
    if let Some(missing) = certificate
        .spec
        .hosts
        .iter()
        .find(|host| !valid_for.covers(host))
    {
        debug!(certificate = %key, host = %missing, "certificate is not valid for host");
        return false;
    }
    true
}

fn common_name(cert: &X509Ref) -> Option<String> {
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
}

/// The DNS names and IP addresses listed in a certificate's subject alternative names.
#[derive(Debug, Default)]
struct ValidHosts {
    dns: HashSet<String>,
    ips: HashSet<IpAddr>,
}

impl ValidHosts {
    fn of(cert: &X509Ref) -> Self {
        let mut hosts = Self::default();
        for name in cert.subject_alt_names().iter().flatten() {
            if let Some(dns) = name.dnsname() {
                hosts.dns.insert(dns.to_string());
            }
            if let Some(ip) = name.ipaddress().and_then(ip_from_bytes) {
                hosts.ips.insert(ip);
            }
        }
        hosts
    }

    /// IP addresses are compared by value, since they may be requested in any textual form.
    fn covers(&self, host: &str) -> bool {
        match Address::from(host) {
            Address::Dns(dns) => self.dns.contains(&dns),
            Address::Ip(ip) => self.ips.contains(&ip),
        }
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    if let Ok(v4) = <[u8; 4]>::try_from(bytes) {
        Some(Ipv4Addr::from(v4).into())
    } else if let Ok(v6) = <[u8; 16]>::try_from(bytes) {
        Some(Ipv6Addr::from(v6).into())
    } else {
        None
    }
}
