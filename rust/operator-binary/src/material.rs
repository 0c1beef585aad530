//! Generates the key and certificate material for [`Certificate`](crate::crd::Certificate)s

use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
};

use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::{BigNum, MsbOption},
    conf::{Conf, ConfMethod},
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
            SubjectAlternativeName, SubjectKeyIdentifier,
        },
        X509Builder, X509Name, X509NameBuilder, X509,
    },
};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{k8s_openapi::ByteString, time::Duration};
use time::OffsetDateTime;

use crate::crd::{SECRET_KEY_CA, SECRET_KEY_CERT, SECRET_KEY_KEY};

/// Lifetime of generated certificates, unless configured otherwise.
///
/// Certificates are regenerated once they expire, so this mostly bounds how long a leaked key
/// remains useful.
pub const DEFAULT_CERT_LIFETIME: Duration = Duration::from_days_unchecked(5 * 365);

const RSA_KEY_LENGTH: u32 = 2048;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to generate certificate key"))]
    GenerateKey { source: ErrorStack },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: ErrorStack },

    #[snafu(display("failed to serialize {tpe:?} certificate"))]
    SerializeCertificate { source: ErrorStack, tpe: CertType },

    #[snafu(display("CA secret is missing required file {key:?}"))]
    MissingCaFile { key: &'static str },

    #[snafu(display("failed to load CA file {key:?}"))]
    LoadCa {
        source: ErrorStack,
        key: &'static str,
    },

    #[snafu(display("failed to decode certificate"))]
    DecodeCertificate { source: ErrorStack },

    #[snafu(display("certificate lifetime {lifetime} is too long"))]
    LifetimeTooLong { lifetime: Duration },
}
type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub enum CertType {
    Ca,
    Leaf,
}

/// A DNS name or IP address that a certificate is issued for.
#[derive(Debug, PartialEq, Eq)]
pub enum Address {
    Dns(String),
    Ip(IpAddr),
}

impl From<&str> for Address {
    fn from(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Address::Ip(ip),
            Err(_) => Address::Dns(host.to_string()),
        }
    }
}

/// Which roles the key of a leaf certificate may be used for.
#[derive(Clone, Copy, Debug, Default)]
pub struct Usage {
    pub client: bool,
    pub server: bool,
}

pub struct CertificateAuthority {
    pub ca_cert: X509,
    pub ca_key: PKey<Private>,
}

impl CertificateAuthority {
    /// Loads the CA from the data of a materialized signing `Secret`.
    pub fn from_secret_data(secret_data: &BTreeMap<String, ByteString>) -> Result<Self> {
        let ca_cert = X509::from_pem(
            &secret_data
                .get(SECRET_KEY_CERT)
                .context(MissingCaFileSnafu {
                    key: SECRET_KEY_CERT,
                })?
                .0,
        )
        .context(LoadCaSnafu {
            key: SECRET_KEY_CERT,
        })?;
        let ca_key = PKey::private_key_from_pem(
            &secret_data
                .get(SECRET_KEY_KEY)
                .context(MissingCaFileSnafu {
                    key: SECRET_KEY_KEY,
                })?
                .0,
        )
        .context(LoadCaSnafu {
            key: SECRET_KEY_KEY,
        })?;
        Ok(Self { ca_cert, ca_key })
    }
}

/// A freshly generated key and certificate, along with the certificate of the CA that signed it.
pub struct Material {
    pub cert: X509,
    pub key: PKey<Private>,
    pub ca_cert: X509,
}

impl Material {
    /// Serializes the material into the `tls.crt`, `tls.key`, and `ca.crt` entries of a `Secret`.
    pub fn into_secret_data(self) -> Result<BTreeMap<String, ByteString>> {
        Ok([
            (
                SECRET_KEY_CERT.to_string(),
                ByteString(
                    self.cert
                        .to_pem()
                        .context(SerializeCertificateSnafu { tpe: CertType::Leaf })?,
                ),
            ),
            (
                SECRET_KEY_KEY.to_string(),
                ByteString(
                    self.key
                        .private_key_to_pem_pkcs8()
                        .context(SerializeCertificateSnafu { tpe: CertType::Leaf })?,
                ),
            ),
            (
                SECRET_KEY_CA.to_string(),
                ByteString(
                    self.ca_cert
                        .to_pem()
                        .context(SerializeCertificateSnafu { tpe: CertType::Ca })?,
                ),
            ),
        ]
        .into())
    }
}

fn generate_key() -> Result<PKey<Private>> {
    Rsa::generate(RSA_KEY_LENGTH)
        .and_then(PKey::try_from)
        .context(GenerateKeySnafu)
}

fn subject_name(subject: &str) -> Result<X509Name, ErrorStack> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, subject)?;
    Ok(name.build())
}

/// The validity window of a certificate issued now, starting slightly in the past.
fn validity(lifetime: Duration) -> Result<(OffsetDateTime, OffsetDateTime)> {
    let now = OffsetDateTime::now_utc();
    let not_after = time::Duration::try_from(*lifetime)
        .ok()
        .and_then(|lifetime| now.checked_add(lifetime))
        .context(LifetimeTooLongSnafu { lifetime })?;
    Ok((now - Duration::from_minutes_unchecked(5), not_after))
}

/// Starts building a certificate valid for `validity`.
fn certificate_builder(
    subject_name: &X509Name,
    key: &PKey<Private>,
    (not_before, not_after): (OffsetDateTime, OffsetDateTime),
) -> Result<X509Builder, ErrorStack> {
    let mut x509 = X509Builder::new()?;
    x509.set_subject_name(subject_name)?;
    x509.set_not_before(Asn1Time::from_unix(not_before.unix_timestamp())?.as_ref())?;
    x509.set_not_after(Asn1Time::from_unix(not_after.unix_timestamp())?.as_ref())?;
    x509.set_pubkey(key)?;
    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
    x509.set_serial_number(Asn1Integer::from_bn(&serial)?.as_ref())?;
    x509.set_version(
        3 - 1, // zero-indexed
    )?;
    Ok(x509)
}

/// Generates a self-signed CA certificate with the common name `subject`.
pub fn generate_self_signed(subject: &str, lifetime: Duration) -> Result<Material> {
    let conf = Conf::new(ConfMethod::default()).context(BuildCertificateSnafu)?;
    let validity = validity(lifetime)?;
    let key = generate_key()?;
    let cert = subject_name(subject)
        .and_then(|subject_name| {
            let mut x509 = certificate_builder(&subject_name, &key, validity)?;
            x509.set_issuer_name(&subject_name)?;
            let ctx = x509.x509v3_context(None, Some(&conf));
            let exts = [
                BasicConstraints::new().critical().ca().build()?,
                SubjectKeyIdentifier::new().build(&ctx)?,
                AuthorityKeyIdentifier::new()
                    .issuer(false)
                    .keyid(false)
                    .build(&ctx)?,
                KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .key_cert_sign()
                    .crl_sign()
                    .build()?,
            ];
            for ext in exts {
                x509.append_extension(ext)?;
            }
            x509.sign(&key, MessageDigest::sha256())?;
            Ok(x509.build())
        })
        .context(BuildCertificateSnafu)?;
    Ok(Material {
        ca_cert: cert.clone(),
        cert,
        key,
    })
}

/// Generates a certificate with the common name `subject` that is valid for `hosts`, signed by `ca`.
pub fn generate_signed(
    subject: &str,
    hosts: &BTreeSet<String>,
    usage: Usage,
    lifetime: Duration,
    ca: &CertificateAuthority,
) -> Result<Material> {
    let conf = Conf::new(ConfMethod::default()).context(BuildCertificateSnafu)?;
    let validity = validity(lifetime)?;
    let key = generate_key()?;
    let cert = subject_name(subject)
        .and_then(|subject_name| {
            let mut x509 = certificate_builder(&subject_name, &key, validity)?;
            x509.set_issuer_name(ca.ca_cert.subject_name())?;
            let ctx = x509.x509v3_context(Some(&ca.ca_cert), Some(&conf));
            let mut exts = vec![
                BasicConstraints::new().critical().build()?,
                KeyUsage::new()
                    .key_encipherment()
                    .digital_signature()
                    .build()?,
                SubjectKeyIdentifier::new().build(&ctx)?,
                AuthorityKeyIdentifier::new()
                    .issuer(true)
                    .keyid(true)
                    .build(&ctx)?,
            ];
            if usage.client || usage.server {
                let mut eku = ExtendedKeyUsage::new();
                if usage.server {
                    eku.server_auth();
                }
                if usage.client {
                    eku.client_auth();
                }
                exts.push(eku.build()?);
            }
            if !hosts.is_empty() {
                let mut san_ext = SubjectAlternativeName::new();
                for host in hosts {
                    match Address::from(host.as_str()) {
                        Address::Dns(dns) => san_ext.dns(&dns),
                        Address::Ip(ip) => san_ext.ip(&ip.to_string()),
                    };
                }
                exts.push(san_ext.build(&ctx)?);
            }
            for ext in exts {
                x509.append_extension(ext)?;
            }
            x509.sign(&ca.ca_key, MessageDigest::sha256())?;
            Ok(x509.build())
        })
        .context(BuildCertificateSnafu)?;
    Ok(Material {
        cert,
        key,
        ca_cert: ca.ca_cert.clone(),
    })
}

/// Decodes a PEM-encoded certificate.
pub fn decode_certificate(pem: &[u8]) -> Result<X509> {
    X509::from_pem(pem).context(DecodeCertificateSnafu)
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, net::IpAddr};

    use openssl::{nid::Nid, x509::X509VerifyResult};
    use stackable_operator::time::Duration;

    use super::{
        decode_certificate, generate_self_signed, generate_signed, Address, CertificateAuthority,
        Error, Usage, DEFAULT_CERT_LIFETIME,
    };
    use crate::crd::{SECRET_KEY_CA, SECRET_KEY_CERT, SECRET_KEY_KEY};

    fn common_name(cert: &openssl::x509::X509Ref) -> String {
        cert.subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string()
    }

    #[test]
    fn overlong_lifetime_is_rejected() {
        let lifetime = Duration::from_days_unchecked(10_000_000);
        assert!(matches!(
            generate_self_signed("site-ca", lifetime),
            Err(Error::LifetimeTooLong { .. })
        ));
    }

    #[test]
    fn address_parsing() {
        assert_eq!(
            Address::from("10.0.0.1"),
            Address::Ip("10.0.0.1".parse::<IpAddr>().unwrap())
        );
        assert_eq!(
            Address::from("::1"),
            Address::Ip("::1".parse::<IpAddr>().unwrap())
        );
        assert_eq!(
            Address::from("router.example"),
            Address::Dns("router.example".to_string())
        );
    }

    #[test]
    fn self_signed_ca_roundtrips_through_secret_data() {
        let material = generate_self_signed("site-ca", DEFAULT_CERT_LIFETIME).unwrap();
        assert_eq!(common_name(&material.cert), "site-ca");
        assert_eq!(
            material.cert.issued(&material.cert),
            X509VerifyResult::OK,
            "CA should be self-signed"
        );

        let data = material.into_secret_data().unwrap();
        assert!(data.contains_key(SECRET_KEY_CERT));
        assert!(data.contains_key(SECRET_KEY_KEY));
        assert_eq!(data[SECRET_KEY_CERT], data[SECRET_KEY_CA]);
        CertificateAuthority::from_secret_data(&data).unwrap();
    }

    #[test]
    fn signed_certificate_covers_hosts() {
        let ca = CertificateAuthority::from_secret_data(
            &generate_self_signed("site-ca", DEFAULT_CERT_LIFETIME)
                .unwrap()
                .into_secret_data()
                .unwrap(),
        )
        .unwrap();
        let hosts = BTreeSet::from(["router.example".to_string(), "10.0.0.1".to_string()]);
        let material = generate_signed(
            "router",
            &hosts,
            Usage {
                client: true,
                server: true,
            },
            Duration::from_days_unchecked(30),
            &ca,
        )
        .unwrap();
        assert_eq!(common_name(&material.cert), "router");
        assert_eq!(ca.ca_cert.issued(&material.cert), X509VerifyResult::OK);
        assert!(material.cert.verify(&ca.ca_key).unwrap());

        let sans = material.cert.subject_alt_names().unwrap();
        assert!(sans
            .iter()
            .any(|name| name.dnsname() == Some("router.example")));
        assert!(sans
            .iter()
            .any(|name| name.ipaddress() == Some(&[10, 0, 0, 1][..])));

        let data = material.into_secret_data().unwrap();
        let ca_pem = ca.ca_cert.to_pem().unwrap();
        assert_eq!(data[SECRET_KEY_CA].0, ca_pem);
        decode_certificate(&data[SECRET_KEY_CERT].0).unwrap();
    }

    #[test]
    fn ca_from_incomplete_secret_fails() {
        let mut data = generate_self_signed("site-ca", DEFAULT_CERT_LIFETIME)
            .unwrap()
            .into_secret_data()
            .unwrap();
        data.remove(SECRET_KEY_KEY);
        assert!(CertificateAuthority::from_secret_data(&data).is_err());
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(decode_certificate(b"not a certificate").is_err());
    }
}
