//! Self-signed CA generation, parsing and leaf issuance.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, RsaKeySize, SerialNumber,
};
use rustls::pki_types::CertificateDer;
use x509_parser::prelude::*;

use crate::ApiExtError;

pub const ORGANIZATION: &str = "Ambassador Labs";
pub const CA_VALIDITY_DAYS: i64 = 365;
pub const LEAF_VALIDITY_DAYS: i64 = 14;
/// Renew the CA once it is this close to expiry.
pub const CA_RENEWAL_LEEWAY_DAYS: i64 = 14;

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

/// A CA certificate and its private key, both PEM.
#[derive(Clone, PartialEq, Eq)]
pub struct CaCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl std::fmt::Debug for CaCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaCert").field("not_before", &self.not_before).field("not_after", &self.not_after).finish_non_exhaustive()
    }
}

impl CaCert {
    pub fn needs_renewal(&self, now: DateTime<Utc>) -> bool {
        self.not_after - Duration::days(CA_RENEWAL_LEEWAY_DAYS) <= now
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool { self.not_before <= now && now < self.not_after }
}

/// A freshly issued server certificate.
#[derive(Clone)]
pub struct LeafCert {
    pub cert_der: CertificateDer<'static>,
    /// PKCS#8 DER.
    pub key_der: Vec<u8>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

fn to_offset(t: DateTime<Utc>) -> Result<::time::OffsetDateTime, ApiExtError> {
    ::time::OffsetDateTime::from_unix_timestamp(t.timestamp()).map_err(|e| ApiExtError::CertGeneration(e.to_string()))
}

fn from_timestamp(secs: i64) -> Result<DateTime<Utc>, ApiExtError> {
    DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| ApiExtError::CertParse(format!("timestamp {secs} out of range")))
}

/// Truncated to whole seconds, as certificates store them.
fn whole_seconds(t: DateTime<Utc>) -> Result<DateTime<Utc>, ApiExtError> { from_timestamp(t.timestamp()) }

/// 128 random bits, positive.
fn serial_number() -> SerialNumber {
    let mut bytes = uuid::Uuid::new_v4().into_bytes().to_vec();
    bytes[0] &= 0x7f;
    SerialNumber::from(bytes)
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, DnValue::Utf8String(ORGANIZATION.to_string()));
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn
}

fn generate_key(size: RsaKeySize) -> Result<KeyPair, ApiExtError> {
    Ok(KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, size)?)
}

/// Self-signed CA valid from `now` for a year. RSA keygen is slow at 4096
/// bits; call from a blocking context.
pub fn generate_ca(now: DateTime<Utc>, size: RsaKeySize) -> Result<CaCert, ApiExtError> {
    let not_before = whole_seconds(now)?;
    let not_after = not_before + Duration::days(CA_VALIDITY_DAYS);

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name("Emissary-ingress apiext CA");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyCertSign];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth];
    params.not_before = to_offset(not_before)?;
    params.not_after = to_offset(not_after)?;
    params.serial_number = Some(serial_number());

    let key = generate_key(size)?;
    let cert = params.self_signed(&key)?;
    Ok(CaCert { cert_pem: cert.pem(), key_pem: key.serialize_pem(), not_before, not_after })
}

/// Parse a stored CA. Fails unless the pair is usable at `now`.
pub fn parse_ca(cert_pem: &str, key_pem: &str, now: DateTime<Utc>) -> Result<CaCert, ApiExtError> {
    let block = ::pem::parse(cert_pem.as_bytes()).map_err(|e| ApiExtError::CertParse(e.to_string()))?;
    if block.tag() != "CERTIFICATE" {
        return Err(ApiExtError::CertParse(format!("unexpected PEM block {:?}", block.tag())));
    }
    let (_, cert) = X509Certificate::from_der(block.contents()).map_err(|e| ApiExtError::CertParse(e.to_string()))?;
    if !cert.is_ca() {
        return Err(ApiExtError::CertParse("certificate is not a CA".to_string()));
    }
    KeyPair::from_pem(key_pem).map_err(|e| ApiExtError::CertParse(format!("private key: {e}")))?;

    let not_before = from_timestamp(cert.validity().not_before.timestamp())?;
    let not_after = from_timestamp(cert.validity().not_after.timestamp())?;
    if now >= not_after {
        return Err(ApiExtError::CertExpired { not_after });
    }
    if now < not_before {
        return Err(ApiExtError::CertParse(format!("certificate not valid before {not_before}")));
    }
    Ok(CaCert { cert_pem: cert_pem.to_string(), key_pem: key_pem.to_string(), not_before, not_after })
}

/// Server certificate for `server_name`, signed by `ca`.
pub fn issue_leaf(ca: &CaCert, server_name: &str, now: DateTime<Utc>, size: RsaKeySize) -> Result<LeafCert, ApiExtError> {
    let not_before = whole_seconds(now)?;
    let not_after = not_before + Duration::days(LEAF_VALIDITY_DAYS);

    let mut params = CertificateParams::new(vec![server_name.to_string()])?;
    params.distinguished_name = distinguished_name(server_name);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.not_before = to_offset(not_before)?;
    params.not_after = to_offset(not_after)?;
    params.serial_number = Some(serial_number());

    let ca_key = KeyPair::from_pem(&ca.key_pem).map_err(|e| ApiExtError::CertParse(format!("CA key: {e}")))?;
    let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, &ca_key)?;
    let key = generate_key(size)?;
    let cert = params.signed_by(&key, &issuer)?;
    Ok(LeafCert { cert_der: cert.der().clone(), key_der: key.serialize_der(), not_before, not_after })
}

/// `kubernetes.io/tls` Secret carrying the CA.
pub fn ca_secret(ca: &CaCert, namespace: &str, name: &str) -> Secret {
    Secret {
        metadata: ObjectMeta { name: Some(name.to_string()), namespace: Some(namespace.to_string()), ..Default::default() },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(secret_data(ca)),
        ..Default::default()
    }
}

pub fn secret_data(ca: &CaCert) -> BTreeMap<String, ByteString> {
    BTreeMap::from([
        (TLS_CERT_KEY.to_string(), ByteString(ca.cert_pem.clone().into_bytes())),
        (TLS_PRIVATE_KEY_KEY.to_string(), ByteString(ca.key_pem.clone().into_bytes())),
    ])
}

/// Read the CA back out of its Secret.
pub fn parse_ca_secret(secret: &Secret, now: DateTime<Utc>) -> Result<CaCert, ApiExtError> {
    let data = secret.data.as_ref().ok_or_else(|| ApiExtError::CertParse("secret has no data".to_string()))?;
    let field = |k: &str| -> Result<String, ApiExtError> {
        let bytes = data.get(k).ok_or_else(|| ApiExtError::CertParse(format!("secret has no {k}")))?;
        String::from_utf8(bytes.0.clone()).map_err(|e| ApiExtError::CertParse(format!("{k}: {e}")))
    };
    parse_ca(&field(TLS_CERT_KEY)?, &field(TLS_PRIVATE_KEY_KEY)?, now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> { DateTime::<Utc>::from_timestamp(1_760_000_000, 0).unwrap() }

    #[test]
    fn generated_ca_is_valid_now_and_for_a_year() {
        let ca = generate_ca(now(), RsaKeySize::_2048).unwrap();
        assert!(ca.is_valid_at(now()));
        assert_eq!(ca.not_after - ca.not_before, Duration::days(365));
        assert!(!ca.needs_renewal(now()));
        assert!(ca.needs_renewal(now() + Duration::days(351)));

        let parsed = parse_ca(&ca.cert_pem, &ca.key_pem, now()).unwrap();
        assert_eq!(parsed, ca);

        let der = ::pem::parse(ca.cert_pem.as_bytes()).unwrap();
        let (_, cert) = X509Certificate::from_der(der.contents()).unwrap();
        assert!(cert.is_ca());
        let org: Vec<&str> = cert.subject().iter_organization().filter_map(|o| o.as_str().ok()).collect();
        assert_eq!(org, vec![ORGANIZATION]);
        let ku = cert.key_usage().unwrap().unwrap().value;
        assert!(ku.digital_signature() && ku.key_cert_sign());
        let eku = cert.extended_key_usage().unwrap().unwrap().value;
        assert!(eku.server_auth && eku.client_auth);
    }

    #[test]
    fn parse_rejects_garbage_and_expired() {
        assert!(matches!(parse_ca("nope", "nope", now()), Err(ApiExtError::CertParse(_))));
        let ca = generate_ca(now(), RsaKeySize::_2048).unwrap();
        assert!(matches!(parse_ca(&ca.cert_pem, "nope", now()), Err(ApiExtError::CertParse(_))));
        let later = now() + Duration::days(366);
        assert!(matches!(parse_ca(&ca.cert_pem, &ca.key_pem, later), Err(ApiExtError::CertExpired { .. })));
    }

    #[test]
    fn leaf_carries_sni_and_chains_to_ca() {
        let ca = generate_ca(now(), RsaKeySize::_2048).unwrap();
        let leaf = issue_leaf(&ca, "emissary-apiext.emissary-system.svc", now(), RsaKeySize::_2048).unwrap();
        assert_eq!(leaf.not_after - leaf.not_before, Duration::days(14));

        let (_, cert) = X509Certificate::from_der(leaf.cert_der.as_ref()).unwrap();
        assert!(!cert.is_ca());
        let san = cert.subject_alternative_name().unwrap().unwrap().value;
        assert!(san.general_names.iter().any(|n| matches!(n, GeneralName::DNSName("emissary-apiext.emissary-system.svc"))));
        let eku = cert.extended_key_usage().unwrap().unwrap().value;
        assert!(eku.server_auth);

        let ca_der = ::pem::parse(ca.cert_pem.as_bytes()).unwrap();
        let (_, ca_cert) = X509Certificate::from_der(ca_der.contents()).unwrap();
        assert_eq!(cert.issuer(), ca_cert.subject());
        cert.verify_signature(Some(ca_cert.public_key())).unwrap();
    }

    #[test]
    fn secret_round_trip() {
        let ca = generate_ca(now(), RsaKeySize::_2048).unwrap();
        let secret = ca_secret(&ca, "emissary-system", "emissary-ingress-webhook-ca");
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/tls"));
        assert_eq!(parse_ca_secret(&secret, now()).unwrap(), ca);
        assert!(parse_ca_secret(&Secret::default(), now()).is_err());
    }
}
