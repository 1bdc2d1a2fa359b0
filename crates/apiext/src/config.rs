//! Runtime knobs for the apiext plane, read from the environment.

use std::time::Duration;

use rcgen::RsaKeySize;

pub const DEFAULT_NAMESPACE: &str = "emissary-system";
pub const DEFAULT_CA_SECRET_NAME: &str = "emissary-ingress-webhook-ca";
pub const DEFAULT_SERVICE_NAME: &str = "emissary-apiext";
pub const DEFAULT_CRD_GROUP: &str = "getambassador.io";
pub const DEFAULT_LEADER_ELECTION_ID: &str = "emissary-ca-mgr-leader";
pub const DEFAULT_HTTPS_PORT: u16 = 8443;
pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_RSA_BITS: u32 = 4096;

/// Path the API server posts ConversionReviews to.
pub const CONVERT_PATH: &str = "/webhooks/crd/convert";

#[derive(Debug, Clone)]
pub struct ApiExtConfig {
    pub namespace: String,
    pub ca_secret_name: String,
    pub service_name: String,
    pub crd_group: String,
    pub https_port: u16,
    pub http_port: u16,
    pub rsa_bits: u32,
    pub leader_election_id: String,
    pub identity: String,
    /// How often the leader re-checks the CA secret.
    pub ca_check_interval: Duration,
    pub requeue_after: Duration,
    pub lease_duration: Duration,
    pub retry_period: Duration,
}

impl Default for ApiExtConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            ca_secret_name: DEFAULT_CA_SECRET_NAME.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            crd_group: DEFAULT_CRD_GROUP.to_string(),
            https_port: DEFAULT_HTTPS_PORT,
            http_port: DEFAULT_HTTP_PORT,
            rsa_bits: DEFAULT_RSA_BITS,
            leader_election_id: DEFAULT_LEADER_ELECTION_ID.to_string(),
            identity: uuid::Uuid::new_v4().to_string(),
            ca_check_interval: Duration::from_secs(10),
            requeue_after: Duration::from_secs(10),
            lease_duration: Duration::from_secs(15),
            retry_period: Duration::from_secs(5),
        }
    }
}

fn env_string(key: &str) -> Option<String> { std::env::var(key).ok().filter(|s| !s.trim().is_empty()) }

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> { env_string(key).and_then(|s| s.trim().parse().ok()) }

impl ApiExtConfig {
    /// Defaults overridden by `APIEXT_*`, `POD_NAMESPACE` and `HOSTNAME`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            namespace: env_string("APIEXT_NAMESPACE").or_else(|| env_string("POD_NAMESPACE")).unwrap_or(d.namespace),
            ca_secret_name: env_string("APIEXT_CA_SECRET_NAME").unwrap_or(d.ca_secret_name),
            service_name: env_string("APIEXT_SERVICE_NAME").unwrap_or(d.service_name),
            crd_group: env_string("APIEXT_CRD_GROUP").unwrap_or(d.crd_group),
            https_port: env_parse("APIEXT_HTTPS_PORT").unwrap_or(d.https_port),
            http_port: env_parse("APIEXT_HTTP_PORT").unwrap_or(d.http_port),
            rsa_bits: env_parse("APIEXT_RSA_BITS").unwrap_or(d.rsa_bits),
            leader_election_id: env_string("APIEXT_LEADER_ELECTION_ID").unwrap_or(d.leader_election_id),
            identity: env_string("HOSTNAME").unwrap_or(d.identity),
            ..d
        }
    }

    /// DNS name the API server dials, and the SNI it sends.
    pub fn service_dns_name(&self) -> String { format!("{}.{}.svc", self.service_name, self.namespace) }

    pub fn key_size(&self) -> RsaKeySize { key_size_for(self.rsa_bits) }
}

/// Nearest supported RSA size; anything unrecognised gets 4096.
pub fn key_size_for(bits: u32) -> RsaKeySize {
    match bits {
        2048 => RsaKeySize::_2048,
        3072 => RsaKeySize::_3072,
        _ => RsaKeySize::_4096,
    }
}
