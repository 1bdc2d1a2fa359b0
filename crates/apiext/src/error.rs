use chrono::{DateTime, Utc};
use emissary_kubehub::KatesError;

#[derive(Debug, thiserror::Error)]
pub enum ApiExtError {
    #[error("parsing certificate: {0}")]
    CertParse(String),
    #[error("certificate expired at {not_after}")]
    CertExpired { not_after: DateTime<Utc> },
    #[error("client hello carries no server name")]
    InvalidClientHello,
    #[error("no certificate authority loaded")]
    NoCa,
    #[error("generating certificate: {0}")]
    CertGeneration(String),
    #[error(transparent)]
    Kube(#[from] KatesError),
}

impl From<rcgen::Error> for ApiExtError {
    fn from(e: rcgen::Error) -> Self { ApiExtError::CertGeneration(e.to_string()) }
}

impl ApiExtError {
    pub fn is_unauthorized(&self) -> bool { matches!(self, ApiExtError::Kube(e) if e.is_unauthorized()) }
    pub fn is_conflict(&self) -> bool { matches!(self, ApiExtError::Kube(e) if e.is_conflict()) }
}
