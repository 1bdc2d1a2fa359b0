use emissary_core::SelectorError;

/// Errors surfaced by the client and its backends.
#[derive(Debug, thiserror::Error)]
pub enum KatesError {
    #[error("invalid kind: {0}")]
    InvalidKind(String),
    #[error("invalid query {query}: {source}")]
    InvalidQuery { query: String, source: SelectorError },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("transient api error: {0}")]
    Transient(String),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
}

impl KatesError {
    pub fn is_not_found(&self) -> bool { matches!(self, KatesError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, KatesError::Conflict(_)) }
    pub fn is_unauthorized(&self) -> bool { matches!(self, KatesError::Unauthorized(_)) }
    pub fn is_transient(&self) -> bool { matches!(self, KatesError::Transient(_)) }

    /// Map an HTTP status from the API server onto an error kind.
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            401 | 403 => KatesError::Unauthorized(message),
            404 => KatesError::NotFound(message),
            409 => KatesError::Conflict(message),
            410 | 429 | 500 | 503 | 504 => KatesError::Transient(message),
            _ => KatesError::Api { code, message },
        }
    }
}

impl From<kube::Error> for KatesError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(resp) => KatesError::from_status(resp.code, format!("{} ({})", resp.message, resp.reason)),
            kube::Error::SerdeError(e) => KatesError::Serde(e),
            other => KatesError::Transient(other.to_string()),
        }
    }
}

impl From<kube::runtime::watcher::Error> for KatesError {
    fn from(e: kube::runtime::watcher::Error) -> Self {
        use kube::runtime::watcher::Error as W;
        match e {
            W::InitialListFailed(e) | W::WatchStartFailed(e) | W::WatchFailed(e) => e.into(),
            W::WatchError(resp) => KatesError::from_status(resp.code, resp.message),
            other => KatesError::Transient(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_classify() {
        assert!(KatesError::from_status(409, "x").is_conflict());
        assert!(KatesError::from_status(404, "x").is_not_found());
        assert!(KatesError::from_status(403, "x").is_unauthorized());
        assert!(KatesError::from_status(410, "expired").is_transient());
        assert!(matches!(KatesError::from_status(422, "x"), KatesError::Api { code: 422, .. }));
    }
}
