//! In-memory CA plus per-SNI leaf certificate cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use emissary_core::Clock;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::ca::{self, CaCert, LeafCert};
use crate::config::key_size_for;
use crate::ApiExtError;

struct CachedLeaf {
    ca: Arc<CaCert>,
    key: Arc<CertifiedKey>,
    issued: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl CachedLeaf {
    /// Fresh while younger than two thirds of its validity.
    fn fresh_at(&self, now: DateTime<Utc>) -> bool { (now - self.issued) * 3 < (self.not_after - self.issued) * 2 }
}

pub struct CertAuthority {
    clock: Arc<dyn Clock>,
    rsa_bits: u32,
    ca: watch::Sender<Option<Arc<CaCert>>>,
    leaves: Mutex<HashMap<String, CachedLeaf>>,
}

impl CertAuthority {
    pub fn new(clock: Arc<dyn Clock>, rsa_bits: u32) -> Self {
        let (ca, _) = watch::channel(None);
        Self { clock, rsa_bits, ca, leaves: Mutex::new(HashMap::new()) }
    }

    fn leaves(&self) -> MutexGuard<'_, HashMap<String, CachedLeaf>> { self.leaves.lock().unwrap_or_else(|p| p.into_inner()) }

    pub fn current(&self) -> Option<Arc<CaCert>> { self.ca.borrow().clone() }

    pub fn is_ready(&self) -> bool { self.ca.borrow().is_some() }

    /// Notified whenever the installed CA changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<CaCert>>> { self.ca.subscribe() }

    /// Install (or clear) the CA. Returns whether it changed; a change
    /// drops every cached leaf.
    pub fn set_ca(&self, next: Option<CaCert>) -> bool {
        if self.ca.borrow().as_deref() == next.as_ref() {
            return false;
        }
        self.leaves().clear();
        info!(present = next.is_some(), "apiext: CA changed");
        self.ca.send_replace(next.map(Arc::new));
        true
    }

    /// Certificate to present for `server_name`, issuing one when the cache
    /// has nothing fresh.
    pub async fn get_certificate(&self, server_name: Option<&str>) -> Result<Arc<CertifiedKey>, ApiExtError> {
        let name = server_name.filter(|n| !n.is_empty()).ok_or(ApiExtError::InvalidClientHello)?;
        let ca = self.current().ok_or(ApiExtError::NoCa)?;
        let now = self.clock.now();
        if let Some(leaf) = self.leaves().get(name) {
            if Arc::ptr_eq(&leaf.ca, &ca) && leaf.fresh_at(now) {
                return Ok(Arc::clone(&leaf.key));
            }
        }

        let bits = self.rsa_bits;
        let (issuer, sni) = (Arc::clone(&ca), name.to_string());
        let leaf = tokio::task::spawn_blocking(move || ca::issue_leaf(&issuer, &sni, now, key_size_for(bits)))
            .await
            .map_err(|e| ApiExtError::CertGeneration(e.to_string()))??;
        let key = Arc::new(certified_key(&leaf)?);
        metrics::counter!("apiext_leaf_issued_total", 1u64);
        debug!(server_name = %name, not_after = %leaf.not_after, "apiext: issued leaf certificate");

        // a CA swap during issuance would leave this leaf orphaned
        if self.current().is_some_and(|cur| Arc::ptr_eq(&cur, &ca)) {
            self.leaves().insert(
                name.to_string(),
                CachedLeaf { ca, key: Arc::clone(&key), issued: leaf.not_before, not_after: leaf.not_after },
            );
        }
        Ok(key)
    }

    pub fn cached_leaves(&self) -> usize { self.leaves().len() }
}

fn certified_key(leaf: &LeafCert) -> Result<CertifiedKey, ApiExtError> {
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf.key_der.clone()));
    let signer = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|e| ApiExtError::CertGeneration(e.to_string()))?;
    Ok(CertifiedKey::new(vec![leaf.cert_der.clone()], signer))
}
