//! Canonical cache: the latest locally-written version of every object,
//! used to mask watch lag on reads.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use emissary_core::{resource_version_gteq, CompiledQuery, Uid};
use kube::core::DynamicObject;
use kube::ResourceExt;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::Mapping;

static GLOBAL: Lazy<Arc<CanonicalCache>> = Lazy::new(|| Arc::new(CanonicalCache::default()));

/// Entry value: `Some(obj)` after create/update, `None` after a local delete.
pub type CanonicalEntry = Option<DynamicObject>;

/// How a watch-delivered object should be presented after consulting the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// No opinion; use the delivered object.
    AsIs,
    /// The cache is ahead of the watch; present this object instead.
    Replace(DynamicObject),
    /// Locally deleted; hide it.
    Omit,
}

/// Entries older than this are dropped on the next write. Writes to kinds no
/// watch delivers are never reconciled away, so age is what bounds them.
pub const CANONICAL_MAX_AGE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
struct Slot {
    entry: CanonicalEntry,
    written: Instant,
}

impl Slot {
    fn new(entry: CanonicalEntry) -> Self { Self { entry, written: Instant::now() } }
}

#[derive(Debug)]
pub struct CanonicalCache {
    entries: Mutex<FxHashMap<Uid, Slot>>,
    max_age: Duration,
}

impl Default for CanonicalCache {
    fn default() -> Self { Self::with_max_age(CANONICAL_MAX_AGE) }
}

impl CanonicalCache {
    /// Process-wide instance shared by clients built with [`crate::Client::new`].
    pub fn global() -> Arc<Self> { Arc::clone(&GLOBAL) }

    pub fn with_max_age(max_age: Duration) -> Self { Self { entries: Mutex::default(), max_age } }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<Uid, Slot>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn evict_expired(&self, entries: &mut FxHashMap<Uid, Slot>, now: Instant) -> usize {
        let before = entries.len();
        entries.retain(|_, slot| now.saturating_duration_since(slot.written) <= self.max_age);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = entries.len(), "canonical: expired entries dropped");
        }
        evicted
    }

    /// Drop entries written more than `max_age` before `now`; returns how many went.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        self.evict_expired(&mut entries, now)
    }

    pub fn len(&self) -> usize { self.lock().len() }
    pub fn is_empty(&self) -> bool { self.lock().is_empty() }
    pub fn get(&self, uid: &str) -> Option<CanonicalEntry> { self.lock().get(uid).map(|s| s.entry.clone()) }
    pub fn forget(&self, uid: &str) { self.lock().remove(uid); }

    /// Record the server's post-write object. Older versions never replace newer ones.
    pub fn record_write(&self, obj: &DynamicObject) {
        let Some(uid) = obj.uid() else { return };
        let incoming = obj.resource_version().unwrap_or_default();
        let mut entries = self.lock();
        self.evict_expired(&mut entries, Instant::now());
        if let Some(Slot { entry: Some(existing), .. }) = entries.get(&uid) {
            let current = existing.resource_version().unwrap_or_default();
            if resource_version_gteq(&current, &incoming) == Some(true) && current != incoming {
                debug!(uid = %uid, current = %current, incoming = %incoming, "canonical: ignoring stale write");
                return;
            }
        }
        entries.insert(uid, Slot::new(Some(obj.clone())));
    }

    pub fn record_delete(&self, uid: &str) {
        let mut entries = self.lock();
        self.evict_expired(&mut entries, Instant::now());
        entries.insert(uid.to_string(), Slot::new(None));
    }

    /// Decide what to present for a delivered object. Entries are dropped
    /// once the watch has caught up with them.
    pub fn reconcile(&self, delivered: &DynamicObject) -> Reconciled {
        let Some(uid) = delivered.uid() else { return Reconciled::AsIs };
        let mut entries = self.lock();
        let cached = match entries.get(&uid).map(|s| &s.entry) {
            None => return Reconciled::AsIs,
            Some(None) => return Reconciled::Omit,
            Some(Some(obj)) => obj,
        };
        let cached_rv = cached.resource_version().unwrap_or_default();
        let delivered_rv = delivered.resource_version().unwrap_or_default();
        match resource_version_gteq(&cached_rv, &delivered_rv) {
            Some(true) if cached_rv != delivered_rv => Reconciled::Replace(cached.clone()),
            // caught up, or opaque versions: trust the delivery
            _ => {
                entries.remove(&uid);
                Reconciled::AsIs
            }
        }
    }

    /// Cached objects of the given kind that satisfy `query` and are not in `present`.
    pub fn unseen_matching(&self, mapping: &Mapping, query: &CompiledQuery, present: impl Fn(&str) -> bool) -> Vec<DynamicObject> {
        let api_version = mapping.api_version();
        self.lock()
            .iter()
            .filter_map(|(uid, slot)| slot.entry.as_ref().map(|o| (uid, o)))
            .filter(|(uid, _)| !present(uid))
            .filter(|(_, o)| o.types.as_ref().map(|t| t.kind == mapping.kind && t.api_version == api_version).unwrap_or(false))
            .filter(|(_, o)| query.matches(o))
            .map(|(_, o)| o.clone())
            .collect()
    }
}
