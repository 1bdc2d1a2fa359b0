//! Per-query accumulator state.

use emissary_core::{CompiledQuery, Delta, DeltaType, Uid};
use emissary_kubehub::{CanonicalCache, Mapping, Reconciled, WatchEvent};
use kube::core::DynamicObject;
use kube::ResourceExt;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::warn;

pub(crate) struct Field {
    pub query: CompiledQuery,
    pub mapping: Mapping,
    /// `None` marks an object deleted since the last drain.
    pub values: FxHashMap<Uid, Option<DynamicObject>>,
    pub deltas: FxHashMap<Uid, Delta>,
    pub synced: bool,
    pub first_update: bool,
}

impl Field {
    pub fn new(query: CompiledQuery, mapping: Mapping) -> Self {
        Self { query, mapping, values: FxHashMap::default(), deltas: FxHashMap::default(), synced: false, first_update: true }
    }

    pub fn name(&self) -> &str { &self.query.query.name }

    fn upsert(&mut self, uid: Uid, obj: DynamicObject) {
        let known = matches!(self.values.get(&uid), Some(Some(_)));
        let kind = match self.deltas.get(&uid).map(|d| d.delta_type) {
            // consumer has not seen the add yet
            Some(DeltaType::Add) => DeltaType::Add,
            _ if known => DeltaType::Update,
            _ => DeltaType::Add,
        };
        self.deltas.insert(uid.clone(), Delta::from_object(&obj, kind));
        self.values.insert(uid, Some(obj));
    }

    /// Returns false when the object was never reported, so no delta is due.
    fn remove(&mut self, uid: &str, obj: &DynamicObject) -> bool {
        match self.values.get_mut(uid) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                self.deltas.insert(uid.to_string(), Delta::from_object(obj, DeltaType::Delete));
                true
            }
            _ => false,
        }
    }

    /// Fold one watch event in. Returns whether anything observable changed.
    pub fn apply(&mut self, event: WatchEvent, cache: &CanonicalCache) -> bool {
        match event {
            WatchEvent::Applied(obj) => match obj.uid() {
                Some(uid) => { self.upsert(uid, obj); true }
                None => { warn!(field = %self.name(), name = %obj.name_any(), "accumulator: object without uid ignored"); false }
            },
            WatchEvent::Deleted(obj) => match obj.uid() {
                Some(uid) => { cache.forget(&uid); self.remove(&uid, &obj) }
                None => false,
            },
            WatchEvent::Restarted(list) => {
                let mut seen = FxHashSet::default();
                for obj in list {
                    if let Some(uid) = obj.uid() {
                        seen.insert(uid.clone());
                        self.upsert(uid, obj);
                    }
                }
                let vanished: Vec<(Uid, DynamicObject)> = self
                    .values
                    .iter()
                    .filter(|(uid, _)| !seen.contains(*uid))
                    .filter_map(|(uid, v)| v.as_ref().map(|o| (uid.clone(), o.clone())))
                    .collect();
                for (uid, obj) in vanished {
                    cache.forget(&uid);
                    self.remove(&uid, &obj);
                }
                true
            }
        }
    }

    /// Overlay local writes on what the watch has delivered so far.
    pub fn patch_with_canonical(&mut self, cache: &CanonicalCache) {
        let mut replaced = Vec::new();
        let mut omitted = Vec::new();
        for (uid, slot) in self.values.iter() {
            let Some(obj) = slot else { continue };
            match cache.reconcile(obj) {
                Reconciled::AsIs => {}
                Reconciled::Replace(newer) => {
                    if newer != *obj {
                        replaced.push((uid.clone(), newer));
                    }
                }
                Reconciled::Omit => omitted.push((uid.clone(), obj.clone())),
            }
        }
        for (uid, newer) in replaced {
            self.upsert(uid, newer);
        }
        for (uid, obj) in omitted {
            self.remove(&uid, &obj);
        }
        let unseen = cache.unseen_matching(&self.mapping, &self.query, |uid| self.values.contains_key(uid));
        for obj in unseen {
            if let Some(uid) = obj.uid() {
                self.upsert(uid, obj);
            }
        }
    }

    /// Drain pending deltas and forget tombstones.
    pub fn drain(&mut self) -> Vec<Delta> {
        let mut out: Vec<Delta> = self.deltas.drain().map(|(_, d)| d).collect();
        out.sort_by(|a, b| {
            a.metadata.namespace.cmp(&b.metadata.namespace).then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });
        self.values.retain(|_, v| v.is_some());
        out
    }

    /// Live objects in stable (namespace, name) order.
    pub fn objects(&self) -> Vec<&DynamicObject> {
        let mut out: Vec<&DynamicObject> = self.values.values().flatten().collect();
        out.sort_by(|a, b| a.metadata.namespace.cmp(&b.metadata.namespace).then_with(|| a.metadata.name.cmp(&b.metadata.name)));
        out
    }
}
