//! The Accumulator: N queries in, one coalesced notification channel out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use emissary_core::{Delta, Query};
use emissary_kubehub::{Client, KatesError};
use kube::core::DynamicObject;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::field::Field;
use crate::informer::{Informer, Raw};

#[derive(Debug, thiserror::Error)]
pub enum AccumulatorError {
    #[error(transparent)]
    Kube(#[from] KatesError),
    #[error("duplicate query name {0:?}")]
    DuplicateQuery(String),
    #[error("decoding snapshot target: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct AccumulatorConfig {
    /// After a notification, hold further ones back for this long.
    pub max_interval: Option<Duration>,
    /// Capacity of the informer -> coalescer channel.
    pub raw_capacity: usize,
}

impl Default for AccumulatorConfig {
    fn default() -> Self { Self { max_interval: None, raw_capacity: 64 } }
}

impl AccumulatorConfig {
    /// Defaults overridden by `EMISSARY_MAX_ACCUMULATOR_INTERVAL_MS`.
    pub fn from_env() -> Self {
        let max_interval = std::env::var("EMISSARY_MAX_ACCUMULATOR_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        Self { max_interval, ..Self::default() }
    }
}

struct State {
    fields: Vec<Field>,
    synced: usize,
}

struct Shared {
    client: Client,
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(|p| p.into_inner()) }

    /// Returns (something changed, every field synced).
    fn apply(&self, raw: Raw) -> (bool, bool) {
        let mut guard = self.lock();
        let st = &mut *guard;
        let total = st.fields.len();
        let Some(field) = st.fields.get_mut(raw.field) else { return (false, false) };
        let first_list = !field.synced && matches!(raw.event, emissary_kubehub::WatchEvent::Restarted(_));
        let changed = field.apply(raw.event, self.client.canonical());
        if first_list {
            field.synced = true;
            debug!(field = %field.name(), "accumulator: field synced");
            st.synced += 1;
        }
        (changed || first_list, st.synced == total)
    }
}

pub struct Accumulator {
    shared: Arc<Shared>,
    changed: mpsc::Receiver<()>,
    synced: Vec<Arc<AtomicBool>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Accumulator {
    /// Start list+watch for every query. Unknown kinds and malformed
    /// selectors fail here, before anything is spawned.
    pub async fn watch(client: &Client, queries: Vec<Query>, cancel: &CancellationToken) -> Result<Self, AccumulatorError> {
        Self::watch_with(client, queries, cancel, AccumulatorConfig::default()).await
    }

    pub async fn watch_with(
        client: &Client,
        queries: Vec<Query>,
        cancel: &CancellationToken,
        cfg: AccumulatorConfig,
    ) -> Result<Self, AccumulatorError> {
        let mut fields = Vec::with_capacity(queries.len());
        for q in queries {
            if fields.iter().any(|f: &Field| f.name() == q.name) {
                return Err(AccumulatorError::DuplicateQuery(q.name));
            }
            let compiled = q
                .compile()
                .map_err(|source| KatesError::InvalidQuery { query: q.name.clone(), source })?;
            let mapping = client.mapping_for(&q.kind).await?;
            fields.push(Field::new(compiled, mapping));
        }

        let cancel = cancel.child_token();
        let (raw_tx, raw_rx) = mpsc::channel::<Raw>(cfg.raw_capacity.max(1));
        let (changed_tx, changed_rx) = mpsc::channel::<()>(1);
        let informers: Vec<Informer> = fields
            .iter()
            .enumerate()
            .map(|(i, f)| Informer::new(i, f.mapping.clone(), f.query.clone()))
            .collect();
        let synced = informers.iter().map(|i| i.synced_flag()).collect();
        info!(queries = fields.len(), "accumulator: watching");
        let shared = Arc::new(Shared { client: client.clone(), state: Mutex::new(State { fields, synced: 0 }) });

        let mut tasks = Vec::with_capacity(informers.len() + 1);
        tasks.push(tokio::spawn(coalesce(Arc::clone(&shared), raw_rx, changed_tx, cancel.clone(), cfg.max_interval)));
        for informer in informers {
            tasks.push(tokio::spawn(informer.run(client.backend(), raw_tx.clone(), cancel.clone())));
        }
        Ok(Self { shared, changed: changed_rx, synced, cancel, tasks })
    }

    /// Receives a token whenever new data is available after bootstrap.
    pub fn changed(&mut self) -> &mut mpsc::Receiver<()> { &mut self.changed }

    /// Number of queries whose initial list has been applied.
    pub fn synced_count(&self) -> usize { self.shared.lock().synced }

    pub fn informers_synced(&self) -> bool { self.synced.iter().all(|s| s.load(Ordering::Acquire)) }

    /// Fill `target` (fields named after the queries) with the current view.
    pub fn update<T: DeserializeOwned>(&self, target: &mut T) -> Result<bool, AccumulatorError> {
        let mut discard = Vec::new();
        self.filtered_update(target, &mut discard, |_| true)
    }

    /// Like [`Accumulator::update`], appending drained deltas and hiding
    /// objects rejected by `predicate`. Hidden objects still count as changes.
    pub fn filtered_update<T, F>(&self, target: &mut T, deltas: &mut Vec<Delta>, predicate: F) -> Result<bool, AccumulatorError>
    where
        T: DeserializeOwned,
        F: Fn(&DynamicObject) -> bool,
    {
        let t0 = std::time::Instant::now();
        let mut changed = false;
        let mut out = serde_json::Map::new();
        {
            let mut st = self.shared.lock();
            let cache = self.shared.client.canonical();
            for field in st.fields.iter_mut() {
                field.patch_with_canonical(cache);
                if field.first_update || !field.deltas.is_empty() {
                    changed = true;
                }
                field.first_update = false;
                deltas.extend(field.drain());
                let items = field
                    .objects()
                    .into_iter()
                    .filter(|o| predicate(o))
                    .map(serde_json::to_value)
                    .collect::<Result<Vec<_>, _>>()?;
                out.insert(field.name().to_string(), serde_json::Value::Array(items));
            }
        }
        *target = serde_json::from_value(serde_json::Value::Object(out))?;
        metrics::histogram!("accumulator_update_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(changed)
    }

    /// Stop all background loops and wait for them.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for t in self.tasks.drain(..) {
            let _ = t.await;
        }
    }
}

impl Drop for Accumulator {
    fn drop(&mut self) { self.cancel.cancel(); }
}

/// "If there is an undelivered change, try to send it; meanwhile keep
/// draining raw updates." The capacity-1 channel is the coalescing point.
async fn coalesce(
    shared: Arc<Shared>,
    mut raw_rx: mpsc::Receiver<Raw>,
    changed_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
    max_interval: Option<Duration>,
) {
    let mut pending = true;
    let mut all_synced = shared.lock().fields.is_empty();
    let mut next_send = Instant::now();
    loop {
        let ready = pending && all_synced;
        let due = ready && Instant::now() >= next_send;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = changed_tx.reserve(), if due => match permit {
                Ok(permit) => {
                    permit.send(());
                    pending = false;
                    metrics::counter!("accumulator_notifications_total", 1u64);
                    if let Some(iv) = max_interval {
                        next_send = Instant::now() + iv;
                    }
                }
                Err(_) => break,
            },
            _ = tokio::time::sleep_until(next_send), if ready && !due => {}
            raw = raw_rx.recv() => match raw {
                Some(raw) => {
                    metrics::counter!("accumulator_raw_updates_total", 1u64);
                    let (changed, synced) = shared.apply(raw);
                    pending |= changed;
                    all_synced = synced;
                }
                None => break,
            },
        }
    }
    debug!("accumulator: coalescer stopped");
}
