//! One list+watch loop per query, forwarding events to the coalescer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use emissary_core::CompiledQuery;
use emissary_kubehub::{KubeBackend, Mapping, WatchEvent};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Event tagged with the index of the field it belongs to.
pub(crate) struct Raw {
    pub field: usize,
    pub event: WatchEvent,
}

pub struct Informer {
    field: usize,
    mapping: Mapping,
    query: CompiledQuery,
    synced: Arc<AtomicBool>,
}

impl Informer {
    pub(crate) fn new(field: usize, mapping: Mapping, query: CompiledQuery) -> Self {
        Self { field, mapping, query, synced: Arc::new(AtomicBool::new(false)) }
    }

    /// True once the initial list has been handed to the coalescer.
    pub fn has_synced(&self) -> bool { self.synced.load(Ordering::Acquire) }

    pub(crate) fn synced_flag(&self) -> Arc<AtomicBool> { Arc::clone(&self.synced) }

    pub(crate) async fn run(self, watcher: Arc<dyn KubeBackend>, tx: mpsc::Sender<Raw>, cancel: CancellationToken) {
        let name = self.query.query.name.clone();
        let mut stream = watcher.watch(&self.mapping, &self.query);
        info!(query = %name, kind = %self.mapping.gvk_key(), "informer: started");
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => next,
            };
            let event = match next {
                Some(Ok(ev)) => ev,
                Some(Err(e)) => {
                    metrics::counter!("accumulator_watch_errors_total", 1u64);
                    warn!(query = %name, error = %e, "informer: watch error, retrying");
                    continue;
                }
                None => {
                    warn!(query = %name, "informer: watch stream ended");
                    break;
                }
            };
            let is_list = matches!(event, WatchEvent::Restarted(_));
            if let WatchEvent::Restarted(items) = &event {
                debug!(query = %name, count = items.len(), "informer: list");
            }
            if tx.send(Raw { field: self.field, event }).await.is_err() {
                break;
            }
            if is_list && !self.synced.swap(true, Ordering::AcqRel) {
                debug!(query = %name, "informer: synced");
            }
        }
        debug!(query = %name, "informer: stopped");
    }
}
