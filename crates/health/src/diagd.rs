//! Config daemon sub-machine: alive while snapshots get processed, or
//! while still inside the grace window.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use emissary_core::clock::Clock;

pub const BOOT_GRACE_SECS: i64 = 600;

fn boot_grace() -> Duration { Duration::seconds(BOOT_GRACE_SECS) }

#[derive(Debug)]
struct State {
    grace_end: DateTime<Utc>,
    last_sent: Option<DateTime<Utc>>,
    last_processed: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct DiagdMachine {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl DiagdMachine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let grace_end = clock.now() + boot_grace();
        Self { clock, state: Mutex::new(State { grace_end, last_sent: None, last_processed: None }) }
    }

    fn lock(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(|p| p.into_inner()) }

    pub fn note_snapshot_sent(&self) {
        let now = self.clock.now();
        let mut st = self.lock();
        // only a process that has processed something earns a fresh window
        if st.last_processed.is_some() {
            st.grace_end = now + boot_grace();
        }
        st.last_sent = Some(now);
    }

    pub fn note_snapshot_processed(&self) { self.lock().last_processed = Some(self.clock.now()); }

    /// Whether at least one snapshot was processed.
    pub fn has_processed(&self) -> bool { self.lock().last_processed.is_some() }

    pub fn is_alive(&self) -> bool {
        let now = self.clock.now();
        let st = self.lock();
        caught_up(&st) || now < st.grace_end
    }

    pub fn is_ready(&self) -> bool {
        let now = self.clock.now();
        let st = self.lock();
        let in_flight = match (st.last_sent, st.last_processed) {
            (Some(_), None) => true,
            (Some(sent), Some(done)) => sent > done,
            _ => false,
        };
        caught_up(&st) || (in_flight && now < st.grace_end)
    }
}

fn caught_up(st: &State) -> bool {
    matches!((st.last_sent, st.last_processed), (Some(sent), Some(done)) if sent <= done)
}
