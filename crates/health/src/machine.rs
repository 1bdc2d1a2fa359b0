//! The composite machine: diagd gates everything, envoy is expected only
//! after the first snapshot was processed.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use emissary_core::clock::{Clock, SystemClock};
use tracing::info;

use crate::diagd::DiagdMachine;
use crate::envoy::{EnvoyMachine, EnvoyProbe, HttpEnvoyProbe, READY_CHECK_TIMEOUT};

pub const ENVOY_START_GRACE_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EnvoyState {
    NotStarted,
    Starting,
    Running,
}

#[derive(Debug)]
struct Phase {
    state: EnvoyState,
    grace_end: Option<DateTime<Utc>>,
}

pub struct HealthMachine {
    clock: Arc<dyn Clock>,
    diagd: DiagdMachine,
    envoy: EnvoyMachine,
    probe: Arc<dyn EnvoyProbe>,
    phase: Mutex<Phase>,
}

impl std::fmt::Debug for HealthMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMachine").field("state", &self.state()).finish_non_exhaustive()
    }
}

impl HealthMachine {
    pub fn new(clock: Arc<dyn Clock>, probe: Arc<dyn EnvoyProbe>) -> Self {
        Self {
            diagd: DiagdMachine::new(Arc::clone(&clock)),
            clock,
            envoy: EnvoyMachine::default(),
            probe,
            phase: Mutex::new(Phase { state: EnvoyState::NotStarted, grace_end: None }),
        }
    }

    /// System clock, envoy checked on `AMBASSADOR_READY_PORT`.
    pub fn from_env() -> Self { Self::new(Arc::new(SystemClock), Arc::new(HttpEnvoyProbe::from_env())) }

    fn lock(&self) -> MutexGuard<'_, Phase> { self.phase.lock().unwrap_or_else(|p| p.into_inner()) }

    pub fn state(&self) -> EnvoyState { self.lock().state }

    fn advance(&self, phase: &mut Phase, to: EnvoyState) {
        if to > phase.state {
            info!(from = ?phase.state, to = ?to, "health: envoy state");
            phase.state = to;
        }
    }

    pub fn note_snapshot_sent(&self) { self.diagd.note_snapshot_sent(); }

    pub fn note_snapshot_processed(&self) {
        self.diagd.note_snapshot_processed();
        let mut phase = self.lock();
        if phase.state == EnvoyState::NotStarted {
            phase.grace_end = Some(self.clock.now() + Duration::seconds(ENVOY_START_GRACE_SECS));
            self.advance(&mut phase, EnvoyState::Starting);
        }
    }

    /// Run one envoy ready check (hard 2 s timeout) and record the result.
    pub async fn fetch_envoy_ready(&self) -> bool {
        let ready = tokio::time::timeout(READY_CHECK_TIMEOUT, self.probe.ready()).await.unwrap_or(false);
        metrics::counter!("health_envoy_ready_checks_total", 1u64, "ready" => if ready { "true" } else { "false" });
        self.envoy.set_ready(ready);
        if ready {
            let mut phase = self.lock();
            if phase.state == EnvoyState::Starting {
                self.advance(&mut phase, EnvoyState::Running);
            }
        }
        ready
    }

    pub fn is_alive(&self) -> bool {
        if !self.diagd.is_alive() {
            return false;
        }
        let mut phase = self.lock();
        match phase.state {
            EnvoyState::NotStarted => true,
            EnvoyState::Starting => {
                if self.envoy.is_ready() {
                    self.advance(&mut phase, EnvoyState::Running);
                    true
                } else {
                    phase.grace_end.is_some_and(|end| self.clock.now() < end)
                }
            }
            EnvoyState::Running => self.envoy.is_alive(),
        }
    }

    pub fn is_ready(&self) -> bool { self.diagd.is_ready() && self.envoy.is_ready() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envoy::MockEnvoyProbe;
    use emissary_core::clock::ManualClock;
    use std::time::Duration as StdDuration;

    fn machine(ready: bool) -> (ManualClock, HealthMachine) {
        let clock = ManualClock::new(Utc::now());
        let mut probe = MockEnvoyProbe::new();
        probe.expect_ready().returning(move || ready);
        (clock.clone(), HealthMachine::new(Arc::new(clock), Arc::new(probe)))
    }

    fn secs(n: u64) -> StdDuration { StdDuration::from_secs(n) }

    #[tokio::test]
    async fn happy_path_is_alive_and_ready() {
        let (clock, m) = machine(true);
        clock.advance(secs(20));
        m.note_snapshot_sent();
        clock.advance(secs(10));
        m.note_snapshot_processed();
        assert_eq!(m.state(), EnvoyState::Starting);
        clock.advance(secs(10));
        assert!(m.fetch_envoy_ready().await);
        assert!(m.is_alive());
        assert!(m.is_ready());
        assert_eq!(m.state(), EnvoyState::Running);
        clock.advance(secs(10));
        assert!(m.is_alive());
        assert!(m.is_ready());
    }

    #[tokio::test]
    async fn boot_grace_expires_without_snapshots() {
        let (clock, m) = machine(false);
        clock.advance(secs(599));
        assert!(m.is_alive());
        assert!(!m.is_ready());
        clock.advance(secs(1));
        assert!(!m.is_alive());
        assert!(!m.is_ready());
    }

    #[tokio::test]
    async fn envoy_start_grace_expires_without_ready() {
        let (clock, m) = machine(false);
        m.note_snapshot_sent();
        m.note_snapshot_processed();
        assert!(!m.fetch_envoy_ready().await);
        clock.advance(secs(29));
        assert!(m.is_alive());
        clock.advance(secs(1));
        assert!(!m.is_alive());
        assert_eq!(m.state(), EnvoyState::Starting);
    }

    #[tokio::test]
    async fn running_envoy_that_stops_being_ready_is_not_alive() {
        let clock = ManualClock::new(Utc::now());
        let mut probe = MockEnvoyProbe::new();
        let mut seq = mockall::Sequence::new();
        probe.expect_ready().times(1).in_sequence(&mut seq).returning(|| true);
        probe.expect_ready().times(1).in_sequence(&mut seq).returning(|| false);
        let m = HealthMachine::new(Arc::new(clock), Arc::new(probe));
        m.note_snapshot_sent();
        m.note_snapshot_processed();
        m.fetch_envoy_ready().await;
        assert_eq!(m.state(), EnvoyState::Running);
        m.fetch_envoy_ready().await;
        assert!(!m.is_alive());
        // no way back
        assert_eq!(m.state(), EnvoyState::Running);
    }

    #[tokio::test]
    async fn any_interleaving_ends_alive_and_ready() {
        let orders: [[u8; 3]; 6] = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for order in orders {
            let (clock, m) = machine(true);
            let mut last = m.state();
            for step in order {
                clock.advance(secs(1));
                match step {
                    0 => m.note_snapshot_sent(),
                    1 => m.note_snapshot_processed(),
                    _ => {
                        m.fetch_envoy_ready().await;
                    }
                }
                assert!(m.state() >= last);
                last = m.state();
            }
            assert!(m.is_alive(), "order {:?}", order);
            assert!(m.is_ready(), "order {:?}", order);
        }
    }
}
