//! Emissary health: two-stage liveness and readiness for the config daemon
//! and the envoy it feeds.

#![forbid(unsafe_code)]

pub mod diagd;
pub mod envoy;
mod machine;
mod router;

pub use envoy::{parse_ready_port, ready_port, EnvoyMachine, EnvoyProbe, HttpEnvoyProbe, DEFAULT_READY_PORT};
pub use machine::{EnvoyState, HealthMachine, ENVOY_START_GRACE_SECS};
pub use router::probe_routes;
