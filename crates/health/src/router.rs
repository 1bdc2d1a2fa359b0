//! Probe endpoints over a [`HealthMachine`].

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

use crate::machine::HealthMachine;

pub fn probe_routes(machine: Arc<HealthMachine>) -> Router {
    Router::new()
        .route("/ambassador/v0/check_alive", get(check_alive))
        .route("/ambassador/v0/check_ready", get(check_ready))
        .with_state(machine)
}

async fn check_alive(State(m): State<Arc<HealthMachine>>) -> (StatusCode, &'static str) {
    m.fetch_envoy_ready().await;
    if m.is_alive() {
        (StatusCode::OK, "ambassador liveness check OK\n")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "ambassador seems to have died\n")
    }
}

async fn check_ready(State(m): State<Arc<HealthMachine>>) -> (StatusCode, &'static str) {
    m.fetch_envoy_ready().await;
    if m.is_ready() {
        (StatusCode::OK, "ambassador readiness check OK\n")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "ambassador not ready\n")
    }
}
