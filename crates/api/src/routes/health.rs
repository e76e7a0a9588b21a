//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use resilience::CircuitState;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub circuits: Vec<CircuitHealth>,
    pub active_sagas: usize,
}

#[derive(Serialize)]
pub struct CircuitHealth {
    pub dependency: String,
    pub state: &'static str,
}

/// GET /health: process status plus the state of every known circuit.
///
/// Open circuits report `degraded`; the process itself is still serving.
pub async fn check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let snapshot = state.breakers.snapshot();
    let status = if snapshot.iter().any(|(_, s)| *s == CircuitState::Open) {
        "degraded"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status,
        circuits: snapshot
            .into_iter()
            .map(|(dependency, circuit)| CircuitHealth {
                dependency,
                state: circuit.as_str(),
            })
            .collect(),
        active_sagas: state.coordinator.active_drivers(),
    })
}
