//! Prometheus metrics endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use resilience::CircuitState;

use crate::AppState;

/// State for the metrics route.
#[derive(Clone)]
pub struct MetricsState {
    pub handle: PrometheusHandle,
    pub app: Arc<AppState>,
}

/// GET /metrics: returns Prometheus-formatted metrics.
///
/// Point-in-time gauges are refreshed just before rendering.
pub async fn get(State(state): State<MetricsState>) -> impl IntoResponse {
    for (dependency, circuit) in state.app.breakers.snapshot() {
        let level = match circuit {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        };
        metrics::gauge!("circuit_state", "dependency" => dependency).set(level);
    }
    metrics::gauge!("sagas_in_flight").set(state.app.coordinator.active_drivers() as f64);

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.handle.render(),
    )
}
