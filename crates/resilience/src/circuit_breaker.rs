//! Per-dependency circuit breakers.
//!
//! State transitions:
//! ```text
//! Closed ──(failures in window >= threshold)──► Open
//! Open ──(reset_timeout elapsed, checked on next call)──► HalfOpen
//! HalfOpen ──(trial succeeds)──► Closed
//! HalfOpen ──(trial fails)──► Open
//! ```
//!
//! There is no background timer. `Open -> HalfOpen` happens lazily inside
//! [`CircuitBreakerRegistry::before_call`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::error::CircuitOpenError;

const TRANSITION_CHANNEL_CAPACITY: usize = 256;

/// The state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CircuitState {
    /// Calls pass through, failures are counted.
    Closed,
    /// Calls are rejected without reaching the dependency.
    Open,
    /// A single trial call is allowed to test the dependency.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Health verdict for one call, as seen by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
}

/// Emitted on every state change, for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitTransition {
    pub dependency: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Health record of one downstream dependency.
#[derive(Debug)]
pub struct DependencyCircuit {
    state: CircuitState,
    failures: u32,
    successes: u32,
    window_started: Instant,
    last_transition: Instant,
    trial_started: Option<Instant>,
    config: CircuitBreakerConfig,
}

type Change = Option<(CircuitState, CircuitState)>;

impl DependencyCircuit {
    fn new(config: CircuitBreakerConfig, now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            window_started: now,
            last_transition: now,
            trial_started: None,
            config,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn successes(&self) -> u32 {
        self.successes
    }

    /// Instant of the last state change.
    pub fn last_transition(&self) -> Instant {
        self.last_transition
    }

    fn transition(&mut self, to: CircuitState, now: Instant) -> Change {
        let from = self.state;
        self.state = to;
        self.failures = 0;
        self.successes = 0;
        self.window_started = now;
        self.last_transition = now;
        self.trial_started = None;
        Some((from, to))
    }

    fn roll_window(&mut self, now: Instant) {
        if now.duration_since(self.window_started) >= self.config.window {
            self.failures = 0;
            self.successes = 0;
            self.window_started = now;
        }
    }

    fn before_call(&mut self, now: Instant) -> (Result<(), Duration>, Change) {
        match self.state {
            CircuitState::Closed => (Ok(()), None),
            CircuitState::Open => {
                let elapsed = now.duration_since(self.last_transition);
                if elapsed >= self.config.reset_timeout {
                    let change = self.transition(CircuitState::HalfOpen, now);
                    self.trial_started = Some(now);
                    (Ok(()), change)
                } else {
                    (Err(self.config.reset_timeout - elapsed), None)
                }
            }
            CircuitState::HalfOpen => match self.trial_started {
                // A trial whose outcome never arrived stops blocking after
                // one reset_timeout.
                Some(started) if now.duration_since(started) < self.config.reset_timeout => {
                    (Err(self.config.reset_timeout - now.duration_since(started)), None)
                }
                _ => {
                    self.trial_started = Some(now);
                    (Ok(()), None)
                }
            },
        }
    }

    fn record(&mut self, outcome: CallOutcome, now: Instant) -> Change {
        match (self.state, outcome) {
            (CircuitState::Closed, CallOutcome::Success) => {
                self.roll_window(now);
                self.successes += 1;
                None
            }
            (CircuitState::Closed, CallOutcome::Failure) => {
                self.roll_window(now);
                self.failures += 1;
                if self.failures >= self.config.failure_threshold {
                    self.transition(CircuitState::Open, now)
                } else {
                    None
                }
            }
            // Late outcomes of calls admitted before the circuit opened.
            (CircuitState::Open, _) => None,
            (CircuitState::HalfOpen, CallOutcome::Success) => {
                self.transition(CircuitState::Closed, now)
            }
            (CircuitState::HalfOpen, CallOutcome::Failure) => {
                self.transition(CircuitState::Open, now)
            }
        }
    }
}

/// Tracks one [`DependencyCircuit`] per dependency name.
///
/// Circuits are created lazily on first reference and live as long as the
/// registry. Each circuit sits behind its own mutex, so updates to one
/// dependency never contend with another.
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    circuits: DashMap<String, Arc<Mutex<DependencyCircuit>>>,
    transitions: broadcast::Sender<CircuitTransition>,
}

impl CircuitBreakerRegistry {
    /// Creates a registry applying `config` to every dependency.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            default_config: config,
            overrides: HashMap::new(),
            circuits: DashMap::new(),
            transitions,
        }
    }

    /// Uses a dedicated configuration for one dependency.
    pub fn with_override(mut self, dependency: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(dependency.into(), config);
        self
    }

    /// Subscribes to state-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitTransition> {
        self.transitions.subscribe()
    }

    /// Gate for an outbound call.
    ///
    /// Returns an error while the circuit is open, or while a half-open trial
    /// is already in flight.
    pub fn before_call(&self, dependency: &str) -> Result<(), CircuitOpenError> {
        let circuit = self.circuit(dependency);
        let (verdict, change) = {
            let mut circuit = circuit.lock().unwrap_or_else(PoisonError::into_inner);
            circuit.before_call(Instant::now())
        };
        self.emit(dependency, change);

        verdict.map_err(|retry_after| {
            metrics::counter!("circuit_rejections_total", "dependency" => dependency.to_string())
                .increment(1);
            CircuitOpenError {
                dependency: dependency.to_string(),
                retry_after,
            }
        })
    }

    /// Reports how a call admitted by [`before_call`](Self::before_call) went.
    pub fn record_outcome(&self, dependency: &str, outcome: CallOutcome) {
        let circuit = self.circuit(dependency);
        let change = {
            let mut circuit = circuit.lock().unwrap_or_else(PoisonError::into_inner);
            circuit.record(outcome, Instant::now())
        };
        self.emit(dependency, change);
    }

    /// Current state of a dependency's circuit.
    pub fn state(&self, dependency: &str) -> CircuitState {
        self.circuit(dependency)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state()
    }

    /// States of every circuit referenced so far, sorted by dependency name.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .circuits
            .iter()
            .map(|entry| {
                let state = entry
                    .value()
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .state();
                (entry.key().clone(), state)
            })
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    fn circuit(&self, dependency: &str) -> Arc<Mutex<DependencyCircuit>> {
        if let Some(existing) = self.circuits.get(dependency) {
            return existing.value().clone();
        }
        let config = self
            .overrides
            .get(dependency)
            .unwrap_or(&self.default_config)
            .clone();
        self.circuits
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DependencyCircuit::new(config, Instant::now()))))
            .value()
            .clone()
    }

    fn emit(&self, dependency: &str, change: Change) {
        let Some((from, to)) = change else {
            return;
        };

        match to {
            CircuitState::Open => {
                tracing::warn!(dependency, %from, %to, "circuit opened");
            }
            _ => {
                tracing::info!(dependency, %from, %to, "circuit state changed");
            }
        }
        metrics::counter!(
            "circuit_transitions_total",
            "dependency" => dependency.to_string(),
            "to" => to.as_str()
        )
        .increment(1);

        // No receivers is fine.
        let _ = self.transitions.send(CircuitTransition {
            dependency: dependency.to_string(),
            from,
            to,
        });
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEP: &str = "product-service";

    fn registry(threshold: u32) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            window: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(5),
        })
    }

    fn fail(registry: &CircuitBreakerRegistry, times: u32) {
        for _ in 0..times {
            registry.before_call(DEP).unwrap();
            registry.record_outcome(DEP, CallOutcome::Failure);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_rejects_next_call() {
        let registry = registry(3);

        fail(&registry, 2);
        assert_eq!(registry.state(DEP), CircuitState::Closed);

        fail(&registry, 1);
        assert_eq!(registry.state(DEP), CircuitState::Open);

        let err = registry.before_call(DEP).unwrap_err();
        assert_eq!(err.dependency, DEP);
        assert_eq!(err.retry_after, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_accumulate() {
        let registry = registry(3);

        fail(&registry, 2);
        tokio::time::advance(Duration::from_secs(11)).await;
        fail(&registry, 2);

        assert_eq!(registry.state(DEP), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_exactly_one_trial() {
        let registry = registry(1);
        fail(&registry, 1);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(registry.before_call(DEP).is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        registry.before_call(DEP).unwrap();
        assert_eq!(registry.state(DEP), CircuitState::HalfOpen);

        // Second caller while the trial is in flight
        assert!(registry.before_call(DEP).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_trial_closes_with_counters_reset() {
        let registry = registry(2);
        fail(&registry, 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        registry.before_call(DEP).unwrap();
        registry.record_outcome(DEP, CallOutcome::Success);

        assert_eq!(registry.state(DEP), CircuitState::Closed);
        let circuit = registry.circuit(DEP);
        let circuit = circuit.lock().unwrap();
        assert_eq!(circuit.failures(), 0);
        assert_eq!(circuit.successes(), 0);
        drop(circuit);

        // A single new failure must not reopen a threshold-2 circuit
        fail(&registry, 1);
        assert_eq!(registry.state(DEP), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_and_restarts_timer() {
        let registry = registry(1);
        fail(&registry, 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        registry.before_call(DEP).unwrap();
        registry.record_outcome(DEP, CallOutcome::Failure);
        assert_eq!(registry.state(DEP), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(3)).await;
        let err = registry.before_call(DEP).unwrap_err();
        assert_eq!(err.retry_after, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_is_replaced_after_reset_timeout() {
        let registry = registry(1);
        fail(&registry, 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        registry.before_call(DEP).unwrap();
        // Outcome never reported
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(registry.before_call(DEP).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_are_broadcast() {
        let registry = registry(1);
        let mut rx = registry.subscribe();

        fail(&registry, 1);
        tokio::time::advance(Duration::from_secs(5)).await;
        registry.before_call(DEP).unwrap();
        registry.record_outcome(DEP, CallOutcome::Success);

        let states: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|t| (t.from, t.to))
            .collect();
        assert_eq!(
            states,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependencies_are_isolated() {
        let registry = registry(1);
        fail(&registry, 1);

        assert_eq!(registry.state(DEP), CircuitState::Open);
        assert_eq!(registry.state("order-service"), CircuitState::Closed);
        assert!(registry.before_call("order-service").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_dependency_override() {
        let registry = registry(5).with_override(
            "payment-service",
            CircuitBreakerConfig {
                failure_threshold: 1,
                window: Duration::from_secs(10),
                reset_timeout: Duration::from_secs(1),
            },
        );

        registry.before_call("payment-service").unwrap();
        registry.record_outcome("payment-service", CallOutcome::Failure);
        assert_eq!(registry.state("payment-service"), CircuitState::Open);

        fail(&registry, 1);
        assert_eq!(registry.state(DEP), CircuitState::Closed);
    }

    #[test]
    fn test_snapshot_sorted_by_name() {
        let registry = CircuitBreakerRegistry::default();
        registry.before_call("user-service").unwrap();
        registry.before_call("order-service").unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(
            snapshot,
            vec![
                ("order-service".to_string(), CircuitState::Closed),
                ("user-service".to_string(), CircuitState::Closed),
            ]
        );
    }
}
