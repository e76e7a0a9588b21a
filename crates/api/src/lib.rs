//! HTTP gateway for the order coordination layer.
//!
//! Every business route is served by the protocol-neutral [`router::Router`]
//! through a single fallback handler; axum only adds the health and metrics
//! endpoints, tracing and CORS.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use common::ServiceKind;
use metrics_exporter_prometheus::PrometheusHandle;
use resilience::{CircuitBreakerRegistry, Executor, RateLimiter, RetryPolicy};
use router::{
    Dispatcher, InMemoryOrderService, InMemoryPaymentService, InMemoryProductService,
    InMemoryUserService, RouteTable,
};
use saga::{InMemoryEventBus, SagaConfig, SagaCoordinator};
use saga_log::SagaLog;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;

/// Coordinator over whichever saga log the process was started with.
pub type Coordinator = SagaCoordinator<Arc<dyn SagaLog>>;

/// The in-process stand-ins for the downstream services.
#[derive(Clone, Default)]
pub struct Services {
    pub users: InMemoryUserService,
    pub products: InMemoryProductService,
    pub payments: InMemoryPaymentService,
    pub orders: InMemoryOrderService,
}

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub router: router::Router,
    pub coordinator: Arc<Coordinator>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub bus: InMemoryEventBus,
    pub services: Services,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(routes::metrics::MetricsState {
            handle: metrics_handle,
            app: state.clone(),
        });

    Router::new()
        .route("/health", get(routes::health::check))
        .fallback(routes::gateway::handle)
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Wires the resilience layer, the in-memory services, the saga coordinator
/// and the router from `config`.
pub fn create_default_state(config: &Config, log: Arc<dyn SagaLog>) -> Arc<AppState> {
    let services = Services::default();
    let resilience = &config.resilience;

    let breakers = Arc::new(CircuitBreakerRegistry::new(
        resilience.circuit_breaker.clone(),
    ));
    let dispatcher = Arc::new(
        Dispatcher::new(
            Executor::new(breakers.clone()),
            RetryPolicy::from(&resilience.retry),
        )
        .register(ServiceKind::User, Arc::new(services.users.clone()))
        .register(ServiceKind::Product, Arc::new(services.products.clone()))
        .register(ServiceKind::Payment, Arc::new(services.payments.clone()))
        .register(ServiceKind::Order, Arc::new(services.orders.clone())),
    );
    let limiter = Arc::new(RateLimiter::new(resilience.rate_limit.clone()));

    let bus = InMemoryEventBus::new();
    let coordinator = Arc::new(SagaCoordinator::with_config(
        log,
        dispatcher.clone(),
        Arc::new(bus.clone()),
        SagaConfig {
            saga_timeout: config.saga_timeout,
        },
    ));

    let router = router::Router::new(
        limiter,
        Arc::new(services.users.clone()),
        dispatcher,
        RouteTable::standard(),
    )
    .with_workflow(coordinator.clone());

    Arc::new(AppState {
        router,
        coordinator,
        breakers,
        bus,
        services,
    })
}
