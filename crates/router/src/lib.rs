//! Request router for the order platform.
//!
//! Inbound requests pass through, in order:
//! 1. Per-client rate limiting
//! 2. Route resolution
//! 3. Authentication and role checks
//! 4. Dispatch to a downstream service through the retry executor, or to the
//!    order workflow for saga-backed routes
//!
//! Read routes may declare a [`Fallback`] that answers with a degraded body
//! when their dependency is unavailable.

pub mod auth;
pub mod dispatch;
pub mod error;
pub mod fallback;
pub mod router;
pub mod routes;
pub mod services;

pub use auth::{Access, AuthError, Authenticator, Principal, ROLE_ADMIN, ROLE_CUSTOMER};
pub use dispatch::{Dispatcher, DownstreamService, ServiceCall};
pub use error::{Result, RouteError};
pub use fallback::{Fallback, ResponseCache};
pub use router::{OrderWorkflow, Request, Response, Router};
pub use routes::{Method, RouteSpec, RouteTable, RouteTarget};
pub use services::{
    InMemoryOrderService, InMemoryPaymentService, InMemoryProductService, InMemoryUserService,
    ServiceControls,
};
