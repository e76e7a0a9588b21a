//! The request router: admission, authentication, dispatch and fallback.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::ClientId;
use resilience::RateLimiter;
use serde_json::{Value, json};

use crate::auth::{Access, Authenticator, Principal, ROLE_ADMIN};
use crate::dispatch::{Dispatcher, ServiceCall};
use crate::error::RouteError;
use crate::fallback::ResponseCache;
use crate::routes::{Method, RouteSpec, RouteTable, RouteTarget, merge_params};

const DEFAULT_CACHE_CAPACITY: usize = 1_024;

/// A protocol-neutral inbound request.
#[derive(Debug, Clone)]
pub struct Request {
    pub client_id: ClientId,
    pub method: Method,
    pub path: String,
    pub bearer_token: Option<String>,
    pub body: Value,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            client_id: ClientId::anonymous(),
            method,
            path: path.into(),
            bearer_token: None,
            body: Value::Null,
        }
    }

    pub fn client(mut self, client_id: impl Into<ClientId>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = body;
        self
    }
}

/// A protocol-neutral response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
    /// True when the body came from a fallback instead of the dependency.
    pub degraded: bool,
    pub retry_after: Option<Duration>,
}

impl Response {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            degraded: false,
            retry_after: None,
        }
    }

    /// Error response with a stable kind and a human-readable message.
    pub fn from_error(err: &RouteError) -> Self {
        let mut error = json!({
            "kind": err.kind(),
            "message": err.to_string(),
        });
        if let Some(saga) = err.saga() {
            error["saga"] = saga.clone();
        }
        Self {
            status: err.status(),
            body: json!({ "error": error }),
            degraded: false,
            retry_after: err.retry_after(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The order-placement workflow, as seen from the router.
///
/// Implemented by the saga coordinator. Kept as a trait so the router does
/// not depend on the saga crate.
#[async_trait]
pub trait OrderWorkflow: Send + Sync {
    async fn place_order(&self, principal: &Principal, body: Value) -> Result<Value, RouteError>;

    async fn cancel_order(&self, principal: &Principal, saga_id: &str) -> Result<Value, RouteError>;

    async fn saga_status(&self, principal: &Principal, saga_id: &str) -> Result<Value, RouteError>;

    async fn failed_sagas(&self) -> Result<Value, RouteError>;
}

/// Entry point for inbound requests.
///
/// Holds no per-request state; the limiter, the breakers behind the
/// dispatcher and the fallback cache are shared across requests.
pub struct Router {
    limiter: Arc<RateLimiter>,
    authenticator: Arc<dyn Authenticator>,
    dispatcher: Arc<Dispatcher>,
    routes: RouteTable,
    cache: ResponseCache,
    workflow: Option<Arc<dyn OrderWorkflow>>,
}

impl Router {
    pub fn new(
        limiter: Arc<RateLimiter>,
        authenticator: Arc<dyn Authenticator>,
        dispatcher: Arc<Dispatcher>,
        routes: RouteTable,
    ) -> Self {
        Self {
            limiter,
            authenticator,
            dispatcher,
            routes,
            cache: ResponseCache::new(DEFAULT_CACHE_CAPACITY),
            workflow: None,
        }
    }

    /// Attaches the order workflow that handles order placement routes.
    pub fn with_workflow(mut self, workflow: Arc<dyn OrderWorkflow>) -> Self {
        self.workflow = Some(workflow);
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = ResponseCache::new(capacity);
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Handles one request end to end. Never fails: errors become responses.
    #[tracing::instrument(
        skip(self, request),
        fields(method = %request.method, path = %request.path, client = %request.client_id)
    )]
    pub async fn handle(&self, request: Request) -> Response {
        metrics::counter!("router_requests_total", "method" => request.method.as_str())
            .increment(1);

        match self.route(request).await {
            Ok(response) => response,
            Err(err) => {
                if err.status() >= 500 {
                    tracing::error!(kind = err.kind(), error = %err, "request failed");
                } else {
                    tracing::info!(kind = err.kind(), error = %err, "request rejected");
                }
                metrics::counter!("router_errors_total", "kind" => err.kind()).increment(1);
                Response::from_error(&err)
            }
        }
    }

    async fn route(&self, request: Request) -> Result<Response, RouteError> {
        self.limiter.try_admit(&request.client_id)?;

        let (spec, params) = self.routes.resolve(request.method, &request.path)?;
        let principal = self
            .authorize(spec.access, request.bearer_token.as_deref())
            .await?;

        match &spec.target {
            RouteTarget::Service { service, operation } => {
                let payload = merge_params(request.body, params)?;
                let call = ServiceCall::new(*service, *operation).with_payload(payload);
                let response = self.dispatch(spec, &call, &request.path).await?;
                if let (Some(field), Some(principal)) = (spec.owner_field, &principal) {
                    ensure_owner(principal, &response.body, field)?;
                }
                Ok(response)
            }
            RouteTarget::PlaceOrder => {
                let principal = principal.ok_or(RouteError::Unauthenticated)?;
                let body = self.workflow()?.place_order(&principal, request.body).await?;
                Ok(Response::new(spec.success_status, body))
            }
            RouteTarget::CancelOrder => {
                let principal = principal.ok_or(RouteError::Unauthenticated)?;
                let id = path_param(&params)?;
                let body = self.workflow()?.cancel_order(&principal, id).await?;
                Ok(Response::new(spec.success_status, body))
            }
            RouteTarget::SagaStatus => {
                let principal = principal.ok_or(RouteError::Unauthenticated)?;
                let id = path_param(&params)?;
                let body = self.workflow()?.saga_status(&principal, id).await?;
                Ok(Response::new(spec.success_status, body))
            }
            RouteTarget::FailedSagas => {
                let body = self.workflow()?.failed_sagas().await?;
                Ok(Response::new(spec.success_status, body))
            }
        }
    }

    async fn authorize(
        &self,
        access: Access,
        token: Option<&str>,
    ) -> Result<Option<Principal>, RouteError> {
        if access == Access::Public {
            return Ok(None);
        }
        let token = token.ok_or(RouteError::Unauthenticated)?;
        let principal = self.authenticator.authenticate(token).await?;
        access.permits(&principal)?;
        Ok(Some(principal))
    }

    async fn dispatch(
        &self,
        spec: &RouteSpec,
        call: &ServiceCall,
        path: &str,
    ) -> Result<Response, RouteError> {
        let Some(fallback) = &spec.fallback else {
            let body = self.dispatcher.call(call).await?;
            return Ok(Response::new(spec.success_status, body));
        };

        let mut degraded = false;
        let body = self
            .dispatcher
            .call_with_fallback(call, |err| {
                if err.is_permanent() {
                    return None;
                }
                let body = fallback.resolve(&self.cache, path);
                degraded = body.is_some();
                body
            })
            .await?;

        if degraded {
            return Ok(Response {
                degraded: true,
                ..Response::new(spec.success_status, body)
            });
        }
        if spec.method == Method::Get {
            self.cache.put(path, body.clone());
        }
        Ok(Response::new(spec.success_status, body))
    }

    fn workflow(&self) -> Result<&Arc<dyn OrderWorkflow>, RouteError> {
        self.workflow.as_ref().ok_or(RouteError::WorkflowUnavailable)
    }
}

/// Owned resources are visible to their owner and to admins only.
fn ensure_owner(principal: &Principal, body: &Value, field: &str) -> Result<(), RouteError> {
    let owner = body.get(field).and_then(Value::as_str);
    if principal.has_role(ROLE_ADMIN) || owner == Some(principal.user_id.as_str()) {
        Ok(())
    } else {
        Err(RouteError::Forbidden("resource belongs to another user".into()))
    }
}

fn path_param(params: &std::collections::HashMap<String, String>) -> Result<&str, RouteError> {
    params
        .get("id")
        .map(String::as_str)
        .ok_or_else(|| RouteError::BadRequest("missing id path parameter".into()))
}
