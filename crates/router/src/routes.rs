//! Inbound route table.

use std::collections::HashMap;

use common::ServiceKind;
use serde_json::Value;

use crate::auth::{Access, ROLE_ADMIN};
use crate::error::RouteError;
use crate::fallback::Fallback;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn parse(method: &str) -> Option<Self> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a matched route does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// Forward to a downstream service operation.
    Service {
        service: ServiceKind,
        operation: &'static str,
    },
    /// Start the order-placement saga.
    PlaceOrder,
    /// Cancel a running order-placement saga.
    CancelOrder,
    /// Report a saga's status.
    SagaStatus,
    /// List sagas awaiting manual intervention.
    FailedSagas,
}

/// One entry of the route table.
#[derive(Debug, Clone)]
pub struct RouteSpec {
    pub method: Method,
    /// Path pattern; `:name` segments capture parameters.
    pub pattern: &'static str,
    pub target: RouteTarget,
    pub access: Access,
    /// Status returned on success.
    pub success_status: u16,
    pub fallback: Option<Fallback>,
    /// Reply field naming the owning user; others need the admin role.
    pub owner_field: Option<&'static str>,
}

impl RouteSpec {
    fn new(method: Method, pattern: &'static str, target: RouteTarget, access: Access) -> Self {
        let success_status = if method == Method::Post { 201 } else { 200 };
        Self {
            method,
            pattern,
            target,
            access,
            success_status,
            fallback: None,
            owner_field: None,
        }
    }

    fn service(
        method: Method,
        pattern: &'static str,
        service: ServiceKind,
        operation: &'static str,
        access: Access,
    ) -> Self {
        Self::new(method, pattern, RouteTarget::Service { service, operation }, access)
    }

    fn with_status(mut self, status: u16) -> Self {
        self.success_status = status;
        self
    }

    fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = Some(fallback);
        self
    }

    fn owned_by(mut self, field: &'static str) -> Self {
        self.owner_field = Some(field);
        self
    }
}

/// Ordered list of routes; the first match wins.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<RouteSpec>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The public API of the order platform.
    pub fn standard() -> Self {
        use Method::*;
        use ServiceKind::*;

        let admin = Access::Role(ROLE_ADMIN);
        let user = Access::Authenticated;

        Self::new()
            .route(RouteSpec::service(Post, "/register", User, "register", Access::Public))
            .route(
                RouteSpec::service(Post, "/login", User, "login", Access::Public).with_status(200),
            )
            .route(
                RouteSpec::service(Get, "/users/:id", User, "get_user", user)
                    .with_fallback(Fallback::LastKnown)
                    .owned_by("user_id"),
            )
            .route(RouteSpec::service(Post, "/products", Product, "create_product", admin))
            .route(
                RouteSpec::service(Get, "/products/:id", Product, "get_product", Access::Public)
                    .with_fallback(Fallback::LastKnown),
            )
            .route(RouteSpec::service(Put, "/products/:id", Product, "update_product", admin))
            .route(RouteSpec::service(Delete, "/products/:id", Product, "delete_product", admin))
            .route(RouteSpec::new(Post, "/orders", RouteTarget::PlaceOrder, user))
            .route(
                RouteSpec::service(Get, "/orders/:id", Order, "get_order", user)
                    .owned_by("customer_id"),
            )
            .route(RouteSpec::new(Put, "/orders/:id/cancel", RouteTarget::CancelOrder, user))
            .route(RouteSpec::new(Get, "/sagas/failed", RouteTarget::FailedSagas, admin))
            .route(RouteSpec::new(Get, "/sagas/:id", RouteTarget::SagaStatus, user))
    }

    pub fn route(mut self, spec: RouteSpec) -> Self {
        self.routes.push(spec);
        self
    }

    /// Sets or replaces the fallback of an existing route.
    pub fn with_fallback(mut self, method: Method, pattern: &str, fallback: Fallback) -> Self {
        for spec in &mut self.routes {
            if spec.method == method && spec.pattern == pattern {
                spec.fallback = Some(fallback.clone());
            }
        }
        self
    }

    /// Finds the route for a request and extracts its path parameters.
    pub fn resolve(
        &self,
        method: Method,
        path: &str,
    ) -> Result<(&RouteSpec, HashMap<String, String>), RouteError> {
        self.routes
            .iter()
            .filter(|spec| spec.method == method)
            .find_map(|spec| match_pattern(spec.pattern, path).map(|params| (spec, params)))
            .ok_or_else(|| RouteError::RouteNotFound {
                method: method.to_string(),
                path: path.to_string(),
            })
    }
}

fn match_pattern(pattern: &str, path: &str) -> Option<HashMap<String, String>> {
    let path = path.split('?').next().unwrap_or(path);
    let pattern_segments: Vec<_> = pattern.trim_matches('/').split('/').collect();
    let path_segments: Vec<_> = path.trim_matches('/').split('/').collect();
    if pattern_segments.len() != path_segments.len() {
        return None;
    }

    let mut params = HashMap::new();
    for (expected, actual) in pattern_segments.iter().zip(&path_segments) {
        if let Some(name) = expected.strip_prefix(':') {
            if actual.is_empty() {
                return None;
            }
            params.insert(name.to_string(), actual.to_string());
        } else if expected != actual {
            return None;
        }
    }
    Some(params)
}

/// Merges path parameters into a JSON request body.
pub(crate) fn merge_params(body: Value, params: HashMap<String, String>) -> Result<Value, RouteError> {
    let mut object = match body {
        Value::Null => serde_json::Map::new(),
        Value::Object(object) => object,
        _ => return Err(RouteError::BadRequest("request body must be a JSON object".into())),
    };
    for (name, value) in params {
        object.insert(name, Value::String(value));
    }
    Ok(Value::Object(object))
}
