//! Contract with the external identity authority.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role required for catalog writes.
pub const ROLE_ADMIN: &str = "admin";

/// Role given to self-registered users.
pub const ROLE_CUSTOMER: &str = "customer";

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Authentication/authorization failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing or invalid credentials")]
    Unauthenticated,

    #[error("{0}")]
    Forbidden(String),
}

/// Who may use a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    Authenticated,
    Role(&'static str),
}

impl Access {
    /// Checks an authenticated principal against this access level.
    pub fn permits(&self, principal: &Principal) -> Result<(), AuthError> {
        match self {
            Access::Public | Access::Authenticated => Ok(()),
            Access::Role(role) if principal.has_role(role) => Ok(()),
            Access::Role(role) => Err(AuthError::Forbidden(format!("{role} role required"))),
        }
    }
}

/// Resolves bearer tokens into principals.
///
/// Token issuance lives with the identity authority; the router only
/// verifies what it is handed.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Principal, AuthError>;
}
