//! User accounts and bearer tokens.
//!
//! Doubles as the identity authority for the in-memory deployment: it
//! issues tokens on login and resolves them through [`Authenticator`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use resilience::CallError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use super::{IdempotencyLedger, ServiceControls, parse, unknown_operation};
use crate::auth::{AuthError, Authenticator, Principal, ROLE_CUSTOMER};
use crate::dispatch::{DownstreamService, ServiceCall};

pub const OP_REGISTER: &str = "register";
pub const OP_LOGIN: &str = "login";
pub const OP_GET_USER: &str = "get_user";

/// Public view of an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub username: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone)]
struct Account {
    user: User,
    password: String,
}

#[derive(Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct UserRef {
    id: String,
}

#[derive(Debug, Default)]
struct UserState {
    accounts: HashMap<String, Account>,
    by_username: HashMap<String, String>,
    tokens: HashMap<String, String>,
    next_user: u32,
    ledger: IdempotencyLedger,
}

impl UserState {
    fn create(&mut self, username: &str, password: &str, roles: Vec<String>) -> Result<User, CallError> {
        if username.trim().is_empty() || password.is_empty() {
            return Err(CallError::invalid("username and password are required"));
        }
        if self.by_username.contains_key(username) {
            return Err(CallError::conflict(format!("username {username} is taken")));
        }
        self.next_user += 1;
        let user = User {
            user_id: format!("USR-{:04}", self.next_user),
            username: username.to_string(),
            roles,
        };
        self.by_username
            .insert(user.username.clone(), user.user_id.clone());
        self.accounts.insert(
            user.user_id.clone(),
            Account {
                user: user.clone(),
                password: password.to_string(),
            },
        );
        Ok(user)
    }

    fn login(&mut self, credentials: &Credentials) -> Result<Value, CallError> {
        let account = self
            .by_username
            .get(&credentials.username)
            .and_then(|id| self.accounts.get(id))
            .filter(|account| account.password == credentials.password)
            .ok_or_else(|| CallError::unauthorized("invalid username or password"))?;
        let user_id = account.user.user_id.clone();
        let token = Uuid::new_v4().to_string();
        self.tokens.insert(token.clone(), user_id.clone());
        Ok(json!({ "token": token, "user_id": user_id }))
    }

    fn handle(&mut self, call: &ServiceCall) -> Result<Value, CallError> {
        match call.operation.as_str() {
            OP_REGISTER => {
                let req: Credentials = parse(&call.payload)?;
                let user = self.create(&req.username, &req.password, vec![ROLE_CUSTOMER.to_string()])?;
                Ok(json!(user))
            }
            OP_LOGIN => {
                let req: Credentials = parse(&call.payload)?;
                self.login(&req)
            }
            OP_GET_USER => {
                let req: UserRef = parse(&call.payload)?;
                self.accounts
                    .get(&req.id)
                    .map(|account| json!(account.user))
                    .ok_or_else(|| CallError::not_found(format!("user {} not found", req.id)))
            }
            other => Err(unknown_operation(other)),
        }
    }
}

/// In-memory user service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryUserService {
    state: Arc<Mutex<UserState>>,
    controls: Arc<ServiceControls>,
}

impl InMemoryUserService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn controls(&self) -> &ServiceControls {
        &self.controls
    }

    /// Creates an account directly, e.g. to seed an administrator.
    pub fn create_user(&self, username: &str, password: &str, roles: &[&str]) -> Result<String, CallError> {
        let roles = roles.iter().map(|role| role.to_string()).collect();
        self.state()
            .create(username, password, roles)
            .map(|user| user.user_id)
    }

    /// Issues a token for an existing account without a password check.
    pub fn issue_token(&self, user_id: &str) -> Option<String> {
        let mut state = self.state();
        if !state.accounts.contains_key(user_id) {
            return None;
        }
        let token = Uuid::new_v4().to_string();
        state.tokens.insert(token.clone(), user_id.to_string());
        Some(token)
    }

    fn state(&self) -> MutexGuard<'_, UserState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DownstreamService for InMemoryUserService {
    async fn call(&self, call: &ServiceCall) -> Result<Value, CallError> {
        self.controls.delay(&call.operation).await;
        self.controls.before(&call.operation)?;
        let reply = {
            let mut state = self.state();
            if let Some(reply) = state.ledger.replay(call.idempotency_key.as_ref()) {
                return Ok(reply);
            }
            let reply = state.handle(call)?;
            state.ledger.record(call.idempotency_key.as_ref(), &reply);
            reply
        };
        self.controls.after(&call.operation)?;
        Ok(reply)
    }
}

#[async_trait]
impl Authenticator for InMemoryUserService {
    async fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
        let state = self.state();
        state
            .tokens
            .get(token)
            .and_then(|user_id| state.accounts.get(user_id))
            .map(|account| Principal {
                user_id: account.user.user_id.clone(),
                roles: account.user.roles.clone(),
            })
            .ok_or(AuthError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use common::ServiceKind;
    use resilience::PermanentKind;

    use super::*;
    use crate::auth::ROLE_ADMIN;

    fn credentials(op: &str, username: &str, password: &str) -> ServiceCall {
        ServiceCall::new(ServiceKind::User, op)
            .with_payload(json!({ "username": username, "password": password }))
    }

    #[tokio::test]
    async fn test_register_login_authenticate() {
        let service = InMemoryUserService::new();

        let user = service
            .call(&credentials(OP_REGISTER, "alice", "s3cret"))
            .await
            .unwrap();
        assert_eq!(user["user_id"], "USR-0001");
        assert_eq!(user["roles"], json!([ROLE_CUSTOMER]));

        let session = service
            .call(&credentials(OP_LOGIN, "alice", "s3cret"))
            .await
            .unwrap();
        let principal = service
            .authenticate(session["token"].as_str().unwrap())
            .await
            .unwrap();
        assert_eq!(principal.user_id, "USR-0001");
        assert!(principal.has_role(ROLE_CUSTOMER));
        assert!(!principal.has_role(ROLE_ADMIN));
    }

    #[tokio::test]
    async fn test_duplicate_username_conflicts() {
        let service = InMemoryUserService::new();
        service
            .call(&credentials(OP_REGISTER, "bob", "pw"))
            .await
            .unwrap();

        let err = service
            .call(&credentials(OP_REGISTER, "bob", "other"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Permanent { kind: PermanentKind::Conflict, .. }));
    }

    #[tokio::test]
    async fn test_wrong_password_is_unauthorized() {
        let service = InMemoryUserService::new();
        service.create_user("carol", "right", &[ROLE_CUSTOMER]).unwrap();

        let err = service
            .call(&credentials(OP_LOGIN, "carol", "wrong"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CallError::Permanent { kind: PermanentKind::Unauthorized, .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_token_is_rejected() {
        let service = InMemoryUserService::new();
        assert_eq!(
            service.authenticate("not-a-token").await,
            Err(AuthError::Unauthenticated)
        );
    }

    #[tokio::test]
    async fn test_get_user_and_issue_token() {
        let service = InMemoryUserService::new();
        let id = service.create_user("root", "pw", &[ROLE_ADMIN]).unwrap();
        let token = service.issue_token(&id).unwrap();

        let principal = service.authenticate(&token).await.unwrap();
        assert!(principal.has_role(ROLE_ADMIN));

        let user = service
            .call(&ServiceCall::new(ServiceKind::User, OP_GET_USER).with_payload(json!({ "id": id })))
            .await
            .unwrap();
        assert_eq!(user["username"], "root");
        assert!(user.get("password").is_none());
        assert!(service.issue_token("USR-9999").is_none());
    }
}
