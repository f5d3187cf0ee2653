//! Identity collaborator.
//!
//! Credential checks and session tokens belong to an external service; the
//! coordinator only asks it who a connection is. [`MemoryIdentity`] is the
//! in-process implementation used by the standalone server and tests.

use crate::error::DomainError;
use crate::ids::UserId;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// A successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub user_id: UserId,
    pub token: String,
}

/// Identity collaborator interface.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Check credentials and issue a session token.
    async fn login(&self, credentials: &Value) -> Result<Grant, DomainError>;

    /// Resolve a session token. `Ok(None)` means the token is unknown or expired.
    async fn resume(&self, token: &str) -> Result<Option<UserId>, DomainError>;

    /// Revoke a session token.
    async fn logout(&self, token: &str) -> Result<(), DomainError>;
}

#[derive(Debug, Deserialize)]
struct PasswordCredentials {
    username: String,
    password: String,
}

#[derive(Debug, Clone)]
struct Account {
    user_id: UserId,
    password: String,
}

/// In-memory identity provider.
#[derive(Debug, Default)]
pub struct MemoryIdentity {
    /// username -> account.
    accounts: DashMap<String, Account>,
    /// token -> user id.
    tokens: DashMap<String, UserId>,
}

impl MemoryIdentity {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account; the user id equals the username.
    pub fn register(&self, username: &str, password: &str) -> UserId {
        let account = Account {
            user_id: username.to_string(),
            password: password.to_string(),
        };
        self.accounts.insert(username.to_string(), account);
        username.to_string()
    }

    /// Issue a session token for a user without a password check.
    pub fn issue_token(&self, user_id: &str) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.tokens.insert(token.clone(), user_id.to_string());
        token
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentity {
    async fn login(&self, credentials: &Value) -> Result<Grant, DomainError> {
        let creds: PasswordCredentials = serde_json::from_value(credentials.clone())?;
        let user_id = match self.accounts.get(&creds.username) {
            Some(account) if account.password == creds.password => account.user_id.clone(),
            _ => return Err(DomainError::forbidden("Invalid username or password")),
        };
        let token = self.issue_token(&user_id);
        debug!(user = %user_id, "Login accepted");
        Ok(Grant { user_id, token })
    }

    async fn resume(&self, token: &str) -> Result<Option<UserId>, DomainError> {
        Ok(self.tokens.get(token).map(|user| user.clone()))
    }

    async fn logout(&self, token: &str) -> Result<(), DomainError> {
        self.tokens.remove(token);
        Ok(())
    }
}
