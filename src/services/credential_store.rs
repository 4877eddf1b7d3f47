//! Credential store contract.
//!
//! Credentials are an opaque key-value bag scoped by `(tenant, service,
//! account)`.  The store neither interprets nor refreshes them; tools that
//! need a token look it up through the handle on their execution context.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque credential payload.
pub type CredentialBag = HashMap<String, String>;

/// Default account name when a tenant has a single account for a service.
pub const DEFAULT_ACCOUNT: &str = "primary";

/// Identifies a stored credential without exposing its contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialRef {
    pub tenant_id: String,
    pub service: String,
    pub account: String,
}

/// Errors that can occur during credential operations.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential not found for service {service}, account {account}")]
    NotFound { service: String, account: String },

    #[error("credential backend error: {0}")]
    Backend(String),
}

/// Abstraction over the credential backend.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Save or overwrite the credential bag for `(tenant, service, account)`.
    async fn save(
        &self,
        tenant_id: &str,
        service: &str,
        creds: CredentialBag,
        account: &str,
    ) -> Result<(), CredentialError>;

    /// Fetch a credential bag.  Returns `None` when absent.
    async fn get(
        &self,
        tenant_id: &str,
        service: &str,
        account: &str,
    ) -> Result<Option<CredentialBag>, CredentialError>;

    /// List stored credentials for a tenant, optionally filtered by service.
    async fn list(
        &self,
        tenant_id: &str,
        service: Option<&str>,
    ) -> Result<Vec<CredentialRef>, CredentialError>;

    /// Delete a credential.  Removing an absent entry is not an error.
    async fn delete(
        &self,
        tenant_id: &str,
        service: &str,
        account: &str,
    ) -> Result<(), CredentialError>;
}

// ─── InMemoryCredentialStore ──────────────────────────────────────────────────

/// Process-local credential store, used by tests and demos.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    entries: tokio::sync::RwLock<HashMap<(String, String, String), CredentialBag>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn save(
        &self,
        tenant_id: &str,
        service: &str,
        creds: CredentialBag,
        account: &str,
    ) -> Result<(), CredentialError> {
        self.entries.write().await.insert(
            (tenant_id.to_string(), service.to_string(), account.to_string()),
            creds,
        );
        Ok(())
    }

    async fn get(
        &self,
        tenant_id: &str,
        service: &str,
        account: &str,
    ) -> Result<Option<CredentialBag>, CredentialError> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(
                tenant_id.to_string(),
                service.to_string(),
                account.to_string(),
            ))
            .cloned())
    }

    async fn list(
        &self,
        tenant_id: &str,
        service: Option<&str>,
    ) -> Result<Vec<CredentialRef>, CredentialError> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|(t, s, _)| t == tenant_id && service.is_none_or(|svc| svc == s))
            .map(|(t, s, a)| CredentialRef {
                tenant_id: t.clone(),
                service: s.clone(),
                account: a.clone(),
            })
            .collect())
    }

    async fn delete(
        &self,
        tenant_id: &str,
        service: &str,
        account: &str,
    ) -> Result<(), CredentialError> {
        self.entries.write().await.remove(&(
            tenant_id.to_string(),
            service.to_string(),
            account.to_string(),
        ));
        Ok(())
    }
}
