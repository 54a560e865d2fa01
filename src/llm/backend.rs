use crate::error::BackendError;
use crate::llm::types::{AccessToken, GenerationRequest};
use async_trait::async_trait;
use std::sync::Arc;

/// Anything that can turn a prompt (plus document references) into text.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
        token: &AccessToken,
    ) -> std::result::Result<String, BackendError>;
}

/// Source of bearer tokens. Returns `None` when no valid token can be produced,
/// which callers treat as a non-retryable authentication failure.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn valid_access_token(&self) -> Option<AccessToken>;
}

#[async_trait]
impl<T: GenerationBackend + ?Sized> GenerationBackend for Arc<T> {
    async fn generate(
        &self,
        request: &GenerationRequest,
        token: &AccessToken,
    ) -> std::result::Result<String, BackendError> {
        (**self).generate(request, token).await
    }
}

#[async_trait]
impl<T: CredentialProvider + ?Sized> CredentialProvider for Arc<T> {
    async fn valid_access_token(&self) -> Option<AccessToken> {
        (**self).valid_access_token().await
    }
}

/// Hands out one fixed token for the lifetime of the provider.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    token: Option<AccessToken>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            token: (!token.trim().is_empty()).then(|| AccessToken::new(token)),
        }
    }

    /// Reads the token from an environment variable; a missing or blank value
    /// yields a provider with no token.
    pub fn from_env(var: &str) -> Self {
        std::env::var(var).map(Self::new).unwrap_or_default()
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialProvider for StaticTokenProvider {
    async fn valid_access_token(&self) -> Option<AccessToken> {
        self.token.clone()
    }
}
