use crate::error::StoreError;
use crate::session::{OAuthTokens, SessionPatch};
use crate::store::SessionStore;
use async_trait::async_trait;
use std::sync::Arc;

/// Credential persistence, split from the session contract so a deployment
/// can back tokens with a different substrate than session metadata.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn tokens(
        &self,
        identity: &str,
        session_id: &str,
    ) -> Result<Option<OAuthTokens>, StoreError>;

    async fn put_tokens(
        &self,
        identity: &str,
        session_id: &str,
        tokens: &OAuthTokens,
    ) -> Result<(), StoreError>;
}

/// Default composition: credentials live on the session record itself.
pub struct SessionCredentialStore {
    store: Arc<dyn SessionStore>,
}

impl SessionCredentialStore {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CredentialStore for SessionCredentialStore {
    async fn tokens(
        &self,
        identity: &str,
        session_id: &str,
    ) -> Result<Option<OAuthTokens>, StoreError> {
        Ok(self
            .store
            .get_session(identity, session_id)
            .await?
            .and_then(|r| r.tokens))
    }

    async fn put_tokens(
        &self,
        identity: &str,
        session_id: &str,
        tokens: &OAuthTokens,
    ) -> Result<(), StoreError> {
        self.store
            .update_session(
                identity,
                session_id,
                SessionPatch::new().tokens(tokens.clone()),
                None,
                None,
            )
            .await?;
        Ok(())
    }
}
