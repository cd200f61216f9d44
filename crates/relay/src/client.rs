//! Per-session connection state machine.
//!
//! One `ConnectionClient` owns one session's lifecycle: it is the only
//! writer of that session's state, persists every transition through the
//! store (revision-checked), and publishes each transition on the event bus.
//! Callers never mutate a record behind a client's back.

use crate::credentials::CredentialStore;
use crate::error::{AuthError, ConnectError, StoreError, ToolCallError, TransportError};
use crate::events::{ConnectionEventKind, EventBus};
use crate::oauth::OAuthFlow;
use crate::session::{
    ClientRegistration, ConnectionState, OAuthTokens, PendingAuth, ServerConfig, SessionPatch,
    SessionRecord, ToolInfo,
};
use crate::store::SessionStore;
use crate::transport::{Endpoint, McpTransport, ToolCallOutcome};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Refresh the access token when it expires within this window.
const TOKEN_REFRESH_GRACE_SECS: u64 = 60;

/// Shared collaborators injected into every client.
#[derive(Clone)]
pub struct ClientDeps {
    pub store: Arc<dyn SessionStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub oauth: Arc<dyn OAuthFlow>,
    pub transport: Arc<dyn McpTransport>,
    pub events: Arc<EventBus>,
    /// Session TTL applied on create and refreshed on every persisted
    /// transition. `None` means the store default.
    pub ttl_secs: Option<u64>,
}

/// What `connect` (or `finish_auth`) resolved to. Needing authorization is
/// an expected outcome, not an error.
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    Connected { tools: Vec<ToolInfo> },
    AuthRequired { auth_url: String },
}

struct Inner {
    state: ConnectionState,
    revision: u64,
    tools: Option<Vec<ToolInfo>>,
    remote_session_id: Option<String>,
    pending_auth: Option<PendingAuth>,
    client_info: Option<ClientRegistration>,
}

/// One session's lifecycle driver. See the module docs for the ownership
/// contract.
pub struct ConnectionClient {
    identity: String,
    session_id: String,
    config: ServerConfig,
    deps: ClientDeps,
    /// Serializes every lifecycle transition; concurrent `connect` calls
    /// coalesce instead of racing the handshake.
    inner: Mutex<Inner>,
    shutdown: CancellationToken,
}

impl ConnectionClient {
    /// Create and persist a brand-new session for `identity`.
    pub async fn create(
        deps: ClientDeps,
        identity: &str,
        config: ServerConfig,
    ) -> Result<Self, ConnectError> {
        let session_id = deps.store.generate_session_id();
        let record = SessionRecord::new(session_id.clone(), identity.to_string(), &config);
        deps.store.create_session(&record, deps.ttl_secs).await?;
        Ok(Self::from_parts(deps, record.identity, session_id, config, Inner {
            state: ConnectionState::Disconnected,
            revision: 0,
            tools: None,
            remote_session_id: None,
            pending_auth: None,
            client_info: None,
        }))
    }

    /// Rebuild a client from a persisted record, e.g. after a process
    /// restart. The live connection is gone, so states that imply one
    /// degrade to the strongest durable fact: the credentials.
    pub fn from_record(deps: ClientDeps, record: SessionRecord) -> Self {
        let state = match record.state {
            ConnectionState::Connecting => ConnectionState::Disconnected,
            s if s.is_authenticated() => ConnectionState::Authenticated,
            s => s,
        };
        let config = ServerConfig {
            server_name: record.server_name.clone(),
            server_url: record.server_url.clone(),
            callback_url: record.callback_url.clone(),
            transport_type: record.transport_type,
        };
        Self::from_parts(deps, record.identity, record.session_id, config, Inner {
            state,
            revision: record.revision,
            tools: None,
            remote_session_id: None,
            pending_auth: record.pending_auth,
            client_info: record.client_info,
        })
    }

    fn from_parts(
        deps: ClientDeps,
        identity: String,
        session_id: String,
        config: ServerConfig,
        inner: Inner,
    ) -> Self {
        Self {
            identity,
            session_id,
            config,
            deps,
            inner: Mutex::new(inner),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn server_config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Cached tool list; `None` unless the session is connected.
    pub async fn tools(&self) -> Option<Vec<ToolInfo>> {
        self.inner.lock().await.tools.clone()
    }

    /// Establish (or re-establish) the connection.
    ///
    /// Idempotent while connected: returns the cached tool list without
    /// touching the wire. When the endpoint demands authorization this
    /// returns [`ConnectOutcome::AuthRequired`]; the caller redirects the
    /// user and later resumes via [`finish_auth`](Self::finish_auth).
    pub async fn connect(&self) -> Result<ConnectOutcome, ConnectError> {
        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::Connected
            && let Some(tools) = inner.tools.clone()
        {
            return Ok(ConnectOutcome::Connected { tools });
        }
        let fallback = inner.state;
        self.set_state(&mut inner, ConnectionState::Connecting)
            .await?;
        self.establish(&mut inner, fallback).await
    }

    /// Complete a pending authorization round trip with the code (and state
    /// echo) from the callback, then finish the handshake.
    pub async fn finish_auth(&self, code: &str, state: &str) -> Result<ConnectOutcome, ConnectError> {
        let mut inner = self.inner.lock().await;
        let Some(pending) = inner.pending_auth.clone() else {
            return Err(ConnectError::MissingConfig("pending authorization"));
        };
        if pending.state != state {
            return Err(ConnectError::Auth(AuthError::InvalidGrant(
                "state parameter mismatch".to_string(),
            )));
        }
        let Some(client) = inner.client_info.clone() else {
            return Err(ConnectError::MissingConfig("client registration"));
        };

        let tokens = match self
            .deps
            .oauth
            .exchange(&client, &self.config.callback_url, &pending, code)
            .await
        {
            Ok(tokens) => tokens,
            Err(e) => {
                self.fail(&mut inner, format!("authorization failed: {e}"))
                    .await?;
                return Err(e.into());
            }
        };
        self.deps
            .credentials
            .put_tokens(&self.identity, &self.session_id, &tokens)
            .await?;
        inner.pending_auth = None;
        self.persist(&mut inner, SessionPatch::new().clear_pending_auth())
            .await?;
        self.set_state(&mut inner, ConnectionState::Authenticated)
            .await?;
        self.establish(&mut inner, ConnectionState::Authenticated)
            .await
    }

    /// Revalidate the session before trusting it. A live connection is
    /// checked with a discovery call; a resumed one (credentials survived,
    /// the connection did not) goes through reconnect-and-rediscover; a
    /// session with no credentials runs the plain connect flow.
    pub async fn validate(&self) -> Result<ConnectOutcome, ConnectError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ConnectionState::Connected => {
                self.set_state(&mut inner, ConnectionState::Validating)
                    .await?;
                let bearer = self.valid_access_token(&mut inner).await?;
                let endpoint = Endpoint {
                    url: &self.config.server_url,
                    bearer: bearer.as_deref(),
                    session_id: inner.remote_session_id.as_deref(),
                };
                match self.deps.transport.list_tools(endpoint).await {
                    Ok(tools) => {
                        inner.tools = Some(tools.clone());
                        self.set_state(&mut inner, ConnectionState::Connected)
                            .await?;
                        Ok(ConnectOutcome::Connected { tools })
                    }
                    Err(e) => {
                        tracing::warn!(
                            session_id = %self.session_id,
                            error = %e,
                            "validation failed, reconnecting"
                        );
                        self.set_state(&mut inner, ConnectionState::Reconnecting)
                            .await?;
                        self.establish(&mut inner, ConnectionState::Authenticated)
                            .await
                    }
                }
            }
            s if s.is_authenticated() => {
                self.set_state(&mut inner, ConnectionState::Reconnecting)
                    .await?;
                self.establish(&mut inner, ConnectionState::Authenticated)
                    .await
            }
            fallback => {
                self.set_state(&mut inner, ConnectionState::Connecting)
                    .await?;
                self.establish(&mut inner, fallback).await
            }
        }
    }

    /// Tool listing per the session lifecycle: the cached set while the
    /// connection is warm, a discovery pass when only credentials survived,
    /// and `NotConnected` before authentication.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, ConnectError> {
        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::Connected
            && let Some(tools) = inner.tools.clone()
        {
            return Ok(tools);
        }
        if !inner.state.is_authenticated() {
            return Err(ConnectError::NotConnected { state: inner.state });
        }
        let fallback = inner.state;
        match self.establish(&mut inner, fallback).await? {
            ConnectOutcome::Connected { tools } => Ok(tools),
            // The credentials lapsed under us; the caller has to run the
            // authorization round trip before listing again.
            ConnectOutcome::AuthRequired { .. } => Err(ConnectError::NoCredentials),
        }
    }

    /// Invoke a remote tool. The call races the caller's cancellation token
    /// and the client's shutdown; a disconnect aborts in-flight calls.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<ToolCallOutcome, ToolCallError> {
        let (state, remote_session_id) = {
            let inner = self.inner.lock().await;
            (inner.state, inner.remote_session_id.clone())
        };
        if state != ConnectionState::Connected {
            return Err(ToolCallError::NotConnected { state });
        }
        let bearer = self
            .deps
            .credentials
            .tokens(&self.identity, &self.session_id)
            .await
            .ok()
            .flatten()
            .map(|t| t.access_token);
        let endpoint = Endpoint {
            url: &self.config.server_url,
            bearer: bearer.as_deref(),
            session_id: remote_session_id.as_deref(),
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(ToolCallError::Cancelled),
            _ = self.shutdown.cancelled() => Err(ToolCallError::Cancelled),
            result = self.deps.transport.call_tool(endpoint, name, arguments) => {
                result.map_err(|e| ToolCallError::Transport(e.to_string()))
            }
        }
    }

    /// Tear the session down: abort in-flight calls, close the remote
    /// session best-effort, and delete the record, releasing the session id.
    pub async fn disconnect(&self, reason: &str) -> Result<(), ConnectError> {
        self.shutdown.cancel();
        let mut inner = self.inner.lock().await;

        let bearer = self
            .deps
            .credentials
            .tokens(&self.identity, &self.session_id)
            .await
            .ok()
            .flatten()
            .map(|t| t.access_token);
        let endpoint = Endpoint {
            url: &self.config.server_url,
            bearer: bearer.as_deref(),
            session_id: inner.remote_session_id.as_deref(),
        };
        if let Err(e) = self.deps.transport.close(endpoint).await {
            tracing::warn!(session_id = %self.session_id, error = %e, "remote close failed");
        }

        inner.state = ConnectionState::Disconnected;
        inner.tools = None;
        inner.remote_session_id = None;
        inner.pending_auth = None;
        self.deps
            .store
            .remove_session(&self.identity, &self.session_id)
            .await?;
        self.deps.events.publish(
            &self.identity,
            &self.session_id,
            ConnectionEventKind::Disconnected {
                reason: reason.to_string(),
            },
        );
        Ok(())
    }

    /// Record an unrecoverable failure. `Failed` is persisted with the
    /// error and the session stops being offered until a fresh `connect`.
    pub async fn mark_failed(&self, reason: &str) -> Result<(), ConnectError> {
        let mut inner = self.inner.lock().await;
        self.fail(&mut inner, reason.to_string()).await
    }

    /// Handshake and discovery, assuming `inner.state` already reflects an
    /// in-progress attempt (Connecting, Authenticated, Reconnecting).
    /// Transport errors retreat to `fallback` so the caller can retry.
    async fn establish(
        &self,
        inner: &mut Inner,
        fallback: ConnectionState,
    ) -> Result<ConnectOutcome, ConnectError> {
        let bearer = self.valid_access_token(inner).await?;
        let endpoint = Endpoint {
            url: &self.config.server_url,
            bearer: bearer.as_deref(),
            session_id: None,
        };
        let remote = match self.deps.transport.initialize(endpoint).await {
            Ok(remote) => remote,
            Err(TransportError::Unauthorized) => return self.begin_auth(inner).await,
            Err(e) => {
                self.retreat(inner, fallback, format!("initialize failed: {e}"))
                    .await?;
                return Err(ConnectError::Transport(e.to_string()));
            }
        };
        inner.remote_session_id = remote.session_id;

        self.set_state(inner, ConnectionState::Discovering).await?;
        let endpoint = Endpoint {
            url: &self.config.server_url,
            bearer: bearer.as_deref(),
            session_id: inner.remote_session_id.as_deref(),
        };
        let tools = match self.deps.transport.list_tools(endpoint).await {
            Ok(tools) => tools,
            Err(TransportError::Unauthorized) => return self.begin_auth(inner).await,
            Err(e) => {
                self.retreat(inner, fallback, format!("tool discovery failed: {e}"))
                    .await?;
                return Err(ConnectError::Transport(e.to_string()));
            }
        };
        inner.tools = Some(tools.clone());

        self.persist(inner, SessionPatch::new().clear_last_error())
            .await?;
        self.set_state(inner, ConnectionState::Connected).await?;
        self.deps.events.publish(
            &self.identity,
            &self.session_id,
            ConnectionEventKind::ToolsDiscovered {
                tools: tools.clone(),
            },
        );
        Ok(ConnectOutcome::Connected { tools })
    }

    async fn begin_auth(&self, inner: &mut Inner) -> Result<ConnectOutcome, ConnectError> {
        self.set_state(inner, ConnectionState::Authenticating)
            .await?;
        let request = self
            .deps
            .oauth
            .begin(
                &self.config.server_url,
                &self.config.callback_url,
                inner.client_info.clone(),
            )
            .await?;
        inner.pending_auth = Some(request.pending.clone());
        inner.client_info = Some(request.client.clone());
        self.persist(
            inner,
            SessionPatch::new()
                .pending_auth(request.pending)
                .client_info(request.client),
        )
        .await?;
        self.deps.events.publish(
            &self.identity,
            &self.session_id,
            ConnectionEventKind::AuthRequired {
                auth_url: request.auth_url.clone(),
            },
        );
        Ok(ConnectOutcome::AuthRequired {
            auth_url: request.auth_url,
        })
    }

    /// Current credentials with a guaranteed-fresh access token, refreshing
    /// through the refresh token when expiry is near. `None` when the
    /// session holds no credentials yet. A dead refresh token is terminal:
    /// the session is failed and must be reauthorized by the user.
    pub async fn valid_tokens(&self) -> Result<Option<OAuthTokens>, ConnectError> {
        let mut inner = self.inner.lock().await;
        self.fresh_tokens(&mut inner).await
    }

    async fn fresh_tokens(&self, inner: &mut Inner) -> Result<Option<OAuthTokens>, ConnectError> {
        let Some(tokens) = self
            .deps
            .credentials
            .tokens(&self.identity, &self.session_id)
            .await?
        else {
            return Ok(None);
        };
        if !tokens.expires_within(TOKEN_REFRESH_GRACE_SECS) {
            return Ok(Some(tokens));
        }
        let (Some(refresh), Some(client)) =
            (tokens.refresh_token.clone(), inner.client_info.clone())
        else {
            // Nothing to refresh with; let the endpoint decide.
            return Ok(Some(tokens));
        };
        match self.deps.oauth.refresh(&client, &refresh).await {
            Ok(fresh) => {
                self.deps
                    .credentials
                    .put_tokens(&self.identity, &self.session_id, &fresh)
                    .await?;
                Ok(Some(fresh))
            }
            // The refresh request never reached the authorization server;
            // send the stale token and let the endpoint's 401 decide.
            Err(AuthError::Transport(e)) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "token refresh unreachable");
                Ok(Some(tokens))
            }
            // The authorization server rejected the refresh token. Terminal:
            // only a user-driven round trip issues new credentials.
            Err(e) => {
                self.fail(inner, format!("token refresh failed: {e}")).await?;
                Err(ConnectError::Auth(e))
            }
        }
    }

    async fn valid_access_token(&self, inner: &mut Inner) -> Result<Option<String>, ConnectError> {
        Ok(self.fresh_tokens(inner).await?.map(|t| t.access_token))
    }

    async fn set_state(
        &self,
        inner: &mut Inner,
        next: ConnectionState,
    ) -> Result<(), ConnectError> {
        if inner.state == next {
            return Ok(());
        }
        inner.state = next;
        if !next.is_authenticated() {
            inner.tools = None;
        }
        self.persist(inner, SessionPatch::new().state(next)).await?;
        self.deps.events.publish(
            &self.identity,
            &self.session_id,
            ConnectionEventKind::StateChanged { state: next },
        );
        Ok(())
    }

    /// A first-occurrence transport failure is retryable: the record keeps
    /// its last good state plus the error, and the caller decides whether
    /// to retry or give the session up.
    async fn retreat(
        &self,
        inner: &mut Inner,
        to: ConnectionState,
        reason: String,
    ) -> Result<(), ConnectError> {
        inner.state = to;
        if !to.is_authenticated() {
            inner.tools = None;
        }
        self.persist(
            inner,
            SessionPatch::new().state(to).last_error(reason.clone()),
        )
        .await?;
        self.deps.events.publish(
            &self.identity,
            &self.session_id,
            ConnectionEventKind::StateChanged { state: to },
        );
        self.deps.events.publish(
            &self.identity,
            &self.session_id,
            ConnectionEventKind::Error { error: reason },
        );
        Ok(())
    }

    async fn fail(&self, inner: &mut Inner, reason: String) -> Result<(), ConnectError> {
        inner.state = ConnectionState::Failed;
        inner.tools = None;
        self.persist(
            inner,
            SessionPatch::new()
                .state(ConnectionState::Failed)
                .last_error(reason.clone()),
        )
        .await?;
        self.deps.events.publish(
            &self.identity,
            &self.session_id,
            ConnectionEventKind::StateChanged {
                state: ConnectionState::Failed,
            },
        );
        self.deps.events.publish(
            &self.identity,
            &self.session_id,
            ConnectionEventKind::Error { error: reason },
        );
        Ok(())
    }

    /// Revision-checked write-through. On a conflict (an out-of-band writer
    /// advanced the record) the merge is re-applied once on top of the
    /// current revision.
    async fn persist(&self, inner: &mut Inner, patch: SessionPatch) -> Result<(), ConnectError> {
        let attempt = self
            .deps
            .store
            .update_session(
                &self.identity,
                &self.session_id,
                patch.clone(),
                Some(inner.revision),
                self.deps.ttl_secs,
            )
            .await;
        let record = match attempt {
            Ok(record) => record,
            Err(StoreError::RevisionConflict { found, .. }) => {
                self.deps
                    .store
                    .update_session(
                        &self.identity,
                        &self.session_id,
                        patch,
                        Some(found),
                        self.deps.ttl_secs,
                    )
                    .await?
            }
            Err(StoreError::NotFound { .. }) => {
                return Err(ConnectError::UnknownSession(self.session_id.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        inner.revision = record.revision;
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionClient")
            .field("identity", &self.identity)
            .field("session_id", &self.session_id)
            .field("server_url", &self.config.server_url)
            .finish_non_exhaustive()
    }
}
