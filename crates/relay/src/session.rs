use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default record TTL (12 hours), matching the reference key layout.
pub const DEFAULT_SESSION_TTL_SECS: u64 = 43_200;

pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub fn unix_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Lifecycle state of one remote-endpoint connection.
///
/// Owned exclusively by one `ConnectionClient` instance at a time and
/// mirrored into the [`SessionRecord`] for durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Authenticated,
    Discovering,
    Connected,
    Validating,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// States at or beyond a completed authentication.
    pub fn is_authenticated(self) -> bool {
        matches!(
            self,
            Self::Authenticated
                | Self::Discovering
                | Self::Connected
                | Self::Validating
                | Self::Reconnecting
        )
    }

    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    Sse,
    StreamableHttp,
    #[default]
    Auto,
}

/// OAuth credential bundle; mutated in place on refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Absolute expiry, unix seconds. Absent means the server did not say.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl OAuthTokens {
    /// True when the access token is expired or expires within `grace_secs`.
    pub fn expires_within(&self, grace_secs: u64) -> bool {
        match self.expires_at {
            Some(exp) => unix_now_secs().saturating_add(grace_secs) >= exp,
            None => false,
        }
    }
}

/// Dynamic-client-registration result, set once during registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistration {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Token endpoint captured at registration time so refresh/exchange do
    /// not re-run discovery.
    pub token_endpoint: String,
}

/// In-flight authorization round trip, held between `connect()` emitting
/// an auth-required redirect and `finish_auth(code)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAuth {
    pub code_verifier: String,
    pub state: String,
}

/// Connection configuration supplied by the caller on first connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub server_name: String,
    pub server_url: String,
    pub callback_url: String,
    #[serde(default)]
    pub transport_type: TransportType,
}

impl ServerConfig {
    /// Stable identifier of this endpoint configuration, used to detect
    /// "already connected to this endpoint".
    pub fn server_id(&self) -> String {
        let digest = sha2::Sha256::digest(self.server_url.as_bytes());
        hex::encode(&digest[..16])
    }
}

/// A named, schema-described capability exposed by a remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

/// The unit of persistence: one durable, authenticated relationship between
/// an identity and one remote endpoint.
///
/// `session_id` and `identity` are immutable once assigned. `revision` is a
/// monotonic counter bumped by every successful update; updates may be made
/// conditional on it (compare-and-swap).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub identity: String,
    pub server_id: String,
    pub server_name: String,
    pub server_url: String,
    pub callback_url: String,
    #[serde(default)]
    pub transport_type: TransportType,
    #[serde(default = "crate::session::default_true")]
    pub active: bool,
    #[serde(default)]
    pub state: ConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<OAuthTokens>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<ClientRegistration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_auth: Option<PendingAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub revision: u64,
}

pub(crate) fn default_true() -> bool {
    true
}

impl SessionRecord {
    pub fn new(session_id: String, identity: String, config: &ServerConfig) -> Self {
        Self {
            session_id,
            identity,
            server_id: config.server_id(),
            server_name: config.server_name.clone(),
            server_url: config.server_url.clone(),
            callback_url: config.callback_url.clone(),
            transport_type: config.transport_type,
            active: true,
            state: ConnectionState::Disconnected,
            tokens: None,
            client_info: None,
            pending_auth: None,
            last_error: None,
            revision: 0,
        }
    }
}

/// Shallow merge applied by `SessionStore::update_session`.
///
/// `Some(..)` overwrites the field; `None` leaves it untouched. Clearable
/// fields use a double `Option` so a patch can distinguish "leave alone"
/// from "set to none".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ConnectionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<OAuthTokens>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<ClientRegistration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_auth: Option<Option<PendingAuth>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

impl SessionPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: ConnectionState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn tokens(mut self, tokens: OAuthTokens) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn client_info(mut self, client_info: ClientRegistration) -> Self {
        self.client_info = Some(client_info);
        self
    }

    pub fn pending_auth(mut self, pending: PendingAuth) -> Self {
        self.pending_auth = Some(Some(pending));
        self
    }

    pub fn clear_pending_auth(mut self) -> Self {
        self.pending_auth = Some(None);
        self
    }

    pub fn last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(Some(error.into()));
        self
    }

    pub fn clear_last_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    /// Apply the patch to a record. Does not touch `revision`; the store
    /// bumps it after a successful merge.
    pub fn apply(&self, record: &mut SessionRecord) {
        if let Some(state) = self.state {
            record.state = state;
        }
        if let Some(active) = self.active {
            record.active = active;
        }
        if let Some(tokens) = &self.tokens {
            record.tokens = Some(tokens.clone());
        }
        if let Some(client_info) = &self.client_info {
            record.client_info = Some(client_info.clone());
        }
        if let Some(pending) = &self.pending_auth {
            record.pending_auth = pending.clone();
        }
        if let Some(err) = &self.last_error {
            record.last_error = err.clone();
        }
        if let Some(name) = &self.server_name {
            record.server_name = name.clone();
        }
    }
}
