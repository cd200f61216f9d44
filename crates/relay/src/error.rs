use crate::session::ConnectionState;
use thiserror::Error;

/// Storage backend failures. Constraint violations are typed; everything
/// substrate-specific is carried as `Backend` and propagated unmodified.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session {0} already exists")]
    DuplicateSession(String),
    #[error("session {session_id} not found for identity {identity}")]
    NotFound {
        identity: String,
        session_id: String,
    },
    #[error("revision conflict on session {session_id}: expected {expected}, found {found}")]
    RevisionConflict {
        session_id: String,
        expected: u64,
        found: u64,
    },
    #[error("storage backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

impl StoreError {
    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        Self::Backend(err.into())
    }
}

/// OAuth failures. `InvalidGrant` and `RefreshFailed` are terminal for the
/// session; the rest are surfaced to the caller for a user-driven retry.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authorization code rejected: {0}")]
    InvalidGrant(String),
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("authorization server metadata discovery failed: {0}")]
    Discovery(String),
    #[error("dynamic client registration failed: {0}")]
    Registration(String),
    #[error("auth transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Outbound MCP transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote endpoint answered 401: OAuth is required. Control flow,
    /// not a fault.
    #[error("remote endpoint requires authorization")]
    Unauthorized,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Connection lifecycle failures, as seen by `ConnectionClient` callers.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Retryable: the session keeps its last good state, so a later
    /// `connect` resumes from there.
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("session is {state:?}; operation requires an established connection")]
    NotConnected { state: ConnectionState },
    #[error("no session with id {0}")]
    UnknownSession(String),
    #[error("no credentials stored for this session")]
    NoCredentials,
    #[error("server config is missing {0}")]
    MissingConfig(&'static str),
}

/// Tool invocation failures. Remote tool errors are NOT here: they come back
/// as data (`ToolCallOutcome { is_error: true, .. }`) so agent callers can
/// feed them into their own control flow.
#[derive(Debug, Error)]
pub enum ToolCallError {
    #[error("session is {state:?}; tools/call requires a connected session")]
    NotConnected { state: ConnectionState },
    #[error("tool call cancelled")]
    Cancelled,
    #[error("transport error: {0}")]
    Transport(String),
}
