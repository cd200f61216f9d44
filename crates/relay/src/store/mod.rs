//! Durable, TTL-bounded session persistence with identity-scoped indexing.
//!
//! Every backend satisfies one contract with identical observable behavior:
//! reads never return an expired record (lazy or eager expiry both count),
//! listing never returns an inactive record, and updates are shallow merges
//! that may be made conditional on the record revision.

use crate::error::StoreError;
use crate::session::{SessionPatch, SessionRecord};
use async_trait::async_trait;

pub mod file;
pub mod memory;
pub mod sqlite;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Reference key layout, used verbatim by the file backend.
pub fn session_key(session_id: &str) -> String {
    format!("mcp:session:{session_id}")
}

pub fn identity_key(identity: &str) -> String {
    format!("mcp:user:{identity}:sessions")
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new record. `ttl_secs` defaults to 12 hours when absent.
    /// Fails with [`StoreError::DuplicateSession`] if the id already exists.
    async fn create_session(
        &self,
        record: &SessionRecord,
        ttl_secs: Option<u64>,
    ) -> Result<(), StoreError>;

    /// Shallow-merge `patch` into the record for `(identity, session_id)`.
    ///
    /// - Fails with [`StoreError::NotFound`] if no matching live record.
    /// - When `expected_revision` is given, fails with
    ///   [`StoreError::RevisionConflict`] if the stored revision differs;
    ///   callers reload and re-apply the merge.
    /// - Resets the TTL when `ttl_secs` is given.
    ///
    /// Returns the record after the merge (revision bumped).
    async fn update_session(
        &self,
        identity: &str,
        session_id: &str,
        patch: SessionPatch,
        expected_revision: Option<u64>,
        ttl_secs: Option<u64>,
    ) -> Result<SessionRecord, StoreError>;

    /// Point lookup. Absent or expired records yield `None`, never an error.
    async fn get_session(
        &self,
        identity: &str,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// All non-expired, active records for an identity. Records marked
    /// `active = false` are never returned here.
    async fn sessions_for_identity(
        &self,
        identity: &str,
    ) -> Result<Vec<SessionRecord>, StoreError>;

    /// All non-expired session ids for an identity, inactive included (this
    /// is the index the aggregator prunes from).
    async fn session_ids_for_identity(&self, identity: &str) -> Result<Vec<String>, StoreError>;

    /// Idempotent delete; removing a nonexistent session is not an error.
    async fn remove_session(&self, identity: &str, session_id: &str) -> Result<(), StoreError>;

    /// Explicit sweep for backends without native TTL support. Returns the
    /// number of records removed; a no-op is acceptable where the substrate
    /// expires natively.
    async fn cleanup_expired_sessions(&self) -> Result<u64, StoreError>;

    /// Collision-resistant opaque identifier: 32 alphanumeric chars
    /// (~190 bits of entropy).
    fn generate_session_id(&self) -> String {
        use rand::Rng as _;
        rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(32)
            .map(char::from)
            .collect()
    }
}

pub(crate) fn effective_ttl_secs(ttl_secs: Option<u64>) -> u64 {
    ttl_secs.unwrap_or(crate::session::DEFAULT_SESSION_TTL_SECS)
}

/// A record is unreadable once `now >= expires_at`; `ttl_secs = 0` is
/// therefore expired immediately.
pub(crate) fn is_expired(expires_at: u64, now: u64) -> bool {
    now >= expires_at
}
