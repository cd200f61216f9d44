use super::{SessionStore, effective_ttl_secs, is_expired};
use crate::error::StoreError;
use crate::session::{SessionPatch, SessionRecord, unix_now_secs};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

/// Volatile in-memory backend. Expiry is lazy on read plus an explicit
/// sweep; suitable for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Entry>,
    identity_index: HashMap<String, BTreeSet<String>>,
}

struct Entry {
    record: SessionRecord,
    expires_at: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn drop_session(&mut self, session_id: &str) {
        if let Some(entry) = self.sessions.remove(session_id) {
            if let Some(ids) = self.identity_index.get_mut(&entry.record.identity) {
                ids.remove(session_id);
                if ids.is_empty() {
                    self.identity_index.remove(&entry.record.identity);
                }
            }
        }
    }

    /// Returns the live entry, dropping it if expired.
    fn live_entry(&mut self, session_id: &str, now: u64) -> Option<&mut Entry> {
        let expired = self
            .sessions
            .get(session_id)
            .is_some_and(|e| is_expired(e.expires_at, now));
        if expired {
            self.drop_session(session_id);
            return None;
        }
        self.sessions.get_mut(session_id)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(
        &self,
        record: &SessionRecord,
        ttl_secs: Option<u64>,
    ) -> Result<(), StoreError> {
        let now = unix_now_secs();
        let mut inner = self.inner.write().await;
        if inner.live_entry(&record.session_id, now).is_some() {
            return Err(StoreError::DuplicateSession(record.session_id.clone()));
        }
        inner
            .identity_index
            .entry(record.identity.clone())
            .or_default()
            .insert(record.session_id.clone());
        inner.sessions.insert(
            record.session_id.clone(),
            Entry {
                record: record.clone(),
                expires_at: now.saturating_add(effective_ttl_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn update_session(
        &self,
        identity: &str,
        session_id: &str,
        patch: SessionPatch,
        expected_revision: Option<u64>,
        ttl_secs: Option<u64>,
    ) -> Result<SessionRecord, StoreError> {
        let now = unix_now_secs();
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.live_entry(session_id, now) else {
            return Err(StoreError::NotFound {
                identity: identity.to_string(),
                session_id: session_id.to_string(),
            });
        };
        if entry.record.identity != identity {
            return Err(StoreError::NotFound {
                identity: identity.to_string(),
                session_id: session_id.to_string(),
            });
        }
        if let Some(expected) = expected_revision
            && entry.record.revision != expected
        {
            return Err(StoreError::RevisionConflict {
                session_id: session_id.to_string(),
                expected,
                found: entry.record.revision,
            });
        }
        patch.apply(&mut entry.record);
        entry.record.revision += 1;
        if let Some(ttl) = ttl_secs {
            entry.expires_at = now.saturating_add(ttl);
        }
        Ok(entry.record.clone())
    }

    async fn get_session(
        &self,
        identity: &str,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let now = unix_now_secs();
        let mut inner = self.inner.write().await;
        Ok(inner
            .live_entry(session_id, now)
            .filter(|e| e.record.identity == identity)
            .map(|e| e.record.clone()))
    }

    async fn sessions_for_identity(
        &self,
        identity: &str,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        let now = unix_now_secs();
        let mut inner = self.inner.write().await;
        let ids: Vec<String> = inner
            .identity_index
            .get(identity)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        let mut out = Vec::new();
        for id in ids {
            if let Some(entry) = inner.live_entry(&id, now)
                && entry.record.active
            {
                out.push(entry.record.clone());
            }
        }
        Ok(out)
    }

    async fn session_ids_for_identity(&self, identity: &str) -> Result<Vec<String>, StoreError> {
        let now = unix_now_secs();
        let mut inner = self.inner.write().await;
        let ids: Vec<String> = inner
            .identity_index
            .get(identity)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        Ok(ids
            .into_iter()
            .filter(|id| inner.live_entry(id, now).is_some())
            .collect())
    }

    async fn remove_session(&self, identity: &str, session_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let matches = inner
            .sessions
            .get(session_id)
            .is_some_and(|e| e.record.identity == identity);
        if matches {
            inner.drop_session(session_id);
        }
        Ok(())
    }

    async fn cleanup_expired_sessions(&self) -> Result<u64, StoreError> {
        let now = unix_now_secs();
        let mut inner = self.inner.write().await;
        let expired: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, e)| is_expired(e.expires_at, now))
            .map(|(id, _)| id.clone())
            .collect();
        let removed = expired.len() as u64;
        for id in expired {
            inner.drop_session(&id);
        }
        Ok(removed)
    }
}
