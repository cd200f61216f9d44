use super::{SessionStore, effective_ttl_secs, identity_key, is_expired, session_key};
use crate::error::StoreError;
use crate::session::{SessionPatch, SessionRecord, unix_now_secs};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Flat-file backend: one JSON document using the reference key layout
/// (`mcp:session:{id}` records, `mcp:user:{identity}:sessions` index).
/// Every mutation rewrites the document atomically (temp file + rename).
pub struct FileStore {
    path: PathBuf,
    doc: Mutex<Document>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    /// Keyed by `mcp:session:{id}`.
    #[serde(default)]
    sessions: BTreeMap<String, StoredEntry>,
    /// Keyed by `mcp:user:{identity}:sessions`; values are session ids.
    #[serde(default)]
    identities: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    record: SessionRecord,
    expires_at: u64,
}

impl FileStore {
    /// Load from `path`, creating an empty document if the file is absent.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let doc = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(StoreError::backend)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Document::default(),
            Err(e) => return Err(StoreError::backend(e)),
        };
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    async fn flush(&self, doc: &Document) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(doc).map_err(StoreError::backend)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(StoreError::backend)?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(StoreError::backend)
    }
}

impl Document {
    fn drop_session(&mut self, session_id: &str) {
        if let Some(entry) = self.sessions.remove(&session_key(session_id)) {
            let ikey = identity_key(&entry.record.identity);
            if let Some(ids) = self.identities.get_mut(&ikey) {
                ids.remove(session_id);
                if ids.is_empty() {
                    self.identities.remove(&ikey);
                }
            }
        }
    }

    fn live_entry(&mut self, session_id: &str, now: u64) -> Option<&mut StoredEntry> {
        let key = session_key(session_id);
        let expired = self
            .sessions
            .get(&key)
            .is_some_and(|e| is_expired(e.expires_at, now));
        if expired {
            self.drop_session(session_id);
            return None;
        }
        self.sessions.get_mut(&key)
    }
}

#[async_trait]
impl SessionStore for FileStore {
    async fn create_session(
        &self,
        record: &SessionRecord,
        ttl_secs: Option<u64>,
    ) -> Result<(), StoreError> {
        let now = unix_now_secs();
        let mut doc = self.doc.lock().await;
        if doc.live_entry(&record.session_id, now).is_some() {
            return Err(StoreError::DuplicateSession(record.session_id.clone()));
        }
        doc.identities
            .entry(identity_key(&record.identity))
            .or_default()
            .insert(record.session_id.clone());
        doc.sessions.insert(
            session_key(&record.session_id),
            StoredEntry {
                record: record.clone(),
                expires_at: now.saturating_add(effective_ttl_secs(ttl_secs)),
            },
        );
        self.flush(&doc).await
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
        let mut doc = self.doc.lock().await;
        let updated = {
            let Some(entry) = doc.live_entry(session_id, now) else {
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
            entry.record.clone()
        };
        self.flush(&doc).await?;
        Ok(updated)
    }

    async fn get_session(
        &self,
        identity: &str,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let now = unix_now_secs();
        let mut doc = self.doc.lock().await;
        Ok(doc
            .live_entry(session_id, now)
            .filter(|e| e.record.identity == identity)
            .map(|e| e.record.clone()))
    }

    async fn sessions_for_identity(
        &self,
        identity: &str,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        let now = unix_now_secs();
        let mut doc = self.doc.lock().await;
        let ids: Vec<String> = doc
            .identities
            .get(&identity_key(identity))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        let mut out = Vec::new();
        for id in ids {
            if let Some(entry) = doc.live_entry(&id, now)
                && entry.record.active
            {
                out.push(entry.record.clone());
            }
        }
        Ok(out)
    }

    async fn session_ids_for_identity(&self, identity: &str) -> Result<Vec<String>, StoreError> {
        let now = unix_now_secs();
        let mut doc = self.doc.lock().await;
        let ids: Vec<String> = doc
            .identities
            .get(&identity_key(identity))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        Ok(ids
            .into_iter()
            .filter(|id| doc.live_entry(id, now).is_some())
            .collect())
    }

    async fn remove_session(&self, identity: &str, session_id: &str) -> Result<(), StoreError> {
        let mut doc = self.doc.lock().await;
        let matches = doc
            .sessions
            .get(&session_key(session_id))
            .is_some_and(|e| e.record.identity == identity);
        if matches {
            doc.drop_session(session_id);
            self.flush(&doc).await?;
        }
        Ok(())
    }

    async fn cleanup_expired_sessions(&self) -> Result<u64, StoreError> {
        let now = unix_now_secs();
        let mut doc = self.doc.lock().await;
        let expired: Vec<String> = doc
            .sessions
            .values()
            .filter(|e| is_expired(e.expires_at, now))
            .map(|e| e.record.session_id.clone())
            .collect();
        let removed = expired.len() as u64;
        for id in &expired {
            doc.drop_session(id);
        }
        if removed > 0 {
            self.flush(&doc).await?;
        }
        Ok(removed)
    }
}
