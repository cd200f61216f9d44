//! Identity-scoped fan-out over many sessions.
//!
//! The aggregator owns every live `ConnectionClient` for one identity,
//! resumes clients from persisted records, and presents the combined tool
//! surface under stable per-session labels.

use crate::client::{ClientDeps, ConnectOutcome, ConnectionClient};
use crate::error::ConnectError;
use crate::session::{ConnectionState, ServerConfig, ToolInfo};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// One session's slice of the aggregated tool surface.
#[derive(Debug, Clone)]
pub struct LabeledSession {
    pub label: String,
    pub session_id: String,
    pub server_name: String,
    pub state: ConnectionState,
    pub tools: Vec<ToolInfo>,
}

pub struct SessionAggregator {
    identity: String,
    deps: ClientDeps,
    clients: RwLock<HashMap<String, Arc<ConnectionClient>>>,
}

impl SessionAggregator {
    pub fn new(deps: ClientDeps, identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            deps,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Connect to a new endpoint, or coalesce onto the existing session
    /// when one already targets the same endpoint URL.
    pub async fn connect_new(
        &self,
        config: ServerConfig,
    ) -> Result<(Arc<ConnectionClient>, ConnectOutcome), ConnectError> {
        let server_id = config.server_id();
        if let Some(existing) = self.client_for_server(&server_id).await {
            let outcome = existing.connect().await?;
            return Ok((existing, outcome));
        }

        let client = Arc::new(ConnectionClient::create(self.deps.clone(), &self.identity, config).await?);
        self.clients
            .write()
            .await
            .insert(client.session_id().to_string(), Arc::clone(&client));
        let outcome = client.connect().await?;
        Ok((client, outcome))
    }

    /// Resume every persisted session for this identity and revalidate them
    /// concurrently. Failures are per-session; one endpoint being down
    /// never blocks the others, but its session is persisted as failed and
    /// stops being offered. Inactive leftovers found in the identity index
    /// are pruned from the store on the way through.
    pub async fn connect_all(&self) -> Vec<(String, Result<ConnectOutcome, ConnectError>)> {
        if let Err(e) = self.prune_inactive().await {
            tracing::warn!(identity = %self.identity, error = %e, "session prune failed");
        }

        let clients = match self.resume_clients().await {
            Ok(clients) => clients,
            Err(e) => {
                tracing::warn!(identity = %self.identity, error = %e, "session listing failed");
                return Vec::new();
            }
        };

        let attempts = clients.iter().map(|client| {
            let client = Arc::clone(client);
            async move {
                let result = client.validate().await;
                if let Err(e) = &result {
                    tracing::warn!(
                        session_id = %client.session_id(),
                        error = %e,
                        "session validation failed"
                    );
                    // Transport errors are retryable one-by-one, but a
                    // fan-out failure sticks until an explicit reconnect.
                    if matches!(e, ConnectError::Transport(_))
                        && let Err(persist) = client.mark_failed(&e.to_string()).await
                    {
                        tracing::warn!(
                            session_id = %client.session_id(),
                            error = %persist,
                            "failed to persist session failure"
                        );
                    }
                }
                (client.session_id().to_string(), result)
            }
        });
        join_all(attempts).await
    }

    /// All live clients, ordered by session id.
    pub async fn clients(&self) -> Vec<Arc<ConnectionClient>> {
        let clients = self.clients.read().await;
        let mut out: Vec<_> = clients.values().cloned().collect();
        out.sort_by(|a, b| a.session_id().cmp(b.session_id()));
        out
    }

    /// Client for one session, resuming it from the store when this
    /// aggregator has not seen it yet.
    pub async fn client_for(&self, session_id: &str) -> Result<Arc<ConnectionClient>, ConnectError> {
        if let Some(client) = self.clients.read().await.get(session_id) {
            return Ok(Arc::clone(client));
        }
        let Some(record) = self.deps.store.get_session(&self.identity, session_id).await? else {
            return Err(ConnectError::UnknownSession(session_id.to_string()));
        };
        if !record.active {
            return Err(ConnectError::UnknownSession(session_id.to_string()));
        }
        let client = Arc::new(ConnectionClient::from_record(self.deps.clone(), record));
        let mut clients = self.clients.write().await;
        // Another caller may have raced the resume; keep the first one.
        let entry = clients
            .entry(session_id.to_string())
            .or_insert(client);
        Ok(Arc::clone(entry))
    }

    pub async fn finish_auth(
        &self,
        session_id: &str,
        code: &str,
        state: &str,
    ) -> Result<ConnectOutcome, ConnectError> {
        let client = self.client_for(session_id).await?;
        client.finish_auth(code, state).await
    }

    /// Disconnect one session and drop it from the aggregate; the record
    /// is deleted from the store.
    pub async fn disconnect(&self, session_id: &str, reason: &str) -> Result<(), ConnectError> {
        let client = self.client_for(session_id).await?;
        client.disconnect(reason).await?;
        self.clients.write().await.remove(session_id);
        Ok(())
    }

    /// The combined tool surface: one labeled slice per live session, in
    /// session-id order. Labels are derived from server names; a collision
    /// takes the first numeric suffix not already claimed by any label, so
    /// equal inputs always yield equal labels.
    pub async fn tool_index(&self) -> Vec<LabeledSession> {
        let clients = self.clients().await;
        let mut taken: HashSet<String> = HashSet::new();
        let mut out = Vec::with_capacity(clients.len());
        for client in clients {
            let base = sanitize_label(&client.server_config().server_name);
            let mut label = base.clone();
            let mut n = 1u32;
            while !taken.insert(label.clone()) {
                n += 1;
                label = format!("{base}_{n}");
            }
            out.push(LabeledSession {
                label,
                session_id: client.session_id().to_string(),
                server_name: client.server_config().server_name.clone(),
                state: client.state().await,
                tools: client.tools().await.unwrap_or_default(),
            });
        }
        out
    }

    /// Resolve a label from [`tool_index`](Self::tool_index) back to its client.
    pub async fn client_by_label(&self, label: &str) -> Result<Arc<ConnectionClient>, ConnectError> {
        for entry in self.tool_index().await {
            if entry.label == label {
                return self.client_for(&entry.session_id).await;
            }
        }
        Err(ConnectError::UnknownSession(label.to_string()))
    }

    async fn client_for_server(&self, server_id: &str) -> Option<Arc<ConnectionClient>> {
        let clients = self.clients.read().await;
        clients
            .values()
            .find(|c| c.server_config().server_id() == server_id)
            .cloned()
    }

    /// Build clients for persisted records this aggregator does not hold yet.
    async fn resume_clients(&self) -> Result<Vec<Arc<ConnectionClient>>, ConnectError> {
        let records = self.deps.store.sessions_for_identity(&self.identity).await?;
        let mut clients = self.clients.write().await;
        for record in records {
            clients
                .entry(record.session_id.clone())
                .or_insert_with(|| {
                    Arc::new(ConnectionClient::from_record(self.deps.clone(), record))
                });
        }
        Ok(clients.values().cloned().collect())
    }

    /// Remove index entries whose record is gone or marked inactive.
    async fn prune_inactive(&self) -> Result<(), ConnectError> {
        let ids = self.deps.store.session_ids_for_identity(&self.identity).await?;
        for session_id in ids {
            let live = self
                .deps
                .store
                .get_session(&self.identity, &session_id)
                .await?
                .is_some_and(|r| r.active);
            if !live {
                self.deps
                    .store
                    .remove_session(&self.identity, &session_id)
                    .await?;
                self.clients.write().await.remove(&session_id);
            }
        }
        Ok(())
    }
}

/// Collapse a server name to a `[a-z0-9_]` label. Labels must start with a
/// letter; anything else is prefixed with `s_`.
pub fn sanitize_label(name: &str) -> String {
    let mut label: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    while label.contains("__") {
        label = label.replace("__", "_");
    }
    let label = label.trim_matches('_').to_string();
    if label.is_empty() {
        return "server".to_string();
    }
    if !label.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return format!("s_{label}");
    }
    label
}
