//! Scripted transport and OAuth doubles shared by the integration tests.

use async_trait::async_trait;
use mcp_relay::client::ClientDeps;
use mcp_relay::credentials::SessionCredentialStore;
use mcp_relay::error::{AuthError, TransportError};
use mcp_relay::events::EventBus;
use mcp_relay::oauth::{AuthorizationRequest, OAuthFlow};
use mcp_relay::session::{
    ClientRegistration, OAuthTokens, PendingAuth, ServerConfig, ToolInfo, TransportType,
};
use mcp_relay::store::{MemoryStore, SessionStore};
use mcp_relay::transport::{Endpoint, McpTransport, RemoteSession, ToolCallOutcome};
use serde_json::Value;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub const ACCESS_TOKEN: &str = "access-token-1";
pub const REFRESHED_TOKEN: &str = "access-token-2";
pub const AUTH_URL: &str = "https://auth.example.com/authorize?state=st1";
pub const GOOD_CODE: &str = "auth-code-ok";

pub fn sample_tools() -> Vec<ToolInfo> {
    vec![
        ToolInfo {
            name: "search".to_string(),
            description: Some("Full-text search".to_string()),
            input_schema: serde_json::json!({ "type": "object" }),
        },
        ToolInfo {
            name: "fetch".to_string(),
            description: None,
            input_schema: serde_json::json!({ "type": "object" }),
        },
    ]
}

pub fn server_config(name: &str, url: &str) -> ServerConfig {
    ServerConfig {
        server_name: name.to_string(),
        server_url: url.to_string(),
        callback_url: "https://relay.example.com/callback".to_string(),
        transport_type: TransportType::StreamableHttp,
    }
}

/// In-memory endpoint double. When `required_bearer` is set, every wire
/// operation answers Unauthorized until that exact token shows up.
pub struct MockTransport {
    pub required_bearer: Option<String>,
    pub tools: Mutex<Vec<ToolInfo>>,
    pub fail_initialize: AtomicBool,
    pub fail_list_tools: AtomicBool,
    /// When set, tool calls never resolve; lets tests race cancellation.
    pub hang_calls: AtomicBool,
    pub initialize_count: AtomicUsize,
    pub calls: Mutex<Vec<(String, Value)>>,
    pub closed: AtomicBool,
}

impl MockTransport {
    pub fn open() -> Self {
        Self::with_bearer(None)
    }

    pub fn protected(token: &str) -> Self {
        Self::with_bearer(Some(token.to_string()))
    }

    fn with_bearer(required_bearer: Option<String>) -> Self {
        Self {
            required_bearer,
            tools: Mutex::new(sample_tools()),
            fail_initialize: AtomicBool::new(false),
            fail_list_tools: AtomicBool::new(false),
            hang_calls: AtomicBool::new(false),
            initialize_count: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn check_auth(&self, endpoint: &Endpoint<'_>) -> Result<(), TransportError> {
        match &self.required_bearer {
            Some(required) if endpoint.bearer != Some(required.as_str()) => {
                Err(TransportError::Unauthorized)
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl McpTransport for MockTransport {
    async fn initialize(&self, endpoint: Endpoint<'_>) -> Result<RemoteSession, TransportError> {
        self.initialize_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(TransportError::Protocol("endpoint unreachable".to_string()));
        }
        self.check_auth(&endpoint)?;
        Ok(RemoteSession {
            session_id: Some("remote-1".to_string()),
            protocol_version: rmcp::model::ProtocolVersion::default(),
            server_name: Some("Mock Endpoint".to_string()),
        })
    }

    async fn list_tools(&self, endpoint: Endpoint<'_>) -> Result<Vec<ToolInfo>, TransportError> {
        if self.fail_list_tools.load(Ordering::SeqCst) {
            return Err(TransportError::Protocol("tools/list failed".to_string()));
        }
        self.check_auth(&endpoint)?;
        Ok(self.tools.lock().unwrap().clone())
    }

    async fn call_tool(
        &self,
        endpoint: Endpoint<'_>,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallOutcome, TransportError> {
        self.check_auth(&endpoint)?;
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments));
        if self.hang_calls.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        Ok(ToolCallOutcome {
            is_error: false,
            content: vec![serde_json::json!({ "type": "text", "text": "ok" })],
        })
    }

    async fn close(&self, _endpoint: Endpoint<'_>) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Scripted authorization server: one auth URL, one pending round trip,
/// one good code.
pub struct MockOAuth {
    pub begin_count: AtomicUsize,
    pub refresh_count: AtomicUsize,
}

impl MockOAuth {
    pub fn new() -> Self {
        Self {
            begin_count: AtomicUsize::new(0),
            refresh_count: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl OAuthFlow for MockOAuth {
    async fn begin(
        &self,
        _server_url: &str,
        _callback_url: &str,
        client: Option<ClientRegistration>,
    ) -> Result<AuthorizationRequest, AuthError> {
        self.begin_count.fetch_add(1, Ordering::SeqCst);
        Ok(AuthorizationRequest {
            auth_url: AUTH_URL.to_string(),
            pending: PendingAuth {
                code_verifier: "verifier-1".to_string(),
                state: "st1".to_string(),
            },
            client: client.unwrap_or(ClientRegistration {
                client_id: "client-1".to_string(),
                client_secret: None,
                token_endpoint: "https://auth.example.com/token".to_string(),
            }),
        })
    }

    async fn exchange(
        &self,
        _client: &ClientRegistration,
        _callback_url: &str,
        _pending: &PendingAuth,
        code: &str,
    ) -> Result<OAuthTokens, AuthError> {
        if code != GOOD_CODE {
            return Err(AuthError::InvalidGrant("code rejected".to_string()));
        }
        Ok(OAuthTokens {
            access_token: ACCESS_TOKEN.to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_at: None,
        })
    }

    async fn refresh(
        &self,
        _client: &ClientRegistration,
        refresh_token: &str,
    ) -> Result<OAuthTokens, AuthError> {
        self.refresh_count.fetch_add(1, Ordering::SeqCst);
        if refresh_token != "refresh-1" {
            return Err(AuthError::RefreshFailed("unknown refresh token".to_string()));
        }
        Ok(OAuthTokens {
            access_token: REFRESHED_TOKEN.to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_at: None,
        })
    }
}

pub struct TestHarness {
    pub deps: ClientDeps,
    pub store: Arc<dyn SessionStore>,
    pub transport: Arc<MockTransport>,
    pub oauth: Arc<MockOAuth>,
    pub events: Arc<EventBus>,
}

pub fn harness(transport: MockTransport) -> TestHarness {
    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    let transport = Arc::new(transport);
    let oauth = Arc::new(MockOAuth::new());
    let events = Arc::new(EventBus::default());
    let deps = ClientDeps {
        store: Arc::clone(&store),
        credentials: Arc::new(SessionCredentialStore::new(Arc::clone(&store))),
        oauth: Arc::clone(&oauth) as Arc<dyn OAuthFlow>,
        transport: Arc::clone(&transport) as Arc<dyn McpTransport>,
        events: Arc::clone(&events),
        ttl_secs: None,
    };
    TestHarness {
        deps,
        store,
        transport,
        oauth,
        events,
    }
}
