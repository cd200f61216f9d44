//! End-to-end lifecycle of a single connection: handshake, the
//! authorization round trip, discovery, tool calls, and teardown.

mod common;

use common::{
    ACCESS_TOKEN, AUTH_URL, GOOD_CODE, MockTransport, REFRESHED_TOKEN, harness, server_config,
};
use mcp_relay::client::{ConnectOutcome, ConnectionClient};
use mcp_relay::error::{AuthError, ConnectError, ToolCallError};
use mcp_relay::events::ConnectionEventKind;
use mcp_relay::session::{ConnectionState, OAuthTokens};
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn open_endpoint_connects_and_discovers_tools() {
    let h = harness(MockTransport::open());
    let client = ConnectionClient::create(
        h.deps.clone(),
        "u1",
        server_config("Open", "https://mcp.example.com/open"),
    )
    .await
    .unwrap();

    let outcome = client.connect().await.unwrap();
    let ConnectOutcome::Connected { tools } = outcome else {
        panic!("expected connected outcome");
    };
    assert_eq!(tools.len(), 2);
    assert_eq!(client.state().await, ConnectionState::Connected);

    // The transition was written through.
    let record = h
        .store
        .get_session("u1", client.session_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, ConnectionState::Connected);
    assert!(record.revision > 0);
}

#[tokio::test]
async fn connect_is_idempotent_while_connected() {
    let h = harness(MockTransport::open());
    let client = ConnectionClient::create(
        h.deps.clone(),
        "u1",
        server_config("Open", "https://mcp.example.com/open"),
    )
    .await
    .unwrap();

    client.connect().await.unwrap();
    let first = h.transport.initialize_count.load(Ordering::SeqCst);
    let outcome = client.connect().await.unwrap();
    assert!(matches!(outcome, ConnectOutcome::Connected { .. }));
    assert_eq!(h.transport.initialize_count.load(Ordering::SeqCst), first);
}

#[tokio::test]
async fn protected_endpoint_requires_authorization_then_connects() {
    let h = harness(MockTransport::protected(ACCESS_TOKEN));
    let client = ConnectionClient::create(
        h.deps.clone(),
        "u1",
        server_config("Protected", "https://mcp.example.com/protected"),
    )
    .await
    .unwrap();
    let mut events = h.events.subscribe("u1");

    let outcome = client.connect().await.unwrap();
    let ConnectOutcome::AuthRequired { auth_url } = outcome else {
        panic!("expected auth-required outcome");
    };
    assert_eq!(auth_url, AUTH_URL);
    assert_eq!(client.state().await, ConnectionState::Authenticating);

    // The round trip survives in the record.
    let record = h
        .store
        .get_session("u1", client.session_id())
        .await
        .unwrap()
        .unwrap();
    assert!(record.pending_auth.is_some());
    assert!(record.client_info.is_some());

    let outcome = client.finish_auth(GOOD_CODE, "st1").await.unwrap();
    assert!(matches!(outcome, ConnectOutcome::Connected { .. }));
    assert_eq!(client.state().await, ConnectionState::Connected);

    let record = h
        .store
        .get_session("u1", client.session_id())
        .await
        .unwrap()
        .unwrap();
    assert!(record.pending_auth.is_none());
    assert_eq!(record.tokens.unwrap().access_token, ACCESS_TOKEN);

    // The auth redirect went out on the event channel.
    let mut saw_auth_required = false;
    while let Ok(event) = events.try_recv() {
        if let ConnectionEventKind::AuthRequired { auth_url } = &event.kind {
            assert_eq!(auth_url, AUTH_URL);
            saw_auth_required = true;
        }
    }
    assert!(saw_auth_required);
}

#[tokio::test]
async fn finish_auth_rejects_a_state_mismatch() {
    let h = harness(MockTransport::protected(ACCESS_TOKEN));
    let client = ConnectionClient::create(
        h.deps.clone(),
        "u1",
        server_config("Protected", "https://mcp.example.com/protected"),
    )
    .await
    .unwrap();
    client.connect().await.unwrap();

    let err = client.finish_auth(GOOD_CODE, "forged").await.unwrap_err();
    assert!(matches!(
        err,
        ConnectError::Auth(AuthError::InvalidGrant(_))
    ));
    // No tokens were stored.
    let record = h
        .store
        .get_session("u1", client.session_id())
        .await
        .unwrap()
        .unwrap();
    assert!(record.tokens.is_none());
}

#[tokio::test]
async fn rejected_code_marks_the_session_failed() {
    let h = harness(MockTransport::protected(ACCESS_TOKEN));
    let client = ConnectionClient::create(
        h.deps.clone(),
        "u1",
        server_config("Protected", "https://mcp.example.com/protected"),
    )
    .await
    .unwrap();
    client.connect().await.unwrap();

    let err = client.finish_auth("bad-code", "st1").await.unwrap_err();
    assert!(matches!(err, ConnectError::Auth(_)));
    assert_eq!(client.state().await, ConnectionState::Failed);

    let record = h
        .store
        .get_session("u1", client.session_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, ConnectionState::Failed);
    assert!(record.last_error.is_some());
}

#[tokio::test]
async fn unreachable_endpoint_keeps_the_last_good_state() {
    let transport = MockTransport::open();
    transport.fail_initialize.store(true, Ordering::SeqCst);
    let h = harness(transport);
    let client = ConnectionClient::create(
        h.deps.clone(),
        "u1",
        server_config("Down", "https://mcp.example.com/down"),
    )
    .await
    .unwrap();

    // A first-occurrence transport error is retryable: the error is
    // surfaced and persisted, but the state machine stays put.
    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ConnectError::Transport(_)));
    assert_eq!(client.state().await, ConnectionState::Disconnected);

    let record = h
        .store
        .get_session("u1", client.session_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, ConnectionState::Disconnected);
    assert!(record.last_error.unwrap().contains("initialize failed"));

    // The endpoint comes back; the retry resumes from where it left off.
    h.transport.fail_initialize.store(false, Ordering::SeqCst);
    let outcome = client.connect().await.unwrap();
    assert!(matches!(outcome, ConnectOutcome::Connected { .. }));
    let record = h
        .store
        .get_session("u1", client.session_id())
        .await
        .unwrap()
        .unwrap();
    assert!(record.last_error.is_none());
}

#[tokio::test]
async fn resumed_session_reconnects_without_a_new_authorization() {
    let h = harness(MockTransport::protected(ACCESS_TOKEN));
    let client = ConnectionClient::create(
        h.deps.clone(),
        "u1",
        server_config("Protected", "https://mcp.example.com/protected"),
    )
    .await
    .unwrap();
    client.connect().await.unwrap();
    client.finish_auth(GOOD_CODE, "st1").await.unwrap();
    let begins = h.oauth.begin_count.load(Ordering::SeqCst);

    // A new process picks the record up from the store.
    let record = h
        .store
        .get_session("u1", client.session_id())
        .await
        .unwrap()
        .unwrap();
    let resumed = ConnectionClient::from_record(h.deps.clone(), record);
    assert_eq!(resumed.state().await, ConnectionState::Authenticated);
    assert!(resumed.tools().await.is_none());

    let outcome = resumed.connect().await.unwrap();
    assert!(matches!(outcome, ConnectOutcome::Connected { .. }));
    assert_eq!(h.oauth.begin_count.load(Ordering::SeqCst), begins);
}

#[tokio::test]
async fn call_tool_requires_a_connected_session() {
    let h = harness(MockTransport::open());
    let client = ConnectionClient::create(
        h.deps.clone(),
        "u1",
        server_config("Open", "https://mcp.example.com/open"),
    )
    .await
    .unwrap();

    let err = client
        .call_tool("search", serde_json::json!({}), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ToolCallError::NotConnected {
            state: ConnectionState::Disconnected
        }
    ));

    client.connect().await.unwrap();
    let outcome = client
        .call_tool(
            "search",
            serde_json::json!({ "query": "rust" }),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(!outcome.is_error);

    let calls = h.transport.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "search");
    assert_eq!(calls[0].1["query"], "rust");
}

#[tokio::test]
async fn cancellation_aborts_an_in_flight_tool_call() {
    let h = harness(MockTransport::open());
    let client = ConnectionClient::create(
        h.deps.clone(),
        "u1",
        server_config("Open", "https://mcp.example.com/open"),
    )
    .await
    .unwrap();
    client.connect().await.unwrap();
    h.transport.hang_calls.store(true, Ordering::SeqCst);

    let cancel = CancellationToken::new();
    let pending = client.call_tool("search", serde_json::json!({}), &cancel);
    tokio::pin!(pending);

    // Give the call a chance to start, then pull the plug.
    tokio::select! {
        _ = &mut pending => panic!("call resolved while hung"),
        _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => {}
    }
    cancel.cancel();
    let err = pending.await.unwrap_err();
    assert!(matches!(err, ToolCallError::Cancelled));
}

#[tokio::test]
async fn disconnect_removes_the_record_and_closes_remote() {
    let h = harness(MockTransport::open());
    let client = ConnectionClient::create(
        h.deps.clone(),
        "u1",
        server_config("Open", "https://mcp.example.com/open"),
    )
    .await
    .unwrap();
    client.connect().await.unwrap();
    let mut events = h.events.subscribe("u1");

    client.disconnect("user_disconnect").await.unwrap();
    assert_eq!(client.state().await, ConnectionState::Disconnected);
    assert!(h.transport.closed.load(Ordering::SeqCst));

    // The record is deleted outright, releasing the session id.
    assert!(
        h.store
            .get_session("u1", client.session_id())
            .await
            .unwrap()
            .is_none()
    );
    assert!(h.store.sessions_for_identity("u1").await.unwrap().is_empty());

    let event = events.recv().await.unwrap();
    assert!(matches!(
        event.kind,
        ConnectionEventKind::Disconnected { ref reason } if reason == "user_disconnect"
    ));

    // In-flight and future calls are refused.
    let err = client
        .call_tool("search", serde_json::json!({}), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ToolCallError::NotConnected { .. }));
}

#[tokio::test]
async fn state_transitions_are_published_in_order() {
    let h = harness(MockTransport::open());
    let client = ConnectionClient::create(
        h.deps.clone(),
        "u1",
        server_config("Open", "https://mcp.example.com/open"),
    )
    .await
    .unwrap();
    let mut events = h.events.subscribe("u1");

    client.connect().await.unwrap();

    let mut states = Vec::new();
    let mut saw_tools = false;
    while let Ok(event) = events.try_recv() {
        match event.kind {
            ConnectionEventKind::StateChanged { state } => states.push(state),
            ConnectionEventKind::ToolsDiscovered { tools } => {
                assert_eq!(tools.len(), 2);
                saw_tools = true;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Discovering,
            ConnectionState::Connected,
        ]
    );
    assert!(saw_tools);
}

#[tokio::test]
async fn list_tools_discovers_for_an_authenticated_session() {
    let h = harness(MockTransport::open());
    let client = ConnectionClient::create(
        h.deps.clone(),
        "u1",
        server_config("Open", "https://mcp.example.com/open"),
    )
    .await
    .unwrap();
    client.connect().await.unwrap();

    // A new process holds credentials but no live connection.
    let record = h
        .store
        .get_session("u1", client.session_id())
        .await
        .unwrap()
        .unwrap();
    let resumed = ConnectionClient::from_record(h.deps.clone(), record);
    assert_eq!(resumed.state().await, ConnectionState::Authenticated);
    assert!(resumed.tools().await.is_none());

    let tools = resumed.list_tools().await.unwrap();
    assert_eq!(tools.len(), 2);
    assert_eq!(resumed.state().await, ConnectionState::Connected);

    // The cache is warm now; another listing stays off the wire.
    let handshakes = h.transport.initialize_count.load(Ordering::SeqCst);
    resumed.list_tools().await.unwrap();
    assert_eq!(h.transport.initialize_count.load(Ordering::SeqCst), handshakes);
}

#[tokio::test]
async fn list_tools_requires_an_authenticated_session() {
    let h = harness(MockTransport::open());
    let client = ConnectionClient::create(
        h.deps.clone(),
        "u1",
        server_config("Open", "https://mcp.example.com/open"),
    )
    .await
    .unwrap();

    let err = client.list_tools().await.unwrap_err();
    assert!(matches!(
        err,
        ConnectError::NotConnected {
            state: ConnectionState::Disconnected
        }
    ));
    assert_eq!(h.transport.initialize_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn expired_tokens_are_refreshed_once_and_persisted() {
    let h = harness(MockTransport::protected(REFRESHED_TOKEN));
    let client = ConnectionClient::create(
        h.deps.clone(),
        "u1",
        server_config("Protected", "https://mcp.example.com/protected"),
    )
    .await
    .unwrap();
    // The auth-required round trip registers the OAuth client.
    client.connect().await.unwrap();

    // Stored credentials whose access token already lapsed.
    h.deps
        .credentials
        .put_tokens(
            "u1",
            client.session_id(),
            &OAuthTokens {
                access_token: "stale".to_string(),
                refresh_token: Some("refresh-1".to_string()),
                expires_at: Some(1),
            },
        )
        .await
        .unwrap();

    let tokens = client.valid_tokens().await.unwrap().unwrap();
    assert_eq!(tokens.access_token, REFRESHED_TOKEN);
    assert_eq!(h.oauth.refresh_count.load(Ordering::SeqCst), 1);

    // The refreshed set was written through.
    let record = h
        .store
        .get_session("u1", client.session_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.tokens.unwrap().access_token, REFRESHED_TOKEN);

    // An immediate second call serves the fresh set without the network.
    let again = client.valid_tokens().await.unwrap().unwrap();
    assert_eq!(again.access_token, REFRESHED_TOKEN);
    assert_eq!(h.oauth.refresh_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_refresh_forces_the_session_failed() {
    let h = harness(MockTransport::protected(ACCESS_TOKEN));
    let client = ConnectionClient::create(
        h.deps.clone(),
        "u1",
        server_config("Protected", "https://mcp.example.com/protected"),
    )
    .await
    .unwrap();
    client.connect().await.unwrap();
    client.finish_auth(GOOD_CODE, "st1").await.unwrap();
    let begins = h.oauth.begin_count.load(Ordering::SeqCst);

    // The stored credentials expire and their refresh token is dead.
    h.deps
        .credentials
        .put_tokens(
            "u1",
            client.session_id(),
            &OAuthTokens {
                access_token: "stale".to_string(),
                refresh_token: Some("refresh-dead".to_string()),
                expires_at: Some(1),
            },
        )
        .await
        .unwrap();

    let record = h
        .store
        .get_session("u1", client.session_id())
        .await
        .unwrap()
        .unwrap();
    let resumed = ConnectionClient::from_record(h.deps.clone(), record);

    let err = resumed.connect().await.unwrap_err();
    assert!(matches!(
        err,
        ConnectError::Auth(AuthError::RefreshFailed(_))
    ));
    assert_eq!(resumed.state().await, ConnectionState::Failed);

    // Terminal: persisted, and no authorization round trip was started
    // behind the caller's back.
    let record = h
        .store
        .get_session("u1", resumed.session_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, ConnectionState::Failed);
    assert!(record.last_error.unwrap().contains("token refresh failed"));
    assert_eq!(h.oauth.begin_count.load(Ordering::SeqCst), begins);
}

#[tokio::test]
async fn validate_rechecks_a_live_connection_without_a_handshake() {
    let h = harness(MockTransport::open());
    let client = ConnectionClient::create(
        h.deps.clone(),
        "u1",
        server_config("Open", "https://mcp.example.com/open"),
    )
    .await
    .unwrap();
    client.connect().await.unwrap();
    let handshakes = h.transport.initialize_count.load(Ordering::SeqCst);

    let outcome = client.validate().await.unwrap();
    assert!(matches!(outcome, ConnectOutcome::Connected { .. }));
    assert_eq!(client.state().await, ConnectionState::Connected);
    assert_eq!(h.transport.initialize_count.load(Ordering::SeqCst), handshakes);
}

#[tokio::test]
async fn resumed_sessions_revalidate_before_being_trusted() {
    let h = harness(MockTransport::open());
    let client = ConnectionClient::create(
        h.deps.clone(),
        "u1",
        server_config("Open", "https://mcp.example.com/open"),
    )
    .await
    .unwrap();
    client.connect().await.unwrap();

    let record = h
        .store
        .get_session("u1", client.session_id())
        .await
        .unwrap()
        .unwrap();
    let resumed = ConnectionClient::from_record(h.deps.clone(), record);
    let mut events = h.events.subscribe("u1");

    let outcome = resumed.validate().await.unwrap();
    assert!(matches!(outcome, ConnectOutcome::Connected { .. }));

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ConnectionEventKind::StateChanged { state } = event.kind {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![
            ConnectionState::Reconnecting,
            ConnectionState::Discovering,
            ConnectionState::Connected,
        ]
    );
}
