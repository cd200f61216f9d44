use crate::error::AuthError;
use crate::session::{ClientRegistration, OAuthTokens, PendingAuth, unix_now_secs};
use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use sha2::{Digest as _, Sha256};

const CLIENT_NAME: &str = "mcp-relay";

/// Everything `finish_auth` needs later, produced by [`OAuthFlow::begin`].
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    /// Where the user must be redirected.
    pub auth_url: String,
    pub pending: PendingAuth,
    pub client: ClientRegistration,
}

/// The OAuth round trips a connection client drives. A trait so tests can
/// script the flow without a network.
#[async_trait]
pub trait OAuthFlow: Send + Sync {
    /// Discover the authorization server, ensure a registered client
    /// (reusing `client` when already registered), and build the redirect.
    async fn begin(
        &self,
        server_url: &str,
        callback_url: &str,
        client: Option<ClientRegistration>,
    ) -> Result<AuthorizationRequest, AuthError>;

    /// Exchange an authorization code for tokens.
    async fn exchange(
        &self,
        client: &ClientRegistration,
        callback_url: &str,
        pending: &PendingAuth,
        code: &str,
    ) -> Result<OAuthTokens, AuthError>;

    /// Redeem a refresh token for a fresh token set.
    async fn refresh(
        &self,
        client: &ClientRegistration,
        refresh_token: &str,
    ) -> Result<OAuthTokens, AuthError>;
}

#[derive(Debug, Clone, Deserialize)]
struct AuthServerMetadata {
    authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    registration_endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl TokenResponse {
    fn into_tokens(self, previous_refresh: Option<&str>) -> OAuthTokens {
        OAuthTokens {
            access_token: self.access_token,
            // Servers may omit the refresh token on rotation; keep the old one.
            refresh_token: self
                .refresh_token
                .or_else(|| previous_refresh.map(str::to_string)),
            expires_at: self.expires_in.map(|s| unix_now_secs().saturating_add(s)),
        }
    }
}

/// RFC 8414 discovery + RFC 7591 dynamic registration + PKCE (S256).
pub struct HttpOAuthFlow {
    http: reqwest::Client,
}

impl HttpOAuthFlow {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn discover(&self, server_url: &str) -> Result<AuthServerMetadata, AuthError> {
        let base = reqwest::Url::parse(server_url)
            .map_err(|e| AuthError::Discovery(format!("invalid server url: {e}")))?;
        let origin = base
            .join("/.well-known/oauth-authorization-server")
            .map_err(|e| AuthError::Discovery(e.to_string()))?;

        let resp = self.http.get(origin.clone()).send().await?;
        if !resp.status().is_success() {
            return Err(AuthError::Discovery(format!(
                "{} returned {}",
                origin,
                resp.status()
            )));
        }
        resp.json::<AuthServerMetadata>()
            .await
            .map_err(|e| AuthError::Discovery(e.to_string()))
    }

    async fn register(
        &self,
        meta: &AuthServerMetadata,
        callback_url: &str,
    ) -> Result<ClientRegistration, AuthError> {
        let Some(endpoint) = &meta.registration_endpoint else {
            return Err(AuthError::Registration(
                "authorization server does not support dynamic registration".to_string(),
            ));
        };

        let resp = self
            .http
            .post(endpoint)
            .json(&serde_json::json!({
                "client_name": CLIENT_NAME,
                "redirect_uris": [callback_url],
                "grant_types": ["authorization_code", "refresh_token"],
                "response_types": ["code"],
                "token_endpoint_auth_method": "none",
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AuthError::Registration(format!(
                "registration endpoint returned {}",
                resp.status()
            )));
        }
        let reg: RegistrationResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Registration(e.to_string()))?;
        Ok(ClientRegistration {
            client_id: reg.client_id,
            client_secret: reg.client_secret,
            token_endpoint: meta.token_endpoint.clone(),
        })
    }

    async fn token_request(
        &self,
        client: &ClientRegistration,
        params: &[(&str, &str)],
    ) -> Result<Result<TokenResponse, TokenErrorResponse>, AuthError> {
        let mut req = self.http.post(&client.token_endpoint).form(params);
        if let Some(secret) = &client.client_secret {
            req = req.basic_auth(&client.client_id, Some(secret));
        }
        let resp = req.send().await?;
        if resp.status().is_success() {
            let tokens: TokenResponse = resp
                .json()
                .await
                .map_err(|e| AuthError::InvalidGrant(e.to_string()))?;
            return Ok(Ok(tokens));
        }
        let err: TokenErrorResponse = resp.json().await.unwrap_or(TokenErrorResponse {
            error: "unknown_error".to_string(),
            error_description: None,
        });
        Ok(Err(err))
    }
}

fn random_alphanumeric(len: usize) -> String {
    use rand::Rng as _;
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn code_challenge_s256(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

#[async_trait]
impl OAuthFlow for HttpOAuthFlow {
    async fn begin(
        &self,
        server_url: &str,
        callback_url: &str,
        client: Option<ClientRegistration>,
    ) -> Result<AuthorizationRequest, AuthError> {
        let meta = self.discover(server_url).await?;
        let client = match client {
            Some(c) => c,
            None => self.register(&meta, callback_url).await?,
        };

        let code_verifier = random_alphanumeric(64);
        let state = random_alphanumeric(32);

        let mut url = reqwest::Url::parse(&meta.authorization_endpoint)
            .map_err(|e| AuthError::Discovery(format!("invalid authorization endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &client.client_id)
            .append_pair("redirect_uri", callback_url)
            .append_pair("code_challenge", &code_challenge_s256(&code_verifier))
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", &state);

        Ok(AuthorizationRequest {
            auth_url: url.to_string(),
            pending: PendingAuth {
                code_verifier,
                state,
            },
            client,
        })
    }

    async fn exchange(
        &self,
        client: &ClientRegistration,
        callback_url: &str,
        pending: &PendingAuth,
        code: &str,
    ) -> Result<OAuthTokens, AuthError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", callback_url),
            ("client_id", client.client_id.as_str()),
            ("code_verifier", pending.code_verifier.as_str()),
        ];
        match self.token_request(client, &params).await? {
            Ok(tokens) => Ok(tokens.into_tokens(None)),
            Err(err) => Err(AuthError::InvalidGrant(format!(
                "{}: {}",
                err.error,
                err.error_description.unwrap_or_default()
            ))),
        }
    }

    async fn refresh(
        &self,
        client: &ClientRegistration,
        refresh_token: &str,
    ) -> Result<OAuthTokens, AuthError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client.client_id.as_str()),
        ];
        match self.token_request(client, &params).await? {
            Ok(tokens) => Ok(tokens.into_tokens(Some(refresh_token))),
            Err(err) => Err(AuthError::RefreshFailed(format!(
                "{}: {}",
                err.error,
                err.error_description.unwrap_or_default()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_challenge_is_base64url_sha256() {
        // RFC 7636 appendix B test vector.
        assert_eq!(
            code_challenge_s256("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn token_response_keeps_previous_refresh_token_when_rotated_away() {
        let resp = TokenResponse {
            access_token: "new".to_string(),
            refresh_token: None,
            expires_in: Some(3600),
        };
        let tokens = resp.into_tokens(Some("old-refresh"));
        assert_eq!(tokens.refresh_token.as_deref(), Some("old-refresh"));
        assert!(tokens.expires_at.is_some());
    }
}
