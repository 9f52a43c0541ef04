//! Email/password sign-in against the Identity Toolkit REST API.
//!
//! Authentication itself belongs to the provider. This module only obtains a
//! session (uid + id token) and keeps it in local storage so later runs can
//! reuse it.

use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::store::{LocalStore, LocalStoreError, SESSION_KEY};

/// Public Identity Toolkit endpoint.
pub const DEFAULT_AUTH_ENDPOINT: &str = "https://identitytoolkit.googleapis.com";

/// Public Secure Token endpoint, which exchanges refresh tokens.
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://securetoken.googleapis.com";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Auth provider unreachable: {0}")]
    Unreachable(String),

    #[error("Authentication failed: {0}")]
    Rejected(String),

    #[error("Malformed auth response: {0}")]
    Decode(String),

    #[error("Failed to persist session: {0}")]
    Storage(#[from] LocalStoreError),
}

/// A signed-in user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub uid: String,
    pub id_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl AuthSession {
    /// Loads the persisted session. Unreadable or malformed data counts as
    /// signed out.
    pub fn load(store: &dyn LocalStore) -> Option<AuthSession> {
        let raw = match store.read(SESSION_KEY) {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!("Failed to read session: {}", e);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::warn!("Ignoring malformed session: {}", e);
                None
            }
        }
    }

    pub fn save(&self, store: &dyn LocalStore) -> Result<(), AuthError> {
        let raw = serde_json::to_string(self).map_err(LocalStoreError::from)?;
        store.write(SESSION_KEY, &raw)?;
        Ok(())
    }

    pub fn clear(store: &dyn LocalStore) -> Result<(), AuthError> {
        store.remove(SESSION_KEY)?;
        Ok(())
    }

    /// Display name, else email, else uid.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.uid)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    local_id: String,
    id_token: String,
    refresh_token: Option<String>,
    email: Option<String>,
    display_name: Option<String>,
}

/// Secure Token responses use snake_case, unlike Identity Toolkit.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    id_token: Option<String>,
    refresh_token: Option<String>,
    display_name: Option<String>,
}

/// Client for the provider's account endpoints.
#[derive(Clone, Debug)]
pub struct AuthClient {
    http: Client,
    endpoint: String,
    token_endpoint: String,
    api_key: String,
}

impl AuthClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: DEFAULT_AUTH_ENDPOINT.to_string(),
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            api_key: api_key.into(),
        }
    }

    /// Points the client at another host, e.g. the auth emulator.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    /// Points token refresh at another host.
    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    fn token_url(&self) -> String {
        format!(
            "{}/v1/token?key={}",
            self.token_endpoint,
            urlencoding::encode(&self.api_key)
        )
    }

    fn url(&self, action: &str) -> String {
        format!(
            "{}/v1/accounts:{}?key={}",
            self.endpoint,
            action,
            urlencoding::encode(&self.api_key)
        )
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        let body = json!({
            "email": email,
            "password": password,
            "returnSecureToken": true
        });
        let response: TokenResponse = self.post("signInWithPassword", &body).await?;
        tracing::info!("Signed in as {}", response.local_id);
        Ok(response.into())
    }

    /// Creates an account and, if given, sets its display name.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> Result<AuthSession, AuthError> {
        let body = json!({
            "email": email,
            "password": password,
            "returnSecureToken": true
        });
        let response: TokenResponse = self.post("signUp", &body).await?;
        tracing::info!("Created account {}", response.local_id);

        let session: AuthSession = response.into();
        match display_name {
            Some(name) => self.update_profile(session, name).await,
            None => Ok(session),
        }
    }

    async fn update_profile(
        &self,
        mut session: AuthSession,
        display_name: &str,
    ) -> Result<AuthSession, AuthError> {
        let body = json!({
            "idToken": session.id_token,
            "displayName": display_name,
            "returnSecureToken": true
        });
        let response: ProfileResponse = self.post("update", &body).await?;

        if let Some(token) = response.id_token {
            session.id_token = token;
        }
        if response.refresh_token.is_some() {
            session.refresh_token = response.refresh_token;
        }
        session.display_name = response
            .display_name
            .or_else(|| Some(display_name.to_string()));
        Ok(session)
    }

    /// Exchanges the session's refresh token for a new id token.
    ///
    /// Id tokens expire after about an hour; the refresh token outlives them.
    pub async fn refresh(&self, session: &AuthSession) -> Result<AuthSession, AuthError> {
        let refresh_token = session
            .refresh_token
            .as_deref()
            .ok_or_else(|| AuthError::Rejected("session has no refresh token".to_string()))?;

        let request = self.http.post(self.token_url()).form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ]);
        let response: RefreshResponse = self.execute(request).await?;

        if response.user_id != session.uid {
            return Err(AuthError::Rejected(format!(
                "refresh token belongs to {}, not {}",
                response.user_id, session.uid
            )));
        }

        Ok(AuthSession {
            uid: response.user_id,
            id_token: response.id_token,
            refresh_token: Some(response.refresh_token),
            email: session.email.clone(),
            display_name: session.display_name.clone(),
        })
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        action: &str,
        body: &Value,
    ) -> Result<T, AuthError> {
        self.execute(self.http.post(self.url(action)).json(body)).await
    }

    async fn execute<T: serde::de::DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, AuthError> {
        let response = request
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = provider_message(&body).unwrap_or_else(|| status.to_string());
            return Err(if status.is_server_error() {
                AuthError::Unreachable(message)
            } else {
                AuthError::Rejected(message)
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| AuthError::Decode(e.to_string()))
    }
}

impl From<TokenResponse> for AuthSession {
    fn from(r: TokenResponse) -> Self {
        Self {
            uid: r.local_id,
            id_token: r.id_token,
            refresh_token: r.refresh_token,
            email: r.email,
            display_name: r.display_name.filter(|n| !n.is_empty()),
        }
    }
}

/// Extracts the provider's error code, e.g. `EMAIL_NOT_FOUND`.
fn provider_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("error")?
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
}
