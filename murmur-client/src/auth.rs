//! Password authentication against the hosted auth API.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::error::{ChatError, Result};
use crate::models::input::{Credentials, ValidateExt};

const REQUEST_TIMEOUT_SECS: u64 = 10;

/// A signed-in user and the token used for every backend call.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthSession {
    pub user_id: String,
    pub email: Option<String>,
    pub access_token: String,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    user: AuthUser,
}

/// Sign-up answers with a session when the project auto-confirms,
/// otherwise with the bare user awaiting email confirmation.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(TokenResponse),
    Pending(AuthUser),
}

#[derive(Debug, Default, Deserialize)]
struct AuthErrorBody {
    error_description: Option<String>,
    msg: Option<String>,
    message: Option<String>,
    error: Option<String>,
}

impl AuthErrorBody {
    fn into_message(self) -> Option<String> {
        self.error_description
            .or(self.msg)
            .or(self.message)
            .or(self.error)
    }
}

/// Map provider errors to messages fit for a person.
pub fn friendly_auth_error(raw: &str) -> String {
    if raw.contains("Invalid login credentials") {
        "Email or password is incorrect.".to_string()
    } else if raw.contains("User already registered") {
        "This email address is already registered.".to_string()
    } else if raw.contains("Password should be") {
        "Password must be at least 6 characters.".to_string()
    } else if raw.to_lowercase().contains("rate limit") {
        "Too many attempts, please wait a moment.".to_string()
    } else {
        raw.to_string()
    }
}

pub struct AuthClient {
    http: reqwest::Client,
    auth_url: String,
    anon_key: String,
}

impl AuthClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            auth_url: config.auth_url(),
            anon_key: config.anon_key.clone(),
        })
    }

    pub async fn sign_in(&self, credentials: &Credentials) -> Result<AuthSession> {
        credentials.validate_input()?;

        let response = self
            .http
            .post(format!("{}/token?grant_type=password", self.auth_url))
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": credentials.email, "password": credentials.password }))
            .send()
            .await?;

        let token: TokenResponse = read_auth_response(response).await?;
        info!(user_id = %token.user.id, "Signed in");
        Ok(token.into())
    }

    /// Register a new account. Returns `None` while the address awaits confirmation.
    pub async fn sign_up(&self, credentials: &Credentials) -> Result<Option<AuthSession>> {
        credentials.validate_input()?;

        let response = self
            .http
            .post(format!("{}/signup", self.auth_url))
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": credentials.email, "password": credentials.password }))
            .send()
            .await?;

        match read_auth_response::<SignUpResponse>(response).await? {
            SignUpResponse::Session(token) => {
                info!(user_id = %token.user.id, "Signed up");
                Ok(Some(token.into()))
            }
            SignUpResponse::Pending(user) => {
                info!(user_id = %user.id, "Signed up, confirmation pending");
                Ok(None)
            }
        }
    }

    pub async fn sign_out(&self, session: &AuthSession) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/logout", self.auth_url))
            .header("apikey", &self.anon_key)
            .bearer_auth(&session.access_token)
            .send()
            .await?;

        // An expired token is as good as signed out
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("Sign-out with expired token");
            return Ok(());
        }
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Auth(friendly_auth_error(&error_message(&body))));
        }
        info!(user_id = %session.user_id, "Signed out");
        Ok(())
    }
}

impl From<TokenResponse> for AuthSession {
    fn from(token: TokenResponse) -> Self {
        Self {
            user_id: token.user.id,
            email: token.user.email,
            access_token: token.access_token,
        }
    }
}

async fn read_auth_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        warn!(status = %status, "Auth request rejected");
        return Err(ChatError::Auth(friendly_auth_error(&error_message(&body))));
    }
    Ok(serde_json::from_str(&body)?)
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<AuthErrorBody>(body)
        .ok()
        .and_then(AuthErrorBody::into_message)
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_friendly_messages() {
        assert_eq!(
            friendly_auth_error("Invalid login credentials"),
            "Email or password is incorrect."
        );
        assert_eq!(
            friendly_auth_error("User already registered"),
            "This email address is already registered."
        );
        assert_eq!(
            friendly_auth_error("Password should be at least 6 characters."),
            "Password must be at least 6 characters."
        );
        assert_eq!(
            friendly_auth_error("Email rate limit exceeded"),
            "Too many attempts, please wait a moment."
        );
        assert_eq!(friendly_auth_error("Something odd"), "Something odd");
    }

    #[test]
    fn test_error_message_picks_first_known_field() {
        let body = r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#;
        assert_eq!(error_message(body), "Invalid login credentials");

        let body = r#"{"code":422,"msg":"User already registered"}"#;
        assert_eq!(error_message(body), "User already registered");

        assert_eq!(error_message("gateway timeout"), "gateway timeout");
    }

    #[test]
    fn test_sign_up_response_shapes() {
        let session = r#"{"access_token":"t","token_type":"bearer","user":{"id":"u1","email":"a@b.co"}}"#;
        match serde_json::from_str::<SignUpResponse>(session).unwrap() {
            SignUpResponse::Session(token) => {
                let auth: AuthSession = token.into();
                assert_eq!(auth.user_id, "u1");
                assert_eq!(auth.access_token, "t");
            }
            SignUpResponse::Pending(_) => panic!("expected a session"),
        }

        let pending = r#"{"id":"u2","email":"c@d.co","confirmation_sent_at":"2024-01-01T00:00:00Z"}"#;
        assert!(matches!(
            serde_json::from_str::<SignUpResponse>(pending).unwrap(),
            SignUpResponse::Pending(_)
        ));
    }
}
