use std::time::Duration;

use url::Url;

use crate::error::{ChatError, Result};

pub const DEFAULT_PRESENCE_INTERVAL_SECS: u64 = 5;
const REALTIME_PATH: &str = "realtime/v1/websocket";
const REALTIME_PROTOCOL_VERSION: &str = "1.0.0";

/// Connection settings for the hosted backend.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub backend_url: String,
    pub anon_key: String,
    /// Explicit websocket endpoint; derived from `backend_url` when unset.
    pub realtime_url: Option<String>,
    pub presence_interval: Duration,
}

impl ClientConfig {
    pub fn new(backend_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            backend_url: backend_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            realtime_url: None,
            presence_interval: Duration::from_secs(DEFAULT_PRESENCE_INTERVAL_SECS),
        }
    }

    pub fn rest_url(&self) -> String {
        format!("{}/rest/v1", self.backend_url)
    }

    pub fn auth_url(&self) -> String {
        format!("{}/auth/v1", self.backend_url)
    }

    /// Websocket URL including the project key and protocol version.
    pub fn websocket_url(&self) -> Result<String> {
        let base = match &self.realtime_url {
            Some(explicit) => Url::parse(explicit)
                .map_err(|e| ChatError::Validation(format!("Invalid realtime URL: {}", e)))?,
            None => derive_realtime_url(&self.backend_url)?,
        };

        let mut url = base;
        url.query_pairs_mut()
            .append_pair("apikey", &self.anon_key)
            .append_pair("vsn", REALTIME_PROTOCOL_VERSION);
        Ok(url.to_string())
    }
}

fn derive_realtime_url(backend_url: &str) -> Result<Url> {
    let mut url = Url::parse(backend_url)
        .map_err(|e| ChatError::Validation(format!("Invalid backend URL: {}", e)))?;

    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(ChatError::Validation(format!(
                "Unsupported backend URL scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ChatError::Validation("Cannot derive realtime URL".to_string()))?;
    url.set_path(REALTIME_PATH);
    url.set_query(None);
    Ok(url)
}
