use std::net::SocketAddr;
use std::time::Duration;

use crate::error::AppError;

pub const DEFAULT_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_SMTP_HOST: &str = "smtp.gmail.com";
pub const DEFAULT_RATE_LIMIT: u32 = 3;
pub const DEFAULT_RATE_WINDOW_SECS: u64 = 3600;

/// Settings for the contact service, read from the environment.
#[derive(Debug, Clone)]
pub struct ContactConfig {
    pub addr: SocketAddr,
    /// Admin mailbox: both sender and recipient of contact mails.
    pub email_user: String,
    pub email_pass: String,
    pub smtp_host: String,
    /// Shared limiter store; the in-memory window is used when unset.
    pub redis_url: Option<String>,
    pub rate_limit: u32,
    pub rate_window: Duration,
}

impl ContactConfig {
    pub fn new(email_user: impl Into<String>, email_pass: impl Into<String>) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            email_user: email_user.into(),
            email_pass: email_pass.into(),
            smtp_host: DEFAULT_SMTP_HOST.to_string(),
            redis_url: None,
            rate_limit: DEFAULT_RATE_LIMIT,
            rate_window: Duration::from_secs(DEFAULT_RATE_WINDOW_SECS),
        }
    }

    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| AppError::Config(format!("{} is not set", key)))
        };

        let addr = lookup("CONTACT_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let addr = addr
            .parse()
            .map_err(|e| AppError::Config(format!("Invalid CONTACT_ADDR {}: {}", addr, e)))?;

        let rate_limit = match lookup("CONTACT_RATE_LIMIT") {
            Some(v) => v
                .parse::<u32>()
                .map_err(|e| AppError::Config(format!("Invalid CONTACT_RATE_LIMIT: {}", e)))?,
            None => DEFAULT_RATE_LIMIT,
        };
        let window_secs = match lookup("CONTACT_RATE_WINDOW_SECS") {
            Some(v) => v
                .parse::<u64>()
                .map_err(|e| AppError::Config(format!("Invalid CONTACT_RATE_WINDOW_SECS: {}", e)))?,
            None => DEFAULT_RATE_WINDOW_SECS,
        };
        if rate_limit == 0 || window_secs == 0 {
            return Err(AppError::Config(
                "Rate limit and window must be positive".to_string(),
            ));
        }

        Ok(Self {
            addr,
            email_user: required("EMAIL_USER")?,
            email_pass: required("EMAIL_PASS")?,
            smtp_host: lookup("SMTP_HOST").unwrap_or_else(|| DEFAULT_SMTP_HOST.to_string()),
            redis_url: lookup("REDIS_URL").filter(|v| !v.trim().is_empty()),
            rate_limit,
            rate_window: Duration::from_secs(window_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config =
            ContactConfig::from_lookup(lookup_from(&[("EMAIL_USER", "admin@murmur.dev"), ("EMAIL_PASS", "pw")]))
                .unwrap();
        assert_eq!(config.addr.to_string(), DEFAULT_ADDR);
        assert_eq!(config.smtp_host, "smtp.gmail.com");
        assert_eq!(config.rate_limit, 3);
        assert_eq!(config.rate_window, Duration::from_secs(3600));
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = ContactConfig::from_lookup(lookup_from(&[
            ("EMAIL_USER", "admin@murmur.dev"),
            ("EMAIL_PASS", "pw"),
            ("CONTACT_ADDR", "127.0.0.1:8080"),
            ("REDIS_URL", "redis://127.0.0.1/"),
            ("CONTACT_RATE_LIMIT", "10"),
            ("CONTACT_RATE_WINDOW_SECS", "60"),
        ]))
        .unwrap();
        assert_eq!(config.addr.port(), 8080);
        assert_eq!(config.redis_url.as_deref(), Some("redis://127.0.0.1/"));
        assert_eq!(config.rate_limit, 10);
        assert_eq!(config.rate_window, Duration::from_secs(60));
    }

    #[test]
    fn test_missing_credentials() {
        let err = ContactConfig::from_lookup(lookup_from(&[("EMAIL_USER", "admin@murmur.dev")]))
            .unwrap_err();
        assert!(err.to_string().contains("EMAIL_PASS"));
    }

    #[test]
    fn test_invalid_numbers() {
        let base = [("EMAIL_USER", "a@b.co"), ("EMAIL_PASS", "pw")];
        let mut pairs = base.to_vec();
        pairs.push(("CONTACT_RATE_LIMIT", "lots"));
        assert!(ContactConfig::from_lookup(lookup_from(&pairs)).is_err());

        let mut pairs = base.to_vec();
        pairs.push(("CONTACT_RATE_WINDOW_SECS", "0"));
        assert!(ContactConfig::from_lookup(lookup_from(&pairs)).is_err());
    }
}
