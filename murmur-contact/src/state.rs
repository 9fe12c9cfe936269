use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::ContactConfig;
use crate::error::AppError;
use crate::mailer::{Mailer, SmtpMailer};
use crate::rate_limit::{MemorySlidingWindow, RateLimiter, RedisSlidingWindow};

const PURGE_INTERVAL: Duration = Duration::from_secs(300);

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ContactConfig>,
    pub limiter: Arc<dyn RateLimiter>,
    pub mailer: Arc<dyn Mailer>,
}

impl AppState {
    pub fn from_parts(
        config: ContactConfig,
        limiter: Arc<dyn RateLimiter>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            limiter,
            mailer,
        }
    }

    /// Build the production limiter and SMTP mailer from configuration.
    pub async fn from_config(config: ContactConfig) -> Result<Self, AppError> {
        let limiter: Arc<dyn RateLimiter> = match &config.redis_url {
            Some(url) => Arc::new(
                RedisSlidingWindow::connect(url, config.rate_limit, config.rate_window).await?,
            ),
            None => {
                warn!("REDIS_URL not set, rate limits are kept in memory");
                let memory = Arc::new(MemorySlidingWindow::new(config.rate_limit, config.rate_window));
                spawn_purge(memory.clone());
                memory
            }
        };

        let mailer = Arc::new(SmtpMailer::new(
            &config.smtp_host,
            &config.email_user,
            &config.email_pass,
        )?);
        info!(smtp_host = %config.smtp_host, "Mailer configured");

        Ok(Self::from_parts(config, limiter, mailer))
    }
}

fn spawn_purge(limiter: Arc<MemorySlidingWindow>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            limiter.purge_expired(Utc::now().timestamp_millis());
        }
    });
}
