//! Contact form mailer for Murmur.
//!
//! `POST /api/contact` validates the form, applies a per-client sliding
//! window rate limit and relays the message to the admin mailbox over SMTP.

pub mod config;
pub mod error;
pub mod mailer;
pub mod middleware;
pub mod rate_limit;
pub mod routes;
pub mod state;
pub mod validation;

use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use config::ContactConfig;
pub use error::AppError;
pub use mailer::{ContactEmail, Mailer, SmtpMailer};
pub use rate_limit::{MemorySlidingWindow, RateLimitDecision, RateLimiter, RedisSlidingWindow};
pub use state::AppState;
pub use validation::ContactForm;

/// Router with the contact endpoint (rate limited) and the health probe.
pub fn app(state: AppState) -> Router {
    let contact = Router::new()
        .route("/api/contact", post(routes::contact))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::enforce_rate_limit,
        ));

    Router::new()
        .route("/health", get(routes::health))
        .merge(contact)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until Ctrl+C.
pub async fn start_server(config: ContactConfig) -> Result<(), AppError> {
    let addr = config.addr;
    let state = AppState::from_config(config).await?;

    let listener = TcpListener::bind(addr).await?;
    info!("Contact service listening on {}", addr);

    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Contact service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler; run until the process is killed
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
