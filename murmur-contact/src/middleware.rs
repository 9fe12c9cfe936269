use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

use crate::error::AppError;
use crate::state::AppState;

pub const UNKNOWN_CLIENT: &str = "unknown";

/// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    forwarded
        .or_else(real_ip)
        .map(String::from)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Counts the request against the caller's window before the handler runs.
pub async fn enforce_rate_limit(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let ip = client_ip(request.headers(), peer.map(|ConnectInfo(addr)| addr));
    let decision = state.limiter.check(&ip).await?;

    if !decision.allowed {
        warn!(client = %ip, reset_at = decision.reset_at, "Contact rate limit exceeded");
        return Err(AppError::RateLimited(decision));
    }

    let mut response = next.run(request).await;
    decision.write_headers(response.headers_mut());
    Ok(response)
}
