use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use tracing::info;

use crate::error::AppError;
use crate::mailer::ContactEmail;
use crate::state::AppState;
use crate::validation::ContactForm;

pub async fn contact(
    State(state): State<AppState>,
    payload: Result<Json<ContactForm>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(form) =
        payload.map_err(|e| AppError::Validation(format!("Invalid request body: {}", e.body_text())))?;
    form.check()?;

    let email = ContactEmail::compose(&form, &state.config.email_user);
    state.mailer.send(&email).await?;

    info!(name = %form.name, "Contact form delivered");
    Ok(Json(json!({ "success": true })))
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "murmur-contact",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
