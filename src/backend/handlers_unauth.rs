//! Handlers reachable without authentication.

use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect};
use serde_json::json;
use tower_sessions::Session;

use crate::authorization::{ClientMeta, Identity};
use crate::backend::AppState;
use crate::consts::SESSION_IDENTITY_KEY;
use crate::services::{LoginForm, ServiceError};

/// Entry point: logged-in sessions land on the dashboard, everyone else
/// on the login page.
pub async fn index(session: Session) -> Redirect {
    match session.get::<Identity>(SESSION_IDENTITY_KEY) {
        Ok(Some(_)) => Redirect::to("/dashboard"),
        _ => Redirect::to("/login"),
    }
}

/// Verifies credentials and binds the identity to the session. The
/// session id is rotated on success so a pre-login id cannot be reused.
pub async fn login(
    State(state): State<AppState>,
    session: Session,
    client: ClientMeta,
    Json(form): Json<LoginForm>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let identity = state.service.login(&client, &form)?;

    session.cycle_id();
    session
        .insert(SESSION_IDENTITY_KEY, &identity)
        .map_err(|error| ServiceError::Persistence(error.to_string()))?;

    Ok(Json(json!({
        "message": "Login successful",
        "role": identity.role,
        "full_name": identity.full_name,
    })))
}

/// Landing page for failed role checks.
pub async fn unauthorized() -> impl IntoResponse {
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "error": "You do not have permission to access this page." })),
    )
}
