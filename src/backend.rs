//! Web backend: the router, request handlers and the HTTP mapping of
//! service errors.

pub mod handlers_auth;
pub mod handlers_unauth;
pub mod router;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::error;
use serde_json::json;

use crate::db::DbError;
use crate::services::{Service, ServiceError};

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Service,
}

impl AppState {
    pub fn new(service: Service) -> Self {
        Self { service }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ServiceError::Validation(fields) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({ "error": "Validation failed", "fields": fields }),
            ),
            ServiceError::ReferentialBlock(reasons) => (
                StatusCode::CONFLICT,
                json!({ "error": "Delete blocked", "reasons": reasons }),
            ),
            ServiceError::InvalidCredentials => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": self.to_string() }),
            ),
            ServiceError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": self.to_string() }),
            ),
            ServiceError::Db(DbError::Storage(_)) | ServiceError::Persistence(_) => {
                error!("request failed: {self}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
            ServiceError::Db(_) => (
                StatusCode::NOT_FOUND,
                json!({ "error": self.to_string() }),
            ),
        };
        (status, Json(body)).into_response()
    }
}
