//! Authorization guard: request-scoped identity and role checks.
//!
//! The identity is established once at the boundary (extracted from the
//! session) and passed explicitly into the services; business logic
//! never reads ambient session state. Both guards are terminal on
//! failure: the request is answered with a redirect and no handler code
//! runs.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Redirect, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_sessions::Session;

use crate::consts::SESSION_IDENTITY_KEY;
use crate::models::{Role, UserId};

/// The authenticated identity carried by a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub role: Role,
    pub full_name: String,
}

/// Redirect issued when a role check fails. No page content is rendered.
#[derive(Debug, Error)]
#[error("Access denied.")]
pub struct AccessDenied;

impl IntoResponse for AccessDenied {
    fn into_response(self) -> Response {
        Redirect::to("/unauthorized").into_response()
    }
}

/// Role gate consulted at the top of every role-restricted handler.
/// The login requirement is already enforced by extracting [`Identity`].
pub fn require_role(identity: &Identity, allowed: &[Role]) -> Result<(), AccessDenied> {
    if allowed.contains(&identity.role) {
        Ok(())
    } else {
        Err(AccessDenied)
    }
}

/// Extracting an `Identity` is the login requirement: handlers that take
/// one never run for unauthenticated requests, which are redirected to
/// the login page instead.
#[async_trait::async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = Redirect;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
        let session = parts
            .extensions
            .get::<Session>()
            .ok_or_else(|| Redirect::to("/login"))?;

        session
            .get::<Identity>(SESSION_IDENTITY_KEY)
            .ok()
            .flatten()
            .ok_or_else(|| Redirect::to("/login"))
    }
}

/// Client address and agent captured for the audit trail.
#[derive(Debug, Clone)]
pub struct ClientMeta {
    pub ip_address: String,
    pub user_agent: String,
}

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for ClientMeta
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
        let ip_address = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|value| value.trim().to_string())
            .or_else(|| {
                parts
                    .extensions
                    .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
                    .map(|info| info.0.ip().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());

        let user_agent = parts
            .headers
            .get(http::header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self {
            ip_address,
            user_agent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(role: Role) -> Identity {
        Identity {
            user_id: UserId::new(),
            role,
            full_name: "Test User".to_string(),
        }
    }

    #[test]
    fn test_member_role_passes() {
        let doctor = identity(Role::Doctor);
        assert!(require_role(&doctor, &[Role::Doctor]).is_ok());
        assert!(
            require_role(&doctor, &[Role::Doctor, Role::Secretary, Role::Developer]).is_ok()
        );
    }

    #[test]
    fn test_non_member_role_is_denied() {
        let accountant = identity(Role::Accountant);
        assert!(require_role(&accountant, &[Role::Doctor]).is_err());
        assert!(require_role(&accountant, &[]).is_err());
    }
}
