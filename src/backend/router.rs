//! Route table and middleware configuration.
//!
//! Sessions live in an in-memory store behind an http-only cookie with
//! an inactivity expiry. Routes under [`auth_routes`] are additionally
//! guarded by the identity extractor, so unauthenticated requests are
//! redirected to the login page before any handler runs.

use axum::error_handling::HandleErrorLayer;
use axum::routing::{get, post, put};
use axum::{BoxError, Router};
use http::StatusCode;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer};

use crate::authorization::Identity;
use crate::backend::handlers_auth::{
    audit_trail, change_password, create_appointment, create_bill, create_patient, dashboard,
    delete_patient, financial_report, get_appointment, get_bill, get_patient, list_appointments,
    list_bills, list_doctors, list_patients, list_transactions, list_users, logout,
    patient_delete_check, profile, record_payment, update_appointment, update_bill,
    update_patient,
};
use crate::backend::handlers_unauth::{index, login, unauthorized};
use crate::backend::AppState;
use crate::consts::SESSION_MAX_AGE_MINUTES;

pub fn get_router(state: AppState) -> Router {
    // CORS is wide open in debug builds only, for local frontend work.
    let router = if cfg!(debug_assertions) {
        let cors = CorsLayer::new()
            .allow_methods(tower_http::cors::AllowMethods::any())
            .allow_origin(Any);
        Router::new().layer(cors)
    } else {
        Router::new()
    };

    let store = MemoryStore::default();
    let session_manager = SessionManagerLayer::new(store)
        .with_http_only(true)
        .with_expiry(Expiry::OnInactivity(time::Duration::minutes(
            SESSION_MAX_AGE_MINUTES,
        )));

    let service = ServiceBuilder::new()
        .layer(HandleErrorLayer::new(|_e: BoxError| async move {
            StatusCode::BAD_REQUEST
        }))
        .layer(session_manager);

    router
        .merge(unauth_routes())
        .merge(auth_routes())
        .layer(service)
        .with_state(state)
}

fn unauth_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/login", post(login))
        .route("/unauthorized", get(unauthorized))
}

fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/logout", get(logout))
        .route("/profile", get(profile))
        .route("/password", post(change_password))
        .route("/dashboard", get(dashboard))
        .route("/patients", get(list_patients).post(create_patient))
        .route(
            "/patients/:id",
            get(get_patient).put(update_patient).delete(delete_patient),
        )
        .route("/patients/:id/delete-check", get(patient_delete_check))
        .route("/doctors", get(list_doctors))
        .route("/appointments", get(list_appointments).post(create_appointment))
        .route("/appointments/:id", get(get_appointment).put(update_appointment))
        .route("/billing", get(list_bills).post(create_bill))
        .route("/billing/:id", get(get_bill).put(update_bill))
        .route("/transactions", get(list_transactions).post(record_payment))
        .route("/users", get(list_users))
        .route("/audit", get(audit_trail))
        .route("/reports", get(financial_report))
        .layer(axum::middleware::from_extractor::<Identity>())
}
