//! Handlers that require an authenticated session.
//!
//! Every handler takes the [`Identity`] extractor, so the login
//! requirement is enforced by the signature itself. Role restrictions
//! beyond that are checked explicitly at the top of the handler.

use axum::extract::{Json, Path, Query, State};
use axum::response::Redirect;
use chrono::{Datelike, Utc};
use serde::Deserialize;
use serde_json::json;
use tower_sessions::Session;
use uuid::Uuid;

use crate::authorization::{require_role, AccessDenied, ClientMeta, Identity};
use crate::backend::AppState;
use crate::models::{
    Appointment, AppointmentId, AuditLogEntry, Billing, BillingId, Patient, PatientId, Role,
};
use crate::services::{
    AppointmentForm, AppointmentView, BillingForm, BillingView, DashboardStats, DeleteCheck,
    FinancialReport, PasswordForm, PatientForm, ServiceError, TransactionForm, TransactionView,
    UserView,
};
use crate::utils::input_validation::{calendar_date, FieldErrors};

/// Either of the two failure modes of a role-restricted handler.
/// Both render themselves, so handlers can use `?` throughout.
pub enum HandlerError {
    Denied(AccessDenied),
    Service(ServiceError),
}

impl From<AccessDenied> for HandlerError {
    fn from(denied: AccessDenied) -> Self {
        Self::Denied(denied)
    }
}

impl From<ServiceError> for HandlerError {
    fn from(error: ServiceError) -> Self {
        Self::Service(error)
    }
}

impl axum::response::IntoResponse for HandlerError {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::Denied(denied) => denied.into_response(),
            Self::Service(error) => error.into_response(),
        }
    }
}

pub async fn logout(
    State(state): State<AppState>,
    session: Session,
    identity: Identity,
    client: ClientMeta,
) -> Result<Redirect, ServiceError> {
    state.service.logout(&identity, &client)?;
    session.clear();
    Ok(Redirect::to("/login"))
}

pub async fn change_password(
    State(state): State<AppState>,
    identity: Identity,
    client: ClientMeta,
    Json(form): Json<PasswordForm>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    state.service.change_password(&identity, &client, &form)?;
    Ok(Json(json!({ "message": "Password changed successfully." })))
}

pub async fn dashboard(
    State(state): State<AppState>,
    _identity: Identity,
) -> Result<Json<DashboardStats>, ServiceError> {
    let stats = state.service.dashboard(Utc::now().date_naive())?;
    Ok(Json(stats))
}

// --- patients ---

pub async fn list_patients(
    State(state): State<AppState>,
    _identity: Identity,
) -> Result<Json<Vec<Patient>>, ServiceError> {
    Ok(Json(state.service.list_patients()?))
}

pub async fn get_patient(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<Patient>, ServiceError> {
    Ok(Json(state.service.get_patient(PatientId::from(id))?))
}

pub async fn create_patient(
    State(state): State<AppState>,
    identity: Identity,
    client: ClientMeta,
    Json(form): Json<PatientForm>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let id = state.service.create_patient(&identity, &client, &form)?;
    Ok(Json(json!({ "id": id, "message": "Patient created successfully." })))
}

pub async fn update_patient(
    State(state): State<AppState>,
    identity: Identity,
    client: ClientMeta,
    Path(id): Path<Uuid>,
    Json(form): Json<PatientForm>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    state
        .service
        .update_patient(&identity, &client, PatientId::from(id), &form)?;
    Ok(Json(json!({ "message": "Patient updated successfully." })))
}

pub async fn delete_patient(
    State(state): State<AppState>,
    identity: Identity,
    client: ClientMeta,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, HandlerError> {
    require_role(&identity, &[Role::Doctor, Role::Secretary, Role::Developer])?;
    state
        .service
        .delete_patient(&identity, &client, PatientId::from(id))?;
    Ok(Json(json!({ "message": "Patient deleted successfully." })))
}

pub async fn patient_delete_check(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<DeleteCheck>, HandlerError> {
    require_role(&identity, &[Role::Doctor, Role::Secretary, Role::Developer])?;
    Ok(Json(state.service.delete_check(PatientId::from(id))?))
}

// --- appointments ---

pub async fn list_doctors(
    State(state): State<AppState>,
    _identity: Identity,
) -> Result<Json<Vec<UserView>>, ServiceError> {
    Ok(Json(state.service.list_doctors()?))
}

pub async fn get_appointment(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<Appointment>, ServiceError> {
    Ok(Json(state.service.get_appointment(AppointmentId::from(id))?))
}

pub async fn list_appointments(
    State(state): State<AppState>,
    _identity: Identity,
) -> Result<Json<Vec<AppointmentView>>, ServiceError> {
    Ok(Json(state.service.list_appointments()?))
}

pub async fn create_appointment(
    State(state): State<AppState>,
    identity: Identity,
    client: ClientMeta,
    Json(form): Json<AppointmentForm>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let id = state.service.create_appointment(&identity, &client, &form)?;
    Ok(Json(json!({ "id": id, "message": "Appointment created successfully." })))
}

pub async fn update_appointment(
    State(state): State<AppState>,
    identity: Identity,
    client: ClientMeta,
    Path(id): Path<Uuid>,
    Json(form): Json<AppointmentForm>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    state
        .service
        .update_appointment(&identity, &client, AppointmentId::from(id), &form)?;
    Ok(Json(json!({ "message": "Appointment updated successfully." })))
}

// --- billing ---

pub async fn get_bill(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<Billing>, ServiceError> {
    Ok(Json(state.service.get_bill(BillingId::from(id))?))
}

pub async fn list_bills(
    State(state): State<AppState>,
    _identity: Identity,
) -> Result<Json<Vec<BillingView>>, ServiceError> {
    Ok(Json(state.service.list_bills()?))
}

pub async fn create_bill(
    State(state): State<AppState>,
    identity: Identity,
    client: ClientMeta,
    Json(form): Json<BillingForm>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let id = state.service.create_bill(&identity, &client, &form)?;
    Ok(Json(json!({ "id": id, "message": "Bill created successfully." })))
}

pub async fn update_bill(
    State(state): State<AppState>,
    identity: Identity,
    client: ClientMeta,
    Path(id): Path<Uuid>,
    Json(form): Json<BillingForm>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    state
        .service
        .update_bill(&identity, &client, BillingId::from(id), &form)?;
    Ok(Json(json!({ "message": "Bill updated successfully." })))
}

// --- transactions ---

pub async fn list_transactions(
    State(state): State<AppState>,
    _identity: Identity,
) -> Result<Json<Vec<TransactionView>>, ServiceError> {
    Ok(Json(state.service.list_transactions()?))
}

pub async fn record_payment(
    State(state): State<AppState>,
    identity: Identity,
    client: ClientMeta,
    Json(form): Json<TransactionForm>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let id = state.service.record_payment(&identity, &client, &form)?;
    Ok(Json(json!({ "id": id, "message": "Payment recorded successfully." })))
}

// --- administration and reporting ---

/// The caller's own account, for the profile page.
pub async fn profile(
    State(state): State<AppState>,
    identity: Identity,
) -> Result<Json<UserView>, ServiceError> {
    Ok(Json(state.service.profile(&identity)?))
}

pub async fn list_users(
    State(state): State<AppState>,
    identity: Identity,
) -> Result<Json<Vec<UserView>>, HandlerError> {
    require_role(&identity, &[Role::Developer])?;
    Ok(Json(state.service.list_users()?))
}

pub async fn audit_trail(
    State(state): State<AppState>,
    identity: Identity,
) -> Result<Json<Vec<AuditLogEntry>>, HandlerError> {
    require_role(&identity, &[Role::Developer])?;
    Ok(Json(state.service.audit_trail()?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReportQuery {
    pub date_from: String,
    pub date_to: String,
}

/// Financial report over a date range, defaulting to the current month
/// so far.
pub async fn financial_report(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<ReportQuery>,
) -> Result<Json<FinancialReport>, HandlerError> {
    require_role(&identity, &[Role::Accountant, Role::Developer])?;

    let today = Utc::now().date_naive();
    let month_start = today.with_day(1).unwrap_or(today);

    let mut errors = FieldErrors::default();
    let date_from = if query.date_from.trim().is_empty() {
        Some(month_start)
    } else {
        errors.check("date_from", calendar_date(&query.date_from))
    };
    let date_to = if query.date_to.trim().is_empty() {
        Some(today)
    } else {
        errors.check("date_to", calendar_date(&query.date_to))
    };

    match (date_from, date_to) {
        (Some(date_from), Some(date_to)) if errors.is_empty() => {
            let report = state.service.financial_report(date_from, date_to)?;
            Ok(Json(report))
        }
        _ => Err(HandlerError::Service(errors.into())),
    }
}
