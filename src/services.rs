//! Entity services: the single entry point for every state-changing
//! operation.
//!
//! Every mutation follows the same contract: validate the whole form
//! (collecting per-field errors instead of failing fast), check the
//! business-key against active and inactive rows, apply the write under
//! one store lock, persist, then append exactly one audit entry. The
//! caller's identity is always passed in explicitly; nothing here reads
//! session state.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::info;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use strum::IntoEnumIterator;
use thiserror::Error;
use uuid::Uuid;

use crate::audit;
use crate::authorization::{ClientMeta, Identity};
use crate::consts::{LOGIN_ATTEMPT_WINDOW_MINUTES, MAX_LOGIN_ATTEMPTS};
use crate::db::{Database, DbError};
use crate::models::{
    ActionKind, Appointment, AppointmentId, AppointmentStatus, Billing, BillingId, EntityName,
    Gender, Patient, PatientId, PaymentMethod, PaymentStatus, Role, Transaction, TransactionId,
    User, UserId,
};
use crate::utils::input_validation::{
    calendar_date, future_or_present_date, long_text, past_or_present_date, positive_amount,
    required_short_text, short_text, time_of_day, BusinessKey, EmailAddress, FieldErrors,
    InvalidField, PersonName, PhoneNumber, Username,
};
use crate::utils::password_utils::{acceptable_password, hash, verify};

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Per-field validation errors, including duplicate business keys.
    /// Nothing was persisted.
    #[error("Validation failed: {0}")]
    Validation(FieldErrors),

    /// A delete was refused; every violated condition is reported.
    #[error("Delete blocked")]
    ReferentialBlock(Vec<String>),

    /// Deliberately generic: does not reveal whether the account exists.
    #[error("Invalid username or password.")]
    InvalidCredentials,

    #[error("Too many failed login attempts. Please try again later.")]
    RateLimited,

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("Storage failure: {0}")]
    Persistence(String),
}

impl From<FieldErrors> for ServiceError {
    fn from(errors: FieldErrors) -> Self {
        ServiceError::Validation(errors)
    }
}

/// Result of the referential guard consulted before a patient delete.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteCheck {
    pub allowed: bool,
    pub blocking_reasons: Vec<String>,
}

/// Blocks a patient delete while dependent records are still live:
/// appointments not yet cancelled, or bills not yet paid. All violated
/// conditions are reported together so the caller can resolve them in
/// one round trip.
pub fn can_delete_patient(db: &Database, patient: PatientId) -> DeleteCheck {
    let mut blocking_reasons = Vec::new();

    let active_appointments = db
        .appointments_for_patient(patient)
        .filter(|appointment| appointment.status != AppointmentStatus::Cancelled)
        .count();
    if active_appointments > 0 {
        blocking_reasons.push(format!(
            "Patient has {active_appointments} active appointment(s)."
        ));
    }

    let unpaid_bills = db
        .bills_for_patient(patient)
        .filter(|bill| bill.payment_status != PaymentStatus::Paid)
        .count();
    if unpaid_bills > 0 {
        blocking_reasons.push(format!("Patient has {unpaid_bills} unpaid bill(s)."));
    }

    DeleteCheck {
        allowed: blocking_reasons.is_empty(),
        blocking_reasons,
    }
}

// --- form payloads ---

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct PasswordForm {
    pub new_password: String,
    pub confirm_password: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct PatientForm {
    pub patient_id: String,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: String,
    pub gender: String,
    pub phone: String,
    pub email: String,
    pub address: String,
    pub emergency_contact: String,
    pub emergency_phone: String,
    pub medical_history: String,
    pub allergies: String,
    pub insurance_provider: String,
    pub insurance_number: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct AppointmentForm {
    pub appointment_id: String,
    /// Internal id of the patient, from the selection list.
    pub patient_id: String,
    pub doctor_id: String,
    pub appointment_date: String,
    pub appointment_time: String,
    pub appointment_type: String,
    /// Ignored on create (new appointments are Scheduled); required on update.
    pub status: String,
    pub notes: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct BillingForm {
    pub bill_id: String,
    pub patient_id: String,
    /// Optional link to a completed appointment of the same patient.
    pub appointment_id: String,
    pub total_amount: String,
    pub billing_date: String,
    pub due_date: String,
    pub notes: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct TransactionForm {
    pub transaction_id: String,
    pub billing_id: String,
    pub amount: String,
    pub payment_method: String,
    pub reference_number: String,
}

// --- read models ---

#[derive(Debug, Serialize)]
pub struct AppointmentView {
    #[serde(flatten)]
    pub appointment: Appointment,
    pub patient_key: BusinessKey,
    pub patient_name: String,
    pub doctor_name: String,
}

#[derive(Debug, Serialize)]
pub struct BillingView {
    #[serde(flatten)]
    pub bill: Billing,
    pub patient_key: BusinessKey,
    pub patient_name: String,
    pub appointment_key: Option<BusinessKey>,
    pub balance: Decimal,
    /// Status as presented: Overdue when past due with a balance.
    pub effective_status: PaymentStatus,
}

#[derive(Debug, Serialize)]
pub struct TransactionView {
    #[serde(flatten)]
    pub transaction: Transaction,
    pub bill_key: BusinessKey,
    pub patient_key: BusinessKey,
    pub patient_name: String,
    pub recorded_by: String,
}

#[derive(Debug, Serialize)]
pub struct UserView {
    pub id: UserId,
    pub username: Username,
    pub email: EmailAddress,
    pub full_name: String,
    pub role: Role,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct DashboardStats {
    pub total_patients: usize,
    pub today_appointments: usize,
    pub pending_bills: usize,
    pub today_revenue: Decimal,
    pub recent_appointments: Vec<AppointmentView>,
    pub recent_transactions: Vec<TransactionView>,
}

#[derive(Debug, Serialize)]
pub struct MethodSummary {
    pub payment_method: PaymentMethod,
    pub count: usize,
    pub amount: Decimal,
}

#[derive(Debug, Serialize)]
pub struct StatusSummary {
    pub payment_status: PaymentStatus,
    pub count: usize,
    pub total_billed: Decimal,
    pub total_paid: Decimal,
    pub total_balance: Decimal,
}

#[derive(Debug, Serialize)]
pub struct FinancialReport {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub total_revenue: Decimal,
    pub transactions_by_method: Vec<MethodSummary>,
    pub billing_by_status: Vec<StatusSummary>,
}

// --- validated field sets ---

struct PatientFields {
    patient_id: BusinessKey,
    first_name: PersonName,
    last_name: PersonName,
    date_of_birth: NaiveDate,
    gender: Gender,
    phone: Option<PhoneNumber>,
    email: Option<EmailAddress>,
    address: String,
    emergency_contact: String,
    emergency_phone: Option<PhoneNumber>,
    medical_history: String,
    allergies: String,
    insurance_provider: String,
    insurance_number: String,
}

struct AppointmentFields {
    appointment_id: BusinessKey,
    patient: PatientId,
    doctor: UserId,
    appointment_date: NaiveDate,
    appointment_time: chrono::NaiveTime,
    appointment_type: String,
    status: AppointmentStatus,
    notes: String,
}

struct BillingFields {
    bill_id: BusinessKey,
    patient: PatientId,
    appointment: Option<AppointmentId>,
    total_amount: Decimal,
    billing_date: NaiveDate,
    due_date: Option<NaiveDate>,
    notes: String,
}

struct TransactionFields {
    transaction_id: BusinessKey,
    billing: BillingId,
    amount: Decimal,
    payment_method: PaymentMethod,
    reference_number: String,
}

/// The application service shared by all handlers.
#[derive(Clone)]
pub struct Service {
    db: Arc<RwLock<Database>>,
}

impl Service {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(RwLock::new(db)),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Database>, ServiceError> {
        self.db
            .read()
            .map_err(|_| ServiceError::Persistence("store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Database>, ServiceError> {
        self.db
            .write()
            .map_err(|_| ServiceError::Persistence("store lock poisoned".to_string()))
    }

    /// Seeds the default staff accounts on first start, mirroring the
    /// administrative bootstrap. No-op when accounts already exist.
    pub fn seed_default_accounts(&self, password: &str) -> Result<(), ServiceError> {
        let mut db = self.write()?;
        if db.has_users() {
            return Ok(());
        }

        let defaults = [
            ("admin", "admin@clinic.example", Role::Developer, "System Administrator"),
            ("doctor1", "doctor@clinic.example", Role::Doctor, "Dr. John Smith"),
            ("secretary1", "secretary@clinic.example", Role::Secretary, "Jane Doe"),
            ("accountant1", "accountant@clinic.example", Role::Accountant, "Bob Johnson"),
        ];

        for (username, email, role, full_name) in defaults {
            let user = User {
                id: UserId::new(),
                username: Username::try_from(username)
                    .map_err(|e| ServiceError::Persistence(e.to_string()))?,
                password: hash(password),
                email: EmailAddress::try_from(email)
                    .map_err(|e| ServiceError::Persistence(e.to_string()))?,
                role,
                full_name: full_name.to_string(),
                is_active: true,
                created_at: Utc::now(),
            };
            info!("Seeded {} account '{}'", role, username);
            db.store_user(user);
        }

        commit(&db)
    }

    // --- authentication ---

    /// Verifies credentials and returns the identity to store in the
    /// session. Failed attempts are audited anonymously and rate
    /// limited per username.
    pub fn login(&self, client: &ClientMeta, form: &LoginForm) -> Result<Identity, ServiceError> {
        let mut errors = FieldErrors::default();
        if form.username.trim().is_empty() {
            errors.push("username", "Please enter username.");
        }
        if form.password.is_empty() {
            errors.push("password", "Please enter your password.");
        }
        if !errors.is_empty() {
            return Err(errors.into());
        }

        let username = form.username.trim();
        let mut db = self.write()?;

        let cutoff = Utc::now() - Duration::minutes(LOGIN_ATTEMPT_WINDOW_MINUTES);
        if db.failed_logins_since(username, cutoff) >= MAX_LOGIN_ATTEMPTS {
            return Err(ServiceError::RateLimited);
        }

        // The password is always verified, against a dummy hash when the
        // account is unknown, so timing does not leak account existence.
        let identity = {
            let user = db.lookup_active_username(username);
            let verified = verify(&form.password, user.map(|user| &user.password));
            user.filter(|_| verified).map(|user| Identity {
                user_id: user.id,
                role: user.role,
                full_name: user.full_name.clone(),
            })
        };

        match identity {
            Some(identity) => {
                audit::record(
                    &mut db,
                    Some(identity.user_id),
                    ActionKind::Login,
                    None,
                    None,
                    None,
                    None,
                    client,
                );
                Ok(identity)
            }
            None => {
                audit::record(
                    &mut db,
                    None,
                    ActionKind::FailedLogin,
                    None,
                    None,
                    None,
                    Some(json!({ "username": username })),
                    client,
                );
                Err(ServiceError::InvalidCredentials)
            }
        }
    }

    pub fn logout(&self, identity: &Identity, client: &ClientMeta) -> Result<(), ServiceError> {
        let mut db = self.write()?;
        audit::record(
            &mut db,
            Some(identity.user_id),
            ActionKind::Logout,
            None,
            None,
            None,
            None,
            client,
        );
        Ok(())
    }

    /// Changes the caller's own password. Hashes are never written to
    /// the audit trail; only the fact of the change is recorded.
    pub fn change_password(
        &self,
        identity: &Identity,
        client: &ClientMeta,
        form: &PasswordForm,
    ) -> Result<(), ServiceError> {
        let mut db = self.write()?;
        let username = db.get_user(identity.user_id)?.username.to_string();

        let mut errors = FieldErrors::default();
        if form.new_password.is_empty() {
            errors.push("new_password", "Please enter the new password.");
        } else if !acceptable_password(&form.new_password, &username) {
            errors.push(
                "new_password",
                "Please choose a longer, less guessable password.",
            );
        }
        if form.confirm_password.is_empty() {
            errors.push("confirm_password", "Please confirm the password.");
        } else if !errors.contains("new_password") && form.new_password != form.confirm_password {
            errors.push("confirm_password", "Password did not match.");
        }
        if !errors.is_empty() {
            return Err(errors.into());
        }

        db.get_user_mut(identity.user_id)?.password = hash(&form.new_password);
        commit(&db)?;

        audit::record(
            &mut db,
            Some(identity.user_id),
            ActionKind::PasswordChange,
            Some(EntityName::Users),
            Some(identity.user_id.to_string()),
            None,
            None,
            client,
        );
        Ok(())
    }

    // --- patients ---

    pub fn create_patient(
        &self,
        identity: &Identity,
        client: &ClientMeta,
        form: &PatientForm,
    ) -> Result<PatientId, ServiceError> {
        let now = Utc::now();
        let mut db = self.write()?;
        let fields = validate_patient(&db, form, None, now.date_naive())?;

        let patient = Patient {
            id: PatientId::new(),
            patient_id: fields.patient_id,
            first_name: fields.first_name,
            last_name: fields.last_name,
            date_of_birth: fields.date_of_birth,
            gender: fields.gender,
            phone: fields.phone,
            email: fields.email,
            address: fields.address,
            emergency_contact: fields.emergency_contact,
            emergency_phone: fields.emergency_phone,
            medical_history: fields.medical_history,
            allergies: fields.allergies,
            insurance_provider: fields.insurance_provider,
            insurance_number: fields.insurance_number,
            is_active: true,
            created_by: identity.user_id,
            created_at: now,
            updated_at: now,
        };
        let id = patient.id;
        let snapshot = serde_json::to_value(&patient).ok();

        db.store_patient(patient);
        commit(&db)?;

        audit::record(
            &mut db,
            Some(identity.user_id),
            ActionKind::Create,
            Some(EntityName::Patients),
            Some(id.to_string()),
            None,
            snapshot,
            client,
        );
        Ok(id)
    }

    /// Full-record replace; the business key stays unique but the row's
    /// own key is excluded from the check.
    pub fn update_patient(
        &self,
        identity: &Identity,
        client: &ClientMeta,
        id: PatientId,
        form: &PatientForm,
    ) -> Result<(), ServiceError> {
        let now = Utc::now();
        let mut db = self.write()?;
        let existing = db.get_patient(id)?.clone();
        let fields = validate_patient(&db, form, Some(id), now.date_naive())?;

        let updated = Patient {
            id,
            patient_id: fields.patient_id,
            first_name: fields.first_name,
            last_name: fields.last_name,
            date_of_birth: fields.date_of_birth,
            gender: fields.gender,
            phone: fields.phone,
            email: fields.email,
            address: fields.address,
            emergency_contact: fields.emergency_contact,
            emergency_phone: fields.emergency_phone,
            medical_history: fields.medical_history,
            allergies: fields.allergies,
            insurance_provider: fields.insurance_provider,
            insurance_number: fields.insurance_number,
            is_active: existing.is_active,
            created_by: existing.created_by,
            created_at: existing.created_at,
            updated_at: now,
        };

        let old_values = serde_json::to_value(&existing).ok();
        let new_values = serde_json::to_value(&updated).ok();

        db.store_patient(updated);
        commit(&db)?;

        audit::record(
            &mut db,
            Some(identity.user_id),
            ActionKind::Update,
            Some(EntityName::Patients),
            Some(id.to_string()),
            old_values,
            new_values,
            client,
        );
        Ok(())
    }

    /// Soft delete, gated by the referential guard. The row is kept for
    /// audit and history; only `is_active` changes.
    pub fn delete_patient(
        &self,
        identity: &Identity,
        client: &ClientMeta,
        id: PatientId,
    ) -> Result<(), ServiceError> {
        let now = Utc::now();
        let mut db = self.write()?;
        let existing = db.get_patient(id)?.clone();

        let check = can_delete_patient(&db, id);
        if !check.allowed {
            return Err(ServiceError::ReferentialBlock(check.blocking_reasons));
        }

        let old_values = serde_json::to_value(&existing).ok();
        {
            let patient = db.get_patient_mut(id)?;
            patient.is_active = false;
            patient.updated_at = now;
        }
        commit(&db)?;

        audit::record(
            &mut db,
            Some(identity.user_id),
            ActionKind::Delete,
            Some(EntityName::Patients),
            Some(id.to_string()),
            old_values,
            None,
            client,
        );
        Ok(())
    }

    pub fn delete_check(&self, id: PatientId) -> Result<DeleteCheck, ServiceError> {
        let db = self.read()?;
        db.get_patient(id)?;
        Ok(can_delete_patient(&db, id))
    }

    /// Fetches a patient by internal id regardless of the active flag,
    /// for history and audit views.
    pub fn get_patient(&self, id: PatientId) -> Result<Patient, ServiceError> {
        Ok(self.read()?.get_patient(id)?.clone())
    }

    pub fn list_patients(&self) -> Result<Vec<Patient>, ServiceError> {
        let db = self.read()?;
        let mut patients: Vec<Patient> = db.active_patients().cloned().collect();
        patients.sort_by(|a, b| {
            (a.first_name.as_ref(), a.last_name.as_ref())
                .cmp(&(b.first_name.as_ref(), b.last_name.as_ref()))
        });
        Ok(patients)
    }

    // --- appointments ---

    pub fn create_appointment(
        &self,
        identity: &Identity,
        client: &ClientMeta,
        form: &AppointmentForm,
    ) -> Result<AppointmentId, ServiceError> {
        let now = Utc::now();
        let mut db = self.write()?;
        let fields = validate_appointment(&db, form, None, now.date_naive(), false)?;

        let appointment = Appointment {
            id: AppointmentId::new(),
            appointment_id: fields.appointment_id,
            patient: fields.patient,
            doctor: fields.doctor,
            appointment_date: fields.appointment_date,
            appointment_time: fields.appointment_time,
            appointment_type: fields.appointment_type,
            status: AppointmentStatus::Scheduled,
            notes: fields.notes,
            created_by: identity.user_id,
            created_at: now,
        };
        let id = appointment.id;
        let snapshot = serde_json::to_value(&appointment).ok();

        db.store_appointment(appointment);
        commit(&db)?;

        audit::record(
            &mut db,
            Some(identity.user_id),
            ActionKind::Create,
            Some(EntityName::Appointments),
            Some(id.to_string()),
            None,
            snapshot,
            client,
        );
        Ok(id)
    }

    pub fn update_appointment(
        &self,
        identity: &Identity,
        client: &ClientMeta,
        id: AppointmentId,
        form: &AppointmentForm,
    ) -> Result<(), ServiceError> {
        let now = Utc::now();
        let mut db = self.write()?;
        let existing = db.get_appointment(id)?.clone();
        let fields = validate_appointment(&db, form, Some(id), now.date_naive(), true)?;

        let updated = Appointment {
            id,
            appointment_id: fields.appointment_id,
            patient: fields.patient,
            doctor: fields.doctor,
            appointment_date: fields.appointment_date,
            appointment_time: fields.appointment_time,
            appointment_type: fields.appointment_type,
            status: fields.status,
            notes: fields.notes,
            created_by: existing.created_by,
            created_at: existing.created_at,
        };

        let old_values = serde_json::to_value(&existing).ok();
        let new_values = serde_json::to_value(&updated).ok();

        db.store_appointment(updated);
        commit(&db)?;

        audit::record(
            &mut db,
            Some(identity.user_id),
            ActionKind::Update,
            Some(EntityName::Appointments),
            Some(id.to_string()),
            old_values,
            new_values,
            client,
        );
        Ok(())
    }

    pub fn list_appointments(&self) -> Result<Vec<AppointmentView>, ServiceError> {
        let db = self.read()?;
        let mut views: Vec<AppointmentView> = db
            .appointments()
            .filter_map(|appointment| appointment_view(&db, appointment))
            .collect();
        views.sort_by_key(|view| {
            (
                view.appointment.appointment_date,
                view.appointment.appointment_time,
            )
        });
        Ok(views)
    }

    // --- billing ---

    pub fn create_bill(
        &self,
        identity: &Identity,
        client: &ClientMeta,
        form: &BillingForm,
    ) -> Result<BillingId, ServiceError> {
        let now = Utc::now();
        let mut db = self.write()?;
        let fields = validate_billing(&db, form, None)?;

        let mut bill = Billing {
            id: BillingId::new(),
            bill_id: fields.bill_id,
            patient: fields.patient,
            appointment: fields.appointment,
            total_amount: fields.total_amount,
            paid_amount: Decimal::ZERO,
            payment_status: PaymentStatus::Pending,
            billing_date: fields.billing_date,
            due_date: fields.due_date,
            notes: fields.notes,
            created_by: identity.user_id,
            created_at: now,
        };
        bill.refresh_payment_status();
        let id = bill.id;
        let snapshot = serde_json::to_value(&bill).ok();

        db.store_bill(bill);
        commit(&db)?;

        audit::record(
            &mut db,
            Some(identity.user_id),
            ActionKind::Create,
            Some(EntityName::Billing),
            Some(id.to_string()),
            None,
            snapshot,
            client,
        );
        Ok(id)
    }

    /// Replaces the billable fields; the paid amount is owned by the
    /// transaction flow and survives updates unchanged.
    pub fn update_bill(
        &self,
        identity: &Identity,
        client: &ClientMeta,
        id: BillingId,
        form: &BillingForm,
    ) -> Result<(), ServiceError> {
        let mut db = self.write()?;
        let existing = db.get_bill(id)?.clone();
        let fields = validate_billing(&db, form, Some(id))?;

        let mut updated = Billing {
            id,
            bill_id: fields.bill_id,
            patient: fields.patient,
            appointment: fields.appointment,
            total_amount: fields.total_amount,
            paid_amount: existing.paid_amount,
            payment_status: existing.payment_status,
            billing_date: fields.billing_date,
            due_date: fields.due_date,
            notes: fields.notes,
            created_by: existing.created_by,
            created_at: existing.created_at,
        };
        updated.refresh_payment_status();

        let old_values = serde_json::to_value(&existing).ok();
        let new_values = serde_json::to_value(&updated).ok();

        db.store_bill(updated);
        commit(&db)?;

        audit::record(
            &mut db,
            Some(identity.user_id),
            ActionKind::Update,
            Some(EntityName::Billing),
            Some(id.to_string()),
            old_values,
            new_values,
            client,
        );
        Ok(())
    }

    pub fn list_bills(&self) -> Result<Vec<BillingView>, ServiceError> {
        let today = Utc::now().date_naive();
        let db = self.read()?;
        let mut views: Vec<BillingView> = db
            .bills()
            .filter_map(|bill| billing_view(&db, bill, today))
            .collect();
        views.sort_by_key(|view| std::cmp::Reverse(view.bill.billing_date));
        Ok(views)
    }

    // --- transactions ---

    /// Records a payment: one transactional step inserts the
    /// transaction, increments the bill's paid amount, and recomputes
    /// balance and payment status. All of it happens under a single
    /// store lock so two concurrent payments cannot interleave.
    pub fn record_payment(
        &self,
        identity: &Identity,
        client: &ClientMeta,
        form: &TransactionForm,
    ) -> Result<TransactionId, ServiceError> {
        let now = Utc::now();
        let mut db = self.write()?;
        let fields = validate_transaction(&db, form)?;

        let transaction = Transaction {
            id: TransactionId::new(),
            transaction_id: fields.transaction_id,
            billing: fields.billing,
            amount: fields.amount,
            payment_method: fields.payment_method,
            payment_date: now,
            reference_number: fields.reference_number,
            created_by: identity.user_id,
            created_at: now,
        };
        let id = transaction.id;
        let snapshot = serde_json::to_value(&transaction).ok();

        db.store_transaction(transaction);
        let resulting_status = {
            let bill = db.get_bill_mut(fields.billing)?;
            bill.paid_amount += fields.amount;
            bill.refresh_payment_status();
            bill.payment_status
        };
        commit(&db)?;

        audit::record(
            &mut db,
            Some(identity.user_id),
            ActionKind::Create,
            Some(EntityName::Transactions),
            Some(id.to_string()),
            None,
            snapshot.map(|transaction| {
                json!({
                    "transaction": transaction,
                    "billing_payment_status": resulting_status,
                })
            }),
            client,
        );
        Ok(id)
    }

    pub fn list_transactions(&self) -> Result<Vec<TransactionView>, ServiceError> {
        let db = self.read()?;
        let mut views: Vec<TransactionView> = db
            .transactions()
            .filter_map(|transaction| transaction_view(&db, transaction))
            .collect();
        views.sort_by_key(|view| std::cmp::Reverse(view.transaction.payment_date));
        Ok(views)
    }

    pub fn get_appointment(&self, id: AppointmentId) -> Result<Appointment, ServiceError> {
        Ok(self.read()?.get_appointment(id)?.clone())
    }

    pub fn get_bill(&self, id: BillingId) -> Result<Billing, ServiceError> {
        Ok(self.read()?.get_bill(id)?.clone())
    }

    /// Active doctor accounts, for the appointment form's selection list.
    pub fn list_doctors(&self) -> Result<Vec<UserView>, ServiceError> {
        let db = self.read()?;
        let mut doctors: Vec<UserView> = db.active_doctors().map(user_view).collect();
        doctors.sort_by(|a, b| a.full_name.cmp(&b.full_name));
        Ok(doctors)
    }

    /// The caller's own account.
    pub fn profile(&self, identity: &Identity) -> Result<UserView, ServiceError> {
        let db = self.read()?;
        Ok(user_view(db.get_user(identity.user_id)?))
    }

    pub fn audit_trail(&self) -> Result<Vec<crate::models::AuditLogEntry>, ServiceError> {
        let db = self.read()?;
        let mut entries: Vec<_> = db.audit_entries().cloned().collect();
        entries.sort_by_key(|entry| std::cmp::Reverse(entry.created_at));
        Ok(entries)
    }

    // --- users, dashboard, reports ---

    pub fn list_users(&self) -> Result<Vec<UserView>, ServiceError> {
        let db = self.read()?;
        let mut views: Vec<UserView> = db.users().map(user_view).collect();
        views.sort_by_key(|view| std::cmp::Reverse(view.created_at));
        Ok(views)
    }

    pub fn dashboard(&self, today: NaiveDate) -> Result<DashboardStats, ServiceError> {
        let db = self.read()?;

        let total_patients = db.active_patients().count();

        let today_appointments = db
            .appointments()
            .filter(|appointment| {
                appointment.appointment_date == today
                    && appointment.status == AppointmentStatus::Scheduled
            })
            .count();

        let pending_bills = db
            .bills()
            .filter(|bill| {
                matches!(
                    bill.payment_status,
                    PaymentStatus::Pending | PaymentStatus::Partial
                )
            })
            .count();

        let today_revenue = db
            .transactions()
            .filter(|transaction| transaction.payment_date.date_naive() == today)
            .map(|transaction| transaction.amount)
            .sum();

        let mut recent_appointments: Vec<AppointmentView> = db
            .appointments()
            .filter(|appointment| appointment.appointment_date >= today)
            .filter_map(|appointment| appointment_view(&db, appointment))
            .collect();
        recent_appointments.sort_by_key(|view| {
            (
                view.appointment.appointment_date,
                view.appointment.appointment_time,
            )
        });
        recent_appointments.truncate(5);

        let mut recent_transactions: Vec<TransactionView> = db
            .transactions()
            .filter_map(|transaction| transaction_view(&db, transaction))
            .collect();
        recent_transactions.sort_by_key(|view| std::cmp::Reverse(view.transaction.payment_date));
        recent_transactions.truncate(5);

        Ok(DashboardStats {
            total_patients,
            today_appointments,
            pending_bills,
            today_revenue,
            recent_appointments,
            recent_transactions,
        })
    }

    pub fn financial_report(
        &self,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<FinancialReport, ServiceError> {
        let db = self.read()?;

        let in_range = |date: NaiveDate| date >= date_from && date <= date_to;

        let total_revenue = db
            .transactions()
            .filter(|transaction| in_range(transaction.payment_date.date_naive()))
            .map(|transaction| transaction.amount)
            .sum();

        let transactions_by_method = PaymentMethod::iter()
            .filter_map(|method| {
                let mut count = 0;
                let mut amount = Decimal::ZERO;
                for transaction in db
                    .transactions()
                    .filter(|transaction| transaction.payment_method == method)
                    .filter(|transaction| in_range(transaction.payment_date.date_naive()))
                {
                    count += 1;
                    amount += transaction.amount;
                }
                (count > 0).then_some(MethodSummary {
                    payment_method: method,
                    count,
                    amount,
                })
            })
            .collect();

        let billing_by_status = PaymentStatus::iter()
            .filter_map(|status| {
                let mut summary = StatusSummary {
                    payment_status: status,
                    count: 0,
                    total_billed: Decimal::ZERO,
                    total_paid: Decimal::ZERO,
                    total_balance: Decimal::ZERO,
                };
                for bill in db
                    .bills()
                    .filter(|bill| bill.payment_status == status)
                    .filter(|bill| in_range(bill.billing_date))
                {
                    summary.count += 1;
                    summary.total_billed += bill.total_amount;
                    summary.total_paid += bill.paid_amount;
                    summary.total_balance += bill.balance();
                }
                (summary.count > 0).then_some(summary)
            })
            .collect();

        Ok(FinancialReport {
            date_from,
            date_to,
            total_revenue,
            transactions_by_method,
            billing_by_status,
        })
    }
}

fn commit(db: &Database) -> Result<(), ServiceError> {
    db.save()
        .map_err(|error| ServiceError::Persistence(error.to_string()))
}

// --- view builders ---

fn user_view(user: &User) -> UserView {
    UserView {
        id: user.id,
        username: user.username.clone(),
        email: user.email.clone(),
        full_name: user.full_name.clone(),
        role: user.role,
        is_active: user.is_active,
        created_at: user.created_at,
    }
}

fn appointment_view(db: &Database, appointment: &Appointment) -> Option<AppointmentView> {
    let patient = db.get_patient(appointment.patient).ok()?;
    if !patient.is_active {
        return None;
    }
    let doctor = db.get_user(appointment.doctor).ok()?;
    Some(AppointmentView {
        appointment: appointment.clone(),
        patient_key: patient.patient_id.clone(),
        patient_name: patient.full_name(),
        doctor_name: doctor.full_name.clone(),
    })
}

fn billing_view(db: &Database, bill: &Billing, today: NaiveDate) -> Option<BillingView> {
    let patient = db.get_patient(bill.patient).ok()?;
    if !patient.is_active {
        return None;
    }
    let appointment_key = bill
        .appointment
        .and_then(|id| db.get_appointment(id).ok())
        .map(|appointment| appointment.appointment_id.clone());
    Some(BillingView {
        bill: bill.clone(),
        patient_key: patient.patient_id.clone(),
        patient_name: patient.full_name(),
        appointment_key,
        balance: bill.balance(),
        effective_status: bill.effective_status(today),
    })
}

fn transaction_view(db: &Database, transaction: &Transaction) -> Option<TransactionView> {
    let bill = db.get_bill(transaction.billing).ok()?;
    let patient = db.get_patient(bill.patient).ok()?;
    if !patient.is_active {
        return None;
    }
    let recorded_by = db
        .get_user(transaction.created_by)
        .map(|user| user.full_name.clone())
        .unwrap_or_else(|_| "System".to_string());
    Some(TransactionView {
        transaction: transaction.clone(),
        bill_key: bill.bill_id.clone(),
        patient_key: patient.patient_id.clone(),
        patient_name: patient.full_name(),
        recorded_by,
    })
}

// --- reference parsing ---

fn parse_patient_ref(db: &Database, raw: &str) -> Result<PatientId, InvalidField> {
    const MSG: InvalidField = InvalidField("Please select a patient.");
    let id = Uuid::parse_str(raw.trim()).map_err(|_| MSG)?;
    let patient = db.get_patient(PatientId::from(id)).map_err(|_| MSG)?;
    if !patient.is_active {
        return Err(MSG);
    }
    Ok(patient.id)
}

fn parse_doctor_ref(db: &Database, raw: &str) -> Result<UserId, InvalidField> {
    const MSG: InvalidField = InvalidField("Please select a doctor.");
    let id = Uuid::parse_str(raw.trim()).map_err(|_| MSG)?;
    let doctor = db.get_user(UserId::from(id)).map_err(|_| MSG)?;
    if !doctor.is_active || doctor.role != Role::Doctor {
        return Err(MSG);
    }
    Ok(doctor.id)
}

/// Only completed appointments of the same patient can be billed.
fn parse_billable_appointment(
    db: &Database,
    raw: &str,
    patient: Option<PatientId>,
) -> Result<AppointmentId, InvalidField> {
    const MSG: InvalidField = InvalidField("Please select a completed appointment.");
    let id = Uuid::parse_str(raw.trim()).map_err(|_| MSG)?;
    let appointment = db.get_appointment(AppointmentId::from(id)).map_err(|_| MSG)?;
    if appointment.status != AppointmentStatus::Completed {
        return Err(MSG);
    }
    if patient.is_some_and(|patient| appointment.patient != patient) {
        return Err(MSG);
    }
    Ok(appointment.id)
}

fn parse_bill_ref(db: &Database, raw: &str) -> Result<BillingId, InvalidField> {
    const MSG: InvalidField = InvalidField("Please select a bill.");
    let id = Uuid::parse_str(raw.trim()).map_err(|_| MSG)?;
    Ok(db.get_bill(BillingId::from(id)).map_err(|_| MSG)?.id)
}

fn parse_gender(raw: &str) -> Result<Gender, InvalidField> {
    raw.trim()
        .parse()
        .map_err(|_| InvalidField("Please select a gender."))
}

fn parse_appointment_status(raw: &str) -> Result<AppointmentStatus, InvalidField> {
    raw.trim()
        .parse()
        .map_err(|_| InvalidField("Please select a status."))
}

fn parse_payment_method(raw: &str) -> Result<PaymentMethod, InvalidField> {
    raw.trim()
        .parse()
        .map_err(|_| InvalidField("Please select a payment method."))
}

/// Validates an optional field: absent is fine, present must parse.
fn optional_field<T>(
    errors: &mut FieldErrors,
    field: &str,
    raw: &str,
    parse: impl FnOnce(&str) -> Result<T, InvalidField>,
) -> Option<T> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    errors.check(field, parse(trimmed))
}

// --- whole-form validation ---

fn validate_patient(
    db: &Database,
    form: &PatientForm,
    exclude: Option<PatientId>,
    today: NaiveDate,
) -> Result<PatientFields, ServiceError> {
    let mut errors = FieldErrors::default();

    let patient_id = match errors.check("patient_id", BusinessKey::try_from(form.patient_id.as_str()))
    {
        Some(key) if db.patient_key_taken(&key, exclude) => {
            errors.push("patient_id", "This patient ID already exists.");
            None
        }
        other => other,
    };

    let first_name = errors.check("first_name", PersonName::try_from(form.first_name.as_str()));
    let last_name = errors.check("last_name", PersonName::try_from(form.last_name.as_str()));
    let date_of_birth = errors.check(
        "date_of_birth",
        past_or_present_date(&form.date_of_birth, today),
    );
    let gender = errors.check("gender", parse_gender(&form.gender));

    let phone = optional_field(&mut errors, "phone", &form.phone, |raw| {
        PhoneNumber::try_from(raw)
    });
    let email = optional_field(&mut errors, "email", &form.email, |raw| {
        EmailAddress::try_from(raw)
    });
    let emergency_phone = optional_field(&mut errors, "emergency_phone", &form.emergency_phone, |raw| {
        PhoneNumber::try_from(raw)
    });

    let address = errors.check("address", short_text(&form.address));
    let emergency_contact = errors.check("emergency_contact", short_text(&form.emergency_contact));
    let medical_history = errors.check("medical_history", long_text(&form.medical_history));
    let allergies = errors.check("allergies", long_text(&form.allergies));
    let insurance_provider =
        errors.check("insurance_provider", short_text(&form.insurance_provider));
    let insurance_number = errors.check("insurance_number", short_text(&form.insurance_number));

    match (patient_id, first_name, last_name, date_of_birth, gender) {
        (Some(patient_id), Some(first_name), Some(last_name), Some(date_of_birth), Some(gender))
            if errors.is_empty() =>
        {
            Ok(PatientFields {
                patient_id,
                first_name,
                last_name,
                date_of_birth,
                gender,
                phone,
                email,
                address: address.unwrap_or_default(),
                emergency_contact: emergency_contact.unwrap_or_default(),
                emergency_phone,
                medical_history: medical_history.unwrap_or_default(),
                allergies: allergies.unwrap_or_default(),
                insurance_provider: insurance_provider.unwrap_or_default(),
                insurance_number: insurance_number.unwrap_or_default(),
            })
        }
        _ => Err(errors.into()),
    }
}

fn validate_appointment(
    db: &Database,
    form: &AppointmentForm,
    exclude: Option<AppointmentId>,
    today: NaiveDate,
    is_update: bool,
) -> Result<AppointmentFields, ServiceError> {
    let mut errors = FieldErrors::default();

    let appointment_id = match errors.check(
        "appointment_id",
        BusinessKey::try_from(form.appointment_id.as_str()),
    ) {
        Some(key) if db.appointment_key_taken(&key, exclude) => {
            errors.push("appointment_id", "This appointment ID already exists.");
            None
        }
        other => other,
    };

    let patient = errors.check("patient_id", parse_patient_ref(db, &form.patient_id));
    let doctor = errors.check("doctor_id", parse_doctor_ref(db, &form.doctor_id));

    // Rescheduling an existing appointment may keep a past date; only
    // newly created ones must lie in the future.
    let appointment_date = if is_update {
        errors.check("appointment_date", calendar_date(&form.appointment_date))
    } else {
        errors.check(
            "appointment_date",
            future_or_present_date(&form.appointment_date, today),
        )
    };
    let appointment_time = errors.check("appointment_time", time_of_day(&form.appointment_time));
    let appointment_type = errors.check(
        "appointment_type",
        required_short_text(&form.appointment_type),
    );

    let status = if is_update {
        errors.check("status", parse_appointment_status(&form.status))
    } else {
        Some(AppointmentStatus::Scheduled)
    };

    let notes = errors.check("notes", long_text(&form.notes));

    match (
        appointment_id,
        patient,
        doctor,
        appointment_date,
        appointment_time,
        appointment_type,
        status,
    ) {
        (
            Some(appointment_id),
            Some(patient),
            Some(doctor),
            Some(appointment_date),
            Some(appointment_time),
            Some(appointment_type),
            Some(status),
        ) if errors.is_empty() => Ok(AppointmentFields {
            appointment_id,
            patient,
            doctor,
            appointment_date,
            appointment_time,
            appointment_type,
            status,
            notes: notes.unwrap_or_default(),
        }),
        _ => Err(errors.into()),
    }
}

fn validate_billing(
    db: &Database,
    form: &BillingForm,
    exclude: Option<BillingId>,
) -> Result<BillingFields, ServiceError> {
    let mut errors = FieldErrors::default();

    let bill_id = match errors.check("bill_id", BusinessKey::try_from(form.bill_id.as_str())) {
        Some(key) if db.bill_key_taken(&key, exclude) => {
            errors.push("bill_id", "This bill ID already exists.");
            None
        }
        other => other,
    };

    let patient = errors.check("patient_id", parse_patient_ref(db, &form.patient_id));
    let appointment = optional_field(&mut errors, "appointment_id", &form.appointment_id, |raw| {
        parse_billable_appointment(db, raw, patient)
    });

    let total_amount = errors.check("total_amount", positive_amount(&form.total_amount));
    let billing_date = errors.check("billing_date", calendar_date(&form.billing_date));
    let due_date = optional_field(&mut errors, "due_date", &form.due_date, calendar_date);

    if let (Some(billing), Some(due)) = (billing_date, due_date) {
        if due < billing {
            errors.push("due_date", "Due date cannot be before billing date.");
        }
    }

    let notes = errors.check("notes", long_text(&form.notes));

    match (bill_id, patient, total_amount, billing_date) {
        (Some(bill_id), Some(patient), Some(total_amount), Some(billing_date))
            if errors.is_empty() =>
        {
            Ok(BillingFields {
                bill_id,
                patient,
                appointment,
                total_amount,
                billing_date,
                due_date,
                notes: notes.unwrap_or_default(),
            })
        }
        _ => Err(errors.into()),
    }
}

fn validate_transaction(
    db: &Database,
    form: &TransactionForm,
) -> Result<TransactionFields, ServiceError> {
    let mut errors = FieldErrors::default();

    let transaction_id = match errors.check(
        "transaction_id",
        BusinessKey::try_from(form.transaction_id.as_str()),
    ) {
        Some(key) if db.transaction_key_taken(&key) => {
            errors.push("transaction_id", "This transaction ID already exists.");
            None
        }
        other => other,
    };

    let billing = errors.check("billing_id", parse_bill_ref(db, &form.billing_id));
    let amount = errors.check("amount", positive_amount(&form.amount));
    let payment_method = errors.check("payment_method", parse_payment_method(&form.payment_method));
    let reference_number = errors.check("reference_number", short_text(&form.reference_number));

    match (transaction_id, billing, amount, payment_method) {
        (Some(transaction_id), Some(billing), Some(amount), Some(payment_method))
            if errors.is_empty() =>
        {
            Ok(TransactionFields {
                transaction_id,
                billing,
                amount,
                payment_method,
                reference_number: reference_number.unwrap_or_default(),
            })
        }
        _ => Err(errors.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use rust_decimal_macros::dec;

    use crate::utils::password_utils::PWHash;

    const PASSWORD: &str = "correct horse battery staple";

    // Hashing is deliberately slow; share one hash across tests.
    static TEST_HASH: Lazy<PWHash> = Lazy::new(|| hash(PASSWORD));

    fn service() -> Service {
        Service::new(Database::default())
    }

    fn client() -> ClientMeta {
        ClientMeta {
            ip_address: "127.0.0.1".to_string(),
            user_agent: "test".to_string(),
        }
    }

    fn seed_user(service: &Service, username: &str, role: Role) -> Identity {
        let user = User {
            id: UserId::new(),
            username: Username::try_from(username).unwrap(),
            password: TEST_HASH.clone(),
            email: EmailAddress::try_from(format!("{username}@example.com").as_str()).unwrap(),
            role,
            full_name: format!("Test {username}"),
            is_active: true,
            created_at: Utc::now(),
        };
        let identity = Identity {
            user_id: user.id,
            role,
            full_name: user.full_name.clone(),
        };
        service.db.write().unwrap().store_user(user);
        identity
    }

    fn patient_form(key: &str) -> PatientForm {
        PatientForm {
            patient_id: key.to_string(),
            first_name: "John".to_string(),
            last_name: "Smith".to_string(),
            date_of_birth: "1985-03-01".to_string(),
            gender: "Male".to_string(),
            phone: "021 123 45 67".to_string(),
            email: "john.smith@example.com".to_string(),
            address: "1 Main Street".to_string(),
            ..Default::default()
        }
    }

    fn stored_appointment(
        service: &Service,
        patient: PatientId,
        doctor: UserId,
        key: &str,
        status: AppointmentStatus,
    ) -> AppointmentId {
        let appointment = Appointment {
            id: AppointmentId::new(),
            appointment_id: BusinessKey::try_from(key).unwrap(),
            patient,
            doctor,
            appointment_date: Utc::now().date_naive(),
            appointment_time: chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            appointment_type: "Consultation".to_string(),
            status,
            notes: String::new(),
            created_by: doctor,
            created_at: Utc::now(),
        };
        let id = appointment.id;
        service.db.write().unwrap().store_appointment(appointment);
        id
    }

    fn stored_bill(
        service: &Service,
        patient: PatientId,
        created_by: UserId,
        key: &str,
        total: Decimal,
        paid: Decimal,
    ) -> BillingId {
        let mut bill = Billing {
            id: BillingId::new(),
            bill_id: BusinessKey::try_from(key).unwrap(),
            patient,
            appointment: None,
            total_amount: total,
            paid_amount: paid,
            payment_status: PaymentStatus::Pending,
            billing_date: Utc::now().date_naive(),
            due_date: None,
            notes: String::new(),
            created_by,
            created_at: Utc::now(),
        };
        bill.refresh_payment_status();
        let id = bill.id;
        service.db.write().unwrap().store_bill(bill);
        id
    }

    fn audit_count(service: &Service, action: ActionKind) -> usize {
        service
            .db
            .read()
            .unwrap()
            .audit_entries()
            .filter(|entry| entry.action == action)
            .count()
    }

    fn field_errors<T: std::fmt::Debug>(result: Result<T, ServiceError>) -> FieldErrors {
        match result {
            Err(ServiceError::Validation(errors)) => errors,
            other => panic!("expected validation errors, got {other:?}"),
        }
    }

    #[test]
    fn create_patient_records_one_audit_row() {
        let service = service();
        let secretary = seed_user(&service, "secretary1", Role::Secretary);

        let id = service
            .create_patient(&secretary, &client(), &patient_form("P001"))
            .unwrap();

        let stored = service.get_patient(id).unwrap();
        assert_eq!(stored.patient_id.as_ref(), "P001");
        assert!(stored.is_active);
        assert_eq!(stored.created_by, secretary.user_id);

        assert_eq!(audit_count(&service, ActionKind::Create), 1);
        let db = service.db.read().unwrap();
        let entry = db.audit_entries().next().unwrap();
        assert_eq!(entry.table_name, Some(EntityName::Patients));
        assert_eq!(entry.record_id, Some(id.to_string()));
        assert!(entry.old_values.is_none());
        assert!(entry.new_values.is_some());
    }

    #[test]
    fn patient_validation_collects_all_errors_and_stores_nothing() {
        let service = service();
        let secretary = seed_user(&service, "secretary1", Role::Secretary);

        let mut form = PatientForm::default();
        form.phone = "not-a-phone".to_string();

        let errors = field_errors(service.create_patient(&secretary, &client(), &form));
        for field in ["patient_id", "first_name", "last_name", "date_of_birth", "gender", "phone"] {
            assert!(errors.contains(field), "missing error for {field}");
        }

        assert!(service.list_patients().unwrap().is_empty());
        assert_eq!(audit_count(&service, ActionKind::Create), 0);
    }

    #[test]
    fn duplicate_patient_key_is_rejected_even_after_soft_delete() {
        let service = service();
        let secretary = seed_user(&service, "secretary1", Role::Secretary);

        let first = service
            .create_patient(&secretary, &client(), &patient_form("P001"))
            .unwrap();

        let errors = field_errors(service.create_patient(&secretary, &client(), &patient_form("P001")));
        assert!(errors.contains("patient_id"));

        // The key stays reserved by the retired row.
        service.delete_patient(&secretary, &client(), first).unwrap();
        let errors = field_errors(service.create_patient(&secretary, &client(), &patient_form("P001")));
        assert!(errors.contains("patient_id"));
    }

    #[test]
    fn update_keeps_own_key_and_audits_the_pre_image() {
        let service = service();
        let secretary = seed_user(&service, "secretary1", Role::Secretary);
        let id = service
            .create_patient(&secretary, &client(), &patient_form("P001"))
            .unwrap();

        let mut form = patient_form("P001");
        form.first_name = "Johnny".to_string();
        service.update_patient(&secretary, &client(), id, &form).unwrap();

        let stored = service.get_patient(id).unwrap();
        assert_eq!(stored.first_name.as_ref(), "Johnny");

        let db = service.db.read().unwrap();
        let update = db
            .audit_entries()
            .find(|entry| entry.action == ActionKind::Update)
            .unwrap();
        let old_values = update.old_values.as_ref().unwrap();
        assert_eq!(old_values["first_name"], "John");
    }

    #[test]
    fn soft_delete_hides_the_row_but_keeps_it() {
        let service = service();
        let secretary = seed_user(&service, "secretary1", Role::Secretary);
        let id = service
            .create_patient(&secretary, &client(), &patient_form("P001"))
            .unwrap();

        service.delete_patient(&secretary, &client(), id).unwrap();

        assert!(service.list_patients().unwrap().is_empty());
        let stored = service.get_patient(id).unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.patient_id.as_ref(), "P001");

        let db = service.db.read().unwrap();
        let delete = db
            .audit_entries()
            .find(|entry| entry.action == ActionKind::Delete)
            .unwrap();
        assert!(delete.old_values.is_some());
    }

    #[test]
    fn delete_reports_every_blocking_dependency() {
        let service = service();
        let secretary = seed_user(&service, "secretary1", Role::Secretary);
        let doctor = seed_user(&service, "doctor1", Role::Doctor);
        let id = service
            .create_patient(&secretary, &client(), &patient_form("P001"))
            .unwrap();

        stored_appointment(&service, id, doctor.user_id, "A001", AppointmentStatus::Scheduled);
        stored_appointment(&service, id, doctor.user_id, "A002", AppointmentStatus::Completed);
        stored_bill(&service, id, secretary.user_id, "B001", dec!(100), dec!(0));

        let check = service.delete_check(id).unwrap();
        assert!(!check.allowed);
        assert_eq!(
            check.blocking_reasons,
            vec![
                "Patient has 2 active appointment(s).".to_string(),
                "Patient has 1 unpaid bill(s).".to_string(),
            ]
        );

        match service.delete_patient(&secretary, &client(), id) {
            Err(ServiceError::ReferentialBlock(reasons)) => assert_eq!(reasons.len(), 2),
            other => panic!("expected a referential block, got {other:?}"),
        }
        assert!(service.get_patient(id).unwrap().is_active);
        assert_eq!(audit_count(&service, ActionKind::Delete), 0);
    }

    #[test]
    fn cancelled_and_paid_dependencies_do_not_block_delete() {
        let service = service();
        let secretary = seed_user(&service, "secretary1", Role::Secretary);
        let doctor = seed_user(&service, "doctor1", Role::Doctor);
        let id = service
            .create_patient(&secretary, &client(), &patient_form("P001"))
            .unwrap();

        stored_appointment(&service, id, doctor.user_id, "A001", AppointmentStatus::Cancelled);
        stored_bill(&service, id, secretary.user_id, "B001", dec!(100), dec!(100));

        assert!(service.delete_check(id).unwrap().allowed);
        service.delete_patient(&secretary, &client(), id).unwrap();
    }

    #[test]
    fn payments_move_the_bill_from_partial_to_paid() {
        let service = service();
        let secretary = seed_user(&service, "secretary1", Role::Secretary);
        let accountant = seed_user(&service, "accountant1", Role::Accountant);
        let patient = service
            .create_patient(&secretary, &client(), &patient_form("P001"))
            .unwrap();
        let bill = stored_bill(&service, patient, secretary.user_id, "B001", dec!(100), dec!(0));

        let form = TransactionForm {
            transaction_id: "T001".to_string(),
            billing_id: bill.to_string(),
            amount: "40.00".to_string(),
            payment_method: "Cash".to_string(),
            reference_number: String::new(),
        };
        service.record_payment(&accountant, &client(), &form).unwrap();

        let stored = service.get_bill(bill).unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Partial);
        assert_eq!(stored.balance(), dec!(60));

        let form = TransactionForm {
            transaction_id: "T002".to_string(),
            billing_id: bill.to_string(),
            amount: "60.00".to_string(),
            payment_method: "Credit Card".to_string(),
            reference_number: "REF-1".to_string(),
        };
        service.record_payment(&accountant, &client(), &form).unwrap();

        let stored = service.get_bill(bill).unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
        assert_eq!(stored.balance(), dec!(0));

        // One audit row per payment, on the transactions entity.
        let db = service.db.read().unwrap();
        let payment_rows = db
            .audit_entries()
            .filter(|entry| entry.table_name == Some(EntityName::Transactions))
            .count();
        assert_eq!(payment_rows, 2);
    }

    #[test]
    fn duplicate_transaction_id_is_rejected() {
        let service = service();
        let secretary = seed_user(&service, "secretary1", Role::Secretary);
        let accountant = seed_user(&service, "accountant1", Role::Accountant);
        let patient = service
            .create_patient(&secretary, &client(), &patient_form("P001"))
            .unwrap();
        let bill = stored_bill(&service, patient, secretary.user_id, "B001", dec!(100), dec!(0));

        let form = TransactionForm {
            transaction_id: "T001".to_string(),
            billing_id: bill.to_string(),
            amount: "10".to_string(),
            payment_method: "Cash".to_string(),
            reference_number: String::new(),
        };
        service.record_payment(&accountant, &client(), &form).unwrap();

        let errors = field_errors(service.record_payment(&accountant, &client(), &form));
        assert!(errors.contains("transaction_id"));

        // The failed attempt must not have touched the bill.
        assert_eq!(service.get_bill(bill).unwrap().paid_amount, dec!(10));
    }

    #[test]
    fn login_verifies_audits_and_rate_limits() {
        let service = service();
        seed_user(&service, "doctor1", Role::Doctor);

        let good = LoginForm {
            username: "doctor1".to_string(),
            password: PASSWORD.to_string(),
        };
        let bad = LoginForm {
            username: "doctor1".to_string(),
            password: "wrong".to_string(),
        };

        let identity = service.login(&client(), &good).unwrap();
        assert_eq!(identity.role, Role::Doctor);
        assert_eq!(audit_count(&service, ActionKind::Login), 1);

        // Unknown accounts fail with the same generic error.
        let unknown = LoginForm {
            username: "nobody".to_string(),
            password: "wrong".to_string(),
        };
        assert!(matches!(
            service.login(&client(), &unknown),
            Err(ServiceError::InvalidCredentials)
        ));

        for _ in 0..MAX_LOGIN_ATTEMPTS {
            assert!(matches!(
                service.login(&client(), &bad),
                Err(ServiceError::InvalidCredentials)
            ));
        }
        assert_eq!(audit_count(&service, ActionKind::FailedLogin), MAX_LOGIN_ATTEMPTS + 1);

        // The window is per username: doctor1 is locked out even with
        // the right password, other accounts are not affected.
        assert!(matches!(
            service.login(&client(), &good),
            Err(ServiceError::RateLimited)
        ));
        seed_user(&service, "secretary1", Role::Secretary);
        let other = LoginForm {
            username: "secretary1".to_string(),
            password: PASSWORD.to_string(),
        };
        assert!(service.login(&client(), &other).is_ok());
    }

    #[test]
    fn password_change_enforces_policy_and_confirmation() {
        let service = service();
        let doctor = seed_user(&service, "doctor1", Role::Doctor);

        let weak = PasswordForm {
            new_password: "short".to_string(),
            confirm_password: "short".to_string(),
        };
        let errors = field_errors(service.change_password(&doctor, &client(), &weak));
        assert!(errors.contains("new_password"));

        let mismatch = PasswordForm {
            new_password: "another strong passphrase 42".to_string(),
            confirm_password: "something else".to_string(),
        };
        let errors = field_errors(service.change_password(&doctor, &client(), &mismatch));
        assert!(errors.contains("confirm_password"));
        assert_eq!(audit_count(&service, ActionKind::PasswordChange), 0);

        let good = PasswordForm {
            new_password: "another strong passphrase 42".to_string(),
            confirm_password: "another strong passphrase 42".to_string(),
        };
        service.change_password(&doctor, &client(), &good).unwrap();
        assert_eq!(audit_count(&service, ActionKind::PasswordChange), 1);

        let relogin = LoginForm {
            username: "doctor1".to_string(),
            password: "another strong passphrase 42".to_string(),
        };
        assert!(service.login(&client(), &relogin).is_ok());
    }

    #[test]
    fn profile_returns_the_callers_own_account() {
        let service = service();
        let doctor = seed_user(&service, "doctor1", Role::Doctor);
        seed_user(&service, "secretary1", Role::Secretary);

        let view = service.profile(&doctor).unwrap();
        assert_eq!(view.id, doctor.user_id);
        assert_eq!(view.username.as_ref(), "doctor1");
        assert_eq!(view.role, Role::Doctor);
    }

    #[test]
    fn appointment_create_checks_references_and_date() {
        let service = service();
        let secretary = seed_user(&service, "secretary1", Role::Secretary);
        let doctor = seed_user(&service, "doctor1", Role::Doctor);
        let patient = service
            .create_patient(&secretary, &client(), &patient_form("P001"))
            .unwrap();

        let mut form = AppointmentForm {
            appointment_id: "A001".to_string(),
            patient_id: patient.to_string(),
            doctor_id: doctor.user_id.to_string(),
            appointment_date: (Utc::now().date_naive() + Duration::days(1))
                .format("%Y-%m-%d")
                .to_string(),
            appointment_time: "09:30".to_string(),
            appointment_type: "Consultation".to_string(),
            ..Default::default()
        };

        let id = service
            .create_appointment(&secretary, &client(), &form)
            .unwrap();
        assert_eq!(
            service.get_appointment(id).unwrap().status,
            AppointmentStatus::Scheduled
        );

        // A secretary is not a valid appointment target, and new
        // appointments may not lie in the past.
        form.appointment_id = "A002".to_string();
        form.doctor_id = secretary.user_id.to_string();
        form.appointment_date = "2020-01-01".to_string();
        let errors = field_errors(service.create_appointment(&secretary, &client(), &form));
        assert!(errors.contains("doctor_id"));
        assert!(errors.contains("appointment_date"));
    }

    #[test]
    fn billing_due_date_may_not_precede_billing_date() {
        let service = service();
        let secretary = seed_user(&service, "secretary1", Role::Secretary);
        let patient = service
            .create_patient(&secretary, &client(), &patient_form("P001"))
            .unwrap();

        let form = BillingForm {
            bill_id: "B001".to_string(),
            patient_id: patient.to_string(),
            total_amount: "150.00".to_string(),
            billing_date: "2024-06-10".to_string(),
            due_date: "2024-06-01".to_string(),
            ..Default::default()
        };
        let errors = field_errors(service.create_bill(&secretary, &client(), &form));
        assert!(errors.contains("due_date"));

        let form = BillingForm {
            due_date: "2024-07-10".to_string(),
            ..form
        };
        let id = service.create_bill(&secretary, &client(), &form).unwrap();
        let stored = service.get_bill(id).unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Pending);
        assert_eq!(stored.paid_amount, dec!(0));
    }

    #[test]
    fn only_completed_appointments_of_the_same_patient_are_billable() {
        let service = service();
        let secretary = seed_user(&service, "secretary1", Role::Secretary);
        let doctor = seed_user(&service, "doctor1", Role::Doctor);
        let patient = service
            .create_patient(&secretary, &client(), &patient_form("P001"))
            .unwrap();
        let other = service
            .create_patient(&secretary, &client(), &patient_form("P002"))
            .unwrap();

        let scheduled =
            stored_appointment(&service, patient, doctor.user_id, "A001", AppointmentStatus::Scheduled);
        let completed =
            stored_appointment(&service, patient, doctor.user_id, "A002", AppointmentStatus::Completed);

        let mut form = BillingForm {
            bill_id: "B001".to_string(),
            patient_id: patient.to_string(),
            appointment_id: scheduled.to_string(),
            total_amount: "80".to_string(),
            billing_date: "2024-06-10".to_string(),
            ..Default::default()
        };
        let errors = field_errors(service.create_bill(&secretary, &client(), &form));
        assert!(errors.contains("appointment_id"));

        // The completed appointment belongs to a different patient.
        form.patient_id = other.to_string();
        form.appointment_id = completed.to_string();
        let errors = field_errors(service.create_bill(&secretary, &client(), &form));
        assert!(errors.contains("appointment_id"));

        form.patient_id = patient.to_string();
        assert!(service.create_bill(&secretary, &client(), &form).is_ok());
    }

    #[test]
    fn dashboard_counts_todays_activity() {
        let service = service();
        let secretary = seed_user(&service, "secretary1", Role::Secretary);
        let doctor = seed_user(&service, "doctor1", Role::Doctor);
        let accountant = seed_user(&service, "accountant1", Role::Accountant);
        let today = Utc::now().date_naive();

        let patient = service
            .create_patient(&secretary, &client(), &patient_form("P001"))
            .unwrap();
        stored_appointment(&service, patient, doctor.user_id, "A001", AppointmentStatus::Scheduled);
        stored_appointment(&service, patient, doctor.user_id, "A002", AppointmentStatus::Completed);
        let bill = stored_bill(&service, patient, secretary.user_id, "B001", dec!(200), dec!(0));

        let form = TransactionForm {
            transaction_id: "T001".to_string(),
            billing_id: bill.to_string(),
            amount: "50".to_string(),
            payment_method: "Cash".to_string(),
            reference_number: String::new(),
        };
        service.record_payment(&accountant, &client(), &form).unwrap();

        let stats = service.dashboard(today).unwrap();
        assert_eq!(stats.total_patients, 1);
        assert_eq!(stats.today_appointments, 1);
        assert_eq!(stats.pending_bills, 1);
        assert_eq!(stats.today_revenue, dec!(50));
        assert_eq!(stats.recent_transactions.len(), 1);
        assert_eq!(stats.recent_transactions[0].patient_name, "John Smith");
    }

    #[test]
    fn financial_report_groups_by_method_and_status() {
        let service = service();
        let secretary = seed_user(&service, "secretary1", Role::Secretary);
        let accountant = seed_user(&service, "accountant1", Role::Accountant);
        let today = Utc::now().date_naive();

        let patient = service
            .create_patient(&secretary, &client(), &patient_form("P001"))
            .unwrap();
        let first = stored_bill(&service, patient, secretary.user_id, "B001", dec!(100), dec!(0));
        let second = stored_bill(&service, patient, secretary.user_id, "B002", dec!(50), dec!(0));

        for (key, bill, amount, method) in [
            ("T001", first, "60", "Cash"),
            ("T002", first, "40", "Cash"),
            ("T003", second, "50", "Insurance"),
        ] {
            let form = TransactionForm {
                transaction_id: key.to_string(),
                billing_id: bill.to_string(),
                amount: amount.to_string(),
                payment_method: method.to_string(),
                reference_number: String::new(),
            };
            service.record_payment(&accountant, &client(), &form).unwrap();
        }

        let report = service.financial_report(today, today).unwrap();
        assert_eq!(report.total_revenue, dec!(150));

        assert_eq!(report.transactions_by_method.len(), 2);
        let cash = report
            .transactions_by_method
            .iter()
            .find(|summary| summary.payment_method == PaymentMethod::Cash)
            .unwrap();
        assert_eq!(cash.count, 2);
        assert_eq!(cash.amount, dec!(100));

        // Both bills are fully paid by now, so one status group remains.
        assert_eq!(report.billing_by_status.len(), 1);
        assert_eq!(report.billing_by_status[0].payment_status, PaymentStatus::Paid);
        assert_eq!(report.billing_by_status[0].total_balance, dec!(0));

        // An empty range reports nothing.
        let yesterday = today - Duration::days(1);
        let empty = service.financial_report(yesterday, yesterday).unwrap();
        assert_eq!(empty.total_revenue, dec!(0));
        assert!(empty.transactions_by_method.is_empty());
    }
}
