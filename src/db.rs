//! In-memory datastore with JSON persistence.
//!
//! All reads that feed user-facing listings must go through the
//! `active_*` accessors so that soft-deleted rows stay hidden; lookups
//! by internal id deliberately ignore the active flag so history and
//! audit views keep working.

use std::{
    collections::HashMap,
    fs::File,
    io::{self, ErrorKind::NotFound},
    path::PathBuf,
};

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{
    ActionKind, Appointment, AppointmentId, AuditLogEntry, Billing, BillingId, Patient,
    PatientId, Role, Transaction, TransactionId, User, UserId,
};
use crate::utils::input_validation::BusinessKey;

#[derive(Serialize, Deserialize, Default)]
pub struct Database {
    #[serde(skip)]
    path: Option<PathBuf>,
    users: HashMap<UserId, User>,
    patients: HashMap<PatientId, Patient>,
    appointments: HashMap<AppointmentId, Appointment>,
    billing: HashMap<BillingId, Billing>,
    transactions: HashMap<TransactionId, Transaction>,
    audit_log: Vec<AuditLogEntry>,
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Unknown user: {0}")]
    UnknownUser(UserId),
    #[error("Unknown patient: {0}")]
    UnknownPatient(PatientId),
    #[error("Unknown appointment: {0}")]
    UnknownAppointment(AppointmentId),
    #[error("Unknown bill: {0}")]
    UnknownBill(BillingId),
    #[error("Storage failure: {0}")]
    Storage(#[from] io::Error),
}

impl Database {
    pub fn open(path: PathBuf) -> Result<Self, io::Error> {
        match File::open(&path) {
            Ok(f) => {
                let mut db: Self = serde_json::from_reader(f)?;
                db.path = Some(path);
                Ok(db)
            }

            // Missing file: start from an empty store and persist it
            // right away so storage problems surface at startup.
            Err(not_found) if not_found.kind() == NotFound => {
                info!("Datastore not found, creating new empty store");
                let mut new_db = Database::default();
                new_db.path = Some(path);
                new_db.save()?;
                Ok(new_db)
            }

            Err(other) => Err(other),
        }
    }

    pub fn save(&self) -> Result<(), io::Error> {
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = File::create(path)?;
            serde_json::to_writer_pretty(file, self)?;
        }
        Ok(())
    }

    // --- users ---

    pub fn get_user(&self, user: UserId) -> Result<&User, DbError> {
        self.users.get(&user).ok_or(DbError::UnknownUser(user))
    }

    pub fn get_user_mut(&mut self, user: UserId) -> Result<&mut User, DbError> {
        self.users.get_mut(&user).ok_or(DbError::UnknownUser(user))
    }

    /// Looks up an active account by login name. Inactive accounts are
    /// invisible to the login flow.
    pub fn lookup_active_username(&self, name: &str) -> Option<&User> {
        self.users
            .values()
            .find(|user| user.is_active && user.username.as_ref() == name)
    }

    pub fn store_user(&mut self, user: User) {
        self.users.insert(user.id, user);
    }

    pub fn users(&self) -> impl Iterator<Item = &User> + '_ {
        self.users.values()
    }

    pub fn has_users(&self) -> bool {
        !self.users.is_empty()
    }

    /// Active users holding the doctor role, eligible as appointment targets.
    pub fn active_doctors(&self) -> impl Iterator<Item = &User> + '_ {
        self.users
            .values()
            .filter(|user| user.is_active && user.role == Role::Doctor)
    }

    // --- patients ---

    pub fn get_patient(&self, patient: PatientId) -> Result<&Patient, DbError> {
        self.patients
            .get(&patient)
            .ok_or(DbError::UnknownPatient(patient))
    }

    pub fn get_patient_mut(&mut self, patient: PatientId) -> Result<&mut Patient, DbError> {
        self.patients
            .get_mut(&patient)
            .ok_or(DbError::UnknownPatient(patient))
    }

    pub fn store_patient(&mut self, patient: Patient) {
        self.patients.insert(patient.id, patient);
    }

    pub fn active_patients(&self) -> impl Iterator<Item = &Patient> + '_ {
        self.patients.values().filter(|patient| patient.is_active)
    }

    /// Business-key uniqueness spans active AND soft-deleted rows, so a
    /// retired record keeps its key reserved.
    pub fn patient_key_taken(&self, key: &BusinessKey, exclude: Option<PatientId>) -> bool {
        self.patients
            .values()
            .any(|patient| Some(patient.id) != exclude && patient.patient_id == *key)
    }

    // --- appointments ---

    pub fn get_appointment(&self, id: AppointmentId) -> Result<&Appointment, DbError> {
        self.appointments
            .get(&id)
            .ok_or(DbError::UnknownAppointment(id))
    }

    pub fn store_appointment(&mut self, appointment: Appointment) {
        self.appointments.insert(appointment.id, appointment);
    }

    pub fn appointments(&self) -> impl Iterator<Item = &Appointment> + '_ {
        self.appointments.values()
    }

    pub fn appointments_for_patient(
        &self,
        patient: PatientId,
    ) -> impl Iterator<Item = &Appointment> + '_ {
        self.appointments
            .values()
            .filter(move |appointment| appointment.patient == patient)
    }

    pub fn appointment_key_taken(
        &self,
        key: &BusinessKey,
        exclude: Option<AppointmentId>,
    ) -> bool {
        self.appointments
            .values()
            .any(|appointment| Some(appointment.id) != exclude && appointment.appointment_id == *key)
    }

    // --- billing ---

    pub fn get_bill(&self, id: BillingId) -> Result<&Billing, DbError> {
        self.billing.get(&id).ok_or(DbError::UnknownBill(id))
    }

    pub fn get_bill_mut(&mut self, id: BillingId) -> Result<&mut Billing, DbError> {
        self.billing.get_mut(&id).ok_or(DbError::UnknownBill(id))
    }

    pub fn store_bill(&mut self, bill: Billing) {
        self.billing.insert(bill.id, bill);
    }

    pub fn bills(&self) -> impl Iterator<Item = &Billing> + '_ {
        self.billing.values()
    }

    pub fn bills_for_patient(&self, patient: PatientId) -> impl Iterator<Item = &Billing> + '_ {
        self.billing.values().filter(move |bill| bill.patient == patient)
    }

    pub fn bill_key_taken(&self, key: &BusinessKey, exclude: Option<BillingId>) -> bool {
        self.billing
            .values()
            .any(|bill| Some(bill.id) != exclude && bill.bill_id == *key)
    }

    // --- transactions ---

    pub fn store_transaction(&mut self, transaction: Transaction) {
        self.transactions.insert(transaction.id, transaction);
    }

    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> + '_ {
        self.transactions.values()
    }

    pub fn transaction_key_taken(&self, key: &BusinessKey) -> bool {
        self.transactions
            .values()
            .any(|transaction| transaction.transaction_id == *key)
    }

    // --- audit trail ---

    /// Appends one audit entry. The log is append-only: nothing in this
    /// module (or anywhere else) mutates or removes entries.
    pub fn append_audit(&mut self, entry: AuditLogEntry) {
        self.audit_log.push(entry);
    }

    pub fn audit_entries(&self) -> impl Iterator<Item = &AuditLogEntry> + '_ {
        self.audit_log.iter()
    }

    /// Counts failed logins recorded for a username since the cutoff,
    /// for login rate limiting.
    pub fn failed_logins_since(&self, username: &str, cutoff: DateTime<Utc>) -> usize {
        self.audit_log
            .iter()
            .filter(|entry| entry.action == ActionKind::FailedLogin)
            .filter(|entry| entry.created_at >= cutoff)
            .filter(|entry| {
                entry
                    .new_values
                    .as_ref()
                    .and_then(|values| values.get("username"))
                    .and_then(|value| value.as_str())
                    == Some(username)
            })
            .count()
    }
}
