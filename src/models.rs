//! Domain model: typed identifiers, closed role/action/status
//! enumerations, and the persisted entities.
//!
//! Roles and audit actions are deliberately enums rather than strings,
//! so an invalid role or action is unrepresentable.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use derive_more::Display;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display as StrumDisplay, EnumIter, EnumString};
use uuid::Uuid;

use crate::utils::input_validation::{
    BusinessKey, EmailAddress, PersonName, PhoneNumber, Username,
};
use crate::utils::password_utils::PWHash;

/// Role of a staff account.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString,
    StrumDisplay,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Role {
    Doctor,
    Secretary,
    Developer,
    Accountant,
}

/// The closed vocabulary of auditable actions.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, EnumIter, StrumDisplay,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
    Login,
    Logout,
    FailedLogin,
    PasswordChange,
    BackupCreate,
    BackupRestore,
}

/// The entity (storage table) an audit entry refers to.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, EnumIter, StrumDisplay,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EntityName {
    Users,
    Patients,
    Appointments,
    Billing,
    Transactions,
}

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString,
    StrumDisplay,
)]
pub enum Gender {
    Male,
    Female,
    Other,
}

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString,
    StrumDisplay,
)]
pub enum AppointmentStatus {
    Scheduled,
    Completed,
    Cancelled,
    #[serde(rename = "No Show")]
    #[strum(serialize = "No Show")]
    NoShow,
}

/// Payment status as stored. `Overdue` is never written by a mutation:
/// it is derived at read time from the due date (see
/// [`Billing::effective_status`]).
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString,
    StrumDisplay,
)]
pub enum PaymentStatus {
    Pending,
    Partial,
    Paid,
    Overdue,
}

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString,
    StrumDisplay,
)]
pub enum PaymentMethod {
    Cash,
    #[serde(rename = "Credit Card")]
    #[strum(serialize = "Credit Card")]
    CreditCard,
    #[serde(rename = "Debit Card")]
    #[strum(serialize = "Debit Card")]
    DebitCard,
    Check,
    Insurance,
    #[serde(rename = "Bank Transfer")]
    #[strum(serialize = "Bank Transfer")]
    BankTransfer,
}

/// A unique user identifier.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Display,
)]
pub struct UserId(Uuid);

/// A unique patient identifier. Distinct from the caller-supplied
/// business key (`Patient::patient_id`).
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Display,
)]
pub struct PatientId(Uuid);

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Display,
)]
pub struct AppointmentId(Uuid);

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Display,
)]
pub struct BillingId(Uuid);

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Display,
)]
pub struct TransactionId(Uuid);

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Display,
)]
pub struct AuditLogId(Uuid);

macro_rules! impl_new_id {
    ($($id:ident),*) => {
        $(impl $id {
            #[allow(clippy::new_without_default)]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl From<Uuid> for $id {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        })*
    };
}

impl_new_id!(UserId, PatientId, AppointmentId, BillingId, TransactionId, AuditLogId);

/// A staff account. Accounts are seeded by an administrative bootstrap
/// and mutated only on password change; they are never hard-deleted.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct User {
    pub id: UserId,
    pub username: Username,
    pub password: PWHash,
    pub email: EmailAddress,
    pub role: Role,
    pub full_name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// A patient record. "Deleting" a patient only clears `is_active`;
/// the row is kept for audit and history.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Patient {
    pub id: PatientId,
    /// Caller-supplied business key, unique across active and inactive rows.
    pub patient_id: BusinessKey,
    pub first_name: PersonName,
    pub last_name: PersonName,
    pub date_of_birth: NaiveDate,
    pub gender: Gender,
    pub phone: Option<PhoneNumber>,
    pub email: Option<EmailAddress>,
    pub address: String,
    pub emergency_contact: String,
    pub emergency_phone: Option<PhoneNumber>,
    pub medical_history: String,
    pub allergies: String,
    pub insurance_provider: String,
    pub insurance_number: String,
    pub is_active: bool,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Patient {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Appointment {
    pub id: AppointmentId,
    pub appointment_id: BusinessKey,
    pub patient: PatientId,
    /// Must reference an active user with the doctor role.
    pub doctor: UserId,
    pub appointment_date: NaiveDate,
    pub appointment_time: NaiveTime,
    pub appointment_type: String,
    pub status: AppointmentStatus,
    pub notes: String,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Billing {
    pub id: BillingId,
    pub bill_id: BusinessKey,
    pub patient: PatientId,
    /// Optional link to the completed appointment being billed.
    pub appointment: Option<AppointmentId>,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub payment_status: PaymentStatus,
    pub billing_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub notes: String,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

impl Billing {
    /// Outstanding balance, always derived from the two amounts so it
    /// cannot drift out of sync with them.
    pub fn balance(&self) -> Decimal {
        self.total_amount - self.paid_amount
    }

    /// Recomputes the stored payment status from the amounts.
    /// Only Pending/Partial/Paid are ever stored.
    pub fn refresh_payment_status(&mut self) {
        self.payment_status = if self.balance() <= Decimal::ZERO {
            PaymentStatus::Paid
        } else if self.paid_amount > Decimal::ZERO {
            PaymentStatus::Partial
        } else {
            PaymentStatus::Pending
        };
    }

    /// Status as presented to readers: an unpaid bill past its due date
    /// reads as Overdue without any stored-state change.
    pub fn effective_status(&self, today: NaiveDate) -> PaymentStatus {
        match self.due_date {
            Some(due)
                if self.payment_status != PaymentStatus::Paid
                    && due < today
                    && self.balance() > Decimal::ZERO =>
            {
                PaymentStatus::Overdue
            }
            _ => self.payment_status,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub transaction_id: BusinessKey,
    pub billing: BillingId,
    pub amount: Decimal,
    pub payment_method: PaymentMethod,
    pub payment_date: DateTime<Utc>,
    pub reference_number: String,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

/// One appended row of the audit trail. Entries are never mutated or
/// deleted once written.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditLogEntry {
    pub id: AuditLogId,
    /// None for anonymous events such as failed logins.
    pub user_id: Option<UserId>,
    pub action: ActionKind,
    pub table_name: Option<EntityName>,
    pub record_id: Option<String>,
    pub old_values: Option<Value>,
    pub new_values: Option<Value>,
    pub ip_address: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bill(total: Decimal, paid: Decimal, due: Option<NaiveDate>) -> Billing {
        let mut bill = Billing {
            id: BillingId::new(),
            bill_id: BusinessKey::try_from("B001").unwrap(),
            patient: PatientId::new(),
            appointment: None,
            total_amount: total,
            paid_amount: paid,
            payment_status: PaymentStatus::Pending,
            billing_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            due_date: due,
            notes: String::new(),
            created_by: UserId::new(),
            created_at: Utc::now(),
        };
        bill.refresh_payment_status();
        bill
    }

    #[test]
    fn payment_status_follows_amounts() {
        assert_eq!(
            bill(dec!(100), dec!(0), None).payment_status,
            PaymentStatus::Pending
        );
        assert_eq!(
            bill(dec!(100), dec!(40), None).payment_status,
            PaymentStatus::Partial
        );
        assert_eq!(
            bill(dec!(100), dec!(100), None).payment_status,
            PaymentStatus::Paid
        );
        // Overpayment still settles the bill.
        assert_eq!(
            bill(dec!(100), dec!(120), None).payment_status,
            PaymentStatus::Paid
        );
    }

    #[test]
    fn overdue_is_computed_at_read_time() {
        let due = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let unpaid = bill(dec!(100), dec!(40), Some(due));

        // Stored status never becomes Overdue.
        assert_eq!(unpaid.payment_status, PaymentStatus::Partial);

        let before = NaiveDate::from_ymd_opt(2024, 1, 20).unwrap();
        let after = NaiveDate::from_ymd_opt(2024, 2, 2).unwrap();
        assert_eq!(unpaid.effective_status(before), PaymentStatus::Partial);
        assert_eq!(unpaid.effective_status(after), PaymentStatus::Overdue);

        // A settled bill never reads as overdue.
        let paid = bill(dec!(100), dec!(100), Some(due));
        assert_eq!(paid.effective_status(after), PaymentStatus::Paid);
    }

    #[test]
    fn action_kind_uses_audit_vocabulary() {
        assert_eq!(ActionKind::FailedLogin.to_string(), "FAILED_LOGIN");
        assert_eq!(ActionKind::PasswordChange.to_string(), "PASSWORD_CHANGE");
        assert_eq!(EntityName::Patients.to_string(), "patients");
        assert_eq!(Role::Secretary.to_string(), "secretary");
    }
}
