//! Validated wrapper types for form input.
//!
//! Every type here can only be constructed through validation, so a
//! handler that holds one is guaranteed the value met the format rules.
//! Validation failures carry the user-facing message for the field; the
//! services collect them per field instead of failing on the first one.

use std::collections::BTreeMap;
use std::fmt;

use ammonia::is_html;
use chrono::{NaiveDate, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{ValidateEmail, ValidateNonControlCharacter};

use crate::consts::{MAX_SHORT_TEXT_LENGTH, MAX_TEXT_LENGTH};

static USERNAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z][a-zA-Z0-9_]{2,19}$").expect("Failed to compile username regex")
});

static NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z\s]*$").expect("Failed to compile name regex"));

static PHONE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9\-\+\(\)\s]+$").expect("Failed to compile phone regex"));

static BUSINESS_KEY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-]{0,19}$")
        .expect("Failed to compile business key regex")
});

/// A rejected field value, carrying the message shown next to the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct InvalidField(pub &'static str);

/// Per-field validation errors, collected across the whole form before
/// anything is persisted.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

impl FieldErrors {
    pub fn push(&mut self, field: &str, message: impl Into<String>) {
        self.0.entry(field.to_string()).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Folds a single field validation into the collection, keeping the
    /// value only when it passed.
    pub fn check<T>(&mut self, field: &str, result: Result<T, InvalidField>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                self.push(field, error.to_string());
                None
            }
        }
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.0 {
            for message in messages {
                if !first {
                    write!(f, " ")?;
                }
                write!(f, "{field}: {message}")?;
                first = false;
            }
        }
        Ok(())
    }
}

macro_rules! string_newtype {
    ($name:ident) => {
        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = InvalidField;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::try_from(value.as_str())
            }
        }
    };
}

/// A validated login name.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Username(String);
string_newtype!(Username);

impl TryFrom<&str> for Username {
    type Error = InvalidField;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(InvalidField("Please enter a username."));
        }
        if !USERNAME_REGEX.is_match(trimmed) {
            return Err(InvalidField("Please enter a valid username."));
        }
        Ok(Self(trimmed.to_owned()))
    }
}

/// A person name: letters and spaces only.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PersonName(String);
string_newtype!(PersonName);

impl TryFrom<&str> for PersonName {
    type Error = InvalidField;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(InvalidField("Please enter a name."));
        }
        if trimmed.len() > MAX_SHORT_TEXT_LENGTH || !NAME_REGEX.is_match(trimmed) {
            return Err(InvalidField("Please enter a valid name."));
        }
        Ok(Self(trimmed.to_owned()))
    }
}

/// A phone number: digits plus `+-() ` and spaces.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhoneNumber(String);
string_newtype!(PhoneNumber);

impl TryFrom<&str> for PhoneNumber {
    type Error = InvalidField;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(InvalidField("Please enter a phone number."));
        }
        if trimmed.len() > 32 || !PHONE_REGEX.is_match(trimmed) {
            return Err(InvalidField("Please enter a valid phone number."));
        }
        Ok(Self(trimmed.to_owned()))
    }
}

/// A validated email address, normalized to lowercase.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EmailAddress(String);
string_newtype!(EmailAddress);

impl TryFrom<&str> for EmailAddress {
    type Error = InvalidField;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(InvalidField("Please enter an email address."));
        }
        if trimmed.len() > 254 || !trimmed.validate_email() {
            return Err(InvalidField("Please enter a valid email address."));
        }
        Ok(Self(trimmed.to_lowercase()))
    }
}

/// A caller-supplied record identifier such as "P001" or "BILL-12".
/// Uniqueness against the store is checked separately; this type only
/// guarantees the format.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BusinessKey(String);
string_newtype!(BusinessKey);

impl TryFrom<&str> for BusinessKey {
    type Error = InvalidField;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(InvalidField("Please enter an ID."));
        }
        if !BUSINESS_KEY_REGEX.is_match(trimmed) {
            return Err(InvalidField("Please enter a valid ID."));
        }
        Ok(Self(trimmed.to_owned()))
    }
}

/// Validates free-text fields (addresses, notes, history). The text is
/// trimmed and rejected if it embeds HTML or control characters.
pub fn free_text(value: &str, max_length: usize) -> Result<String, InvalidField> {
    let trimmed = value.trim();
    if trimmed.len() > max_length {
        return Err(InvalidField("This text is too long."));
    }
    if !trimmed.validate_non_control_character() {
        return Err(InvalidField("This text contains invalid characters."));
    }
    if is_html(trimmed) {
        return Err(InvalidField("This text may not contain HTML."));
    }
    Ok(trimmed.to_owned())
}

pub fn short_text(value: &str) -> Result<String, InvalidField> {
    free_text(value, MAX_SHORT_TEXT_LENGTH)
}

pub fn long_text(value: &str) -> Result<String, InvalidField> {
    free_text(value, MAX_TEXT_LENGTH)
}

/// A required short text field (appointment type and similar).
pub fn required_short_text(value: &str) -> Result<String, InvalidField> {
    let text = short_text(value)?;
    if text.is_empty() {
        return Err(InvalidField("This field is required."));
    }
    Ok(text)
}

/// Parses a positive monetary amount with at most two decimal places.
pub fn positive_amount(value: &str) -> Result<Decimal, InvalidField> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(InvalidField("Please enter an amount."));
    }
    let amount: Decimal = trimmed
        .parse()
        .map_err(|_| InvalidField("Please enter a valid positive number."))?;
    if amount <= Decimal::ZERO || amount.scale() > 2 {
        return Err(InvalidField("Please enter a valid positive number."));
    }
    Ok(amount)
}

/// Parses a `YYYY-MM-DD` calendar date.
pub fn calendar_date(value: &str) -> Result<NaiveDate, InvalidField> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(InvalidField("Please enter a date."));
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .map_err(|_| InvalidField("Please enter a valid date."))
}

/// A calendar date that must not lie in the future (dates of birth).
pub fn past_or_present_date(value: &str, today: NaiveDate) -> Result<NaiveDate, InvalidField> {
    let date = calendar_date(value)?;
    if date > today {
        return Err(InvalidField("This date may not be in the future."));
    }
    Ok(date)
}

/// A calendar date that must not lie in the past (appointment dates).
pub fn future_or_present_date(value: &str, today: NaiveDate) -> Result<NaiveDate, InvalidField> {
    let date = calendar_date(value)?;
    if date < today {
        return Err(InvalidField("This date may not be in the past."));
    }
    Ok(date)
}

/// Parses a `HH:MM` time of day.
pub fn time_of_day(value: &str) -> Result<NaiveTime, InvalidField> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(InvalidField("Please enter a time."));
    }
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
        .map_err(|_| InvalidField("Please enter a valid time."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_username() {
        let valid_cases = vec!["alice123", "Bob_user", "frontdesk", "john_doe_42"];

        for username in valid_cases {
            assert!(
                Username::try_from(username).is_ok(),
                "Valid username {} was rejected !",
                username
            );
        }
    }

    #[test]
    fn test_invalid_username() {
        let invalid_cases = vec![
            "a",
            "123starts_with_numbers",
            "_starts_with_underscore",
            "very_very_long_username_that_exceeds_limit",
            "special@character",
            "has space",
            "",
        ];

        for username in invalid_cases {
            assert!(
                Username::try_from(username).is_err(),
                "Invalid username {} was approved !",
                username
            );
        }
    }

    #[test]
    fn test_person_name() {
        for name in ["John", "Mary Jane", "de la Cruz"] {
            assert!(PersonName::try_from(name).is_ok(), "rejected {name}");
        }
        for name in ["", "   ", "J0hn", "O'Brien", "name!", "<b>x</b>"] {
            assert!(PersonName::try_from(name).is_err(), "accepted {name}");
        }
    }

    #[test]
    fn test_phone_number() {
        for phone in ["0211234567", "+41 21 123 45 67", "(555) 123-4567"] {
            assert!(PhoneNumber::try_from(phone).is_ok(), "rejected {phone}");
        }
        for phone in ["", "phone", "12345x", "+41.21"] {
            assert!(PhoneNumber::try_from(phone).is_err(), "accepted {phone}");
        }
    }

    #[test]
    fn test_email_normalization() {
        let email = EmailAddress::try_from("   USER@EXAMPLE.COM   ").unwrap();
        assert_eq!(email.as_ref(), "user@example.com");

        for email in ["", "not-an-email", "@example.com", "user@", "a b@c.com"] {
            assert!(EmailAddress::try_from(email).is_err(), "accepted {email}");
        }
    }

    #[test]
    fn test_business_key() {
        for key in ["P001", "BILL-12", "APT_2024_1", "7"] {
            assert!(BusinessKey::try_from(key).is_ok(), "rejected {key}");
        }
        for key in ["", "-starts-with-dash", "has space", "way_too_long_for_a_business_key"] {
            assert!(BusinessKey::try_from(key).is_err(), "accepted {key}");
        }
    }

    #[test]
    fn test_free_text_rejects_html_and_controls() {
        assert_eq!(short_text("  some notes  ").unwrap(), "some notes");
        assert!(short_text("<script>alert(1)</script>").is_err());
        assert!(short_text("bad\0text").is_err());
        // Empty is fine for optional fields; required fields ask separately.
        assert_eq!(short_text("").unwrap(), "");
        assert!(required_short_text("").is_err());
    }

    #[test]
    fn test_positive_amount() {
        assert_eq!(positive_amount("100.50").unwrap().to_string(), "100.50");
        for amount in ["", "0", "-5", "abc", "1.999"] {
            assert!(positive_amount(amount).is_err(), "accepted {amount}");
        }
    }

    #[test]
    fn test_date_bounds() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();

        assert!(past_or_present_date("1990-03-01", today).is_ok());
        assert!(past_or_present_date("2024-06-15", today).is_ok());
        assert!(past_or_present_date("2024-06-16", today).is_err());

        assert!(future_or_present_date("2024-06-15", today).is_ok());
        assert!(future_or_present_date("2024-06-14", today).is_err());

        assert!(calendar_date("2024-02-30").is_err());
        assert!(calendar_date("not a date").is_err());
    }

    #[test]
    fn test_time_of_day() {
        assert!(time_of_day("09:30").is_ok());
        assert!(time_of_day("14:00:00").is_ok());
        assert!(time_of_day("25:00").is_err());
        assert!(time_of_day("").is_err());
    }

    #[test]
    fn test_field_errors_collects_everything() {
        let mut errors = FieldErrors::default();
        let first: Option<PersonName> = errors.check("first_name", PersonName::try_from("J0hn"));
        let phone: Option<PhoneNumber> = errors.check("phone", PhoneNumber::try_from("0211234567"));

        assert!(first.is_none());
        assert!(phone.is_some());
        assert_eq!(errors.len(), 1);
        assert!(errors.contains("first_name"));
        assert!(!errors.contains("phone"));
    }
}
