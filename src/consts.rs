//! Global constants for the application.

pub const HTTP_PORT: u16 = 8080; // Default port for the web server.
pub const DB_PATH: &str = "./data/clinic.json"; // Default path of the JSON datastore.

/// Session key under which the authenticated identity is stored.
pub const SESSION_IDENTITY_KEY: &str = "identity";

/// Sessions are rotated and expire after this many minutes of inactivity.
pub const SESSION_MAX_AGE_MINUTES: i64 = 30;

/// A username is locked out after this many failed logins...
pub const MAX_LOGIN_ATTEMPTS: usize = 5;
/// ...within this window.
pub const LOGIN_ATTEMPT_WINDOW_MINUTES: i64 = 15;

/// Maximum length for short free-text fields (names of providers, references).
pub const MAX_SHORT_TEXT_LENGTH: usize = 250;
/// Maximum length for long free-text fields (medical history, notes).
pub const MAX_TEXT_LENGTH: usize = 2_000;

/// Password policy bounds, checked together with a strength estimate.
pub const MIN_PASSWORD_LENGTH: usize = 8;
pub const MAX_PASSWORD_LENGTH: usize = 64;
