//! Secret handling utilities.
//!
//! Re-exports the secrecy types callers need to read `Config::database_url`.

pub use secrecy::{ExposeSecret, SecretString};
