//! Secret handling utilities.
//!
//! Re-exports secrecy types so callers reading `Config::database_url`
//! need no direct dependency on secrecy.

pub use secrecy::{ExposeSecret, SecretString};
