//! JWT Auth Backend Library
//!
//! Token issuance, validation and revocation for HTTP services.
//! Handlers and middleware are exported for the host application to mount.

pub mod auth;
pub mod config;
pub mod error;

pub use config::AuthConfig;
pub use error::{AuthError, StoreError};
