use async_trait::async_trait;

use crate::credential::Credential;
use crate::error::{Result, ScreeningError};

/// Shortest password the auth backend accepts on registration.
pub const MIN_PASSWORD_LEN: usize = 6;

/// What a successful login call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    /// The response carried a complete token payload.
    Authenticated(Credential),
    /// The backend accepted the login but issued no credential.
    Acknowledged(String),
}

/// External login / register endpoints.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, subject_id: &str, password: &str) -> Result<LoginOutcome>;

    /// Returns the server's confirmation message.
    async fn register(&self, subject_id: &str, password: &str) -> Result<String>;
}

pub fn validate_login(subject_id: &str, password: &str) -> Result<()> {
    if subject_id.trim().is_empty() || password.is_empty() {
        return Err(ScreeningError::Unauthenticated);
    }
    Ok(())
}

pub fn validate_registration(subject_id: &str, password: &str) -> Result<()> {
    if subject_id.trim().is_empty() || password.is_empty() {
        return Err(ScreeningError::InvalidRegistration(
            "National ID and password are required".to_string(),
        ));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ScreeningError::InvalidRegistration(format!(
            "Password must be at least {} characters long",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}
