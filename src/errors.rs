//! Error types shared by every keyward component.

use thiserror::Error;

/// Errors produced by key generation, the crypto codec, the license
/// lifecycle and the storage layer.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// A generator rule set cannot produce keys (empty charset, zero chunks, ...).
    #[error("invalid rule set: {0}")]
    InvalidRuleSetError(String),

    /// No unused key could be found within the retry budget.
    #[error("keyspace exhausted: no unique license key after {attempts} attempts")]
    ExhaustedKeyspaceError { attempts: u32 },

    #[error("invalid license status: {0}")]
    InvalidStatusError(String),

    #[error("invalid date: {0}")]
    InvalidDateError(String),

    /// The key's digest already belongs to a stored license.
    #[error("a license with this key already exists")]
    DuplicateLicenseError,

    #[error(
        "activation ceiling exceeded: {times_activated} of {times_activated_max} activations used"
    )]
    ActivationCeilingExceededError {
        times_activated: i64,
        times_activated_max: i64,
    },

    #[error("license has not been activated")]
    NotActivatedError,

    #[error("not found: {0}")]
    NotFoundError(String),

    #[error("decryption failed: {0}")]
    DecryptError(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    /// A compare-and-set write kept losing against concurrent writers.
    #[error("concurrent modification: {0}")]
    ConflictError(String),

    #[error("{field}: {message}")]
    ValidationError { field: String, message: String },

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("database error: {0}")]
    DatabaseError(String),
}

impl LicenseError {
    /// Business-rule failures are never transient and must not be retried.
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            LicenseError::DuplicateLicenseError
                | LicenseError::ActivationCeilingExceededError { .. }
                | LicenseError::NotActivatedError
                | LicenseError::InvalidStatusError(_)
                | LicenseError::InvalidDateError(_)
                | LicenseError::InvalidRuleSetError(_)
        )
    }
}

pub type LicenseResult<T> = Result<T, LicenseError>;
