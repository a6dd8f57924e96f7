//! Error taxonomy for token issuance
//!
//! Every outcome is terminal for the attempt that produced it. Whether the
//! user is asked again is the caller's decision, guided by
//! [`AuthError::caller_may_retry`].

use thiserror::Error;

/// Errors surfaced by [`crate::Authenticator::authenticate`] and its parts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("secure key store unavailable: {0}")]
    KeyStoreUnavailable(String),
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),
    #[error("invalid challenge input: {0}")]
    InvalidChallengeInput(String),
    #[error("presence check failed")]
    PresenceCheckFailed,
    #[error("presence check cancelled")]
    PresenceCheckCancelled,
    #[error("presence check error: {0}")]
    PresenceCheckError(String),
    #[error("signing key unavailable: {0}")]
    KeyUnavailable(String),
    #[error("an authentication session is already in progress")]
    SessionAlreadyInProgress,
    #[error(transparent)]
    TokenMalformed(#[from] TokenMalformed),
}

/// Fieldless discriminant of [`AuthError`], carried by failed sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    KeyStoreUnavailable,
    KeyGenerationFailed,
    InvalidChallengeInput,
    PresenceCheckFailed,
    PresenceCheckCancelled,
    PresenceCheckError,
    KeyUnavailable,
    SessionAlreadyInProgress,
    TokenMalformed,
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::KeyStoreUnavailable(_) => ErrorKind::KeyStoreUnavailable,
            AuthError::KeyGenerationFailed(_) => ErrorKind::KeyGenerationFailed,
            AuthError::InvalidChallengeInput(_) => ErrorKind::InvalidChallengeInput,
            AuthError::PresenceCheckFailed => ErrorKind::PresenceCheckFailed,
            AuthError::PresenceCheckCancelled => ErrorKind::PresenceCheckCancelled,
            AuthError::PresenceCheckError(_) => ErrorKind::PresenceCheckError,
            AuthError::KeyUnavailable(_) => ErrorKind::KeyUnavailable,
            AuthError::SessionAlreadyInProgress => ErrorKind::SessionAlreadyInProgress,
            AuthError::TokenMalformed(_) => ErrorKind::TokenMalformed,
        }
    }

    /// Whether a later `authenticate()` call can reasonably succeed without
    /// the user or the integrator changing anything first.
    ///
    /// `KeyGenerationFailed` needs a presence credential to be enrolled,
    /// `InvalidChallengeInput` is a caller bug and `TokenMalformed` is a
    /// rejection, so none of those are retryable.
    pub fn caller_may_retry(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::KeyStoreUnavailable
                | ErrorKind::PresenceCheckFailed
                | ErrorKind::PresenceCheckCancelled
                | ErrorKind::PresenceCheckError
                | ErrorKind::KeyUnavailable
                | ErrorKind::SessionAlreadyInProgress
        )
    }
}

/// A token that does not have the `<base64>.<purpose>:<millis>:<device>` shape.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed token: {reason}")]
pub struct TokenMalformed {
    reason: String,
}

impl TokenMalformed {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}
