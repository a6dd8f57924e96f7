//! Presence-check collaborator contract
//!
//! The platform prompt (biometric sheet, PIN pad, hardware button) lives
//! outside this crate. It receives a [`PresenceRequest`] describing the
//! operation that is already bound inside the secure boundary, and reports
//! back through a [`PresenceResponder`]. The responder is consumed by
//! [`PresenceResponder::resolve`], so an outcome is delivered at most once;
//! a responder dropped without resolving is read as a platform fault.
//!
//! Timeouts are the prompt's business: expiry should be reported as
//! [`PresenceOutcome::Cancelled`] or [`PresenceOutcome::PlatformError`].

use tokio::sync::oneshot;

use crate::boundary::OperationId;
use crate::challenge::Challenge;
use crate::config::{Authenticators, PromptText};
use crate::error::AuthError;

/// Result of one presence check, as reported by the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceOutcome {
    Success,
    /// Sample rejected, e.g. a non-matching fingerprint after the platform's
    /// allowed number of tries.
    UserDeclined,
    /// The user backed out, or the prompt expired.
    Cancelled,
    /// Sensor or platform fault unrelated to the user's action.
    PlatformError(String),
}

impl PresenceOutcome {
    /// Error for a non-success outcome.
    pub fn into_error(self) -> Option<AuthError> {
        match self {
            PresenceOutcome::Success => None,
            PresenceOutcome::UserDeclined => Some(AuthError::PresenceCheckFailed),
            PresenceOutcome::Cancelled => Some(AuthError::PresenceCheckCancelled),
            PresenceOutcome::PlatformError(detail) => Some(AuthError::PresenceCheckError(detail)),
        }
    }
}

/// Everything the prompt needs to show for one signing operation.
#[derive(Debug, Clone)]
pub struct PresenceRequest {
    /// Boundary operation the approval will complete.
    pub operation: OperationId,
    /// Alias of the key that will sign.
    pub key_alias: String,
    /// Exactly what will be signed.
    pub challenge: Challenge,
    pub text: PromptText,
    pub allowed: Authenticators,
}

/// Platform prompt that performs presence checks.
pub trait PresencePrompt: Send + Sync {
    /// Start a presence check and eventually resolve `responder`.
    ///
    /// Must not block: hand the request to the UI and return.
    fn present(&self, request: PresenceRequest, responder: PresenceResponder);
}

/// Reply slot for exactly one presence outcome.
#[derive(Debug)]
pub struct PresenceResponder {
    tx: oneshot::Sender<PresenceOutcome>,
}

impl PresenceResponder {
    /// Deliver the outcome. Has no effect if the attempt was already
    /// cancelled or dropped.
    pub fn resolve(self, outcome: PresenceOutcome) {
        let _ = self.tx.send(outcome);
    }

    /// Whether anybody is still waiting for this outcome.
    pub fn is_awaited(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Waiting side of a [`PresenceResponder`].
#[derive(Debug)]
pub struct PresenceReceiver {
    rx: oneshot::Receiver<PresenceOutcome>,
}

impl PresenceReceiver {
    /// Wait for the prompt's outcome.
    pub async fn outcome(self) -> PresenceOutcome {
        self.rx.await.unwrap_or_else(|_| {
            PresenceOutcome::PlatformError("presence prompt went away without reporting".into())
        })
    }
}

/// Create a connected responder/receiver pair.
pub fn channel() -> (PresenceResponder, PresenceReceiver) {
    let (tx, rx) = oneshot::channel();
    (PresenceResponder { tx }, PresenceReceiver { rx })
}
