//! Presence-gated signing
//!
//! Signing happens in two steps with the presence check between them:
//!
//! 1. [`PresenceGatedSigner::bind`] hands the challenge bytes to the secure
//!    boundary and gets back a [`PendingSignature`]. From here on the bytes
//!    are fixed; nothing the prompt or its caller does can swap them.
//! 2. The presence prompt runs against the pending operation.
//! 3. [`PendingSignature::complete`] turns the prompt's outcome into either a
//!    signature over exactly the bound bytes or a typed error.
//!
//! Dropping a [`PendingSignature`] without completing it aborts the bound
//! operation inside the boundary.

use core::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use log::debug;

use crate::boundary::{BoundaryError, OperationId, PresenceProof, SecureBoundary};
use crate::challenge::Challenge;
use crate::config::{Authenticators, PromptText};
use crate::custodian::SigningKeyHandle;
use crate::error::AuthError;
use crate::prompt::{self, PresenceOutcome, PresencePrompt, PresenceRequest};

/// Raw signature bytes produced by the secure boundary.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Standard base64, no line wrapping.
    pub fn to_base64(&self) -> String {
        B64.encode(&self.0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signature").field(&self.to_base64()).finish()
    }
}

/// Produces signatures that only complete after a successful presence check.
pub struct PresenceGatedSigner {
    boundary: Arc<dyn SecureBoundary>,
}

impl PresenceGatedSigner {
    pub fn new(boundary: Arc<dyn SecureBoundary>) -> Self {
        Self { boundary }
    }

    /// Bind `challenge` to a signing operation on `key`.
    ///
    /// Call this before any prompt is shown.
    pub fn bind(
        &self,
        key: &SigningKeyHandle,
        challenge: Challenge,
    ) -> Result<PendingSignature, AuthError> {
        let operation = self
            .boundary
            .begin_sign(key.alias(), challenge.as_bytes())
            .map_err(signing_error)?;
        debug!("Bound challenge to operation {operation} on key {}", key.alias());

        Ok(PendingSignature {
            boundary: self.boundary.clone(),
            operation,
            key_alias: key.alias().to_string(),
            challenge,
            settled: false,
        })
    }

    /// Bind, prompt, and sign in one call.
    pub async fn request_signature(
        &self,
        key: &SigningKeyHandle,
        challenge: &Challenge,
        presence: &dyn PresencePrompt,
        text: &PromptText,
        allowed: Authenticators,
    ) -> Result<Signature, AuthError> {
        let pending = self.bind(key, challenge.clone())?;
        let (responder, receiver) = prompt::channel();
        presence.present(pending.presence_request(text, allowed), responder);
        let outcome = receiver.outcome().await;
        pending.complete(outcome)
    }
}

/// A signing operation whose message is bound and which waits for approval.
pub struct PendingSignature {
    boundary: Arc<dyn SecureBoundary>,
    operation: OperationId,
    key_alias: String,
    challenge: Challenge,
    settled: bool,
}

impl PendingSignature {
    pub fn operation(&self) -> OperationId {
        self.operation
    }

    pub fn key_alias(&self) -> &str {
        &self.key_alias
    }

    /// The challenge the boundary will sign.
    pub fn challenge(&self) -> &Challenge {
        &self.challenge
    }

    /// Request to hand to the presence prompt for this operation.
    pub fn presence_request(&self, text: &PromptText, allowed: Authenticators) -> PresenceRequest {
        PresenceRequest {
            operation: self.operation,
            key_alias: self.key_alias.clone(),
            challenge: self.challenge.clone(),
            text: text.clone(),
            allowed,
        }
    }

    /// Finish with the prompt's outcome.
    ///
    /// Any outcome other than success aborts the operation; nothing is signed.
    pub fn complete(self, outcome: PresenceOutcome) -> Result<Signature, AuthError> {
        match outcome.into_error() {
            Some(err) => Err(err),
            None => self.approve(),
        }
    }

    /// Sign after the presence check succeeded.
    pub(crate) fn approve(mut self) -> Result<Signature, AuthError> {
        self.settled = true;
        self.boundary
            .complete_sign(PresenceProof::for_operation(self.operation))
            .map_err(signing_error)
    }
}

impl Drop for PendingSignature {
    fn drop(&mut self) {
        if !self.settled {
            debug!("Aborting signing operation {}", self.operation);
            self.boundary.abort_sign(self.operation);
        }
    }
}

impl fmt::Debug for PendingSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSignature")
            .field("operation", &self.operation)
            .field("key_alias", &self.key_alias)
            .field("challenge", &self.challenge)
            .finish()
    }
}

fn signing_error(err: BoundaryError) -> AuthError {
    match err {
        BoundaryError::Unavailable(detail) => AuthError::KeyStoreUnavailable(detail),
        BoundaryError::KeyNotFound(_)
        | BoundaryError::KeyInvalidated(_)
        | BoundaryError::UnknownOperation(_) => AuthError::KeyUnavailable(err.to_string()),
        BoundaryError::GenerationRejected(detail) => AuthError::KeyStoreUnavailable(detail),
    }
}
