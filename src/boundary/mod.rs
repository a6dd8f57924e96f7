//! Secure boundary abstraction
//!
//! The secure boundary is wherever private key material lives: a secure
//! element, a TEE-backed keystore, or (for tests and the demo) the
//! in-process [`SoftwareBoundary`]. Only the operations below cross it;
//! there is deliberately no way to read a private key back out.
//!
//! Signing is split in two so that the message is fixed before the user is
//! asked for anything:
//! 1. [`SecureBoundary::begin_sign`] binds the exact bytes to an operation
//! 2. the presence prompt runs against that operation
//! 3. [`SecureBoundary::complete_sign`] consumes a [`PresenceProof`] for it
//!
//! A [`PresenceProof`] can only be minted inside this crate, after the
//! presence collaborator reported success.

mod software;

pub use software::SoftwareBoundary;

use core::fmt;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use ed25519_dalek::VerifyingKey;
use thiserror::Error;

use crate::signer::Signature;

/// Faults reported by a secure boundary implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BoundaryError {
    #[error("secure boundary unreachable: {0}")]
    Unavailable(String),
    #[error("key generation rejected: {0}")]
    GenerationRejected(String),
    #[error("no key under alias {0}")]
    KeyNotFound(String),
    #[error("key {0} was invalidated")]
    KeyInvalidated(String),
    #[error("unknown signing operation {0}")]
    UnknownOperation(OperationId),
}

/// Signature algorithm of a boundary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// Ed25519 over SHA-512
    Ed25519,
}

/// Properties a key must be generated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySpec {
    pub algorithm: KeyAlgorithm,
    /// Key may sign but never encrypt, decrypt or agree.
    pub signing_only: bool,
    /// Private half never leaves the boundary.
    pub exportable: bool,
    /// Every signature needs its own fresh presence check.
    pub presence_per_use: bool,
    /// Key dies when the enrolled presence credentials change.
    pub invalidated_by_enrollment: bool,
}

impl KeySpec {
    /// Key properties the custodian always requests.
    pub const PRESENCE_BOUND: KeySpec = KeySpec {
        algorithm: KeyAlgorithm::Ed25519,
        signing_only: true,
        exportable: false,
        presence_per_use: true,
        invalidated_by_enrollment: true,
    };
}

/// What the boundary knows about an alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Absent,
    Usable(PublicKey),
    /// Still stored but permanently unusable (enrollment changed).
    Invalidated,
}

/// Ed25519 verifying key of a boundary key pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Standard base64, the form a backend enrolls.
    pub fn to_base64(&self) -> String {
        B64.encode(self.0)
    }

    /// `None` if the bytes are not a valid curve point.
    pub fn to_verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0).ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_base64()).finish()
    }
}

/// Handle for a signing operation whose message is already bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(u64);

impl OperationId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Evidence that the presence check for one operation succeeded.
///
/// Not `Clone`, and only constructible inside this crate: one successful
/// check completes at most one signature.
#[derive(Debug)]
pub struct PresenceProof {
    operation: OperationId,
}

impl PresenceProof {
    pub(crate) fn for_operation(operation: OperationId) -> Self {
        Self { operation }
    }

    pub fn operation(&self) -> OperationId {
        self.operation
    }
}

/// Operations exposed by a secure boundary.
///
/// Implementations must be safe to share across threads. Key creation is
/// serialized by [`crate::KeyCustodian`], so `generate_key` may assume it is
/// not raced for the same alias.
pub trait SecureBoundary: Send + Sync {
    /// Whether at least one presence credential is enrolled.
    fn presence_enrolled(&self) -> Result<bool, BoundaryError>;

    fn key_status(&self, alias: &str) -> Result<KeyStatus, BoundaryError>;

    /// Create a key pair under `alias`, replacing any previous one.
    fn generate_key(&self, alias: &str, spec: &KeySpec) -> Result<PublicKey, BoundaryError>;

    /// Remove `alias`. Deleting an absent alias is not an error.
    fn delete_key(&self, alias: &str) -> Result<(), BoundaryError>;

    /// Bind `message` to a new signing operation on `alias`.
    fn begin_sign(&self, alias: &str, message: &[u8]) -> Result<OperationId, BoundaryError>;

    /// Sign the bound message of `proof.operation()`.
    fn complete_sign(&self, proof: PresenceProof) -> Result<Signature, BoundaryError>;

    /// Drop a bound operation without signing.
    fn abort_sign(&self, operation: OperationId);
}
