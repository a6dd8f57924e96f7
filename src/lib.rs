//! presencegate - presence-gated authentication tokens
//!
//! After a successful local presence check (biometric or device credential)
//! the crate produces a signed, time-bound token saying "this device, with a
//! live user present, authorized this intent":
//! 1. The key custodian makes sure a non-exportable, presence-bound key exists
//! 2. A challenge binds purpose, time and device id
//! 3. The challenge is bound to a signing operation before any prompt appears
//! 4. The platform prompt reports the presence outcome exactly once
//! 5. The boundary signs, and the token encoder renders
//!    `<base64-signature>.<purpose>:<millis>:<device>`
//!
//! No biometric material ever enters this crate.

pub mod boundary;
pub mod challenge;
pub mod clock;
pub mod config;
pub mod custodian;
pub mod entropy;
pub mod error;
pub mod prompt;
pub mod session;
pub mod signer;
pub mod token;

pub use boundary::{KeySpec, KeyStatus, PublicKey, SecureBoundary, SoftwareBoundary};
pub use challenge::Challenge;
pub use clock::{Clock, FixedClock, SystemClock, Timestamp};
pub use config::AuthConfig;
pub use custodian::{KeyCustodian, KeyOrigin, SigningKeyHandle};
pub use error::{AuthError, ErrorKind, TokenMalformed};
pub use prompt::{PresenceOutcome, PresencePrompt, PresenceRequest, PresenceResponder};
pub use session::{AuthenticationSession, Authenticator, SessionEvent, SessionState};
pub use signer::{PendingSignature, PresenceGatedSigner, Signature};
pub use token::{decode, encode, Token};

/// Library version string.
pub fn version() -> &'static str {
    concat!("presencegate ", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests;
