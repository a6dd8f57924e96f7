//! Token wire format
//!
//! ```text
//! <base64-signature>.<purposeTag>:<timestampMillis>:<deviceId>
//! ```
//!
//! Standard base64 never produces `.`, so the first `.` always separates
//! the signature from the payload. Decoding checks structure only; whether
//! the signature verifies is the backend's call.

use core::fmt;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

use crate::challenge::Challenge;
use crate::error::TokenMalformed;
use crate::signer::Signature;

/// Separator between signature and payload.
pub const TOKEN_DELIMITER: char = '.';

/// Wire-ready authentication token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Assemble the token for `signature` over `challenge`.
pub fn encode(signature: &Signature, challenge: &Challenge) -> Token {
    Token(format!(
        "{}{TOKEN_DELIMITER}{}",
        signature.to_base64(),
        challenge.payload()
    ))
}

/// Split a raw token back into signature bytes and challenge.
pub fn decode(raw: &str) -> Result<(Signature, Challenge), TokenMalformed> {
    let (signature, payload) = raw
        .split_once(TOKEN_DELIMITER)
        .ok_or_else(|| TokenMalformed::new("missing '.' separator"))?;
    if signature.is_empty() {
        return Err(TokenMalformed::new("empty signature segment"));
    }
    if payload.is_empty() {
        return Err(TokenMalformed::new("empty payload segment"));
    }

    let signature = B64
        .decode(signature)
        .map_err(|e| TokenMalformed::new(format!("signature is not valid base64: {e}")))?;
    let challenge = Challenge::parse(payload)?;

    Ok((Signature::from_bytes(signature), challenge))
}
