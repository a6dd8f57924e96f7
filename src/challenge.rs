//! Challenge construction
//!
//! The challenge is the exact byte string that gets signed:
//!
//! ```text
//! <purposeTag>:<timestampMillis>:<deviceId>
//! ```
//!
//! Field order and delimiter are fixed, so identical inputs always produce
//! identical bytes. The purpose tag may not contain the delimiter; the device
//! id may, since it is the last field and parsing takes the remainder.

use core::fmt;

use crate::clock::Timestamp;
use crate::error::{AuthError, TokenMalformed};

/// Separator between challenge fields.
pub const FIELD_DELIMITER: char = ':';

/// Signed payload binding intent, time and device.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Challenge {
    purpose_tag: String,
    timestamp: Timestamp,
    device_id: String,
    payload: String,
}

impl Challenge {
    /// Build the challenge for `purpose_tag` on `device_id` at `now`.
    ///
    /// Pure: no I/O, and the same inputs always give the same bytes.
    pub fn build(purpose_tag: &str, device_id: &str, now: Timestamp) -> Result<Self, AuthError> {
        check_purpose_tag(purpose_tag).map_err(AuthError::InvalidChallengeInput)?;
        check_device_id(device_id).map_err(AuthError::InvalidChallengeInput)?;
        Ok(Self::assemble(purpose_tag, now, device_id))
    }

    /// Parse a payload produced by [`Challenge::payload`].
    pub(crate) fn parse(payload: &str) -> Result<Self, TokenMalformed> {
        let mut fields = payload.splitn(3, FIELD_DELIMITER);
        let (Some(purpose_tag), Some(millis), Some(device_id)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(TokenMalformed::new("payload needs three fields"));
        };

        check_purpose_tag(purpose_tag).map_err(TokenMalformed::new)?;
        check_device_id(device_id).map_err(TokenMalformed::new)?;

        // Canonical decimal only: no sign, no padding
        if millis.is_empty()
            || !millis.bytes().all(|b| b.is_ascii_digit())
            || (millis.len() > 1 && millis.starts_with('0'))
        {
            return Err(TokenMalformed::new("timestamp is not a decimal integer"));
        }
        let millis: u64 = millis
            .parse()
            .map_err(|_| TokenMalformed::new("timestamp out of range"))?;

        Ok(Self::assemble(purpose_tag, Timestamp::from_millis(millis), device_id))
    }

    fn assemble(purpose_tag: &str, timestamp: Timestamp, device_id: &str) -> Self {
        let payload = format!(
            "{purpose_tag}{d}{timestamp}{d}{device_id}",
            d = FIELD_DELIMITER
        );
        Self {
            purpose_tag: purpose_tag.to_string(),
            timestamp,
            device_id: device_id.to_string(),
            payload,
        }
    }

    pub fn purpose_tag(&self) -> &str {
        &self.purpose_tag
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Textual payload, as it appears after the `.` in a token.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Bytes to sign (UTF-8 of the payload).
    pub fn as_bytes(&self) -> &[u8] {
        self.payload.as_bytes()
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Challenge").field(&self.payload).finish()
    }
}

fn check_purpose_tag(tag: &str) -> Result<(), String> {
    if tag.is_empty() {
        return Err("purpose tag is empty".into());
    }
    if tag.contains(FIELD_DELIMITER) {
        return Err(format!("purpose tag may not contain '{FIELD_DELIMITER}'"));
    }
    Ok(())
}

fn check_device_id(device_id: &str) -> Result<(), String> {
    if device_id.is_empty() {
        return Err("device id is empty".into());
    }
    Ok(())
}
