//! Entropy for key generation
//!
//! The software boundary draws Ed25519 seeds from the operating system's
//! CSPRNG. A hardware boundary generates keys internally and never touches
//! this module.

use rand_core::{OsRng, RngCore};

use crate::boundary::BoundaryError;

/// OS-backed random number generator
#[derive(Debug, Clone, Copy)]
pub struct SystemRng {
    _private: (),
}

impl SystemRng {
    /// Open the OS entropy source
    ///
    /// Reads a sample value so a broken source is reported at construction
    /// instead of during the first key generation.
    pub fn new() -> Result<Self, BoundaryError> {
        let mut sample = [0u8; 8];
        OsRng
            .try_fill_bytes(&mut sample)
            .map_err(|e| BoundaryError::Unavailable(format!("entropy source: {e}")))?;

        // All zeros would indicate RNG failure
        if sample == [0u8; 8] {
            return Err(BoundaryError::Unavailable(
                "entropy source sanity check returned all zeros".into(),
            ));
        }

        Ok(Self { _private: () })
    }

    /// Fill a buffer with random bytes
    pub fn fill(&self, dest: &mut [u8]) -> Result<(), BoundaryError> {
        OsRng
            .try_fill_bytes(dest)
            .map_err(|e| BoundaryError::Unavailable(format!("entropy source: {e}")))
    }
}
