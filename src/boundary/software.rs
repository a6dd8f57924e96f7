//! In-process secure boundary
//!
//! Emulates a platform keystore closely enough to exercise every path of
//! the custodian and signer without hardware:
//! - keys are Ed25519, generated from [`SystemRng`] and zeroized on drop
//! - generation is refused while no presence credential is enrolled
//! - any change to the enrolled credentials bumps an enrollment epoch, and
//!   keys created under an older epoch become permanently invalid
//! - the whole boundary can be made unreachable
//!
//! Private keys stay inside this struct. Nothing here is persisted.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use ed25519_dalek::{Signer, SigningKey};
use log::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{
    BoundaryError, KeySpec, KeyStatus, OperationId, PresenceProof, PublicKey, SecureBoundary,
};
use crate::entropy::SystemRng;
use crate::signer::Signature;

/// Wrapper for the signing key that guarantees zeroization
#[derive(ZeroizeOnDrop)]
struct SealedKey {
    #[zeroize(skip)] // ed25519_dalek::SigningKey implements Zeroize internally
    inner: SigningKey,
}

impl SealedKey {
    fn generate(rng: &SystemRng) -> Result<Self, BoundaryError> {
        let mut seed = [0u8; 32];
        if let Err(e) = rng.fill(&mut seed) {
            seed.zeroize();
            return Err(e);
        }
        let inner = SigningKey::from_bytes(&seed);
        seed.zeroize(); // Zeroize seed immediately
        Ok(Self { inner })
    }

    fn public_key(&self) -> PublicKey {
        PublicKey::from_bytes(self.inner.verifying_key().to_bytes())
    }

    fn sign(&self, message: &[u8]) -> Signature {
        Signature::from_bytes(self.inner.sign(message).to_bytes().to_vec())
    }
}

struct StoredKey {
    secret: SealedKey,
    public: PublicKey,
    spec: KeySpec,
    epoch: u64,
}

impl StoredKey {
    fn is_invalidated(&self, current_epoch: u64) -> bool {
        self.spec.invalidated_by_enrollment && self.epoch != current_epoch
    }
}

struct PendingOperation {
    alias: String,
    message: Vec<u8>,
    /// Key the message was bound against; a regenerated key must not
    /// complete an operation begun under its predecessor.
    bound_to: PublicKey,
}

#[derive(Default)]
struct State {
    unreachable: bool,
    enrolled_credentials: u32,
    enrollment_epoch: u64,
    keys: HashMap<String, StoredKey>,
    pending: HashMap<OperationId, PendingOperation>,
    next_operation: u64,
    keys_generated: u64,
}

/// Software emulation of a presence-bound keystore.
pub struct SoftwareBoundary {
    state: Mutex<State>,
    rng: SystemRng,
}

impl SoftwareBoundary {
    /// Empty keystore with no enrolled presence credential.
    pub fn new() -> Result<Self, BoundaryError> {
        Ok(Self {
            state: Mutex::new(State::default()),
            rng: SystemRng::new()?,
        })
    }

    /// Empty keystore with `count` credentials already enrolled.
    pub fn with_enrolled_credentials(count: u32) -> Result<Self, BoundaryError> {
        let boundary = Self::new()?;
        boundary.lock()?.enrolled_credentials = count;
        Ok(boundary)
    }

    /// Enroll one more presence credential (e.g. a new fingerprint).
    ///
    /// Invalidates every enrollment-bound key.
    pub fn enroll_credential(&self) -> Result<(), BoundaryError> {
        let mut state = self.lock()?;
        state.enrolled_credentials = state.enrolled_credentials.saturating_add(1);
        state.enrollment_epoch += 1;
        info!(
            "Presence credential enrolled ({} total), enrollment epoch {}",
            state.enrolled_credentials, state.enrollment_epoch
        );
        Ok(())
    }

    /// Remove every enrolled presence credential.
    ///
    /// Invalidates every enrollment-bound key.
    pub fn remove_all_credentials(&self) -> Result<(), BoundaryError> {
        let mut state = self.lock()?;
        state.enrolled_credentials = 0;
        state.enrollment_epoch += 1;
        info!("All presence credentials removed, enrollment epoch {}", state.enrollment_epoch);
        Ok(())
    }

    /// Simulate losing (or regaining) the connection to the keystore.
    pub fn set_reachable(&self, reachable: bool) -> Result<(), BoundaryError> {
        self.lock()?.unreachable = !reachable;
        Ok(())
    }

    /// Number of key pairs generated over the boundary's lifetime.
    pub fn keys_generated(&self) -> u64 {
        self.lock().map(|s| s.keys_generated).unwrap_or(0)
    }

    /// Number of bound operations still waiting for completion.
    pub fn pending_operations(&self) -> usize {
        self.lock().map(|s| s.pending.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, BoundaryError> {
        self.state
            .lock()
            .map_err(|_| BoundaryError::Unavailable("keystore state poisoned".into()))
    }

    /// Lock for an operation that needs the keystore to be reachable
    fn reachable(&self) -> Result<MutexGuard<'_, State>, BoundaryError> {
        let state = self.lock()?;
        if state.unreachable {
            return Err(BoundaryError::Unavailable("keystore not responding".into()));
        }
        Ok(state)
    }
}

impl SecureBoundary for SoftwareBoundary {
    fn presence_enrolled(&self) -> Result<bool, BoundaryError> {
        Ok(self.reachable()?.enrolled_credentials > 0)
    }

    fn key_status(&self, alias: &str) -> Result<KeyStatus, BoundaryError> {
        let state = self.reachable()?;
        Ok(match state.keys.get(alias) {
            None => KeyStatus::Absent,
            Some(key) if key.is_invalidated(state.enrollment_epoch) => KeyStatus::Invalidated,
            Some(key) => KeyStatus::Usable(key.public),
        })
    }

    fn generate_key(&self, alias: &str, spec: &KeySpec) -> Result<PublicKey, BoundaryError> {
        let mut state = self.reachable()?;
        if spec.exportable {
            return Err(BoundaryError::GenerationRejected(
                "exportable private keys are not supported".into(),
            ));
        }
        if spec.presence_per_use && state.enrolled_credentials == 0 {
            return Err(BoundaryError::GenerationRejected(
                "no presence credential enrolled".into(),
            ));
        }

        let secret = SealedKey::generate(&self.rng)?;
        let public = secret.public_key();
        let epoch = state.enrollment_epoch;
        state.keys.insert(
            alias.to_string(),
            StoredKey {
                secret,
                public,
                spec: *spec,
                epoch,
            },
        );
        state.keys_generated += 1;
        debug!("Generated key {alias} under enrollment epoch {epoch}");
        Ok(public)
    }

    fn delete_key(&self, alias: &str) -> Result<(), BoundaryError> {
        let mut state = self.reachable()?;
        state.keys.remove(alias);
        state.pending.retain(|_, op| op.alias != alias);
        Ok(())
    }

    fn begin_sign(&self, alias: &str, message: &[u8]) -> Result<OperationId, BoundaryError> {
        let mut state = self.reachable()?;
        let epoch = state.enrollment_epoch;
        let bound_to = match state.keys.get(alias) {
            None => return Err(BoundaryError::KeyNotFound(alias.to_string())),
            Some(key) if key.is_invalidated(epoch) => {
                return Err(BoundaryError::KeyInvalidated(alias.to_string()))
            }
            Some(key) => key.public,
        };

        state.next_operation += 1;
        let operation = OperationId::new(state.next_operation);
        state.pending.insert(
            operation,
            PendingOperation {
                alias: alias.to_string(),
                message: message.to_vec(),
                bound_to,
            },
        );
        Ok(operation)
    }

    fn complete_sign(&self, proof: PresenceProof) -> Result<Signature, BoundaryError> {
        let mut state = self.reachable()?;
        let operation = proof.operation();
        let pending = state
            .pending
            .remove(&operation)
            .ok_or(BoundaryError::UnknownOperation(operation))?;

        let key = state
            .keys
            .get(&pending.alias)
            .ok_or_else(|| BoundaryError::KeyNotFound(pending.alias.clone()))?;
        if key.is_invalidated(state.enrollment_epoch) || key.public != pending.bound_to {
            return Err(BoundaryError::KeyInvalidated(pending.alias));
        }

        Ok(key.secret.sign(&pending.message))
    }

    fn abort_sign(&self, operation: OperationId) {
        if let Ok(mut state) = self.lock() {
            state.pending.remove(&operation);
        }
    }
}
