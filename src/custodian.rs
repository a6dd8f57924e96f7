//! Key custodian
//!
//! Sole owner of the signing key's lifecycle:
//! - creates the key lazily, at most once per alias even under concurrent
//!   first use
//! - treats a key the boundary reports as invalidated exactly like an absent
//!   one, and regenerates it
//! - remembers such a replacement until a signing attempt reports it, so the
//!   change of identity always reaches the caller as `KeyUnavailable`
//! - is the only code path that generates or deletes boundary keys

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};

use crate::boundary::{BoundaryError, KeySpec, KeyStatus, PublicKey, SecureBoundary};
use crate::error::AuthError;

/// How the custodian came by the key behind a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    /// Already present and usable.
    Existing,
    /// Created where no key existed.
    Generated,
    /// Created in place of a key that was invalidated or discarded.
    Replaced,
}

/// Reference to a boundary-resident signing key.
///
/// Holds no key material, only the alias and the public half. A handle is
/// only ever returned for a key that exists; whether it still exists later
/// (enrollment changes kill keys at any time) is answered by
/// [`KeyCustodian::key_exists`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningKeyHandle {
    alias: String,
    public_key: PublicKey,
    origin: KeyOrigin,
}

impl SigningKeyHandle {
    fn new(alias: &str, public_key: PublicKey, origin: KeyOrigin) -> Self {
        Self {
            alias: alias.to_string(),
            public_key,
            origin,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Always true: the custodian only creates presence-bound keys.
    pub fn requires_presence(&self) -> bool {
        true
    }

    pub fn origin(&self) -> KeyOrigin {
        self.origin
    }

    /// Whether the call that returned this handle created the key.
    pub fn freshly_generated(&self) -> bool {
        self.origin != KeyOrigin::Existing
    }
}

#[derive(Debug, Default)]
struct AliasState {
    /// An invalidated key was replaced and no signing attempt has said so yet.
    unreported_replacement: bool,
}

/// Owns creation, lookup and invalidation of presence-bound signing keys.
pub struct KeyCustodian {
    boundary: Arc<dyn SecureBoundary>,
    // Entries live as long as the custodian: they carry replacement state,
    // and handing out a fresh mutex for a live alias would break exclusion.
    // Aliases come from configuration, so the map stays tiny.
    aliases: Mutex<HashMap<String, Arc<Mutex<AliasState>>>>,
}

impl KeyCustodian {
    pub fn new(boundary: Arc<dyn SecureBoundary>) -> Self {
        Self {
            boundary,
            aliases: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn boundary(&self) -> &Arc<dyn SecureBoundary> {
        &self.boundary
    }

    /// Return the key under `alias`, generating it if absent or invalidated.
    ///
    /// Concurrent callers for the same alias are serialized; the second one
    /// observes the key the first one created.
    pub fn ensure_key(&self, alias: &str) -> Result<SigningKeyHandle, AuthError> {
        let slot = self.alias_slot(alias)?;
        let mut state = lock_alias(&slot, alias)?;
        self.ensure_locked(alias, &mut state)
    }

    /// Like [`ensure_key`](Self::ensure_key), for callers about to sign.
    ///
    /// If the key was replaced after an invalidation that nobody has reported
    /// yet, fails once with [`AuthError::KeyUnavailable`]. The replacement
    /// stays in place, so the following call returns it.
    pub fn ensure_signing_key(&self, alias: &str) -> Result<SigningKeyHandle, AuthError> {
        let slot = self.alias_slot(alias)?;
        let mut state = lock_alias(&slot, alias)?;
        let key = self.ensure_locked(alias, &mut state)?;

        if std::mem::take(&mut state.unreported_replacement) {
            warn!("Signing identity for {alias} changed since the last attempt");
            return Err(AuthError::KeyUnavailable(format!(
                "key {alias} was invalidated and replaced; new public key {}",
                key.public_key().to_base64()
            )));
        }
        Ok(key)
    }

    /// Discard the key under `alias` and generate a new one right away.
    ///
    /// For callers that report the identity change themselves.
    pub fn replace_key(&self, alias: &str) -> Result<SigningKeyHandle, AuthError> {
        let slot = self.alias_slot(alias)?;
        let mut state = lock_alias(&slot, alias)?;

        if self.boundary.key_status(alias).map_err(store_error)? != KeyStatus::Absent {
            warn!("Discarding key {alias}");
            self.boundary.delete_key(alias).map_err(store_error)?;
        }
        state.unreported_replacement = false;
        let public_key = self.generate(alias)?;
        Ok(SigningKeyHandle::new(alias, public_key, KeyOrigin::Replaced))
    }

    /// Whether a usable key currently exists under `alias`.
    pub fn key_exists(&self, alias: &str) -> Result<bool, AuthError> {
        Ok(matches!(
            self.boundary.key_status(alias).map_err(store_error)?,
            KeyStatus::Usable(_)
        ))
    }

    /// Handle a "key no longer usable" signal from the boundary.
    ///
    /// Drops the dead key so the next [`ensure_key`](Self::ensure_key)
    /// regenerates it. The old identity cannot be recovered.
    pub fn invalidate(&self, alias: &str) -> Result<(), AuthError> {
        let slot = self.alias_slot(alias)?;
        let _state = lock_alias(&slot, alias)?;

        match self.boundary.key_status(alias).map_err(store_error)? {
            KeyStatus::Absent => Ok(()),
            _ => {
                warn!("Discarding key {alias}");
                self.boundary.delete_key(alias).map_err(store_error)
            }
        }
    }

    fn ensure_locked(
        &self,
        alias: &str,
        state: &mut AliasState,
    ) -> Result<SigningKeyHandle, AuthError> {
        let origin = match self.boundary.key_status(alias).map_err(store_error)? {
            KeyStatus::Usable(public_key) => {
                debug!("Using existing key {alias}");
                return Ok(SigningKeyHandle::new(alias, public_key, KeyOrigin::Existing));
            }
            KeyStatus::Invalidated => {
                warn!("Key {alias} was invalidated by an enrollment change; regenerating");
                self.boundary.delete_key(alias).map_err(store_error)?;
                // The old identity is gone even if generation fails below
                state.unreported_replacement = true;
                KeyOrigin::Replaced
            }
            KeyStatus::Absent => KeyOrigin::Generated,
        };

        let public_key = self.generate(alias)?;
        Ok(SigningKeyHandle::new(alias, public_key, origin))
    }

    fn generate(&self, alias: &str) -> Result<PublicKey, AuthError> {
        let public_key = self
            .boundary
            .generate_key(alias, &KeySpec::PRESENCE_BOUND)
            .map_err(generation_error)?;
        info!("Generated presence-bound key {alias} ({})", public_key.to_base64());
        Ok(public_key)
    }

    /// Mutex scoped to one alias; different aliases never contend.
    fn alias_slot(&self, alias: &str) -> Result<Arc<Mutex<AliasState>>, AuthError> {
        let mut aliases = self
            .aliases
            .lock()
            .map_err(|_| AuthError::KeyStoreUnavailable("key lock registry poisoned".into()))?;
        Ok(aliases.entry(alias.to_string()).or_default().clone())
    }
}

fn lock_alias<'a>(
    slot: &'a Mutex<AliasState>,
    alias: &str,
) -> Result<MutexGuard<'a, AliasState>, AuthError> {
    slot.lock()
        .map_err(|_| AuthError::KeyStoreUnavailable(format!("key lock for {alias} poisoned")))
}

fn store_error(err: BoundaryError) -> AuthError {
    AuthError::KeyStoreUnavailable(err.to_string())
}

fn generation_error(err: BoundaryError) -> AuthError {
    match err {
        BoundaryError::Unavailable(detail) => AuthError::KeyStoreUnavailable(detail),
        other => AuthError::KeyGenerationFailed(other.to_string()),
    }
}
