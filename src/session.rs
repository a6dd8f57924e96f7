//! Authentication sessions
//!
//! One [`AuthenticationSession`] per user-initiated attempt:
//!
//! ```text
//! Idle ──begin──▶ AwaitingPresenceCheck ──success──▶ Signing ──sign──▶ TokenReady
//!   │                    │                              │
//!   └────────────────────┴──────── failure ─────────────┴──────────▶ Failed(kind)
//! ```
//!
//! Sessions are never reset or re-entered; a new attempt gets a new session,
//! so a challenge can never be reused. [`Authenticator`] drives sessions and
//! allows at most one of them in flight at a time.

use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};
use tokio::sync::oneshot;

use crate::boundary::SecureBoundary;
use crate::challenge::Challenge;
use crate::clock::{Clock, SystemClock};
use crate::config::AuthConfig;
use crate::custodian::{KeyCustodian, SigningKeyHandle};
use crate::error::{AuthError, ErrorKind};
use crate::prompt::{self, PresenceOutcome, PresencePrompt};
use crate::signer::{PendingSignature, PresenceGatedSigner, Signature};
use crate::token::{self, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingPresenceCheck,
    Signing,
    TokenReady,
    Failed(ErrorKind),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::TokenReady | SessionState::Failed(_))
    }
}

/// External events a session reacts to while waiting on the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PresenceReported(PresenceOutcome),
    CancelRequested,
}

/// State machine for a single authentication attempt.
#[derive(Debug)]
pub struct AuthenticationSession {
    state: SessionState,
    challenge: Option<Challenge>,
    pending: Option<PendingSignature>,
    signature: Option<Signature>,
    token: Option<Token>,
    failure: Option<AuthError>,
}

impl Default for AuthenticationSession {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthenticationSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            challenge: None,
            pending: None,
            signature: None,
            token: None,
            failure: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn challenge(&self) -> Option<&Challenge> {
        self.challenge.as_ref()
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    pub fn failure(&self) -> Option<&AuthError> {
        self.failure.as_ref()
    }

    /// `Idle -> AwaitingPresenceCheck`.
    ///
    /// Ensures the key, builds the challenge at `clock.now()` and binds it
    /// to a signing operation. Any failure ends the session before a prompt
    /// could be shown.
    ///
    /// A key that was invalidated since the last attempt fails the session
    /// with [`AuthError::KeyUnavailable`]; by then the replacement key exists,
    /// so the next session signs with it.
    pub fn begin(
        &mut self,
        custodian: &KeyCustodian,
        signer: &PresenceGatedSigner,
        clock: &dyn Clock,
        alias: &str,
        purpose_tag: &str,
        device_id: &str,
    ) -> Result<&PendingSignature, AuthError> {
        if self.state != SessionState::Idle {
            return Err(AuthError::SessionAlreadyInProgress);
        }

        match bind_challenge(custodian, signer, clock, alias, purpose_tag, device_id) {
            Ok(pending) => {
                self.challenge = Some(pending.challenge().clone());
                self.transition(SessionState::AwaitingPresenceCheck);
                let pending: &PendingSignature = self.pending.insert(pending);
                Ok(pending)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Feed an external event; returns the resulting state.
    ///
    /// Events that do not apply to the current state leave it unchanged:
    /// presence reports outside `AwaitingPresenceCheck` are stale, and
    /// cancellation is not exposed once signing has started.
    pub fn apply(&mut self, event: SessionEvent) -> SessionState {
        match (self.state, event) {
            (SessionState::AwaitingPresenceCheck, SessionEvent::PresenceReported(outcome)) => {
                match outcome.into_error() {
                    None => self.transition(SessionState::Signing),
                    Some(err) => {
                        self.fail(err);
                    }
                }
            }
            (
                SessionState::Idle | SessionState::AwaitingPresenceCheck,
                SessionEvent::CancelRequested,
            ) => {
                self.fail(AuthError::PresenceCheckCancelled);
            }
            (state, event) => debug!("Ignoring {event:?} in state {state:?}"),
        }
        self.state
    }

    /// `Signing -> TokenReady | Failed`.
    ///
    /// In any other state nothing is signed and the session's failure (or a
    /// presence error, if it never got that far) is returned.
    pub fn sign(&mut self) -> Result<(), AuthError> {
        if self.state != SessionState::Signing {
            return Err(self.failure.clone().unwrap_or_else(|| {
                AuthError::PresenceCheckError(
                    "signing requested without an approved presence check".into(),
                )
            }));
        }

        let (Some(pending), Some(challenge)) = (self.pending.take(), self.challenge.clone()) else {
            return Err(self.fail(AuthError::KeyStoreUnavailable(
                "bound signing operation missing".into(),
            )));
        };

        match pending.approve() {
            Ok(signature) => {
                self.token = Some(token::encode(&signature, &challenge));
                self.signature = Some(signature);
                self.transition(SessionState::TokenReady);
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// The issued token; `Some` exactly once, after `TokenReady`.
    pub fn take_token(&mut self) -> Option<Token> {
        self.token.take()
    }

    /// Consume the session and return its result.
    pub fn finish(mut self) -> Result<Token, AuthError> {
        if let Some(token) = self.take_token() {
            return Ok(token);
        }
        Err(self.failure.take().unwrap_or_else(|| {
            AuthError::PresenceCheckError(format!("session ended in state {:?}", self.state))
        }))
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn fail(&mut self, err: AuthError) -> AuthError {
        // Dropping the pending operation aborts it inside the boundary
        self.pending = None;
        self.transition(SessionState::Failed(err.kind()));
        self.failure = Some(err.clone());
        err
    }
}

fn bind_challenge(
    custodian: &KeyCustodian,
    signer: &PresenceGatedSigner,
    clock: &dyn Clock,
    alias: &str,
    purpose_tag: &str,
    device_id: &str,
) -> Result<PendingSignature, AuthError> {
    let key = custodian.ensure_signing_key(alias)?;
    let challenge = Challenge::build(purpose_tag, device_id, clock.now())?;
    signer.bind(&key, challenge).inspect_err(|err| {
        if err.kind() == ErrorKind::KeyUnavailable {
            replace_key(custodian, alias);
        }
    })
}

/// The key under `alias` died; regenerate it so the next attempt can sign.
///
/// The attempt that noticed reports the change, so a failure here is only
/// logged; the next `ensure_signing_key` surfaces it if it recurs.
fn replace_key(custodian: &KeyCustodian, alias: &str) {
    match custodian.replace_key(alias) {
        Ok(key) => info!(
            "Replaced key {alias}; new public key {}",
            key.public_key().to_base64()
        ),
        Err(err) => warn!("Could not regenerate key {alias}, next attempt will retry: {err}"),
    }
}

struct InFlight {
    cancel: Option<oneshot::Sender<()>>,
}

/// Releases the in-flight slot when the attempt ends, however it ends.
struct FlightGuard<'a> {
    slot: &'a Mutex<Option<InFlight>>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Entry point: issues presence-gated tokens, one attempt at a time.
pub struct Authenticator {
    config: AuthConfig,
    custodian: KeyCustodian,
    signer: PresenceGatedSigner,
    prompt: Arc<dyn PresencePrompt>,
    clock: Arc<dyn Clock>,
    in_flight: Mutex<Option<InFlight>>,
}

impl Authenticator {
    pub fn new(
        boundary: Arc<dyn SecureBoundary>,
        prompt: Arc<dyn PresencePrompt>,
        config: AuthConfig,
    ) -> Self {
        Self {
            config,
            custodian: KeyCustodian::new(boundary.clone()),
            signer: PresenceGatedSigner::new(boundary),
            prompt,
            clock: Arc::new(SystemClock::new()),
            in_flight: Mutex::new(None),
        }
    }

    /// Replace the challenge clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Whether a presence check could run right now: the boundary answers
    /// and at least one presence credential is enrolled. Never prompts.
    pub fn can_authenticate(&self) -> Result<bool, AuthError> {
        self.custodian
            .boundary()
            .presence_enrolled()
            .map_err(|e| AuthError::KeyStoreUnavailable(e.to_string()))
    }

    /// Current signing key, created if needed. Its public half is what a
    /// backend enrolls to verify tokens.
    pub fn signing_key(&self) -> Result<SigningKeyHandle, AuthError> {
        self.custodian.ensure_key(&self.config.key_alias)
    }

    /// Whether an attempt is waiting on the user or signing.
    pub fn is_in_flight(&self) -> bool {
        self.slot().is_some()
    }

    /// Cancel the attempt waiting on its presence check.
    ///
    /// Returns `false` if nothing was waiting (idle, or already signing).
    pub fn cancel(&self) -> bool {
        let sender = self.slot().as_mut().and_then(|flight| flight.cancel.take());
        match sender {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Run one attempt with the configured purpose tag.
    pub async fn authenticate_default(&self, device_id: &str) -> Result<Token, AuthError> {
        let purpose_tag = self.config.purpose_tag.clone();
        self.authenticate(&purpose_tag, device_id).await
    }

    /// Run one authentication attempt and return its token.
    ///
    /// Fails with [`AuthError::SessionAlreadyInProgress`] while another
    /// attempt is pending; that attempt is not disturbed.
    pub async fn authenticate(
        &self,
        purpose_tag: &str,
        device_id: &str,
    ) -> Result<Token, AuthError> {
        let (_flight, mut cancelled) = self.claim()?;
        let alias = self.config.key_alias.as_str();
        let mut session = AuthenticationSession::new();

        let request = match session.begin(
            &self.custodian,
            &self.signer,
            self.clock.as_ref(),
            alias,
            purpose_tag,
            device_id,
        ) {
            Ok(pending) => {
                pending.presence_request(&self.config.prompt, self.config.allowed_authenticators)
            }
            Err(err) => {
                warn!("Authentication could not start: {err}");
                return Err(err);
            }
        };

        let (responder, receiver) = prompt::channel();
        self.prompt.present(request, responder);

        let event = tokio::select! {
            outcome = receiver.outcome() => SessionEvent::PresenceReported(outcome),
            Ok(()) = &mut cancelled => SessionEvent::CancelRequested,
        };
        drop(cancelled);
        self.disarm_cancel();

        session.apply(event);
        if let Err(err) = session.sign() {
            // The approval cannot be reused for a new key
            if err.kind() == ErrorKind::KeyUnavailable {
                replace_key(&self.custodian, alias);
            }
            warn!("Authentication failed: {err}");
            return Err(err);
        }

        let token = session.finish()?;
        info!("Issued token for {purpose_tag} on {device_id}");
        Ok(token)
    }

    /// Claim the single in-flight slot for this attempt.
    fn claim(&self) -> Result<(FlightGuard<'_>, oneshot::Receiver<()>), AuthError> {
        let mut slot = self.slot();
        if slot.is_some() {
            return Err(AuthError::SessionAlreadyInProgress);
        }
        let (tx, rx) = oneshot::channel();
        *slot = Some(InFlight { cancel: Some(tx) });
        Ok((FlightGuard { slot: &self.in_flight }, rx))
    }

    /// Signing has started; cancellation no longer applies.
    fn disarm_cancel(&self) {
        if let Some(flight) = self.slot().as_mut() {
            flight.cancel = None;
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
