use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ed25519_dalek::Verifier as _;
use tokio::sync::mpsc;

use crate::boundary::{
    BoundaryError, KeySpec, KeyStatus, OperationId, PresenceProof, PublicKey, SecureBoundary,
    SoftwareBoundary,
};
use crate::clock::{FixedClock, Timestamp};
use crate::config::AuthConfig;
use crate::error::{AuthError, ErrorKind};
use crate::prompt::{PresenceOutcome, PresencePrompt, PresenceRequest, PresenceResponder};
use crate::session::Authenticator;
use crate::signer::Signature;
use crate::token::{decode, Token};

const NOW: Timestamp = Timestamp::from_millis(1_700_000_000_000);

/// Answers each prompt from a script, then with success.
struct ScriptedPrompt {
    script: Mutex<VecDeque<PresenceOutcome>>,
    shown: AtomicUsize,
}

impl ScriptedPrompt {
    fn answering(outcomes: impl IntoIterator<Item = PresenceOutcome>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            shown: AtomicUsize::new(0),
        })
    }

    fn shown(&self) -> usize {
        self.shown.load(Ordering::SeqCst)
    }
}

impl PresencePrompt for ScriptedPrompt {
    fn present(&self, _request: PresenceRequest, responder: PresenceResponder) {
        self.shown.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(PresenceOutcome::Success);
        responder.resolve(outcome);
    }
}

/// Hands every prompt to the test, which answers when it wants to.
struct HeldPrompt {
    tx: mpsc::UnboundedSender<(PresenceRequest, PresenceResponder)>,
}

impl HeldPrompt {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(PresenceRequest, PresenceResponder)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl PresencePrompt for HeldPrompt {
    fn present(&self, request: PresenceRequest, responder: PresenceResponder) {
        self.tx.send((request, responder)).unwrap();
    }
}

/// Enrolls a new credential while the first prompt is on screen, then approves.
struct EnrollingPrompt {
    boundary: Arc<SoftwareBoundary>,
    armed: AtomicBool,
}

impl PresencePrompt for EnrollingPrompt {
    fn present(&self, _request: PresenceRequest, responder: PresenceResponder) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.boundary.enroll_credential().unwrap();
        }
        responder.resolve(PresenceOutcome::Success);
    }
}

/// Removes every credential while the first prompt is on screen, then approves.
struct UnenrollingPrompt {
    boundary: Arc<SoftwareBoundary>,
    armed: AtomicBool,
    shown: AtomicUsize,
}

impl PresencePrompt for UnenrollingPrompt {
    fn present(&self, _request: PresenceRequest, responder: PresenceResponder) {
        self.shown.fetch_add(1, Ordering::SeqCst);
        if self.armed.swap(false, Ordering::SeqCst) {
            self.boundary.remove_all_credentials().unwrap();
        }
        responder.resolve(PresenceOutcome::Success);
    }
}

/// Boundary whose next `begin_sign` reports the key as invalidated.
struct InvalidatingBoundary {
    inner: Arc<SoftwareBoundary>,
    fail_next_bind: AtomicBool,
}

impl SecureBoundary for InvalidatingBoundary {
    fn presence_enrolled(&self) -> Result<bool, BoundaryError> {
        self.inner.presence_enrolled()
    }

    fn key_status(&self, alias: &str) -> Result<KeyStatus, BoundaryError> {
        self.inner.key_status(alias)
    }

    fn generate_key(&self, alias: &str, spec: &KeySpec) -> Result<PublicKey, BoundaryError> {
        self.inner.generate_key(alias, spec)
    }

    fn delete_key(&self, alias: &str) -> Result<(), BoundaryError> {
        self.inner.delete_key(alias)
    }

    fn begin_sign(&self, alias: &str, message: &[u8]) -> Result<OperationId, BoundaryError> {
        if self.fail_next_bind.swap(false, Ordering::SeqCst) {
            return Err(BoundaryError::KeyInvalidated(alias.to_string()));
        }
        self.inner.begin_sign(alias, message)
    }

    fn complete_sign(&self, proof: PresenceProof) -> Result<Signature, BoundaryError> {
        self.inner.complete_sign(proof)
    }

    fn abort_sign(&self, operation: OperationId) {
        self.inner.abort_sign(operation)
    }
}

fn enrolled_boundary() -> Arc<SoftwareBoundary> {
    Arc::new(SoftwareBoundary::with_enrolled_credentials(1).unwrap())
}

fn authenticator(
    boundary: &Arc<SoftwareBoundary>,
    prompt: Arc<dyn PresencePrompt>,
) -> Authenticator {
    Authenticator::new(boundary.clone(), prompt, AuthConfig::default())
        .with_clock(Arc::new(FixedClock(NOW)))
}

fn verifies(public_key: &PublicKey, token: &Token) -> bool {
    let (signature, challenge) = decode(token.as_str()).unwrap();
    let vk = public_key.to_verifying_key().unwrap();
    let sig = ed25519_dalek::Signature::from_slice(signature.as_bytes()).unwrap();
    vk.verify(challenge.as_bytes(), &sig).is_ok()
}

#[tokio::test]
async fn scenario_a_first_use_creates_key_and_issues_token() {
    let boundary = enrolled_boundary();
    let prompt = ScriptedPrompt::answering([PresenceOutcome::Success]);
    let auth = authenticator(&boundary, prompt.clone());

    let token = auth.authenticate("payment", "dev-42").await.expect("token issued");

    assert_eq!(boundary.keys_generated(), 1);
    assert_eq!(prompt.shown(), 1);
    let (_, challenge) = decode(token.as_str()).unwrap();
    assert_eq!(challenge.purpose_tag(), "payment");
    assert_eq!(challenge.timestamp(), NOW);
    assert_eq!(challenge.device_id(), "dev-42");

    let key = auth.signing_key().unwrap();
    assert!(!key.freshly_generated());
    assert!(verifies(key.public_key(), &token));
    assert!(!auth.is_in_flight());
}

#[tokio::test]
async fn scenario_b_declined_presence_produces_nothing() {
    let boundary = enrolled_boundary();
    let prompt = ScriptedPrompt::answering([PresenceOutcome::UserDeclined]);
    let auth = authenticator(&boundary, prompt.clone());

    let err = auth.authenticate("payment", "dev-42").await.unwrap_err();

    assert_eq!(err, AuthError::PresenceCheckFailed);
    assert_eq!(boundary.pending_operations(), 0);
    assert!(!auth.is_in_flight());
}

#[tokio::test]
async fn scenario_c_second_attempt_is_rejected_while_first_is_pending() {
    let boundary = enrolled_boundary();
    let (prompt, mut presented) = HeldPrompt::new();
    let auth = Arc::new(authenticator(&boundary, prompt));

    let first = tokio::spawn({
        let auth = auth.clone();
        async move { auth.authenticate("payment", "dev-42").await }
    });
    let (request, responder) = presented.recv().await.unwrap();
    assert!(auth.is_in_flight());

    let err = auth.authenticate("payment", "dev-42").await.unwrap_err();
    assert_eq!(err, AuthError::SessionAlreadyInProgress);
    assert!(presented.try_recv().is_err(), "no second prompt may be shown");

    responder.resolve(PresenceOutcome::Success);
    let token = first.await.unwrap().expect("first attempt unaffected");
    let (_, challenge) = decode(token.as_str()).unwrap();
    assert_eq!(challenge, request.challenge);
    assert!(!auth.is_in_flight());
}

#[tokio::test]
async fn scenario_d_enrollment_change_mid_flow_replaces_key() {
    let boundary = enrolled_boundary();
    let prompt = Arc::new(EnrollingPrompt {
        boundary: boundary.clone(),
        armed: AtomicBool::new(true),
    });
    let auth = authenticator(&boundary, prompt);

    let old_key = auth.signing_key().unwrap();
    let err = auth.authenticate("payment", "dev-42").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyUnavailable);
    assert_eq!(boundary.keys_generated(), 2, "key regenerated after the failure");

    let token = auth.authenticate("payment", "dev-42").await.expect("next attempt succeeds");
    let new_key = auth.signing_key().unwrap();
    assert_ne!(new_key.public_key(), old_key.public_key());
    assert!(verifies(new_key.public_key(), &token));
    assert!(!verifies(old_key.public_key(), &token));
    assert_eq!(boundary.keys_generated(), 2);
}

#[test]
fn scenario_e_malformed_token_is_rejected() {
    let err = decode("not-base64!!.bad").unwrap_err();
    assert_eq!(AuthError::from(err).kind(), ErrorKind::TokenMalformed);
}

#[tokio::test]
async fn cancel_while_awaiting_presence() {
    let boundary = enrolled_boundary();
    let (prompt, mut presented) = HeldPrompt::new();
    let auth = Arc::new(authenticator(&boundary, prompt));
    assert!(!auth.cancel(), "nothing to cancel yet");

    let attempt = tokio::spawn({
        let auth = auth.clone();
        async move { auth.authenticate("payment", "dev-42").await }
    });
    let (_request, responder) = presented.recv().await.unwrap();

    assert!(auth.cancel());
    assert_eq!(attempt.await.unwrap().unwrap_err(), AuthError::PresenceCheckCancelled);
    assert!(!responder.is_awaited());
    responder.resolve(PresenceOutcome::Success);

    assert_eq!(boundary.pending_operations(), 0);
    assert!(!auth.is_in_flight());
    assert!(!auth.cancel());
}

#[tokio::test]
async fn dropped_attempt_releases_slot_and_operation() {
    let boundary = enrolled_boundary();
    let (prompt, mut presented) = HeldPrompt::new();
    let auth = Arc::new(authenticator(&boundary, prompt));

    let attempt = tokio::spawn({
        let auth = auth.clone();
        async move { auth.authenticate("payment", "dev-42").await }
    });
    let _held = presented.recv().await.unwrap();
    assert_eq!(boundary.pending_operations(), 1);

    attempt.abort();
    assert!(attempt.await.unwrap_err().is_cancelled());
    assert!(!auth.is_in_flight());
    assert_eq!(boundary.pending_operations(), 0);
}

#[tokio::test]
async fn failures_before_the_prompt_never_show_it() {
    let boundary = enrolled_boundary();
    let prompt = ScriptedPrompt::answering([]);
    let auth = authenticator(&boundary, prompt.clone());

    let err = auth.authenticate("", "dev-42").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidChallengeInput);

    boundary.set_reachable(false).unwrap();
    let err = auth.authenticate("payment", "dev-42").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyStoreUnavailable);
    assert!(err.caller_may_retry());

    assert_eq!(prompt.shown(), 0);
    assert!(!auth.is_in_flight());
}

#[tokio::test]
async fn no_enrolled_credential() {
    let boundary = Arc::new(SoftwareBoundary::new().unwrap());
    let prompt = ScriptedPrompt::answering([]);
    let auth = authenticator(&boundary, prompt.clone());

    assert!(!auth.can_authenticate().unwrap());
    let err = auth.authenticate("payment", "dev-42").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyGenerationFailed);
    assert_eq!(prompt.shown(), 0);

    boundary.enroll_credential().unwrap();
    assert!(auth.can_authenticate().unwrap());
    auth.authenticate("payment", "dev-42").await.unwrap();
}

#[tokio::test]
async fn platform_error_and_retry() {
    let boundary = enrolled_boundary();
    let prompt =
        ScriptedPrompt::answering([PresenceOutcome::PlatformError("sensor timeout".into())]);
    let auth = authenticator(&boundary, prompt.clone());

    let err = auth.authenticate("payment", "dev-42").await.unwrap_err();
    assert_eq!(err, AuthError::PresenceCheckError("sensor timeout".into()));
    assert!(err.caller_may_retry());

    auth.authenticate("payment", "dev-42").await.unwrap();
    assert_eq!(prompt.shown(), 2);
    assert_eq!(boundary.keys_generated(), 1);
}

#[tokio::test]
async fn successive_tokens_carry_distinct_challenges() {
    let boundary = enrolled_boundary();
    let prompt = ScriptedPrompt::answering([]);
    // Real clock: strictly increasing timestamps
    let auth = Authenticator::new(boundary.clone(), prompt, AuthConfig::default());

    let a = auth.authenticate_default("dev-42").await.unwrap();
    let b = auth.authenticate_default("dev-42").await.unwrap();
    let (_, ca) = decode(a.as_str()).unwrap();
    let (_, cb) = decode(b.as_str()).unwrap();

    assert_eq!(ca.purpose_tag(), "IRIS_AUTH");
    assert!(cb.timestamp() > ca.timestamp());
    assert_ne!(ca.as_bytes(), cb.as_bytes());
}

#[tokio::test]
async fn prompt_receives_configured_presentation() {
    let boundary = enrolled_boundary();
    let (prompt, mut presented) = HeldPrompt::new();
    let config = AuthConfig::from_toml_str(
        r#"
        key_alias = "com.example.pay"
        [prompt]
        title = "Confirm payment"
        "#,
    )
    .unwrap();
    let auth = Arc::new(
        Authenticator::new(boundary.clone(), prompt, config).with_clock(Arc::new(FixedClock(NOW))),
    );

    let attempt = tokio::spawn({
        let auth = auth.clone();
        async move { auth.authenticate("payment", "dev-42").await }
    });
    let (request, responder) = presented.recv().await.unwrap();
    assert_eq!(request.key_alias, "com.example.pay");
    assert_eq!(request.text.title, "Confirm payment");
    assert_eq!(request.challenge.payload(), "payment:1700000000000:dev-42");

    responder.resolve(PresenceOutcome::Success);
    attempt.await.unwrap().unwrap();
}

#[tokio::test]
async fn enrollment_change_between_attempts_is_reported_before_prompting() {
    let boundary = enrolled_boundary();
    let prompt = ScriptedPrompt::answering([]);
    let auth = authenticator(&boundary, prompt.clone());

    auth.authenticate("payment", "dev-42").await.unwrap();
    let old_key = auth.signing_key().unwrap();
    boundary.enroll_credential().unwrap();

    let err = auth.authenticate("payment", "dev-42").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyUnavailable);
    assert_eq!(prompt.shown(), 1, "no prompt for the failed attempt");
    assert_eq!(boundary.pending_operations(), 0);

    let token = auth.authenticate("payment", "dev-42").await.unwrap();
    let new_key = auth.signing_key().unwrap();
    assert_ne!(new_key.public_key(), old_key.public_key());
    assert!(verifies(new_key.public_key(), &token));
    assert_eq!(boundary.keys_generated(), 2);
}

#[tokio::test]
async fn key_invalidated_at_bind_fails_attempt_and_regenerates() {
    let inner = enrolled_boundary();
    let boundary = Arc::new(InvalidatingBoundary {
        inner: inner.clone(),
        fail_next_bind: AtomicBool::new(true),
    });
    let prompt = ScriptedPrompt::answering([]);
    let auth = Authenticator::new(boundary, prompt.clone(), AuthConfig::default())
        .with_clock(Arc::new(FixedClock(NOW)));

    let err = auth.authenticate("payment", "dev-42").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyUnavailable);
    assert_eq!(prompt.shown(), 0);
    assert_eq!(inner.keys_generated(), 2, "first key plus its replacement");
    assert!(!auth.is_in_flight());

    let token = auth.authenticate("payment", "dev-42").await.unwrap();
    assert!(verifies(auth.signing_key().unwrap().public_key(), &token));
    assert_eq!(inner.keys_generated(), 2);
    assert_eq!(prompt.shown(), 1);
}

#[tokio::test]
async fn failed_regeneration_surfaces_on_next_attempt() {
    let boundary = enrolled_boundary();
    let prompt = Arc::new(UnenrollingPrompt {
        boundary: boundary.clone(),
        armed: AtomicBool::new(true),
        shown: AtomicUsize::new(0),
    });
    let auth = authenticator(&boundary, prompt.clone());

    let err = auth.authenticate("payment", "dev-42").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyUnavailable);
    assert_eq!(boundary.keys_generated(), 1, "nothing to regenerate with");

    let err = auth.authenticate("payment", "dev-42").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyGenerationFailed);
    assert_eq!(prompt.shown.load(Ordering::SeqCst), 1);

    boundary.enroll_credential().unwrap();
    auth.authenticate("payment", "dev-42").await.unwrap();
    assert_eq!(boundary.keys_generated(), 2);
}
