//! presencegate demo
//!
//! Issues tokens from a software secure boundary with a console standing in
//! for the platform's presence prompt:
//! 1. Press Enter to start an attempt
//! 2. Answer the prompt with `y` (approve), `n` (decline) or `c` (cancel)
//! 3. The token and the signing public key are printed
//!
//! `enroll` simulates enrolling a new credential, which invalidates the key.
//!
//! Usage: `presencegate [config.toml] [device-id]`

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::thread;

use log::{info, warn};
use presencegate::prompt::{PresenceOutcome, PresencePrompt, PresenceRequest, PresenceResponder};
use presencegate::{decode, AuthConfig, Authenticator, SoftwareBoundary};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const DEFAULT_DEVICE_ID: &str = "dev-local";

/// Machine-readable line printed for every issued token.
#[derive(Serialize)]
struct TokenOutput<'a> {
    token: &'a str,
    pk: &'a str,
}

/// Console presence prompt; answers are read on a separate thread so the
/// runtime is never blocked.
struct ConsolePrompt;

impl PresencePrompt for ConsolePrompt {
    fn present(&self, request: PresenceRequest, responder: PresenceResponder) {
        thread::spawn(move || {
            println!("--- {} ---", request.text.title);
            println!("{}", request.text.subtitle);
            println!("{}", request.text.description);
            println!("Signing {} with {}", request.challenge.payload(), request.key_alias);
            print!("Approve? [y]es / [n]o / [c] {} > ", request.text.negative_button);
            let _ = std::io::stdout().flush();

            let outcome = match read_line() {
                Ok(answer) => match answer.as_str() {
                    "y" | "yes" => PresenceOutcome::Success,
                    "n" | "no" => PresenceOutcome::UserDeclined,
                    "c" | "cancel" => PresenceOutcome::Cancelled,
                    other => {
                        PresenceOutcome::PlatformError(format!("unrecognized answer {other:?}"))
                    }
                },
                Err(e) => PresenceOutcome::PlatformError(format!("console: {e}")),
            };
            responder.resolve(outcome);
        });
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("{} starting", presencegate::version());

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => AuthConfig::load(&path)?,
        None => AuthConfig::default(),
    };
    let device_id = args.next().unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string());

    let boundary = Arc::new(SoftwareBoundary::with_enrolled_credentials(1)?);
    let authenticator = Authenticator::new(boundary.clone(), Arc::new(ConsolePrompt), config);

    if !authenticator.can_authenticate()? {
        anyhow::bail!("no presence credential enrolled");
    }
    let key = authenticator.signing_key()?;
    info!("Signing key {} ({})", key.alias(), key.public_key().to_base64());

    loop {
        print!("[Enter] authenticate, 'enroll' new credential, 'q' quit > ");
        std::io::stdout().flush()?;
        let command = tokio::task::spawn_blocking(read_line).await??;

        match command.as_str() {
            "q" | "quit" => break,
            "enroll" => {
                boundary.enroll_credential()?;
                continue;
            }
            _ => {}
        }

        match authenticator.authenticate_default(&device_id).await {
            Ok(token) => {
                let key = authenticator.signing_key()?;
                output_token(token.as_str(), &key.public_key().to_base64());
            }
            Err(e) => warn!("Authentication failed: {e}"),
        }
    }

    Ok(())
}

fn read_line() -> std::io::Result<String> {
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_lowercase())
}

/// Print the token (human and machine readable)
fn output_token(token: &str, public_key: &str) {
    info!("=== TOKEN ===");
    info!("Token: {token}");
    if let Ok((_, challenge)) = decode(token) {
        info!("Purpose: {}", challenge.purpose_tag());
        info!("Timestamp: {}", challenge.timestamp());
        info!("Device: {}", challenge.device_id());
    }
    info!("Public Key: {public_key}");

    match token_line(token, public_key) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!("Could not serialize token output: {e}"),
    }
}

fn token_line(token: &str, public_key: &str) -> serde_json::Result<String> {
    serde_json::to_string(&TokenOutput { token, pk: public_key })
}
