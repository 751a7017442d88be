//! Email second-factor challenge used by the insurance extranet.
//!
//! The challenge is a small state machine:
//! `AwaitingTrigger -> EmailSent -> AwaitingCode -> Verified | Failed`.
//! A failed challenge is never retried here; a fresh login restarts it.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use url::Url;

use crate::error::{Result, ScrapeError};
use crate::session::SessionClient;

pub const DEFAULT_CODE_WAIT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MfaState {
    AwaitingTrigger,
    EmailSent,
    AwaitingCode,
    Verified,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MfaEvent {
    TriggerSent,
    TriggerAccepted,
    TriggerRejected,
    CodeAccepted,
    CodeRejected,
    CodeMissing,
}

impl MfaState {
    /// Applies one event. Anything outside the happy path lands in `Failed`;
    /// terminal states absorb every event.
    pub fn on(self, event: MfaEvent) -> MfaState {
        use MfaEvent::*;
        use MfaState::*;
        match (self, event) {
            (Verified, _) => Verified,
            (Failed, _) => Failed,
            (AwaitingTrigger, TriggerSent) => EmailSent,
            (EmailSent, TriggerAccepted) => AwaitingCode,
            (AwaitingCode, CodeAccepted) => Verified,
            _ => Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MfaState::Verified | MfaState::Failed)
    }
}

/// Portal-specific knobs of the challenge.
#[derive(Deserialize, Clone, Debug)]
pub struct MfaFlow {
    pub send_path: String,
    pub csrf_field: String,
    pub code_field: String,
    pub session_cookie: String,
    pub landing_marker: String,
}

/// Identity the portal asks to confirm, read from the challenge URL.
#[derive(Debug, Clone, PartialEq)]
pub struct MfaChallenge {
    pub url: Url,
    pub email: String,
    pub who_is_email: String,
}

impl MfaChallenge {
    pub fn from_url(url: Url) -> Result<Self> {
        let param = |key: &str| {
            url.query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
        };
        let email = param("email")
            .ok_or_else(|| ScrapeError::MfaFailed("challenge url has no email".into()))?;
        let who_is_email = param("whoIsEmail")
            .ok_or_else(|| ScrapeError::MfaFailed("challenge url has no whoIsEmail".into()))?;
        Ok(Self {
            url,
            email,
            who_is_email,
        })
    }
}

/// Where the one-time code comes from.
#[async_trait]
pub trait MfaCodeSource: Send + Sync {
    async fn code(&self, challenge: &MfaChallenge) -> Result<Option<String>>;
}

/// Blocking terminal prompt, run off the async workers.
pub struct PromptCodeSource;

#[async_trait]
impl MfaCodeSource for PromptCodeSource {
    async fn code(&self, challenge: &MfaChallenge) -> Result<Option<String>> {
        let email = challenge.email.clone();
        let line = tokio::task::spawn_blocking(move || {
            eprint!("Enter the code sent to {email}: ");
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await
        .map_err(|e| ScrapeError::MfaFailed(format!("prompt task failed: {e}")))??;
        let code = line.trim().to_string();
        Ok((!code.is_empty()).then_some(code))
    }
}

/// Code pushed in by an outer layer (web handler, bot, test) through a channel.
pub struct ChannelCodeSource {
    rx: Mutex<mpsc::Receiver<String>>,
}

impl ChannelCodeSource {
    pub fn new() -> (Self, mpsc::Sender<String>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { rx: Mutex::new(rx) }, tx)
    }
}

#[async_trait]
impl MfaCodeSource for ChannelCodeSource {
    async fn code(&self, _challenge: &MfaChallenge) -> Result<Option<String>> {
        Ok(self.rx.lock().await.recv().await)
    }
}

/// The two requests of the challenge.
#[async_trait]
pub trait MfaTransport: Send + Sync {
    /// Asks the portal to email a code. `true` when the portal accepted.
    async fn trigger(&self, challenge: &MfaChallenge) -> Result<bool>;
    /// Submits the code. `true` when the portal granted an authenticated session.
    async fn verify(&self, challenge: &MfaChallenge, code: &str) -> Result<bool>;
}

/// [`MfaTransport`] over a live portal session.
pub struct PortalMfa<'a> {
    pub session: &'a SessionClient,
    pub flow: &'a MfaFlow,
}

impl PortalMfa<'_> {
    fn identity(&self, challenge: &MfaChallenge) -> Vec<(String, String)> {
        vec![
            ("whoIsEmail".to_string(), challenge.who_is_email.clone()),
            ("email".to_string(), challenge.email.clone()),
            (self.flow.csrf_field.clone(), self.session.csrf_token()),
        ]
    }
}

#[async_trait]
impl MfaTransport for PortalMfa<'_> {
    async fn trigger(&self, challenge: &MfaChallenge) -> Result<bool> {
        let page = self.session.get(challenge.url.as_str()).await?;
        tracing::debug!(status = page.status, "Loaded challenge page");

        let url = self.session.url(&self.flow.send_path);
        let resp = self.session.post_form(&url, &self.identity(challenge)).await?;
        tracing::info!(status = resp.status, "Challenge trigger answered");
        Ok(resp.status == 200)
    }

    async fn verify(&self, challenge: &MfaChallenge, code: &str) -> Result<bool> {
        let mut form = self.identity(challenge);
        form.push((self.flow.code_field.clone(), code.to_string()));

        let resp = self
            .session
            .post_form(challenge.url.as_str(), &form)
            .await?;
        tracing::info!(status = resp.status, final_url = %resp.url, "Challenge code submitted");

        if !matches!(resp.status, 200 | 302 | 303) {
            self.session.dump_debug("mfa_verify", &resp.body);
            return Ok(false);
        }
        if resp.url.as_str().contains(self.flow.landing_marker.as_str()) {
            return Ok(true);
        }
        if self.session.cookie(&self.flow.session_cookie).is_some() {
            return self.session.is_authenticated().await;
        }
        self.session.dump_debug("mfa_verify", &resp.body);
        Ok(false)
    }
}

/// Drives one challenge to a terminal state. Errors are logged and end in `Failed`.
pub async fn run_challenge(
    transport: &dyn MfaTransport,
    challenge: &MfaChallenge,
    source: &dyn MfaCodeSource,
    wait: Duration,
) -> MfaState {
    let mut state = MfaState::AwaitingTrigger.on(MfaEvent::TriggerSent);
    tracing::info!(email = %challenge.email, ?state, "Starting second-factor challenge");

    state = match transport.trigger(challenge).await {
        Ok(true) => state.on(MfaEvent::TriggerAccepted),
        Ok(false) => {
            tracing::error!("Portal refused to send the code");
            state.on(MfaEvent::TriggerRejected)
        }
        Err(e) => {
            tracing::error!(error = %e, "Challenge trigger failed");
            state.on(MfaEvent::TriggerRejected)
        }
    };
    if state.is_terminal() {
        return state;
    }

    let code = match tokio::time::timeout(wait, source.code(challenge)).await {
        Ok(Ok(Some(code))) if !code.trim().is_empty() => code.trim().to_string(),
        Ok(Ok(_)) => {
            tracing::error!("No code provided");
            return state.on(MfaEvent::CodeMissing);
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Code source failed");
            return state.on(MfaEvent::CodeMissing);
        }
        Err(_) => {
            tracing::error!(wait = ?wait, "Timed out waiting for the code");
            return state.on(MfaEvent::CodeMissing);
        }
    };

    state = match transport.verify(challenge, &code).await {
        Ok(true) => state.on(MfaEvent::CodeAccepted),
        Ok(false) => state.on(MfaEvent::CodeRejected),
        Err(e) => {
            tracing::error!(error = %e, "Code verification failed");
            state.on(MfaEvent::CodeRejected)
        }
    };
    tracing::info!(?state, "Second-factor challenge finished");
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakePortal {
        trigger_ok: bool,
        expected_code: &'static str,
        verify_calls: AtomicU32,
    }

    #[async_trait]
    impl MfaTransport for FakePortal {
        async fn trigger(&self, _c: &MfaChallenge) -> Result<bool> {
            Ok(self.trigger_ok)
        }

        async fn verify(&self, _c: &MfaChallenge, code: &str) -> Result<bool> {
            self.verify_calls.fetch_add(1, Ordering::SeqCst);
            Ok(code == self.expected_code)
        }
    }

    fn portal(trigger_ok: bool) -> FakePortal {
        FakePortal {
            trigger_ok,
            expected_code: "123456",
            verify_calls: AtomicU32::new(0),
        }
    }

    fn challenge() -> MfaChallenge {
        let url = Url::parse(
            "https://extranet.example/connection/mfa?email=a%40b.fr&whoIsEmail=courtier",
        )
        .unwrap();
        MfaChallenge::from_url(url).unwrap()
    }

    #[test]
    fn transitions_follow_happy_path_only() {
        use MfaEvent::*;
        use MfaState::*;
        assert_eq!(AwaitingTrigger.on(TriggerSent), EmailSent);
        assert_eq!(EmailSent.on(TriggerAccepted), AwaitingCode);
        assert_eq!(AwaitingCode.on(CodeAccepted), Verified);
        assert_eq!(EmailSent.on(CodeAccepted), Failed);
        assert_eq!(AwaitingTrigger.on(TriggerAccepted), Failed);
        assert_eq!(Failed.on(CodeAccepted), Failed);
        assert_eq!(Verified.on(CodeRejected), Verified);
    }

    #[test]
    fn challenge_reads_identity_from_url() {
        let c = challenge();
        assert_eq!(c.email, "a@b.fr");
        assert_eq!(c.who_is_email, "courtier");

        let bare = Url::parse("https://extranet.example/connection/mfa").unwrap();
        assert!(MfaChallenge::from_url(bare).is_err());
    }

    #[tokio::test]
    async fn injected_code_verifies() {
        let (source, tx) = ChannelCodeSource::new();
        tx.send("123456".into()).await.unwrap();
        let fake = portal(true);
        let state = run_challenge(&fake, &challenge(), &source, Duration::from_secs(1)).await;
        assert_eq!(state, MfaState::Verified);
        assert_eq!(fake.verify_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wrong_code_fails_without_retry() {
        let (source, tx) = ChannelCodeSource::new();
        tx.send("000000".into()).await.unwrap();
        let fake = portal(true);
        let state = run_challenge(&fake, &challenge(), &source, Duration::from_secs(1)).await;
        assert_eq!(state, MfaState::Failed);
        assert_eq!(fake.verify_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waiting_for_code_is_bounded() {
        let (source, _tx) = ChannelCodeSource::new();
        let fake = portal(true);
        let state = run_challenge(&fake, &challenge(), &source, Duration::from_millis(20)).await;
        assert_eq!(state, MfaState::Failed);
        assert_eq!(fake.verify_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_trigger_never_asks_for_code() {
        let (source, tx) = ChannelCodeSource::new();
        tx.send("123456".into()).await.unwrap();
        let fake = portal(false);
        let state = run_challenge(&fake, &challenge(), &source, Duration::from_secs(1)).await;
        assert_eq!(state, MfaState::Failed);
        assert_eq!(fake.verify_calls.load(Ordering::SeqCst), 0);
    }
}
