//! Snapshot source trait, its error type, and the onboarding state machine.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use super::Snapshot;

/// Error type for fetching snapshots and onboarding.
///
/// The poller treats every variant the same way: the cycle is abandoned
/// and retried after backoff.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source could not be reached (daemon down, command missing).
    #[error("Source unreachable: {0}")]
    Unreachable(String),

    /// The source answered with something that could not be parsed.
    #[error("Invalid source response: {0}")]
    InvalidResponse(String),

    /// The node is not logged in and no onboarding was attempted.
    #[error("Node needs login (backend state: {state})")]
    NeedsLogin {
        /// Backend state reported by the source.
        state: String,
    },

    /// Auth-key login was requested but no key is configured.
    #[error("No auth key configured")]
    MissingAuthKey,

    /// Authentication was rejected.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Interactive login did not complete in time.
    #[error("Interactive login timed out after {}s", .0.as_secs())]
    LoginTimeout(Duration),
}

/// Strategy for authenticating the node to the tailnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoginMode {
    /// Try the auth key first, optionally falling back to interactive login.
    #[default]
    Auto,
    /// Non-interactive login with an auth key; fails fast.
    AuthKey,
    /// Block until the user completes login in a browser.
    Interactive,
}

impl fmt::Display for LoginMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::AuthKey => "auth_key",
            Self::Interactive => "interactive",
        })
    }
}

impl FromStr for LoginMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "auth_key" | "authkey" => Ok(Self::AuthKey),
            "interactive" => Ok(Self::Interactive),
            other => Err(format!(
                "unknown login mode '{other}': expected auto, auth_key, or interactive"
            )),
        }
    }
}

/// Supplies netmap snapshots.
///
/// # Design
///
/// The poller only depends on this trait, so tests inject scripted sources
/// and the binary plugs in [`super::TailscaleCli`].
pub trait SnapshotSource: Send + Sync {
    /// Ensures the node is authenticated and ready to serve snapshots.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] when onboarding fails.
    fn connect(&self) -> impl std::future::Future<Output = Result<(), SourceError>> + Send;

    /// Fetches the current snapshot. `generation` is left at 0.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] when the source is unreachable or its
    /// response cannot be parsed.
    fn snapshot(&self) -> impl std::future::Future<Output = Result<Snapshot, SourceError>> + Send;

    /// Whether the source can push change notifications.
    fn supports_push(&self) -> bool {
        false
    }
}

/// Backend hooks the onboarding state machine drives.
pub trait Authenticator: Send + Sync {
    /// Returns true if the backend is already logged in and running.
    fn is_running(&self) -> impl std::future::Future<Output = Result<bool, SourceError>> + Send;

    /// Logs in non-interactively with an auth key.
    fn login_with_auth_key(
        &self,
        auth_key: &str,
    ) -> impl std::future::Future<Output = Result<(), SourceError>> + Send;

    /// Starts an interactive login and waits for the user to finish it.
    fn login_interactive(&self) -> impl std::future::Future<Output = Result<(), SourceError>> + Send;
}

/// Onboarding options resolved from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnboardingOptions {
    /// Requested login mode.
    pub mode: LoginMode,
    /// Auth key, when configured.
    pub auth_key: Option<String>,
    /// Whether `auto` may fall back to interactive login.
    pub allow_interactive_fallback: bool,
    /// Upper bound on interactive login.
    pub login_timeout: Duration,
}

impl Default for OnboardingOptions {
    fn default() -> Self {
        Self {
            mode: LoginMode::Auto,
            auth_key: None,
            allow_interactive_fallback: false,
            login_timeout: Duration::from_secs(300),
        }
    }
}

/// Runs the login state machine against an [`Authenticator`].
///
/// | Mode | Behavior |
/// |------|----------|
/// | `auth_key` | Requires a key; one attempt, errors surface immediately |
/// | `interactive` | Waits up to `login_timeout` for the user |
/// | `auto` | Auth key first; interactive only if fallback is allowed |
///
/// An already-running backend skips login in every mode.
///
/// # Errors
///
/// Returns the error of the last login step attempted.
pub async fn onboard<A: Authenticator>(
    auth: &A,
    options: &OnboardingOptions,
) -> Result<(), SourceError> {
    if auth.is_running().await? {
        tracing::debug!("Node already running, skipping login");
        return Ok(());
    }

    tracing::info!("Node needs login, onboarding with mode {}", options.mode);

    match options.mode {
        LoginMode::AuthKey => login_with_key(auth, options).await,
        LoginMode::Interactive => login_interactive(auth, options.login_timeout).await,
        LoginMode::Auto => match login_with_key(auth, options).await {
            Ok(()) => Ok(()),
            Err(e) if options.allow_interactive_fallback => {
                tracing::warn!("Auth-key login failed ({e}), falling back to interactive login");
                login_interactive(auth, options.login_timeout).await
            }
            Err(e) => Err(e),
        },
    }
}

async fn login_with_key<A: Authenticator>(
    auth: &A,
    options: &OnboardingOptions,
) -> Result<(), SourceError> {
    let key = options
        .auth_key
        .as_deref()
        .filter(|k| !k.trim().is_empty())
        .ok_or(SourceError::MissingAuthKey)?;
    auth.login_with_auth_key(key).await
}

async fn login_interactive<A: Authenticator>(
    auth: &A,
    timeout: Duration,
) -> Result<(), SourceError> {
    tracing::info!(
        "Waiting up to {}s for interactive login to complete",
        timeout.as_secs()
    );
    tokio::time::timeout(timeout, auth.login_interactive())
        .await
        .map_err(|_| SourceError::LoginTimeout(timeout))?
}
