//! Snapshot source backed by the `tailscale` command-line client.
//!
//! Snapshots come from `tailscale status --json`; onboarding runs
//! `tailscale up`. The daemon itself is managed outside this process.
//!
//! Auth keys never appear on the command line. They are written to an
//! owner-only temporary file passed as `--auth-key=file:<path>`, and
//! argument lists quoted in errors are redacted.

use std::collections::HashMap;
use std::io::Write as _;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tokio::process::Command;

use super::{
    Authenticator, OnboardingOptions, PeerRecord, SelfRecord, Snapshot, SnapshotSource,
    SourceError, onboard,
};

#[cfg(test)]
#[path = "tailscale_tests.rs"]
mod tests;

/// Backend state reported by a fully connected node.
const RUNNING: &str = "Running";

/// Socket file name looked up inside the configured state directory.
const SOCKET_NAME: &str = "tailscaled.sock";

/// Default bound on non-interactive commands.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Flag carrying the auth key.
const AUTH_KEY_FLAG: &str = "--auth-key=";

/// [`SnapshotSource`] that shells out to the `tailscale` binary.
///
/// Once onboarding has seen the backend running, `connect` is a no-op and
/// each cycle costs a single `status` call. A snapshot reporting a
/// logged-out backend clears that flag so the next `connect` onboards
/// again. Clones share the flag.
#[derive(Debug, Clone)]
pub struct TailscaleCli {
    binary: PathBuf,
    socket: Option<PathBuf>,
    hostname: String,
    onboarding: OnboardingOptions,
    command_timeout: Duration,
    ready: Arc<AtomicBool>,
}

impl TailscaleCli {
    /// Creates a source using `tailscale` from `PATH`.
    ///
    /// If `state_dir` contains a `tailscaled.sock`, commands are pointed at
    /// that daemon instead of the system default.
    #[must_use]
    pub fn new(hostname: impl Into<String>, state_dir: &Path, onboarding: OnboardingOptions) -> Self {
        let socket = state_dir.join(SOCKET_NAME);
        Self {
            binary: PathBuf::from("tailscale"),
            socket: socket.exists().then_some(socket),
            hostname: hostname.into(),
            onboarding,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Overrides the binary path.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Returns the daemon socket in use, if not the default.
    #[must_use]
    pub fn socket(&self) -> Option<&Path> {
        self.socket.as_deref()
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(ref socket) = self.socket {
            cmd.arg("--socket").arg(socket);
        }
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    async fn run_captured(&self, args: &[&str]) -> Result<Vec<u8>, SourceError> {
        let output = tokio::time::timeout(self.command_timeout, self.command(args).output())
            .await
            .map_err(|_| {
                SourceError::Unreachable(format!(
                    "tailscale {} timed out after {}s",
                    redact(args),
                    self.command_timeout.as_secs()
                ))
            })?
            .map_err(|e| SourceError::Unreachable(format!("failed to run tailscale: {e}")))?;

        if output.status.success() {
            return Ok(output.stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(SourceError::Unreachable(format!(
            "tailscale {} exited with {}: {stderr}",
            redact(args),
            output.status
        )))
    }

    async fn status(&self) -> Result<StatusJson, SourceError> {
        let stdout = self.run_captured(&["status", "--json"]).await?;
        serde_json::from_slice(&stdout).map_err(|e| SourceError::InvalidResponse(e.to_string()))
    }
}

impl Authenticator for TailscaleCli {
    async fn is_running(&self) -> Result<bool, SourceError> {
        Ok(self.status().await?.backend_state == RUNNING)
    }

    async fn login_with_auth_key(&self, auth_key: &str) -> Result<(), SourceError> {
        // Removed when dropped, after the command has exited
        let key_file = stage_auth_key(auth_key)?;
        let auth_arg = format!("{AUTH_KEY_FLAG}file:{}", key_file.path().display());
        let hostname_arg = format!("--hostname={}", self.hostname);
        self.run_captured(&["up", &auth_arg, &hostname_arg])
            .await
            .map(|_| ())
            .map_err(|e| SourceError::AuthFailed(e.to_string()))
    }

    async fn login_interactive(&self) -> Result<(), SourceError> {
        let hostname_arg = format!("--hostname={}", self.hostname);
        // Inherit stderr so the login URL reaches the operator
        let status = self
            .command(&["up", &hostname_arg])
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| SourceError::Unreachable(format!("failed to run tailscale: {e}")))?;

        if status.success() {
            Ok(())
        } else {
            Err(SourceError::AuthFailed(format!(
                "interactive login exited with {status}"
            )))
        }
    }
}

impl SnapshotSource for TailscaleCli {
    async fn connect(&self) -> Result<(), SourceError> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        onboard(self, &self.onboarding).await?;
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn snapshot(&self) -> Result<Snapshot, SourceError> {
        let result = self.status().await?.into_snapshot(SystemTime::now());
        if matches!(result, Err(SourceError::NeedsLogin { .. })) {
            self.ready.store(false, Ordering::Release);
        }
        result
    }
}

/// Writes `auth_key` to a fresh file readable only by the current user.
fn stage_auth_key(auth_key: &str) -> Result<tempfile::NamedTempFile, SourceError> {
    let staged = tempfile::Builder::new()
        .prefix("sentinel-authkey-")
        .tempfile()
        .and_then(|mut file| {
            file.write_all(auth_key.as_bytes())?;
            file.flush()?;
            Ok(file)
        });
    staged.map_err(|e| SourceError::AuthFailed(format!("failed to stage auth key: {e}")))
}

/// Renders `args` for error messages with the auth key value hidden.
fn redact(args: &[&str]) -> String {
    args.iter()
        .map(|arg| {
            if arg.starts_with(AUTH_KEY_FLAG) {
                format!("{AUTH_KEY_FLAG}<redacted>")
            } else {
                (*arg).to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Subset of `tailscale status --json` used to build snapshots.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct StatusJson {
    version: String,
    backend_state: String,
    #[serde(rename = "Self")]
    self_node: Option<NodeJson>,
    peer: Option<HashMap<String, NodeJson>>,
    current_tailnet: Option<TailnetJson>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct NodeJson {
    #[serde(rename = "ID")]
    id: String,
    host_name: String,
    #[serde(rename = "DNSName")]
    dns_name: String,
    #[serde(rename = "TailscaleIPs")]
    tailscale_ips: Option<Vec<IpAddr>>,
    online: bool,
    last_seen: Option<String>,
    tags: Option<Vec<String>>,
    relay: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct TailnetJson {
    name: String,
}

impl StatusJson {
    fn into_snapshot(self, captured_at: SystemTime) -> Result<Snapshot, SourceError> {
        if self.backend_state != RUNNING {
            return Err(SourceError::NeedsLogin {
                state: self.backend_state,
            });
        }

        let node = self.self_node.unwrap_or_default();
        let self_record = SelfRecord {
            id: node.id.clone(),
            name: node.display_name(),
            addresses: node.tailscale_ips.clone().unwrap_or_default().into_iter().collect(),
            online: node.online,
            version: self.version,
            relay: (!node.relay.is_empty()).then_some(node.relay),
            backend_state: self.backend_state,
        };

        let peers = self
            .peer
            .unwrap_or_default()
            .into_values()
            .map(NodeJson::into_peer);

        let mut snapshot = Snapshot::from_peers(captured_at, self_record, peers);
        snapshot.tailnet = self
            .current_tailnet
            .map(|t| t.name)
            .filter(|name| !name.is_empty());
        Ok(snapshot)
    }
}

impl NodeJson {
    fn display_name(&self) -> String {
        if self.host_name.is_empty() {
            self.dns_name.trim_end_matches('.').to_string()
        } else {
            self.host_name.clone()
        }
    }

    fn into_peer(self) -> PeerRecord {
        PeerRecord {
            name: self.display_name(),
            id: self.id,
            addresses: self.tailscale_ips.unwrap_or_default().into_iter().collect(),
            online: self.online,
            last_seen: self.last_seen.as_deref().and_then(parse_last_seen),
            tags: self.tags.unwrap_or_default().into_iter().collect(),
        }
    }
}

/// Parses an RFC 3339 `LastSeen`; the zero time `0001-01-01T00:00:00Z` means unknown.
fn parse_last_seen(value: &str) -> Option<SystemTime> {
    let parsed = chrono::DateTime::parse_from_rfc3339(value).ok()?;
    if parsed.timestamp() <= 0 {
        return None;
    }
    Some(SystemTime::from(parsed.with_timezone(&chrono::Utc)))
}
