//! TOML configuration file parsing.
//!
//! Defines the structure of the configuration file with serde. Every
//! field is optional; defaults are applied during validation.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use super::ConfigError;
use super::duration::DurationValue;

/// Root configuration structure from TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    /// Delay between successful polls
    pub poll_interval: Option<DurationValue>,

    /// Upper bound of random delay added to every sleep
    pub poll_jitter: Option<DurationValue>,

    /// First backoff after a failed poll
    pub poll_backoff_min: Option<DurationValue>,

    /// Backoff ceiling
    pub poll_backoff_max: Option<DurationValue>,

    /// Deadline for `run --once`
    pub poll_once_timeout: Option<DurationValue>,

    /// Snapshot source configuration
    #[serde(default)]
    pub source: SourceSection,

    /// Per-detector switches, keyed by detector name
    #[serde(default)]
    pub detectors: BTreeMap<String, DetectorSection>,

    /// Detector execution order
    pub detector_order: Option<Vec<String>>,

    /// Notification policy
    #[serde(default)]
    pub policy: PolicySection,

    /// Routing, sinks and delivery retries
    #[serde(default)]
    pub notifier: NotifierSection,

    /// State persistence
    #[serde(default)]
    pub state: StateSection,

    /// Node identity and onboarding
    #[serde(default)]
    pub tsnet: TsnetSection,

    /// Logging
    #[serde(default)]
    pub output: OutputSection,
}

/// Snapshot source section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSection {
    /// `realtime` or `poll`
    pub mode: Option<String>,
}

/// One detector's switch.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectorSection {
    /// Whether the detector runs (default: true)
    pub enabled: Option<bool>,
}

/// Policy section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySection {
    /// Trailing quiet period before an event is released
    pub debounce_window: Option<DurationValue>,

    /// Minimum gap between two emissions of the same event
    pub suppression_window: Option<DurationValue>,

    /// Emissions allowed per rolling minute (0 disables)
    pub rate_limit_per_min: Option<u32>,

    /// Maximum events per batch
    pub batch_size: Option<usize>,

    /// Skip notifications on the first run without stored state
    pub suppress_initial_burst: Option<bool>,
}

/// Notifier section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifierSection {
    /// Idempotency TTL (falls back to `state.idempotency_key_ttl`)
    pub idempotency_key_ttl: Option<DurationValue>,

    /// Routing rules; a catch-all to `stdout-debug` when absent
    pub routes: Option<Vec<RouteSection>>,

    /// Sinks; a single `stdout-debug` sink when absent
    pub sinks: Option<Vec<SinkSection>>,

    /// Delivery retry policy
    #[serde(default)]
    pub retry: RetrySection,
}

/// One routing rule.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSection {
    /// Event type names, or `*`
    #[serde(default)]
    pub event_types: Vec<String>,

    /// Severities; empty matches all
    #[serde(default)]
    pub severities: Vec<String>,

    /// Target sink names
    #[serde(default)]
    pub sinks: Vec<String>,
}

/// One sink.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkSection {
    /// Unique sink name
    #[serde(default)]
    pub name: String,

    /// `stdout`, `webhook`, `discord` or `debug`
    #[serde(rename = "type", default)]
    pub kind: String,

    /// Endpoint for webhook and discord sinks; `${VAR}` is expanded
    pub url: Option<String>,

    /// Handlebars body template for webhook sinks
    pub body_template: Option<String>,

    /// Extra HTTP headers; values support `${VAR}`
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Delivery retry section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    /// Maximum number of attempts
    pub max_attempts: Option<u32>,

    /// Delay before the first retry
    pub initial_delay: Option<DurationValue>,

    /// Retry delay ceiling
    pub max_delay: Option<DurationValue>,

    /// Backoff multiplier
    pub multiplier: Option<f64>,
}

/// State section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateSection {
    /// State file path
    pub path: Option<String>,

    /// Default idempotency TTL
    pub idempotency_key_ttl: Option<DurationValue>,
}

/// Node identity and onboarding section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TsnetSection {
    /// Host name used when logging in
    pub hostname: Option<String>,

    /// Directory searched for `tailscaled.sock`
    pub state_dir: Option<String>,

    /// Auth key for non-interactive login
    pub auth_key: Option<String>,

    /// `auto`, `auth_key` or `interactive`
    pub login_mode: Option<String>,

    /// Allow interactive login after an auth-key failure
    pub allow_interactive_fallback: Option<bool>,

    /// Bound on interactive login
    pub login_timeout: Option<DurationValue>,
}

/// Output section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSection {
    /// `pretty` or `json`
    pub log_format: Option<String>,

    /// Level or filter directive, e.g. `info` or `sentinel=debug`
    pub log_level: Option<String>,

    /// Disable ANSI colors
    pub no_color: Option<bool>,
}

impl TomlConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::from)
    }
}

/// Generates a default configuration file with comments.
#[must_use]
pub fn default_config_template() -> String {
    r#"# Sentinel Configuration File
#
# Every key is optional. Any scalar key can also be set through the
# environment as SENTINEL_<KEY>, with dots replaced by underscores,
# e.g. SENTINEL_POLICY_BATCH_SIZE=5 or SENTINEL_STATE_PATH=/var/lib/sentinel/state.json.
# Durations accept seconds (10) or a suffix: 500ms, 10s, 5m, 1h.

# poll_interval = "10s"
# poll_jitter = "1s"
# poll_backoff_min = "500ms"
# poll_backoff_max = "30s"
# poll_once_timeout = "2m"

# Detectors run in this order; each must be listed here to run
# detector_order = ["presence", "peer_changes", "runtime"]

[source]
# "realtime" asks the source to push changes and falls back to polling
# mode = "realtime"

[detectors.presence]
enabled = true

[detectors.peer_changes]
enabled = true

[detectors.runtime]
enabled = true

[policy]
# debounce_window = "3s"
# suppression_window = "0s"
# rate_limit_per_min = 120
# batch_size = 20
# Record the first snapshot without notifying when no state exists
# suppress_initial_burst = true

[notifier]
# idempotency_key_ttl = "24h"

[notifier.retry]
# max_attempts = 3
# initial_delay = "1s"
# max_delay = "30s"
# multiplier = 2.0

# Event types: peer.added, peer.removed, peer.online, peer.offline,
# peer.addresses_changed, peer.tags_changed, self.version_changed,
# self.relay_changed, self.addresses_changed, self.state_changed,
# sentinel.test, or "*" for all
[[notifier.routes]]
event_types = ["*"]
sinks = ["stdout-debug"]

# [[notifier.routes]]
# event_types = ["peer.offline", "self.state_changed"]
# severities = ["warn", "critical"]
# sinks = ["chat"]

[[notifier.sinks]]
name = "stdout-debug"
type = "stdout"

# [[notifier.sinks]]
# name = "chat"
# type = "discord"
# url = "${DISCORD_WEBHOOK_URL}"

# [[notifier.sinks]]
# name = "ops"
# type = "webhook"
# url = "https://hooks.example.com/sentinel"
# Available variables: {{type}}, {{severity}}, {{subject}}, {{occurred_at}},
# {{payload.<key>}}, {{sink}}
# body_template = '{"text": "{{type}} {{subject}}"}'
# [notifier.sinks.headers]
# Authorization = "Bearer ${OPS_TOKEN}"

[state]
# path = ".sentinel/state.json"
# idempotency_key_ttl = "24h"

[tsnet]
# hostname = "sentinel"
# state_dir = ".sentinel/tsnet"
# auth_key = "${TS_AUTHKEY}"
# login_mode = "auto"
# allow_interactive_fallback = false
# login_timeout = "5m"

[output]
# log_format = "pretty"
# log_level = "info"
# no_color = false
"#
    .to_string()
}
