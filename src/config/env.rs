//! Environment overrides and `${VAR}` expansion.
//!
//! Every scalar key of the TOML file can be replaced by an environment
//! variable named `SENTINEL_` followed by the dotted key in upper case with
//! dots replaced by underscores. Overrides are applied onto the parsed
//! [`TomlConfig`] before validation, so file and environment go through
//! the same checks.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::ConfigError;
use super::defaults::ENV_PREFIX;
use super::duration::DurationValue;
use super::toml::TomlConfig;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
});

/// Scalar keys that accept an environment override.
pub const OVERRIDABLE_KEYS: [&str; 30] = [
    "poll_interval",
    "poll_jitter",
    "poll_backoff_min",
    "poll_backoff_max",
    "poll_once_timeout",
    "source.mode",
    "policy.debounce_window",
    "policy.suppression_window",
    "policy.rate_limit_per_min",
    "policy.batch_size",
    "policy.suppress_initial_burst",
    "notifier.idempotency_key_ttl",
    "notifier.retry.max_attempts",
    "notifier.retry.initial_delay",
    "notifier.retry.max_delay",
    "notifier.retry.multiplier",
    "state.path",
    "state.idempotency_key_ttl",
    "tsnet.hostname",
    "tsnet.state_dir",
    "tsnet.auth_key",
    "tsnet.login_mode",
    "tsnet.allow_interactive_fallback",
    "tsnet.login_timeout",
    "output.log_format",
    "output.log_level",
    "output.no_color",
    "detectors.presence.enabled",
    "detectors.peer_changes.enabled",
    "detectors.runtime.enabled",
];

/// Environment variable name for a dotted key.
#[must_use]
pub fn env_var_name(key: &str) -> String {
    format!("{ENV_PREFIX}{}", key.replace('.', "_").to_ascii_uppercase())
}

/// Applies every override `lookup` knows about onto `config`.
///
/// `lookup` is `std::env::var(..).ok()` in production; tests pass a map.
/// Empty values are ignored.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidEnv`] when a value does not parse as the
/// key's type.
pub fn apply_overrides(
    config: &mut TomlConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    for key in OVERRIDABLE_KEYS {
        let var = env_var_name(key);
        let Some(value) = lookup(&var).filter(|v| !v.trim().is_empty()) else {
            continue;
        };
        tracing::debug!(%var, key, "Applying environment override");
        apply_one(config, key, value.trim()).map_err(|reason| ConfigError::InvalidEnv {
            var: var.clone(),
            reason,
        })?;
    }
    Ok(())
}

fn apply_one(config: &mut TomlConfig, key: &str, value: &str) -> Result<(), String> {
    let text = || Some(value.to_string());
    let duration = || Some(DurationValue::Text(value.to_string()));

    match key {
        "poll_interval" => config.poll_interval = duration(),
        "poll_jitter" => config.poll_jitter = duration(),
        "poll_backoff_min" => config.poll_backoff_min = duration(),
        "poll_backoff_max" => config.poll_backoff_max = duration(),
        "poll_once_timeout" => config.poll_once_timeout = duration(),
        "source.mode" => config.source.mode = text(),
        "policy.debounce_window" => config.policy.debounce_window = duration(),
        "policy.suppression_window" => config.policy.suppression_window = duration(),
        "policy.rate_limit_per_min" => config.policy.rate_limit_per_min = Some(number(value)?),
        "policy.batch_size" => config.policy.batch_size = Some(number(value)?),
        "policy.suppress_initial_burst" => {
            config.policy.suppress_initial_burst = Some(boolean(value)?);
        }
        "notifier.idempotency_key_ttl" => config.notifier.idempotency_key_ttl = duration(),
        "notifier.retry.max_attempts" => config.notifier.retry.max_attempts = Some(number(value)?),
        "notifier.retry.initial_delay" => config.notifier.retry.initial_delay = duration(),
        "notifier.retry.max_delay" => config.notifier.retry.max_delay = duration(),
        "notifier.retry.multiplier" => config.notifier.retry.multiplier = Some(number(value)?),
        "state.path" => config.state.path = text(),
        "state.idempotency_key_ttl" => config.state.idempotency_key_ttl = duration(),
        "tsnet.hostname" => config.tsnet.hostname = text(),
        "tsnet.state_dir" => config.tsnet.state_dir = text(),
        "tsnet.auth_key" => config.tsnet.auth_key = text(),
        "tsnet.login_mode" => config.tsnet.login_mode = text(),
        "tsnet.allow_interactive_fallback" => {
            config.tsnet.allow_interactive_fallback = Some(boolean(value)?);
        }
        "tsnet.login_timeout" => config.tsnet.login_timeout = duration(),
        "output.log_format" => config.output.log_format = text(),
        "output.log_level" => config.output.log_level = text(),
        "output.no_color" => config.output.no_color = Some(boolean(value)?),
        detector => {
            let name = detector
                .strip_prefix("detectors.")
                .and_then(|rest| rest.strip_suffix(".enabled"))
                .ok_or_else(|| format!("'{key}' cannot be overridden"))?;
            config
                .detectors
                .entry(name.to_string())
                .or_default()
                .enabled = Some(boolean(value)?);
        }
    }
    Ok(())
}

fn number<T: std::str::FromStr>(value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("'{value}' is not a valid number"))
}

fn boolean(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(format!("'{value}' is not a boolean (use true or false)")),
    }
}

/// Replaces every `${VAR}` in `input` with the value `lookup` returns.
///
/// Unset variables expand to the empty string and are logged, so a URL
/// made only of a missing placeholder fails URL validation.
#[must_use]
pub fn expand_placeholders(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    PLACEHOLDER
        .replace_all(input, |caps: &Captures<'_>| {
            let name = &caps[1];
            lookup(name).unwrap_or_else(|| {
                tracing::warn!(var = name, "Placeholder refers to an unset variable");
                String::new()
            })
        })
        .into_owned()
}
