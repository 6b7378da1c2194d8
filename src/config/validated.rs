//! Validated configuration after merging CLI, environment and TOML sources.
//!
//! This module contains the final, validated configuration that is used
//! by the application. All validation is performed during construction.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use handlebars::Handlebars;
use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::detect::{DetectorPipeline, EventType, KNOWN_DETECTORS, Severity};
use crate::netmap::{LoginMode, OnboardingOptions};
use crate::notify::{EventTypeFilter, Router, RoutingRule, Sink, SinkKind};
use crate::policy::PolicySettings;
use crate::poller::{PollSettings, SourceMode};
use crate::retry::RetryPolicy;

use super::cli::Cli;
use super::defaults;
use super::duration::DurationValue;
use super::env::{apply_overrides, expand_placeholders};
use super::error::ConfigError;
use super::toml::{RouteSection, SinkSection, TomlConfig};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        })
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}': expected pretty or json")),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSettings {
    /// Formatter.
    pub format: LogFormat,
    /// Default `EnvFilter` directive.
    pub level: String,
    /// Disable ANSI colors.
    pub no_color: bool,
}

/// Node identity and onboarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsnetSettings {
    /// Host name used when logging in.
    pub hostname: String,
    /// Node state directory.
    pub state_dir: PathBuf,
    /// Login strategy.
    pub onboarding: OnboardingOptions,
}

/// Detector order and switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorSettings {
    /// Execution order.
    pub order: Vec<String>,
    enabled: BTreeMap<String, bool>,
}

impl DetectorSettings {
    /// Returns the enabled flag of `name`; detectors default to enabled.
    #[must_use]
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.get(name).copied().unwrap_or(true)
    }
}

/// Fully validated configuration ready for use by the application.
///
/// # Construction
///
/// Use [`ValidatedConfig::load`] to resolve the config file, apply
/// environment overrides and merge CLI flags, or [`ValidatedConfig::from_raw`]
/// when the TOML is already in hand.
#[derive(Debug)]
pub struct ValidatedConfig {
    /// Config file the values came from, if any.
    pub config_path: Option<PathBuf>,

    /// Poll loop timing and source mode
    pub poll: PollSettings,

    /// Deadline for `run --once`
    pub poll_once_timeout: Duration,

    /// Detector order and switches
    pub detectors: DetectorSettings,

    /// Notification policy
    pub policy: PolicySettings,

    /// Routing rules in configured order
    pub routes: Vec<RoutingRule>,

    /// Sinks in configured order
    pub sinks: Vec<Sink>,

    /// Delivery retry policy
    pub retry_policy: RetryPolicy,

    /// How long a delivered `(key, sink)` pair is remembered
    pub idempotency_ttl: Duration,

    /// State file
    pub state_path: PathBuf,

    /// Node identity and onboarding
    pub tsnet: TsnetSettings,

    /// Logging
    pub output: OutputSettings,
}

impl fmt::Display for ValidatedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config_path = self
            .config_path
            .as_ref()
            .map_or_else(|| "none".to_string(), |p| p.display().to_string());
        let sinks: Vec<String> = self
            .sinks
            .iter()
            .map(|s| format!("{}({})", s.name, s.kind))
            .collect();

        write!(
            f,
            "Config {{ file: {}, source: {}, poll_interval: {}ms, detectors: [{}], \
             debounce: {}ms, rate_limit: {}/min, batch_size: {}, routes: {}, sinks: [{}], \
             retry: {}x/{}ms, ttl: {}s, state: {}, hostname: {}, login: {} }}",
            config_path,
            self.poll.source_mode,
            self.poll.poll_interval.as_millis(),
            self.detectors
                .order
                .iter()
                .filter(|name| self.detectors.is_enabled(name))
                .cloned()
                .collect::<Vec<_>>()
                .join(", "),
            self.policy.debounce_window.as_millis(),
            self.policy.rate_limit_per_min,
            self.policy.batch_size,
            self.routes.len(),
            sinks.join(", "),
            self.retry_policy.max_attempts,
            self.retry_policy.initial_delay.as_millis(),
            self.idempotency_ttl.as_secs(),
            self.state_path.display(),
            self.tsnet.hostname,
            self.tsnet.onboarding.mode,
        )
    }
}

impl ValidatedConfig {
    /// Loads configuration using the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or any value is
    /// invalid.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        Self::load_with_env(cli, |name| std::env::var(name).ok())
    }

    /// Loads configuration with an explicit environment lookup.
    ///
    /// The config file is `--config`, then `SENTINEL_CONFIG_PATH`, then
    /// `./sentinel.toml` if it exists. Without one, defaults apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or any value is
    /// invalid.
    pub fn load_with_env(
        cli: &Cli,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let path = resolve_config_path(cli, &lookup);
        let mut toml = match &path {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Loading config file");
                TomlConfig::load(path)?
            }
            None => TomlConfig::default(),
        };
        apply_overrides(&mut toml, &lookup)?;

        let mut config = Self::from_raw(cli, &toml, &lookup)?;
        config.config_path = path;
        Ok(config)
    }

    /// Creates a validated configuration from CLI arguments and TOML values.
    ///
    /// CLI arguments take precedence over TOML values. `lookup` resolves
    /// `${VAR}` placeholders in sink URLs and headers.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A duration is malformed, or a required one is zero
    /// - Backoff bounds are inverted
    /// - The detector order is empty, duplicated, unknown, or incomplete
    /// - A route names an unknown type, severity, or sink
    /// - A sink name repeats, its type is unknown, or its URL is invalid
    /// - An enum value (source mode, login mode, log format) is unknown
    pub fn from_raw(
        cli: &Cli,
        toml: &TomlConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let poll = Self::resolve_poll(toml)?;
        let poll_once_timeout = positive(
            "poll_once_timeout",
            toml.poll_once_timeout.as_ref(),
            defaults::POLL_ONCE_TIMEOUT,
        )?;
        let detectors = Self::resolve_detectors(toml)?;
        let policy = Self::resolve_policy(toml)?;
        let sinks = Self::resolve_sinks(toml, &lookup)?;
        let routes = Self::resolve_routes(toml, &sinks)?;
        let retry_policy = Self::build_retry_policy(toml)?;

        let idempotency_ttl = match toml.notifier.idempotency_key_ttl.as_ref() {
            Some(ttl) => positive("notifier.idempotency_key_ttl", Some(ttl), Duration::ZERO)?,
            None => positive(
                "state.idempotency_key_ttl",
                toml.state.idempotency_key_ttl.as_ref(),
                defaults::IDEMPOTENCY_KEY_TTL,
            )?,
        };

        let state_path = toml.state.path.as_deref().unwrap_or(defaults::STATE_PATH);
        if state_path.trim().is_empty() {
            return Err(ConfigError::invalid("state.path", "must not be empty"));
        }

        Ok(Self {
            config_path: None,
            poll,
            poll_once_timeout,
            detectors,
            policy,
            routes,
            sinks,
            retry_policy,
            idempotency_ttl,
            state_path: PathBuf::from(state_path),
            tsnet: Self::resolve_tsnet(cli, toml, &lookup)?,
            output: Self::resolve_output(cli, toml)?,
        })
    }

    /// Builds the detector pipeline in configured order.
    ///
    /// # Errors
    ///
    /// Returns an error if the order names a detector with no implementation.
    pub fn pipeline(&self) -> Result<DetectorPipeline, ConfigError> {
        DetectorPipeline::from_order(&self.detectors.order, |name| {
            self.detectors.is_enabled(name)
        })
        .map_err(|e| ConfigError::InvalidDetectors(e.to_string()))
    }

    /// Builds the router over the configured rules.
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new(self.routes.clone())
    }

    fn resolve_poll(toml: &TomlConfig) -> Result<PollSettings, ConfigError> {
        let interval = positive(
            "poll_interval",
            toml.poll_interval.as_ref(),
            defaults::POLL_INTERVAL,
        )?;
        let jitter = duration("poll_jitter", toml.poll_jitter.as_ref(), defaults::POLL_JITTER)?;
        let backoff_min = duration(
            "poll_backoff_min",
            toml.poll_backoff_min.as_ref(),
            defaults::POLL_BACKOFF_MIN,
        )?;
        let backoff_max = duration(
            "poll_backoff_max",
            toml.poll_backoff_max.as_ref(),
            defaults::POLL_BACKOFF_MAX,
        )?;
        if backoff_min > backoff_max {
            return Err(ConfigError::invalid(
                "poll_backoff_min",
                format!(
                    "{}ms must be <= poll_backoff_max ({}ms)",
                    backoff_min.as_millis(),
                    backoff_max.as_millis()
                ),
            ));
        }

        let source_mode = toml
            .source
            .mode
            .as_deref()
            .map(SourceMode::from_str)
            .transpose()
            .map_err(|reason| ConfigError::invalid("source.mode", reason))?
            .unwrap_or_default();

        Ok(PollSettings::default()
            .with_poll_interval(interval)
            .with_poll_jitter(jitter)
            .with_backoff(backoff_min, backoff_max)
            .with_suppress_initial_burst(toml.policy.suppress_initial_burst.unwrap_or(true))
            .with_source_mode(source_mode))
    }

    fn resolve_detectors(toml: &TomlConfig) -> Result<DetectorSettings, ConfigError> {
        if let Some(unknown) = toml
            .detectors
            .keys()
            .find(|name| !KNOWN_DETECTORS.contains(&name.as_str()))
        {
            return Err(ConfigError::InvalidDetectors(format!(
                "unknown detector '{unknown}' in [detectors]"
            )));
        }

        let order: Vec<String> = match &toml.detector_order {
            Some(order) => order.iter().map(|name| name.trim().to_string()).collect(),
            None => KNOWN_DETECTORS.iter().map(ToString::to_string).collect(),
        };
        if order.is_empty() {
            return Err(ConfigError::InvalidDetectors(
                "detector_order must not be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for name in &order {
            if !KNOWN_DETECTORS.contains(&name.as_str()) {
                return Err(ConfigError::InvalidDetectors(format!(
                    "unknown detector '{name}' in detector_order"
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::InvalidDetectors(format!(
                    "detector '{name}' appears more than once in detector_order"
                )));
            }
        }

        let enabled: BTreeMap<String, bool> = toml
            .detectors
            .iter()
            .map(|(name, section)| (name.clone(), section.enabled.unwrap_or(true)))
            .collect();
        if let Some((missing, _)) = enabled
            .iter()
            .find(|(name, on)| **on && !seen.contains(name.as_str()))
        {
            return Err(ConfigError::InvalidDetectors(format!(
                "detector '{missing}' is enabled but missing from detector_order"
            )));
        }

        Ok(DetectorSettings { order, enabled })
    }

    fn resolve_policy(toml: &TomlConfig) -> Result<PolicySettings, ConfigError> {
        let section = &toml.policy;
        let batch_size = section.batch_size.unwrap_or(defaults::BATCH_SIZE);
        if batch_size == 0 {
            return Err(ConfigError::invalid("policy.batch_size", "must be > 0"));
        }

        Ok(PolicySettings::default()
            .with_debounce_window(duration(
                "policy.debounce_window",
                section.debounce_window.as_ref(),
                defaults::DEBOUNCE_WINDOW,
            )?)
            .with_suppression_window(duration(
                "policy.suppression_window",
                section.suppression_window.as_ref(),
                Duration::ZERO,
            )?)
            .with_rate_limit_per_min(
                section
                    .rate_limit_per_min
                    .unwrap_or(defaults::RATE_LIMIT_PER_MIN),
            )
            .with_batch_size(batch_size))
    }

    fn resolve_sinks(
        toml: &TomlConfig,
        lookup: &impl Fn(&str) -> Option<String>,
    ) -> Result<Vec<Sink>, ConfigError> {
        let Some(sections) = &toml.notifier.sinks else {
            return Ok(vec![Sink::new(defaults::STDOUT_SINK, SinkKind::Stdout)]);
        };

        let mut names = HashSet::new();
        let mut sinks = Vec::with_capacity(sections.len());
        for (index, section) in sections.iter().enumerate() {
            let sink = build_sink(index, section, lookup)?;
            if !names.insert(sink.name.clone()) {
                return Err(ConfigError::InvalidSink {
                    index,
                    reason: format!("duplicate sink name '{}'", sink.name),
                });
            }
            sinks.push(sink);
        }
        Ok(sinks)
    }

    /// Without configured routes every event goes to every sink, which
    /// with the default sink list is the single stdout sink.
    fn resolve_routes(toml: &TomlConfig, sinks: &[Sink]) -> Result<Vec<RoutingRule>, ConfigError> {
        let Some(sections) = &toml.notifier.routes else {
            return Ok(vec![RoutingRule::catch_all(
                sinks.iter().map(|s| s.name.clone()),
            )]);
        };

        sections
            .iter()
            .enumerate()
            .map(|(index, section)| build_route(index, section, sinks))
            .collect()
    }

    fn build_retry_policy(toml: &TomlConfig) -> Result<RetryPolicy, ConfigError> {
        let retry = &toml.notifier.retry;

        let max_attempts = retry.max_attempts.unwrap_or(defaults::RETRY_MAX_ATTEMPTS);
        if max_attempts < RetryPolicy::MIN_MAX_ATTEMPTS {
            return Err(ConfigError::InvalidRetry(format!(
                "max_attempts must be >= {}",
                RetryPolicy::MIN_MAX_ATTEMPTS
            )));
        }

        let initial_delay = positive(
            "notifier.retry.initial_delay",
            retry.initial_delay.as_ref(),
            defaults::RETRY_INITIAL_DELAY,
        )?;
        let max_delay = duration(
            "notifier.retry.max_delay",
            retry.max_delay.as_ref(),
            defaults::RETRY_MAX_DELAY,
        )?;
        if max_delay < initial_delay {
            return Err(ConfigError::InvalidRetry(format!(
                "max_delay ({}ms) must be >= initial_delay ({}ms)",
                max_delay.as_millis(),
                initial_delay.as_millis()
            )));
        }

        let multiplier = retry.multiplier.unwrap_or(defaults::RETRY_MULTIPLIER);
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::InvalidRetry(format!(
                "multiplier must be a finite number >= 1.0, got {multiplier}"
            )));
        }

        Ok(RetryPolicy::new()
            .with_max_attempts(max_attempts)
            .with_initial_delay(initial_delay)
            .with_max_delay(max_delay)
            .with_multiplier(multiplier))
    }

    fn resolve_tsnet(
        cli: &Cli,
        toml: &TomlConfig,
        lookup: &impl Fn(&str) -> Option<String>,
    ) -> Result<TsnetSettings, ConfigError> {
        let section = &toml.tsnet;

        let hostname = section
            .hostname
            .clone()
            .unwrap_or_else(|| defaults::TSNET_HOSTNAME.to_string());
        if hostname.trim().is_empty() {
            return Err(ConfigError::invalid("tsnet.hostname", "must not be empty"));
        }

        let state_dir = cli.tailscale_state_dir.clone().unwrap_or_else(|| {
            PathBuf::from(
                section
                    .state_dir
                    .as_deref()
                    .unwrap_or(defaults::TSNET_STATE_DIR),
            )
        });
        if state_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("tsnet.state_dir", "must not be empty"));
        }

        let mode = cli
            .tailscale_login_mode
            .as_deref()
            .or(section.login_mode.as_deref())
            .map(LoginMode::from_str)
            .transpose()
            .map_err(|reason| ConfigError::invalid("tsnet.login_mode", reason))?
            .unwrap_or_default();

        let login_timeout = match cli.tailscale_login_timeout {
            Some(timeout) => timeout,
            None => duration(
                "tsnet.login_timeout",
                section.login_timeout.as_ref(),
                defaults::LOGIN_TIMEOUT,
            )?,
        };
        if login_timeout.is_zero() {
            return Err(ConfigError::invalid("tsnet.login_timeout", "must be > 0"));
        }

        let auth_key = cli
            .tailscale_auth_key
            .clone()
            .or_else(|| section.auth_key.clone())
            .map(|key| expand_placeholders(&key, lookup))
            .filter(|key| !key.trim().is_empty());

        Ok(TsnetSettings {
            hostname,
            state_dir,
            onboarding: OnboardingOptions {
                mode,
                auth_key,
                allow_interactive_fallback: cli.tailscale_allow_interactive_fallback
                    || section.allow_interactive_fallback.unwrap_or(false),
                login_timeout,
            },
        })
    }

    fn resolve_output(cli: &Cli, toml: &TomlConfig) -> Result<OutputSettings, ConfigError> {
        let section = &toml.output;

        let format = match cli.log_format {
            Some(arg) => arg.into(),
            None => section
                .log_format
                .as_deref()
                .map(LogFormat::from_str)
                .transpose()
                .map_err(|reason| ConfigError::invalid("output.log_format", reason))?
                .unwrap_or_default(),
        };

        let level = cli
            .log_level
            .clone()
            .or_else(|| section.log_level.clone())
            .unwrap_or_else(|| defaults::LOG_LEVEL.to_string());
        EnvFilter::try_new(&level)
            .map_err(|e| ConfigError::invalid("output.log_level", e.to_string()))?;

        Ok(OutputSettings {
            format,
            level,
            no_color: cli.no_color || section.no_color.unwrap_or(false),
        })
    }
}

/// Writes the default configuration template to a file.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_default_config(path: &Path) -> Result<(), ConfigError> {
    let template = super::toml::default_config_template();
    std::fs::write(path, template).map_err(|e| ConfigError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })
}

// Helper functions

fn resolve_config_path(cli: &Cli, lookup: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(path) = &cli.config {
        return Some(path.clone());
    }
    if let Some(path) = lookup(defaults::CONFIG_PATH_ENV).filter(|p| !p.trim().is_empty()) {
        return Some(PathBuf::from(path));
    }
    let local = Path::new(defaults::CONFIG_FILE);
    local.is_file().then(|| local.to_path_buf())
}

fn duration(
    field: &str,
    value: Option<&DurationValue>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    value.map_or(Ok(default), |v| {
        v.resolve().map_err(|reason| ConfigError::invalid(field, reason))
    })
}

fn positive(
    field: &str,
    value: Option<&DurationValue>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let resolved = duration(field, value, default)?;
    if resolved.is_zero() {
        return Err(ConfigError::invalid(field, "must be > 0"));
    }
    Ok(resolved)
}

fn build_sink(
    index: usize,
    section: &SinkSection,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Sink, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidSink { index, reason };

    let name = section.name.trim();
    if name.is_empty() {
        return Err(invalid("name must not be empty".to_string()));
    }
    let kind = SinkKind::from_str(&section.kind).map_err(invalid)?;
    let mut sink = Sink::new(name, kind);

    if kind.needs_endpoint() {
        let raw = section
            .url
            .as_deref()
            .ok_or_else(|| invalid(format!("{kind} sink '{name}' requires a url")))?;
        sink = sink.with_endpoint(parse_endpoint(index, raw, lookup)?);
    }

    if let Some(template) = &section.body_template {
        if kind != SinkKind::Webhook {
            return Err(invalid(format!(
                "body_template is only supported on webhook sinks, '{name}' is {kind}"
            )));
        }
        Handlebars::new()
            .register_template_string("body", template)
            .map_err(|e| invalid(format!("invalid body_template: {e}")))?;
        sink = sink.with_body_template(template.clone());
    }

    let mut headers = HeaderMap::new();
    for (key, value) in &section.headers {
        let header_name = key
            .parse::<HeaderName>()
            .map_err(|e| invalid(format!("invalid header name '{key}': {e}")))?;
        let header_value = HeaderValue::from_str(&expand_placeholders(value, lookup))
            .map_err(|e| invalid(format!("invalid value for header '{key}': {e}")))?;
        headers.insert(header_name, header_value);
    }
    Ok(sink.with_headers(headers))
}

fn parse_endpoint(
    index: usize,
    raw: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Url, ConfigError> {
    let field = format!("notifier.sinks[{index}].url");
    let expanded = expand_placeholders(raw, lookup);
    let url = Url::parse(&expanded).map_err(|e| ConfigError::InvalidUrl {
        field: field.clone(),
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl {
            field,
            url: raw.to_string(),
            reason: "URL must use http or https scheme".to_string(),
        });
    }
    Ok(url)
}

fn build_route(
    index: usize,
    section: &RouteSection,
    sinks: &[Sink],
) -> Result<RoutingRule, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidRoute { index, reason };

    if section.event_types.is_empty() {
        return Err(invalid("event_types must not be empty".to_string()));
    }
    let event_types = if section.event_types.iter().any(|t| t.trim() == "*") {
        EventTypeFilter::Any
    } else {
        EventTypeFilter::Only(
            section
                .event_types
                .iter()
                .map(|t| EventType::from_str(t))
                .collect::<Result<BTreeSet<_>, _>>()
                .map_err(invalid)?,
        )
    };

    let severities = section
        .severities
        .iter()
        .map(|s| Severity::from_str(s))
        .collect::<Result<BTreeSet<_>, _>>()
        .map_err(invalid)?;

    if section.sinks.is_empty() {
        return Err(invalid("sinks must not be empty".to_string()));
    }
    if let Some(unknown) = section
        .sinks
        .iter()
        .find(|name| !sinks.iter().any(|s| &s.name == *name))
    {
        return Err(invalid(format!("sink '{unknown}' is not configured")));
    }

    Ok(RoutingRule {
        event_types,
        severities,
        sinks: section.sinks.clone(),
    })
}
