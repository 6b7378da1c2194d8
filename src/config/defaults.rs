//! Default values for configuration options.
//!
//! Centralized constants to avoid magic numbers scattered across the codebase.

use std::time::Duration;

use crate::retry::RetryPolicy;

pub use crate::notify::DEFAULT_IDEMPOTENCY_TTL as IDEMPOTENCY_KEY_TTL;
pub use crate::poller::{
    DEFAULT_BACKOFF_MAX as POLL_BACKOFF_MAX, DEFAULT_BACKOFF_MIN as POLL_BACKOFF_MIN,
    DEFAULT_POLL_INTERVAL as POLL_INTERVAL, DEFAULT_POLL_JITTER as POLL_JITTER,
    DEFAULT_POLL_ONCE_TIMEOUT as POLL_ONCE_TIMEOUT,
};
pub use crate::policy::{
    DEFAULT_BATCH_SIZE as BATCH_SIZE, DEFAULT_DEBOUNCE_WINDOW as DEBOUNCE_WINDOW,
    DEFAULT_RATE_LIMIT_PER_MIN as RATE_LIMIT_PER_MIN,
};

/// Config file looked up in the working directory when none is given.
pub const CONFIG_FILE: &str = "sentinel.toml";

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "SENTINEL_CONFIG_PATH";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "SENTINEL_";

/// Default state file.
pub const STATE_PATH: &str = ".sentinel/state.json";

/// Default node host name.
pub const TSNET_HOSTNAME: &str = "sentinel";

/// Default node state directory.
pub const TSNET_STATE_DIR: &str = ".sentinel/tsnet";

/// Default bound on interactive login.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Name of the sink created when none is configured.
pub const STDOUT_SINK: &str = "stdout-debug";

/// Default log level directive.
pub const LOG_LEVEL: &str = "info";

/// Default maximum number of delivery attempts.
pub const RETRY_MAX_ATTEMPTS: u32 = RetryPolicy::DEFAULT_MAX_ATTEMPTS;

/// Default delay before the first delivery retry.
pub const RETRY_INITIAL_DELAY: Duration = RetryPolicy::DEFAULT_INITIAL_DELAY;

/// Default delivery retry ceiling.
pub const RETRY_MAX_DELAY: Duration = RetryPolicy::DEFAULT_MAX_DELAY;

/// Default retry backoff multiplier.
pub const RETRY_MULTIPLIER: f64 = RetryPolicy::DEFAULT_MULTIPLIER;
