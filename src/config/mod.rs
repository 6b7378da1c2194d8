//! Configuration layer for sentinel.
//!
//! This module provides:
//! - CLI argument parsing ([`Cli`], [`Command`])
//! - TOML configuration file parsing ([`TomlConfig`])
//! - Environment overrides and `${VAR}` expansion ([`apply_overrides`])
//! - Validated configuration ([`ValidatedConfig`])
//! - Configuration file generation ([`write_default_config`])
//! - Default values ([`defaults`])
//!
//! # Priority
//!
//! Configuration values are resolved with the following priority (highest to lowest):
//!
//! 1. **Explicit CLI arguments** - Only the logging and `--tailscale-*` flags
//! 2. **Environment** - `SENTINEL_<KEY>` for any scalar key
//! 3. **TOML config file** - `--config`, `SENTINEL_CONFIG_PATH`, or `./sentinel.toml`
//! 4. **Built-in defaults** - See [`defaults`]
//!
//! # Boolean Flag Semantics
//!
//! Boolean flags (`--no-color`, `--tailscale-allow-interactive-fallback`)
//! only enable: a `true` from any source wins.
//!
//! # Lists
//!
//! Routes and sinks come from the file only. Leaving `[[notifier.sinks]]`
//! out yields a single `stdout-debug` sink; leaving `[[notifier.routes]]`
//! out routes every event to every sink.

mod cli;
pub mod defaults;
mod duration;
mod env;
mod error;
mod toml;
mod validated;


pub use cli::{Cli, Command, LogFormatArg};
pub use duration::{DurationValue, parse_duration};
pub use env::{OVERRIDABLE_KEYS, apply_overrides, env_var_name, expand_placeholders};
pub use error::ConfigError;
pub use toml::{TomlConfig, default_config_template};
pub use validated::{
    DetectorSettings, LogFormat, OutputSettings, TsnetSettings, ValidatedConfig,
    write_default_config,
};
