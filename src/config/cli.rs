//! CLI argument parsing using clap.
//!
//! Defines the command-line interface with all options and subcommands.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use super::duration::parse_duration;

/// Sentinel: tailnet change notifier
///
/// Watches the tailnet network map, detects peer and node changes, and
/// delivers notifications to stdout, webhooks, or Discord.
#[derive(Debug, Parser)]
#[command(name = "sentinel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", value_enum, global = true)]
    pub log_format: Option<LogFormatArg>,

    /// Log level or filter directive (e.g. debug, sentinel=trace)
    #[arg(long = "log-level", global = true)]
    pub log_level: Option<String>,

    /// Disable ANSI colors in log output
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,

    /// Auth key for non-interactive login
    #[arg(long = "tailscale-auth-key", global = true)]
    pub tailscale_auth_key: Option<String>,

    /// Login mode: auto, auth_key, or interactive
    #[arg(long = "tailscale-login-mode", global = true)]
    pub tailscale_login_mode: Option<String>,

    /// Directory holding the node state and control socket
    #[arg(long = "tailscale-state-dir", global = true)]
    pub tailscale_state_dir: Option<PathBuf>,

    /// Bound on interactive login (e.g. 90s, 5m)
    #[arg(long = "tailscale-login-timeout", global = true, value_parser = parse_duration)]
    pub tailscale_login_timeout: Option<Duration>,

    /// Allow interactive login when the auth key is rejected
    #[arg(long = "tailscale-allow-interactive-fallback", global = true)]
    pub tailscale_allow_interactive_fallback: bool,
}

/// Subcommands for sentinel
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Watch the tailnet and deliver notifications
    Run {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,

        /// Detect and log events without delivering them
        #[arg(long = "dry-run")]
        dry_run: bool,
    },

    /// Show the stored snapshot and idempotency ledger
    Status,

    /// Fetch the current netmap and print events against stored state
    Diff,

    /// Print the current netmap snapshot as JSON
    DumpNetmap,

    /// Send a test notification
    TestNotify {
        /// Only notify this sink (default: every configured sink)
        #[arg(long)]
        sink: Option<String>,
    },

    /// Check the configuration and print the resolved values
    ValidateConfig,

    /// Print version information
    Version,

    /// Generate a default configuration file
    Init {
        /// Output path for the configuration file
        #[arg(long, short, default_value = "sentinel.toml")]
        output: PathBuf,
    },
}

/// Log format argument for CLI parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    /// Human-readable lines
    Pretty,
    /// One JSON object per line
    Json,
}

impl From<LogFormatArg> for super::LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => Self::Pretty,
            LogFormatArg::Json => Self::Json,
        }
    }
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Parses CLI arguments from an iterator (useful for testing).
    pub fn parse_from_iter<I, T>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::parse_from(iter)
    }

    /// Returns true if the command runs without loading configuration.
    #[must_use]
    pub const fn skips_config(&self) -> bool {
        matches!(self.command, Command::Init { .. } | Command::Version)
    }
}
