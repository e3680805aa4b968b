//! Command-line interface for the confr daemon.
//!
//! Mirrors the external surface in spec §6: a backend subcommand plus the
//! common scheduling/logging/timeout flags. Parsing and validation are the
//! only "configuration surface" concerns handled here; everything else
//! (resource discovery, template loading) lives in [`crate::config`].

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::config::backend::BackendConfig;

/// Top-level CLI for the confr configuration-rendering daemon.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "confr",
    version,
    about = "Render local configuration files from key-value backends.",
    long_about = "Render local configuration files from key-value backends.\n\n\
Resources are declared as TOML files under <confdir>/conf.d/*.toml, each\n\
pairing a template under <confdir>/templates/ with a destination path, a\n\
set of backend key prefixes, and optional check/reload commands."
)]
pub struct Cli {
    /// Which backend to fetch keys from.
    #[command(subcommand)]
    pub backend: BackendCommand,

    /// Directory holding `templates/` and `conf.d/*.toml`.
    #[arg(long = "confdir", value_name = "DIR", default_value = "/etc/confr")]
    pub confdir: PathBuf,

    /// Process every resource once and exit.
    #[arg(long = "onetime", conflicts_with_all = ["watch", "interval"])]
    pub onetime: bool,

    /// React to backend change notifications instead of polling.
    #[arg(long = "watch", conflicts_with_all = ["onetime", "interval"])]
    pub watch: bool,

    /// Poll every N seconds. Mutually exclusive with --onetime/--watch.
    #[arg(long = "interval", value_name = "SECONDS")]
    pub interval: Option<u64>,

    /// How to handle per-resource failures within a cycle.
    #[arg(long = "failure-mode", value_enum, default_value_t = FailureMode::BestEffort)]
    pub failure_mode: FailureMode,

    /// Default timeout applied to check_cmd unless a resource overrides it.
    #[arg(long = "check-cmd-timeout", value_parser = parse_duration, default_value = "3s")]
    pub check_cmd_timeout: Duration,

    /// Default timeout applied to reload_cmd unless a resource overrides it.
    #[arg(long = "reload-cmd-timeout", value_parser = parse_duration, default_value = "3s")]
    pub reload_cmd_timeout: Duration,

    /// Emit logs in JSON format.
    #[arg(long = "log-json")]
    pub log_json: bool,

    /// Set log level (overrides env vars like RUST_LOG/CONFR_LOG_LEVEL).
    #[arg(long = "log-level")]
    pub log_level: Option<String>,

    /// Bind address for the /health, /ready and /metrics HTTP endpoints.
    /// If unset, no HTTP surface is started.
    #[arg(long = "metrics-addr", value_name = "HOST:PORT")]
    pub metrics_addr: Option<String>,
}

impl Cli {
    /// The effective scheduling mode implied by the onetime/watch/interval flags.
    pub fn mode(&self) -> RunMode {
        if self.onetime {
            RunMode::Onetime
        } else if self.watch {
            RunMode::Watch
        } else if let Some(secs) = self.interval {
            RunMode::Interval(Duration::from_secs(secs))
        } else {
            RunMode::Onetime
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Onetime,
    Interval(Duration),
    Watch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum FailureMode {
    FailFast,
    BestEffort,
}

/// Per-backend connection parameters, selected as a clap subcommand the same
/// way the original tool selects a backend positionally.
#[derive(Subcommand, Debug, Clone)]
pub enum BackendCommand {
    /// Process environment variables (`FOO_BAR` -> `/foo/bar`).
    Env,
    /// A local directory of YAML/JSON files.
    File {
        #[arg(long, value_name = "GLOB", default_value = "*.yaml")]
        filter: String,
        #[arg(long, value_name = "DIR")]
        path: PathBuf,
    },
    /// etcd v3, with watch support.
    Etcd {
        #[arg(long, value_delimiter = ',', default_value = "http://127.0.0.1:2379")]
        nodes: Vec<String>,
    },
    /// HashiCorp Consul KV store.
    Consul {
        #[arg(long, default_value = "http://127.0.0.1:8500")]
        address: String,
    },
    /// HashiCorp Vault KV engine (v1 or v2, auto-detected).
    Vault {
        #[arg(long, default_value = "http://127.0.0.1:8200")]
        address: String,
        #[arg(long, env = "VAULT_TOKEN")]
        token: String,
        #[arg(long, default_value = "secret")]
        mount: String,
    },
    /// AWS Systems Manager Parameter Store.
    Ssm,
    /// AWS Secrets Manager.
    SecretsManager,
    /// AWS Certificate Manager.
    Acm,
}

impl BackendCommand {
    /// Whether this backend natively supports `WatchPrefix` (spec §4.2, §4.8).
    pub fn supports_watch(&self) -> bool {
        matches!(self, BackendCommand::Etcd { .. })
    }

    pub fn to_config(&self) -> BackendConfig {
        match self {
            BackendCommand::Env => BackendConfig::Env,
            BackendCommand::File { filter, path } => BackendConfig::File {
                path: path.clone(),
                filter: filter.clone(),
            },
            BackendCommand::Etcd { nodes } => BackendConfig::Etcd {
                nodes: nodes.clone(),
            },
            BackendCommand::Consul { address } => BackendConfig::Consul {
                address: address.clone(),
            },
            BackendCommand::Vault {
                address,
                token,
                mount,
            } => BackendConfig::Vault {
                address: address.clone(),
                token: token.clone(),
                mount: mount.clone(),
            },
            BackendCommand::Ssm => BackendConfig::Ssm,
            BackendCommand::SecretsManager => BackendConfig::SecretsManager,
            BackendCommand::Acm => BackendConfig::Acm,
        }
    }
}

/// Parses durations like `"5s"`, `"250ms"`, `"0"` (disables the timeout).
/// `"0"`/`"0s"` map to a zero `Duration`, which callers treat as "no timeout"
/// per spec §3 (`check_cmd_timeout`/`reload_cmd_timeout`, "`0` disables").
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| e.to_string());
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| e.to_string());
    }
    s.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_seconds() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_duration_millis() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn test_parse_duration_zero_disables() {
        assert_eq!(parse_duration("0").unwrap(), Duration::from_secs(0));
    }

    #[test]
    fn test_mode_onetime_default() {
        let cli = Cli::parse_from(["confr", "env"]);
        assert_eq!(cli.mode(), RunMode::Onetime);
    }

    #[test]
    fn test_mode_interval() {
        let cli = Cli::parse_from(["confr", "--interval", "30", "env"]);
        assert_eq!(cli.mode(), RunMode::Interval(Duration::from_secs(30)));
    }

    #[test]
    fn test_mode_watch() {
        let cli = Cli::parse_from(["confr", "--watch", "etcd"]);
        assert_eq!(cli.mode(), RunMode::Watch);
    }

    #[test]
    fn test_file_backend_supports_watch_false() {
        let cmd = BackendCommand::File {
            filter: "*.yaml".into(),
            path: PathBuf::from("/tmp"),
        };
        assert!(!cmd.supports_watch());
    }

    #[test]
    fn test_etcd_backend_supports_watch_true() {
        let cmd = BackendCommand::Etcd {
            nodes: vec!["http://127.0.0.1:2379".into()],
        };
        assert!(cmd.supports_watch());
    }
}
