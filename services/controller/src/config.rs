use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use steward_reconcile::{BackoffPolicy, Ownership, ReconcilerConfig, RetryPolicy};

/// Ownership applied to manifests that do not declare their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultOwnership {
    /// Never remove fields the manifest does not mention.
    Partial,

    /// Remove every observed field the manifest does not mention.
    Full,
}

impl DefaultOwnership {
    pub fn ownership(&self) -> Ownership {
        match self {
            DefaultOwnership::Partial => Ownership::none(),
            DefaultOwnership::Full => Ownership::Full,
        }
    }
}

impl FromStr for DefaultOwnership {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "partial" => Ok(DefaultOwnership::Partial),
            "full" => Ok(DefaultOwnership::Full),
            other => bail!("expected 'partial' or 'full', got '{other}'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub manifest_dir: PathBuf,
    pub log_level: String,
    pub default_ownership: DefaultOwnership,
    pub reconciler: ReconcilerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = lookup("STEWARD_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .context("STEWARD_LISTEN_ADDR must be a socket address")?;

        let manifest_dir = lookup("STEWARD_MANIFEST_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./manifests"));

        let log_level = lookup("STEWARD_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let default_ownership = parse_var(&lookup, "STEWARD_DEFAULT_OWNERSHIP")?
            .unwrap_or(DefaultOwnership::Partial);

        let defaults = ReconcilerConfig::default();
        let default_backoff = BackoffPolicy::default();
        let default_retry = RetryPolicy::default();

        let jitter: f64 =
            parse_var(&lookup, "STEWARD_BACKOFF_JITTER")?.unwrap_or(default_backoff.jitter);
        if !(0.0..=1.0).contains(&jitter) {
            bail!("STEWARD_BACKOFF_JITTER must be between 0.0 and 1.0, got {jitter}");
        }

        let max_attempts: u32 =
            parse_var(&lookup, "STEWARD_MAX_ATTEMPTS")?.unwrap_or(default_retry.max_attempts);
        if max_attempts == 0 {
            bail!("STEWARD_MAX_ATTEMPTS must be at least 1");
        }

        let reconciler = ReconcilerConfig {
            workers: parse_var(&lookup, "STEWARD_WORKERS")?
                .unwrap_or(defaults.workers)
                .max(1),
            retry: RetryPolicy {
                max_attempts,
                max_conflicts: parse_var(&lookup, "STEWARD_MAX_CONFLICTS")?
                    .unwrap_or(default_retry.max_conflicts),
                backoff: BackoffPolicy {
                    base: millis(&lookup, "STEWARD_BACKOFF_BASE_MS")?.unwrap_or(default_backoff.base),
                    max: millis(&lookup, "STEWARD_BACKOFF_MAX_MS")?.unwrap_or(default_backoff.max),
                    jitter,
                },
            },
            watch_batch_size: parse_var(&lookup, "STEWARD_WATCH_BATCH")?
                .unwrap_or(defaults.watch_batch_size)
                .max(1),
            desired_poll_interval: millis(&lookup, "STEWARD_DESIRED_POLL_MS")?
                .unwrap_or(defaults.desired_poll_interval),
            observe_poll_interval: millis(&lookup, "STEWARD_OBSERVE_POLL_MS")?
                .unwrap_or(defaults.observe_poll_interval),
            prune: lookup("STEWARD_PRUNE")
                .map(|v| v == "1" || v.to_lowercase() == "true")
                .unwrap_or(defaults.prune),
        };

        Ok(Self {
            listen_addr,
            manifest_dir,
            log_level,
            default_ownership,
            reconciler,
        })
    }
}

fn parse_var<F, T>(lookup: &F, name: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{e}"))
                .with_context(|| format!("invalid value '{raw}' for {name}"))
        })
        .transpose()
}

fn millis<F>(lookup: &F, name: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    let ms: Option<u64> = parse_var(lookup, name)?;
    Ok(ms.map(|ms| Duration::from_millis(ms.max(1))))
}
