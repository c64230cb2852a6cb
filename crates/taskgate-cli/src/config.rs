//! Configuration – reads/writes `~/.taskgate/config.toml`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use taskgate_kernel::retry_policy::DEFAULT_MAX_RETRIES;
use taskgate_kernel::{RetryPolicy, RetryRule};

use crate::pool::PoolSettings;

/// Per-`task_type` retry settings; unset fields fall back to the top level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
}

/// Persisted configuration stored in `~/.taskgate/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// SQLite database file holding tasks, receipts and policies.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Number of dispatcher loops in the pool.
    #[serde(default = "default_dispatchers")]
    pub dispatchers: usize,

    /// How long an idle dispatcher sleeps before polling again.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Attempts per task unless overridden.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff after the first failed attempt; doubles per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Claims whose lease has not been renewed for this long are reaped as
    /// `claim_timeout` failures.  Running workers renew at a quarter of it.
    #[serde(default = "default_stale_claim_timeout_secs")]
    pub stale_claim_timeout_secs: u64,

    /// Receipts walked per chain by `/verify` and the health check.
    #[serde(default = "default_verify_limit")]
    pub verify_limit: usize,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub retry_overrides: BTreeMap<String, RetryOverride>,
}

fn default_database_path() -> String {
    taskgate_dir_for_home(&home_dir())
        .join("taskgate.db")
        .to_string_lossy()
        .into_owned()
}
fn default_dispatchers() -> usize {
    2
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_retry_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    60_000
}
fn default_stale_claim_timeout_secs() -> u64 {
    300
}
fn default_verify_limit() -> usize {
    1_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            dispatchers: default_dispatchers(),
            poll_interval_ms: default_poll_interval_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            stale_claim_timeout_secs: default_stale_claim_timeout_secs(),
            verify_limit: default_verify_limit(),
            retry_overrides: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Build the kernel's [`RetryPolicy`] from the retry fields.
    pub fn retry_policy(&self) -> RetryPolicy {
        let max_backoff = Duration::from_millis(self.max_backoff_ms);
        let rule = |max_retries: u32, backoff_ms: u64| {
            RetryRule::new(max_retries).with_backoff(Duration::from_millis(backoff_ms), max_backoff)
        };

        self.retry_overrides.iter().fold(
            RetryPolicy::new(rule(self.max_retries, self.retry_backoff_ms)),
            |policy, (task_type, o)| {
                policy.with_override(
                    task_type.as_str(),
                    rule(
                        o.max_retries.unwrap_or(self.max_retries),
                        o.backoff_ms.unwrap_or(self.retry_backoff_ms),
                    ),
                )
            },
        )
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            dispatchers: self.dispatchers.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            stale_after: self.stale_claim_timeout(),
            verify_limit: self.verify_limit,
            maintenance_interval: Duration::from_secs(self.stale_claim_timeout_secs.clamp(1, 60)),
        }
    }

    pub fn stale_claim_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_claim_timeout_secs)
    }

    /// Lease renewal period, well inside the stale threshold.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.stale_claim_timeout() / 4).clamp(Duration::from_secs(1), Duration::from_secs(30))
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn taskgate_dir_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".taskgate")
}

/// Return the config path: `TASKGATE_CONFIG` if set, else
/// `~/.taskgate/config.toml`.
pub fn config_path() -> PathBuf {
    match std::env::var("TASKGATE_CONFIG") {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => config_path_for_home(&home_dir()),
    }
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    taskgate_dir_for_home(home).join("config.toml")
}

/// Load the config from disk with environment overrides applied.
/// Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

/// Load the config from a specific path, without environment overrides.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw)
        .map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `TASKGATE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `TASKGATE_DATABASE_PATH` | `database_path` |
/// | `TASKGATE_DISPATCHERS` | `dispatchers` |
/// | `TASKGATE_MAX_RETRIES` | `max_retries` |
/// | `TASKGATE_POLL_INTERVAL_MS` | `poll_interval_ms` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("TASKGATE_DATABASE_PATH")
        && !v.trim().is_empty()
    {
        cfg.database_path = v;
    }
    if let Ok(v) = std::env::var("TASKGATE_DISPATCHERS")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.dispatchers = n;
    }
    if let Ok(v) = std::env::var("TASKGATE_MAX_RETRIES")
        && let Ok(n) = v.parse::<u32>()
    {
        cfg.max_retries = n;
    }
    if let Ok(v) = std::env::var("TASKGATE_POLL_INTERVAL_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.poll_interval_ms = ms;
    }
}

/// Save the config to disk, creating its directory if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Owner-only read/write (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
