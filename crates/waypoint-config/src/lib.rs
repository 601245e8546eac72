//! Configuration file handling for the bundle engine.
//!
//! This crate provides configuration loading from `.waypoint.toml` files
//! with support for merging with CLI arguments and defaults. It covers the
//! ambient engine settings that sit outside the data model proper: where
//! persisted state lives, how long the exclusion lock and elevation RPC
//! channel wait before giving up, and how cache-acquire retries are tuned.
//!
//! # Example
//!
//! ```
//! use waypoint_config::{EngineConfig, load_config};
//! use std::path::Path;
//!
//! // Load config from a directory (looks for .waypoint.toml)
//! let config = load_config(Path::new(".")).expect("load config");
//!
//! println!("lock wait: {:?}", config.lock_wait_timeout());
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default configuration file name
pub const CONFIG_FILE: &str = ".waypoint.toml";

/// Get the config file path for a directory
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Where persisted engine state (registration, resume, lock, events) lives.
    #[serde(default)]
    pub state: StateConfig,
    /// Where acquired payloads are cached.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Exclusion lock tuning.
    #[serde(default)]
    pub lock: LockConfig,
    /// Elevation RPC channel tuning.
    #[serde(default)]
    pub elevation: ElevationConfig,
    /// Cache-acquire retry tuning (feeds `waypoint-retry`).
    #[serde(default)]
    pub retry: RetryConfig,
}

impl EngineConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Root directory for per-machine persisted state, if overridden.
    pub fn machine_state_root(&self) -> Option<&Path> {
        self.state.machine_root.as_deref()
    }

    /// Root directory for per-user persisted state, if overridden.
    pub fn user_state_root(&self) -> Option<&Path> {
        self.state.user_root.as_deref()
    }

    /// Root directory for the content-addressed payload cache, if overridden.
    pub fn cache_root(&self) -> Option<&Path> {
        self.cache.root.as_deref()
    }

    /// Maximum bytes the cache may hold before the Cache Manager evicts
    /// unreferenced payloads; `None` means unbounded.
    pub fn cache_size_limit_bytes(&self) -> Option<u64> {
        self.cache.size_limit_bytes
    }

    /// How long to wait to acquire the named exclusion lock before failing
    /// with `bundle-already-applying`.
    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.lock.wait_timeout_secs)
    }

    /// How long the elevated helper has to respond to an RPC request before
    /// the unprivileged parent treats the channel as dead.
    pub fn elevation_rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.elevation.rpc_timeout_secs)
    }

    /// How long to wait for the elevated helper process to launch and
    /// complete its handshake.
    pub fn elevation_launch_timeout(&self) -> Duration {
        Duration::from_secs(self.elevation.launch_timeout_secs)
    }

    /// Maximum retry attempts for a cache-acquire download.
    pub fn max_retries(&self) -> u32 {
        self.retry.max_attempts
    }

    /// Initial retry delay for a cache-acquire download.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry.initial_delay_ms)
    }

    /// Maximum retry delay for a cache-acquire download.
    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry.max_delay_ms)
    }

    /// Backoff multiplier for a cache-acquire download.
    pub fn retry_multiplier(&self) -> f64 {
        self.retry.multiplier
    }

    /// Merge this config with another (`other` takes precedence field by
    /// field; a field left at its default in `other` falls back to `self`).
    pub fn merge(&self, other: &EngineConfig) -> EngineConfig {
        EngineConfig {
            state: StateConfig {
                machine_root: other.state.machine_root.clone().or_else(|| self.state.machine_root.clone()),
                user_root: other.state.user_root.clone().or_else(|| self.state.user_root.clone()),
            },
            cache: CacheConfig {
                root: other.cache.root.clone().or_else(|| self.cache.root.clone()),
                size_limit_bytes: other.cache.size_limit_bytes.or(self.cache.size_limit_bytes),
            },
            lock: LockConfig {
                wait_timeout_secs: if other.lock.wait_timeout_secs != default_lock_wait() {
                    other.lock.wait_timeout_secs
                } else {
                    self.lock.wait_timeout_secs
                },
            },
            elevation: ElevationConfig {
                rpc_timeout_secs: if other.elevation.rpc_timeout_secs != default_rpc_timeout() {
                    other.elevation.rpc_timeout_secs
                } else {
                    self.elevation.rpc_timeout_secs
                },
                launch_timeout_secs: if other.elevation.launch_timeout_secs != default_launch_timeout() {
                    other.elevation.launch_timeout_secs
                } else {
                    self.elevation.launch_timeout_secs
                },
            },
            retry: RetryConfig {
                max_attempts: if other.retry.max_attempts != default_max_attempts() {
                    other.retry.max_attempts
                } else {
                    self.retry.max_attempts
                },
                initial_delay_ms: if other.retry.initial_delay_ms != default_initial_delay() {
                    other.retry.initial_delay_ms
                } else {
                    self.retry.initial_delay_ms
                },
                max_delay_ms: if other.retry.max_delay_ms != default_max_delay() {
                    other.retry.max_delay_ms
                } else {
                    self.retry.max_delay_ms
                },
                multiplier: if other.retry.multiplier != default_multiplier() {
                    other.retry.multiplier
                } else {
                    self.retry.multiplier
                },
            },
        }
    }
}

/// Where persisted engine state lives, overriding the platform default
/// (`$XDG_STATE_HOME/waypoint` per-user, `/var/lib/waypoint` per-machine).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_root: Option<PathBuf>,
}

/// Where the Cache Manager stores acquired payloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_limit_bytes: Option<u64>,
}

/// Exclusion lock tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_wait")]
    pub wait_timeout_secs: u64,
}

fn default_lock_wait() -> u64 {
    30
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { wait_timeout_secs: default_lock_wait() }
    }
}

/// Elevation RPC channel tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElevationConfig {
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_secs: u64,
}

fn default_rpc_timeout() -> u64 {
    120
}

fn default_launch_timeout() -> u64 {
    30
}

impl Default for ElevationConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_secs: default_rpc_timeout(),
            launch_timeout_secs: default_launch_timeout(),
        }
    }
}

/// Cache-acquire retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1_000
}
fn default_max_delay() -> u64 {
    60_000
}
fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

/// Load configuration from a directory.
pub fn load_config(dir: &Path) -> Result<EngineConfig> {
    let path = config_path(dir);
    if !path.exists() {
        return Ok(EngineConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let config: EngineConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Load configuration from a specific file path.
pub fn load_config_from_file(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let config: EngineConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Save configuration to a file.
pub fn save_config(dir: &Path, config: &EngineConfig) -> Result<()> {
    let path = config_path(dir);

    let content = toml::to_string_pretty(config).context("failed to serialize config to TOML")?;

    std::fs::write(&path, content)
        .with_context(|| format!("failed to write config file: {}", path.display()))?;

    Ok(())
}

/// Find a configuration file by walking up the directory tree.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir;

    loop {
        let config_file = current.join(CONFIG_FILE);
        if config_file.exists() {
            return Some(config_file);
        }

        match current.parent() {
            Some(parent) => current = parent,
            None => return None,
        }
    }
}
