//! Engine configuration.
//!
//! Defaults come from the platform's data and cache directories. `Config::from_env`
//! layers `KILN_*` environment variables on top; the CLI applies its flags last.

use std::path::PathBuf;

use thiserror::Error;

use crate::build::BuildConfig;
use crate::consts::APP_NAME;
use crate::fetch::FetchConfig;

pub const ENV_PREFIX: &str = "KILN_PREFIX";
pub const ENV_CACHE_DIR: &str = "KILN_CACHE_DIR";
pub const ENV_JOBS: &str = "KILN_JOBS";
pub const ENV_KEEP_GOING: &str = "KILN_KEEP_GOING";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("invalid value '{value}' for {var}: {reason}")]
  InvalidValue {
    var: &'static str,
    value: String,
    reason: &'static str,
  },
}

/// Settings for an orchestrated run.
#[derive(Debug, Clone)]
pub struct Config {
  pub install_prefix: PathBuf,
  pub cache_dir: PathBuf,
  /// Maximum number of recipes fetched or built at once.
  ///
  /// Builds whose artifact paths overlap still run one at a time. Recipes
  /// that keep the default `embedded` artifact path all overlap, so only
  /// recipes with their own `artifact_path` build in parallel.
  pub parallelism: usize,
  /// Keep building independent branches after a failure.
  pub keep_going: bool,
  pub fetch: FetchConfig,
  pub build: BuildConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      install_prefix: data_dir().join("install"),
      cache_dir: cache_dir(),
      parallelism: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
      keep_going: false,
      fetch: FetchConfig::default(),
      build: BuildConfig::default(),
    }
  }
}

impl Config {
  /// Defaults overridden by `KILN_PREFIX`, `KILN_CACHE_DIR`, `KILN_JOBS` and `KILN_KEEP_GOING`.
  pub fn from_env() -> Result<Self, ConfigError> {
    let mut config = Self::default();

    if let Some(prefix) = env_var(ENV_PREFIX) {
      config.install_prefix = PathBuf::from(prefix);
    }
    if let Some(cache) = env_var(ENV_CACHE_DIR) {
      config.cache_dir = PathBuf::from(cache);
    }
    if let Some(jobs) = env_var(ENV_JOBS) {
      config.parallelism = match jobs.parse::<usize>() {
        Ok(n) if n > 0 => n,
        _ => {
          return Err(ConfigError::InvalidValue {
            var: ENV_JOBS,
            value: jobs,
            reason: "expected a positive integer",
          });
        }
      };
    }
    if let Some(keep_going) = env_var(ENV_KEEP_GOING) {
      config.keep_going = parse_bool(&keep_going).ok_or(ConfigError::InvalidValue {
        var: ENV_KEEP_GOING,
        value: keep_going.clone(),
        reason: "expected true or false",
      })?;
    }

    Ok(config)
  }
}

fn env_var(name: &str) -> Option<String> {
  std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
  match value.trim().to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Some(true),
    "0" | "false" | "no" | "off" => Some(false),
    _ => None,
  }
}

/// Returns the user's home directory, or the current directory if unknown.
#[cfg(not(windows))]
fn home_dir() -> PathBuf {
  std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."))
}

/// Returns the directory for data files for the application
#[cfg(not(windows))]
pub fn data_dir() -> PathBuf {
  let data_home = std::env::var("XDG_DATA_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".local").join("share"));
  data_home.join(APP_NAME)
}

/// Returns the directory for data files for the application
#[cfg(windows)]
pub fn data_dir() -> PathBuf {
  local_appdata().join(APP_NAME)
}

/// Returns the directory for cache files for the application
#[cfg(not(windows))]
pub fn cache_dir() -> PathBuf {
  let cache_home = std::env::var("XDG_CACHE_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".cache"));
  cache_home.join(APP_NAME)
}

/// Returns the directory for cache files for the application
#[cfg(windows)]
pub fn cache_dir() -> PathBuf {
  local_appdata().join(APP_NAME).join("Cache")
}

#[cfg(windows)]
fn local_appdata() -> PathBuf {
  std::env::var("LOCALAPPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(|_| PathBuf::from("."))
}
