// ABOUTME: Supervisor configuration for the default deadline, drain sizing, and environment inheritance
// ABOUTME: Builder methods, environment-variable parsing, and optional TOML file loading
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::env;
use std::num::ParseIntError;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::environment::EnvInheritance;
use crate::types::{Result, SupervisorError};

/// Default drain buffer size (8 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Default time the drain may keep reading after the child has exited (2 seconds)
const DEFAULT_DRAIN_GRACE_MS: u64 = 2_000;

/// Environment variable holding the default deadline in milliseconds
const ENV_TIMEOUT_MS: &str = "SHELLGUARD_TIMEOUT_MS";
/// Environment variable holding the drain buffer size in bytes
const ENV_CHUNK_SIZE: &str = "SHELLGUARD_CHUNK_SIZE";
/// Environment variable holding the post-exit drain grace in milliseconds
const ENV_DRAIN_GRACE_MS: &str = "SHELLGUARD_DRAIN_GRACE_MS";
/// Environment variable holding a comma-separated inheritance allow-list
const ENV_ALLOWLIST: &str = "SHELLGUARD_ENV_ALLOWLIST";

/// Configuration shared by every invocation of one supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Deadline applied when a request does not carry its own (zero = unlimited)
    #[serde(with = "millis")]
    pub default_timeout: Duration,
    /// Size of each read from the child's output
    pub chunk_size: usize,
    /// How long draining may continue once the child has exited
    #[serde(with = "millis")]
    pub drain_grace: Duration,
    /// Which part of the host environment the child inherits
    pub inherit: EnvInheritance,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::ZERO,
            chunk_size: DEFAULT_CHUNK_SIZE,
            drain_grace: Duration::from_millis(DEFAULT_DRAIN_GRACE_MS),
            inherit: EnvInheritance::All,
        }
    }
}

impl SupervisorConfig {
    /// Set the default deadline
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the drain buffer size (clamped to at least one byte)
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Set the post-exit drain grace period
    #[must_use]
    pub const fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Set the environment inheritance policy
    #[must_use]
    pub fn with_inherit(mut self, inherit: EnvInheritance) -> Self {
        self.inherit = inherit;
        self
    }

    /// Build a configuration from `SHELLGUARD_*` environment variables
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply `SHELLGUARD_*` environment variables on top of this configuration
    ///
    /// Unset variables leave the current values alone, so a file-based
    /// configuration can be adjusted per invocation.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if a variable is set but cannot be parsed.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(val) = lookup(ENV_TIMEOUT_MS) {
            self.default_timeout = parse_millis(&val).map_err(|e| {
                SupervisorError::config(format!("{ENV_TIMEOUT_MS} is not a valid u64: {e}"))
            })?;
        }

        if let Some(val) = lookup(ENV_CHUNK_SIZE) {
            let size = val.trim().parse::<usize>().map_err(|e| {
                SupervisorError::config(format!("{ENV_CHUNK_SIZE} is not a valid usize: {e}"))
            })?;
            self = self.with_chunk_size(size);
        }

        if let Some(val) = lookup(ENV_DRAIN_GRACE_MS) {
            self.drain_grace = parse_millis(&val).map_err(|e| {
                SupervisorError::config(format!("{ENV_DRAIN_GRACE_MS} is not a valid u64: {e}"))
            })?;
        }

        if let Some(val) = lookup(ENV_ALLOWLIST) {
            self.inherit = EnvInheritance::AllowList(parse_env_keys(&val));
        }

        Ok(self)
    }

    /// Load a configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if the file cannot be read or parsed.
    #[cfg(feature = "config-file")]
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SupervisorError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        toml::from_str(&text)
            .map_err(|e| SupervisorError::config(format!("invalid {}: {e}", path.display())))
    }
}

/// Default location of the configuration file (`<config dir>/shellguard/config.toml`)
#[cfg(feature = "config-file")]
#[must_use]
pub fn default_config_path() -> Option<std::path::PathBuf> {
    dirs::config_dir().map(|dir| dir.join("shellguard").join("config.toml"))
}

/// Parse a comma-separated list of environment variable keys
#[must_use]
pub fn parse_env_keys(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Parse a duration given in milliseconds
///
/// # Errors
///
/// Returns an error if the string cannot be parsed as a `u64`.
pub fn parse_millis(input: &str) -> std::result::Result<Duration, ParseIntError> {
    input.trim().parse::<u64>().map(Duration::from_millis)
}

/// Serde adapter storing durations as integer milliseconds
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_unlimited() {
        let config = SupervisorConfig::default();
        assert_eq!(config.default_timeout, Duration::ZERO);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.inherit, EnvInheritance::All);
    }

    #[test]
    fn test_env_overrides_layer_over_existing_values() {
        let from_file = SupervisorConfig::default()
            .with_default_timeout(Duration::from_secs(30))
            .with_drain_grace(Duration::from_millis(100));

        let config = from_file
            .with_overrides_from(|key| (key == ENV_TIMEOUT_MS).then(|| "250".to_owned()))
            .unwrap();

        assert_eq!(config.default_timeout, Duration::from_millis(250));
        assert_eq!(config.drain_grace, Duration::from_millis(100));
    }

    #[test]
    fn test_env_override_parse_error_names_variable() {
        let err = SupervisorConfig::default()
            .with_overrides_from(|key| (key == ENV_CHUNK_SIZE).then(|| "lots".to_owned()))
            .unwrap_err();
        assert!(err.message.contains(ENV_CHUNK_SIZE));
    }

    #[test]
    fn test_chunk_size_is_never_zero() {
        let config = SupervisorConfig::default().with_chunk_size(0);
        assert_eq!(config.chunk_size, 1);
    }

    #[test]
    fn test_parse_env_keys_trims_and_skips_empty() {
        assert_eq!(
            parse_env_keys(" PATH, HOME ,,LANG"),
            vec!["PATH", "HOME", "LANG"]
        );
        assert!(parse_env_keys("").is_empty());
    }

    #[test]
    fn test_parse_millis() {
        assert_eq!(parse_millis(" 250 ").unwrap(), Duration::from_millis(250));
        assert!(parse_millis("soon").is_err());
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn test_load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "default_timeout = 1500\nchunk_size = 512\n\n[inherit]\nallow_list = [\"PATH\"]\n",
        )
        .unwrap();

        let config = SupervisorConfig::load(&path).unwrap();
        assert_eq!(config.default_timeout, Duration::from_millis(1500));
        assert_eq!(config.chunk_size, 512);
        assert_eq!(config.drain_grace, Duration::from_millis(DEFAULT_DRAIN_GRACE_MS));
        assert_eq!(
            config.inherit,
            EnvInheritance::AllowList(vec!["PATH".to_owned()])
        );
    }
}
