// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Scheduler configuration, typically loaded from a YAML file.

use std::path::Path;

use serde::Deserialize;

use crate::errors::ConfigError;

/// Runtime knobs of a scheduler instance.
///
/// All fields default sensibly, so an empty file (or no file at all) yields
/// a working local configuration.
///
/// # Example
/// ```yaml
/// host: 192.168.1.10
/// port: 8786
/// delete_interval_ms: 500
/// resource_interval_ms: 1000
/// resource_log_size: 1000
/// rpc_timeout_ms: 5000
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Identity the scheduler advertises to collaborators
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Cadence of the bulk delete broadcast to workers
    #[serde(default = "default_delete_interval_ms")]
    pub delete_interval_ms: u64,
    /// Cadence requested from nanny resource monitors
    #[serde(default = "default_resource_interval_ms")]
    pub resource_interval_ms: u64,
    /// Samples retained per nanny
    #[serde(default = "default_resource_log_size")]
    pub resource_log_size: usize,
    /// Bound on registry/nanny calls during restart
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8786
}

fn default_delete_interval_ms() -> u64 {
    500
}

fn default_resource_interval_ms() -> u64 {
    1000
}

fn default_resource_log_size() -> usize {
    1000
}

fn default_rpc_timeout_ms() -> u64 {
    5000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            delete_interval_ms: default_delete_interval_ms(),
            resource_interval_ms: default_resource_interval_ms(),
            resource_log_size: default_resource_log_size(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

/// Load a configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<SchedulerConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let config: SchedulerConfig =
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject configurations that cannot work at runtime.
pub fn validate_config(config: &SchedulerConfig) -> Result<(), ConfigError> {
    if config.host.trim().is_empty() {
        return Err(ConfigError::Invalid("host must not be empty".into()));
    }
    if config.delete_interval_ms == 0 {
        return Err(ConfigError::Invalid(
            "delete_interval_ms must be positive".into(),
        ));
    }
    if config.resource_interval_ms == 0 {
        return Err(ConfigError::Invalid(
            "resource_interval_ms must be positive".into(),
        ));
    }
    if config.resource_log_size == 0 {
        return Err(ConfigError::Invalid(
            "resource_log_size must be positive".into(),
        ));
    }
    Ok(())
}
