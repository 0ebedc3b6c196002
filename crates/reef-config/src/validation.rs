// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Post-deserialization validation for configuration values.
//!
//! Validates semantic constraints that cannot be expressed via serde attributes,
//! such as known log levels, parseable permissions, and channel geometry.

use reef_core::Permission;

use crate::diagnostic::ConfigError;
use crate::model::ReefConfig;

/// Channel header size; a segment must fit it plus two data bytes.
const CHANNEL_HEADER_BYTES: usize = 32;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Validate a deserialized configuration for semantic correctness.
///
/// Returns `Ok(())` if all validations pass, or `Err(Vec<ConfigError>)` with
/// all collected validation errors (does not fail fast).
pub fn validate_config(config: &ReefConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();
    let mut fail = |message: String| errors.push(ConfigError::Validation { message });

    if config.host.name.trim().is_empty() {
        fail("host.name must not be empty".to_string());
    }

    if !LOG_LEVELS.contains(&config.host.log_level.as_str()) {
        fail(format!(
            "host.log_level `{}` is not one of {}",
            config.host.log_level,
            LOG_LEVELS.join(", ")
        ));
    }

    let plugins = &config.plugins;
    if plugins.upload_dir.trim().is_empty() {
        fail("plugins.upload_dir must not be empty".to_string());
    }
    if plugins.state_db.trim().is_empty() {
        fail("plugins.state_db must not be empty".to_string());
    }
    if plugins.lifecycle_timeout_ms == 0 {
        fail("plugins.lifecycle_timeout_ms must be greater than 0".to_string());
    }
    if plugins.unload_grace_ms == 0 {
        fail("plugins.unload_grace_ms must be greater than 0".to_string());
    }
    for entry in &plugins.grantable {
        if let Err(e) = entry.parse::<Permission>() {
            fail(format!("plugins.grantable: {e}"));
        }
    }

    let channel = &config.channel;
    if channel.segment_bytes < CHANNEL_HEADER_BYTES + 2 {
        fail(format!(
            "channel.segment_bytes must be at least {}, got {}",
            CHANNEL_HEADER_BYTES + 2,
            channel.segment_bytes
        ));
    }
    if channel.chunk_bytes == 0 {
        fail("channel.chunk_bytes must be greater than 0".to_string());
    }
    if channel.call_timeout_ms == 0 {
        fail("channel.call_timeout_ms must be greater than 0".to_string());
    }

    if config.sandbox.fuel == 0 {
        fail("sandbox.fuel must be greater than 0".to_string());
    }
    if config.sandbox.memory_mb == 0 {
        fail("sandbox.memory_mb must be greater than 0".to_string());
    }
    if config.sandbox.epoch_timeout_secs == 0 {
        fail("sandbox.epoch_timeout_secs must be greater than 0".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Parses `plugins.grantable` into permissions, skipping invalid entries.
///
/// Invalid entries are reported by [`validate_config`].
pub fn grantable_permissions(config: &ReefConfig) -> Vec<Permission> {
    config
        .plugins
        .grantable
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect()
}
