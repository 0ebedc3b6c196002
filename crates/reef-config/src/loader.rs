// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration loader using Figment for layered config merging.
//!
//! Supports XDG hierarchy: `./reef.toml` > `~/.config/reef/reef.toml` > `/etc/reef/reef.toml`
//! with environment variable overrides via `REEF_` prefix.

#![allow(clippy::result_large_err)] // figment::Error is external and cannot be boxed without wrapper

use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use crate::model::ReefConfig;

/// System-wide configuration file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/reef/reef.toml";

/// Configuration file in the working directory.
pub const LOCAL_CONFIG_PATH: &str = "reef.toml";

/// `~/.config/reef/reef.toml`, if a config directory exists.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("reef/reef.toml"))
}

/// Load configuration from the standard XDG hierarchy with env var overrides.
///
/// Merge order (later overrides earlier):
/// 1. Compiled defaults
/// 2. `/etc/reef/reef.toml` (system-wide)
/// 3. `~/.config/reef/reef.toml` (user XDG config)
/// 4. `./reef.toml` (local directory)
/// 5. `REEF_*` environment variables
pub fn load_config() -> Result<ReefConfig, figment::Error> {
    build_figment().extract()
}

/// Load configuration from a TOML string only (no XDG lookup, no env).
///
/// Used for testing and explicit configuration.
pub fn load_config_from_str(toml_content: &str) -> Result<ReefConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(ReefConfig::default()))
        .merge(Toml::string(toml_content))
        .extract()
}

/// Load configuration from a specific file path with env var overrides.
pub fn load_config_from_path(path: &Path) -> Result<ReefConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(ReefConfig::default()))
        .merge(Toml::file(path))
        .merge(env_provider())
        .extract()
}

/// Build the Figment used internally for config loading.
///
/// Returns the Figment before extraction so callers can inspect metadata.
pub fn build_figment() -> Figment {
    Figment::new()
        .merge(Serialized::defaults(ReefConfig::default()))
        .merge(Toml::file(SYSTEM_CONFIG_PATH))
        .merge(Toml::file(user_config_path().unwrap_or_default()))
        .merge(Toml::file(LOCAL_CONFIG_PATH))
        .merge(env_provider())
}

/// Maps a lowercased, prefix-stripped env key onto its dotted config path.
///
/// Only the section separator is rewritten: `plugins_builtin_dir` becomes
/// `plugins.builtin_dir`, not `plugins.builtin.dir`.
pub fn map_env_key(key: &str) -> String {
    for section in ["host", "plugins", "channel", "sandbox"] {
        if let Some(rest) = key.strip_prefix(section).and_then(|r| r.strip_prefix('_')) {
            return format!("{section}.{rest}");
        }
    }
    key.to_string()
}

fn env_provider() -> Env {
    Env::prefixed("REEF_").map(|key| map_env_key(key.as_str()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_keys_split_only_on_section() {
        assert_eq!(map_env_key("plugins_builtin_dir"), "plugins.builtin_dir");
        assert_eq!(map_env_key("channel_call_timeout_ms"), "channel.call_timeout_ms");
        assert_eq!(map_env_key("host_log_level"), "host.log_level");
        assert_eq!(map_env_key("sandbox_fuel"), "sandbox.fuel");
        assert_eq!(map_env_key("unrelated"), "unrelated");
    }

    #[test]
    fn missing_file_path_yields_defaults() {
        let config = load_config_from_path(Path::new("/nonexistent/reef.toml")).unwrap();
        assert_eq!(config.host.name, "reef");
    }
}
