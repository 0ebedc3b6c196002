// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration model structs for the Reef plugin host.
//!
//! All structs use `#[serde(deny_unknown_fields)]` to reject unrecognized
//! config keys at startup, providing actionable error messages.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level Reef configuration.
///
/// Loaded from TOML files following XDG hierarchy, with environment variable overrides.
/// All sections are optional and default to sensible values.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReefConfig {
    /// Host identity and logging.
    #[serde(default)]
    pub host: HostConfig,

    /// Plugin discovery, persistence, and lifecycle bounds.
    #[serde(default)]
    pub plugins: PluginsConfig,

    /// Synchronous shared-memory channel sizing.
    #[serde(default)]
    pub channel: ChannelConfig,

    /// WebAssembly sandbox limits.
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

/// Host identity configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// Display name of this host instance.
    #[serde(default = "default_host_name")]
    pub name: String,

    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            name: default_host_name(),
            log_level: default_log_level(),
        }
    }
}

fn default_host_name() -> String {
    "reef".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Plugin discovery and lifecycle configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PluginsConfig {
    /// Directory scanned for builtin plugin artifacts at startup.
    #[serde(default = "default_builtin_dir")]
    pub builtin_dir: String,

    /// Directory backing the blob store for uploaded plugins.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,

    /// SQLite database holding persisted enabled flags.
    #[serde(default = "default_state_db")]
    pub state_db: String,

    /// Upper bound for a transport's load, activate, and deactivate calls.
    #[serde(default = "default_lifecycle_timeout_ms")]
    pub lifecycle_timeout_ms: u64,

    /// Grace period for deactivate and destroy during unload.
    #[serde(default = "default_unload_grace_ms")]
    pub unload_grace_ms: u64,

    /// Permissions plugins may be granted. A plugin requesting anything
    /// outside this set fails to load.
    #[serde(default = "default_grantable")]
    pub grantable: Vec<String>,

    /// Enabled flag overrides for builtin plugins, keyed by plugin id.
    /// Applied when no persisted flag exists yet.
    #[serde(default)]
    pub builtin: BTreeMap<String, bool>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            builtin_dir: default_builtin_dir(),
            upload_dir: default_upload_dir(),
            state_db: default_state_db(),
            lifecycle_timeout_ms: default_lifecycle_timeout_ms(),
            unload_grace_ms: default_unload_grace_ms(),
            grantable: default_grantable(),
            builtin: BTreeMap::new(),
        }
    }
}

impl PluginsConfig {
    pub fn lifecycle_timeout(&self) -> Duration {
        Duration::from_millis(self.lifecycle_timeout_ms)
    }

    pub fn unload_grace(&self) -> Duration {
        Duration::from_millis(self.unload_grace_ms)
    }
}

fn reef_data_path(leaf: &str) -> String {
    dirs::data_dir()
        .map(|p| p.join("reef").join(leaf))
        .unwrap_or_else(|| std::path::PathBuf::from(leaf))
        .to_string_lossy()
        .into_owned()
}

fn default_builtin_dir() -> String {
    "plugins".to_string()
}

fn default_upload_dir() -> String {
    reef_data_path("uploads")
}

fn default_state_db() -> String {
    reef_data_path("reef.db")
}

fn default_lifecycle_timeout_ms() -> u64 {
    10_000
}

fn default_unload_grace_ms() -> u64 {
    2_000
}

fn default_grantable() -> Vec<String> {
    vec![
        "AllServicesAccess".to_string(),
        "EventSubscribeAll".to_string(),
        "PluginCommunication".to_string(),
    ]
}

/// Shared-memory channel configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    /// Total segment size in bytes, header included.
    #[serde(default = "default_segment_bytes")]
    pub segment_bytes: usize,

    /// Largest slice copied into the ring per step.
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,

    /// Bound on every wait inside a synchronous call.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            segment_bytes: default_segment_bytes(),
            chunk_bytes: default_chunk_bytes(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl ChannelConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

fn default_segment_bytes() -> usize {
    65_536 + 32
}

fn default_chunk_bytes() -> usize {
    16_384
}

fn default_call_timeout_ms() -> u64 {
    5_000
}

/// WebAssembly sandbox configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    /// Fuel granted to each guest entry point call.
    #[serde(default = "default_fuel")]
    pub fuel: u64,

    /// Maximum linear memory per instance, in megabytes.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,

    /// Wall-clock limit per guest entry point call.
    #[serde(default = "default_epoch_timeout_secs")]
    pub epoch_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            fuel: default_fuel(),
            memory_mb: default_memory_mb(),
            epoch_timeout_secs: default_epoch_timeout_secs(),
        }
    }
}

fn default_fuel() -> u64 {
    1_000_000_000
}

fn default_memory_mb() -> u32 {
    64
}

fn default_epoch_timeout_secs() -> u64 {
    5
}
