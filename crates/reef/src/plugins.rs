// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `reef list`, `reef install`, `reef remove`, `reef enable`, and `reef disable`.
//!
//! A plugin is known by the id it reports at init, so these commands bring
//! the installed plugins up in a short-lived host, act through the registry,
//! and unload everything before returning.

use std::io::IsTerminal;
use std::path::Path;

use reef_config::ReefConfig;
use reef_core::{ArtifactKind, PluginId, PluginSource, ReefError, plugin_id_from_filename};
use reef_registry::{ConflictPolicy, PluginInfo, PluginState, Registry, accepted_extension};
use serde::Serialize;
use tracing::warn;

use crate::host::{Host, build_host, expand_path};

/// One row of `reef list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledPlugin {
    pub id: String,
    pub version: String,
    pub source: PluginSource,
    pub kind: ArtifactKind,
    pub file: String,
    pub state: PluginState,
}

impl From<PluginInfo> for InstalledPlugin {
    fn from(info: PluginInfo) -> Self {
        let file = Path::new(&info.artifact)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| info.artifact.clone());
        Self {
            id: info.id,
            version: info.metadata.version,
            source: info.source,
            kind: info.kind,
            file,
            state: info.state,
        }
    }
}

/// Everything `reef list` reports.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Inventory {
    pub plugins: Vec<InstalledPlugin>,
    /// `(id derived from the file name, reason)` for artifacts that did not load.
    pub failed: Vec<(PluginId, String)>,
}

/// Builds a host and loads the builtin directory and every upload, as `serve` does.
async fn load_installed(config: &ReefConfig) -> Result<(Host, Vec<(PluginId, String)>), ReefError> {
    let host = build_host(config).await?;
    let builtin = host
        .registry
        .load_builtin_dir(&expand_path(&config.plugins.builtin_dir))
        .await?;
    let uploaded = host.registry.restore_uploaded().await?;
    let mut failed = builtin.failed;
    failed.extend(uploaded.failed);
    Ok((host, failed))
}

/// Collects installed plugins under the ids they report.
pub async fn inventory(config: &ReefConfig) -> Result<Inventory, ReefError> {
    let (host, failed) = load_installed(config).await?;
    let plugins = host
        .registry
        .list()
        .await
        .into_iter()
        .map(InstalledPlugin::from)
        .collect();
    host.registry.unload_all().await;
    Ok(Inventory { plugins, failed })
}

/// Runs `reef list`.
pub async fn run_list(config: &ReefConfig, json: bool, plain: bool) -> Result<(), ReefError> {
    let inventory = inventory(config).await?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&inventory).unwrap_or_else(|_| "{}".to_string())
        );
        return Ok(());
    }

    let use_color = !plain && std::io::stdout().is_terminal();
    let paint = |text: String, state: Option<PluginState>| -> String {
        if !use_color {
            return text;
        }
        use colored::Colorize;
        match state {
            Some(PluginState::Enabled) => text.green().to_string(),
            Some(PluginState::Disabled | PluginState::Unloading) => text.yellow().to_string(),
            Some(PluginState::Faulted) | None => text.red().to_string(),
        }
    };

    println!();
    println!("  reef plugins");
    println!("  {}", "-".repeat(60));
    if inventory.plugins.is_empty() && inventory.failed.is_empty() {
        println!("    (none installed)");
    }
    for row in &inventory.plugins {
        println!(
            "    {:<24} {:<9} {:<9} {:<9} {}",
            row.id,
            row.version,
            row.source.to_string(),
            row.kind.to_string(),
            paint(row.state.to_string(), Some(row.state))
        );
    }
    for (id, reason) in &inventory.failed {
        println!("    {:<24} {}", id, paint(format!("failed: {reason}"), None));
    }
    println!();
    Ok(())
}

/// Runs `reef install <file>`.
///
/// Earlier uploads are restored first so a clash on the reported id is
/// detected the same way a running host detects it.
pub async fn run_install(config: &ReefConfig, file: &Path, replace: bool) -> Result<(), ReefError> {
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ReefError::Config(format!("not a file: {}", file.display())))?;
    if !accepted_extension(filename) {
        return Err(ReefError::Config(format!(
            "`{filename}` is not a plugin artifact (expected .{} or .wasm)",
            std::env::consts::DLL_EXTENSION
        )));
    }
    let bytes = tokio::fs::read(file).await.map_err(|e| ReefError::Storage {
        source: Box::new(e),
    })?;

    let host = build_host(config).await?;
    let registry = host.registry;
    for (id, reason) in registry.restore_uploaded().await?.failed {
        warn!(plugin = %id, error = %reason, "earlier upload did not load");
    }
    let policy = if replace {
        ConflictPolicy::Replace
    } else {
        ConflictPolicy::Reject
    };
    let result = registry.install_upload(filename, &bytes, policy).await;
    registry.unload_all().await;
    let metadata = result?;

    if metadata.id != plugin_id_from_filename(filename) {
        println!(
            "installed {} {} ({}) from {filename}",
            metadata.id, metadata.version, metadata.name
        );
    } else {
        println!("installed {} {} ({})", metadata.id, metadata.version, metadata.name);
    }
    Ok(())
}

/// Runs `reef remove <id>`.
pub async fn run_remove(config: &ReefConfig, id: &str) -> Result<(), ReefError> {
    let host = build_host(config).await?;
    let registry = host.registry;
    for (failed, reason) in registry.restore_uploaded().await?.failed {
        warn!(plugin = %failed, error = %reason, "upload did not load");
    }
    let result = registry.remove_upload(id).await;
    registry.unload_all().await;
    result?;
    println!("removed {id}");
    Ok(())
}

/// Toggles a builtin plugin and persists the flag. Returns whether it changed.
async fn toggle(registry: &Registry, id: &str, enabled: bool) -> Result<bool, ReefError> {
    let info = registry
        .get(id)
        .await
        .ok_or_else(|| ReefError::PluginNotFound(id.to_string()))?;
    if info.source != PluginSource::Builtin {
        return Err(ReefError::Config(format!(
            "`{id}` is an {} plugin; only builtin plugins keep an enabled flag",
            info.source
        )));
    }
    if enabled {
        registry.enable(id).await
    } else {
        registry.disable(id).await
    }
}

/// Runs `reef enable <id>` and `reef disable <id>`.
pub async fn run_set_enabled(
    config: &ReefConfig,
    id: &str,
    enabled: bool,
) -> Result<(), ReefError> {
    let (host, _) = load_installed(config).await?;
    let result = toggle(&host.registry, id, enabled).await;
    host.registry.unload_all().await;

    let word = if enabled { "enabled" } else { "disabled" };
    if result? {
        println!("{id} {word}");
    } else {
        println!("{id} was already {word}");
    }
    Ok(())
}
