// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Registry entries and the read-only views handed out to callers.

use std::sync::Arc;

use reef_core::{ArtifactKind, PluginMetadata, PluginSource};
use reef_router::PermissionChecker;
use reef_transport::Transport;
use serde::Serialize;

/// Lifecycle position of a registered plugin.
///
/// Plugins that are still loading or already unloaded have no record, so
/// those states never appear in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Enabled,
    Disabled,
    /// The transport faulted; nothing is delivered until the plugin is unloaded.
    Faulted,
    Unloading,
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginState::Enabled => write!(f, "enabled"),
            PluginState::Disabled => write!(f, "disabled"),
            PluginState::Faulted => write!(f, "faulted"),
            PluginState::Unloading => write!(f, "unloading"),
        }
    }
}

/// One loaded plugin. Owned and mutated by the registry only.
pub(crate) struct PluginRecord {
    pub(crate) metadata: PluginMetadata,
    pub(crate) enabled: bool,
    pub(crate) loaded: bool,
    pub(crate) unloading: bool,
    pub(crate) source: PluginSource,
    pub(crate) artifact: String,
    pub(crate) storage_id: Option<String>,
    /// Set by a fatal transport fault.
    pub(crate) faulted: Option<String>,
    /// Most recent non-fatal handler error.
    pub(crate) last_error: Option<String>,
    pub(crate) grants: PermissionChecker,
    pub(crate) transport: Arc<Transport>,
}

impl PluginRecord {
    pub(crate) fn state(&self) -> PluginState {
        if self.unloading {
            PluginState::Unloading
        } else if self.faulted.is_some() {
            PluginState::Faulted
        } else if self.enabled {
            PluginState::Enabled
        } else {
            PluginState::Disabled
        }
    }

    /// True if events and calls may flow to and from this plugin.
    pub(crate) fn is_live(&self) -> bool {
        self.state() == PluginState::Enabled
    }

    pub(crate) fn info(&self) -> PluginInfo {
        PluginInfo {
            id: self.metadata.id.clone(),
            metadata: self.metadata.clone(),
            state: self.state(),
            enabled: self.enabled,
            loaded: self.loaded,
            source: self.source,
            kind: self.transport.kind(),
            artifact: self.artifact.clone(),
            storage_id: self.storage_id.clone(),
            faulted: self.faulted.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Snapshot of one plugin's registry entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub id: String,
    pub metadata: PluginMetadata,
    pub state: PluginState,
    pub enabled: bool,
    pub loaded: bool,
    pub source: PluginSource,
    pub kind: ArtifactKind,
    pub artifact: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub faulted: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
