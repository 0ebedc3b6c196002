// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common types shared by the registry, router, and transports.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::permission::Permission;

/// Stable plugin identifier, unique across the registry.
pub type PluginId = String;

/// Prefix of artifact references that name an in-process plugin factory.
pub const EMBEDDED_PREFIX: &str = "embedded:";

/// Where a plugin came from. Drives reload and persistence policy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PluginSource {
    /// Shipped with the host, found in the builtin directory.
    Builtin,
    /// Installed by the user into the blob store.
    Uploaded,
    /// Loaded programmatically by an embedding application.
    External,
}

/// Execution model of a plugin artifact.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Dynamic library with the C plugin ABI.
    Native,
    /// WebAssembly module run in the sandbox.
    Wasm,
    /// In-process Rust plugin created by a registered factory.
    Embedded,
}

impl ArtifactKind {
    /// Picks the adapter kind from an artifact reference.
    ///
    /// `embedded:<name>` selects an embedded factory; otherwise the file
    /// extension decides. Returns `None` for anything unrecognized.
    pub fn detect(artifact: &str) -> Option<Self> {
        if artifact.starts_with(EMBEDDED_PREFIX) {
            return Some(ArtifactKind::Embedded);
        }
        let ext = Path::new(artifact)
            .extension()
            .and_then(|e| e.to_str())?
            .to_ascii_lowercase();
        match ext.as_str() {
            "so" | "dylib" | "dll" => Some(ArtifactKind::Native),
            "wasm" => Some(ArtifactKind::Wasm),
            _ => None,
        }
    }
}

/// Derives a plugin id from an artifact filename.
///
/// `libdummy_ocr_plugin.so` becomes `dummy-ocr-plugin`.
pub fn plugin_id_from_filename(filename: &str) -> PluginId {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    let stem = stem.strip_prefix("lib").unwrap_or(stem);
    stem.replace('_', "-")
}

/// Self-description a plugin returns from its init handshake.
///
/// Immutable once the plugin is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadata {
    pub id: PluginId,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    /// Event tags this plugin wants; `*` subscribes to every event.
    #[serde(default)]
    pub subscribed_events: BTreeSet<String>,
    #[serde(default)]
    pub required_permissions: BTreeSet<Permission>,
}

impl PluginMetadata {
    /// Minimal metadata with no subscriptions or permissions.
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: String::new(),
            subscribed_events: BTreeSet::new(),
            required_permissions: BTreeSet::new(),
        }
    }

    /// Checks the fields the host relies on. Returns a human-readable reason.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("metadata id is empty".into());
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(format!("metadata id `{}` contains invalid characters", self.id));
        }
        if self.name.trim().is_empty() {
            return Err("metadata name is empty".into());
        }
        semver::Version::parse(&self.version)
            .map_err(|e| format!("metadata version `{}` is not semver: {e}", self.version))?;
        Ok(())
    }

    /// True if this plugin asked for the given event tag, directly or via `*`.
    pub fn subscribes_to(&self, tag: &str) -> bool {
        self.subscribed_events.contains("*") || self.subscribed_events.contains(tag)
    }
}

/// Fault raised by a transport while the plugin is running.
///
/// A fatal fault means the execution context is gone or untrustworthy (the
/// worker died, the guest trapped); the plugin stays registered but receives
/// nothing further until it is unloaded. Non-fatal faults are handler errors
/// the plugin reported for a single event or message.
///
/// `generation` identifies the transport instance that raised the fault, so a
/// fault queued by an unloaded plugin never lands on a later load of the
/// same id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFault {
    pub plugin_id: PluginId,
    pub generation: u64,
    pub message: String,
    pub fatal: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_artifact_kinds() {
        assert_eq!(ArtifactKind::detect("plugins/libocr.so"), Some(ArtifactKind::Native));
        assert_eq!(ArtifactKind::detect("ocr.DLL"), Some(ArtifactKind::Native));
        assert_eq!(ArtifactKind::detect("libocr.dylib"), Some(ArtifactKind::Native));
        assert_eq!(ArtifactKind::detect("ocr.wasm"), Some(ArtifactKind::Wasm));
        assert_eq!(
            ArtifactKind::detect("embedded:recorder"),
            Some(ArtifactKind::Embedded)
        );
        assert_eq!(ArtifactKind::detect("notes.txt"), None);
        assert_eq!(ArtifactKind::detect("noext"), None);
    }

    #[test]
    fn derives_plugin_id_from_library_filename() {
        assert_eq!(plugin_id_from_filename("libdummy_ocr_plugin.so"), "dummy-ocr-plugin");
        assert_eq!(plugin_id_from_filename("exporter.wasm"), "exporter");
        assert_eq!(plugin_id_from_filename("my_tool.dll"), "my-tool");
    }

    #[test]
    fn source_round_trips_lowercase() {
        assert_eq!(PluginSource::Uploaded.to_string(), "uploaded");
        assert_eq!("builtin".parse::<PluginSource>().unwrap(), PluginSource::Builtin);
        let json = serde_json::to_string(&PluginSource::External).unwrap();
        assert_eq!(json, "\"external\"");
    }

    #[test]
    fn metadata_deserializes_camel_case_with_defaults() {
        let meta: PluginMetadata = serde_json::from_str(
            r#"{
                "id": "ocr",
                "name": "OCR",
                "version": "1.2.0",
                "subscribedEvents": ["ItemCreated"],
                "requiredPermissions": ["ServiceAccess:markers:*"]
            }"#,
        )
        .unwrap();
        assert!(meta.subscribes_to("ItemCreated"));
        assert!(!meta.subscribes_to("ItemDeleted"));
        assert_eq!(meta.required_permissions.len(), 1);
        assert!(meta.description.is_empty());
        assert!(meta.validate().is_ok());
    }

    #[test]
    fn metadata_with_unknown_permission_fails_to_parse() {
        let result: Result<PluginMetadata, _> = serde_json::from_str(
            r#"{"id": "x", "name": "X", "version": "1.0.0", "requiredPermissions": ["Root"]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn validate_rejects_bad_fields() {
        assert!(PluginMetadata::new("", "x", "1.0.0").validate().is_err());
        assert!(PluginMetadata::new("a b", "x", "1.0.0").validate().is_err());
        assert!(PluginMetadata::new("a", " ", "1.0.0").validate().is_err());
        assert!(PluginMetadata::new("a", "x", "one").validate().is_err());
    }

    #[test]
    fn wildcard_subscription_matches_everything() {
        let mut meta = PluginMetadata::new("a", "A", "0.1.0");
        meta.subscribed_events.insert("*".into());
        assert!(meta.subscribes_to("SystemReady"));
        assert!(meta.subscribes_to("my.custom"));
    }
}
