// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events delivered to plugins, and the host-internal events they are built from.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event shape plugins observe.
///
/// Serialized as `{"type": "<Tag>", ...fields}` with string ids and an
/// optional snapshot of the affected object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum CoreEvent {
    ProjectOpened {
        project_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project: Option<Value>,
    },
    ProjectClosed {
        project_id: String,
    },
    ItemSelected {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item: Option<Value>,
    },
    ItemDeselected {
        id: String,
    },
    ItemCreated {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item: Option<Value>,
    },
    ItemUpdated {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item: Option<Value>,
    },
    ItemDeleted {
        id: String,
    },
    ImageSelected {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<Value>,
    },
    ImageDeselected {
        id: String,
    },
    SystemReady,
    SystemShutdown,
    /// Catch-all for host or plugin defined events. Subscribed to by `event_type`.
    Custom {
        event_type: String,
        #[serde(default)]
        data: Value,
    },
}

impl CoreEvent {
    /// Tag used for subscription matching.
    ///
    /// For `Custom` events this is the custom `event_type`, not `"Custom"`.
    pub fn tag(&self) -> &str {
        match self {
            CoreEvent::ProjectOpened { .. } => "ProjectOpened",
            CoreEvent::ProjectClosed { .. } => "ProjectClosed",
            CoreEvent::ItemSelected { .. } => "ItemSelected",
            CoreEvent::ItemDeselected { .. } => "ItemDeselected",
            CoreEvent::ItemCreated { .. } => "ItemCreated",
            CoreEvent::ItemUpdated { .. } => "ItemUpdated",
            CoreEvent::ItemDeleted { .. } => "ItemDeleted",
            CoreEvent::ImageSelected { .. } => "ImageSelected",
            CoreEvent::ImageDeselected { .. } => "ImageDeselected",
            CoreEvent::SystemReady => "SystemReady",
            CoreEvent::SystemShutdown => "SystemShutdown",
            CoreEvent::Custom { event_type, .. } => event_type,
        }
    }

    /// Wire JSON for this event.
    pub fn to_json(&self) -> String {
        // Every field is a String or a serde_json::Value, so this cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Host-internal event, expressed with numeric handles.
///
/// Plugins never observe this type; the dispatcher converts it to
/// [`CoreEvent`]s before fan-out.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    ProjectOpened(u32, Option<Value>),
    ProjectClosed(u32),
    SelectionChanged {
        previous: Option<u32>,
        current: Option<u32>,
        snapshot: Option<Value>,
    },
    MarkerCreated(u32, Option<Value>),
    MarkerUpdated(u32, Option<Value>),
    MarkerDeleted(u32),
    ImageSelectionChanged {
        previous: Option<u32>,
        current: Option<u32>,
        snapshot: Option<Value>,
    },
    Ready,
    ShuttingDown,
    Custom {
        event_type: String,
        data: Value,
    },
}
