// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Conversion of host domain events into the events plugins observe.

use reef_core::{CoreEvent, DomainEvent, PluginId};
use serde::Serialize;

/// Converts one domain event into the plugin-facing events it implies.
///
/// Numeric handles become strings. A selection change becomes a deselect of
/// the previous handle followed by a select of the current one, and either
/// half is omitted when absent or unchanged.
pub fn convert(event: DomainEvent) -> Vec<CoreEvent> {
    match event {
        DomainEvent::ProjectOpened(id, project) => vec![CoreEvent::ProjectOpened {
            project_id: id.to_string(),
            project,
        }],
        DomainEvent::ProjectClosed(id) => vec![CoreEvent::ProjectClosed {
            project_id: id.to_string(),
        }],
        DomainEvent::SelectionChanged {
            previous,
            current,
            snapshot,
        } => selection_pair(
            previous,
            current,
            |id| CoreEvent::ItemDeselected { id },
            |id| CoreEvent::ItemSelected { id, item: snapshot },
        ),
        DomainEvent::MarkerCreated(id, item) => vec![CoreEvent::ItemCreated {
            id: id.to_string(),
            item,
        }],
        DomainEvent::MarkerUpdated(id, item) => vec![CoreEvent::ItemUpdated {
            id: id.to_string(),
            item,
        }],
        DomainEvent::MarkerDeleted(id) => vec![CoreEvent::ItemDeleted { id: id.to_string() }],
        DomainEvent::ImageSelectionChanged {
            previous,
            current,
            snapshot,
        } => selection_pair(
            previous,
            current,
            |id| CoreEvent::ImageDeselected { id },
            |id| CoreEvent::ImageSelected { id, image: snapshot },
        ),
        DomainEvent::Ready => vec![CoreEvent::SystemReady],
        DomainEvent::ShuttingDown => vec![CoreEvent::SystemShutdown],
        DomainEvent::Custom { event_type, data } => vec![CoreEvent::Custom { event_type, data }],
    }
}

fn selection_pair(
    previous: Option<u32>,
    current: Option<u32>,
    deselected: impl FnOnce(String) -> CoreEvent,
    selected: impl FnOnce(String) -> CoreEvent,
) -> Vec<CoreEvent> {
    if previous == current {
        return Vec::new();
    }
    let mut events = Vec::with_capacity(2);
    if let Some(prev) = previous {
        events.push(deselected(prev.to_string()));
    }
    if let Some(cur) = current {
        events.push(selected(cur.to_string()));
    }
    events
}

/// Which plugins an event was handed to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Plugins whose queue accepted the event, in registry order.
    pub delivered: Vec<PluginId>,
    /// Plugins whose transport refused it; each is now marked faulted.
    pub failed: Vec<PluginId>,
}

impl DispatchReport {
    pub(crate) fn merge(&mut self, other: DispatchReport) {
        self.delivered.extend(other.delivered);
        self.failed.extend(other.failed);
    }
}
