// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Answers "may this plugin do X" from a declared permission set.

use std::collections::BTreeSet;

use reef_core::Permission;

/// Permission set of one plugin (or of what the host is willing to grant).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionChecker {
    granted: BTreeSet<Permission>,
}

impl PermissionChecker {
    pub fn new(granted: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            granted: granted.into_iter().collect(),
        }
    }

    pub fn granted(&self) -> &BTreeSet<Permission> {
        &self.granted
    }

    pub fn can_access_service(&self, service: &str, method: &str) -> bool {
        self.granted.iter().any(|p| match p {
            Permission::AllServicesAccess => true,
            Permission::ServiceFullAccess { service: s } => s == service,
            Permission::ServiceAccess { service: s, methods } => {
                s == service && methods.iter().any(|m| m == method)
            }
            _ => false,
        })
    }

    fn has_full_service(&self, service: &str) -> bool {
        self.granted.iter().any(|p| match p {
            Permission::AllServicesAccess => true,
            Permission::ServiceFullAccess { service: s } => s == service,
            _ => false,
        })
    }

    pub fn can_subscribe_event(&self, tag: &str) -> bool {
        self.granted.iter().any(|p| match p {
            Permission::EventSubscribeAll => true,
            Permission::EventSubscribe { events } => events.iter().any(|e| e == tag || e == "*"),
            _ => false,
        })
    }

    pub fn can_message(&self, target: &str) -> bool {
        self.granted.iter().any(|p| match p {
            Permission::PluginCommunication => true,
            Permission::PluginCommunicationWith { plugin_ids } => {
                plugin_ids.iter().any(|id| id == target)
            }
            _ => false,
        })
    }

    /// True if everything `requested` allows is also allowed by this set.
    pub fn covers(&self, requested: &Permission) -> bool {
        match requested {
            Permission::AllServicesAccess => self.granted.contains(&Permission::AllServicesAccess),
            Permission::ServiceFullAccess { service } => self.has_full_service(service),
            Permission::ServiceAccess { service, methods } => methods
                .iter()
                .all(|m| self.can_access_service(service, m)),
            Permission::EventSubscribeAll => self.granted.contains(&Permission::EventSubscribeAll),
            Permission::EventSubscribe { events } => {
                events.iter().all(|e| self.can_subscribe_event(e))
            }
            Permission::PluginCommunication => {
                self.granted.contains(&Permission::PluginCommunication)
            }
            Permission::PluginCommunicationWith { plugin_ids } => {
                plugin_ids.iter().all(|id| self.can_message(id))
            }
        }
    }

    /// Requested permissions this set does not cover.
    pub fn uncovered<'a>(
        &self,
        requested: impl IntoIterator<Item = &'a Permission>,
    ) -> Vec<&'a Permission> {
        requested.into_iter().filter(|p| !self.covers(p)).collect()
    }
}

/// Ready-made permission sets.
pub mod presets {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    /// Only lifecycle notifications.
    pub fn minimal() -> Vec<Permission> {
        vec![Permission::EventSubscribe {
            events: list(&["SystemReady", "SystemShutdown"]),
        }]
    }

    /// Marker read/update access plus item and project events.
    pub fn standard() -> Vec<Permission> {
        vec![
            Permission::ServiceAccess {
                service: "markers".into(),
                methods: list(&["get_all_markers", "get_marker", "update_marker"]),
            },
            Permission::ServiceAccess {
                service: "project".into(),
                methods: list(&["get_current"]),
            },
            Permission::EventSubscribe {
                events: list(&[
                    "ItemCreated",
                    "ItemUpdated",
                    "ItemDeleted",
                    "ItemSelected",
                    "ItemDeselected",
                    "ProjectOpened",
                    "ProjectClosed",
                ]),
            },
        ]
    }

    /// Everything.
    pub fn full() -> Vec<Permission> {
        vec![
            Permission::AllServicesAccess,
            Permission::EventSubscribeAll,
            Permission::PluginCommunication,
        ]
    }
}
