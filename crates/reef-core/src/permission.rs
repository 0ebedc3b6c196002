// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Grantable capability set.
//!
//! Permissions are a closed enum. Plugins declare them as strings in their
//! metadata (`ServiceAccess:markers:*`, `EventSubscribeAll`, ...); anything
//! that does not parse into a variant fails the load.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A single capability a plugin may request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Permission {
    /// Call the listed methods of one service.
    ServiceAccess { service: String, methods: Vec<String> },
    /// Call every method of one service (`ServiceAccess:<service>:*`).
    ServiceFullAccess { service: String },
    /// Call every method of every service.
    AllServicesAccess,
    /// Receive the listed event tags.
    EventSubscribe { events: Vec<String> },
    /// Receive every event.
    EventSubscribeAll,
    /// Message any other plugin.
    PluginCommunication,
    /// Message only the listed plugins.
    PluginCommunicationWith { plugin_ids: Vec<String> },
}

/// Error returned when a permission string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsePermissionError(pub String);

impl fmt::Display for ParsePermissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized permission `{}`", self.0)
    }
}

impl std::error::Error for ParsePermissionError {}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl FromStr for Permission {
    type Err = ParsePermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParsePermissionError(s.to_string());
        let mut parts = s.trim().splitn(3, ':');
        let head = parts.next().ok_or_else(err)?;

        match head {
            "AllServicesAccess" if parts.next().is_none() => Ok(Permission::AllServicesAccess),
            "EventSubscribeAll" if parts.next().is_none() => Ok(Permission::EventSubscribeAll),
            "PluginCommunication" if parts.next().is_none() => Ok(Permission::PluginCommunication),
            "ServiceAccess" => {
                let service = parts.next().filter(|s| !s.is_empty()).ok_or_else(err)?;
                let methods = parts.next().ok_or_else(err)?;
                if methods.trim() == "*" {
                    return Ok(Permission::ServiceFullAccess {
                        service: service.to_string(),
                    });
                }
                let methods = split_list(methods);
                if methods.is_empty() {
                    return Err(err());
                }
                Ok(Permission::ServiceAccess {
                    service: service.to_string(),
                    methods,
                })
            }
            "EventSubscribe" => {
                let list = parts.next().ok_or_else(err)?;
                if parts.next().is_some() {
                    return Err(err());
                }
                if list.trim() == "*" {
                    return Ok(Permission::EventSubscribeAll);
                }
                let events = split_list(list);
                if events.is_empty() {
                    return Err(err());
                }
                Ok(Permission::EventSubscribe { events })
            }
            "PluginCommunicationWith" => {
                let list = parts.next().ok_or_else(err)?;
                if parts.next().is_some() {
                    return Err(err());
                }
                let plugin_ids = split_list(list);
                if plugin_ids.is_empty() {
                    return Err(err());
                }
                Ok(Permission::PluginCommunicationWith { plugin_ids })
            }
            _ => Err(err()),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::ServiceAccess { service, methods } => {
                write!(f, "ServiceAccess:{service}:{}", methods.join(","))
            }
            Permission::ServiceFullAccess { service } => write!(f, "ServiceAccess:{service}:*"),
            Permission::AllServicesAccess => f.write_str("AllServicesAccess"),
            Permission::EventSubscribe { events } => {
                write!(f, "EventSubscribe:{}", events.join(","))
            }
            Permission::EventSubscribeAll => f.write_str("EventSubscribeAll"),
            Permission::PluginCommunication => f.write_str("PluginCommunication"),
            Permission::PluginCommunicationWith { plugin_ids } => {
                write!(f, "PluginCommunicationWith:{}", plugin_ids.join(","))
            }
        }
    }
}

impl TryFrom<String> for Permission {
    type Error = ParsePermissionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Permission> for String {
    fn from(value: Permission) -> Self {
        value.to_string()
    }
}
