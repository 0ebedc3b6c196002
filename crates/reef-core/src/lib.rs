// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core library for the Reef plugin host.
//!
//! This crate provides the error type, plugin metadata, permission model,
//! event shapes, and service-call wire types shared by every other crate in
//! the workspace.

pub mod error;
pub mod event;
pub mod permission;
pub mod traits;
pub mod types;
pub mod wire;

// Re-export key items at crate root for ergonomic imports.
pub use error::{ErrorKind, ReefError};
pub use event::{CoreEvent, DomainEvent};
pub use permission::{ParsePermissionError, Permission};
pub use traits::ServiceGateway;
pub use types::{
    ArtifactKind, EMBEDDED_PREFIX, PluginId, PluginMetadata, PluginSource, TransportFault,
    plugin_id_from_filename,
};
pub use wire::{ServiceCallRequest, ServiceCallResponse};
