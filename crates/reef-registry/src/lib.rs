// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Plugin registry for the Reef host.
//!
//! Owns every loaded plugin's lifecycle state, fans events out to
//! subscribers, gates plugin-to-host calls, and persists builtin enable
//! flags and uploaded binaries across restarts.

pub mod blob;
pub mod dispatcher;
mod gateway;
pub mod record;
pub mod registry;
pub mod state;

pub use blob::{BlobStore, DirBlobStore, StoredBlob, accepted_extension};
pub use dispatcher::{DispatchReport, convert};
pub use record::{PluginInfo, PluginState};
pub use registry::{
    ConflictPolicy, EVENTS_SERVICE, LoadOptions, LoadSummary, MESSAGING_SERVICE, Registry,
    RegistryBuilder, RegistrySnapshot,
};
pub use state::StateStore;
