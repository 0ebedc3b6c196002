// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The closed set of plugin transports behind one interface.

use std::path::Path;
use std::sync::Arc;

use reef_core::{
    ArtifactKind, CoreEvent, EMBEDDED_PREFIX, PluginMetadata, ReefError,
};
use serde_json::Value;

use crate::context::HostContext;
use crate::embedded::EmbeddedTransport;
use crate::isolated::IsolatedTransport;
use crate::native::NativeTransport;
use crate::worker::{Command, WorkerHandle};

/// A loaded plugin's execution context.
///
/// Every variant queues work for a worker that owns the plugin, so events
/// and messages never block the caller, and commands reach the plugin in the
/// order they were issued.
#[derive(Debug)]
pub enum Transport {
    Native(NativeTransport),
    Isolated(IsolatedTransport),
    Embedded(EmbeddedTransport),
}

impl Transport {
    /// Loads `artifact` and completes the init handshake.
    ///
    /// The artifact is a path to a `.so`/`.dylib`/`.dll` or `.wasm` file, or
    /// `embedded:<name>` for a catalog factory. On error nothing stays
    /// running: the plugin's destroy hook has already been called.
    pub async fn load(
        plugin_id: &str,
        artifact: &str,
        ctx: &HostContext,
    ) -> Result<(Self, PluginMetadata), ReefError> {
        match ArtifactKind::detect(artifact) {
            Some(ArtifactKind::Native) => NativeTransport::load(plugin_id, Path::new(artifact), ctx)
                .await
                .map(|(t, m)| (Transport::Native(t), m)),
            Some(ArtifactKind::Wasm) => IsolatedTransport::load(plugin_id, Path::new(artifact), ctx)
                .await
                .map(|(t, m)| (Transport::Isolated(t), m)),
            Some(ArtifactKind::Embedded) => {
                let name = artifact.strip_prefix(EMBEDDED_PREFIX).unwrap_or(artifact);
                EmbeddedTransport::load(plugin_id, name, ctx)
                    .await
                    .map(|(t, m)| (Transport::Embedded(t), m))
            }
            None => Err(ReefError::load_failure(
                plugin_id,
                format!("unrecognized artifact `{artifact}`"),
            )),
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        match self {
            Transport::Native(_) => ArtifactKind::Native,
            Transport::Isolated(_) => ArtifactKind::Wasm,
            Transport::Embedded(_) => ArtifactKind::Embedded,
        }
    }

    fn worker(&self) -> &WorkerHandle {
        match self {
            Transport::Native(t) => &t.worker,
            Transport::Isolated(t) => &t.worker,
            Transport::Embedded(t) => &t.worker,
        }
    }

    /// Identifies this instance among every transport the process created.
    /// Faults carry it so the registry can ignore ones from earlier loads.
    pub fn generation(&self) -> u64 {
        self.worker().generation()
    }

    /// False once the worker has exited, after destroy or a fatal fault.
    pub fn is_alive(&self) -> bool {
        self.worker().is_alive()
    }

    pub async fn activate(&self) -> Result<(), ReefError> {
        self.worker().request(Command::Activate, "activate").await
    }

    pub async fn deactivate(&self) -> Result<(), ReefError> {
        self.worker().request(Command::Deactivate, "deactivate").await
    }

    /// Queues an event. Handler failures surface later as faults.
    pub fn dispatch_event(&self, event: Arc<CoreEvent>) -> Result<(), ReefError> {
        self.worker().send(Command::Event(event))
    }

    /// Queues a message from another plugin.
    pub fn send_message(&self, from: &str, payload: Value) -> Result<(), ReefError> {
        self.worker().send(Command::Message {
            from: from.to_string(),
            payload,
        })
    }

    /// Runs the plugin's destroy hook and stops its worker. Idempotent.
    pub async fn destroy(&self) {
        self.worker().destroy().await;
    }
}
