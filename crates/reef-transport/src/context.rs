// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Everything a transport needs from the host.

use std::sync::Arc;

use reef_config::model::{ChannelConfig, SandboxConfig};
use reef_core::{PluginId, ServiceGateway, TransportFault};
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::embedded::EmbeddedCatalog;
use crate::worker::WorkerHandle;

/// Shared host-side context handed to every transport at load time.
#[derive(Clone)]
pub struct HostContext {
    /// Entry point for plugin-issued service calls and messages.
    pub gateway: Arc<dyn ServiceGateway>,
    /// Faults flow upward to the registry through this queue.
    pub faults: UnboundedSender<TransportFault>,
    pub channel: ChannelConfig,
    pub sandbox: SandboxConfig,
    pub embedded: EmbeddedCatalog,
    /// Coordination runtime. Worker threads use it to await gateway calls.
    pub runtime: Handle,
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("channel", &self.channel)
            .field("sandbox", &self.sandbox)
            .finish_non_exhaustive()
    }
}

impl HostContext {
    /// Fault reporter tagged with the worker's id and generation.
    pub(crate) fn fault_sink(&self, worker: &WorkerHandle) -> FaultSink {
        FaultSink {
            plugin_id: worker.plugin_id().to_string(),
            generation: worker.generation(),
            faults: self.faults.clone(),
        }
    }
}

/// Per-plugin fault reporter owned by a worker.
#[derive(Debug, Clone)]
pub(crate) struct FaultSink {
    plugin_id: PluginId,
    generation: u64,
    faults: UnboundedSender<TransportFault>,
}

impl FaultSink {
    fn report(&self, message: String, fatal: bool) {
        warn!(plugin = %self.plugin_id, fatal, error = %message, "plugin transport fault");
        // Registry gone means the host is shutting down.
        let _ = self.faults.send(TransportFault {
            plugin_id: self.plugin_id.clone(),
            generation: self.generation,
            message,
            fatal,
        });
    }

    pub(crate) fn handler_error(&self, message: impl Into<String>) {
        self.report(message.into(), false);
    }

    pub(crate) fn fatal(&self, message: impl Into<String>) {
        self.report(message.into(), true);
    }
}
