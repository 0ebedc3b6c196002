// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-process Rust plugins.
//!
//! Embedded plugins are created by factories registered in an
//! [`EmbeddedCatalog`] under a name, and loaded from the artifact reference
//! `embedded:<name>`. Each runs on its own tokio task. A panic in any hook is
//! contained and reported as a fatal fault.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use reef_core::{
    CoreEvent, PluginId, PluginMetadata, ReefError, ServiceCallRequest, ServiceGateway,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::context::{FaultSink, HostContext};
use crate::worker::{Command, WorkerHandle};

/// An in-process plugin.
///
/// Hooks run one at a time on the plugin's own task, in the order the host
/// issued them. Only `init` and `on_event` are required.
#[async_trait]
pub trait EmbeddedPlugin: Send + 'static {
    /// Handshake. Keep `host` to call services later.
    async fn init(&mut self, plugin_id: &str, host: HostHandle) -> Result<PluginMetadata, String>;

    async fn activate(&mut self) -> Result<(), String> {
        Ok(())
    }

    async fn deactivate(&mut self) -> Result<(), String> {
        Ok(())
    }

    async fn on_event(&mut self, event: &CoreEvent) -> Result<(), String>;

    async fn on_message(&mut self, _from: &str, _payload: Value) -> Result<(), String> {
        Ok(())
    }

    async fn destroy(&mut self) {}
}

/// Creates a fresh plugin instance per load.
pub type EmbeddedFactory = Arc<dyn Fn() -> Box<dyn EmbeddedPlugin> + Send + Sync>;

/// Named embedded plugin factories.
#[derive(Clone, Default)]
pub struct EmbeddedCatalog {
    factories: Arc<RwLock<HashMap<String, EmbeddedFactory>>>,
}

impl std::fmt::Debug for EmbeddedCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedCatalog")
            .field("names", &self.names())
            .finish()
    }
}

impl EmbeddedCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory, replacing any previous one with the same name.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn EmbeddedPlugin> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), Arc::new(factory));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn factory(&self, name: &str) -> Option<EmbeddedFactory> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

/// What an embedded plugin holds on to for calling back into the host.
#[derive(Clone)]
pub struct HostHandle {
    plugin_id: PluginId,
    gateway: Arc<dyn ServiceGateway>,
    next_call: Arc<AtomicU64>,
}

impl std::fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostHandle")
            .field("plugin_id", &self.plugin_id)
            .finish_non_exhaustive()
    }
}

impl HostHandle {
    pub fn new(plugin_id: impl Into<String>, gateway: Arc<dyn ServiceGateway>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            gateway,
            next_call: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Calls a host service as this plugin. Permissions are checked by the host.
    pub async fn call_service(
        &self,
        service: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, ReefError> {
        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed) + 1;
        let request = ServiceCallRequest::new(call_id, &self.plugin_id, service, method, params);
        self.gateway.call_service(request).await
    }

    /// Sends a message to another plugin.
    pub async fn send_message(&self, to: &str, payload: Value) -> Result<(), ReefError> {
        self.gateway.send_message(&self.plugin_id, to, payload).await
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Transport for an embedded plugin.
#[derive(Debug)]
pub struct EmbeddedTransport {
    pub(crate) worker: WorkerHandle,
}

impl EmbeddedTransport {
    /// Instantiates `embedded:<name>` from the catalog and runs `init`.
    pub async fn load(
        plugin_id: &str,
        name: &str,
        ctx: &HostContext,
    ) -> Result<(Self, PluginMetadata), ReefError> {
        let factory = ctx.embedded.factory(name).ok_or_else(|| {
            ReefError::load_failure(plugin_id, format!("no embedded plugin named `{name}`"))
        })?;
        let plugin = std::panic::catch_unwind(AssertUnwindSafe(|| factory()))
            .map_err(|p| ReefError::load_failure(plugin_id, format!("factory panicked: {}", panic_message(p))))?;
        Self::start(plugin_id, plugin, ctx).await
    }

    /// Runs an already constructed plugin instance.
    pub async fn start(
        plugin_id: &str,
        plugin: Box<dyn EmbeddedPlugin>,
        ctx: &HostContext,
    ) -> Result<(Self, PluginMetadata), ReefError> {
        let (worker, commands) = WorkerHandle::new(plugin_id);
        let (ready_tx, ready_rx) = oneshot::channel();
        let host = HostHandle::new(plugin_id, Arc::clone(&ctx.gateway));
        let faults = ctx.fault_sink(&worker);

        ctx.runtime.spawn(run_worker(
            plugin_id.to_string(),
            plugin,
            host,
            commands,
            ready_tx,
            faults,
        ));

        match ready_rx.await {
            Ok(Ok(metadata)) => {
                info!(plugin = %plugin_id, version = %metadata.version, "embedded plugin loaded");
                Ok((Self { worker }, metadata))
            }
            Ok(Err(reason)) => Err(ReefError::load_failure(plugin_id, reason)),
            Err(_) => Err(ReefError::load_failure(plugin_id, "worker exited during load")),
        }
    }
}

async fn run_worker(
    plugin_id: PluginId,
    mut plugin: Box<dyn EmbeddedPlugin>,
    host: HostHandle,
    mut commands: mpsc::UnboundedReceiver<Command>,
    ready: oneshot::Sender<Result<PluginMetadata, String>>,
    faults: FaultSink,
) {
    let init = AssertUnwindSafe(plugin.init(&plugin_id, host)).catch_unwind().await;
    let metadata = match init {
        Ok(Ok(m)) => m,
        Ok(Err(e)) => {
            let _ = AssertUnwindSafe(plugin.destroy()).catch_unwind().await;
            let _ = ready.send(Err(format!("init failed: {e}")));
            return;
        }
        Err(p) => {
            let _ = ready.send(Err(format!("init panicked: {}", panic_message(p))));
            return;
        }
    };
    if ready.send(Ok(metadata)).is_err() {
        let _ = AssertUnwindSafe(plugin.destroy()).catch_unwind().await;
        return;
    }

    while let Some(command) = commands.recv().await {
        let outcome = match command {
            Command::Activate(ack) => {
                let r = AssertUnwindSafe(plugin.activate()).catch_unwind().await;
                r.map(|res| {
                    let _ = ack.send(res);
                })
            }
            Command::Deactivate(ack) => {
                let r = AssertUnwindSafe(plugin.deactivate()).catch_unwind().await;
                r.map(|res| {
                    let _ = ack.send(res);
                })
            }
            Command::Event(event) => {
                let r = AssertUnwindSafe(plugin.on_event(&event)).catch_unwind().await;
                r.map(|res| {
                    if let Err(e) = res {
                        faults.handler_error(format!("on_event({}) failed: {e}", event.tag()));
                    }
                })
            }
            Command::Message { from, payload } => {
                let r = AssertUnwindSafe(plugin.on_message(&from, payload))
                    .catch_unwind()
                    .await;
                r.map(|res| {
                    if let Err(e) = res {
                        faults.handler_error(format!("on_message from {from} failed: {e}"));
                    }
                })
            }
            Command::ServiceResponse(_) => Ok(()),
            Command::Destroy(ack) => {
                if let Err(p) = AssertUnwindSafe(plugin.destroy()).catch_unwind().await {
                    debug!(plugin = %plugin_id, panic = %panic_message(p), "destroy panicked");
                }
                let _ = ack.send(());
                return;
            }
        };

        if let Err(p) = outcome {
            // The instance may be half-updated; stop feeding it.
            faults.fatal(format!("plugin panicked: {}", panic_message(p)));
            return;
        }
    }
    let _ = AssertUnwindSafe(plugin.destroy()).catch_unwind().await;
}
