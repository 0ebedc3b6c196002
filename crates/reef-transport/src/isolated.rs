// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sandboxed WebAssembly plugins using wasmtime.
//!
//! Each plugin gets its own [`Engine`] with fuel metering and epoch
//! interruption, and a long-lived [`Store`] owned by a dedicated worker
//! thread. Fuel and the epoch deadline are reset before every hook, so a
//! runaway hook traps instead of stalling the host. A trap is fatal: the
//! worker stops and the registry marks the plugin faulted.
//!
//! Guest ABI (import module `reef`):
//!
//! | import | signature | |
//! |---|---|---|
//! | `log` | `(level, ptr, len)` | 0 debug, 1 info, 2 warn, 3 error |
//! | `input_len` | `() -> i32` | size of the current input buffer |
//! | `read_input` | `(ptr) -> i32` | copies the input buffer into guest memory |
//! | `set_metadata` | `(ptr, len) -> i32` | metadata JSON, during `plugin_init` |
//! | `call_service` | `(ptr, len) -> i64` | async request; answer arrives via `plugin_on_service_response` |
//! | `call_service_sync` | `(ptr, len) -> i32` | blocking request over the shared channel |
//!
//! Exports: `memory`, `plugin_init` (input is the plugin id), and optionally
//! `plugin_activate`, `plugin_deactivate`, `plugin_on_event`,
//! `plugin_on_message`, `plugin_on_service_response`, each `() -> i32`, plus
//! `plugin_destroy: () -> ()`. A module that exports `reef_sync_channel` gets a
//! synchronous channel for `call_service_sync`.
//!
//! `call_service_sync` returns the response length (read it with
//! `read_input`) or a negated channel error code, with the message as input.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::anyhow;
use reef_channel::{PluginEndpoint, Reply};
use reef_config::model::{ChannelConfig, SandboxConfig};
use reef_core::{
    ErrorKind, PluginId, PluginMetadata, ReefError, ServiceCallRequest, ServiceCallResponse,
    ServiceGateway,
};
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, WeakUnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use wasmtime::{
    Caller, Config, Engine, Instance, Linker, Memory, Module, Store, StoreLimits,
    StoreLimitsBuilder,
};

use crate::context::{FaultSink, HostContext};
use crate::worker::{Ack, Command, WorkerHandle};

const SYNC_CHANNEL_EXPORT: &str = "reef_sync_channel";

/// Per-plugin data inside the wasmtime store.
struct GuestState {
    plugin_id: PluginId,
    /// Bytes the guest reads with `read_input`.
    input: Vec<u8>,
    metadata: Option<String>,
    limits: StoreLimits,
    next_call_id: u64,
    gateway: Arc<dyn ServiceGateway>,
    runtime: Handle,
    /// Route for async service responses back into this worker's queue.
    commands: WeakUnboundedSender<Command>,
    sync: Option<PluginEndpoint>,
}

fn guest_memory(caller: &mut Caller<'_, GuestState>) -> Option<Memory> {
    match caller.get_export("memory") {
        Some(wasmtime::Extern::Memory(mem)) => Some(mem),
        _ => None,
    }
}

fn read_guest_bytes(
    memory: &Memory,
    caller: &Caller<'_, GuestState>,
    ptr: i32,
    len: i32,
) -> Option<Vec<u8>> {
    let ptr = usize::try_from(ptr).ok()?;
    let len = usize::try_from(len).ok()?;
    memory.data(caller).get(ptr..ptr.checked_add(len)?).map(<[u8]>::to_vec)
}

fn write_guest_bytes(
    memory: &Memory,
    caller: &mut Caller<'_, GuestState>,
    ptr: i32,
    bytes: &[u8],
) -> bool {
    let Ok(ptr) = usize::try_from(ptr) else {
        return false;
    };
    let Some(end) = ptr.checked_add(bytes.len()) else {
        return false;
    };
    match memory.data_mut(caller).get_mut(ptr..end) {
        Some(dst) => {
            dst.copy_from_slice(bytes);
            true
        }
        None => false,
    }
}

fn linker_err(e: anyhow::Error) -> String {
    format!("failed to define host function: {e}")
}

/// Negated channel code, the failure convention for guest-visible calls.
fn failure_code(kind: ErrorKind) -> i32 {
    -(kind.channel_code() as i32)
}

fn define_host_functions(linker: &mut Linker<GuestState>) -> Result<(), String> {
    linker
        .func_wrap(
            "reef",
            "log",
            |mut caller: Caller<'_, GuestState>, level: i32, ptr: i32, len: i32| {
                let Some(memory) = guest_memory(&mut caller) else {
                    return;
                };
                let Some(bytes) = read_guest_bytes(&memory, &caller, ptr, len) else {
                    return;
                };
                let msg = String::from_utf8_lossy(&bytes);
                let plugin = caller.data().plugin_id.as_str();
                match level {
                    0 => debug!(plugin = %plugin, "{msg}"),
                    1 => info!(plugin = %plugin, "{msg}"),
                    2 => warn!(plugin = %plugin, "{msg}"),
                    3 => error!(plugin = %plugin, "{msg}"),
                    _ => info!(plugin = %plugin, level, "{msg}"),
                }
            },
        )
        .map_err(linker_err)?;

    linker
        .func_wrap("reef", "input_len", |caller: Caller<'_, GuestState>| -> i32 {
            caller.data().input.len() as i32
        })
        .map_err(linker_err)?;

    linker
        .func_wrap(
            "reef",
            "read_input",
            |mut caller: Caller<'_, GuestState>, ptr: i32| -> i32 {
                let Some(memory) = guest_memory(&mut caller) else {
                    return -1;
                };
                let input = std::mem::take(&mut caller.data_mut().input);
                let written = write_guest_bytes(&memory, &mut caller, ptr, &input);
                let len = input.len() as i32;
                caller.data_mut().input = input;
                if written { len } else { -1 }
            },
        )
        .map_err(linker_err)?;

    linker
        .func_wrap(
            "reef",
            "set_metadata",
            |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> i32 {
                let Some(memory) = guest_memory(&mut caller) else {
                    return -1;
                };
                match read_guest_bytes(&memory, &caller, ptr, len)
                    .and_then(|b| String::from_utf8(b).ok())
                {
                    Some(json) => {
                        caller.data_mut().metadata = Some(json);
                        0
                    }
                    None => -1,
                }
            },
        )
        .map_err(linker_err)?;

    linker
        .func_wrap(
            "reef",
            "call_service",
            |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> i64 {
                let Some(memory) = guest_memory(&mut caller) else {
                    return i64::from(failure_code(ErrorKind::ChannelProtocolError));
                };
                let Some(mut request) = read_guest_bytes(&memory, &caller, ptr, len)
                    .and_then(|b| serde_json::from_slice::<ServiceCallRequest>(&b).ok())
                else {
                    return i64::from(failure_code(ErrorKind::ChannelProtocolError));
                };

                let state = caller.data_mut();
                state.next_call_id += 1;
                let call_id = state.next_call_id;
                request.call_id = call_id;
                request.plugin_id = state.plugin_id.clone();

                let gateway = Arc::clone(&state.gateway);
                let commands = state.commands.clone();
                state.runtime.spawn(async move {
                    let outcome = gateway.call_service(request).await;
                    if let Some(tx) = commands.upgrade() {
                        let _ = tx.send(Command::ServiceResponse(ServiceCallResponse::from_result(
                            call_id, outcome,
                        )));
                    }
                });
                call_id as i64
            },
        )
        .map_err(linker_err)?;

    linker
        .func_wrap(
            "reef",
            "call_service_sync",
            |mut caller: Caller<'_, GuestState>,
             ptr: i32,
             len: i32|
             -> Result<i32, wasmtime::Error> {
                let memory = guest_memory(&mut caller)
                    .ok_or_else(|| anyhow!("module has no exported memory"))?;
                let bytes = read_guest_bytes(&memory, &caller, ptr, len)
                    .ok_or_else(|| anyhow!("call_service_sync request is out of bounds"))?;

                let state = caller.data_mut();
                let endpoint = state.sync.as_ref().ok_or_else(|| {
                    anyhow!("call_service_sync requires exporting `{SYNC_CHANNEL_EXPORT}`")
                })?;

                let (code, input) = match endpoint.call(&bytes) {
                    Ok(Reply::Payload(payload)) => (payload.len() as i32, payload),
                    Ok(Reply::Failed { kind, message }) => (failure_code(kind), message.into_bytes()),
                    Err(e) => (failure_code(e.kind()), e.to_string().into_bytes()),
                };
                state.input = input;
                Ok(code)
            },
        )
        .map_err(linker_err)?;

    Ok(())
}

/// Host end of a plugin's synchronous channel. Stops its thread on drop.
struct SyncServer {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for SyncServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn start_sync_channel(
    plugin_id: &str,
    config: &ChannelConfig,
    gateway: Arc<dyn ServiceGateway>,
    runtime: Handle,
) -> Result<(PluginEndpoint, SyncServer), String> {
    let (host, plugin) = reef_channel::channel(
        config.segment_bytes,
        config.chunk_bytes,
        config.call_timeout(),
    )
    .map_err(|e| e.to_string())?;

    let id = plugin_id.to_string();
    let handler = move |bytes: &[u8]| -> Reply {
        let mut request: ServiceCallRequest = match serde_json::from_slice(bytes) {
            Ok(r) => r,
            Err(e) => {
                return Reply::failed(ErrorKind::ChannelProtocolError, format!("invalid request: {e}"));
            }
        };
        request.plugin_id = id.clone();
        match runtime.block_on(gateway.call_service(request)) {
            Ok(value) => Reply::Payload(
                serde_json::to_vec(&value).unwrap_or_else(|_| b"null".to_vec()),
            ),
            Err(e) => Reply::failed(e.kind(), e.to_string()),
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let thread = host
        .spawn(format!("reef-sync-{plugin_id}"), handler, Arc::clone(&shutdown))
        .map_err(|e| format!("failed to spawn channel thread: {e}"))?;
    Ok((
        plugin,
        SyncServer {
            shutdown,
            thread: Some(thread),
        },
    ))
}

fn describe_trap(export: &str, e: &wasmtime::Error, sandbox: &SandboxConfig) -> String {
    let msg = format!("{e:#}");
    if msg.contains("all fuel consumed") {
        format!("{export} exceeded fuel limit ({} units): {msg}", sandbox.fuel)
    } else if msg.contains("interrupt") {
        format!(
            "{export} exceeded wall-clock timeout ({}s): {msg}",
            sandbox.epoch_timeout_secs
        )
    } else {
        format!("{export} trapped: {msg}")
    }
}

/// An instantiated guest and the limits applied to each hook.
struct Guest {
    store: Store<GuestState>,
    instance: Instance,
    sandbox: SandboxConfig,
    _sync: Option<SyncServer>,
}

impl Guest {
    fn instantiate(
        plugin_id: &str,
        engine: &Engine,
        bytes: &[u8],
        ctx: &GuestContext,
    ) -> Result<Self, String> {
        let module =
            Module::new(engine, bytes).map_err(|e| format!("failed to compile module: {e}"))?;

        let (sync, server) = if module.exports().any(|e| e.name() == SYNC_CHANNEL_EXPORT) {
            let (endpoint, server) = start_sync_channel(
                plugin_id,
                &ctx.channel,
                Arc::clone(&ctx.gateway),
                ctx.runtime.clone(),
            )?;
            (Some(endpoint), Some(server))
        } else {
            (None, None)
        };

        let limits = StoreLimitsBuilder::new()
            .memory_size(ctx.sandbox.memory_mb as usize * 1024 * 1024)
            .build();
        let state = GuestState {
            plugin_id: plugin_id.to_string(),
            input: Vec::new(),
            metadata: None,
            limits,
            next_call_id: 0,
            gateway: Arc::clone(&ctx.gateway),
            runtime: ctx.runtime.clone(),
            commands: ctx.commands.clone(),
            sync,
        };
        let mut store = Store::new(engine, state);
        store.limiter(|s| &mut s.limits);
        store.epoch_deadline_trap();
        store
            .set_fuel(ctx.sandbox.fuel)
            .map_err(|e| format!("failed to set fuel: {e}"))?;
        store.set_epoch_deadline(ctx.sandbox.epoch_timeout_secs);

        let mut linker = Linker::new(engine);
        define_host_functions(&mut linker)?;
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| format!("failed to instantiate module: {e:#}"))?;
        if instance.get_memory(&mut store, "memory").is_none() {
            return Err("module does not export `memory`".into());
        }

        Ok(Self {
            store,
            instance,
            sandbox: ctx.sandbox.clone(),
            _sync: server,
        })
    }

    /// Runs an `() -> i32` hook. `Ok(None)` if the guest does not export it.
    fn call(&mut self, export: &str, input: Vec<u8>) -> Result<Option<i32>, String> {
        if self.instance.get_func(&mut self.store, export).is_none() {
            return Ok(None);
        }
        let func = self
            .instance
            .get_typed_func::<(), i32>(&mut self.store, export)
            .map_err(|e| format!("export `{export}` has the wrong signature: {e}"))?;

        self.store.data_mut().input = input;
        self.store
            .set_fuel(self.sandbox.fuel)
            .map_err(|e| format!("failed to set fuel: {e}"))?;
        self.store.set_epoch_deadline(self.sandbox.epoch_timeout_secs);
        func.call(&mut self.store, ())
            .map(Some)
            .map_err(|e| describe_trap(export, &e, &self.sandbox))
    }

    fn handshake(&mut self, plugin_id: &str) -> Result<PluginMetadata, String> {
        match self.call("plugin_init", plugin_id.as_bytes().to_vec())? {
            None => return Err("module does not export `plugin_init`".into()),
            Some(0) => {}
            Some(code) => return Err(format!("plugin_init returned {code}")),
        }
        let json = self
            .store
            .data_mut()
            .metadata
            .take()
            .ok_or_else(|| "plugin_init did not call set_metadata".to_string())?;
        serde_json::from_str(&json).map_err(|e| format!("invalid metadata JSON: {e}"))
    }

    fn destroy(&mut self) {
        let Ok(func) = self
            .instance
            .get_typed_func::<(), ()>(&mut self.store, "plugin_destroy")
        else {
            return;
        };
        let _ = self.store.set_fuel(self.sandbox.fuel);
        self.store.set_epoch_deadline(self.sandbox.epoch_timeout_secs);
        if let Err(e) = func.call(&mut self.store, ()) {
            debug!(error = %format!("{e:#}"), "plugin_destroy trapped");
        }
    }
}

/// Host-side inputs the worker thread needs to build its guest.
struct GuestContext {
    gateway: Arc<dyn ServiceGateway>,
    runtime: Handle,
    channel: ChannelConfig,
    sandbox: SandboxConfig,
    commands: WeakUnboundedSender<Command>,
}

/// Outcome of one command against the guest.
enum Step {
    Continue,
    Stop,
}

/// Runs a lifecycle hook and answers its caller. A trap also stops the worker.
fn lifecycle(guest: &mut Guest, export: &str, ack: Ack, faults: &FaultSink) -> Step {
    match guest.call(export, Vec::new()) {
        Ok(None) | Ok(Some(0)) => {
            let _ = ack.send(Ok(()));
            Step::Continue
        }
        Ok(Some(code)) => {
            let _ = ack.send(Err(format!("{export} returned {code}")));
            Step::Continue
        }
        Err(trap) => {
            let _ = ack.send(Err(trap.clone()));
            faults.fatal(trap);
            Step::Stop
        }
    }
}

fn handle_command(guest: &mut Guest, command: Command, faults: &FaultSink) -> Step {
    let (export, outcome) = match command {
        Command::Activate(ack) => return lifecycle(guest, "plugin_activate", ack, faults),
        Command::Deactivate(ack) => return lifecycle(guest, "plugin_deactivate", ack, faults),
        Command::Event(event) => (
            "plugin_on_event",
            guest.call("plugin_on_event", event.to_json().into_bytes()),
        ),
        Command::Message { from, payload } => {
            let input = json!({"from": from, "payload": payload}).to_string();
            ("plugin_on_message", guest.call("plugin_on_message", input.into_bytes()))
        }
        Command::ServiceResponse(response) => (
            "plugin_on_service_response",
            guest.call("plugin_on_service_response", response.to_json().into_bytes()),
        ),
        Command::Destroy(ack) => {
            guest.destroy();
            let _ = ack.send(());
            return Step::Stop;
        }
    };

    match outcome {
        Ok(None) | Ok(Some(0)) => Step::Continue,
        Ok(Some(code)) => {
            faults.handler_error(format!("{export} returned {code}"));
            Step::Continue
        }
        Err(trap) => {
            faults.fatal(trap);
            Step::Stop
        }
    }
}

fn run_worker(
    plugin_id: PluginId,
    bytes: Vec<u8>,
    engine: Engine,
    ctx: GuestContext,
    mut commands: mpsc::UnboundedReceiver<Command>,
    ready: oneshot::Sender<Result<PluginMetadata, String>>,
    faults: FaultSink,
) {
    let mut guest = match Guest::instantiate(&plugin_id, &engine, &bytes, &ctx) {
        Ok(g) => g,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    drop(bytes);

    let metadata = match guest.handshake(&plugin_id) {
        Ok(m) => m,
        Err(e) => {
            guest.destroy();
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(metadata)).is_err() {
        guest.destroy();
        return;
    }

    while let Some(command) = commands.blocking_recv() {
        if let Step::Stop = handle_command(&mut guest, command, &faults) {
            debug!(plugin = %plugin_id, "wasm worker exiting");
            return;
        }
    }
    guest.destroy();
}

/// Transport for a sandboxed WebAssembly plugin.
#[derive(Debug)]
pub struct IsolatedTransport {
    pub(crate) worker: WorkerHandle,
    ticker: tokio::task::JoinHandle<()>,
}

impl Drop for IsolatedTransport {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

impl IsolatedTransport {
    /// Loads a `.wasm` file.
    pub async fn load(
        plugin_id: &str,
        path: &Path,
        ctx: &HostContext,
    ) -> Result<(Self, PluginMetadata), ReefError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            ReefError::load_failure(plugin_id, format!("failed to read {}: {e}", path.display()))
        })?;
        Self::start(plugin_id, bytes, ctx).await
    }

    /// Loads a module from bytes (binary or text format).
    pub async fn start(
        plugin_id: &str,
        bytes: Vec<u8>,
        ctx: &HostContext,
    ) -> Result<(Self, PluginMetadata), ReefError> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);
        let engine = Engine::new(&config).map_err(|e| {
            ReefError::load_failure(plugin_id, format!("failed to create wasmtime engine: {e}"))
        })?;

        let (worker, commands) = WorkerHandle::new(plugin_id);
        let guest_ctx = GuestContext {
            gateway: Arc::clone(&ctx.gateway),
            runtime: ctx.runtime.clone(),
            channel: ctx.channel.clone(),
            sandbox: ctx.sandbox.clone(),
            commands: worker.sender().downgrade(),
        };

        // Advances the engine epoch once a second for the plugin's lifetime.
        let ticking = engine.clone();
        let ticker = ctx.runtime.spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                ticking.increment_epoch();
            }
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let faults = ctx.fault_sink(&worker);
        let id = plugin_id.to_string();
        let spawned = std::thread::Builder::new()
            .name(format!("reef-wasm-{plugin_id}"))
            .spawn(move || run_worker(id, bytes, engine, guest_ctx, commands, ready_tx, faults));
        if let Err(e) = spawned {
            ticker.abort();
            return Err(ReefError::load_failure(
                plugin_id,
                format!("failed to spawn worker: {e}"),
            ));
        }

        let transport = Self { worker, ticker };
        match ready_rx.await {
            Ok(Ok(metadata)) => {
                info!(plugin = %plugin_id, version = %metadata.version, "wasm plugin loaded");
                Ok((transport, metadata))
            }
            Ok(Err(reason)) => Err(ReefError::load_failure(plugin_id, reason)),
            Err(_) => Err(ReefError::load_failure(plugin_id, "worker exited during load")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedded::EmbeddedCatalog;
    use async_trait::async_trait;
    use reef_core::{CoreEvent, TransportFault};
    use serde_json::Value;

    /// Forwards every call to the test and answers from the service name.
    struct RecordingGateway {
        calls: mpsc::UnboundedSender<ServiceCallRequest>,
    }

    #[async_trait]
    impl ServiceGateway for RecordingGateway {
        async fn call_service(&self, request: ServiceCallRequest) -> Result<Value, ReefError> {
            let _ = self.calls.send(request.clone());
            match request.service.as_str() {
                "missing" => Err(ReefError::ServiceNotFound(request.service)),
                _ => Ok(json!({"ok": true})),
            }
        }

        async fn send_message(&self, _: &str, _: &str, _: Value) -> Result<(), ReefError> {
            Ok(())
        }
    }

    struct Harness {
        ctx: HostContext,
        calls: mpsc::UnboundedReceiver<ServiceCallRequest>,
        faults: mpsc::UnboundedReceiver<TransportFault>,
    }

    fn harness(fuel: u64) -> Harness {
        let (calls_tx, calls) = mpsc::unbounded_channel();
        let (faults_tx, faults) = mpsc::unbounded_channel();
        let ctx = HostContext {
            gateway: Arc::new(RecordingGateway { calls: calls_tx }),
            faults: faults_tx,
            channel: ChannelConfig::default(),
            sandbox: SandboxConfig {
                fuel,
                ..SandboxConfig::default()
            },
            embedded: EmbeddedCatalog::new(),
            runtime: Handle::current(),
        };
        Harness { ctx, calls, faults }
    }

    fn wat_str(s: &str) -> String {
        s.replace('\\', "\\\\").replace('"', "\\\"")
    }

    const META: &str = r#"{"id":"guest","name":"Guest","version":"1.0.0"}"#;
    const REQ: &str = r#"{"service":"markers","method":"get_all_markers"}"#;
    const REQ_MISSING: &str = r#"{"service":"missing","method":"x"}"#;

    /// Guest module: metadata at 0, requests at 512 and 768, then `funcs`.
    fn guest(funcs: &str, sync: bool) -> Vec<u8> {
        let mut wat = String::from(
            r#"(module
  (import "reef" "set_metadata" (func $set_metadata (param i32 i32) (result i32)))
  (import "reef" "call_service" (func $call (param i32 i32) (result i64)))
  (import "reef" "call_service_sync" (func $call_sync (param i32 i32) (result i32)))
  (memory (export "memory") 1)
"#,
        );
        wat.push_str(&format!("  (data (i32.const 0) \"{}\")\n", wat_str(META)));
        wat.push_str(&format!("  (data (i32.const 512) \"{}\")\n", wat_str(REQ)));
        wat.push_str(&format!("  (data (i32.const 768) \"{}\")\n", wat_str(REQ_MISSING)));
        if sync {
            wat.push_str("  (global (export \"reef_sync_channel\") i32 (i32.const 1))\n");
        }
        wat.push_str(&format!(
            "  (func (export \"plugin_init\") (result i32)\n    (drop (call $set_metadata (i32.const 0) (i32.const {})))\n    (i32.const 0))\n",
            META.len()
        ));
        wat.push_str(funcs);
        wat.push(')');
        wat::parse_str(&wat).unwrap()
    }

    fn event() -> Arc<CoreEvent> {
        Arc::new(CoreEvent::ItemSelected {
            id: "42".into(),
            item: None,
        })
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handshake_reads_metadata() {
        let h = harness(1_000_000);
        let (transport, meta) = IsolatedTransport::start("guest", guest("", false), &h.ctx)
            .await
            .unwrap();
        assert_eq!(meta.id, "guest");
        assert_eq!(meta.version, "1.0.0");
        // missing optional hooks succeed
        transport
            .worker
            .request(Command::Activate, "activate")
            .await
            .unwrap();
        transport.worker.destroy().await;
        assert!(!transport.worker.is_alive());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn module_without_init_fails_to_load() {
        let h = harness(1_000_000);
        let wasm = wat::parse_str(r#"(module (memory (export "memory") 1))"#).unwrap();
        let err = IsolatedTransport::start("guest", wasm, &h.ctx).await.unwrap_err();
        assert!(err.to_string().contains("plugin_init"), "{err}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn event_hook_issues_async_call_and_gets_response() {
        let mut h = harness(1_000_000);
        let funcs = format!(
            r#"  (func (export "plugin_on_event") (result i32)
    (drop (call $call (i32.const 512) (i32.const {req})))
    (i32.const 0))
  (func (export "plugin_on_service_response") (result i32)
    (drop (call $call (i32.const 768) (i32.const {missing})))
    (i32.const 0))
"#,
            req = REQ.len(),
            missing = REQ_MISSING.len()
        );
        let (transport, _) = IsolatedTransport::start("guest", guest(&funcs, false), &h.ctx)
            .await
            .unwrap();

        transport.worker.send(Command::Event(event())).unwrap();
        let first = next(&mut h.calls).await;
        assert_eq!(first.plugin_id, "guest");
        assert_eq!(first.service, "markers");
        assert_eq!(first.call_id, 1);

        // the response to the first call triggers a second one
        let second = next(&mut h.calls).await;
        assert_eq!(second.service, "missing");
        assert_eq!(second.call_id, 2);
        transport.worker.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn nonzero_hook_return_is_non_fatal() {
        let mut h = harness(1_000_000);
        let funcs = r#"  (func (export "plugin_on_event") (result i32) (i32.const 3))
"#;
        let (transport, _) = IsolatedTransport::start("guest", guest(funcs, false), &h.ctx)
            .await
            .unwrap();
        transport.worker.send(Command::Event(event())).unwrap();
        let fault = next(&mut h.faults).await;
        assert!(!fault.fatal);
        assert_eq!(fault.message, "plugin_on_event returned 3");
        assert!(transport.worker.is_alive());
        transport.worker.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn trap_is_fatal() {
        let mut h = harness(1_000_000);
        let funcs = r#"  (func (export "plugin_on_event") (result i32) unreachable)
"#;
        let (transport, _) = IsolatedTransport::start("guest", guest(funcs, false), &h.ctx)
            .await
            .unwrap();
        transport.worker.send(Command::Event(event())).unwrap();
        let fault = next(&mut h.faults).await;
        assert!(fault.fatal);
        assert!(fault.message.contains("plugin_on_event trapped"), "{}", fault.message);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runaway_hook_exhausts_fuel() {
        let mut h = harness(10_000);
        let funcs = r#"  (func (export "plugin_on_event") (result i32)
    (loop $forever (br $forever))
    (i32.const 0))
"#;
        let (transport, _) = IsolatedTransport::start("guest", guest(funcs, false), &h.ctx)
            .await
            .unwrap();
        transport.worker.send(Command::Event(event())).unwrap();
        let fault = next(&mut h.faults).await;
        assert!(fault.fatal);
        assert!(fault.message.contains("exceeded fuel limit"), "{}", fault.message);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sync_call_returns_response_length_or_negated_code() {
        let mut h = harness(1_000_000);
        let funcs = format!(
            r#"  (func (export "plugin_on_message") (result i32)
    (call $call_sync (i32.const 512) (i32.const {req})))
  (func (export "plugin_on_event") (result i32)
    (call $call_sync (i32.const 768) (i32.const {missing})))
"#,
            req = REQ.len(),
            missing = REQ_MISSING.len()
        );
        let (transport, _) = IsolatedTransport::start("guest", guest(&funcs, true), &h.ctx)
            .await
            .unwrap();

        transport
            .worker
            .send(Command::Message {
                from: "peer".into(),
                payload: Value::Null,
            })
            .unwrap();
        let call = next(&mut h.calls).await;
        assert_eq!(call.plugin_id, "guest");
        // {"ok":true} is 11 bytes
        let fault = next(&mut h.faults).await;
        assert_eq!(fault.message, "plugin_on_message returned 11");

        transport.worker.send(Command::Event(event())).unwrap();
        let _ = next(&mut h.calls).await;
        let fault = next(&mut h.faults).await;
        assert_eq!(fault.message, "plugin_on_event returned -1");
        transport.worker.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sync_call_without_channel_export_traps() {
        let mut h = harness(1_000_000);
        let funcs = format!(
            r#"  (func (export "plugin_on_event") (result i32)
    (call $call_sync (i32.const 512) (i32.const {})))
"#,
            REQ.len()
        );
        let (transport, _) = IsolatedTransport::start("guest", guest(&funcs, false), &h.ctx)
            .await
            .unwrap();
        transport.worker.send(Command::Event(event())).unwrap();
        let fault = next(&mut h.faults).await;
        assert!(fault.fatal);
        assert!(fault.message.contains(SYNC_CHANNEL_EXPORT), "{}", fault.message);
    }
}
