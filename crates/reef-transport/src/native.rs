// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Native plugins: dynamic libraries speaking the C plugin ABI.
//!
//! The library is opened on a dedicated OS thread that owns it for its whole
//! lifetime. Lifecycle calls, events, and messages reach it as commands over
//! a queue. Service calls from plugin code come back through the
//! [`HostCallbacks`] table and block only the calling plugin thread.
//!
//! Exports a plugin library must provide:
//!
//! | symbol | signature |
//! |---|---|
//! | `plugin_set_host_callbacks` | `fn(HostCallbacks)` |
//! | `plugin_init` | `fn(*const c_char) -> i32` |
//! | `plugin_get_metadata` | `fn() -> *mut c_char` (JSON) |
//! | `plugin_free_string` | `fn(*mut c_char)` |
//! | `plugin_activate` / `plugin_deactivate` | `fn() -> i32` |
//! | `plugin_on_event` | `fn(*const c_char) -> i32` |
//! | `plugin_on_message` | `fn(*const c_char, *const c_char) -> i32` |
//! | `plugin_destroy` (optional) | `fn()` |

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char, c_void};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use libloading::Library;
use reef_core::{
    PluginId, PluginMetadata, ReefError, ServiceCallRequest, ServiceCallResponse, ServiceGateway,
};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::context::{FaultSink, HostContext};
use crate::worker::{Command, WorkerHandle};

/// Host functions handed to a native plugin at load time.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HostCallbacks {
    /// `(pluginId, service, method, paramsJson) -> responseJson`. The returned
    /// string is a wire `ServiceCallResponse` and must be released with
    /// `free_host_memory`.
    pub call_service: extern "C" fn(
        plugin_id: *const c_char,
        service: *const c_char,
        method: *const c_char,
        params: *const c_char,
    ) -> *mut c_char,
    pub free_host_memory: extern "C" fn(ptr: *mut c_void),
    /// Levels: 0 debug, 1 info, 2 warn, 3 error.
    pub log_message: extern "C" fn(level: i32, message: *const c_char),
}

pub const HOST_CALLBACKS: HostCallbacks = HostCallbacks {
    call_service: host_call_service,
    free_host_memory: host_free_memory,
    log_message: host_log_message,
};

/// The plugin side of the native ABI, one method per export.
///
/// [`DylibModule`] implements it over a loaded library; tests can supply an
/// in-process stand-in. A module is created and used on its worker thread only.
pub trait NativeModule {
    fn set_host_callbacks(&mut self, callbacks: HostCallbacks);
    fn init(&mut self, plugin_id: &str) -> i32;
    /// Metadata JSON, or `None` if the plugin returned null.
    fn metadata_json(&mut self) -> Option<String>;
    fn activate(&mut self) -> i32;
    fn deactivate(&mut self) -> i32;
    fn on_event(&mut self, event_json: &str) -> i32;
    fn on_message(&mut self, from: &str, payload_json: &str) -> i32;
    fn destroy(&mut self);
}

type SetCallbacksFn = unsafe extern "C" fn(HostCallbacks);
type InitFn = unsafe extern "C" fn(*const c_char) -> i32;
type GetMetadataFn = unsafe extern "C" fn() -> *mut c_char;
type FreeStringFn = unsafe extern "C" fn(*mut c_char);
type LifecycleFn = unsafe extern "C" fn() -> i32;
type OnEventFn = unsafe extern "C" fn(*const c_char) -> i32;
type OnMessageFn = unsafe extern "C" fn(*const c_char, *const c_char) -> i32;
type DestroyFn = unsafe extern "C" fn();

/// A plugin library opened with `libloading`.
pub struct DylibModule {
    set_callbacks: SetCallbacksFn,
    init: InitFn,
    get_metadata: GetMetadataFn,
    free_string: FreeStringFn,
    activate: LifecycleFn,
    deactivate: LifecycleFn,
    on_event: OnEventFn,
    on_message: OnMessageFn,
    destroy: Option<DestroyFn>,
    destroyed: bool,
    // Keeps every function pointer above valid.
    _library: Library,
}

fn symbol<T: Copy>(library: &Library, name: &str) -> Result<T, String> {
    // SAFETY: the type of every symbol is fixed by the plugin ABI above.
    unsafe { library.get::<T>(name.as_bytes()) }
        .map(|s| *s)
        .map_err(|e| format!("missing entry point {name}: {e}"))
}

impl DylibModule {
    pub fn open(path: &Path) -> Result<Self, String> {
        // SAFETY: opening runs the library's initializers; plugin artifacts
        // run with the host's privileges.
        let library = unsafe { Library::new(path) }
            .map_err(|e| format!("failed to open {}: {e}", path.display()))?;

        Ok(Self {
            set_callbacks: symbol(&library, "plugin_set_host_callbacks")?,
            init: symbol(&library, "plugin_init")?,
            get_metadata: symbol(&library, "plugin_get_metadata")?,
            free_string: symbol(&library, "plugin_free_string")?,
            activate: symbol(&library, "plugin_activate")?,
            deactivate: symbol(&library, "plugin_deactivate")?,
            on_event: symbol(&library, "plugin_on_event")?,
            on_message: symbol(&library, "plugin_on_message")?,
            destroy: symbol(&library, "plugin_destroy").ok(),
            destroyed: false,
            _library: library,
        })
    }
}

impl NativeModule for DylibModule {
    fn set_host_callbacks(&mut self, callbacks: HostCallbacks) {
        // SAFETY: ABI-conforming export; callbacks are 'static functions.
        unsafe { (self.set_callbacks)(callbacks) }
    }

    fn init(&mut self, plugin_id: &str) -> i32 {
        let Ok(id) = CString::new(plugin_id) else {
            return -1;
        };
        // SAFETY: `id` outlives the call.
        unsafe { (self.init)(id.as_ptr()) }
    }

    fn metadata_json(&mut self) -> Option<String> {
        // SAFETY: the plugin returns a NUL-terminated string it owns, or null.
        unsafe {
            let ptr = (self.get_metadata)();
            if ptr.is_null() {
                return None;
            }
            let json = CStr::from_ptr(ptr).to_string_lossy().into_owned();
            (self.free_string)(ptr);
            Some(json)
        }
    }

    fn activate(&mut self) -> i32 {
        // SAFETY: ABI-conforming export.
        unsafe { (self.activate)() }
    }

    fn deactivate(&mut self) -> i32 {
        // SAFETY: ABI-conforming export.
        unsafe { (self.deactivate)() }
    }

    fn on_event(&mut self, event_json: &str) -> i32 {
        let Ok(json) = CString::new(event_json) else {
            return -1;
        };
        // SAFETY: `json` outlives the call.
        unsafe { (self.on_event)(json.as_ptr()) }
    }

    fn on_message(&mut self, from: &str, payload_json: &str) -> i32 {
        let (Ok(from), Ok(json)) = (CString::new(from), CString::new(payload_json)) else {
            return -1;
        };
        // SAFETY: both strings outlive the call.
        unsafe { (self.on_message)(from.as_ptr(), json.as_ptr()) }
    }

    fn destroy(&mut self) {
        if std::mem::replace(&mut self.destroyed, true) {
            return;
        }
        if let Some(destroy) = self.destroy {
            // SAFETY: ABI-conforming export, called at most once.
            unsafe { destroy() }
        }
    }
}

/// Routing state for callbacks issued by one native plugin.
struct NativeHost {
    gateway: Arc<dyn ServiceGateway>,
    runtime: Handle,
    next_call_id: AtomicU64,
}

/// Native plugins identify themselves by id in `call_service`; this table
/// maps that id back to the gateway. Entries carry a token so a stale worker
/// never removes its successor's entry.
static NATIVE_HOSTS: LazyLock<RwLock<HashMap<PluginId, (u64, Arc<NativeHost>)>>> =
    LazyLock::new(Default::default);

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Plugin owning the current worker thread, for log attribution.
    static CURRENT_PLUGIN: RefCell<Option<PluginId>> = const { RefCell::new(None) };
}

struct HostRegistration {
    plugin_id: PluginId,
    token: u64,
}

impl HostRegistration {
    fn install(plugin_id: &str, host: NativeHost) -> Self {
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        NATIVE_HOSTS
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin_id.to_string(), (token, Arc::new(host)));
        Self {
            plugin_id: plugin_id.to_string(),
            token,
        }
    }
}

impl Drop for HostRegistration {
    fn drop(&mut self) {
        let mut hosts = NATIVE_HOSTS.write().unwrap_or_else(PoisonError::into_inner);
        if hosts.get(&self.plugin_id).is_some_and(|(t, _)| *t == self.token) {
            hosts.remove(&self.plugin_id);
        }
    }
}

fn read_c_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null pointers from plugins are NUL-terminated per the ABI.
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

fn into_c_string(s: String) -> *mut c_char {
    CString::new(s)
        .map(CString::into_raw)
        .unwrap_or(std::ptr::null_mut())
}

extern "C" fn host_call_service(
    plugin_id: *const c_char,
    service: *const c_char,
    method: *const c_char,
    params: *const c_char,
) -> *mut c_char {
    let (Some(plugin_id), Some(service), Some(method)) =
        (read_c_str(plugin_id), read_c_str(service), read_c_str(method))
    else {
        return into_c_string(ServiceCallResponse::err(0, "null argument to call_service").to_json());
    };

    let params = match read_c_str(params) {
        None => Ok(Value::Null),
        Some(raw) => serde_json::from_str::<Value>(&raw),
    };

    let host = NATIVE_HOSTS
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&plugin_id)
        .map(|(_, h)| Arc::clone(h));

    let response = match (host, params) {
        (None, _) => ServiceCallResponse::err(0, ReefError::PluginNotFound(plugin_id).to_string()),
        (Some(_), Err(e)) => ServiceCallResponse::err(0, format!("invalid params JSON: {e}")),
        (Some(host), Ok(params)) => {
            let call_id = host.next_call_id.fetch_add(1, Ordering::Relaxed) + 1;
            let request = ServiceCallRequest::new(call_id, plugin_id, service, method, params);
            let outcome = host.runtime.block_on(host.gateway.call_service(request));
            ServiceCallResponse::from_result(call_id, outcome)
        }
    };
    into_c_string(response.to_json())
}

extern "C" fn host_free_memory(ptr: *mut c_void) {
    if !ptr.is_null() {
        // SAFETY: every pointer we hand out comes from `CString::into_raw`.
        drop(unsafe { CString::from_raw(ptr.cast::<c_char>()) });
    }
}

extern "C" fn host_log_message(level: i32, message: *const c_char) {
    let Some(message) = read_c_str(message) else {
        return;
    };
    let plugin = CURRENT_PLUGIN
        .with(|p| p.borrow().clone())
        .unwrap_or_else(|| "?".to_string());
    match level {
        0 => debug!(plugin = %plugin, "{message}"),
        1 => info!(plugin = %plugin, "{message}"),
        2 => warn!(plugin = %plugin, "{message}"),
        3 => error!(plugin = %plugin, "{message}"),
        _ => info!(plugin = %plugin, level, "{message}"),
    }
}

fn status(export: &str, code: i32) -> Result<(), String> {
    if code == 0 {
        Ok(())
    } else {
        Err(format!("{export} returned {code}"))
    }
}

fn handshake(module: &mut dyn NativeModule, plugin_id: &str) -> Result<PluginMetadata, String> {
    module.set_host_callbacks(HOST_CALLBACKS);
    status("plugin_init", module.init(plugin_id))?;
    let json = module
        .metadata_json()
        .ok_or_else(|| "plugin_get_metadata returned null".to_string())?;
    serde_json::from_str(&json).map_err(|e| format!("invalid metadata JSON: {e}"))
}

type Opener = Box<dyn FnOnce() -> Result<Box<dyn NativeModule>, String> + Send>;

fn run_worker(
    plugin_id: PluginId,
    open: Opener,
    host: NativeHost,
    mut commands: mpsc::UnboundedReceiver<Command>,
    ready: oneshot::Sender<Result<PluginMetadata, String>>,
    faults: FaultSink,
) {
    let _registration = HostRegistration::install(&plugin_id, host);
    CURRENT_PLUGIN.with(|p| *p.borrow_mut() = Some(plugin_id.clone()));

    let mut module = match open() {
        Ok(m) => m,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let metadata = match handshake(module.as_mut(), &plugin_id) {
        Ok(m) => m,
        Err(e) => {
            module.destroy();
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(metadata)).is_err() {
        // loader timed out and went away
        module.destroy();
        return;
    }

    while let Some(command) = commands.blocking_recv() {
        match command {
            Command::Activate(ack) => {
                let _ = ack.send(status("plugin_activate", module.activate()));
            }
            Command::Deactivate(ack) => {
                let _ = ack.send(status("plugin_deactivate", module.deactivate()));
            }
            Command::Event(event) => {
                let code = module.on_event(&event.to_json());
                if code != 0 {
                    faults.handler_error(format!(
                        "plugin_on_event returned {code} for {}",
                        event.tag()
                    ));
                }
            }
            Command::Message { from, payload } => {
                let code = module.on_message(&from, &payload.to_string());
                if code != 0 {
                    faults.handler_error(format!(
                        "plugin_on_message returned {code} for message from {from}"
                    ));
                }
            }
            Command::ServiceResponse(_) => {}
            Command::Destroy(ack) => {
                module.destroy();
                let _ = ack.send(());
                debug!(plugin = %plugin_id, "native worker exiting");
                return;
            }
        }
    }
    module.destroy();
}

/// Transport for a native plugin library.
#[derive(Debug)]
pub struct NativeTransport {
    pub(crate) worker: WorkerHandle,
}

impl NativeTransport {
    /// Opens the library at `path` and runs the init handshake.
    pub async fn load(
        plugin_id: &str,
        path: &Path,
        ctx: &HostContext,
    ) -> Result<(Self, PluginMetadata), ReefError> {
        let path = path.to_path_buf();
        Self::start(plugin_id, ctx, move || {
            DylibModule::open(&path).map(|m| Box::new(m) as Box<dyn NativeModule>)
        })
        .await
    }

    /// Starts a worker around any [`NativeModule`] produced by `open`.
    pub async fn start<F>(
        plugin_id: &str,
        ctx: &HostContext,
        open: F,
    ) -> Result<(Self, PluginMetadata), ReefError>
    where
        F: FnOnce() -> Result<Box<dyn NativeModule>, String> + Send + 'static,
    {
        let (worker, commands) = WorkerHandle::new(plugin_id);
        let (ready_tx, ready_rx) = oneshot::channel();
        let host = NativeHost {
            gateway: Arc::clone(&ctx.gateway),
            runtime: ctx.runtime.clone(),
            next_call_id: AtomicU64::new(0),
        };
        let faults = ctx.fault_sink(&worker);
        let id = plugin_id.to_string();

        std::thread::Builder::new()
            .name(format!("reef-native-{plugin_id}"))
            .spawn(move || run_worker(id, Box::new(open), host, commands, ready_tx, faults))
            .map_err(|e| ReefError::load_failure(plugin_id, format!("failed to spawn worker: {e}")))?;

        match ready_rx.await {
            Ok(Ok(metadata)) => {
                info!(plugin = %plugin_id, version = %metadata.version, "native plugin loaded");
                Ok((Self { worker }, metadata))
            }
            Ok(Err(reason)) => Err(ReefError::load_failure(plugin_id, reason)),
            Err(_) => Err(ReefError::load_failure(
                plugin_id,
                "worker exited during load",
            )),
        }
    }
}
