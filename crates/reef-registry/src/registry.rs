// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The plugin registry: sole owner of plugin lifecycle state.
//!
//! All records live behind one `RwLock<IndexMap>` inside an `Arc<Registry>`.
//! The lock is never held across an await on a transport; lifecycle calls
//! clone the transport handle out first. Lifecycle operations on the same
//! id are serialized by a per-id guard and overlap fails with
//! [`ReefError::Busy`]; different ids proceed independently.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;
use reef_config::ReefConfig;
use reef_core::{
    ArtifactKind, CoreEvent, DomainEvent, PluginId, PluginMetadata, PluginSource, ReefError,
    ServiceCallRequest, TransportFault, plugin_id_from_filename,
};
use reef_router::{PermissionChecker, ServiceInfo, ServiceRouter};
use reef_transport::{EmbeddedCatalog, HostContext, Transport};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::blob::BlobStore;
use crate::dispatcher::{DispatchReport, convert};
use crate::gateway::RegistryGateway;
use crate::record::{PluginInfo, PluginRecord, PluginState};
use crate::state::StateStore;

/// Reserved service name plugins use for inter-plugin messaging.
pub const MESSAGING_SERVICE: &str = "plugins";

/// Reserved service name plugins use to raise custom events.
pub const EVENTS_SERVICE: &str = "events";

/// What to do when an upload collides with an earlier upload of the same id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Fail with [`ReefError::ConflictRequiresConfirmation`].
    #[default]
    Reject,
    /// Unload the older copy and delete its blob.
    Replace,
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub conflict: ConflictPolicy,
    /// Blob store key for uploaded artifacts.
    pub storage_id: Option<String>,
}

/// Outcome of a bulk load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub loaded: Vec<PluginId>,
    /// `(plugin id, reason)` for every artifact that failed.
    pub failed: Vec<(PluginId, String)>,
}

/// Read-only view of the whole registry.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub plugins: Vec<PluginInfo>,
    pub services: Vec<ServiceInfo>,
}

#[derive(Deserialize)]
struct MessageParams {
    to: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmitParams {
    event_type: String,
    #[serde(default)]
    data: Value,
}

/// Assembles a [`Registry`] from configuration and collaborators.
pub struct RegistryBuilder {
    config: ReefConfig,
    router: Option<Arc<ServiceRouter>>,
    state: Option<StateStore>,
    blobs: Option<Arc<dyn BlobStore>>,
    embedded: EmbeddedCatalog,
}

impl RegistryBuilder {
    pub fn new(config: &ReefConfig) -> Self {
        Self {
            config: config.clone(),
            router: None,
            state: None,
            blobs: None,
            embedded: EmbeddedCatalog::new(),
        }
    }

    pub fn router(mut self, router: Arc<ServiceRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn state_store(mut self, state: StateStore) -> Self {
        self.state = Some(state);
        self
    }

    pub fn blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn embedded(mut self, catalog: EmbeddedCatalog) -> Self {
        self.embedded = catalog;
        self
    }

    /// Builds the registry. Must run inside a tokio runtime.
    pub fn build(self) -> Result<Arc<Registry>, ReefError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            ReefError::Internal(format!("registry must be built inside a tokio runtime: {e}"))
        })?;
        let grantable = PermissionChecker::new(reef_config::grantable_permissions(&self.config));
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let plugins_cfg = self.config.plugins;

        Ok(Arc::new_cyclic(|weak| Registry {
            plugins: RwLock::new(IndexMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            faults: Mutex::new(faults_rx),
            router: self.router.unwrap_or_default(),
            grantable,
            context: HostContext {
                gateway: Arc::new(RegistryGateway {
                    registry: weak.clone(),
                }),
                faults: faults_tx,
                channel: self.config.channel,
                sandbox: self.config.sandbox,
                embedded: self.embedded,
                runtime,
            },
            state: self.state,
            blobs: self.blobs,
            lifecycle_timeout: plugins_cfg.lifecycle_timeout(),
            unload_grace: plugins_cfg.unload_grace(),
            builtin_overrides: plugins_cfg.builtin,
        }))
    }
}

/// Central coordinator for loaded plugins.
pub struct Registry {
    plugins: RwLock<IndexMap<PluginId, PluginRecord>>,
    in_flight: Mutex<HashSet<PluginId>>,
    faults: Mutex<mpsc::UnboundedReceiver<TransportFault>>,
    router: Arc<ServiceRouter>,
    /// What the host is willing to grant any plugin.
    grantable: PermissionChecker,
    context: HostContext,
    state: Option<StateStore>,
    blobs: Option<Arc<dyn BlobStore>>,
    lifecycle_timeout: Duration,
    unload_grace: Duration,
    builtin_overrides: BTreeMap<String, bool>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("router", &self.router)
            .field("lifecycle_timeout", &self.lifecycle_timeout)
            .finish_non_exhaustive()
    }
}

/// Marks a plugin id as having a lifecycle operation in flight.
struct OpGuard<'a> {
    registry: &'a Registry,
    id: PluginId,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.registry
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl Registry {
    pub fn builder(config: &ReefConfig) -> RegistryBuilder {
        RegistryBuilder::new(config)
    }

    pub fn router(&self) -> &Arc<ServiceRouter> {
        &self.router
    }

    pub fn embedded(&self) -> &EmbeddedCatalog {
        &self.context.embedded
    }

    fn begin(&self, id: &str) -> Result<OpGuard<'_>, ReefError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(id.to_string()) {
            return Err(ReefError::Busy(id.to_string()));
        }
        Ok(OpGuard {
            registry: self,
            id: id.to_string(),
        })
    }

    async fn bounded<T>(
        &self,
        limit: Duration,
        fut: impl Future<Output = Result<T, ReefError>>,
    ) -> Result<T, ReefError> {
        tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(ReefError::Timeout { duration: limit }))
    }

    /// Applies faults the transports reported since the last call.
    async fn apply_faults(&self) {
        let pending: Vec<TransportFault> = {
            let mut rx = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        if pending.is_empty() {
            return;
        }
        let mut plugins = self.plugins.write().await;
        for fault in pending {
            let Some(record) = plugins.get_mut(&fault.plugin_id) else {
                continue;
            };
            if record.transport.generation() != fault.generation {
                debug!(plugin = %fault.plugin_id, "dropping fault from an earlier load");
                continue;
            }
            if fault.fatal {
                warn!(plugin = %fault.plugin_id, error = %fault.message, "plugin marked faulted");
                record.faulted = Some(fault.message);
            } else {
                record.last_error = Some(fault.message);
            }
        }
    }

    // --- lifecycle ---

    /// Loads a plugin with default options.
    pub async fn load(
        &self,
        id: &str,
        artifact: &str,
        source: PluginSource,
    ) -> Result<PluginMetadata, ReefError> {
        self.load_with(id, artifact, source, LoadOptions::default()).await
    }

    /// Loads, validates, and registers a plugin under `id`.
    ///
    /// The plugin must report `id` as its own. On any error no record exists
    /// for `id` (unless one existed before and no conflict resolution
    /// removed it).
    pub async fn load_with(
        &self,
        id: &str,
        artifact: &str,
        source: PluginSource,
        options: LoadOptions,
    ) -> Result<PluginMetadata, ReefError> {
        let _guard = self.begin(id)?;
        self.resolve_conflict(id, source, &options).await?;
        let (transport, metadata) = self.start_transport(id, artifact).await?;
        self.admit(id, transport, metadata, artifact, source, options)
            .await
    }

    /// Loads an artifact found on disk, keyed by the id the plugin reports.
    ///
    /// The artifact starts under the id derived from its file name. A plugin
    /// that reports a different id is destroyed and loaded again under that
    /// id, so service calls, persisted state, and conflict checks all see the
    /// reported id.
    pub async fn load_discovered(
        &self,
        path: &Path,
        source: PluginSource,
        options: LoadOptions,
    ) -> Result<PluginMetadata, ReefError> {
        let artifact = path.to_string_lossy().into_owned();
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| artifact.clone());
        let provisional = plugin_id_from_filename(&file);

        let reported = {
            let _guard = self.begin(&provisional)?;
            let (transport, metadata) = self.start_transport(&provisional, &artifact).await?;
            if metadata.id == provisional {
                if let Err(e) = self.resolve_conflict(&provisional, source, &options).await {
                    transport.destroy().await;
                    return Err(e);
                }
                return self
                    .admit(&provisional, transport, metadata, &artifact, source, options)
                    .await;
            }
            transport.destroy().await;
            if let Err(reason) = metadata.validate() {
                return Err(ReefError::load_failure(&provisional, reason));
            }
            debug!(file = %file, plugin = %metadata.id, "plugin reports its own id, reloading under it");
            metadata.id
        };
        self.load_with(&reported, &artifact, source, options).await
    }

    /// Runs the transport's init handshake, bounded by the lifecycle timeout.
    async fn start_transport(
        &self,
        id: &str,
        artifact: &str,
    ) -> Result<(Transport, PluginMetadata), ReefError> {
        debug!(plugin = %id, artifact, "loading plugin");
        tokio::time::timeout(
            self.lifecycle_timeout,
            Transport::load(id, artifact, &self.context),
        )
        .await
        .map_err(|_| {
            ReefError::load_failure(
                id,
                format!("init handshake timed out after {:?}", self.lifecycle_timeout),
            )
        })?
    }

    /// Validates a started transport, activates it, and inserts its record.
    /// Caller holds the op guard for `id`.
    async fn admit(
        &self,
        id: &str,
        transport: Transport,
        metadata: PluginMetadata,
        artifact: &str,
        source: PluginSource,
        options: LoadOptions,
    ) -> Result<PluginMetadata, ReefError> {
        if let Err(reason) = self.check_metadata(id, &metadata) {
            transport.destroy().await;
            return Err(ReefError::load_failure(id, reason));
        }

        let enabled = self.initial_enabled(id, source).await;
        if enabled {
            let activated = self
                .bounded(self.lifecycle_timeout, transport.activate())
                .await;
            if let Err(e) = activated {
                transport.destroy().await;
                return Err(ReefError::load_failure(id, e.to_string()));
            }
        }

        let record = PluginRecord {
            grants: PermissionChecker::new(metadata.required_permissions.iter().cloned()),
            metadata: metadata.clone(),
            enabled,
            loaded: true,
            unloading: false,
            source,
            artifact: artifact.to_string(),
            storage_id: options.storage_id,
            faulted: None,
            last_error: None,
            transport: Arc::new(transport),
        };
        self.plugins.write().await.insert(id.to_string(), record);
        self.persist(id, source, enabled).await;

        info!(
            plugin = %id,
            version = %metadata.version,
            %source,
            enabled,
            "plugin loaded"
        );
        Ok(metadata)
    }

    fn check_metadata(&self, id: &str, metadata: &PluginMetadata) -> Result<(), String> {
        metadata.validate()?;
        if metadata.id != id {
            return Err(format!(
                "plugin reported id `{}` but was loaded as `{id}`",
                metadata.id
            ));
        }
        let denied = self.grantable.uncovered(&metadata.required_permissions);
        if !denied.is_empty() {
            let list: Vec<String> = denied.iter().map(|p| p.to_string()).collect();
            return Err(format!("permissions not grantable: {}", list.join(", ")));
        }

        let grants = PermissionChecker::new(metadata.required_permissions.iter().cloned());
        for tag in &metadata.subscribed_events {
            if tag != "*" && !grants.can_subscribe_event(tag) {
                warn!(plugin = %id, event = %tag, "subscription not covered by declared permissions");
            }
        }
        Ok(())
    }

    /// Persisted flag first, then the config override, then enabled.
    async fn initial_enabled(&self, id: &str, source: PluginSource) -> bool {
        if source != PluginSource::Builtin {
            return true;
        }
        let persisted = match &self.state {
            Some(state) => state.enabled(id).await.unwrap_or_else(|e| {
                warn!(plugin = %id, error = %e, "failed to read persisted state");
                None
            }),
            None => None,
        };
        persisted
            .or_else(|| self.builtin_overrides.get(id).copied())
            .unwrap_or(true)
    }

    async fn persist(&self, id: &str, source: PluginSource, enabled: bool) {
        if source != PluginSource::Builtin {
            return;
        }
        if let Some(state) = &self.state {
            if let Err(e) = state.set_enabled(id, enabled).await {
                warn!(plugin = %id, error = %e, "failed to persist plugin state");
            }
        }
    }

    async fn resolve_conflict(
        &self,
        id: &str,
        incoming: PluginSource,
        options: &LoadOptions,
    ) -> Result<(), ReefError> {
        let existing = {
            let plugins = self.plugins.read().await;
            plugins
                .get(id)
                .map(|r| (r.source, r.storage_id.clone()))
        };
        let Some((current, current_blob)) = existing else {
            return Ok(());
        };

        match (current, incoming) {
            (PluginSource::Builtin, PluginSource::Uploaded) => {
                info!(plugin = %id, "uploaded copy replaces builtin");
                self.teardown(id).await?;
                Ok(())
            }
            (PluginSource::Uploaded, PluginSource::Uploaded) => {
                if options.conflict != ConflictPolicy::Replace {
                    return Err(ReefError::ConflictRequiresConfirmation(id.to_string()));
                }
                info!(plugin = %id, "replacing earlier upload");
                self.teardown(id).await?;
                if let (Some(old), Some(blobs)) = (current_blob, &self.blobs) {
                    if options.storage_id.as_ref() != Some(&old) {
                        blobs.delete(&old).await?;
                    }
                }
                Ok(())
            }
            _ => Err(ReefError::AlreadyLoaded(id.to_string())),
        }
    }

    /// Quiesces and removes a record. Caller holds the op guard.
    async fn teardown(&self, id: &str) -> Result<PluginInfo, ReefError> {
        let (transport, was_live) = {
            let mut plugins = self.plugins.write().await;
            let record = plugins
                .get_mut(id)
                .ok_or_else(|| ReefError::PluginNotFound(id.to_string()))?;
            let was_live = record.is_live();
            record.unloading = true;
            (Arc::clone(&record.transport), was_live)
        };

        let quiesce = async {
            if was_live {
                if let Err(e) = transport.deactivate().await {
                    warn!(plugin = %id, error = %e, "deactivate failed during unload");
                }
            }
            transport.destroy().await;
        };
        if tokio::time::timeout(self.unload_grace, quiesce).await.is_err() {
            warn!(plugin = %id, grace = ?self.unload_grace, "plugin did not stop within grace period");
        }

        self.plugins
            .write()
            .await
            .shift_remove(id)
            .map(|r| r.info())
            .ok_or_else(|| ReefError::PluginNotFound(id.to_string()))
    }

    /// Deactivates and destroys a plugin, then removes its record.
    ///
    /// The record is removed even if cleanup fails or exceeds the grace period.
    pub async fn unload(&self, id: &str) -> Result<(), ReefError> {
        let _guard = self.begin(id)?;
        self.teardown(id).await?;
        info!(plugin = %id, "plugin unloaded");
        Ok(())
    }

    /// Unloads every plugin, newest first.
    pub async fn unload_all(&self) {
        let ids: Vec<PluginId> = self.plugins.read().await.keys().rev().cloned().collect();
        for id in ids {
            if let Err(e) = self.unload(&id).await {
                warn!(plugin = %id, error = %e, "unload failed");
            }
        }
    }

    /// Enables a plugin. Returns `false` if it was already enabled.
    pub async fn enable(&self, id: &str) -> Result<bool, ReefError> {
        let _guard = self.begin(id)?;
        self.apply_faults().await;
        let (transport, source) = {
            let plugins = self.plugins.read().await;
            let record = plugins
                .get(id)
                .ok_or_else(|| ReefError::PluginNotFound(id.to_string()))?;
            if let Some(fault) = &record.faulted {
                return Err(ReefError::transport(id, format!("plugin is faulted: {fault}")));
            }
            if record.enabled {
                return Ok(false);
            }
            (Arc::clone(&record.transport), record.source)
        };

        self.bounded(self.lifecycle_timeout, transport.activate())
            .await?;
        if let Some(record) = self.plugins.write().await.get_mut(id) {
            record.enabled = true;
        }
        self.persist(id, source, true).await;
        info!(plugin = %id, "plugin enabled");
        Ok(true)
    }

    /// Disables a plugin. Returns `false` if it was already disabled.
    ///
    /// The plugin stops receiving events and issuing calls even if its
    /// deactivate hook fails.
    pub async fn disable(&self, id: &str) -> Result<bool, ReefError> {
        let _guard = self.begin(id)?;
        self.apply_faults().await;
        let (transport, source, faulted) = {
            let mut plugins = self.plugins.write().await;
            let record = plugins
                .get_mut(id)
                .ok_or_else(|| ReefError::PluginNotFound(id.to_string()))?;
            if !record.enabled {
                return Ok(false);
            }
            record.enabled = false;
            (
                Arc::clone(&record.transport),
                record.source,
                record.faulted.is_some(),
            )
        };

        if !faulted {
            if let Err(e) = self
                .bounded(self.lifecycle_timeout, transport.deactivate())
                .await
            {
                warn!(plugin = %id, error = %e, "deactivate failed");
            }
        }
        self.persist(id, source, false).await;
        info!(plugin = %id, "plugin disabled");
        Ok(true)
    }

    // --- events ---

    /// Converts a domain event and delivers the result.
    pub async fn dispatch(&self, event: DomainEvent) -> DispatchReport {
        let mut report = DispatchReport::default();
        for core in convert(event) {
            report.merge(self.emit(core).await);
        }
        report
    }

    /// Delivers an already converted event to every matching live plugin.
    pub async fn emit(&self, event: CoreEvent) -> DispatchReport {
        self.emit_from(None, event).await
    }

    /// Like [`Registry::emit`], but never delivers back to `sender`.
    pub async fn emit_from(&self, sender: Option<&str>, event: CoreEvent) -> DispatchReport {
        self.apply_faults().await;
        let event = Arc::new(event);
        let tag = event.tag().to_string();
        let mut report = DispatchReport::default();

        {
            let plugins = self.plugins.read().await;
            for (id, record) in plugins.iter() {
                if sender == Some(id.as_str())
                    || !record.is_live()
                    || !record.metadata.subscribes_to(&tag)
                    || !record.grants.can_subscribe_event(&tag)
                {
                    continue;
                }
                match record.transport.dispatch_event(Arc::clone(&event)) {
                    Ok(()) => report.delivered.push(id.clone()),
                    Err(e) => {
                        warn!(plugin = %id, event = %tag, error = %e, "event delivery failed");
                        report.failed.push(id.clone());
                    }
                }
            }
        }

        if !report.failed.is_empty() {
            let mut plugins = self.plugins.write().await;
            for id in &report.failed {
                if let Some(record) = plugins.get_mut(id) {
                    record
                        .faulted
                        .get_or_insert_with(|| "plugin worker is no longer running".into());
                }
            }
        }
        debug!(event = %tag, delivered = report.delivered.len(), "event dispatched");
        report
    }

    // --- calls from plugins ---

    async fn caller_grants(&self, id: &str) -> Result<PermissionChecker, ReefError> {
        let plugins = self.plugins.read().await;
        let record = plugins
            .get(id)
            .ok_or_else(|| ReefError::PluginNotFound(id.to_string()))?;
        if let Some(fault) = &record.faulted {
            return Err(ReefError::transport(id, format!("plugin is faulted: {fault}")));
        }
        if !record.is_live() {
            return Err(ReefError::PluginDisabled(id.to_string()));
        }
        Ok(record.grants.clone())
    }

    /// Entry point for service calls issued by plugins.
    ///
    /// Unknown, disabled, or faulted callers are rejected before routing, and
    /// the caller's declared permissions gate the call.
    pub async fn handle_service_call(
        &self,
        request: ServiceCallRequest,
    ) -> Result<Value, ReefError> {
        self.apply_faults().await;
        let grants = self.caller_grants(&request.plugin_id).await?;
        debug!(
            plugin = %request.plugin_id,
            service = %request.service,
            method = %request.method,
            "service call"
        );

        match request.service.as_str() {
            MESSAGING_SERVICE => self.messaging_call(request).await,
            EVENTS_SERVICE => self.events_call(request).await,
            _ => self.router.call_as(&grants, request).await,
        }
    }

    /// `events.emit` with `{eventType, data}`: raises a `Custom` event for
    /// every other subscriber. Returns the ids it was delivered to.
    async fn events_call(&self, request: ServiceCallRequest) -> Result<Value, ReefError> {
        if request.method != "emit" {
            return Err(ReefError::MethodNotFound {
                service: request.service,
                method: request.method,
            });
        }
        let params: EmitParams =
            serde_json::from_value(request.params).map_err(|e| ReefError::HandlerError {
                service: EVENTS_SERVICE.into(),
                method: "emit".into(),
                message: format!("invalid params: {e}"),
            })?;
        if params.event_type.trim().is_empty() {
            return Err(ReefError::HandlerError {
                service: EVENTS_SERVICE.into(),
                method: "emit".into(),
                message: "eventType must not be empty".into(),
            });
        }
        let event = CoreEvent::Custom {
            event_type: params.event_type,
            data: params.data,
        };
        let report = self.emit_from(Some(&request.plugin_id), event).await;
        Ok(serde_json::json!({ "delivered": report.delivered }))
    }

    async fn messaging_call(&self, request: ServiceCallRequest) -> Result<Value, ReefError> {
        if request.method != "send_message" {
            return Err(ReefError::MethodNotFound {
                service: request.service,
                method: request.method,
            });
        }
        let params: MessageParams =
            serde_json::from_value(request.params).map_err(|e| ReefError::HandlerError {
                service: MESSAGING_SERVICE.into(),
                method: "send_message".into(),
                message: format!("invalid params: {e}"),
            })?;
        self.send_message(&request.plugin_id, &params.to, params.payload)
            .await?;
        Ok(Value::Null)
    }

    /// Delivers a message from one plugin to another.
    ///
    /// The sender needs `PluginCommunication` (or a `PluginCommunicationWith`
    /// naming the target); the target must be live.
    pub async fn send_message(&self, from: &str, to: &str, payload: Value) -> Result<(), ReefError> {
        self.apply_faults().await;
        let grants = self.caller_grants(from).await?;
        if !grants.can_message(to) {
            return Err(ReefError::PermissionDenied {
                plugin: from.to_string(),
                action: format!("message plugin '{to}'"),
            });
        }
        let transport = {
            let plugins = self.plugins.read().await;
            let record = plugins
                .get(to)
                .ok_or_else(|| ReefError::PluginNotFound(to.to_string()))?;
            if let Some(fault) = &record.faulted {
                return Err(ReefError::transport(to, format!("plugin is faulted: {fault}")));
            }
            if !record.is_live() {
                return Err(ReefError::PluginDisabled(to.to_string()));
            }
            Arc::clone(&record.transport)
        };
        transport.send_message(from, payload)
    }

    // --- uploads and bulk loading ---

    fn blob_store(&self) -> Result<Arc<dyn BlobStore>, ReefError> {
        self.blobs
            .clone()
            .ok_or_else(|| ReefError::Config("no blob store configured for uploads".into()))
    }

    /// Stores an uploaded artifact and loads it.
    ///
    /// The plugin is registered under the id it reports, and the blob's
    /// sidecar is relabelled to match. The blob is deleted again if the load
    /// fails.
    pub async fn install_upload(
        &self,
        filename: &str,
        bytes: &[u8],
        policy: ConflictPolicy,
    ) -> Result<PluginMetadata, ReefError> {
        let blobs = self.blob_store()?;

        // Saving overwrites a blob of the same name, so settle that conflict first.
        let holder = self.list().await.into_iter().find(|p| {
            p.source == PluginSource::Uploaded && p.storage_id.as_deref() == Some(filename)
        });
        if let Some(existing) = holder {
            if policy != ConflictPolicy::Replace {
                return Err(ReefError::ConflictRequiresConfirmation(existing.id));
            }
            self.unload(&existing.id).await?;
            blobs.delete(filename).await?;
        }

        let blob = blobs.save(filename, bytes).await?;
        let path = blobs.path_of(blob.storage_id());
        let options = LoadOptions {
            conflict: policy,
            storage_id: Some(blob.storage_id().to_string()),
        };
        match self
            .load_discovered(&path, PluginSource::Uploaded, options)
            .await
        {
            Ok(metadata) => {
                if metadata.id != blob.id {
                    if let Err(e) = blobs.relabel(blob.storage_id(), &metadata.id).await {
                        warn!(plugin = %metadata.id, error = %e, "failed to relabel upload");
                    }
                }
                Ok(metadata)
            }
            Err(e) => {
                if let Err(cleanup) = blobs.delete(blob.storage_id()).await {
                    warn!(plugin = %blob.id, error = %cleanup, "failed to delete rejected upload");
                }
                Err(e)
            }
        }
    }

    /// Unloads an uploaded plugin and deletes its blob.
    pub async fn remove_upload(&self, id: &str) -> Result<(), ReefError> {
        let blobs = self.blob_store()?;
        let storage_id = match self.get(id).await {
            Some(info) if info.source == PluginSource::Uploaded => {
                self.unload(id).await?;
                info.storage_id
            }
            Some(_) => return Err(ReefError::PluginNotFound(format!("{id} (not an upload)"))),
            None => None,
        };

        let storage_id = match storage_id {
            Some(s) => s,
            None => blobs
                .list()
                .await?
                .into_iter()
                .find(|b| b.id == id)
                .map(|b| b.filename)
                .ok_or_else(|| ReefError::PluginNotFound(id.to_string()))?,
        };
        blobs.delete(&storage_id).await?;
        info!(plugin = %id, "upload removed");
        Ok(())
    }

    /// Loads every upload found in the blob store.
    pub async fn restore_uploaded(&self) -> Result<LoadSummary, ReefError> {
        let blobs = self.blob_store()?;
        let mut summary = LoadSummary::default();
        for blob in blobs.list().await? {
            let path = blobs.path_of(blob.storage_id());
            let options = LoadOptions {
                conflict: ConflictPolicy::Reject,
                storage_id: Some(blob.storage_id().to_string()),
            };
            let outcome = self
                .load_discovered(&path, PluginSource::Uploaded, options)
                .await;
            if let Ok(metadata) = &outcome {
                if metadata.id != blob.id {
                    if let Err(e) = blobs.relabel(blob.storage_id(), &metadata.id).await {
                        warn!(plugin = %metadata.id, error = %e, "failed to relabel upload");
                    }
                }
            }
            self.record_outcome(&mut summary, &blob.id, outcome);
        }
        Ok(summary)
    }

    /// Loads every plugin artifact in `dir` as a builtin.
    pub async fn load_builtin_dir(&self, dir: &Path) -> Result<LoadSummary, ReefError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "no builtin plugin directory");
                return Ok(LoadSummary::default());
            }
            Err(e) => {
                return Err(ReefError::Storage {
                    source: Box::new(e),
                });
            }
        };

        let mut artifacts = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| ReefError::Storage {
            source: Box::new(e),
        })? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if matches!(
                ArtifactKind::detect(&name),
                Some(ArtifactKind::Native | ArtifactKind::Wasm)
            ) {
                artifacts.push((name, path));
            }
        }
        artifacts.sort();

        let mut summary = LoadSummary::default();
        for (name, path) in artifacts {
            let outcome = self
                .load_discovered(&path, PluginSource::Builtin, LoadOptions::default())
                .await;
            self.record_outcome(&mut summary, &plugin_id_from_filename(&name), outcome);
        }
        Ok(summary)
    }

    /// Loaded plugins are listed by their reported id, failures by `file_id`.
    fn record_outcome(
        &self,
        summary: &mut LoadSummary,
        file_id: &str,
        outcome: Result<PluginMetadata, ReefError>,
    ) {
        match outcome {
            Ok(metadata) => summary.loaded.push(metadata.id),
            Err(e) => {
                warn!(plugin = %file_id, error = %e, "plugin failed to load");
                summary.failed.push((file_id.to_string(), e.to_string()));
            }
        }
    }

    // --- read-only views ---

    pub async fn get(&self, id: &str) -> Option<PluginInfo> {
        self.apply_faults().await;
        self.plugins.read().await.get(id).map(PluginRecord::info)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.plugins.read().await.contains_key(id)
    }

    /// All plugins in load order.
    pub async fn list(&self) -> Vec<PluginInfo> {
        self.apply_faults().await;
        self.plugins
            .read()
            .await
            .values()
            .map(PluginRecord::info)
            .collect()
    }

    pub async fn state_of(&self, id: &str) -> Option<PluginState> {
        self.get(id).await.map(|info| info.state)
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            plugins: self.list().await,
            services: self.router.list_services(),
        }
    }
}
