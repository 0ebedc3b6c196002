// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test harness for registry-level integration testing.
//!
//! `TestHarness` assembles a registry with an in-memory state store, a
//! temp-dir blob store, an embedded catalog, and a service router, so tests
//! can load recording plugins and drive the whole host without artifacts
//! on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reef_config::ReefConfig;
use reef_core::{PluginMetadata, PluginSource, ReefError};
use reef_registry::{DirBlobStore, Registry, StateStore};
use reef_router::{ServiceHandler, ServiceRouter};
use reef_transport::EmbeddedCatalog;

use crate::recording::{CallLog, RecordingPlugin};

/// Builder for creating test environments with configurable options.
pub struct TestHarnessBuilder {
    config: ReefConfig,
    state: Option<StateStore>,
    upload_dir: Option<PathBuf>,
    services: Vec<Arc<dyn ServiceHandler>>,
}

impl TestHarnessBuilder {
    fn new() -> Self {
        Self {
            config: ReefConfig::default(),
            state: None,
            upload_dir: None,
            services: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: ReefConfig) -> Self {
        self.config = config;
        self
    }

    /// Restrict what the host is willing to grant.
    pub fn with_grantable(mut self, permissions: &[&str]) -> Self {
        self.config.plugins.grantable = permissions.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_builtin_override(mut self, id: &str, enabled: bool) -> Self {
        self.config.plugins.builtin.insert(id.to_string(), enabled);
        self
    }

    pub fn with_lifecycle_timeout_ms(mut self, ms: u64) -> Self {
        self.config.plugins.lifecycle_timeout_ms = ms;
        self
    }

    /// Reuse a state store, e.g. to simulate a restart.
    pub fn with_state(mut self, state: StateStore) -> Self {
        self.state = Some(state);
        self
    }

    /// Reuse an upload directory, e.g. to simulate a restart.
    pub fn with_upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = Some(dir.into());
        self
    }

    pub fn with_service(mut self, service: Arc<dyn ServiceHandler>) -> Self {
        self.services.push(service);
        self
    }

    /// Build the harness. Must be called inside a tokio runtime.
    pub async fn build(self) -> Result<TestHarness, ReefError> {
        let temp_dir = tempfile::TempDir::new().map_err(|e| ReefError::Storage {
            source: Box::new(e),
        })?;
        let upload_dir = self
            .upload_dir
            .unwrap_or_else(|| temp_dir.path().join("uploads"));

        let state = match self.state {
            Some(state) => state,
            None => StateStore::open_in_memory().await?,
        };
        let blobs = Arc::new(DirBlobStore::new(upload_dir));

        let router = Arc::new(ServiceRouter::new());
        for service in self.services {
            router.register(service);
        }
        let catalog = EmbeddedCatalog::new();

        let registry = Registry::builder(&self.config)
            .router(Arc::clone(&router))
            .state_store(state.clone())
            .blob_store(blobs.clone())
            .embedded(catalog.clone())
            .build()?;

        Ok(TestHarness {
            registry,
            catalog,
            router,
            state,
            blobs,
            config: self.config,
            temp_dir,
        })
    }
}

/// A complete host environment with temp storage.
pub struct TestHarness {
    pub registry: Arc<Registry>,
    pub catalog: EmbeddedCatalog,
    pub router: Arc<ServiceRouter>,
    pub state: StateStore,
    pub blobs: Arc<DirBlobStore>,
    pub config: ReefConfig,
    temp_dir: tempfile::TempDir,
}

impl TestHarness {
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::new()
    }

    /// Scratch directory that lives as long as the harness.
    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn upload_dir(&self) -> &Path {
        self.blobs.dir()
    }

    /// Registers `plugin` in the catalog under `id` and loads it as `embedded:<id>`.
    pub async fn load(
        &self,
        id: &str,
        plugin: RecordingPlugin,
        source: PluginSource,
    ) -> Result<(CallLog, PluginMetadata), ReefError> {
        let log = plugin.register(&self.catalog, id);
        let metadata = self
            .registry
            .load(id, &format!("embedded:{id}"), source)
            .await?;
        Ok((log, metadata))
    }

    /// Loads an external recording plugin and returns its log.
    pub async fn load_external(
        &self,
        id: &str,
        plugin: RecordingPlugin,
    ) -> Result<CallLog, ReefError> {
        self.load(id, plugin, PluginSource::External)
            .await
            .map(|(log, _)| log)
    }
}
