// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Assembly of the registry, router, and stores from configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reef_config::ReefConfig;
use reef_core::{DomainEvent, ReefError};
use reef_registry::{DirBlobStore, Registry, StateStore};
use reef_router::ServiceRouter;
use tokio::sync::mpsc;
use tracing::debug;

use crate::services::MarkerService;

/// A fully wired host.
pub struct Host {
    pub registry: Arc<Registry>,
    pub blobs: Arc<DirBlobStore>,
    pub state: StateStore,
    /// Domain events raised by host services.
    pub events: mpsc::UnboundedReceiver<DomainEvent>,
}

/// Expands a leading `~/` to the home directory.
pub fn expand_path(raw: &str) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => std::env::var_os("HOME")
            .map(|home| Path::new(&home).join(rest))
            .unwrap_or_else(|| PathBuf::from(raw)),
        None => PathBuf::from(raw),
    }
}

/// Opens the stores and builds a registry with the builtin host services.
pub async fn build_host(config: &ReefConfig) -> Result<Host, ReefError> {
    let state_path = expand_path(&config.plugins.state_db);
    let upload_dir = expand_path(&config.plugins.upload_dir);
    debug!(state = %state_path.display(), uploads = %upload_dir.display(), "opening stores");

    let state = StateStore::open(&state_path).await?;
    let blobs = Arc::new(DirBlobStore::new(upload_dir));

    let (events_tx, events) = mpsc::unbounded_channel();
    let router = Arc::new(ServiceRouter::new());
    router.register(Arc::new(MarkerService::new(Some(events_tx))));

    let registry = Registry::builder(config)
        .router(router)
        .state_store(state.clone())
        .blob_store(blobs.clone())
        .build()?;

    Ok(Host {
        registry,
        blobs,
        state,
        events,
    })
}
