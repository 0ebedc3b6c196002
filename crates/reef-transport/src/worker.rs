// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command queue between a transport and the execution context it drives.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use reef_core::{CoreEvent, PluginId, ReefError, ServiceCallResponse};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

/// Completion of a lifecycle call, with the plugin's reason on failure.
pub(crate) type Ack = oneshot::Sender<Result<(), String>>;

/// One unit of work for a plugin worker, processed strictly in send order.
#[derive(Debug)]
pub(crate) enum Command {
    Activate(Ack),
    Deactivate(Ack),
    Event(Arc<CoreEvent>),
    Message { from: PluginId, payload: Value },
    /// Result of an asynchronous service call the guest issued earlier.
    ServiceResponse(ServiceCallResponse),
    Destroy(oneshot::Sender<()>),
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Sending half of a worker's queue.
#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    plugin_id: PluginId,
    generation: u64,
    tx: mpsc::UnboundedSender<Command>,
}

impl WorkerHandle {
    pub(crate) fn new(plugin_id: &str) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                plugin_id: plugin_id.to_string(),
                generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
                tx,
            },
            rx,
        )
    }

    pub(crate) fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Process-unique number of this worker; faults carry it.
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<Command> {
        self.tx.clone()
    }

    pub(crate) fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    fn gone(&self) -> ReefError {
        ReefError::transport(&self.plugin_id, "plugin worker is no longer running")
    }

    /// Enqueues without waiting. Used for events and messages.
    pub(crate) fn send(&self, command: Command) -> Result<(), ReefError> {
        self.tx.send(command).map_err(|_| self.gone())
    }

    /// Enqueues a lifecycle call and waits for the plugin's answer.
    pub(crate) async fn request(
        &self,
        make: impl FnOnce(Ack) -> Command,
        what: &str,
    ) -> Result<(), ReefError> {
        let (ack, done) = oneshot::channel();
        self.send(make(ack))?;
        match done.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(ReefError::transport(
                &self.plugin_id,
                format!("{what} failed: {reason}"),
            )),
            Err(_) => Err(self.gone()),
        }
    }

    /// Asks the worker to run the plugin's destroy hook and exit.
    ///
    /// A worker that already exited counts as destroyed.
    pub(crate) async fn destroy(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Destroy(ack)).is_ok() {
            let _ = done.await;
        }
    }
}
