// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedded plugin that records every hook call for assertions in tests.
//!
//! A [`RecordingPlugin`] spec is cheap to clone and shares one [`CallLog`]
//! with every instance its factory creates, so a test keeps observing the
//! plugin after the registry has taken ownership of it.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reef_core::{CoreEvent, Permission, PluginMetadata};
use reef_transport::{EmbeddedCatalog, EmbeddedPlugin, HostHandle};
use serde_json::Value;
use tokio::sync::Notify;

/// One observed hook invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Init,
    Activate,
    Deactivate,
    Event(CoreEvent),
    Message { from: String, payload: Value },
    Destroy,
}

/// Shared view of what a recording plugin has seen.
#[derive(Clone, Default)]
pub struct CallLog {
    log: Arc<Mutex<Vec<Recorded>>>,
    host: Arc<Mutex<Option<HostHandle>>>,
    changed: Arc<Notify>,
}

impl std::fmt::Debug for CallLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallLog").field("calls", &self.calls()).finish()
    }
}

impl CallLog {
    fn record(&self, call: Recorded) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
        self.changed.notify_waiters();
    }

    /// Every hook call so far, in order.
    pub fn calls(&self) -> Vec<Recorded> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, pred: impl Fn(&Recorded) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn events(&self) -> Vec<CoreEvent> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Recorded::Event(ev) => Some(ev),
                _ => None,
            })
            .collect()
    }

    pub fn messages(&self) -> Vec<(String, Value)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Recorded::Message { from, payload } => Some((from, payload)),
                _ => None,
            })
            .collect()
    }

    /// Host handle given to the most recent instance at init.
    pub fn host(&self) -> Option<HostHandle> {
        self.host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Waits until `pred` holds for the call log, or two seconds pass.
    ///
    /// Events and messages are delivered by a worker, so tests poll for
    /// them instead of asserting right after dispatch.
    pub async fn wait_until(&self, pred: impl Fn(&[Recorded]) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let notified = self.changed.notified();
            if pred(&self.calls()) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return pred(&self.calls());
            }
        }
    }

    /// Gives the worker a moment to drain anything already queued.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Which hooks should fail, and how.
#[derive(Debug, Clone, Copy, Default)]
struct Failures {
    init: bool,
    activate: bool,
    events: bool,
    panic_on_event: bool,
    activate_delay: Option<Duration>,
}

/// Spec for an embedded plugin that records its hook calls.
#[derive(Debug, Clone)]
pub struct RecordingPlugin {
    metadata: PluginMetadata,
    failures: Failures,
    log: CallLog,
}

impl RecordingPlugin {
    /// A plugin with id `id`, version `1.0.0`, and no subscriptions.
    pub fn new(id: &str) -> Self {
        Self {
            metadata: PluginMetadata::new(id, format!("{id} (test)"), "1.0.0"),
            failures: Failures::default(),
            log: CallLog::default(),
        }
    }

    /// Subscribes to `tag` and declares the matching `EventSubscribe` permission.
    pub fn subscribe(mut self, tag: &str) -> Self {
        self.metadata.subscribed_events.insert(tag.to_string());
        let permission = if tag == "*" {
            Permission::EventSubscribeAll
        } else {
            Permission::EventSubscribe {
                events: vec![tag.to_string()],
            }
        };
        self.metadata.required_permissions.insert(permission);
        self
    }

    /// Subscribes to `tag` without declaring a permission for it.
    pub fn subscribe_only(mut self, tag: &str) -> Self {
        self.metadata.subscribed_events.insert(tag.to_string());
        self
    }

    pub fn permission(mut self, permission: &str) -> Self {
        match permission.parse() {
            Ok(p) => {
                self.metadata.required_permissions.insert(p);
            }
            Err(e) => panic!("test permission does not parse: {e}"),
        }
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.metadata.version = version.to_string();
        self
    }

    /// Reports a different id from the one it is loaded as.
    pub fn reported_id(mut self, id: &str) -> Self {
        self.metadata.id = id.to_string();
        self
    }

    pub fn fail_init(mut self) -> Self {
        self.failures.init = true;
        self
    }

    pub fn fail_activate(mut self) -> Self {
        self.failures.activate = true;
        self
    }

    /// Sleeps in the activate hook before answering.
    pub fn slow_activate(mut self, delay: Duration) -> Self {
        self.failures.activate_delay = Some(delay);
        self
    }

    pub fn fail_events(mut self) -> Self {
        self.failures.events = true;
        self
    }

    pub fn panic_on_event(mut self) -> Self {
        self.failures.panic_on_event = true;
        self
    }

    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }

    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    /// Registers a factory for this spec under `name` and returns its log.
    pub fn register(self, catalog: &EmbeddedCatalog, name: &str) -> CallLog {
        let log = self.log.clone();
        catalog.register(name, move || {
            Box::new(RecordingInstance {
                spec: self.clone(),
            }) as Box<dyn EmbeddedPlugin>
        });
        log
    }
}

struct RecordingInstance {
    spec: RecordingPlugin,
}

#[async_trait]
impl EmbeddedPlugin for RecordingInstance {
    async fn init(&mut self, _plugin_id: &str, host: HostHandle) -> Result<PluginMetadata, String> {
        let log = &self.spec.log;
        *log.host.lock().unwrap_or_else(PoisonError::into_inner) = Some(host);
        log.record(Recorded::Init);
        if self.spec.failures.init {
            return Err("init refused".into());
        }
        Ok(self.spec.metadata.clone())
    }

    async fn activate(&mut self) -> Result<(), String> {
        if let Some(delay) = self.spec.failures.activate_delay {
            tokio::time::sleep(delay).await;
        }
        self.spec.log.record(Recorded::Activate);
        if self.spec.failures.activate {
            return Err("activate refused".into());
        }
        Ok(())
    }

    async fn deactivate(&mut self) -> Result<(), String> {
        self.spec.log.record(Recorded::Deactivate);
        Ok(())
    }

    async fn on_event(&mut self, event: &CoreEvent) -> Result<(), String> {
        self.spec.log.record(Recorded::Event(event.clone()));
        if self.spec.failures.panic_on_event {
            panic!("event handler blew up");
        }
        if self.spec.failures.events {
            return Err(format!("cannot handle {}", event.tag()));
        }
        Ok(())
    }

    async fn on_message(&mut self, from: &str, payload: Value) -> Result<(), String> {
        self.spec.log.record(Recorded::Message {
            from: from.to_string(),
            payload,
        });
        Ok(())
    }

    async fn destroy(&mut self) {
        self.spec.log.record(Recorded::Destroy);
    }
}
