// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test utilities for Reef integration tests.
//!
//! # Components
//!
//! - [`RecordingPlugin`] - Embedded plugin that records hook calls and can be told to fail
//! - [`TestHarness`] - Registry with in-memory state, temp blob store, and embedded catalog

pub mod harness;
pub mod recording;

pub use harness::{TestHarness, TestHarnessBuilder};
pub use recording::{CallLog, Recorded, RecordingPlugin};

#[cfg(test)]
mod tests {
    use super::*;
    use reef_core::{CoreEvent, PluginSource};

    #[tokio::test]
    async fn harness_loads_recording_plugin() {
        let harness = TestHarness::builder().build().await.unwrap();
        let (log, meta) = harness
            .load("echo", RecordingPlugin::new("echo"), PluginSource::External)
            .await
            .unwrap();

        assert_eq!(meta.id, "echo");
        assert_eq!(log.calls(), vec![Recorded::Init, Recorded::Activate]);
        assert!(log.host().is_some());
    }

    #[tokio::test]
    async fn subscribe_declares_permission() {
        let spec = RecordingPlugin::new("p").subscribe("ItemSelected");
        let meta = spec.metadata();
        assert!(meta.subscribes_to("ItemSelected"));
        assert_eq!(meta.required_permissions.len(), 1);
    }

    #[tokio::test]
    async fn wait_until_sees_worker_delivery() {
        let harness = TestHarness::builder().build().await.unwrap();
        let log = harness
            .load_external("p", RecordingPlugin::new("p").subscribe("SystemReady"))
            .await
            .unwrap();

        harness.registry.emit(CoreEvent::SystemReady).await;
        assert!(log.wait_until(|c| c.contains(&Recorded::Event(CoreEvent::SystemReady))).await);
    }
}
