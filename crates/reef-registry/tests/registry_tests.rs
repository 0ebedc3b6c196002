// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests for plugin lifecycle, event fan-out, call gating, and
//! persistence through the registry.
//!
//! Each test builds an isolated TestHarness with in-memory state and a temp
//! blob store. Plugins are embedded recording plugins unless noted.

use std::sync::Arc;
use std::time::Duration;

use reef_core::{CoreEvent, DomainEvent, ErrorKind, PluginSource, ReefError};
use reef_registry::{
    BlobStore, ConflictPolicy, EVENTS_SERVICE, LoadOptions, MESSAGING_SERVICE, PluginState,
};
use reef_router::{FnService, HandlerFailure, MethodInfo, ServiceHandler};
use serde_json::Value;
use reef_test_utils::{Recorded, RecordingPlugin, TestHarness};
use serde_json::json;
use tokio::sync::Notify;

async fn harness() -> TestHarness {
    TestHarness::builder().build().await.unwrap()
}

fn clock_service() -> Arc<FnService> {
    Arc::new(
        FnService::new("clock")
            .method(MethodInfo::new("now", "current time"), |_| Ok(json!(1_700_000_000)))
            .method(MethodInfo::new("fail", "always fails"), |_| {
                Err(HandlerFailure::Failed("clock is broken".into()))
            }),
    )
}

/// A service whose only method parks until released.
struct GateService {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait::async_trait]
impl ServiceHandler for GateService {
    fn name(&self) -> &str {
        "gate"
    }

    fn methods(&self) -> Vec<MethodInfo> {
        vec![MethodInfo::new("wait", "returns once released")]
    }

    async fn call(&self, _method: &str, _params: Value) -> Result<Value, HandlerFailure> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(json!("released"))
    }
}

/// Polls the registry until `id` reaches `state`.
async fn wait_for_state(h: &TestHarness, id: &str, state: PluginState) -> bool {
    for _ in 0..100 {
        if h.registry.state_of(id).await == Some(state) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Polls the registry until `id` has recorded a handler error.
async fn wait_for_last_error(h: &TestHarness, id: &str) -> Option<String> {
    for _ in 0..100 {
        if let Some(err) = h.registry.get(id).await.and_then(|i| i.last_error) {
            return Some(err);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}

// ---- Lifecycle ----

#[tokio::test]
async fn load_registers_enabled_plugin() {
    let h = harness().await;
    let log = h.load_external("alpha", RecordingPlugin::new("alpha")).await.unwrap();

    let info = h.registry.get("alpha").await.unwrap();
    assert_eq!(info.state, PluginState::Enabled);
    assert!(info.loaded);
    assert_eq!(info.source, PluginSource::External);
    assert_eq!(log.calls(), vec![Recorded::Init, Recorded::Activate]);
}

#[tokio::test]
async fn duplicate_id_is_rejected() {
    let h = harness().await;
    h.load_external("alpha", RecordingPlugin::new("alpha")).await.unwrap();

    let err = h
        .load_external("alpha", RecordingPlugin::new("alpha"))
        .await
        .unwrap_err();
    assert!(matches!(err, ReefError::AlreadyLoaded(ref id) if id == "alpha"), "{err}");
    assert_eq!(h.registry.list().await.len(), 1);
}

#[tokio::test]
async fn unload_removes_record_and_destroys_plugin() {
    let h = harness().await;
    let log = h.load_external("alpha", RecordingPlugin::new("alpha")).await.unwrap();

    h.registry.unload("alpha").await.unwrap();

    assert!(h.registry.get("alpha").await.is_none());
    assert!(!h.registry.contains("alpha").await);
    assert_eq!(
        log.calls(),
        vec![
            Recorded::Init,
            Recorded::Activate,
            Recorded::Deactivate,
            Recorded::Destroy
        ]
    );
}

#[tokio::test]
async fn unload_unknown_plugin_is_not_found() {
    let h = harness().await;
    let err = h.registry.unload("ghost").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PluginNotFound);
}

#[tokio::test]
async fn enable_and_disable_are_idempotent() {
    let h = harness().await;
    let log = h.load_external("alpha", RecordingPlugin::new("alpha")).await.unwrap();

    assert!(!h.registry.enable("alpha").await.unwrap());
    assert!(h.registry.disable("alpha").await.unwrap());
    assert!(!h.registry.disable("alpha").await.unwrap());
    assert_eq!(h.registry.state_of("alpha").await, Some(PluginState::Disabled));
    assert!(h.registry.enable("alpha").await.unwrap());
    assert!(!h.registry.enable("alpha").await.unwrap());

    assert_eq!(log.count(|c| *c == Recorded::Activate), 2);
    assert_eq!(log.count(|c| *c == Recorded::Deactivate), 1);
}

#[tokio::test]
async fn failed_init_leaves_no_record() {
    let h = harness().await;
    let err = h
        .load_external("alpha", RecordingPlugin::new("alpha").fail_init())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::LoadFailure);
    assert!(h.registry.get("alpha").await.is_none());
}

#[tokio::test]
async fn failed_activate_destroys_and_leaves_no_record() {
    let h = harness().await;
    let spec = RecordingPlugin::new("alpha").fail_activate();
    let log = spec.call_log();
    let err = h.load_external("alpha", spec).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::LoadFailure);
    assert!(err.to_string().contains("activate refused"), "{err}");
    assert!(h.registry.get("alpha").await.is_none());
    assert_eq!(log.calls().last(), Some(&Recorded::Destroy));
}

#[tokio::test]
async fn explicit_load_requires_matching_reported_id() {
    let h = harness().await;
    let spec = RecordingPlugin::new("alpha").reported_id("beta");
    let log = spec.call_log();
    let err = h.load_external("alpha", spec).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::LoadFailure);
    assert!(err.to_string().contains("beta"), "{err}");
    assert!(h.registry.get("alpha").await.is_none());
    assert_eq!(log.calls().last(), Some(&Recorded::Destroy));
}

#[tokio::test]
async fn invalid_version_fails_load() {
    let h = harness().await;
    let err = h
        .load_external("alpha", RecordingPlugin::new("alpha").version("latest"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("semver"), "{err}");
}

#[tokio::test]
async fn ungrantable_permission_fails_load() {
    let h = TestHarness::builder()
        .with_grantable(&["EventSubscribeAll", "ServiceAccess:clock:now"])
        .build()
        .await
        .unwrap();

    let err = h
        .load_external(
            "alpha",
            RecordingPlugin::new("alpha").permission("PluginCommunication"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LoadFailure);
    assert!(err.to_string().contains("PluginCommunication"), "{err}");

    // a narrower request inside the grantable set is fine
    h.load_external(
        "beta",
        RecordingPlugin::new("beta").permission("ServiceAccess:clock:now"),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn slow_activate_past_lifecycle_timeout_fails_load() {
    let h = TestHarness::builder()
        .with_lifecycle_timeout_ms(100)
        .build()
        .await
        .unwrap();

    let err = h
        .load_external(
            "slow",
            RecordingPlugin::new("slow").slow_activate(Duration::from_millis(500)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LoadFailure);
    assert!(h.registry.get("slow").await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_lifecycle_ops_on_same_id_are_busy() {
    let h = harness().await;
    RecordingPlugin::new("slow")
        .slow_activate(Duration::from_millis(400))
        .register(&h.catalog, "slow");

    let registry = Arc::clone(&h.registry);
    let first = tokio::spawn(async move {
        registry
            .load("slow", "embedded:slow", PluginSource::External)
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = h
        .registry
        .load("slow", "embedded:slow", PluginSource::External)
        .await
        .unwrap_err();
    assert!(matches!(err, ReefError::Busy(_)), "{err}");
    let err = h.registry.unload("slow").await.unwrap_err();
    assert!(matches!(err, ReefError::Busy(_)), "{err}");

    // other ids are unaffected
    h.load_external("other", RecordingPlugin::new("other")).await.unwrap();

    first.await.unwrap().unwrap();
    assert_eq!(h.registry.state_of("slow").await, Some(PluginState::Enabled));
}

#[tokio::test]
async fn unload_all_empties_registry() {
    let h = harness().await;
    let a = h.load_external("a", RecordingPlugin::new("a")).await.unwrap();
    let b = h.load_external("b", RecordingPlugin::new("b")).await.unwrap();

    h.registry.unload_all().await;

    assert!(h.registry.list().await.is_empty());
    assert_eq!(a.calls().last(), Some(&Recorded::Destroy));
    assert_eq!(b.calls().last(), Some(&Recorded::Destroy));
}

// ---- Source conflicts ----

#[tokio::test]
async fn upload_replaces_builtin() {
    let h = harness().await;
    let (builtin, _) = h
        .load("dup", RecordingPlugin::new("dup"), PluginSource::Builtin)
        .await
        .unwrap();

    let uploaded = RecordingPlugin::new("dup").version("2.0.0");
    uploaded.register(&h.catalog, "dup-v2");
    h.registry
        .load("dup", "embedded:dup-v2", PluginSource::Uploaded)
        .await
        .unwrap();

    let info = h.registry.get("dup").await.unwrap();
    assert_eq!(info.source, PluginSource::Uploaded);
    assert_eq!(info.metadata.version, "2.0.0");
    assert_eq!(builtin.calls().last(), Some(&Recorded::Destroy));
}

#[tokio::test]
async fn upload_over_upload_needs_confirmation() {
    let h = harness().await;
    let (first, _) = h
        .load("dup", RecordingPlugin::new("dup"), PluginSource::Uploaded)
        .await
        .unwrap();
    RecordingPlugin::new("dup")
        .version("2.0.0")
        .register(&h.catalog, "dup-v2");

    let err = h
        .registry
        .load("dup", "embedded:dup-v2", PluginSource::Uploaded)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConflictRequiresConfirmation);
    assert_eq!(h.registry.get("dup").await.unwrap().metadata.version, "1.0.0");

    h.registry
        .load_with(
            "dup",
            "embedded:dup-v2",
            PluginSource::Uploaded,
            LoadOptions {
                conflict: ConflictPolicy::Replace,
                storage_id: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(h.registry.get("dup").await.unwrap().metadata.version, "2.0.0");
    assert_eq!(first.calls().last(), Some(&Recorded::Destroy));
}

#[tokio::test]
async fn builtin_over_upload_is_rejected() {
    let h = harness().await;
    h.load("dup", RecordingPlugin::new("dup"), PluginSource::Uploaded)
        .await
        .unwrap();

    let err = h
        .registry
        .load("dup", "embedded:dup", PluginSource::Builtin)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyLoaded);
    assert_eq!(
        h.registry.get("dup").await.unwrap().source,
        PluginSource::Uploaded
    );
}

// ---- Events ----

#[tokio::test]
async fn selection_event_reaches_only_subscribers() {
    let h = harness().await;
    let p1 = h
        .load_external("p1", RecordingPlugin::new("p1").subscribe("ItemSelected"))
        .await
        .unwrap();
    let p2 = h
        .load_external("p2", RecordingPlugin::new("p2").subscribe("ItemCreated"))
        .await
        .unwrap();

    let report = h
        .registry
        .dispatch(DomainEvent::SelectionChanged {
            previous: None,
            current: Some(42),
            snapshot: None,
        })
        .await;
    assert_eq!(report.delivered, vec!["p1".to_string()]);

    let selected = CoreEvent::ItemSelected {
        id: "42".into(),
        item: None,
    };
    assert!(p1.wait_until(|c| c.contains(&Recorded::Event(selected.clone()))).await);
    p1.settle().await;
    assert_eq!(p1.events(), vec![selected]);
    assert!(p2.events().is_empty());
}

#[tokio::test]
async fn selection_change_delivers_deselect_then_select() {
    let h = harness().await;
    let p = h
        .load_external("p", RecordingPlugin::new("p").subscribe("*"))
        .await
        .unwrap();

    h.registry
        .dispatch(DomainEvent::SelectionChanged {
            previous: Some(1),
            current: Some(2),
            snapshot: Some(json!({"label": "two"})),
        })
        .await;

    assert!(p.wait_until(|c| c.len() >= 4).await);
    assert_eq!(
        p.events(),
        vec![
            CoreEvent::ItemDeselected { id: "1".into() },
            CoreEvent::ItemSelected {
                id: "2".into(),
                item: Some(json!({"label": "two"})),
            },
        ]
    );
}

#[tokio::test]
async fn failing_handler_does_not_stop_other_plugins() {
    let h = harness().await;
    let bad = h
        .load_external("bad", RecordingPlugin::new("bad").subscribe("ItemCreated").fail_events())
        .await
        .unwrap();
    let good = h
        .load_external("good", RecordingPlugin::new("good").subscribe("ItemCreated"))
        .await
        .unwrap();

    let report = h
        .registry
        .dispatch(DomainEvent::MarkerCreated(7, None))
        .await;
    assert_eq!(report.delivered.len(), 2);
    assert!(report.failed.is_empty());

    assert!(bad.wait_until(|c| c.len() == 3).await);
    assert!(good.wait_until(|c| c.len() == 3).await);

    // a handler error is recorded but the plugin stays enabled
    let err = wait_for_last_error(&h, "bad").await.unwrap();
    assert!(err.contains("ItemCreated"), "{err}");
    assert_eq!(h.registry.state_of("bad").await, Some(PluginState::Enabled));
}

#[tokio::test]
async fn panicking_plugin_is_faulted_and_skipped() {
    let h = harness().await;
    let bad = h
        .load_external("bad", RecordingPlugin::new("bad").subscribe("*").panic_on_event())
        .await
        .unwrap();
    let good = h
        .load_external("good", RecordingPlugin::new("good").subscribe("*"))
        .await
        .unwrap();

    h.registry.emit(CoreEvent::SystemReady).await;
    assert!(wait_for_state(&h, "bad", PluginState::Faulted).await);
    assert_eq!(bad.events().len(), 1);

    let report = h.registry.emit(CoreEvent::SystemShutdown).await;
    assert_eq!(report.delivered, vec!["good".to_string()]);
    assert!(good.wait_until(|c| c.len() == 4).await);

    let err = h.registry.enable("bad").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportError);

    // a faulted plugin can still be unloaded
    h.registry.unload("bad").await.unwrap();
    assert!(h.registry.get("bad").await.is_none());
}

#[tokio::test]
async fn fault_from_unloaded_plugin_does_not_mark_its_replacement() {
    let h = harness().await;
    let old = h
        .load_external(
            "alpha",
            RecordingPlugin::new("alpha").subscribe("ItemCreated").panic_on_event(),
        )
        .await
        .unwrap();

    h.registry
        .emit(CoreEvent::ItemCreated {
            id: "1".into(),
            item: None,
        })
        .await;
    assert!(old.wait_until(|c| c.iter().any(|r| matches!(r, Recorded::Event(_)))).await);
    // Let the worker queue its fault. Nothing below drains it before the reload.
    old.settle().await;

    h.registry.unload("alpha").await.unwrap();
    let new = h
        .load_external("alpha", RecordingPlugin::new("alpha").subscribe("ItemCreated"))
        .await
        .unwrap();

    assert_eq!(h.registry.state_of("alpha").await, Some(PluginState::Enabled));
    let info = h.registry.get("alpha").await.unwrap();
    assert!(info.faulted.is_none());
    assert!(info.last_error.is_none());

    let report = h
        .registry
        .emit(CoreEvent::ItemCreated {
            id: "2".into(),
            item: None,
        })
        .await;
    assert_eq!(report.delivered, vec!["alpha".to_string()]);
    assert!(new.wait_until(|c| c.len() == 3).await);
}

#[tokio::test]
async fn disabled_plugin_receives_no_events() {
    let h = harness().await;
    let p = h
        .load_external("p", RecordingPlugin::new("p").subscribe("ItemDeleted"))
        .await
        .unwrap();
    h.registry.disable("p").await.unwrap();

    let report = h.registry.dispatch(DomainEvent::MarkerDeleted(3)).await;
    assert!(report.delivered.is_empty());
    p.settle().await;
    assert!(p.events().is_empty());
}

#[tokio::test]
async fn subscription_without_permission_is_not_delivered() {
    let h = harness().await;
    let p = h
        .load_external("p", RecordingPlugin::new("p").subscribe_only("ItemDeleted"))
        .await
        .unwrap();

    let report = h.registry.dispatch(DomainEvent::MarkerDeleted(3)).await;
    assert!(report.delivered.is_empty());
    p.settle().await;
    assert!(p.events().is_empty());
}

#[tokio::test]
async fn custom_events_match_on_event_type() {
    let h = harness().await;
    let p = h
        .load_external("p", RecordingPlugin::new("p").subscribe("ocr.done"))
        .await
        .unwrap();

    h.registry
        .dispatch(DomainEvent::Custom {
            event_type: "ocr.done".into(),
            data: json!({"pages": 3}),
        })
        .await;
    h.registry
        .dispatch(DomainEvent::Custom {
            event_type: "ocr.started".into(),
            data: json!(null),
        })
        .await;

    assert!(p.wait_until(|c| c.len() >= 3).await);
    p.settle().await;
    assert_eq!(p.events().len(), 1);
    assert_eq!(p.events()[0].tag(), "ocr.done");
}

// ---- Service calls ----

#[tokio::test]
async fn plugin_calls_host_service_through_registry() {
    let h = TestHarness::builder()
        .with_service(clock_service())
        .build()
        .await
        .unwrap();
    let p = h
        .load_external("p", RecordingPlugin::new("p").permission("ServiceAccess:clock:now"))
        .await
        .unwrap();
    let host = p.host().unwrap();

    let now = host.call_service("clock", "now", json!({})).await.unwrap();
    assert_eq!(now, json!(1_700_000_000));

    let err = host.call_service("clock", "fail", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
}

#[tokio::test]
async fn unknown_method_is_reported_and_state_is_unaffected() {
    let h = TestHarness::builder()
        .with_service(clock_service())
        .build()
        .await
        .unwrap();
    let p = h
        .load_external("p", RecordingPlugin::new("p").permission("AllServicesAccess"))
        .await
        .unwrap();
    let host = p.host().unwrap();

    let err = host.call_service("clock", "later", json!({})).await.unwrap_err();
    assert!(
        matches!(err, ReefError::MethodNotFound { ref service, ref method } if service == "clock" && method == "later"),
        "{err}"
    );
    let err = host.call_service("weather", "now", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServiceNotFound);
    let err = host.call_service("clock", "fail", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandlerError);

    assert_eq!(h.registry.state_of("p").await, Some(PluginState::Enabled));
    assert!(host.call_service("clock", "now", json!({})).await.is_ok());
}

#[tokio::test]
async fn disabled_caller_is_rejected() {
    let h = TestHarness::builder()
        .with_service(clock_service())
        .build()
        .await
        .unwrap();
    let p = h
        .load_external("p", RecordingPlugin::new("p").permission("AllServicesAccess"))
        .await
        .unwrap();
    let host = p.host().unwrap();
    h.registry.disable("p").await.unwrap();

    let err = host.call_service("clock", "now", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PluginDisabled);
}

#[tokio::test]
async fn snapshot_lists_plugins_and_services() {
    let h = TestHarness::builder()
        .with_service(clock_service())
        .build()
        .await
        .unwrap();
    h.load_external("a", RecordingPlugin::new("a")).await.unwrap();
    h.load_external("b", RecordingPlugin::new("b")).await.unwrap();

    let snapshot = h.registry.snapshot().await;
    let ids: Vec<_> = snapshot.plugins.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, ["a", "b"]);
    assert_eq!(snapshot.services.len(), 1);
    assert_eq!(snapshot.services[0].name, "clock");

    let v = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(v["plugins"][0]["state"], "enabled");
    assert_eq!(v["plugins"][0]["kind"], "embedded");
}

#[tokio::test(flavor = "multi_thread")]
async fn unload_completes_while_plugin_call_is_in_flight() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let h = TestHarness::builder()
        .with_service(Arc::new(GateService {
            entered: entered.clone(),
            release: release.clone(),
        }))
        .build()
        .await
        .unwrap();
    let log = h
        .load_external("p", RecordingPlugin::new("p").permission("ServiceAccess:gate:*"))
        .await
        .unwrap();
    let host = log.host().unwrap();

    let caller = host.clone();
    let call = tokio::spawn(async move { caller.call_service("gate", "wait", json!({})).await });
    tokio::time::timeout(Duration::from_secs(2), entered.notified())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), h.registry.unload("p"))
        .await
        .unwrap()
        .unwrap();
    assert!(h.registry.get("p").await.is_none());
    assert_eq!(log.calls().last(), Some(&Recorded::Destroy));

    release.notify_one();
    let reply = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.unwrap(), json!("released"));

    let err = host.call_service("gate", "wait", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PluginNotFound);
}

// ---- Messaging ----

#[tokio::test]
async fn plugin_messages_another_plugin() {
    let h = harness().await;
    let sender = h
        .load_external("sender", RecordingPlugin::new("sender").permission("PluginCommunication"))
        .await
        .unwrap();
    let target = h
        .load_external("target", RecordingPlugin::new("target"))
        .await
        .unwrap();
    let host = sender.host().unwrap();

    host.send_message("target", json!({"hello": 1})).await.unwrap();
    host.call_service(
        MESSAGING_SERVICE,
        "send_message",
        json!({"to": "target", "payload": "second"}),
    )
    .await
    .unwrap();

    assert!(target.wait_until(|c| c.len() == 4).await);
    assert_eq!(
        target.messages(),
        vec![
            ("sender".to_string(), json!({"hello": 1})),
            ("sender".to_string(), json!("second")),
        ]
    );
}

#[tokio::test]
async fn messaging_requires_permission_and_live_target() {
    let h = harness().await;
    let quiet = h
        .load_external("quiet", RecordingPlugin::new("quiet"))
        .await
        .unwrap();
    let scoped = h
        .load_external(
            "scoped",
            RecordingPlugin::new("scoped").permission("PluginCommunicationWith:target"),
        )
        .await
        .unwrap();
    h.load_external("target", RecordingPlugin::new("target"))
        .await
        .unwrap();

    let err = quiet
        .host()
        .unwrap()
        .send_message("target", json!(null))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    let scoped = scoped.host().unwrap();
    let err = scoped.send_message("quiet", json!(null)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    let err = scoped
        .call_service(MESSAGING_SERVICE, "broadcast", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MethodNotFound);

    h.registry.disable("target").await.unwrap();
    let err = scoped.send_message("target", json!(null)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PluginDisabled);

    h.registry.unload("target").await.unwrap();
    let err = scoped.send_message("target", json!(null)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PluginNotFound);
}

#[tokio::test]
async fn plugin_emitted_event_reaches_other_subscribers_only() {
    let h = harness().await;
    let sender = h
        .load_external("sender", RecordingPlugin::new("sender").subscribe("NoteAdded"))
        .await
        .unwrap();
    let listener = h
        .load_external("listener", RecordingPlugin::new("listener").subscribe("NoteAdded"))
        .await
        .unwrap();
    let bystander = h
        .load_external("bystander", RecordingPlugin::new("bystander").subscribe("ItemCreated"))
        .await
        .unwrap();

    let reply = sender
        .host()
        .unwrap()
        .call_service(
            EVENTS_SERVICE,
            "emit",
            json!({"eventType": "NoteAdded", "data": {"text": "hi"}}),
        )
        .await
        .unwrap();
    assert_eq!(reply, json!({"delivered": ["listener"]}));

    let expected = CoreEvent::Custom {
        event_type: "NoteAdded".into(),
        data: json!({"text": "hi"}),
    };
    assert!(listener.wait_until(|c| c.contains(&Recorded::Event(expected.clone()))).await);
    sender.settle().await;
    assert!(sender.events().is_empty());
    assert!(bystander.events().is_empty());
}

#[tokio::test]
async fn events_service_rejects_unknown_method_and_bad_params() {
    let h = harness().await;
    let host = h
        .load_external("sender", RecordingPlugin::new("sender"))
        .await
        .unwrap()
        .host()
        .unwrap();

    let err = host
        .call_service(EVENTS_SERVICE, "broadcast", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MethodNotFound);

    let err = host
        .call_service(EVENTS_SERVICE, "emit", json!({"data": 1}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandlerError);

    let err = host
        .call_service(EVENTS_SERVICE, "emit", json!({"eventType": " "}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandlerError);
}

#[tokio::test]
async fn disabled_plugin_cannot_emit_events() {
    let h = harness().await;
    let host = h
        .load_external("sender", RecordingPlugin::new("sender"))
        .await
        .unwrap()
        .host()
        .unwrap();
    h.registry.disable("sender").await.unwrap();

    let err = host
        .call_service(EVENTS_SERVICE, "emit", json!({"eventType": "NoteAdded"}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PluginDisabled);
}

// ---- Persistence ----

#[tokio::test]
async fn builtin_enabled_flag_survives_restart() {
    let first = harness().await;
    first
        .load("b", RecordingPlugin::new("b"), PluginSource::Builtin)
        .await
        .unwrap();
    first.registry.disable("b").await.unwrap();
    assert_eq!(first.state.enabled("b").await.unwrap(), Some(false));
    first.registry.unload_all().await;

    let second = TestHarness::builder()
        .with_state(first.state.clone())
        .build()
        .await
        .unwrap();
    let (log, _) = second
        .load("b", RecordingPlugin::new("b"), PluginSource::Builtin)
        .await
        .unwrap();

    assert_eq!(second.registry.state_of("b").await, Some(PluginState::Disabled));
    assert_eq!(log.calls(), vec![Recorded::Init]);
}

#[tokio::test]
async fn builtin_override_applies_without_persisted_flag() {
    let h = TestHarness::builder()
        .with_builtin_override("b", false)
        .with_builtin_override("c", false)
        .build()
        .await
        .unwrap();
    h.state.set_enabled("c", true).await.unwrap();

    h.load("b", RecordingPlugin::new("b"), PluginSource::Builtin)
        .await
        .unwrap();
    h.load("c", RecordingPlugin::new("c"), PluginSource::Builtin)
        .await
        .unwrap();

    assert_eq!(h.registry.state_of("b").await, Some(PluginState::Disabled));
    assert_eq!(h.registry.state_of("c").await, Some(PluginState::Enabled));
}

#[tokio::test]
async fn external_plugins_are_not_persisted() {
    let h = harness().await;
    h.load_external("x", RecordingPlugin::new("x")).await.unwrap();
    h.registry.disable("x").await.unwrap();
    assert_eq!(h.state.enabled("x").await.unwrap(), None);
}

// ---- Uploads ----

/// Minimal sandboxed guest reporting id `guest`.
fn guest_wasm(version: &str) -> Vec<u8> {
    guest_wasm_as("guest", version)
}

/// A guest that reports `id` no matter which file it was loaded from.
fn guest_wasm_as(id: &str, version: &str) -> Vec<u8> {
    let meta = format!(r#"{{"id":"{id}","name":"Guest","version":"{version}"}}"#);
    let wat = format!(
        r#"(module
  (import "reef" "set_metadata" (func $set_metadata (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "{escaped}")
  (func (export "plugin_init") (result i32)
    (drop (call $set_metadata (i32.const 0) (i32.const {len})))
    (i32.const 0)))"#,
        escaped = meta.replace('"', "\\\""),
        len = meta.len(),
    );
    wat::parse_str(&wat).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn install_upload_stores_and_loads() {
    let h = harness().await;
    let meta = h
        .registry
        .install_upload("guest.wasm", &guest_wasm("1.0.0"), ConflictPolicy::Reject)
        .await
        .unwrap();
    assert_eq!(meta.id, "guest");

    let info = h.registry.get("guest").await.unwrap();
    assert_eq!(info.source, PluginSource::Uploaded);
    assert_eq!(info.storage_id.as_deref(), Some("guest.wasm"));
    assert!(h.upload_dir().join("guest.wasm").exists());

    let err = h
        .registry
        .install_upload("guest.wasm", &guest_wasm("2.0.0"), ConflictPolicy::Reject)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConflictRequiresConfirmation);

    let meta = h
        .registry
        .install_upload("guest.wasm", &guest_wasm("2.0.0"), ConflictPolicy::Replace)
        .await
        .unwrap();
    assert_eq!(meta.version, "2.0.0");

    h.registry.remove_upload("guest").await.unwrap();
    assert!(h.registry.get("guest").await.is_none());
    assert!(!h.upload_dir().join("guest.wasm").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_upload_is_deleted() {
    let h = harness().await;
    let bogus = wat::parse_str(r#"(module (memory (export "memory") 1))"#).unwrap();

    let err = h
        .registry
        .install_upload("guest.wasm", &bogus, ConflictPolicy::Reject)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LoadFailure);
    assert!(h.blobs.list().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uploads_are_restored_after_restart() {
    let first = harness().await;
    first
        .registry
        .install_upload("guest.wasm", &guest_wasm("1.0.0"), ConflictPolicy::Reject)
        .await
        .unwrap();
    first.registry.unload_all().await;

    let second = TestHarness::builder()
        .with_upload_dir(first.upload_dir())
        .build()
        .await
        .unwrap();
    let summary = second.registry.restore_uploaded().await.unwrap();

    assert_eq!(summary.loaded, vec!["guest".to_string()]);
    assert!(summary.failed.is_empty());
    let info = second.registry.get("guest").await.unwrap();
    assert_eq!(info.source, PluginSource::Uploaded);
    second.registry.unload_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn builtin_dir_loads_sorted_artifacts_and_reports_failures() {
    let h = harness().await;
    let dir = h.temp_path().join("builtin");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("guest.wasm"), guest_wasm("1.0.0")).unwrap();
    std::fs::write(dir.join("broken.wasm"), b"not wasm").unwrap();
    std::fs::write(dir.join("README.md"), b"ignored").unwrap();

    let summary = h.registry.load_builtin_dir(&dir).await.unwrap();
    assert_eq!(summary.loaded, vec!["guest".to_string()]);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, "broken");

    let info = h.registry.get("guest").await.unwrap();
    assert_eq!(info.source, PluginSource::Builtin);
    h.registry.unload_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_is_keyed_by_reported_id() {
    let h = harness().await;
    let file = "libdummy_ocr_plugin.wasm";
    let meta = h
        .registry
        .install_upload(file, &guest_wasm_as("dummy-ocr", "1.0.0"), ConflictPolicy::Reject)
        .await
        .unwrap();
    assert_eq!(meta.id, "dummy-ocr");

    let info = h.registry.get("dummy-ocr").await.unwrap();
    assert_eq!(info.source, PluginSource::Uploaded);
    assert_eq!(info.storage_id.as_deref(), Some(file));
    assert!(h.registry.get("dummy-ocr-plugin").await.is_none());
    let blobs = h.blobs.list().await.unwrap();
    assert_eq!(blobs.len(), 1);
    assert_eq!(blobs[0].id, "dummy-ocr");

    // a second file reporting the same id collides on the reported id
    let err = h
        .registry
        .install_upload(
            "ocr_v2.wasm",
            &guest_wasm_as("dummy-ocr", "2.0.0"),
            ConflictPolicy::Reject,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConflictRequiresConfirmation);
    assert!(!h.upload_dir().join("ocr_v2.wasm").exists());
    assert!(h.upload_dir().join(file).exists());

    let meta = h
        .registry
        .install_upload(
            "ocr_v2.wasm",
            &guest_wasm_as("dummy-ocr", "2.0.0"),
            ConflictPolicy::Replace,
        )
        .await
        .unwrap();
    assert_eq!(meta.version, "2.0.0");
    assert!(!h.upload_dir().join(file).exists());
    assert_eq!(
        h.registry.get("dummy-ocr").await.unwrap().storage_id.as_deref(),
        Some("ocr_v2.wasm")
    );

    h.registry.remove_upload("dummy-ocr").await.unwrap();
    assert!(h.blobs.list().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restored_upload_keeps_reported_id() {
    let first = harness().await;
    first
        .registry
        .install_upload(
            "libdoubao_plugin.wasm",
            &guest_wasm_as("doubao-translate", "1.0.0"),
            ConflictPolicy::Reject,
        )
        .await
        .unwrap();
    first.registry.unload_all().await;

    let second = TestHarness::builder()
        .with_upload_dir(first.upload_dir())
        .build()
        .await
        .unwrap();
    let summary = second.registry.restore_uploaded().await.unwrap();
    assert_eq!(summary.loaded, vec!["doubao-translate".to_string()]);
    assert!(second.registry.get("doubao-translate").await.is_some());
    second.registry.unload_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn builtin_with_own_id_persists_under_that_id() {
    let h = harness().await;
    let dir = h.temp_path().join("builtin");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("libdoubao_translate_plugin.wasm"),
        guest_wasm_as("doubao-translate", "1.0.0"),
    )
    .unwrap();

    let summary = h.registry.load_builtin_dir(&dir).await.unwrap();
    assert_eq!(summary.loaded, vec!["doubao-translate".to_string()]);
    assert!(summary.failed.is_empty());

    h.registry.disable("doubao-translate").await.unwrap();
    assert_eq!(h.state.enabled("doubao-translate").await.unwrap(), Some(false));
    assert_eq!(h.state.enabled("doubao-translate-plugin").await.unwrap(), None);
    h.registry.unload_all().await;
}

#[tokio::test]
async fn missing_builtin_dir_is_empty() {
    let h = harness().await;
    let summary = h
        .registry
        .load_builtin_dir(&h.temp_path().join("nope"))
        .await
        .unwrap();
    assert!(summary.loaded.is_empty() && summary.failed.is_empty());
}
