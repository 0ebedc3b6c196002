// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Host services the `reef` binary exposes to plugins.
//!
//! `markers` is an in-memory store of labelled points. Every mutation is
//! reported as a [`DomainEvent`] so subscribed plugins observe it.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use indexmap::IndexMap;
use reef_core::DomainEvent;
use reef_router::{HandlerFailure, MethodInfo, ParamInfo, ServiceHandler};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub id: u32,
    pub label: String,
    pub x: f64,
    pub y: f64,
}

#[derive(Deserialize)]
struct IdParams {
    id: u32,
}

#[derive(Deserialize)]
struct CreateParams {
    label: String,
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
}

#[derive(Deserialize)]
struct UpdateParams {
    id: u32,
    label: Option<String>,
    x: Option<f64>,
    y: Option<f64>,
}

#[derive(Default)]
struct MarkerTable {
    next_id: u32,
    markers: IndexMap<u32, Marker>,
}

/// The `markers` service.
pub struct MarkerService {
    table: Mutex<MarkerTable>,
    events: Option<mpsc::UnboundedSender<DomainEvent>>,
}

impl std::fmt::Debug for MarkerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkerService").finish_non_exhaustive()
    }
}

fn parse<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, HandlerFailure> {
    serde_json::from_value(params).map_err(|e| HandlerFailure::Failed(format!("invalid params: {e}")))
}

fn snapshot(marker: &Marker) -> Option<Value> {
    serde_json::to_value(marker).ok()
}

impl MarkerService {
    pub fn new(events: Option<mpsc::UnboundedSender<DomainEvent>>) -> Self {
        Self {
            table: Mutex::new(MarkerTable::default()),
            events,
        }
    }

    fn emit(&self, event: DomainEvent) {
        if let Some(tx) = &self.events {
            // Receiver gone means the host is shutting down.
            let _ = tx.send(event);
        }
    }

    fn with_table<R>(&self, f: impl FnOnce(&mut MarkerTable) -> R) -> R {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut table)
    }

    fn create(&self, p: CreateParams) -> Marker {
        let marker = self.with_table(|t| {
            t.next_id += 1;
            let marker = Marker {
                id: t.next_id,
                label: p.label,
                x: p.x,
                y: p.y,
            };
            t.markers.insert(marker.id, marker.clone());
            marker
        });
        debug!(marker = marker.id, "marker created");
        self.emit(DomainEvent::MarkerCreated(marker.id, snapshot(&marker)));
        marker
    }

    fn update(&self, p: UpdateParams) -> Result<Marker, HandlerFailure> {
        let marker = self.with_table(|t| {
            let marker = t
                .markers
                .get_mut(&p.id)
                .ok_or_else(|| HandlerFailure::Failed(format!("no marker {}", p.id)))?;
            if let Some(label) = p.label {
                marker.label = label;
            }
            if let Some(x) = p.x {
                marker.x = x;
            }
            if let Some(y) = p.y {
                marker.y = y;
            }
            Ok::<_, HandlerFailure>(marker.clone())
        })?;
        self.emit(DomainEvent::MarkerUpdated(marker.id, snapshot(&marker)));
        Ok(marker)
    }

    fn delete(&self, id: u32) -> Result<(), HandlerFailure> {
        self.with_table(|t| t.markers.shift_remove(&id))
            .ok_or_else(|| HandlerFailure::Failed(format!("no marker {id}")))?;
        self.emit(DomainEvent::MarkerDeleted(id));
        Ok(())
    }
}

#[async_trait]
impl ServiceHandler for MarkerService {
    fn name(&self) -> &str {
        "markers"
    }

    fn methods(&self) -> Vec<MethodInfo> {
        vec![
            MethodInfo::new("get_all_markers", "every marker in creation order")
                .returns("Marker[]"),
            MethodInfo::new("get_marker", "one marker by id")
                .param(ParamInfo::required("id", "u32"))
                .returns("Marker"),
            MethodInfo::new("create_marker", "adds a marker")
                .param(ParamInfo::required("label", "string"))
                .param(ParamInfo::optional("x", "f64"))
                .param(ParamInfo::optional("y", "f64"))
                .returns("Marker"),
            MethodInfo::new("update_marker", "changes the given fields of a marker")
                .param(ParamInfo::required("id", "u32"))
                .param(ParamInfo::optional("label", "string"))
                .param(ParamInfo::optional("x", "f64"))
                .param(ParamInfo::optional("y", "f64"))
                .returns("Marker"),
            MethodInfo::new("delete_marker", "removes a marker")
                .param(ParamInfo::required("id", "u32")),
        ]
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, HandlerFailure> {
        match method {
            "get_all_markers" => {
                let all: Vec<Marker> = self.with_table(|t| t.markers.values().cloned().collect());
                Ok(json!(all))
            }
            "get_marker" => {
                let IdParams { id } = parse(params)?;
                self.with_table(|t| t.markers.get(&id).cloned())
                    .map(|m| json!(m))
                    .ok_or_else(|| HandlerFailure::Failed(format!("no marker {id}")))
            }
            "create_marker" => Ok(json!(self.create(parse(params)?))),
            "update_marker" => Ok(json!(self.update(parse(params)?)?)),
            "delete_marker" => {
                let IdParams { id } = parse(params)?;
                self.delete(id)?;
                Ok(Value::Null)
            }
            _ => Err(HandlerFailure::UnknownMethod),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use reef_core::{ErrorKind, PluginSource};
    use reef_registry::PluginState;
    use reef_test_utils::{RecordingPlugin, TestHarness};

    use super::*;

    #[tokio::test]
    async fn create_update_delete_emit_domain_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let svc = MarkerService::new(Some(tx));

        let created = svc
            .call("create_marker", json!({"label": "a", "x": 1.0}))
            .await
            .unwrap();
        assert_eq!(created["id"], 1);
        svc.call("update_marker", json!({"id": 1, "label": "b"}))
            .await
            .unwrap();
        svc.call("delete_marker", json!({"id": 1})).await.unwrap();

        assert!(matches!(rx.recv().await, Some(DomainEvent::MarkerCreated(1, Some(_)))));
        match rx.recv().await {
            Some(DomainEvent::MarkerUpdated(1, Some(v))) => assert_eq!(v["label"], "b"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(rx.recv().await, Some(DomainEvent::MarkerDeleted(1)));
    }

    #[tokio::test]
    async fn missing_marker_is_a_handler_failure() {
        let svc = MarkerService::new(None);
        let err = svc.call("get_marker", json!({"id": 9})).await.unwrap_err();
        assert_eq!(err, HandlerFailure::Failed("no marker 9".into()));
        let err = svc.call("get_marker", json!({})).await.unwrap_err();
        assert!(matches!(err, HandlerFailure::Failed(m) if m.starts_with("invalid params")));
    }

    #[tokio::test]
    async fn get_all_keeps_creation_order() {
        let svc = MarkerService::new(None);
        for label in ["one", "two", "three"] {
            svc.call("create_marker", json!({"label": label})).await.unwrap();
        }
        let all = svc.call("get_all_markers", json!({})).await.unwrap();
        let labels: Vec<_> = all
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["label"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(labels, ["one", "two", "three"]);
    }

    #[tokio::test]
    async fn unknown_marker_method_leaves_registry_untouched() {
        let h = TestHarness::builder()
            .with_service(Arc::new(MarkerService::new(None)))
            .build()
            .await
            .unwrap();
        let (log, _) = h
            .load(
                "p",
                RecordingPlugin::new("p").permission("ServiceAccess:markers:*"),
                PluginSource::External,
            )
            .await
            .unwrap();
        let host = log.host().unwrap();

        let err = host
            .call_service("markers", "nonexistent_method", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MethodNotFound);

        assert_eq!(h.registry.state_of("p").await, Some(PluginState::Enabled));
        let all = host
            .call_service("markers", "get_all_markers", json!({}))
            .await
            .unwrap();
        assert_eq!(all, json!([]));
    }
}
