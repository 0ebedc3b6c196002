// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Maps `(service, method)` to a registered handler.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt;
use indexmap::IndexMap;
use reef_core::{ReefError, ServiceCallRequest};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::handler::{HandlerFailure, MethodInfo, ServiceHandler};
use crate::permissions::PermissionChecker;

/// Introspection entry returned by [`ServiceRouter::list_services`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub methods: Vec<MethodInfo>,
}

/// Registry of host services.
///
/// Handlers are stored behind `Arc` and cloned out before the call, so a
/// long-running handler never holds the table lock.
#[derive(Default)]
pub struct ServiceRouter {
    services: RwLock<IndexMap<String, Arc<dyn ServiceHandler>>>,
}

impl std::fmt::Debug for ServiceRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRouter")
            .field("services", &self.service_names())
            .finish()
    }
}

impl ServiceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under its own name, replacing any previous one.
    pub fn register(&self, handler: Arc<dyn ServiceHandler>) -> Option<Arc<dyn ServiceHandler>> {
        let name = handler.name().to_string();
        let previous = self
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), handler);
        if previous.is_some() {
            warn!(service = %name, "replaced existing service handler");
        } else {
            debug!(service = %name, "registered service");
        }
        previous
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(name)
            .is_some()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Every registered service with its advertised methods, in registration order.
    pub fn list_services(&self) -> Vec<ServiceInfo> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, h)| ServiceInfo {
                name: name.clone(),
                methods: h.methods(),
            })
            .collect()
    }

    fn handler(&self, service: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()
    }

    /// Invokes `service.method` with `params`.
    ///
    /// A handler that fails or panics yields `HandlerError`; the panic does
    /// not cross this call.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, ReefError> {
        let handler = self
            .handler(service)
            .ok_or_else(|| ReefError::ServiceNotFound(service.to_string()))?;

        let method_not_found = || ReefError::MethodNotFound {
            service: service.to_string(),
            method: method.to_string(),
        };
        if !handler.methods().iter().any(|m| m.name == method) {
            return Err(method_not_found());
        }

        let outcome = AssertUnwindSafe(handler.call(method, params))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(HandlerFailure::UnknownMethod)) => Err(method_not_found()),
            Ok(Err(HandlerFailure::Failed(message))) => Err(ReefError::HandlerError {
                service: service.to_string(),
                method: method.to_string(),
                message,
            }),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(service, method, panic = %message, "service handler panicked");
                Err(ReefError::HandlerError {
                    service: service.to_string(),
                    method: method.to_string(),
                    message: format!("handler panicked: {message}"),
                })
            }
        }
    }

    /// Plugin-scoped entry: checks `grants` before routing `request`.
    pub async fn call_as(
        &self,
        grants: &PermissionChecker,
        request: ServiceCallRequest,
    ) -> Result<Value, ReefError> {
        if !grants.can_access_service(&request.service, &request.method) {
            return Err(ReefError::PermissionDenied {
                plugin: request.plugin_id,
                action: format!("call {}.{}", request.service, request.method),
            });
        }
        self.call(&request.service, &request.method, request.params)
            .await
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
