// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Weak;

use async_trait::async_trait;
use reef_core::{ReefError, ServiceCallRequest, ServiceGateway};
use serde_json::Value;

use crate::registry::Registry;

/// The gateway transports call into. Holds the registry weakly so plugin
/// workers never keep a shut-down host alive.
pub(crate) struct RegistryGateway {
    pub(crate) registry: Weak<Registry>,
}

impl RegistryGateway {
    fn registry(&self) -> Result<std::sync::Arc<Registry>, ReefError> {
        self.registry
            .upgrade()
            .ok_or_else(|| ReefError::Internal("plugin registry has shut down".into()))
    }
}

#[async_trait]
impl ServiceGateway for RegistryGateway {
    async fn call_service(&self, request: ServiceCallRequest) -> Result<Value, ReefError> {
        self.registry()?.handle_service_call(request).await
    }

    async fn send_message(&self, from: &str, to: &str, payload: Value) -> Result<(), ReefError> {
        self.registry()?.send_message(from, to, payload).await
    }
}
