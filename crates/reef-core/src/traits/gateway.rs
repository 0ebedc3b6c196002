// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Host entry point that transports use to reach host services.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ReefError;
use crate::wire::ServiceCallRequest;

/// The host side of every plugin-to-host call.
///
/// Transports hold an `Arc<dyn ServiceGateway>` and never talk to the
/// registry or router directly. The registry implements this to apply
/// enabled checks and permissions before routing.
#[async_trait]
pub trait ServiceGateway: Send + Sync + 'static {
    /// Routes a service call issued by `request.plugin_id`.
    async fn call_service(&self, request: ServiceCallRequest) -> Result<Value, ReefError>;

    /// Delivers `payload` from one plugin to another.
    async fn send_message(&self, from: &str, to: &str, payload: Value) -> Result<(), ReefError>;
}
