// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Service-call wire shapes exchanged with plugins as camelCase JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ReefError;
use crate::types::PluginId;

/// A plugin's request to call a host service method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCallRequest {
    #[serde(default)]
    pub call_id: u64,
    #[serde(default)]
    pub plugin_id: PluginId,
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl ServiceCallRequest {
    pub fn new(
        call_id: u64,
        plugin_id: impl Into<String>,
        service: impl Into<String>,
        method: impl Into<String>,
        params: Value,
    ) -> Self {
        Self {
            call_id,
            plugin_id: plugin_id.into(),
            service: service.into(),
            method: method.into(),
            params,
        }
    }
}

/// Answer to a [`ServiceCallRequest`]. Exactly one of `result` or `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCallResponse {
    pub call_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceCallResponse {
    pub fn ok(call_id: u64, result: Value) -> Self {
        Self {
            call_id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(call_id: u64, error: impl Into<String>) -> Self {
        Self {
            call_id,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Builds the wire response for a routed call outcome.
    pub fn from_result(call_id: u64, outcome: Result<Value, ReefError>) -> Self {
        match outcome {
            Ok(v) => Self::ok(call_id, v),
            Err(e) => Self::err(call_id, e.to_string()),
        }
    }

    /// Wire JSON for this response.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"callId":{},"error":"serialization failed: {e}"}}"#, self.call_id)
        })
    }
}
