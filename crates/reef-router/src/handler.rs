// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The trait host services implement to be callable from plugins.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Describes one parameter of a service method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

impl ParamInfo {
    pub fn required(name: impl Into<String>, param_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            required: true,
            description: String::new(),
        }
    }

    pub fn optional(name: impl Into<String>, param_type: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type)
        }
    }
}

/// Describes one callable method of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: Vec<ParamInfo>,
    #[serde(default)]
    pub returns: String,
}

impl MethodInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
            returns: String::new(),
        }
    }

    pub fn param(mut self, param: ParamInfo) -> Self {
        self.params.push(param);
        self
    }

    pub fn returns(mut self, returns: impl Into<String>) -> Self {
        self.returns = returns.into();
        self
    }
}

/// Why a handler could not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerFailure {
    #[error("unknown method")]
    UnknownMethod,
    #[error("{0}")]
    Failed(String),
}

/// A host service reachable through the router.
///
/// Implementations are opaque to the host: the router only sees the
/// service name, the advertised methods, and the call entry point.
#[async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    /// Name plugins use to address this service.
    fn name(&self) -> &str;

    /// Methods this service exposes.
    fn methods(&self) -> Vec<MethodInfo>;

    async fn call(&self, method: &str, params: Value) -> Result<Value, HandlerFailure>;
}

type MethodFn = Box<dyn Fn(Value) -> Result<Value, HandlerFailure> + Send + Sync>;

/// A service assembled from synchronous closures.
///
/// Handy for small host services and tests:
///
/// ```
/// use reef_router::{FnService, MethodInfo};
/// use serde_json::json;
///
/// let svc = FnService::new("clock")
///     .method(MethodInfo::new("now", "current unix time"), |_| Ok(json!(0)));
/// ```
pub struct FnService {
    name: String,
    methods: IndexMap<String, (MethodInfo, MethodFn)>,
}

impl FnService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: IndexMap::new(),
        }
    }

    pub fn method<F>(mut self, info: MethodInfo, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, HandlerFailure> + Send + Sync + 'static,
    {
        self.methods.insert(info.name.clone(), (info, Box::new(f)));
        self
    }
}

impl std::fmt::Debug for FnService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnService")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl ServiceHandler for FnService {
    fn name(&self) -> &str {
        &self.name
    }

    fn methods(&self) -> Vec<MethodInfo> {
        self.methods.values().map(|(info, _)| info.clone()).collect()
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, HandlerFailure> {
        match self.methods.get(method) {
            Some((_, f)) => f(params),
            None => Err(HandlerFailure::UnknownMethod),
        }
    }
}
