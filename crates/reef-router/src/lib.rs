// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Service routing for the Reef plugin host.
//!
//! Host services register a [`ServiceHandler`] with the [`ServiceRouter`].
//! Plugin calls are resolved by service name, checked against the method
//! list, optionally gated by a [`PermissionChecker`], and executed with
//! panics contained.

pub mod handler;
pub mod permissions;
pub mod router;

pub use handler::{FnService, HandlerFailure, MethodInfo, ParamInfo, ServiceHandler};
pub use permissions::{PermissionChecker, presets};
pub use router::{ServiceInfo, ServiceRouter};
