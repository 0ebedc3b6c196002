// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Plugin transports for the Reef host.
//!
//! A transport owns one loaded plugin and the worker that executes it:
//! a native library on an OS thread, a sandboxed wasm guest on an OS thread,
//! or an embedded Rust plugin on a tokio task. The registry talks to all of
//! them through [`Transport`].

pub mod context;
pub mod embedded;
pub mod isolated;
pub mod native;
pub mod transport;
mod worker;

pub use context::HostContext;
pub use embedded::{EmbeddedCatalog, EmbeddedFactory, EmbeddedPlugin, HostHandle};
pub use isolated::IsolatedTransport;
pub use native::{DylibModule, HOST_CALLBACKS, HostCallbacks, NativeModule, NativeTransport};
pub use transport::Transport;
