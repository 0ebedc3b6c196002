// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Trait seams between the registry and the transports.

pub mod gateway;

pub use gateway::ServiceGateway;
