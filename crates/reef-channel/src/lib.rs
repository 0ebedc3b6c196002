// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Synchronous request/response channel over a shared segment.
//!
//! A segment is a 32-byte header of atomic words (`status`, `requestId`,
//! `writerPos`, `readerPos`, `totalSize`, `chunkSize`, `errorCode`, reserved)
//! followed by a circular data region. Payloads of any size stream through
//! the ring in chunks with back-pressure, so a request may be larger than the
//! region. Each channel carries one in-flight request at a time and is owned
//! by exactly one plugin endpoint and one host endpoint.

pub mod endpoint;
pub mod segment;

pub use endpoint::{HostEndpoint, PluginEndpoint, Reply, channel};
pub use segment::{HEADER_BYTES, MIN_SEGMENT_BYTES, SharedSegment, Status, Word};
