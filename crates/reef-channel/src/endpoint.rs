// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The two ends of a channel.
//!
//! The plugin end issues requests and blocks its own thread until the answer
//! arrives. The host end runs on a dedicated thread and answers them.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use reef_core::{ErrorKind, ReefError};
use tracing::{debug, warn};

use crate::segment::{Exchange, SharedSegment, Status, Word, channel_timeout};

/// How often [`HostEndpoint::serve`] rechecks its shutdown flag while idle.
const SERVE_POLL: Duration = Duration::from_millis(50);

/// Outcome of a synchronous call as seen by the plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Response payload.
    Payload(Vec<u8>),
    /// The host answered with an error status.
    Failed { kind: ErrorKind, message: String },
}

impl Reply {
    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Reply::Failed {
            kind,
            message: message.into(),
        }
    }
}

/// Creates a segment and the only two endpoints that may use it.
pub fn channel(
    segment_bytes: usize,
    chunk_bytes: usize,
    timeout: Duration,
) -> Result<(HostEndpoint, PluginEndpoint), ReefError> {
    let segment = Arc::new(SharedSegment::new(segment_bytes)?);
    let host = HostEndpoint {
        segment: Arc::clone(&segment),
        timeout,
        last_seen: 0,
    };
    let plugin = PluginEndpoint {
        segment,
        timeout,
        chunk_bytes: chunk_bytes.clamp(1, u32::MAX as usize) as u32,
        next_id: AtomicU32::new(0),
        call_lock: Mutex::new(()),
    };
    Ok((host, plugin))
}

fn check_len(len: usize) -> Result<u32, ReefError> {
    u32::try_from(len).map_err(|_| {
        ReefError::ChannelProtocolError(format!("payload of {len} bytes exceeds the 32-bit size field"))
    })
}

/// Requesting side of a channel.
#[derive(Debug)]
pub struct PluginEndpoint {
    segment: Arc<SharedSegment>,
    timeout: Duration,
    chunk_bytes: u32,
    next_id: AtomicU32,
    call_lock: Mutex<()>,
}

impl PluginEndpoint {
    /// The underlying segment, for inspection.
    pub fn segment(&self) -> &SharedSegment {
        &self.segment
    }

    fn allocate_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            // zero means "no request yet" to the host
            if id != 0 {
                return id;
            }
        }
    }

    /// Publishes a request and streams its payload. Returns the request id.
    pub fn write_request(&self, bytes: &[u8]) -> Result<u32, ReefError> {
        let seg = &*self.segment;
        let total = check_len(bytes.len())?;
        let deadline = Instant::now() + self.timeout;

        let id = loop {
            if !seg.wait_until(deadline, || seg.status() == Some(Status::Idle)) {
                return Err(channel_timeout("waiting for an idle channel", self.timeout));
            }
            let claimed = seg.publish(|| {
                if seg.status() != Some(Status::Idle) {
                    return None;
                }
                seg.store(Word::WriterPos, 0);
                seg.store(Word::ReaderPos, 0);
                seg.store(Word::TotalSize, total);
                seg.store(Word::ChunkSize, self.chunk_bytes);
                seg.store(Word::ErrorCode, 0);
                let id = self.allocate_id();
                seg.store(Word::RequestId, id);
                Some(id)
            });
            if let Some(id) = claimed {
                break id;
            }
        };

        seg.write_stream(bytes, Exchange::new(Status::Idle, id), deadline, self.timeout)?;
        seg.set_status(Status::Request);
        Ok(id)
    }

    /// Waits for the answer to `request_id` and returns the channel to idle.
    pub fn read_response(&self, request_id: u32) -> Result<Reply, ReefError> {
        let seg = &*self.segment;
        let deadline = Instant::now() + self.timeout;

        let mut status = None;
        if !seg.wait_until(deadline, || {
            status = seg.status();
            !matches!(status, Some(Status::Request) | Some(Status::Idle))
        }) {
            return Err(channel_timeout("waiting for a response", self.timeout));
        }
        let Some(status) = status else {
            return Err(ReefError::ChannelProtocolError(format!(
                "invalid status word {}",
                seg.load(Word::Status)
            )));
        };

        let answered = seg.load(Word::RequestId);
        if answered != request_id {
            return Err(ReefError::ChannelProtocolError(format!(
                "response carries request id {answered}, expected {request_id}"
            )));
        }

        let total = seg.load(Word::TotalSize) as usize;
        let payload = seg.read_stream(total, deadline, self.timeout)?;
        let reply = match status {
            Status::Error => Reply::Failed {
                kind: ErrorKind::from_channel_code(seg.load(Word::ErrorCode)),
                message: String::from_utf8_lossy(&payload).into_owned(),
            },
            _ => Reply::Payload(payload),
        };

        seg.set_status(Status::Idle);
        Ok(reply)
    }

    /// One full request/response exchange. Concurrent callers are serialized.
    ///
    /// On timeout or protocol error the channel is reset to idle so the next
    /// call starts clean.
    pub fn call(&self, bytes: &[u8]) -> Result<Reply, ReefError> {
        let _guard = self.call_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let result = self
            .write_request(bytes)
            .and_then(|id| self.read_response(id));
        if let Err(e) = &result {
            debug!(error = %e, "resetting channel after failed call");
            self.segment.reset();
        }
        result
    }
}

/// Answering side of a channel.
#[derive(Debug)]
pub struct HostEndpoint {
    segment: Arc<SharedSegment>,
    timeout: Duration,
    last_seen: u32,
}

impl HostEndpoint {
    pub fn segment(&self) -> &SharedSegment {
        &self.segment
    }

    /// Waits up to `timeout` for a new request and drains its payload.
    pub fn read_request(&mut self, timeout: Duration) -> Result<(u32, Vec<u8>), ReefError> {
        let seg = &*self.segment;
        let last_seen = self.last_seen;
        let deadline = Instant::now() + timeout;

        let mut id = 0;
        if !seg.wait_until(deadline, || {
            id = seg.load(Word::RequestId);
            id != 0 && id != last_seen
        }) {
            return Err(channel_timeout("waiting for a request", timeout));
        }
        self.last_seen = id;

        // The payload may be larger than the ring, so give the transfer its own bound.
        let deadline = Instant::now() + self.timeout;
        let total = seg.load(Word::TotalSize) as usize;
        let payload = seg.read_stream(total, deadline, self.timeout)?;

        if !seg.wait_until(deadline, || seg.status() != Some(Status::Idle)) {
            return Err(channel_timeout("waiting for request completion", self.timeout));
        }
        if seg.status() != Some(Status::Request) || seg.load(Word::RequestId) != id {
            return Err(ReefError::ChannelProtocolError(format!(
                "request {id} was abandoned by the plugin"
            )));
        }
        Ok((id, payload))
    }

    /// Answers `request_id` with a payload.
    pub fn write_response(&self, request_id: u32, bytes: &[u8]) -> Result<(), ReefError> {
        self.respond(request_id, Status::Response, 0, bytes)
    }

    /// Answers `request_id` with an error code and a UTF-8 message.
    pub fn write_error(&self, request_id: u32, code: u32, message: &str) -> Result<(), ReefError> {
        self.respond(request_id, Status::Error, code, message.as_bytes())
    }

    fn respond(
        &self,
        request_id: u32,
        status: Status,
        code: u32,
        bytes: &[u8],
    ) -> Result<(), ReefError> {
        let seg = &*self.segment;
        let total = check_len(bytes.len())?;
        seg.publish(|| {
            if seg.status() != Some(Status::Request) || seg.load(Word::RequestId) != request_id {
                return Err(ReefError::ChannelProtocolError(format!(
                    "request {request_id} is no longer pending"
                )));
            }
            seg.store(Word::WriterPos, 0);
            seg.store(Word::ReaderPos, 0);
            seg.store(Word::TotalSize, total);
            seg.store(Word::ErrorCode, code);
            seg.store(Word::Status, status as u32);
            Ok(())
        })?;

        let exchange = Exchange::new(status, request_id);
        seg.write_stream(bytes, exchange, Instant::now() + self.timeout, self.timeout)
    }

    /// Answers requests until `shutdown` is set.
    ///
    /// Blocks the calling thread; use [`HostEndpoint::spawn`] to run it on a
    /// dedicated one.
    pub fn serve<H>(mut self, mut handler: H, shutdown: &AtomicBool)
    where
        H: FnMut(&[u8]) -> Reply,
    {
        while !shutdown.load(Ordering::Acquire) {
            let (id, request) = match self.read_request(SERVE_POLL) {
                Ok(req) => req,
                Err(ReefError::ChannelTimeout { .. }) => continue,
                Err(e) => {
                    warn!(error = %e, "dropping malformed channel request");
                    continue;
                }
            };

            let written = match handler(&request) {
                Reply::Payload(bytes) => self.write_response(id, &bytes),
                Reply::Failed { kind, message } => {
                    self.write_error(id, kind.channel_code(), &message)
                }
            };
            if let Err(e) = written {
                debug!(request_id = id, error = %e, "channel response not delivered");
            }
        }
    }

    /// Runs [`HostEndpoint::serve`] on a new named thread.
    pub fn spawn<H>(
        self,
        name: String,
        handler: H,
        shutdown: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>>
    where
        H: FnMut(&[u8]) -> Reply + Send + 'static,
    {
        std::thread::Builder::new()
            .name(name)
            .spawn(move || self.serve(handler, &shutdown))
    }
}
