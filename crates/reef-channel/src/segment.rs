// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared segment: an atomic control header followed by a circular data region.

use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use reef_core::ReefError;

/// Number of 32-bit words in the control header.
pub const HEADER_WORDS: usize = 8;

/// Size of the control header in bytes. The data region follows it.
pub const HEADER_BYTES: usize = HEADER_WORDS * 4;

/// Smallest usable segment: the header plus one byte of payload and one of slack.
pub const MIN_SEGMENT_BYTES: usize = HEADER_BYTES + 2;

/// Index of each header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Word {
    Status = 0,
    RequestId = 1,
    WriterPos = 2,
    ReaderPos = 3,
    TotalSize = 4,
    ChunkSize = 5,
    ErrorCode = 6,
    Reserved = 7,
}

/// Value of the `status` word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Idle = 0,
    Request = 1,
    Response = 2,
    Error = 3,
}

impl Status {
    pub fn from_word(value: u32) -> Option<Self> {
        match value {
            0 => Some(Status::Idle),
            1 => Some(Status::Request),
            2 => Some(Status::Response),
            3 => Some(Status::Error),
            _ => None,
        }
    }
}

/// The exchange a stream belongs to: the status and request id the header
/// must still show for the writer to keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Exchange {
    pub status: Status,
    pub request_id: u32,
}

impl Exchange {
    pub fn new(status: Status, request_id: u32) -> Self {
        Self { status, request_id }
    }

    fn is_current(&self, seg: &SharedSegment) -> bool {
        seg.status() == Some(self.status) && seg.load(Word::RequestId) == self.request_id
    }

    fn abandoned(&self) -> ReefError {
        ReefError::ChannelProtocolError(format!(
            "request {} was abandoned while its payload was being written",
            self.request_id
        ))
    }
}

/// Header plus ring, shared by exactly one host endpoint and one plugin endpoint.
///
/// All header words are accessed atomically. Data bytes are written before the
/// writer position is published and read after it is observed, so the position
/// words carry the synchronization. Header transitions and ring writes go
/// through [`SharedSegment::publish`], so a reset never interleaves with a
/// half-written exchange.
pub struct SharedSegment {
    header: [AtomicU32; HEADER_WORDS],
    data: Box<[AtomicU8]>,
    publish_lock: Mutex<()>,
    lock: Mutex<()>,
    cond: Condvar,
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("capacity", &self.capacity())
            .field("status", &self.load(Word::Status))
            .field("request_id", &self.load(Word::RequestId))
            .field("writer_pos", &self.load(Word::WriterPos))
            .field("reader_pos", &self.load(Word::ReaderPos))
            .finish()
    }
}

impl SharedSegment {
    /// Allocates a segment of `total_bytes`, header included.
    pub fn new(total_bytes: usize) -> Result<Self, ReefError> {
        if total_bytes < MIN_SEGMENT_BYTES {
            return Err(ReefError::ChannelProtocolError(format!(
                "segment of {total_bytes} bytes is smaller than the minimum {MIN_SEGMENT_BYTES}"
            )));
        }
        let capacity = total_bytes - HEADER_BYTES;
        if capacity > u32::MAX as usize {
            return Err(ReefError::ChannelProtocolError(format!(
                "data region of {capacity} bytes does not fit a 32-bit position"
            )));
        }
        Ok(Self {
            header: Default::default(),
            data: (0..capacity).map(|_| AtomicU8::new(0)).collect(),
            publish_lock: Mutex::new(()),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        })
    }

    /// Size of the circular data region.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn load(&self, word: Word) -> u32 {
        self.header[word as usize].load(Ordering::SeqCst)
    }

    pub fn store(&self, word: Word, value: u32) {
        self.header[word as usize].store(value, Ordering::SeqCst);
    }

    /// Current status, or `None` if the word holds an unknown value.
    pub fn status(&self) -> Option<Status> {
        Status::from_word(self.load(Word::Status))
    }

    pub fn set_status(&self, status: Status) {
        self.publish(|| self.store(Word::Status, status as u32));
    }

    /// Runs `f` exclusively against other publishers, then wakes every waiter.
    ///
    /// `f` must not call back into `publish`, `set_status` or `reset`.
    pub(crate) fn publish<T>(&self, f: impl FnOnce() -> T) -> T {
        let out = {
            let _guard = self
                .publish_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            f()
        };
        self.notify();
        out
    }

    /// Wakes every waiter. Call after publishing a header change.
    pub fn notify(&self) {
        // Taking the lock orders this wakeup after any waiter's predicate check.
        drop(self.lock.lock().unwrap_or_else(PoisonError::into_inner));
        self.cond.notify_all();
    }

    /// Blocks until `ready` returns true or `deadline` passes.
    ///
    /// Returns whether the predicate was satisfied.
    pub fn wait_until(&self, deadline: Instant, mut ready: impl FnMut() -> bool) -> bool {
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if ready() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match self.cond.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Blocks while `word` still holds `expected`, up to `deadline`.
    pub fn wait_while(&self, word: Word, expected: u32, deadline: Instant) -> bool {
        self.wait_until(deadline, || self.load(word) != expected)
    }

    /// Bytes written but not yet read.
    pub fn used(&self) -> usize {
        let cap = self.capacity();
        let w = self.load(Word::WriterPos) as usize;
        let r = self.load(Word::ReaderPos) as usize;
        (w + cap - r) % cap
    }

    /// Bytes the producer may write without overtaking the reader.
    ///
    /// One byte is always left free so that `writer == reader` means empty.
    pub fn free(&self) -> usize {
        self.capacity() - self.used() - 1
    }

    /// Puts the exchange state back to an empty, idle channel.
    pub fn reset(&self) {
        self.publish(|| {
            self.store(Word::WriterPos, 0);
            self.store(Word::ReaderPos, 0);
            self.store(Word::TotalSize, 0);
            self.store(Word::ErrorCode, 0);
            self.store(Word::Status, Status::Idle as u32);
        });
    }

    /// Streams `bytes` into the ring, waiting for the reader when it is full.
    ///
    /// Fails with a protocol error as soon as the header no longer shows
    /// `exchange`, e.g. because the plugin gave up and reset the channel.
    pub(crate) fn write_stream(
        &self,
        bytes: &[u8],
        exchange: Exchange,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), ReefError> {
        let cap = self.capacity();
        let chunk = (self.load(Word::ChunkSize) as usize).max(1);
        let mut sent = 0;

        while sent < bytes.len() {
            if !self.wait_until(deadline, || self.free() > 0 || !exchange.is_current(self)) {
                return Err(channel_timeout("writing payload", timeout));
            }

            sent += self.publish(|| {
                if !exchange.is_current(self) {
                    return Err(exchange.abandoned());
                }
                let w = self.load(Word::WriterPos) as usize;
                let n = (bytes.len() - sent).min(self.free()).min(chunk).min(cap - w);
                for (slot, byte) in self.data[w..w + n].iter().zip(&bytes[sent..sent + n]) {
                    slot.store(*byte, Ordering::Relaxed);
                }
                self.store(Word::WriterPos, ((w + n) % cap) as u32);
                Ok(n)
            })?;
        }
        Ok(())
    }

    /// Drains `total` bytes from the ring as the writer produces them.
    pub(crate) fn read_stream(
        &self,
        total: usize,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Vec<u8>, ReefError> {
        let cap = self.capacity();
        let mut out = Vec::with_capacity(total);

        while out.len() < total {
            let mut available = 0;
            if !self.wait_until(deadline, || {
                available = self.used();
                available > 0
            }) {
                return Err(channel_timeout("reading payload", timeout));
            }

            let r = self.load(Word::ReaderPos) as usize;
            let n = (total - out.len()).min(available).min(cap - r);
            out.extend(self.data[r..r + n].iter().map(|b| b.load(Ordering::Relaxed)));
            self.store(Word::ReaderPos, ((r + n) % cap) as u32);
            self.notify();
        }
        Ok(out)
    }
}

pub(crate) fn channel_timeout(stage: &str, duration: Duration) -> ReefError {
    ReefError::ChannelTimeout {
        stage: stage.to_string(),
        duration,
    }
}
