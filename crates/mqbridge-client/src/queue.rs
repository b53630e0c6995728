//! Per-subscription receive queue.
//!
//! Two overflow policies, fixed at construction:
//! - circular (`capacity > 0`): a full queue overwrites its oldest unread
//!   message, which is handed back to the caller and counted as lost
//! - unbounded (`capacity == 0`): messages are appended until read
//!
//! Reads either move up to `max` messages into caller storage, or (with an
//! empty buffer and [`UNLIMITED`]) loan every queued message at once. While a
//! loan is outstanding the queue refuses both reads and receives until
//! [`MessageReceiveQueue::return_loan`] is called.

use std::collections::VecDeque;

use mqbridge_core::ReceivedMessage;
use parking_lot::Mutex;

use crate::error::{ClientError, Result};

/// Read count meaning "everything queued".
pub const UNLIMITED: usize = usize::MAX;

/// Message counters. `unread` always equals the number of queued messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub received: u64,
    pub unread: u64,
    pub read: u64,
    pub lost: u64,
}

struct Ring {
    slots: Vec<Option<ReceivedMessage>>,
    /// Oldest unread slot.
    head: usize,
    size: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            size: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Store `msg`, returning the message it displaced, if any.
    fn push(&mut self, msg: ReceivedMessage) -> Option<ReceivedMessage> {
        let cap = self.capacity();
        if self.size < cap {
            let next = (self.head + self.size) % cap;
            self.slots[next] = Some(msg);
            self.size += 1;
            None
        } else {
            // Full: the next write slot is the oldest unread one
            let dropped = self.slots[self.head].replace(msg);
            self.head = (self.head + 1) % cap;
            dropped
        }
    }

    fn pop(&mut self) -> Option<ReceivedMessage> {
        if self.size == 0 {
            return None;
        }
        let msg = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.size -= 1;
        msg
    }
}

enum Storage {
    Circular(Ring),
    Unbounded(VecDeque<ReceivedMessage>),
}

impl Storage {
    fn len(&self) -> usize {
        match self {
            Storage::Circular(ring) => ring.size,
            Storage::Unbounded(queue) => queue.len(),
        }
    }
}

struct Inner {
    storage: Storage,
    loaned: bool,
    stats: QueueStats,
}

/// Inbound message buffer owned by one subscription.
pub struct MessageReceiveQueue {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl MessageReceiveQueue {
    /// Create a queue; `capacity == 0` selects unbounded mode.
    pub fn new(capacity: usize) -> Self {
        let storage = if capacity == 0 {
            Storage::Unbounded(VecDeque::new())
        } else {
            Storage::Circular(Ring::new(capacity))
        };
        Self {
            capacity,
            inner: Mutex::new(Inner {
                storage,
                loaned: false,
                stats: QueueStats::default(),
            }),
        }
    }

    /// Configured capacity (0 = unbounded).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_unbounded(&self) -> bool {
        self.capacity == 0
    }

    /// Number of unread messages.
    pub fn len(&self) -> usize {
        self.inner.lock().storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_loaned(&self) -> bool {
        self.inner.lock().loaned
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.lock().stats
    }

    /// Enqueue a message. Returns the message dropped to make room, if any.
    pub fn receive(&self, msg: ReceivedMessage) -> Result<Option<ReceivedMessage>> {
        let mut inner = self.inner.lock();
        if inner.loaned {
            return Err(ClientError::ReadInProgress);
        }

        let dropped = match &mut inner.storage {
            Storage::Circular(ring) => ring.push(msg),
            Storage::Unbounded(queue) => {
                queue.push_back(msg);
                None
            }
        };

        inner.stats.received += 1;
        inner.stats.unread += 1;
        if dropped.is_some() {
            inner.stats.lost += 1;
            inner.stats.unread -= 1;
        }
        Ok(dropped)
    }

    /// Read unread messages in arrival order.
    ///
    /// - `max == UNLIMITED` with an empty `out`: loan. `out` receives every
    ///   queued message and the queue stays loaned until `return_loan`.
    /// - `max == UNLIMITED` with a non-empty `out`: rejected.
    /// - otherwise: moves up to `max` messages onto the end of `out`.
    ///
    /// Returns the number of messages read.
    pub fn read(&self, max: usize, out: &mut Vec<ReceivedMessage>) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.loaned {
            return Err(ClientError::ReadInProgress);
        }

        let loan = max == UNLIMITED;
        if loan && !out.is_empty() {
            return Err(ClientError::InvalidState(
                "unlimited read requires an empty output buffer".to_string(),
            ));
        }

        let n = match &mut inner.storage {
            Storage::Unbounded(queue) if loan => {
                let n = queue.len();
                *out = Vec::from(std::mem::take(queue));
                n
            }
            Storage::Unbounded(queue) => {
                let n = max.min(queue.len());
                out.extend(queue.drain(..n));
                n
            }
            Storage::Circular(ring) => {
                let n = max.min(ring.size);
                out.reserve(n);
                for _ in 0..n {
                    if let Some(msg) = ring.pop() {
                        out.push(msg);
                    }
                }
                n
            }
        };

        if loan && n > 0 {
            inner.loaned = true;
        }
        inner.stats.unread -= n as u64;
        inner.stats.read += n as u64;
        Ok(n)
    }

    /// Release a loaned batch. Unconsumed entries are dropped.
    pub fn return_loan(&self, messages: Vec<ReceivedMessage>) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.loaned {
            return Err(ClientError::NoReadInProgress);
        }
        inner.loaned = false;

        let mut buf = messages;
        buf.clear();
        // Reuse the returned allocation as unbounded storage
        if let Storage::Unbounded(queue) = &mut inner.storage {
            if queue.is_empty() && queue.capacity() < buf.capacity() {
                *queue = VecDeque::from(buf);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MessageReceiveQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MessageReceiveQueue")
            .field("capacity", &self.capacity)
            .field("len", &inner.storage.len())
            .field("loaned", &inner.loaned)
            .field("stats", &inner.stats)
            .finish()
    }
}
