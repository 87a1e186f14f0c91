//! Fixed-capacity multi-producer, single-consumer frame queue.
//!
//! Producers never block longer than their push timeout: a full queue means
//! the newest frame is dropped and the caller is told so. The consumer pops
//! with a short timeout and treats "empty" as idle, not as an error.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use thiserror::Error;

/// Why a push did not enqueue its item. The item is handed back.
#[derive(Debug, Error)]
pub enum PushError<T> {
    #[error("frame channel full")]
    Full(T),
    #[error("frame channel closed")]
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) | PushError::Closed(item) => item,
        }
    }
}

/// Outcome of a single consumer pop.
#[derive(Debug)]
pub enum Pop<T> {
    Item(T),
    Empty,
    Closed,
}

/// Consumer side. Owns the only receiver; hands out [`FrameProducer`]s.
///
/// Closing drops the receiver, which disconnects every producer at once,
/// including one blocked in a push.
pub struct FrameChannel<T> {
    tx: Sender<T>,
    rx: Option<Receiver<T>>,
    capacity: usize,
}

/// Cloneable producer handle, one per ingestor.
pub struct FrameProducer<T> {
    tx: Sender<T>,
}

impl<T> Clone for FrameProducer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> FrameChannel<T> {
    /// Create a channel holding at most `capacity` items. Capacity is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx: Some(rx),
            capacity,
        }
    }

    pub fn producer(&self) -> FrameProducer<T> {
        FrameProducer {
            tx: self.tx.clone(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.as_ref().map_or(0, Receiver::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.rx.is_none()
    }

    /// Wait up to `timeout` for the next item.
    pub fn pop(&self, timeout: Duration) -> Pop<T> {
        let Some(rx) = &self.rx else {
            return Pop::Closed;
        };
        match rx.recv_timeout(timeout) {
            Ok(item) => Pop::Item(item),
            Err(RecvTimeoutError::Timeout) => Pop::Empty,
            Err(RecvTimeoutError::Disconnected) => Pop::Closed,
        }
    }

    /// Refuse further pushes and discard anything still queued. Returns the
    /// number of items discarded. Idempotent.
    pub fn close(&mut self) -> usize {
        let Some(rx) = self.rx.take() else {
            return 0;
        };
        // Dropping the last receiver disconnects producers and discards the queue.
        let discarded = rx.len();
        drop(rx);
        discarded
    }
}

impl<T> FrameProducer<T> {
    /// Enqueue `item`, waiting at most `timeout` for space.
    pub fn push(&self, item: T, timeout: Duration) -> Result<(), PushError<T>> {
        match self.tx.send_timeout(item, timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(item)) => Err(PushError::Full(item)),
            Err(SendTimeoutError::Disconnected(item)) => Err(PushError::Closed(item)),
        }
    }
}
