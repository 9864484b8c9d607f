//! Fixed-capacity FIFO queue shared between pipeline stages.
//!
//! A thin layer over a bounded [`tokio::sync::mpsc`] channel. The queue never
//! grows past its capacity. A put into a full queue fails with
//! [`Error::QueueFull`] and hands the item back, so callers decide whether to
//! drop, count or retry it. Timed operations never wait past the caller's
//! timeout.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::{
    self,
    error::{SendTimeoutError, TryRecvError, TrySendError},
};

use crate::{Error, Result};

/// An item the queue refused, together with the reason
#[derive(Debug)]
pub struct Rejected<T> {
    /// The item that was not enqueued
    pub item: T,
    /// Why it was refused ([`Error::QueueFull`], [`Error::QueueClosed`] or [`Error::Timeout`])
    pub error: Error,
}

impl<T> Rejected<T> {
    /// Take the item back
    pub fn into_inner(self) -> T {
        self.item
    }

    /// Whether the refusal was due to a full queue
    pub fn is_full(&self) -> bool {
        matches!(self.error, Error::QueueFull { .. } | Error::Timeout(_))
    }
}

/// Bounded multi-producer FIFO.
///
/// Consumers take turns on the receiving half; the non-blocking reads
/// ([`try_get`](Self::try_get), [`drain_up_to`](Self::drain_up_to)) see
/// nothing while another consumer is parked in [`get`](Self::get).
pub struct BoundedQueue<T> {
    // `None` once closed
    sender: Mutex<Option<mpsc::Sender<T>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<T>>,
    capacity: usize,
}

impl<T> core::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: tokio::sync::Mutex::new(rx),
            capacity,
        }
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::Sender<T>>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        if let Some(tx) = self.sender().as_ref() {
            return tx.max_capacity() - tx.capacity();
        }
        // closed: only the receiving half still knows
        self.receiver.try_lock().map(|rx| rx.len()).unwrap_or(0)
    }

    /// Whether the queue holds no items
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.sender().is_none()
    }

    /// Enqueue without waiting
    pub fn try_put(&self, item: T) -> core::result::Result<(), Rejected<T>> {
        let guard = self.sender();
        let Some(tx) = guard.as_ref() else {
            return Err(Rejected {
                item,
                error: Error::QueueClosed,
            });
        };
        tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(item) => Rejected {
                item,
                error: Error::QueueFull {
                    capacity: self.capacity,
                },
            },
            TrySendError::Closed(item) => Rejected {
                item,
                error: Error::QueueClosed,
            },
        })
    }

    /// Dequeue without waiting
    pub fn try_get(&self) -> Option<T> {
        self.receiver.try_lock().ok()?.try_recv().ok()
    }

    /// Enqueue, waiting up to `timeout` for free space.
    ///
    /// A put already waiting when the queue is closed may still land.
    pub async fn put(&self, item: T, timeout: Duration) -> core::result::Result<(), Rejected<T>> {
        let tx = match self.sender().as_ref() {
            Some(tx) => tx.clone(),
            None => {
                return Err(Rejected {
                    item,
                    error: Error::QueueClosed,
                })
            }
        };
        tx.send_timeout(item, timeout).await.map_err(|e| match e {
            SendTimeoutError::Timeout(item) => Rejected {
                item,
                error: Error::Timeout(timeout),
            },
            SendTimeoutError::Closed(item) => Rejected {
                item,
                error: Error::QueueClosed,
            },
        })
    }

    /// Dequeue, waiting up to `timeout` for an item.
    ///
    /// Returns [`Error::QueueClosed`] once the queue is closed and drained.
    pub async fn get(&self, timeout: Duration) -> Result<T> {
        let recv = async {
            let mut rx = self.receiver.lock().await;
            rx.recv().await
        };
        match tokio::time::timeout(timeout, recv).await {
            Ok(Some(item)) => Ok(item),
            Ok(None) => Err(Error::QueueClosed),
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    /// Take up to `max` immediately available items
    pub fn drain_up_to(&self, max: usize) -> Vec<T> {
        let Ok(mut rx) = self.receiver.try_lock() else {
            return Vec::new();
        };
        let mut drained = Vec::with_capacity(max.min(self.capacity));
        while drained.len() < max {
            match rx.try_recv() {
                Ok(item) => drained.push(item),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        drained
    }

    /// Refuse further puts. Queued items stay readable; consumers see
    /// [`Error::QueueClosed`] once they are drained.
    pub fn close(&self) {
        self.sender().take();
    }
}
