// SPDX-License-Identifier: Apache-2.0
//! A bounded semaphore that fails fast once its wait queue is full, instead
//! of growing memory without limit the way `tokio::sync::Semaphore` does.
//!
//! Ordinary `tokio::sync::Semaphore::acquire` parks the caller forever if
//! the permit count stays at zero. Under sustained overload that turns a
//! transient spike into an unbounded queue of stalled turns. This semaphore
//! instead tracks how many callers are already waiting and rejects new
//! acquisitions outright past `max_queue_size`, so the caller can shed load
//! with a `QUEUE_FULL` error rather than block indefinitely.

use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{oneshot, Mutex};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("queue full")]
pub struct QueueFull;

struct Inner {
    available: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
    max_queue_size: usize,
}

/// Cheaply cloneable; all clones share the same underlying permit count.
#[derive(Clone)]
pub struct BoundedSemaphore {
    inner: Arc<Mutex<Inner>>,
}

/// Held while a permit is checked out; returns it to the pool on drop.
pub struct Permit {
    inner: Arc<Mutex<Inner>>,
}

impl BoundedSemaphore {
    pub fn new(capacity: usize, max_queue_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                available: capacity,
                waiters: VecDeque::new(),
                max_queue_size,
            })),
        }
    }

    /// Acquire a permit, waiting if none are free. Fails immediately with
    /// [`QueueFull`] if the wait queue is already at capacity — it never
    /// blocks past that point.
    pub async fn acquire(&self) -> Result<Permit, QueueFull> {
        let rx = {
            let mut guard = self.inner.lock().await;
            if guard.available > 0 {
                guard.available -= 1;
                None
            } else if guard.waiters.len() >= guard.max_queue_size {
                return Err(QueueFull);
            } else {
                let (tx, rx) = oneshot::channel();
                guard.waiters.push_back(tx);
                Some(rx)
            }
        };

        if let Some(rx) = rx {
            // The sender side is only dropped by `release` handing off a
            // permit, never cancelled, so this can't fail.
            let _ = rx.await;
        }

        Ok(Permit {
            inner: self.inner.clone(),
        })
    }

    /// Number of permits currently free, for admin/metrics reporting.
    pub async fn available_permits(&self) -> usize {
        self.inner.lock().await.available
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.lock().await.waiters.len()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut guard = inner.lock().await;
            while let Some(waiter) = guard.waiters.pop_front() {
                if waiter.send(()).is_ok() {
                    return;
                }
                // Receiver already gone (e.g. task cancelled); try the next.
            }
            guard.available += 1;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_and_release_cycles_a_single_permit() {
        let sem = BoundedSemaphore::new(1, 10);
        let p1 = sem.acquire().await.unwrap();
        assert_eq!(sem.available_permits().await, 0);
        drop(p1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sem.available_permits().await, 1);
    }

    #[tokio::test]
    async fn queue_full_rejects_immediately() {
        let sem = BoundedSemaphore::new(1, 1);
        let _held = sem.acquire().await.unwrap();
        // one waiter fits
        let sem2 = sem.clone();
        let waiter = tokio::spawn(async move { sem2.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        // the queue is now full; a second concurrent acquire must fail fast
        let result = sem.acquire().await;
        assert_eq!(result.err(), Some(QueueFull));
        waiter.abort();
    }

    #[tokio::test]
    async fn waiter_is_woken_in_fifo_order() {
        let sem = BoundedSemaphore::new(1, 10);
        let held = sem.acquire().await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let sem = sem.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _p = sem.acquire().await.unwrap();
                order.lock().await.push(i);
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn acquire_without_contention_succeeds_immediately() {
        let sem = BoundedSemaphore::new(3, 0);
        let a = sem.acquire().await.unwrap();
        let b = sem.acquire().await.unwrap();
        assert_eq!(sem.available_permits().await, 1);
        drop(a);
        drop(b);
    }
}
