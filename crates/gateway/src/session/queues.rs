//! Bounded session queues.
//!
//! Every queue has capacity 100. Producers never block: overflow drops
//! the item with a warning. Consumers block (or wait with a deadline)
//! and unblock promptly when the session's stop token fires.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of every session queue.
const QUEUE_CAPACITY: usize = 100;

/// A bounded queue wired to the session's stop broadcast.
pub struct BoundedQueue<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    rx: tokio::sync::Mutex<mpsc::Receiver<T>>,
    stop: CancellationToken,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: &'static str, stop: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            name,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            stop,
        }
    }

    /// Non-blocking push. Returns `false` (and warns) when the queue is
    /// full or the session stopped.
    pub fn push(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(queue = self.name, "queue full, dropping item");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Blocking pop; `None` when the stop token fires or the queue is
    /// closed.
    pub async fn pop(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.stop.cancelled() => None,
            item = rx.recv() => item,
        }
    }

    /// Pop with a deadline; `None` on timeout, stop, or closure.
    pub async fn pop_timeout(&self, timeout: std::time::Duration) -> Option<T> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.stop.cancelled() => None,
            _ = tokio::time::sleep(timeout) => None,
            item = rx.recv() => item,
        }
    }

    /// Drain everything currently queued without blocking producers.
    pub fn clear(&self) {
        // try_lock avoids contending with a consumer parked in pop();
        // a parked consumer means the queue is already empty.
        if let Ok(mut rx) = self.rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn push_pop_roundtrip() {
        let q = BoundedQueue::new("test", CancellationToken::new());
        assert!(q.push(1));
        assert!(q.push(2));
        assert_eq!(q.pop().await, Some(1));
        assert_eq!(q.pop().await, Some(2));
    }

    #[tokio::test]
    async fn overflow_drops_without_blocking() {
        let q = BoundedQueue::new("test", CancellationToken::new());
        for i in 0..100 {
            assert!(q.push(i));
        }
        // 101st item is dropped, producer is not blocked.
        assert!(!q.push(100));
        assert_eq!(q.pop().await, Some(0));
    }

    #[tokio::test]
    async fn stop_unblocks_waiting_pop() {
        let stop = CancellationToken::new();
        let q = std::sync::Arc::new(BoundedQueue::<u32>::new("test", stop.clone()));

        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        stop.cancel();

        let popped = tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("pop did not unblock on stop")
            .unwrap();
        assert_eq!(popped, None);
    }

    #[tokio::test]
    async fn pop_timeout_expires() {
        let q = BoundedQueue::<u32>::new("test", CancellationToken::new());
        let start = std::time::Instant::now();
        assert_eq!(q.pop_timeout(Duration::from_millis(20)).await, None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn clear_drains_queued_items() {
        let q = BoundedQueue::new("test", CancellationToken::new());
        for i in 0..5 {
            q.push(i);
        }
        q.clear();
        assert_eq!(q.pop_timeout(Duration::from_millis(10)).await, None);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let stop = CancellationToken::new();
        let q = BoundedQueue::<u32>::new("test", stop.clone());
        stop.cancel();
        stop.cancel();
        assert_eq!(q.pop().await, None);
    }
}
