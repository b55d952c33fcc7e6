//! Warmable per-kind provider pool.
//!
//! Each pool is parameterized by a [`PoolFactory`] with three hooks:
//! `create` (build a fresh provider), `reset` (called on release; must
//! leave the provider reusable — providers hold HTTP state that can be
//! poisoned by cancellation), and `destroy` (dispose of a provider).
//!
//! Acquire order: warm channel (non-blocking) → idle stash → create.
//! Release order: reset → warm channel (non-blocking) → idle stash.
//! A failed reset destroys the item and surfaces the error.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Errors specific to pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool is closed")]
    Closed,

    #[error("create failed: {0}")]
    Create(String),

    #[error("reset failed: {0}")]
    Reset(String),
}

impl From<PoolError> for vx_domain::error::Error {
    fn from(e: PoolError) -> Self {
        vx_domain::error::Error::Pool(e.to_string())
    }
}

/// Lifecycle hooks for one provider kind.
#[async_trait::async_trait]
pub trait PoolFactory: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Build a fresh provider.
    async fn create(&self) -> Result<Self::Item, PoolError>;

    /// Return a provider to a reusable state. Failure destroys it.
    async fn reset(&self, item: &mut Self::Item) -> Result<(), PoolError>;

    /// Dispose of a provider.
    async fn destroy(&self, item: Self::Item);
}

/// A point-in-time view of pool accounting.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PoolStats {
    pub created: u64,
    pub in_use: u64,
    pub warmed: u64,
    pub idle: usize,
}

/// A warmable pool for one provider kind.
pub struct Pool<F: PoolFactory> {
    factory: F,
    warm_tx: mpsc::Sender<F::Item>,
    warm_rx: Mutex<mpsc::Receiver<F::Item>>,
    idle: Mutex<Vec<F::Item>>,
    warm_size: usize,
    created: AtomicU64,
    in_use: AtomicU64,
    warmed: AtomicU64,
    closed: AtomicBool,
}

impl<F: PoolFactory> Pool<F> {
    pub fn new(factory: F, warm_size: usize) -> Self {
        // A zero-capacity channel is not allowed; a warm size of zero
        // degrades the pool to lazy create/idle-stash behavior.
        let (warm_tx, warm_rx) = mpsc::channel(warm_size.max(1));
        Self {
            factory,
            warm_tx,
            warm_rx: Mutex::new(warm_rx),
            idle: Mutex::new(Vec::new()),
            warm_size,
            created: AtomicU64::new(0),
            in_use: AtomicU64::new(0),
            warmed: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Take a provider: warm channel first, then the idle stash, then
    /// a fresh create.
    pub async fn acquire(&self) -> Result<F::Item, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        if let Ok(item) = self.warm_rx.lock().try_recv() {
            self.warmed.fetch_sub(1, Ordering::AcqRel);
            self.in_use.fetch_add(1, Ordering::AcqRel);
            return Ok(item);
        }

        if let Some(item) = self.idle.lock().pop() {
            self.in_use.fetch_add(1, Ordering::AcqRel);
            return Ok(item);
        }

        let item = self.factory.create().await?;
        self.created.fetch_add(1, Ordering::AcqRel);
        self.in_use.fetch_add(1, Ordering::AcqRel);
        Ok(item)
    }

    /// Return a provider. Reset failures destroy the item and surface
    /// the error; otherwise the item is parked warm (or idle when the
    /// warm channel is full).
    pub async fn release(&self, mut item: F::Item) -> Result<(), PoolError> {
        self.in_use.fetch_sub(1, Ordering::AcqRel);

        if let Err(e) = self.factory.reset(&mut item).await {
            self.created.fetch_sub(1, Ordering::AcqRel);
            self.factory.destroy(item).await;
            return Err(e);
        }

        if self.closed.load(Ordering::Acquire) || self.warm_size == 0 {
            if self.closed.load(Ordering::Acquire) {
                self.created.fetch_sub(1, Ordering::AcqRel);
                self.factory.destroy(item).await;
            } else {
                self.idle.lock().push(item);
            }
            return Ok(());
        }

        match self.warm_tx.try_send(item) {
            Ok(()) => {
                self.warmed.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(item))
            | Err(mpsc::error::TrySendError::Closed(item)) => {
                self.idle.lock().push(item);
                Ok(())
            }
        }
    }

    /// Destroy a provider unconditionally (used when a partially
    /// acquired set is rolled back).
    pub async fn drop_item(&self, item: F::Item) {
        self.created.fetch_sub(1, Ordering::AcqRel);
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        self.factory.destroy(item).await;
    }

    /// Pre-create up to `min(n, warm_size)` providers and park them in
    /// the warm channel. Create failures are logged and skipped.
    pub async fn warmup(&self, n: usize) {
        let target = n.min(self.warm_size);
        for i in 0..target {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            match self.factory.create().await {
                Ok(item) => {
                    self.created.fetch_add(1, Ordering::AcqRel);
                    match self.warm_tx.try_send(item) {
                        Ok(()) => {
                            self.warmed.fetch_add(1, Ordering::AcqRel);
                        }
                        Err(mpsc::error::TrySendError::Full(item))
                        | Err(mpsc::error::TrySendError::Closed(item)) => {
                            self.idle.lock().push(item);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(index = i, error = %e, "warmup create failed, skipping");
                }
            }
        }
    }

    /// Block new acquires and destroy everything parked.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);

        let parked: Vec<F::Item> = {
            let mut rx = self.warm_rx.lock();
            let mut items = Vec::new();
            while let Ok(item) = rx.try_recv() {
                self.warmed.fetch_sub(1, Ordering::AcqRel);
                items.push(item);
            }
            items.extend(self.idle.lock().drain(..));
            items
        };

        for item in parked {
            self.created.fetch_sub(1, Ordering::AcqRel);
            self.factory.destroy(item).await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Acquire),
            in_use: self.in_use.load(Ordering::Acquire),
            warmed: self.warmed.load(Ordering::Acquire),
            idle: self.idle.lock().len(),
        }
    }
}
