//! Capacity tokens. Work is only admitted while enough claims are
//! available, and a claim gives its capacity back when dropped.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("claim pool is closed")]
pub struct Closed;

struct Inner {
    semaphore: Arc<Semaphore>,
    size: u32,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// A fixed amount of capacity handed out as [Claim]s.
#[derive(Clone)]
pub struct ClaimPool {
    inner: Arc<Inner>,
}

impl ClaimPool {
    pub fn new(size: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(size as usize)),
                size,
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    /// Waits until `count` claims are available. Requests for more than the
    /// pool holds are capped to its size.
    pub async fn acquire(&self, count: u32) -> Result<Claim, Closed> {
        let count = count.clamp(1, self.inner.size.max(1));
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_many_owned(count)
            .await
            .map_err(|_| Closed)?;

        Ok(self.claim(permit, count))
    }

    pub fn try_acquire(&self, count: u32) -> Option<Claim> {
        let count = count.clamp(1, self.inner.size.max(1));
        let permit = self
            .inner
            .semaphore
            .clone()
            .try_acquire_many_owned(count)
            .ok()?;

        Some(self.claim(permit, count))
    }

    fn claim(&self, permit: OwnedSemaphorePermit, count: u32) -> Claim {
        self.inner
            .acquired
            .fetch_add(count as u64, Ordering::SeqCst);
        Claim {
            _permit: permit,
            pool: self.inner.clone(),
            count,
        }
    }

    /// Fails all pending and future acquisitions.
    pub fn close(&self) {
        self.inner.semaphore.close()
    }

    pub fn size(&self) -> u32 {
        self.inner.size
    }

    pub fn available(&self) -> u32 {
        self.inner.semaphore.available_permits() as u32
    }

    /// Total number of claims handed out so far.
    pub fn acquired(&self) -> u64 {
        self.inner.acquired.load(Ordering::SeqCst)
    }

    /// Total number of claims given back so far.
    pub fn released(&self) -> u64 {
        self.inner.released.load(Ordering::SeqCst)
    }
}

/// Capacity held on a [ClaimPool], given back on drop.
pub struct Claim {
    _permit: OwnedSemaphorePermit,
    pool: Arc<Inner>,
    count: u32,
}

impl Claim {
    pub fn count(&self) -> u32 {
        self.count
    }
}

impl std::fmt::Debug for Claim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Claim").field("count", &self.count).finish()
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.pool
            .released
            .fetch_add(self.count as u64, Ordering::SeqCst);
    }
}
