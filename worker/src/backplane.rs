use std::{collections::HashSet, io};

use parking_lot::RwLock;
use tonic::async_trait;

/// The cluster-wide view this worker consults.
#[async_trait]
pub trait Backplane: Send + Sync {
    /// Addresses of the workers currently storing blobs. May be empty.
    async fn storage_workers(&self) -> io::Result<HashSet<String>>;
}

/// A [Backplane] with a fixed set of storage workers, which can be changed
/// at runtime.
#[derive(Debug, Default)]
pub struct StaticBackplane {
    storage_workers: RwLock<HashSet<String>>,
}

impl StaticBackplane {
    pub fn new<I, S>(storage_workers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            storage_workers: RwLock::new(storage_workers.into_iter().map(Into::into).collect()),
        }
    }

    pub fn add_storage_worker(&self, peer: impl Into<String>) {
        self.storage_workers.write().insert(peer.into());
    }

    pub fn remove_storage_worker(&self, peer: &str) -> bool {
        self.storage_workers.write().remove(peer)
    }
}

#[async_trait]
impl Backplane for StaticBackplane {
    async fn storage_workers(&self) -> io::Result<HashSet<String>> {
        Ok(self.storage_workers.read().clone())
    }
}
