use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tonic::async_trait;
use uuid::Uuid;

use super::{BlobWrite, CasPeer};
use crate::Digest;

/// A [CasPeer] keeping committed blobs in memory. Content is verified
/// against its digest on commit.
#[derive(Clone, Default)]
pub struct MemoryCasPeer {
    blobs: Arc<RwLock<HashMap<Digest, Bytes>>>,
    writes: Arc<AtomicUsize>,
}

impl MemoryCasPeer {
    pub fn get(&self, digest: &Digest) -> Option<Bytes> {
        self.blobs.read().get(digest).cloned()
    }

    /// How many writes were opened on this peer.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CasPeer for MemoryCasPeer {
    async fn blob_write(&self, digest: &Digest, _write_id: Uuid) -> io::Result<Box<dyn BlobWrite>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryBlobWrite {
            digest: digest.clone(),
            buf: BytesMut::new(),
            blobs: self.blobs.clone(),
        }))
    }
}

struct MemoryBlobWrite {
    digest: Digest,
    buf: BytesMut,
    blobs: Arc<RwLock<HashMap<Digest, Bytes>>>,
}

#[async_trait]
impl BlobWrite for MemoryBlobWrite {
    async fn reset(&mut self) -> io::Result<()> {
        self.buf.clear();
        Ok(())
    }

    async fn write(&mut self, data: Bytes) -> io::Result<()> {
        self.buf.extend_from_slice(&data);
        Ok(())
    }

    async fn commit(&mut self) -> io::Result<u64> {
        let contents = self.buf.split().freeze();
        let actual = self.digest.function().compute(&contents);
        if actual != self.digest {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected {}, got {}", self.digest, actual),
            ));
        }

        let size = contents.len() as u64;
        self.blobs.write().insert(actual, contents);
        Ok(size)
    }
}
