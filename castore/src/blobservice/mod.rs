use std::io;
use tonic::async_trait;

use crate::Digest;

mod memory;

pub use self::memory::MemoryBlobService;

/// The trait all sources of blob contents need to implement.
/// It provides functions to check whether a given blob exists, and a way to
/// read it. The local cache fetches missing content through it.
#[async_trait]
pub trait BlobService: Send + Sync {
    /// Check if the service has the blob, by its digest.
    async fn has(&self, digest: &Digest) -> io::Result<bool>;

    /// Request a blob from the store, by its digest.
    async fn open_read(&self, digest: &Digest) -> io::Result<Option<Box<dyn BlobReader>>>;
}

#[async_trait]
impl<A> BlobService for A
where
    A: AsRef<dyn BlobService> + Send + Sync,
{
    async fn has(&self, digest: &Digest) -> io::Result<bool> {
        self.as_ref().has(digest).await
    }

    async fn open_read(&self, digest: &Digest) -> io::Result<Option<Box<dyn BlobReader>>> {
        self.as_ref().open_read(digest).await
    }
}

/// BlobReader is a [tokio::io::AsyncRead] handed out by a [BlobService].
pub trait BlobReader: tokio::io::AsyncRead + Send + Unpin + 'static {}

impl BlobReader for io::Cursor<&'static [u8]> {}
impl BlobReader for io::Cursor<Vec<u8>> {}
impl BlobReader for io::Cursor<bytes::Bytes> {}
impl BlobReader for tokio::fs::File {}
