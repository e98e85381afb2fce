use bytes::Bytes;
use parking_lot::RwLock;
use std::io::{self, Cursor};
use std::{collections::HashMap, sync::Arc};
use tonic::async_trait;
use tracing::instrument;

use super::{BlobReader, BlobService};
use crate::{Digest, DigestFunction};

#[derive(Clone, Default)]
pub struct MemoryBlobService {
    db: Arc<RwLock<HashMap<Digest, Bytes>>>,
}

impl MemoryBlobService {
    /// Inserts a blob, returning its digest.
    pub fn put(&self, function: DigestFunction, contents: impl Into<Bytes>) -> Digest {
        let contents = contents.into();
        let digest = function.compute(&contents);
        self.db.write().entry(digest.clone()).or_insert(contents);
        digest
    }

    /// Inserts a blob under a digest without checking it matches, so
    /// tests can exercise content verification.
    pub fn put_unchecked(&self, digest: Digest, contents: impl Into<Bytes>) {
        self.db.write().insert(digest, contents.into());
    }
}

#[async_trait]
impl BlobService for MemoryBlobService {
    #[instrument(skip(self, digest), fields(blob.digest=%digest))]
    async fn has(&self, digest: &Digest) -> io::Result<bool> {
        Ok(self.db.read().contains_key(digest))
    }

    #[instrument(skip(self, digest), fields(blob.digest=%digest))]
    async fn open_read(&self, digest: &Digest) -> io::Result<Option<Box<dyn BlobReader>>> {
        Ok(self
            .db
            .read()
            .get(digest)
            .map(|contents| Box::new(Cursor::new(contents.clone())) as Box<dyn BlobReader>))
    }
}
