//! Replicates blobs into the CAS of another worker.
use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::{Bytes, BytesMut};
use farmhand_castore::{write::CasPeer, Digest};
use rand::Rng;
use tokio::io::AsyncReadExt;
use tracing::{instrument, warn, Span};
use uuid::Uuid;

use crate::{backplane::Backplane, retrier::RetryPolicy, stubs::WorkerStubs};

/// Size of the chunks a blob is streamed in.
pub const CHUNK_SIZE: usize = 128 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no available workers")]
    NoAvailableWorkers,

    #[error("unable to list storage workers: {0}")]
    Backplane(#[source] io::Error),

    #[error("stub instance creation must not fail: {0}")]
    Stub(#[from] crate::stubs::Error),
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Backplane(e) => e,
            e => io::Error::other(e),
        }
    }
}

/// Where the content of a blob comes from. Reopened for every attempt.
#[derive(Debug, Clone)]
enum Source {
    File(PathBuf),
    Bytes(Bytes),
}

/// Writes blobs to a storage worker picked at random, retrying failed
/// attempts on a fresh pick.
pub struct RemoteCasWriter {
    backplane: Arc<dyn Backplane>,
    stubs: Arc<WorkerStubs>,
    retry: RetryPolicy,

    succeeded: AtomicU64,
    failed: AtomicU64,
    size_mismatches: AtomicU64,
}

impl RemoteCasWriter {
    pub fn new(backplane: Arc<dyn Backplane>, stubs: Arc<WorkerStubs>, retry: RetryPolicy) -> Self {
        Self {
            backplane,
            stubs,
            retry,
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            size_mismatches: AtomicU64::new(0),
        }
    }

    /// Writes the file at `path`, whose content must match `digest`.
    /// Returns the size of the digest.
    #[instrument(skip(self, digest), fields(digest = %digest, worker = tracing::field::Empty), err)]
    pub async fn write(&self, digest: &Digest, path: &Path) -> io::Result<u64> {
        self.insert(digest, Source::File(path.to_path_buf())).await
    }

    /// Writes an in-memory blob.
    #[instrument(skip(self, digest, contents), fields(digest = %digest, worker = tracing::field::Empty), err)]
    pub async fn insert_blob(&self, digest: &Digest, contents: Bytes) -> io::Result<u64> {
        self.insert(digest, Source::Bytes(contents)).await
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Commits whose size differed from the digest.
    pub fn size_mismatches(&self) -> u64 {
        self.size_mismatches.load(Ordering::Relaxed)
    }

    async fn insert(&self, digest: &Digest, source: Source) -> io::Result<u64> {
        if digest.is_empty() {
            return Ok(0);
        }

        let source = &source;
        let result = self
            .retry
            .retry(move || self.write_to_cas_member(digest, source))
            .await;

        match result {
            Ok(_) => self.succeeded.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// One attempt: picks a worker and streams the whole source to it.
    async fn write_to_cas_member(&self, digest: &Digest, source: &Source) -> io::Result<u64> {
        let worker = self.random_worker().await?;
        Span::current().record("worker", worker.as_str());
        let peer = self.stubs.get(&worker).map_err(Error::from)?;

        let committed = stream_into(peer.as_ref(), digest, source).await?;
        if committed != digest.size_bytes() {
            self.size_mismatches.fetch_add(1, Ordering::Relaxed);
            warn!(
                digest = %digest,
                worker = %worker,
                committed,
                "committed size did not match the digest"
            );
        }
        Ok(digest.size_bytes())
    }

    async fn random_worker(&self) -> Result<String, Error> {
        let workers = self
            .backplane
            .storage_workers()
            .await
            .map_err(Error::Backplane)?;
        if workers.is_empty() {
            return Err(Error::NoAvailableWorkers);
        }

        let index = rand::thread_rng().gen_range(0..workers.len());
        workers
            .into_iter()
            .nth(index)
            .ok_or(Error::NoAvailableWorkers)
    }
}

/// Resets a fresh write on `peer` and feeds `source` into it chunk by chunk.
/// Returns the committed size.
async fn stream_into(peer: &dyn CasPeer, digest: &Digest, source: &Source) -> io::Result<u64> {
    let mut write = peer.blob_write(digest, Uuid::new_v4()).await?;
    write.reset().await?;

    match source {
        Source::File(path) => {
            let mut file = tokio::fs::File::open(path).await?;
            loop {
                let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
                while buf.len() < CHUNK_SIZE {
                    if file.read_buf(&mut buf).await? == 0 {
                        break;
                    }
                }
                if buf.is_empty() {
                    break;
                }
                write.write(buf.freeze()).await?;
            }
        }
        Source::Bytes(contents) => {
            let mut offset = 0;
            while offset < contents.len() {
                let end = (offset + CHUNK_SIZE).min(contents.len());
                write.write(contents.slice(offset..end)).await?;
                offset = end;
            }
        }
    }

    write.commit().await
}
