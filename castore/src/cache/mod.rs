//! The reference-counted local content cache that exec directories are
//! materialized from.
use std::{io, path::PathBuf, sync::Arc};
use tonic::async_trait;

use crate::{DirectoriesIndex, Digest};

mod local;

pub use self::local::LocalCache;

/// Outcome of [Cache::put_directory].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutDirectoryResult {
    /// Where the materialized directory lives.
    pub path: PathBuf,
    /// Whether the directory had to be materialized by this call.
    pub missed: bool,
}

/// A content-addressed store mapping digests to paths on the local disk.
///
/// Every successful `put` and `put_directory` takes a reference on the
/// entry, which is given back through [Cache::decrement_references].
#[async_trait]
pub trait Cache: Send + Sync {
    /// The cache key for a file with the given digest and executable bit.
    fn key(&self, digest: &Digest, executable: bool) -> String;

    /// Ensure the file is present, returning its path.
    async fn put(&self, digest: &Digest, executable: bool) -> io::Result<PathBuf>;

    /// Ensure the whole directory tree rooted at `digest` is present,
    /// resolving subdirectories through `index`.
    async fn put_directory(
        &self,
        digest: &Digest,
        index: Arc<DirectoriesIndex>,
    ) -> io::Result<PutDirectoryResult>;

    /// Give back references taken by earlier calls to `put` (by key) and
    /// `put_directory` (by digest).
    fn decrement_references(&self, keys: &[String], directories: &[Digest]);
}
