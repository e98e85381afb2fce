use std::{
    collections::HashMap,
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::OnceCell,
};
use tonic::async_trait;
use tracing::{debug, instrument, warn};

use super::{Cache, PutDirectoryResult};
use crate::{blobservice::BlobService, DirectoriesIndex, Digest, Node};

const READ_CHUNK_SIZE: usize = 64 * 1024;

struct Entry {
    references: u64,
    /// Initialized once the entry's content is published on disk.
    present: Arc<OnceCell<()>>,
}

impl Entry {
    fn new() -> Self {
        Self {
            references: 0,
            present: Arc::new(OnceCell::new()),
        }
    }
}

/// A [Cache] keeping its content in a single directory on the local disk.
///
/// Files live at `<root>/<hash>` (mode 0444) or `<root>/<hash>_exec`
/// (mode 0555), directory trees at `<root>/<hash>_dir`. Missing content is
/// read from a [BlobService] and verified against its digest before being
/// published with a rename. Concurrent requests for the same key share one
/// fetch.
///
/// Entries are never evicted, an entry whose count drops to zero stays on
/// disk.
pub struct LocalCache<BS> {
    root: PathBuf,
    blob_service: BS,
    entries: Mutex<HashMap<String, Entry>>,
}

impl<BS: BlobService> LocalCache<BS> {
    pub async fn new(root: PathBuf, blob_service: BS) -> io::Result<Self> {
        tokio::fs::create_dir_all(&root).await?;

        Ok(Self {
            root,
            blob_service,
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The key a directory tree is stored under.
    pub fn directory_key(&self, digest: &Digest) -> String {
        format!("{}_dir", digest.hash_hex())
    }

    /// The number of outstanding references on a key, zero for unknown keys.
    pub fn references(&self, key: &str) -> u64 {
        self.entries
            .lock()
            .get(key)
            .map(|entry| entry.references)
            .unwrap_or(0)
    }

    /// Looks up (or creates) the entry for a key, returning the cell that
    /// gates its content.
    fn entry(&self, key: &str) -> Arc<OnceCell<()>> {
        self.entries
            .lock()
            .entry(key.to_string())
            .or_insert_with(Entry::new)
            .present
            .clone()
    }

    fn reference(&self, key: &str) {
        self.entries
            .lock()
            .entry(key.to_string())
            .or_insert_with(Entry::new)
            .references += 1;
    }

    /// Reads a blob from the blob service into `path`, verifying its digest.
    #[instrument(skip_all, err, fields(blob.digest=%digest))]
    async fn fetch(&self, digest: &Digest, executable: bool, path: &Path) -> io::Result<()> {
        let mut reader = self.blob_service.open_read(digest).await?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("blob {} not found", digest),
            )
        })?;

        let incoming = incoming_path(path);
        let mut file = tokio::fs::File::create(&incoming).await?;
        let mut hasher = digest.function().hasher();
        let mut buf = vec![0; READ_CHUNK_SIZE];

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
        }
        file.flush().await?;
        drop(file);

        let actual = hasher.finalize();
        if &actual != digest {
            tokio::fs::remove_file(&incoming).await?;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("blob {} has digest {}", digest, actual),
            ));
        }

        let mode = if executable { 0o555 } else { 0o444 };
        tokio::fs::set_permissions(&incoming, std::fs::Permissions::from_mode(mode)).await?;
        tokio::fs::rename(&incoming, path).await?;

        debug!(path=?path, "fetched blob");
        Ok(())
    }

    /// Builds the directory tree for `digest` at `path`. Files are hard
    /// links to entries of this cache, the directory keeps the references
    /// on them.
    #[instrument(skip_all, err, fields(directory.digest=%digest))]
    async fn fetch_directory(
        &self,
        digest: &Digest,
        index: &DirectoriesIndex,
        path: &Path,
    ) -> io::Result<()> {
        let incoming = incoming_path(path);
        match tokio::fs::remove_dir_all(&incoming).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        tokio::fs::create_dir(&incoming).await?;

        let mut stack = vec![(digest.clone(), incoming.clone())];
        while let Some((digest, dir_path)) = stack.pop() {
            let directory = match index.get(&digest) {
                Some(directory) => directory,
                None if digest.is_empty() => continue,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("directory {} missing from index", digest),
                    ))
                }
            };

            for (name, node) in directory.nodes() {
                let node_path = dir_path.join(name);
                match node {
                    Node::Directory { digest } => {
                        tokio::fs::create_dir(&node_path).await?;
                        stack.push((digest.clone(), node_path));
                    }
                    Node::File { digest, .. } if digest.is_empty() => {
                        tokio::fs::File::create(&node_path).await?;
                    }
                    Node::File { digest, executable } => {
                        let file_path = self.put(digest, *executable).await?;
                        tokio::fs::hard_link(&file_path, &node_path).await?;
                    }
                    Node::Symlink { target } => {
                        tokio::fs::symlink(target, &node_path).await?;
                    }
                }
            }
        }

        tokio::fs::rename(&incoming, path).await
    }
}

#[async_trait]
impl<BS: BlobService> Cache for LocalCache<BS> {
    fn key(&self, digest: &Digest, executable: bool) -> String {
        if executable {
            format!("{}_exec", digest.hash_hex())
        } else {
            digest.hash_hex()
        }
    }

    #[instrument(skip(self, digest), fields(blob.digest=%digest), err)]
    async fn put(&self, digest: &Digest, executable: bool) -> io::Result<PathBuf> {
        let key = self.key(digest, executable);
        let path = self.root.join(&key);

        self.entry(&key)
            .get_or_try_init(|| self.fetch(digest, executable, &path))
            .await?;
        self.reference(&key);

        Ok(path)
    }

    #[instrument(skip(self, digest, index), fields(directory.digest=%digest), err)]
    async fn put_directory(
        &self,
        digest: &Digest,
        index: Arc<DirectoriesIndex>,
    ) -> io::Result<PutDirectoryResult> {
        let key = self.directory_key(digest);
        let path = self.root.join(&key);

        let present = self.entry(&key);
        let missed = !present.initialized();
        present
            .get_or_try_init(|| self.fetch_directory(digest, &index, &path))
            .await?;
        self.reference(&key);

        Ok(PutDirectoryResult { path, missed })
    }

    fn decrement_references(&self, keys: &[String], directories: &[Digest]) {
        let mut entries = self.entries.lock();
        let directory_keys = directories.iter().map(|digest| self.directory_key(digest));

        for key in keys.iter().cloned().chain(directory_keys) {
            match entries.get_mut(&key) {
                Some(entry) if entry.references > 0 => entry.references -= 1,
                Some(_) => warn!(key=%key, "reference count already zero"),
                None => warn!(key=%key, "decrementing unknown key"),
            }
        }
    }
}

fn incoming_path(path: &Path) -> PathBuf {
    let mut incoming = path.as_os_str().to_owned();
    incoming.push(".incoming");
    PathBuf::from(incoming)
}
