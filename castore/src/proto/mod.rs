//! Wire messages exchanged with other remote execution nodes.
//!
//! These mirror the subset of `build.bazel.remote.execution.v2` and
//! `google.bytestream` that the worker needs, with the same field numbers, so
//! the canonical encoding (and thus directory digests) matches other
//! implementations.
use prost::Message;

mod bytestream;

pub use bytestream::ByteStreamClient;

use crate::{digests::DigestFunction, DirectoryError, Node, ValidateNodeError};

#[derive(Clone, PartialEq, Eq, Hash, Message)]
pub struct Digest {
    #[prost(string, tag = "1")]
    pub hash: String,
    #[prost(int64, tag = "2")]
    pub size_bytes: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct FileNode {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub digest: Option<Digest>,
    #[prost(bool, tag = "4")]
    pub is_executable: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct DirectoryNode {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub digest: Option<Digest>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SymlinkNode {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub target: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Directory {
    #[prost(message, repeated, tag = "1")]
    pub files: Vec<FileNode>,
    #[prost(message, repeated, tag = "2")]
    pub directories: Vec<DirectoryNode>,
    #[prost(message, repeated, tag = "3")]
    pub symlinks: Vec<SymlinkNode>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WriteRequest {
    #[prost(string, tag = "1")]
    pub resource_name: String,
    #[prost(int64, tag = "2")]
    pub write_offset: i64,
    #[prost(bool, tag = "3")]
    pub finish_write: bool,
    #[prost(bytes = "bytes", tag = "10")]
    pub data: bytes::Bytes,
}

#[derive(Clone, PartialEq, Message)]
pub struct WriteResponse {
    #[prost(int64, tag = "1")]
    pub committed_size: i64,
}

impl From<&crate::Digest> for Digest {
    fn from(value: &crate::Digest) -> Self {
        Self {
            hash: value.hash_hex(),
            size_bytes: value.size_bytes() as i64,
        }
    }
}

impl Digest {
    /// Converts into a [crate::Digest], with the hash function being
    /// supplied from the context the message was received in.
    pub fn to_digest(&self, function: DigestFunction) -> Result<crate::Digest, ValidateNodeError> {
        let size_bytes = u64::try_from(self.size_bytes).map_err(|_| {
            ValidateNodeError::InvalidDigest(crate::digests::Error::InvalidSize(
                self.size_bytes.to_string(),
            ))
        })?;
        Ok(crate::Digest::from_hex(function, &self.hash, size_bytes)?)
    }
}

impl Directory {
    /// Calculates the digest of a Directory, which is the hash of the
    /// Directory message in its canonical encoding.
    pub fn digest(&self, function: DigestFunction) -> crate::Digest {
        function.compute(&self.encode_to_vec())
    }
}

impl From<&crate::Directory> for Directory {
    fn from(directory: &crate::Directory) -> Self {
        let mut files = vec![];
        let mut directories = vec![];
        let mut symlinks = vec![];

        for (name, node) in directory.nodes() {
            match node {
                Node::File { digest, executable } => files.push(FileNode {
                    name: name.clone(),
                    digest: Some(digest.into()),
                    is_executable: *executable,
                }),
                Node::Directory { digest } => directories.push(DirectoryNode {
                    name: name.clone(),
                    digest: Some(digest.into()),
                }),
                Node::Symlink { target } => symlinks.push(SymlinkNode {
                    name: name.clone(),
                    target: target.clone(),
                }),
            }
        }

        Self {
            files,
            directories,
            symlinks,
        }
    }
}

/// Accepts a name, and a mutable reference to the previous name.
/// If the passed name is larger than the previous one, the reference is updated.
/// If it's not, an error is returned.
fn update_if_lt_prev<'n>(prev_name: &mut &'n str, name: &'n str) -> Result<(), DirectoryError> {
    if name < *prev_name {
        return Err(DirectoryError::WrongSorting(name.to_string()));
    }
    *prev_name = name;
    Ok(())
}

impl Directory {
    /// Validates and converts into a [crate::Directory].
    /// Each entry list must be sorted by name, and names must be unique
    /// across all three lists.
    pub fn into_directory(
        self,
        function: DigestFunction,
    ) -> Result<crate::Directory, DirectoryError> {
        let mut dir = crate::Directory::new();

        let mut last_name = "";
        for file in self.files.iter() {
            update_if_lt_prev(&mut last_name, &file.name)?;
            let digest = file
                .digest
                .as_ref()
                .ok_or(ValidateNodeError::MissingDigest)
                .and_then(|d| d.to_digest(function))
                .map_err(|e| DirectoryError::InvalidNode(file.name.clone(), e))?;
            dir.add(
                file.name.clone(),
                Node::File {
                    digest,
                    executable: file.is_executable,
                },
            )?;
        }

        let mut last_name = "";
        for directory in self.directories.iter() {
            update_if_lt_prev(&mut last_name, &directory.name)?;
            let digest = directory
                .digest
                .as_ref()
                .ok_or(ValidateNodeError::MissingDigest)
                .and_then(|d| d.to_digest(function))
                .map_err(|e| DirectoryError::InvalidNode(directory.name.clone(), e))?;
            dir.add(directory.name.clone(), Node::Directory { digest })?;
        }

        let mut last_name = "";
        for symlink in self.symlinks.iter() {
            update_if_lt_prev(&mut last_name, &symlink.name)?;
            dir.add(
                symlink.name.clone(),
                Node::Symlink {
                    target: symlink.target.clone(),
                },
            )?;
        }

        Ok(dir)
    }
}
