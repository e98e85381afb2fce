use thiserror::Error;

use crate::digests;

/// Errors that can occur while validating a single node.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidateNodeError {
    #[error("invalid digest: {0}")]
    InvalidDigest(#[from] digests::Error),

    #[error("missing digest")]
    MissingDigest,

    #[error("invalid symlink target: {0:?}")]
    InvalidSymlinkTarget(String),
}

/// Errors that can occur while populating or decoding a [crate::Directory].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    /// Multiple elements with the same name encountered
    #[error("{0:?} is a duplicate name")]
    DuplicateName(String),

    /// Invalid name encountered
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// Invalid node
    #[error("invalid node with name {0:?}: {1}")]
    InvalidNode(String, ValidateNodeError),

    /// Elements are not in sorted order
    #[error("{0:?} is not sorted")]
    WrongSorting(String),
}
