//! This holds types describing nodes in the input tree of an action.
mod directory;

use crate::Digest;
pub use directory::Directory;

/// A Node is either a directory, a file or a symlink.
/// Nodes themselves don't have names, what gives them names is them being
/// inside a [Directory].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// A pointer to a [Directory], by the digest of its canonical encoding.
    Directory { digest: Digest },
    /// A regular or executable file. The digest carries the content size.
    File { digest: Digest, executable: bool },
    /// A symbolic link. Whether absolute targets are acceptable is decided
    /// by whoever materializes the node.
    Symlink { target: String },
}
