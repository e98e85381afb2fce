use std::collections::BTreeMap;

use crate::{proto, Digest, DigestFunction, DirectoryError, Node, ValidateNodeError};

/// A Directory can contain Directory, File or Symlink nodes.
/// Each of these nodes have a name attribute, which is the basename in that
/// directory and node type specific attributes.
/// While a Node by itself may have any name, the names of Directory entries:
///  - MUST not contain slashes or null bytes
///  - MUST not be '.' or '..'
///  - MUST be unique across all three kinds
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    nodes: BTreeMap<String, Node>,
}

impl Directory {
    pub fn new() -> Self {
        Directory {
            nodes: BTreeMap::new(),
        }
    }

    /// Calculates the digest of a Directory, which is the hash of the
    /// Directory message in its canonical encoding.
    pub fn digest(&self, function: DigestFunction) -> Digest {
        proto::Directory::from(self).digest(function)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Allows iterating over all nodes (directories, files and symlinks)
    /// ordered by their name.
    pub fn nodes(&self) -> impl Iterator<Item = (&String, &Node)> + Send + Sync + '_ {
        self.nodes.iter()
    }

    /// Allows iterating over the subdirectories of this directory,
    /// ordered by their name.
    pub fn directories(&self) -> impl Iterator<Item = (&String, &Digest)> + Send + Sync + '_ {
        self.nodes.iter().filter_map(|(name, node)| match node {
            Node::Directory { digest } => Some((name, digest)),
            _ => None,
        })
    }

    /// Checks a Node name for validity as a directory entry
    /// We disallow slashes, null bytes, '.', '..' and the empty string.
    pub(crate) fn validate_node_name(name: &str) -> Result<(), DirectoryError> {
        if name.is_empty() || name == ".." || name == "." || name.contains(['\0', '/']) {
            Err(DirectoryError::InvalidName(name.to_string()))
        } else {
            Ok(())
        }
    }

    /// Adds the specified [Node] to the [Directory] with a given name.
    ///
    /// Inserting an element that already exists with the same name in the directory will yield an
    /// error.
    /// Inserting an element will validate that its name fulfills the
    /// requirements for directory entries and yield an error if it is not.
    pub fn add(&mut self, name: impl Into<String>, node: Node) -> Result<(), DirectoryError> {
        let name = name.into();
        Self::validate_node_name(&name)?;

        if let Node::Symlink { target } = &node {
            if target.is_empty() || target.contains('\0') {
                return Err(DirectoryError::InvalidNode(
                    name,
                    ValidateNodeError::InvalidSymlinkTarget(target.clone()),
                ));
            }
        }

        match self.nodes.entry(name) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(node);
                Ok(())
            }
            std::collections::btree_map::Entry::Occupied(occupied) => {
                Err(DirectoryError::DuplicateName(occupied.key().to_owned()))
            }
        }
    }
}
