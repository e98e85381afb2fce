use std::{io, path::PathBuf};

use farmhand_castore::Digest;

use crate::output_directory;

/// A single input that could not be placed into an exec dir. Paths are
/// relative to the exec dir.
#[derive(Debug, thiserror::Error)]
pub enum Violation {
    #[error("input {path:?} ({digest}, executable: {executable}): {source}")]
    Input {
        digest: Digest,
        path: PathBuf,
        executable: bool,
        source: io::Error,
    },

    #[error("directory {path:?} ({digest}) is missing from the input tree")]
    MissingDirectory { digest: Digest, path: PathBuf },

    #[error("directory {path:?}: {source}")]
    Directory { path: PathBuf, source: io::Error },

    #[error("linked directory {path:?} ({digest}): {source}")]
    LinkedDirectory {
        digest: Digest,
        path: PathBuf,
        source: io::Error,
    },

    #[error("symlink {path:?} has absolute target {target:?}")]
    AbsoluteSymlink { path: PathBuf, target: String },

    #[error("symlink {path:?}: {source}")]
    Symlink { path: PathBuf, source: io::Error },
}

impl Violation {
    pub fn path(&self) -> &PathBuf {
        match self {
            Violation::Input { path, .. }
            | Violation::MissingDirectory { path, .. }
            | Violation::Directory { path, .. }
            | Violation::LinkedDirectory { path, .. }
            | Violation::AbsoluteSymlink { path, .. }
            | Violation::Symlink { path, .. } => path,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Every placement that failed, in the order they were awaited.
    #[error("{} input violations in {path:?}", .violations.len())]
    Violations {
        path: PathBuf,
        violations: Vec<Violation>,
    },

    #[error("interrupted")]
    Interrupted,

    #[error("invalid outputs: {0}")]
    Outputs(#[from] output_directory::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}
