use std::collections::HashMap;

mod digests;
mod errors;
mod nodes;

pub mod blobservice;
pub mod cache;
pub mod fixtures;
pub mod proto;
pub mod tonic;
pub mod write;

pub use digests::{Digest, DigestFunction, Error as DigestError, Hasher};
pub use errors::{DirectoryError, ValidateNodeError};
pub use nodes::{Directory, Node};

/// All directories reachable from an input root, keyed by their digest.
pub type DirectoriesIndex = HashMap<Digest, Directory>;
