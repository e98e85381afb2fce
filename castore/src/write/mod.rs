//! Writing blobs into the CAS of a peer.
//!
//! A [CasPeer] hands out one [BlobWrite] per upload, identified by the
//! digest of the content and a fresh write id.
use bytes::Bytes;
use std::io;
use tonic::async_trait;
use uuid::Uuid;

use crate::{Digest, DigestFunction};

mod grpc;
mod memory;

pub use self::grpc::{GrpcBlobWrite, GrpcCasPeer};
pub use self::memory::MemoryCasPeer;

/// A single streaming upload of one blob.
#[async_trait]
pub trait BlobWrite: Send {
    /// Discard anything written so far, the next write starts at offset 0.
    async fn reset(&mut self) -> io::Result<()>;

    /// Append a chunk. Returns once the peer accepts more data.
    async fn write(&mut self, data: Bytes) -> io::Result<()>;

    /// Finish the upload, returning the size the peer committed.
    async fn commit(&mut self) -> io::Result<u64>;
}

/// A peer accepting blob uploads.
#[async_trait]
pub trait CasPeer: Send + Sync {
    async fn blob_write(&self, digest: &Digest, write_id: Uuid) -> io::Result<Box<dyn BlobWrite>>;
}

/// The ByteStream resource name of an upload:
/// `uploads/<write id>/blobs/[<function>/]<hash>/<size>`.
/// The function is only spelled out when it isn't the default one.
pub fn resource_name(digest: &Digest, write_id: Uuid) -> String {
    let function = match digest.function() {
        DigestFunction::Sha256 => String::new(),
        other => format!("{}/", other.name()),
    };

    format!(
        "uploads/{}/blobs/{}{}/{}",
        write_id,
        function,
        digest.hash_hex(),
        digest.size_bytes()
    )
}

#[cfg(test)]
mod tests {
    use super::resource_name;
    use crate::{fixtures::HELLOWORLD_BLOB_CONTENTS, DigestFunction};
    use uuid::Uuid;

    #[test]
    fn resource_name_sha256() {
        let digest = DigestFunction::Sha256.compute(HELLOWORLD_BLOB_CONTENTS);
        assert_eq!(
            format!("uploads/{}/blobs/{}/12", Uuid::nil(), digest.hash_hex()),
            resource_name(&digest, Uuid::nil())
        );
    }

    #[test]
    fn resource_name_blake3() {
        let digest = DigestFunction::Blake3.compute(HELLOWORLD_BLOB_CONTENTS);
        assert_eq!(
            format!(
                "uploads/{}/blobs/blake3/{}/12",
                Uuid::nil(),
                digest.hash_hex()
            ),
            resource_name(&digest, Uuid::nil())
        );
    }
}
