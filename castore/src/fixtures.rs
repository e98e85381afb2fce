use crate::{Digest, DigestFunction, Directory, Node};
use lazy_static::lazy_static;

pub const HELLOWORLD_BLOB_CONTENTS: &[u8] = b"Hello World!";
pub const EMPTY_BLOB_CONTENTS: &[u8] = b"";

lazy_static! {
    pub static ref DUMMY_DIGEST: Digest =
        Digest::new(DigestFunction::Sha256, vec![0x00; 32], 1).unwrap();
    pub static ref DUMMY_DIGEST_2: Digest =
        Digest::new(DigestFunction::Sha256, vec![0x10; 32], 2).unwrap();

    pub static ref HELLOWORLD_BLOB_DIGEST: Digest =
        DigestFunction::Sha256.compute(HELLOWORLD_BLOB_CONTENTS);
    pub static ref EMPTY_BLOB_DIGEST: Digest =
        DigestFunction::Sha256.compute(EMPTY_BLOB_CONTENTS);

    // 10 bytes
    pub static ref BLOB_A: bytes::Bytes = (0..10).collect::<Vec<u8>>().into();
    pub static ref BLOB_A_DIGEST: Digest = DigestFunction::Sha256.compute(&BLOB_A);

    // 1MB
    pub static ref BLOB_B: bytes::Bytes = (0..255).collect::<Vec<u8>>().repeat(4 * 1024).into();
    pub static ref BLOB_B_DIGEST: Digest = DigestFunction::Sha256.compute(&BLOB_B);

    // Directories
    pub static ref DIRECTORY_WITH_KEEP: Directory = {
        let mut d = Directory::new();
        d.add(".keep", Node::File {
            digest: EMPTY_BLOB_DIGEST.clone(),
            executable: false,
        }).unwrap();
        d
    };
    pub static ref DIRECTORY_COMPLICATED: Directory = {
        let mut d = Directory::new();
        d.add("keep", Node::Directory {
            digest: DIRECTORY_WITH_KEEP.digest(DigestFunction::Sha256),
        }).unwrap();
        d.add(".keep", Node::File {
            digest: EMPTY_BLOB_DIGEST.clone(),
            executable: false,
        }).unwrap();
        d.add("aa", Node::Symlink {
            target: "/nix/store/somewhereelse".into(),
        }).unwrap();
        d
    };
    /// Holds the 10 byte [BLOB_A] as an executable, and the helloworld blob
    /// as a regular file.
    pub static ref DIRECTORY_WITH_BLOBS: Directory = {
        let mut d = Directory::new();
        d.add("hello.txt", Node::File {
            digest: HELLOWORLD_BLOB_DIGEST.clone(),
            executable: false,
        }).unwrap();
        d.add("tool", Node::File {
            digest: BLOB_A_DIGEST.clone(),
            executable: true,
        }).unwrap();
        d
    };
}
