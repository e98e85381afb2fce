use bytes::Bytes;
use data_encoding::HEXLOWER;
use sha2::Digest as _;
use std::{fmt, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid digest length: {0}")]
    InvalidDigestLen(usize),

    #[error("invalid hex in digest: {0}")]
    InvalidHex(String),

    #[error("invalid digest size: {0}")]
    InvalidSize(String),

    #[error("unknown digest function: {0}")]
    UnknownFunction(String),
}

/// The hash functions a [Digest] can be computed with.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DigestFunction {
    #[default]
    Sha256,
    Blake3,
}

impl DigestFunction {
    /// Length of a hash produced by this function, in bytes.
    pub fn hash_len(&self) -> usize {
        match self {
            DigestFunction::Sha256 => 32,
            DigestFunction::Blake3 => blake3::OUT_LEN,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DigestFunction::Sha256 => "sha256",
            DigestFunction::Blake3 => "blake3",
        }
    }

    pub fn hasher(&self) -> Hasher {
        match self {
            DigestFunction::Sha256 => Hasher::Sha256(sha2::Sha256::new(), 0),
            DigestFunction::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new()), 0),
        }
    }

    /// Hashes a complete buffer.
    pub fn compute(&self, data: &[u8]) -> Digest {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    /// The digest of empty content.
    pub fn empty(&self) -> Digest {
        self.compute(&[])
    }
}

impl FromStr for DigestFunction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(DigestFunction::Sha256),
            "blake3" => Ok(DigestFunction::Blake3),
            other => Err(Error::UnknownFunction(other.to_string())),
        }
    }
}

/// Incremental hashing state, keeping track of the number of bytes seen.
pub enum Hasher {
    Sha256(sha2::Sha256, u64),
    Blake3(Box<blake3::Hasher>, u64),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h, size) => {
                h.update(data);
                *size += data.len() as u64;
            }
            Hasher::Blake3(h, size) => {
                h.update(data);
                *size += data.len() as u64;
            }
        }
    }

    pub fn finalize(self) -> Digest {
        match self {
            Hasher::Sha256(h, size) => Digest {
                function: DigestFunction::Sha256,
                hash: Bytes::copy_from_slice(&h.finalize()),
                size_bytes: size,
            },
            Hasher::Blake3(h, size) => Digest {
                function: DigestFunction::Blake3,
                hash: Bytes::copy_from_slice(h.finalize().as_bytes()),
                size_bytes: size,
            },
        }
    }
}

/// A content fingerprint: the hash function used, the hash itself, and the
/// size of the content in bytes.
/// Field order matters, ordering is by function, then hash, then size.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    function: DigestFunction,
    hash: Bytes,
    size_bytes: u64,
}

impl Digest {
    pub fn new(
        function: DigestFunction,
        hash: impl Into<Bytes>,
        size_bytes: u64,
    ) -> Result<Self, Error> {
        let hash = hash.into();
        if hash.len() != function.hash_len() {
            return Err(Error::InvalidDigestLen(hash.len()));
        }
        Ok(Self {
            function,
            hash,
            size_bytes,
        })
    }

    /// Constructs a digest from a lowercase or uppercase hex string.
    pub fn from_hex(function: DigestFunction, hex: &str, size_bytes: u64) -> Result<Self, Error> {
        let hash = HEXLOWER
            .decode(hex.to_ascii_lowercase().as_bytes())
            .map_err(|_| Error::InvalidHex(hex.to_string()))?;
        Self::new(function, hash, size_bytes)
    }

    pub fn function(&self) -> DigestFunction {
        self.function
    }

    pub fn hash(&self) -> &[u8] {
        &self.hash
    }

    pub fn hash_hex(&self) -> String {
        HEXLOWER.encode(&self.hash)
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.size_bytes == 0
    }
}

/// Renders as `hash/size`, prefixed with `function:` for anything but sha256.
impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.function != DigestFunction::default() {
            write!(f, "{}:", self.function.name())?;
        }
        write!(f, "{}/{}", self.hash_hex(), self.size_bytes)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (function, rest) = match s.split_once(':') {
            Some((function, rest)) => (function.parse()?, rest),
            None => (DigestFunction::default(), s),
        };
        let (hex, size) = rest
            .split_once('/')
            .ok_or_else(|| Error::InvalidSize(rest.to_string()))?;
        let size_bytes = size
            .parse::<u64>()
            .map_err(|_| Error::InvalidSize(size.to_string()))?;
        Self::from_hex(function, hex, size_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::{Digest, DigestFunction, Error};
    use rstest::rstest;

    #[test]
    fn empty_sha256() {
        let digest = DigestFunction::Sha256.empty();
        assert_eq!(
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855/0",
            digest.to_string()
        );
        assert!(digest.is_empty());
    }

    #[test]
    fn display_roundtrip_blake3() {
        let digest = DigestFunction::Blake3.compute(b"Hello World!");
        let rendered = digest.to_string();
        assert!(rendered.starts_with("blake3:"));
        assert_eq!(digest, rendered.parse::<Digest>().expect("must parse"));
    }

    #[test]
    fn equality_covers_size() {
        let a = DigestFunction::Sha256.compute(b"abc");
        let b = Digest::new(a.function(), a.hash().to_vec(), a.size_bytes() + 1).unwrap();
        assert_ne!(a, b);
    }

    #[rstest]
    #[case::short("abcd/1", Error::InvalidDigestLen(2))]
    #[case::no_size(
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        Error::InvalidSize(
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".into()
        )
    )]
    #[case::bad_function("md4:abcd/1", Error::UnknownFunction("md4".into()))]
    #[case::bad_hex("zz/1", Error::InvalidHex("zz".into()))]
    fn parse_invalid(#[case] input: &str, #[case] expected: Error) {
        assert_eq!(Err(expected), input.parse::<Digest>());
    }
}
