//! Content digests and digest-computing writers.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{KilnError, KilnResult};

/// A validated SHA-256 content digest (e.g., `sha256:abc123...`).
///
/// Digests must:
/// - Use the `sha256` algorithm
/// - Carry exactly 64 lowercase hex characters
///
/// Equality and hashing are by value, so two digests of identical content are
/// interchangeable as cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// The only supported algorithm.
    pub const ALGORITHM: &'static str = "sha256";
    /// Length of the hex-encoded hash.
    pub const HASH_LENGTH: usize = 64;

    /// Parse a digest, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the digest format is invalid.
    pub fn new(value: impl Into<String>) -> KilnResult<Self> {
        let value = value.into();
        Self::validate(&value)?;
        Ok(Self(value))
    }

    /// Build a digest from a bare hex hash.
    ///
    /// # Errors
    ///
    /// Returns an error if `hash` is not 64 lowercase hex characters.
    pub fn from_hash(hash: &str) -> KilnResult<Self> {
        Self::new(format!("{}:{hash}", Self::ALGORITHM))
    }

    /// Hash `data` in memory.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self(format!("{}:{:x}", Self::ALGORITHM, Sha256::digest(data)))
    }

    /// Hex-encoded hash without the algorithm prefix.
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.0[Self::ALGORITHM.len() + 1..]
    }

    /// Get the digest as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short version of the hash (first 12 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        &self.hash()[..12]
    }

    fn validate(value: &str) -> KilnResult<()> {
        let invalid = || KilnError::InvalidDigest {
            value: value.to_string(),
        };

        let (algorithm, hash) = value.split_once(':').ok_or_else(invalid)?;
        if algorithm != Self::ALGORITHM || hash.len() != Self::HASH_LENGTH {
            return Err(invalid());
        }
        if !hash
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(invalid());
        }

        Ok(())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Digest {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = KilnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Digest and size of a blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobDescriptor {
    /// Content digest.
    pub digest: Digest,
    /// Size in bytes.
    pub size: u64,
}

impl BlobDescriptor {
    /// Describe an in-memory blob.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self {
            digest: Digest::of(data),
            size: data.len() as u64,
        }
    }
}

/// Writer adapter that hashes and counts everything written through it.
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> DigestWriter<W> {
    /// Wrap `inner`.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Bytes written so far.
    #[must_use]
    pub const fn written(&self) -> u64 {
        self.written
    }

    /// Mutable access to the wrapped writer.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Finish hashing, returning the wrapped writer and the blob descriptor.
    pub fn finish(self) -> (W, BlobDescriptor) {
        let digest = Digest(format!(
            "{}:{:x}",
            Digest::ALGORITHM,
            self.hasher.finalize()
        ));
        (
            self.inner,
            BlobDescriptor {
                digest,
                size: self.written,
            },
        )
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const HELLO: &str = "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn digest_of_bytes() {
        let digest = Digest::of(b"hello world");
        assert_eq!(digest.as_str(), HELLO);
        assert_eq!(digest.short(), "b94d27b9934d");
    }

    #[test]
    fn digest_parsing() {
        let digest: Digest = HELLO.parse().unwrap();
        assert_eq!(digest.hash(), &HELLO[7..]);
        assert_eq!(digest.to_string(), HELLO);
        assert_eq!(Digest::from_hash(digest.hash()).unwrap(), digest);
    }

    #[test]
    fn invalid_digests() {
        assert!(Digest::new("").is_err());
        assert!(Digest::new("sha256:abc").is_err());
        assert!(Digest::new(HELLO.replace("sha256", "sha512")).is_err());
        assert!(Digest::new(HELLO.to_uppercase()).is_err());
        assert!(Digest::new(&HELLO[7..]).is_err());
    }

    #[test]
    fn serde_round_trip_rejects_garbage() {
        let json = serde_json::to_string(&Digest::of(b"x")).unwrap();
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Digest::of(b"x"));
        assert!(serde_json::from_str::<Digest>("\"sha256:nope\"").is_err());
    }

    #[test]
    fn digest_writer_matches_in_memory_hash() {
        let mut writer = DigestWriter::new(Vec::new());
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        let (bytes, descriptor) = writer.finish();
        assert_eq!(bytes, b"hello world");
        assert_eq!(descriptor, BlobDescriptor::of(b"hello world"));
    }

    proptest! {
        #[test]
        fn any_content_digest_parses_back(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let digest = Digest::of(&data);
            prop_assert_eq!(Digest::new(digest.to_string()).unwrap(), digest);
        }
    }
}
