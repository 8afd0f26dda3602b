//! Content digests and the deduplication keys derived from them.
//!
//! A [`Digest`] identifies an action by the hash of its serialized form. The
//! queue never hashes anything itself; it only validates that a digest is
//! well-formed for the configured [`DigestFunction`] and turns it, together
//! with the instance name, into a [`DigestKey`] via a [`DigestKeyFn`].

use crate::{Error, Result};
use core::fmt;
use core::str::FromStr;

/// Hash algorithm used to compute content digests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DigestFunction {
    #[default]
    Sha256,
    Sha1,
    Md5,
}

impl DigestFunction {
    /// Every supported digest function.
    pub const ALL: [Self; 3] = [Self::Sha256, Self::Sha1, Self::Md5];

    /// Length of the raw hash in bytes.
    pub const fn hash_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha1 => 20,
            Self::Md5 => 16,
        }
    }

    /// The lowercase name accepted by [`FromStr`].
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha1 => "sha1",
            Self::Md5 => "md5",
        }
    }
}

impl fmt::Display for DigestFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestFunction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|function| function.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::UnknownDigestFunction {
                name: s.to_string(),
            })
    }
}

/// Hash and size of a blob, tagged with the function that produced the hash.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Digest {
    function: DigestFunction,
    hash: String,
    size_bytes: i64,
}

impl Digest {
    /// Creates a digest after checking that `hash` is lowercase hex of the
    /// length `function` produces and that `size_bytes` is not negative.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDigest`] if either check fails.
    pub fn new(function: DigestFunction, hash: impl Into<String>, size_bytes: i64) -> Result<Self> {
        let hash = hash.into();
        let expected = function.hash_len() * 2;

        if hash.len() != expected {
            return Err(Error::InvalidDigest {
                reason: format!(
                    "{function} hash must be {expected} characters, got {}",
                    hash.len()
                ),
            });
        }

        if !hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(Error::InvalidDigest {
                reason: format!("hash '{hash}' is not lowercase hexadecimal"),
            });
        }

        if size_bytes < 0 {
            return Err(Error::InvalidDigest {
                reason: format!("size {size_bytes} is negative"),
            });
        }

        Ok(Self {
            function,
            hash,
            size_bytes,
        })
    }

    pub const fn function(&self) -> DigestFunction {
        self.function
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub const fn size_bytes(&self) -> i64 {
        self.size_bytes
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.hash, self.size_bytes)
    }
}

/// Deduplication key. Two requests with equal keys share one operation while
/// it is live.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DigestKey(String);

impl DigestKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DigestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives a [`DigestKey`] from an instance name and an action digest.
pub type DigestKeyFn = fn(&str, &Digest) -> DigestKey;

/// Keys on the digest scoped to its instance name, so the same action
/// submitted to two instances runs twice.
pub fn digest_key_with_instance(instance_name: &str, digest: &Digest) -> DigestKey {
    DigestKey(format!("{digest}-{instance_name}"))
}

/// Keys on the digest alone, sharing work across instance names.
pub fn digest_key_without_instance(_instance_name: &str, digest: &Digest) -> DigestKey {
    DigestKey(digest.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA256_EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn parses_known_digest_functions() {
        assert_eq!("sha256".parse::<DigestFunction>(), Ok(DigestFunction::Sha256));
        assert_eq!("sha1".parse::<DigestFunction>(), Ok(DigestFunction::Sha1));
        assert_eq!("MD5".parse::<DigestFunction>(), Ok(DigestFunction::Md5));
    }

    #[test]
    fn rejects_unknown_digest_function() {
        assert_eq!(
            "blake3".parse::<DigestFunction>(),
            Err(Error::UnknownDigestFunction {
                name: "blake3".to_string()
            })
        );
    }

    #[test]
    fn digest_validates_hash_length_and_charset() {
        assert!(Digest::new(DigestFunction::Sha256, SHA256_EMPTY, 0).is_ok());
        assert!(matches!(
            Digest::new(DigestFunction::Sha1, SHA256_EMPTY, 0),
            Err(Error::InvalidDigest { .. })
        ));
        assert!(matches!(
            Digest::new(DigestFunction::Sha256, SHA256_EMPTY.to_uppercase(), 0),
            Err(Error::InvalidDigest { .. })
        ));
        assert!(matches!(
            Digest::new(DigestFunction::Md5, "d41d8cd98f00b204e9800998ecf8427e", -1),
            Err(Error::InvalidDigest { .. })
        ));
    }

    #[test]
    fn key_with_instance_scopes_by_instance_name() {
        let digest = Digest::new(DigestFunction::Sha256, SHA256_EMPTY, 42).unwrap();

        let a = digest_key_with_instance("linux", &digest);
        let b = digest_key_with_instance("macos", &digest);
        assert_ne!(a, b);
        assert_eq!(a.as_str(), format!("{SHA256_EMPTY}-42-linux"));

        assert_eq!(
            digest_key_without_instance("linux", &digest),
            digest_key_without_instance("macos", &digest)
        );
    }
}
