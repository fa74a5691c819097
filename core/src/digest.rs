//! Content digests.
//!
//! A digest is `<algorithm>:<encoded>`, e.g. `sha256:e3b0c442...`. It is the
//! sole identity of a piece of content: two blobs with equal digests are the
//! same bytes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{OciError, Result};

/// Algorithm name used for every digest this crate computes.
pub const SHA256: &str = "sha256";

/// A validated content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse and validate a digest string.
    pub fn parse(s: &str) -> Result<Self> {
        let (algorithm, encoded) = s
            .split_once(':')
            .ok_or_else(|| OciError::MalformedContent(format!("invalid digest '{}'", s)))?;

        if algorithm.is_empty()
            || !algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c))
        {
            return Err(OciError::MalformedContent(format!(
                "invalid digest algorithm in '{}'",
                s
            )));
        }

        let valid_encoded = match algorithm {
            SHA256 => encoded.len() == 64 && encoded.chars().all(is_lower_hex),
            "sha512" => encoded.len() == 128 && encoded.chars().all(is_lower_hex),
            _ => {
                !encoded.is_empty()
                    && encoded
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || "=_-".contains(c))
            }
        };
        if !valid_encoded {
            return Err(OciError::MalformedContent(format!(
                "invalid digest encoding in '{}'",
                s
            )));
        }

        Ok(Self(s.to_string()))
    }

    /// SHA-256 digest of a byte slice.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self::from_sha256(Sha256::digest(data).as_slice())
    }

    /// Build a `sha256:` digest from a raw 32-byte hash output.
    pub fn from_sha256(hash: &[u8]) -> Self {
        Self(format!("{}:{}", SHA256, hex::encode(hash)))
    }

    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or_default()
    }

    /// The hex (or other encoded) part after the colon.
    pub fn encoded(&self) -> &str {
        self.0.split_once(':').map(|(_, e)| e).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_lower_hex(c: char) -> bool {
    c.is_ascii_digit() || ('a'..='f').contains(&c)
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = OciError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
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

/// Incremental SHA-256 digester that also counts bytes.
#[derive(Default)]
pub struct Digester {
    hasher: Sha256,
    size: u64,
}

impl Digester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.size += data.len() as u64;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn finish(self) -> Digest {
        Digest::from_sha256(self.hasher.finalize().as_slice())
    }
}

impl std::io::Write for Digester {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_from_bytes_empty() {
        assert_eq!(Digest::from_bytes(b"").as_str(), EMPTY);
    }

    #[test]
    fn test_parse_valid() {
        let digest = Digest::parse(EMPTY).unwrap();
        assert_eq!(digest.algorithm(), "sha256");
        assert_eq!(digest.encoded().len(), 64);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Digest::parse("nocolon").is_err());
        assert!(Digest::parse("sha256:xyz").is_err());
        assert!(Digest::parse("sha256:E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855").is_err());
        assert!(Digest::parse(":abc").is_err());
    }

    #[test]
    fn test_digester_matches_one_shot() {
        let mut digester = Digester::new();
        digester.update(b"hello ");
        digester.update(b"world");
        assert_eq!(digester.size(), 11);
        assert_eq!(digester.finish(), Digest::from_bytes(b"hello world"));
    }

    #[test]
    fn test_serde_as_string() {
        let digest = Digest::from_bytes(b"x");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", digest));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
        assert!(serde_json::from_str::<Digest>("\"bogus\"").is_err());
    }
}
