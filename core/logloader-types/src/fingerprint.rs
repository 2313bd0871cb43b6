//! Stable identity for device logs.
//!
//! The device assigns log indices per connection, so they cannot be used to
//! recognise a log across sessions. A log is immutable once written, which
//! makes its reported `(date, size_bytes)` pair a usable proxy for identity.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Deterministic identity of a log, derived from its date and size.
///
/// Rendered as 16 lowercase hexadecimal characters (the first 8 bytes of a
/// SHA-256 digest).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Length of the hexadecimal representation.
    pub const LEN: usize = 16;

    /// Computes the fingerprint of a log reported with the given date and size.
    #[must_use]
    pub fn from_parts(date: &str, size_bytes: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(date.as_bytes());
        hasher.update(b"_");
        hasher.update(size_bytes.to_string().as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..Self::LEN / 2]))
    }

    /// Parses a fingerprint previously rendered with `Display`.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let valid = s.len() == Self::LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(crate::Error::InvalidFingerprint(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the hexadecimal representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
