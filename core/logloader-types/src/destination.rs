use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of an upload destination, e.g. `local` or `remote`.
///
/// Used as the key of per-destination upload state, so it must stay stable
/// across restarts. Lowercase ASCII letters, digits, `-` and `_` only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DestinationId(String);

impl DestinationId {
    /// The on-premises server, always public.
    pub const LOCAL: &'static str = "local";
    /// The public archive server.
    pub const REMOTE: &'static str = "remote";

    /// Parses a destination name.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let valid = !s.is_empty()
            && s
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
        if !valid {
            return Err(crate::Error::InvalidDestination(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the `local` destination id.
    #[must_use]
    pub fn local() -> Self {
        Self(Self::LOCAL.to_string())
    }

    /// Returns the `remote` destination id.
    #[must_use]
    pub fn remote() -> Self {
        Self(Self::REMOTE.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DestinationId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DestinationId {
    type Error = crate::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DestinationId> for String {
    fn from(id: DestinationId) -> Self {
        id.0
    }
}
