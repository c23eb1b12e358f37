//! Feed identities: the owner address and the topic.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The address of a feed's single writer.
///
/// Owners are handed out by the external account provider; one address per
/// pod. The engine never derives them itself.
#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Owner([u8; 20]);

impl Owner {
    /// Create an `Owner` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Owner(bytes)
    }

    /// Bytes of the address.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Owner(0x{})", hex::encode(self.0))
    }
}

impl FromStr for Owner {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes: [u8; 20] = hex::decode(s)?
            .try_into()
            .map_err(|_| anyhow::anyhow!("failed to parse: invalid address length"))?;
        Ok(Owner(bytes))
    }
}

/// A feed topic.
///
/// Topic names are UTF-8 strings brought to a fixed 32 bytes by hashing them
/// with SHA-256, so arbitrarily long table and column names stay addressable.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Topic([u8; 32]);

impl Topic {
    /// Derive the topic for the given name.
    pub fn new(name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        Topic(hasher.finalize().into())
    }

    /// Topic of the descriptor feed for a table.
    pub fn schema(table: &str) -> Self {
        Self::new(&format!("schema:{table}"))
    }

    /// Topic of the table catalog for a pod.
    pub fn registry(pod: &str) -> Self {
        Self::new(&format!("registry:{pod}"))
    }

    /// Topic of one column index of a table.
    pub fn index(table: &str, column: &str) -> Self {
        Self::new(&format!("idx:{table}:{column}"))
    }

    /// Create a `Topic` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Topic(bytes)
    }

    /// Bytes of the topic.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_hex_roundtrip() {
        let owner = Owner::from_bytes([0xab; 20]);
        let s = owner.to_string();
        assert!(s.starts_with("0x"));
        let back: Owner = s.parse().unwrap();
        assert_eq!(owner, back);
        // without the prefix as well
        let back: Owner = s.trim_start_matches("0x").parse().unwrap();
        assert_eq!(owner, back);
    }

    #[test]
    fn test_topic_conventions_distinct() {
        let a = Topic::schema("users");
        let b = Topic::index("users", "name");
        let c = Topic::index("users", "tags");
        let d = Topic::registry("home");
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, d);
        // deterministic
        assert_eq!(a, Topic::schema("users"));
    }
}
