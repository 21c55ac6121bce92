//! Key types identifying logs, peers and scrapers.
//!
//! All keys are 32 raw bytes, exchanged as lowercase hex in configuration
//! and logs. A log's [`DiscoveryKey`] is derived from its [`PublicKey`] so
//! peers can rendezvous on a topic without revealing the key itself.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KeyError;

/// Domain separation context for discovery key derivation.
const DISCOVERY_KEY_CONTEXT: &str = "swarmlog v1 discovery key";

/// Number of raw bytes in every key type.
pub const KEY_LEN: usize = 32;

/// Public key identifying one logical log, one peer, or one scraper.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Parse and normalize a hex-encoded key.
    ///
    /// This is the validation step roles must run on configured input
    /// before any storage or network use.
    pub fn parse(input: &str) -> Result<Self, KeyError> {
        parse_key_bytes(input).map(Self)
    }

    /// Derive the discovery-topic key for this log key.
    pub fn discovery_key(&self) -> DiscoveryKey {
        DiscoveryKey(blake3::derive_key(DISCOVERY_KEY_CONTEXT, &self.0))
    }

    /// Abbreviated form for log output.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fmt_short())
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Secret credential for the metrics client.
///
/// Never printed: `Debug` and `Display` are redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    /// Wrap raw secret bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// The raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Parse a hex-encoded secret.
    pub fn parse(input: &str) -> Result<Self, KeyError> {
        parse_key_bytes(input).map(Self)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(..)")
    }
}

/// Topic identity a log's peers rendezvous on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveryKey([u8; KEY_LEN]);

impl DiscoveryKey {
    /// Wrap raw topic bytes, e.g. received over the wire.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// The raw topic bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Display for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryKey({})", hex::encode(&self.0[..4]))
    }
}

fn parse_key_bytes(input: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let decoded = hex::decode(input.trim())?;
    let len = decoded.len();
    decoded
        .try_into()
        .map_err(|_| KeyError::InvalidLength { expected: KEY_LEN, actual: len })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_roundtrip() {
        let key = PublicKey::from_bytes([7u8; KEY_LEN]);
        let parsed = PublicKey::parse(&key.to_string()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn parse_rejects_bad_length() {
        assert_matches!(PublicKey::parse("abcd"), Err(KeyError::InvalidLength { .. }));
    }

    #[test]
    fn parse_rejects_bad_hex() {
        let input = "zz".repeat(KEY_LEN);
        assert_matches!(PublicKey::parse(&input), Err(KeyError::InvalidHex(_)));
    }

    #[test]
    fn discovery_key_is_stable_and_distinct() {
        let key = PublicKey::from_bytes([1u8; KEY_LEN]);
        assert_eq!(key.discovery_key(), key.discovery_key());
        assert_ne!(key.discovery_key().as_bytes(), key.as_bytes());
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = SecretKey::from_bytes([9u8; KEY_LEN]);
        assert_eq!(format!("{secret:?}"), "SecretKey(..)");
    }
}
