//! Schema identifiers
//!
//! A schema identifier is a 32-byte content hash of the payload layout. On
//! the wire it travels as exactly 64 lowercase hex characters.

use std::fmt;

/// Length of a schema hash in bytes
pub const SCHEMA_HASH_LEN: usize = 32;

/// Length of the hex encoding
pub const SCHEMA_HASH_HEX_LEN: usize = SCHEMA_HASH_LEN * 2;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SchemaHash([u8; SCHEMA_HASH_LEN]);

impl SchemaHash {
    pub const fn new(bytes: [u8; SCHEMA_HASH_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; SCHEMA_HASH_LEN] {
        &self.0
    }

    /// Lowercase hex, always [`SCHEMA_HASH_HEX_LEN`] characters
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Exact inverse of [`to_hex`](Self::to_hex)
    ///
    /// Returns `None` for any other length or any character outside
    /// `[0-9a-f]`, so uppercase text is rejected too.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != SCHEMA_HASH_HEX_LEN
            || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return None;
        }
        let mut bytes = [0u8; SCHEMA_HASH_LEN];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Debug for SchemaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SchemaHash({})", self.to_hex())
    }
}

impl fmt::Display for SchemaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<[u8; SCHEMA_HASH_LEN]> for SchemaHash {
    fn from(bytes: [u8; SCHEMA_HASH_LEN]) -> Self {
        Self(bytes)
    }
}

/// Whether a producer's advertised hash satisfies a consumer's expectation
///
/// A producer without a (decodable) hash accepts any consumer. An expected
/// hash never matches a missing one.
pub fn schema_accepts(expected: Option<&SchemaHash>, advertised: Option<&SchemaHash>) -> bool {
    match (expected, advertised) {
        (None, _) => true,
        (Some(want), Some(have)) => want == have,
        (Some(_), None) => false,
    }
}
