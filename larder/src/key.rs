use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Size of a cache key, in bytes.
pub const KEY_SIZE: usize = 32;

/// The identity of a cached object.
///
/// A key is a SHA-256 digest, usually of the fully-qualified upstream URL the
/// object was fetched from. Nothing else participates in identity: two keys
/// are equal iff their bytes are equal.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key([u8; KEY_SIZE]);

#[derive(Debug, Error)]
pub enum KeyError {
    /// The hex form has the wrong length.
    #[error("invalid key length: expected {} hex digits, got {0}", KEY_SIZE * 2)]
    InvalidLength(usize),
    /// The hex form contains a non-hex digit.
    #[error("invalid key encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

impl Key {
    /// Derive the key of the given string, typically an upstream URL.
    pub fn of(input: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(input.as_bytes());

        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// The first two hex digits of the key, used by backends for a 256-way
    /// directory or object-name fan-out.
    pub fn shard(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({self})")
    }
}

impl FromStr for Key {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != KEY_SIZE * 2 {
            return Err(KeyError::InvalidLength(s.len()));
        }
        let mut bytes = [0u8; KEY_SIZE];
        hex::decode_to_slice(s, &mut bytes)?;

        Ok(Self(bytes))
    }
}

impl From<[u8; KEY_SIZE]> for Key {
    fn from(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }
}
