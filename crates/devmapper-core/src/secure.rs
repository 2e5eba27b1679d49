//! Zeroizing byte buffer for table parameters and dm-crypt key material.
//!
//! Every buffer that may hold key bytes lives in a [`SecureBytes`]. Growth never
//! relies on `Vec` reallocation, which would leave an unwiped copy of the old
//! contents on the heap; instead a fresh zeroizing allocation is made and the
//! old one is wiped when dropped.

use std::fmt;
use std::ops::Deref;
use zeroize::Zeroizing;

/// Owned byte buffer that is wiped when dropped.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecureBytes(Zeroizing<Vec<u8>>);

impl SecureBytes {
    /// Empty buffer; no allocation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty buffer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Zeroizing::new(Vec::with_capacity(capacity)))
    }

    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append `data`, moving to a larger zeroizing allocation if needed.
    pub fn append(&mut self, data: &[u8]) {
        let needed = self.0.len() + data.len();
        if needed > self.0.capacity() {
            let capacity = needed.max(self.0.capacity().saturating_mul(2));
            let mut grown = Zeroizing::new(Vec::with_capacity(capacity));
            grown.extend_from_slice(&self.0);
            self.0 = grown;
        }
        self.0.extend_from_slice(data);
    }

    /// Join `parts` into one buffer allocated at its final size.
    pub fn concat(parts: &[&SecureBytes]) -> Self {
        let total = parts.iter().map(|part| part.len()).sum();
        let mut joined = Self::with_capacity(total);
        for part in parts {
            joined.0.extend_from_slice(part);
        }
        joined
    }

    /// Lowercase hex rendering of the contents.
    pub fn hex_encode(&self) -> Self {
        let mut encoded = Zeroizing::new(vec![0u8; self.len() * 2]);
        match hex::encode_to_slice(self.as_slice(), &mut encoded) {
            Ok(()) => Self(encoded),
            Err(_) => Self::new(),
        }
    }

    /// Decode a hex string into raw bytes.
    pub fn hex_decode(hex_digits: &[u8]) -> Result<Self, hex::FromHexError> {
        if hex_digits.len() % 2 != 0 {
            return Err(hex::FromHexError::OddLength);
        }
        let mut decoded = Zeroizing::new(vec![0u8; hex_digits.len() / 2]);
        hex::decode_to_slice(hex_digits, &mut decoded)?;
        Ok(Self(decoded))
    }
}

impl From<Vec<u8>> for SecureBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }
}

impl From<&[u8]> for SecureBytes {
    fn from(bytes: &[u8]) -> Self {
        let mut secure = Self::with_capacity(bytes.len());
        secure.0.extend_from_slice(bytes);
        secure
    }
}

impl From<&str> for SecureBytes {
    fn from(text: &str) -> Self {
        Self::from(text.as_bytes())
    }
}

impl Deref for SecureBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for SecureBytes {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBytes(<{} bytes redacted>)", self.len())
    }
}
