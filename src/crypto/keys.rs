//! # Key Material
//!
//! Meter confidentiality keys are sensitive: both wrappers zero their
//! storage on drop.

use super::CryptoError;
use crate::util::hex;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-128 key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AesKey {
    key: [u8; 16],
}

impl AesKey {
    /// Create a key from a 16-byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 16 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 16,
                actual: bytes.len(),
            });
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(bytes);
        Ok(AesKey { key })
    }

    /// Create a key from a 32-char hex string.
    pub fn from_hex(hex_str: &str) -> Result<Self, CryptoError> {
        let mut bytes = hex::decode_hex(hex_str).map_err(|_| CryptoError::InvalidKeyLength {
            expected: 16,
            actual: 0,
        })?;
        let key = Self::from_bytes(&bytes);
        bytes.zeroize();
        key
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.key
    }
}

impl std::fmt::Debug for AesKey {
    // Never log key bytes.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AesKey(****)")
    }
}

/// Key material supplied by the caller for one meter.
///
/// The parser borrows this during a parse; an empty set means the
/// telegram is left annotated as encrypted.
#[derive(Debug, Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct MeterKeys {
    confidentiality_key: Option<AesKey>,
}

impl MeterKeys {
    pub fn none() -> Self {
        MeterKeys::default()
    }

    pub fn with_confidentiality_key(key: AesKey) -> Self {
        MeterKeys {
            confidentiality_key: Some(key),
        }
    }

    pub fn has_confidentiality_key(&self) -> bool {
        self.confidentiality_key.is_some()
    }

    pub fn confidentiality_key(&self) -> Option<&AesKey> {
        self.confidentiality_key.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_hex() {
        let key = AesKey::from_hex("00112233445566778899AABBCCDDEEFF").unwrap();
        assert_eq!(key.as_bytes()[0], 0x00);
        assert_eq!(key.as_bytes()[15], 0xFF);
    }

    #[test]
    fn test_key_length_enforced() {
        assert!(AesKey::from_hex("001122").is_err());
        assert!(AesKey::from_bytes(&[0u8; 15]).is_err());
    }

    #[test]
    fn test_debug_does_not_leak() {
        let key = AesKey::from_hex("00112233445566778899AABBCCDDEEFF").unwrap();
        assert_eq!(format!("{key:?}"), "AesKey(****)");
    }
}
