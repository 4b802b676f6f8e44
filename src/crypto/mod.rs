//! # OMS Security Primitives
//!
//! AES operations for the wM-Bus security modes the gateway decrypts:
//!
//! - **TPL security mode 5**: AES-128 CBC with an IV built from the
//!   telegram headers (mfct, id, version, type, ACC repeated).
//! - **TPL security mode 7**: AES-128 CBC with a zero IV and ephemeral
//!   keys derived via KDF-1 (AES-CMAC over a constant-structured input).
//! - **ELL**: AES-128 CTR keyed by the session number carried in the
//!   extended link layer.
//! - **AFL**: AES-CMAC message authentication with truncated tags.
//!
//! CBC and CTR are composed directly over the `aes` block cipher; the
//! encrypted region of a telegram is always a whole number of blocks, so
//! no padding scheme is involved (mode 5/7 plaintexts are 0x2F-filled by
//! the meter).

pub mod keys;

pub use keys::{AesKey, MeterKeys};

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use thiserror::Error;

/// Cryptographic failure modes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CryptoError {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Encrypted region is not block aligned: {actual} bytes")]
    NotBlockAligned { actual: usize },

    #[error("Encrypted region longer than remaining frame: need {needed}, have {have}")]
    TooShort { needed: usize, have: usize },
}

/// AES block size in bytes.
pub const AES_BLOCK: usize = 16;

/// Compute AES-CMAC over `data` under `key`.
pub fn aes_cmac(key: &AesKey, data: &[u8]) -> [u8; 16] {
    // Key length is enforced by AesKey, so construction cannot fail.
    let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(key.as_bytes()));
    mac.update(data);
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; 16];
    out.copy_from_slice(&tag);
    out
}

/// KDF-1 ephemeral key pair per EN 13757-7.
///
/// Input layout: `DC || counter(4 LE) || id(4 LE) || 0x07 * 7` where the
/// derivation constant DC selects the ephemeral encryption key (0x00) or
/// the ephemeral MAC key (0x01). `counter` is the AFL message counter
/// (DLL fallback) and `id` the TPL id (DLL fallback).
pub fn kdf1_derive(key: &AesKey, counter: [u8; 4], id: [u8; 4]) -> (AesKey, AesKey) {
    let mut input = [0u8; 16];
    input[1..5].copy_from_slice(&counter);
    input[5..9].copy_from_slice(&id);
    for b in &mut input[9..16] {
        *b = 0x07;
    }

    input[0] = 0x00; // DC: ephemeral encryption key from meter
    let kenc = AesKey::from_bytes(&aes_cmac(key, &input)).expect("cmac tag is 16 bytes");

    input[0] = 0x01; // DC: ephemeral mac key from meter
    let kmac = AesKey::from_bytes(&aes_cmac(key, &input)).expect("cmac tag is 16 bytes");

    (kenc, kmac)
}

/// Decrypt `data` in place with AES-128 CBC.
///
/// Mode 5 passes the header-derived IV; mode 7 passes a zero IV. The
/// caller hands in exactly the encrypted region, which must be block
/// aligned.
pub fn decrypt_aes_cbc(key: &AesKey, iv: &[u8; 16], data: &mut [u8]) -> Result<(), CryptoError> {
    if data.len() % AES_BLOCK != 0 {
        return Err(CryptoError::NotBlockAligned { actual: data.len() });
    }

    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut prev = *iv;

    for chunk in data.chunks_exact_mut(AES_BLOCK) {
        let mut saved = [0u8; AES_BLOCK];
        saved.copy_from_slice(chunk);

        let block = GenericArray::from_mut_slice(chunk);
        cipher.decrypt_block(block);
        for (b, p) in chunk.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        prev = saved;
    }

    Ok(())
}

/// Encrypt `data` in place with AES-128 CBC. Test scaffolding for the
/// round-trip properties; meters do the encrypting in production.
pub fn encrypt_aes_cbc(key: &AesKey, iv: &[u8; 16], data: &mut [u8]) -> Result<(), CryptoError> {
    if data.len() % AES_BLOCK != 0 {
        return Err(CryptoError::NotBlockAligned { actual: data.len() });
    }

    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut prev = *iv;

    for chunk in data.chunks_exact_mut(AES_BLOCK) {
        for (b, p) in chunk.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        let block = GenericArray::from_mut_slice(chunk);
        cipher.encrypt_block(block);
        prev.copy_from_slice(chunk);
    }

    Ok(())
}

/// Build the mode-5 initialization vector from telegram header fields.
///
/// `mfct` and `id` are in wire order (little-endian as transmitted); the
/// access number fills the remaining eight bytes.
pub fn cbc_iv_mode5(mfct: [u8; 2], id: [u8; 4], version: u8, device_type: u8, acc: u8) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[0..2].copy_from_slice(&mfct);
    iv[2..6].copy_from_slice(&id);
    iv[6] = version;
    iv[7] = device_type;
    for b in &mut iv[8..16] {
        *b = acc;
    }
    iv
}

/// Apply the ELL AES-128 CTR keystream to `data` in place.
///
/// The initial counter block is `prefix(13) || FN(2 = 0) || BC(1)` with
/// the block counter starting at zero and incrementing per 16-byte
/// block; CTR encryption and decryption are the same operation.
pub fn apply_ell_aes_ctr(key: &AesKey, iv_prefix: &[u8; 13], data: &mut [u8]) {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));

    let mut counter_block = [0u8; 16];
    counter_block[0..13].copy_from_slice(iv_prefix);

    for (block_nr, chunk) in data.chunks_mut(AES_BLOCK).enumerate() {
        counter_block[15] = block_nr as u8;
        let mut keystream = GenericArray::clone_from_slice(&counter_block);
        cipher.encrypt_block(&mut keystream);
        for (b, k) in chunk.iter_mut().zip(keystream.iter()) {
            *b ^= k;
        }
    }
}

/// Compare a computed CMAC against a received, possibly truncated, MAC.
pub fn cmac_matches_truncated(computed: &[u8; 16], received: &[u8]) -> bool {
    !received.is_empty()
        && received.len() <= 16
        && computed[..received.len()] == *received
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::hex::hex_to_bytes;

    fn test_key() -> AesKey {
        AesKey::from_hex("000102030405060708090a0b0c0d0e0f").unwrap()
    }

    #[test]
    fn test_cmac_rfc4493_vector() {
        // RFC 4493 example 1: empty message under the sample key.
        let key = AesKey::from_hex("2b7e151628aed2a6abf7158809cf4f3c").unwrap();
        let tag = aes_cmac(&key, &[]);
        assert_eq!(
            tag.to_vec(),
            hex_to_bytes("bb1d6929e95937287fa37d129b756746")
        );
    }

    #[test]
    fn test_cmac_rfc4493_16_byte_vector() {
        // RFC 4493 example 2: one-block message.
        let key = AesKey::from_hex("2b7e151628aed2a6abf7158809cf4f3c").unwrap();
        let msg = hex_to_bytes("6bc1bee22e409f96e93d7e117393172a");
        let tag = aes_cmac(&key, &msg);
        assert_eq!(
            tag.to_vec(),
            hex_to_bytes("070a16b46b4d4144f79bdd9dd04a287c")
        );
    }

    #[test]
    fn test_cbc_roundtrip_preserves_blocks() {
        let key = test_key();
        let iv = cbc_iv_mode5([0xae, 0x4c], [0x78, 0x56, 0x34, 0x12], 0x03, 0x07, 0x6a);

        let mut data = hex_to_bytes("2f2f0c78123456780c13371200002f2f2f2f2f2f2f2f2f2f2f2f2f2f2f2f2f2f");
        let plain = data.clone();

        encrypt_aes_cbc(&key, &iv, &mut data).unwrap();
        assert_ne!(data, plain);
        decrypt_aes_cbc(&key, &iv, &mut data).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn test_cbc_rejects_partial_block() {
        let key = test_key();
        let mut data = vec![0u8; 17];
        let r = decrypt_aes_cbc(&key, &[0u8; 16], &mut data);
        assert_eq!(r, Err(CryptoError::NotBlockAligned { actual: 17 }));
    }

    #[test]
    fn test_ctr_is_an_involution() {
        let key = test_key();
        let prefix: [u8; 13] = [
            0xae, 0x4c, 0x56, 0x78, 0x34, 0x12, 0x03, 0x07, 0x10, 0x11, 0x22, 0x33, 0x44,
        ];
        let mut data = hex_to_bytes("79138c4491ce8fc0a376f0e1c0a2d3e4f5");
        let original = data.clone();

        apply_ell_aes_ctr(&key, &prefix, &mut data);
        assert_ne!(data, original);
        apply_ell_aes_ctr(&key, &prefix, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_kdf1_distinct_keys() {
        let key = test_key();
        let (kenc, kmac) = kdf1_derive(&key, [1, 0, 0, 0], [0x78, 0x56, 0x34, 0x12]);
        assert_ne!(kenc.as_bytes(), kmac.as_bytes());

        // A different counter derives a different key pair.
        let (kenc2, _) = kdf1_derive(&key, [2, 0, 0, 0], [0x78, 0x56, 0x34, 0x12]);
        assert_ne!(kenc.as_bytes(), kenc2.as_bytes());
    }

    #[test]
    fn test_truncated_mac_comparison() {
        let computed = [0xAB; 16];
        assert!(cmac_matches_truncated(&computed, &[0xAB; 8]));
        assert!(cmac_matches_truncated(&computed, &[0xAB; 16]));
        assert!(!cmac_matches_truncated(&computed, &[0xAB; 17]));
        assert!(!cmac_matches_truncated(&computed, &[]));
        assert!(!cmac_matches_truncated(&computed, &[0xAB, 0xAC]));
    }
}
