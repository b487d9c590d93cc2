//! AES-based key derivation
//!
//! Deterministic expansion from the block primitive alone, used everywhere a
//! hash-based KDF would otherwise appear. Two phases:
//!
//! 1. Absorb: XOR each 16-byte chunk of `info` (zero-padded tail) into a
//!    counter block, encrypting the block after every chunk.
//! 2. Expand: increment the counter big-endian before each output block,
//!    encrypt a copy of it, and emit the result; the final partial block is
//!    truncated.

use crate::aes::AesKey;
use crate::error::CryptoError;

/// Fill `output` with key material derived from `key` and `info`.
///
/// `key` must be 16, 24 or 32 bytes.
pub fn kdf(key: &[u8], info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
    let aes = AesKey::new(key)?;
    if output.is_empty() {
        return Ok(());
    }

    let mut counter = [0u8; 16];
    for chunk in info.chunks(16) {
        for (c, b) in counter.iter_mut().zip(chunk) {
            *c ^= b;
        }
        aes.encrypt_block(&mut counter);
    }

    for chunk in output.chunks_mut(16) {
        for b in counter.iter_mut().rev() {
            *b = b.wrapping_add(1);
            if *b != 0 {
                break;
            }
        }
        let mut block = counter;
        aes.encrypt_block(&mut block);
        chunk.copy_from_slice(&block[..chunk.len()]);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let mut a = [0u8; 96];
        let mut b = [0u8; 96];
        kdf(&[1u8; 32], b"info", &mut a).unwrap();
        kdf(&[1u8; 32], b"info", &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn info_separates_outputs() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        kdf(&[1u8; 32], b"one", &mut a).unwrap();
        kdf(&[1u8; 32], b"two", &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn long_output_extends_short_output() {
        let mut short = [0u8; 20];
        let mut long = [0u8; 48];
        kdf(&[2u8; 16], &[3u8; 32], &mut short).unwrap();
        kdf(&[2u8; 16], &[3u8; 32], &mut long).unwrap();
        assert_eq!(short, long[..20]);
    }

    #[test]
    fn rejects_bad_key_sizes() {
        let mut out = [0u8; 16];
        assert!(matches!(kdf(&[0u8; 17], b"", &mut out), Err(CryptoError::InvalidSize(_))));
        assert!(kdf(&[0u8; 24], b"", &mut out).is_ok());
    }

    #[test]
    fn empty_info_still_expands() {
        let mut a = [0u8; 32];
        kdf(&[4u8; 32], b"", &mut a).unwrap();
        assert_ne!(a, [0u8; 32]);
    }
}
