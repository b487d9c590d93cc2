//! Poly1305-AES
//!
//! The classic construction: the 32-byte key splits into the polynomial key
//! `r = key[0..16]` (clamped by the Poly1305 core) and an AES key
//! `key[16..32]` that encrypts the 16-byte IV to produce the one-time pad
//! half `s`. Modern ChaCha-based Poly1305 variants differ only in how `s`
//! is made, so the audited polynomial core is reused as-is.

use poly1305::universal_hash::KeyInit;
use poly1305::{Key, Poly1305};
use zeroize::Zeroize;

use crate::aes::AesKey;
use crate::error::CryptoError;

pub struct Poly1305Aes {
    mac: Poly1305,
}

impl Poly1305Aes {
    pub fn new(key: &[u8; 32], iv: &[u8; 16]) -> Result<Self, CryptoError> {
        let aes = AesKey::new(&key[16..32])?;
        let mut s = *iv;
        aes.encrypt_block(&mut s);

        let mut poly_key = [0u8; 32];
        poly_key[..16].copy_from_slice(&key[..16]);
        poly_key[16..].copy_from_slice(&s);
        let mac = Poly1305::new(Key::from_slice(&poly_key));
        poly_key.zeroize();
        s.zeroize();

        Ok(Self { mac })
    }

    /// Authenticate `data` and return the full 16-byte tag. Callers truncate
    /// to the wire tag size themselves.
    pub fn tag(self, data: &[u8]) -> [u8; 16] {
        let tag = self.mac.compute_unpadded(data);
        let mut out = [0u8; 16];
        out.copy_from_slice(&tag);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let key = [0x42u8; 32];
        let iv = [0x17u8; 16];
        let a = Poly1305Aes::new(&key, &iv).unwrap().tag(b"some data");
        let b = Poly1305Aes::new(&key, &iv).unwrap().tag(b"some data");
        assert_eq!(a, b);
    }

    #[test]
    fn iv_separates_tags() {
        let key = [0x42u8; 32];
        let a = Poly1305Aes::new(&key, &[0u8; 16]).unwrap().tag(b"some data");
        let b = Poly1305Aes::new(&key, &[1u8; 16]).unwrap().tag(b"some data");
        assert_ne!(a, b);
    }

    #[test]
    fn data_change_changes_tag() {
        let key = [0x42u8; 32];
        let iv = [9u8; 16];
        let a = Poly1305Aes::new(&key, &iv).unwrap().tag(b"some data");
        let b = Poly1305Aes::new(&key, &iv).unwrap().tag(b"some dat4");
        assert_ne!(a, b);
    }
}
