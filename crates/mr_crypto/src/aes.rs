//! Single-block AES
//!
//! The protocol only ever needs the forward block transform: CTR mode and
//! the KDF are built on top of it, and nothing decrypts a block directly.
//! 16, 24 and 32 byte keys are accepted; 24 is allowed by the KDF contract
//! even though the protocol itself never passes one.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};

use crate::error::CryptoError;

/// An AES key schedule for block encryption.
pub enum AesKey {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl AesKey {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        match key.len() {
            16 => Ok(Self::Aes128(Aes128::new(GenericArray::from_slice(key)))),
            24 => Ok(Self::Aes192(Aes192::new(GenericArray::from_slice(key)))),
            32 => Ok(Self::Aes256(Aes256::new(GenericArray::from_slice(key)))),
            _ => Err(CryptoError::InvalidSize("an AES key is 16, 24 or 32 bytes")),
        }
    }

    /// Encrypt one 16-byte block in place.
    pub fn encrypt_block(&self, block: &mut [u8; 16]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(aes) => aes.encrypt_block(block),
            Self::Aes192(aes) => aes.encrypt_block(block),
            Self::Aes256(aes) => aes.encrypt_block(block),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes128_matches_fips197_vector() {
        // FIPS-197 appendix C.1
        let key = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let aes = AesKey::new(&key).unwrap();
        let mut block: [u8; 16] =
            hex::decode("00112233445566778899aabbccddeeff").unwrap().try_into().unwrap();
        aes.encrypt_block(&mut block);
        assert_eq!(hex::encode(block), "69c4e0d86a7b0430d8cdb78070b4c55a");
    }

    #[test]
    fn rejects_bad_key_sizes() {
        assert!(matches!(AesKey::new(&[0u8; 15]), Err(CryptoError::InvalidSize(_))));
        assert!(matches!(AesKey::new(&[0u8; 33]), Err(CryptoError::InvalidSize(_))));
        assert!(AesKey::new(&[0u8; 24]).is_ok());
    }
}
