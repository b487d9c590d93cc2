//! AES-CTR keystream
//!
//! The IV is the first ≤16 bytes of the caller's nonce, zero-padded on the
//! right; the counter is the whole 128-bit block, incremented big-endian
//! after each keystream block. The same direction encrypts and decrypts, and
//! the keystream position survives across [`AesCtr::apply`] calls: processing
//! 4 bytes and then 32 consumes exactly the same keystream as processing 36
//! in one call. Message deconstruction relies on that when it peels the
//! nonce off a header before deciding whether an ECDH block follows.

use crate::aes::AesKey;
use crate::error::CryptoError;

pub struct AesCtr<'k> {
    key: &'k AesKey,
    counter: [u8; 16],
    keystream: [u8; 16],
    used: usize,
}

impl<'k> AesCtr<'k> {
    pub fn new(key: &'k AesKey, iv: &[u8]) -> Self {
        let mut counter = [0u8; 16];
        let n = iv.len().min(16);
        counter[..n].copy_from_slice(&iv[..n]);
        Self { key, counter, keystream: [0u8; 16], used: 16 }
    }

    /// XOR the next keystream bytes into `data` in place.
    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            if self.used == 16 {
                self.keystream = self.counter;
                self.key.encrypt_block(&mut self.keystream);
                self.used = 0;
                for b in self.counter.iter_mut().rev() {
                    *b = b.wrapping_add(1);
                    if *b != 0 {
                        break;
                    }
                }
            }
            *byte ^= self.keystream[self.used];
            self.used += 1;
        }
    }
}

/// One-shot in-place encryption/decryption of `data`.
pub fn apply_keystream(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<(), CryptoError> {
    let aes = AesKey::new(key)?;
    let mut ctr = AesCtr::new(&aes, iv);
    ctr.apply(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [0x11; 16];

    #[test]
    fn same_direction_round_trips() {
        let mut data = *b"the quick brown fox jumps over the lazy dog";
        apply_keystream(&KEY, &[7u8; 4], &mut data).unwrap();
        assert_ne!(&data[..], b"the quick brown fox jumps over the lazy dog");
        apply_keystream(&KEY, &[7u8; 4], &mut data).unwrap();
        assert_eq!(&data[..], b"the quick brown fox jumps over the lazy dog");
    }

    #[test]
    fn split_calls_continue_the_keystream() {
        let mut whole = [0xabu8; 36];
        apply_keystream(&KEY, &[3u8; 16], &mut whole).unwrap();

        let aes = AesKey::new(&KEY).unwrap();
        let mut ctr = AesCtr::new(&aes, &[3u8; 16]);
        let mut split = [0xabu8; 36];
        ctr.apply(&mut split[..4]);
        ctr.apply(&mut split[4..36]);
        assert_eq!(whole, split);
    }

    #[test]
    fn short_iv_is_zero_padded() {
        let mut a = [0x5au8; 48];
        let mut b = [0x5au8; 48];
        let mut iv16 = [0u8; 16];
        iv16[..4].copy_from_slice(&[9, 8, 7, 6]);
        apply_keystream(&KEY, &[9, 8, 7, 6], &mut a).unwrap();
        apply_keystream(&KEY, &iv16, &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn counter_carries_across_blocks() {
        // An IV ending in 0xff must carry into the preceding byte between
        // blocks rather than wrapping within the last byte alone.
        let mut iv = [0u8; 16];
        iv[14] = 0x01;
        iv[15] = 0xff;
        let mut data = [0u8; 32];
        apply_keystream(&KEY, &iv, &mut data).unwrap();

        let aes = AesKey::new(&KEY).unwrap();
        let mut first = iv;
        aes.encrypt_block(&mut first);
        let mut second = [0u8; 16];
        second[14] = 0x02;
        aes.encrypt_block(&mut second);
        assert_eq!(&data[..16], &first);
        assert_eq!(&data[16..], &second);
    }
}
