//! Entropy source
//!
//! The protocol draws randomness in small amounts (16 or 32 bytes at a time,
//! not even once per message), so the facade is a single fill call. Hosts
//! with their own entropy source implement [`SecureRng`]; everyone else uses
//! [`SystemRng`].

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::CryptoError;

/// Source of cryptographically secure random bytes.
pub trait SecureRng {
    fn fill(&mut self, dest: &mut [u8]) -> Result<(), CryptoError>;
}

/// OS entropy via `getrandom`.
pub struct SystemRng;

impl SecureRng for SystemRng {
    fn fill(&mut self, dest: &mut [u8]) -> Result<(), CryptoError> {
        OsRng.try_fill_bytes(dest).map_err(|_| CryptoError::Rng)
    }
}
