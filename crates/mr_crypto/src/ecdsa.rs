//! Identity signatures
//!
//! Same wire conventions as the key agreement side: X-only public keys with
//! the even-Y lift, and signatures serialized as fixed-width big-endian
//! `R || S` with no encoding. Signing always takes a 32-byte message digest,
//! never the message itself.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::curve::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use crate::curve::ecdsa::{Signature, SigningKey, VerifyingKey};
use crate::curve::elliptic_curve::sec1::ToEncodedPoint;
use crate::curve::FieldBytes;
use crate::error::CryptoError;
use crate::rng::SecureRng;

pub const SIGNATURE_SIZE: usize = 64;

/// A long-term signing identity.
#[derive(Clone, Debug, Zeroize, ZeroizeOnDrop)]
pub struct EcdsaIdentity {
    secret: [u8; 32],
    public_x: [u8; 32],
}

impl PartialEq for EcdsaIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.public_x == other.public_x
    }
}

impl Eq for EcdsaIdentity {}

impl EcdsaIdentity {
    /// Generate a fresh identity whose public point has an even Y.
    pub fn generate(rng: &mut dyn SecureRng) -> Result<Self, CryptoError> {
        loop {
            let mut seed = [0u8; 32];
            rng.fill(&mut seed)?;
            let Some(identity) = Self::try_from_scalar(&seed) else { continue };
            seed.zeroize();
            return Ok(identity);
        }
    }

    /// Rebuild an identity from a stored secret scalar.
    pub fn from_scalar_bytes(secret: &[u8; 32]) -> Result<Self, CryptoError> {
        Self::try_from_scalar(secret)
            .ok_or(CryptoError::InvalidKey("the stored scalar is not a valid even-Y identity"))
    }

    fn try_from_scalar(secret: &[u8; 32]) -> Option<Self> {
        let key = SigningKey::from_bytes(&FieldBytes::from(*secret)).ok()?;
        let encoded = key.verifying_key().to_encoded_point(true);
        if encoded.as_bytes()[0] != 0x02 {
            return None;
        }
        let mut public_x = [0u8; 32];
        public_x.copy_from_slice(&encoded.as_bytes()[1..33]);
        Some(Self { secret: *secret, public_x })
    }

    pub fn scalar_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    pub fn public_x(&self) -> [u8; 32] {
        self.public_x
    }

    /// Sign a 32-byte digest, returning `R || S`.
    pub fn sign(&self, digest: &[u8; 32]) -> Result<[u8; SIGNATURE_SIZE], CryptoError> {
        let key = SigningKey::from_bytes(&FieldBytes::from(self.secret))
            .map_err(|_| CryptoError::InvalidKey("corrupt identity scalar"))?;
        let signature: Signature =
            key.sign_prehash(digest).map_err(|_| CryptoError::Signature)?;
        let mut out = [0u8; SIGNATURE_SIZE];
        out.copy_from_slice(&signature.to_bytes());
        Ok(out)
    }
}

/// Verify an `R || S` signature over a digest against an X-only public key.
pub fn verify(signature: &[u8; SIGNATURE_SIZE], digest: &[u8; 32], public_x: &[u8; 32]) -> bool {
    let mut sec1 = [0u8; 33];
    sec1[0] = 0x02;
    sec1[1..].copy_from_slice(public_x);
    let Ok(key) = VerifyingKey::from_sec1_bytes(&sec1) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify_prehash(digest, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestRng(u64);

    impl SecureRng for TestRng {
        fn fill(&mut self, dest: &mut [u8]) -> Result<(), CryptoError> {
            for b in dest {
                self.0 ^= self.0 << 13;
                self.0 ^= self.0 >> 7;
                self.0 ^= self.0 << 17;
                *b = self.0 as u8;
            }
            Ok(())
        }
    }

    #[test]
    fn sign_verify_round_trip() {
        let mut rng = TestRng(11);
        let identity = EcdsaIdentity::generate(&mut rng).unwrap();
        let digest = [0x5cu8; 32];
        let signature = identity.sign(&digest).unwrap();
        assert!(verify(&signature, &digest, &identity.public_x()));
    }

    #[test]
    fn tampered_digest_fails() {
        let mut rng = TestRng(12);
        let identity = EcdsaIdentity::generate(&mut rng).unwrap();
        let signature = identity.sign(&[0x5cu8; 32]).unwrap();
        assert!(!verify(&signature, &[0x5du8; 32], &identity.public_x()));
    }

    #[test]
    fn wrong_key_fails() {
        let mut rng = TestRng(13);
        let identity = EcdsaIdentity::generate(&mut rng).unwrap();
        let other = EcdsaIdentity::generate(&mut rng).unwrap();
        let digest = [0u8; 32];
        let signature = identity.sign(&digest).unwrap();
        assert!(!verify(&signature, &digest, &other.public_x()));
    }

    #[test]
    fn store_load_round_trip() {
        let mut rng = TestRng(14);
        let identity = EcdsaIdentity::generate(&mut rng).unwrap();
        let restored = EcdsaIdentity::from_scalar_bytes(identity.scalar_bytes()).unwrap();
        assert_eq!(restored, identity);
        let digest = [0x33u8; 32];
        let signature = restored.sign(&digest).unwrap();
        assert!(verify(&signature, &digest, &identity.public_x()));
    }
}
