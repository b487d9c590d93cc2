//! Ephemeral key agreement
//!
//! Public keys travel as the 32-byte X coordinate only. The Y coordinate is
//! recovered under the convention that it is even, so key generation retries
//! until it lands on an even-Y pair. Deriving returns the raw X coordinate
//! of the shared point; the protocol hashes it itself.
//!
//! Persistence stores the 32-byte secret scalar; the public key is
//! recomputed on load, which keeps behavior identical across curve backends
//! whatever the cost of the recomputation.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::curve;
use crate::curve::elliptic_curve::sec1::ToEncodedPoint;
use crate::curve::{FieldBytes, NonZeroScalar, PublicKey};
use crate::error::CryptoError;
use crate::rng::SecureRng;

/// A local ECDH keypair.
#[derive(Clone, Debug, Zeroize, ZeroizeOnDrop)]
pub struct EcdhKeypair {
    secret: [u8; 32],
    public_x: [u8; 32],
}

/// Keypairs compare by their public coordinate.
impl PartialEq for EcdhKeypair {
    fn eq(&self, other: &Self) -> bool {
        self.public_x == other.public_x
    }
}

impl Eq for EcdhKeypair {}

impl EcdhKeypair {
    /// Generate a fresh keypair whose public point has an even Y.
    pub fn generate(rng: &mut dyn SecureRng) -> Result<Self, CryptoError> {
        loop {
            let mut seed = [0u8; 32];
            rng.fill(&mut seed)?;
            let Some(keypair) = Self::try_from_scalar(&seed) else { continue };
            seed.zeroize();
            return Ok(keypair);
        }
    }

    /// Rebuild a keypair from a stored secret scalar.
    pub fn from_scalar_bytes(secret: &[u8; 32]) -> Result<Self, CryptoError> {
        Self::try_from_scalar(secret)
            .ok_or(CryptoError::InvalidKey("the stored scalar is not a valid even-Y keypair"))
    }

    fn try_from_scalar(secret: &[u8; 32]) -> Option<Self> {
        let scalar: Option<NonZeroScalar> =
            NonZeroScalar::from_repr(FieldBytes::from(*secret)).into();
        let scalar = scalar?;
        let public = PublicKey::from_secret_scalar(&scalar);
        let encoded = public.to_encoded_point(true);
        if encoded.as_bytes()[0] != 0x02 {
            return None;
        }
        let mut public_x = [0u8; 32];
        public_x.copy_from_slice(&encoded.as_bytes()[1..33]);
        Some(Self { secret: *secret, public_x })
    }

    /// The secret scalar, for persistence.
    pub fn scalar_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    /// The public X coordinate as transmitted on the wire.
    pub fn public_x(&self) -> [u8; 32] {
        self.public_x
    }

    /// Derive the raw X coordinate of the shared point with a remote public
    /// key, lifting the remote X under the even-Y convention.
    pub fn derive(&self, remote_x: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
        let remote = lift_x(remote_x)?;
        let scalar: Option<NonZeroScalar> =
            NonZeroScalar::from_repr(FieldBytes::from(self.secret)).into();
        let scalar = scalar.ok_or(CryptoError::InvalidKey("corrupt local scalar"))?;
        let shared = curve::ecdh::diffie_hellman(&scalar, remote.as_affine());
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes());
        Ok(out)
    }
}

/// Recover the full public point from an X-only wire key.
pub(crate) fn lift_x(x: &[u8; 32]) -> Result<PublicKey, CryptoError> {
    let mut sec1 = [0u8; 33];
    sec1[0] = 0x02;
    sec1[1..].copy_from_slice(x);
    PublicKey::from_sec1_bytes(&sec1)
        .map_err(|_| CryptoError::InvalidKey("the public key is not a curve X coordinate"))
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
    fn generated_keys_have_even_y() {
        let mut rng = TestRng(1);
        for _ in 0..4 {
            let kp = EcdhKeypair::generate(&mut rng).unwrap();
            assert!(lift_x(&kp.public_x()).is_ok());
        }
    }

    #[test]
    fn derive_is_symmetric() {
        let mut rng = TestRng(2);
        let a = EcdhKeypair::generate(&mut rng).unwrap();
        let b = EcdhKeypair::generate(&mut rng).unwrap();
        assert_eq!(a.derive(&b.public_x()).unwrap(), b.derive(&a.public_x()).unwrap());
    }

    #[test]
    fn store_load_round_trip() {
        let mut rng = TestRng(3);
        let a = EcdhKeypair::generate(&mut rng).unwrap();
        let b = EcdhKeypair::generate(&mut rng).unwrap();
        let restored = EcdhKeypair::from_scalar_bytes(a.scalar_bytes()).unwrap();
        assert_eq!(restored, a);
        assert_eq!(restored.derive(&b.public_x()).unwrap(), a.derive(&b.public_x()).unwrap());
    }

    #[test]
    fn rejects_an_invalid_remote_key() {
        let mut rng = TestRng(4);
        let a = EcdhKeypair::generate(&mut rng).unwrap();
        assert!(a.derive(&[0xff; 32]).is_err());
    }
}
