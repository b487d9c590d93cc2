use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid size: {0}")]
    InvalidSize(&'static str),

    #[error("invalid key material: {0}")]
    InvalidKey(&'static str),

    #[error("random number generation failed")]
    Rng,

    #[error("signing failed")]
    Signature,
}
