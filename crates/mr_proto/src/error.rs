use mr_crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// A buffer or message was too small for the operation.
    #[error("invalid size: {0}")]
    InvalidSize(&'static str),

    /// The session is not in a state where the operation is allowed, or an
    /// authenticated handshake check (signature, nonce echo) failed.
    #[error("invalid operation: {0}")]
    InvalidOp(&'static str),

    /// No matching key: an unrecognized MAC, or a chain key that has been
    /// permanently discarded.
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// A primitive failed underneath the protocol.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub type Result<T> = core::result::Result<T, SessionError>;
