//! mr_proto — MicroRatchet session protocol engine
//!
//! An end-to-end encrypted session for constrained devices and unreliable
//! transports: a three-round mutual-authentication handshake, then a double
//! ratchet tuned for small frames, loss and reordering. Everything operates
//! in place on caller-supplied buffers; the engine allocates only for its
//! own ratchet state.
//!
//! # Protocol overview
//!
//! ## Initialization (client drives)
//! 1. Client → server: signed init request under the pre-shared application
//!    key (nonce, identity key, ephemeral ECDH).
//! 2. Server → client: signed init response (fresh nonce, ECDH for the root
//!    key, identity key, two ratchet ephemerals), header concealed under the
//!    application key, body under the freshly agreed root pre-key.
//! 3. Client → server: first data message carrying the server's nonce and
//!    the client's ratchet ECDH; the server installs its first ratchet from
//!    it and answers with a data message echoing its nonce.
//!
//! ## Established traffic
//! Per message a symmetric chain advances (forward secrecy); whenever a
//! frame has room for ECDH parameters a DH ratchet can fire on receipt,
//! deriving new root and header keys (post-compromise security). Messages
//! may arrive out of order or not at all: each receiving chain keeps one
//! older chain key as a reorder window and any forward jump is recoverable.
//!
//! # Module layout
//! - `chain`   — per-direction symmetric chain with the one-back window
//! - `ratchet` — ratchet steps and the bounded newest-first list
//! - `session` — the state machine and public API
//! - `message` — in-place framing: construct/deconstruct, MAC interpretation
//! - `state`   — versioned, tag-bitmap session persistence
//! - `error`   — unified error type

pub mod chain;
pub mod error;
mod message;
pub mod ratchet;
pub mod session;
mod state;

pub use error::SessionError;
pub use session::{Received, Role, Session, SessionConfig};

/// Symmetric and header key size.
pub const KEY_SIZE: usize = 32;
/// Per-message payload key size.
pub const MSG_KEY_SIZE: usize = 16;
/// Wire nonce (generation) size of a data message.
pub const NONCE_SIZE: usize = 4;
/// Truncated Poly1305-AES tag size.
pub const MAC_SIZE: usize = 12;
/// Handshake nonce size.
pub const INITIALIZATION_NONCE_SIZE: usize = 16;
/// X-only public key size.
pub const EC_NUM_SIZE: usize = 32;
/// Fixed-width `R || S` signature size.
pub const SIGNATURE_SIZE: usize = 64;
/// Header encryption IV size (trailing ciphertext bytes).
pub const HEADER_IV_SIZE: usize = 16;
/// MAC IV size (leading frame bytes).
pub const MAC_IV_SIZE: usize = 16;

/// Frame overhead of a data message without ECDH parameters.
pub const OVERHEAD_WITHOUT_ECDH: usize = NONCE_SIZE + MAC_SIZE;
/// Frame overhead of a data message with ECDH parameters.
pub const OVERHEAD_WITH_ECDH: usize = OVERHEAD_WITHOUT_ECDH + EC_NUM_SIZE;
/// Smallest valid data message.
pub const MIN_MESSAGE_SIZE: usize = 32;
/// Smallest valid data message carrying ECDH parameters.
pub const MIN_MESSAGE_SIZE_WITH_ECDH: usize = 64;

/// Minimum size of a round-1 init request before padding.
pub const INIT_REQUEST_SIZE: usize =
    INITIALIZATION_NONCE_SIZE + 2 * EC_NUM_SIZE + SIGNATURE_SIZE + MAC_SIZE;
/// Minimum size of a round-2 init response before padding.
pub const INIT_RESPONSE_SIZE: usize =
    2 * INITIALIZATION_NONCE_SIZE + 4 * EC_NUM_SIZE + SIGNATURE_SIZE + MAC_SIZE;
/// Recommended buffer size for handshake frames.
pub const MAX_INITIALIZATION_MESSAGE_SIZE: usize = 256;

/// Retained ratchet steps; older steps are evicted as new ones arrive.
pub const MAX_RATCHETS: usize = 5;
