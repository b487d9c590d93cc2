//! mr_crypto — MicroRatchet cryptographic primitive facade
//!
//! # Design principles
//! - NO custom field or curve arithmetic; all primitives come from audited
//!   RustCrypto crates. What this crate adds is the exact constructions the
//!   protocol is defined over (AES-CTR with a shared keystream position, the
//!   AES absorb/expand KDF, Poly1305 keyed through AES) and the wire
//!   conventions (X-only public keys with an even-Y lift, fixed-width
//!   signatures, raw shared-secret X coordinates).
//! - Zeroize all secret material on drop.
//! - The protocol crate talks to these types only; the backing crates never
//!   leak through the API.
//!
//! # Module layout
//! - `sha`    — streaming SHA-256 and a one-shot digest helper
//! - `aes`    — single-block AES encryption (no mode, no decryption)
//! - `aesctr` — CTR keystream built on the block primitive
//! - `kdf`    — AES-based absorb/expand key derivation
//! - `poly`   — Poly1305-AES message authentication
//! - `ecdh`   — ephemeral key agreement, X-only public keys
//! - `ecdsa`  — identity signatures over prehashed digests
//! - `rng`    — pluggable entropy source
//! - `error`  — unified error type
//!
//! The curve is secp256r1 by default; the `secp256k1` cargo feature switches
//! both ECDH and ECDSA to the k256 backend at compile time.

pub mod aes;
pub mod aesctr;
pub mod ecdh;
pub mod ecdsa;
pub mod error;
pub mod kdf;
pub mod poly;
pub mod rng;
pub mod sha;

pub use error::CryptoError;

#[cfg(feature = "secp256k1")]
pub(crate) use k256 as curve;
#[cfg(not(feature = "secp256k1"))]
pub(crate) use p256 as curve;
