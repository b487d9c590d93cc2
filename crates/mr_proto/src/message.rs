//! Message framing
//!
//! Data messages are built and taken apart in place:
//!
//! ```text
//! nonce(4) [ecdh(32)] ciphertext(payload + zero padding) mac(12)
//! ```
//!
//! The 4-byte nonce is the sending generation, big-endian, with the top bit
//! flagging the presence of ECDH parameters. Payload encryption is keyed by
//! the per-message chain key; the header is then encrypted under the step's
//! header key with the last 16 ciphertext bytes as IV, entangling it with
//! the whole frame; the MAC covers everything under the same header key.
//!
//! Deconstruction starts from the MAC: trying every live receive header key
//! (current, then next, newest step first), then the application key, and
//! finally, on a server with no ratchet installed yet, the handshake's first
//! receive header key. Which key matched decides everything that follows,
//! including whether an attached ECDH triggers a DH ratchet.

use subtle::ConstantTimeEq;
use tracing::{debug, trace};

use mr_crypto::aes::AesKey;
use mr_crypto::aesctr::{self, AesCtr};
use mr_crypto::ecdh::EcdhKeypair;
use mr_crypto::ecdsa::{self, EcdsaIdentity};
use mr_crypto::poly::Poly1305Aes;
use mr_crypto::sha;
use zeroize::Zeroize;

use crate::error::{Result, SessionError};
use crate::ratchet::RatchetStep;
use crate::session::{InitState, Session};
use crate::{
    EC_NUM_SIZE, HEADER_IV_SIZE, KEY_SIZE, MAC_IV_SIZE, MAC_SIZE, MIN_MESSAGE_SIZE,
    MIN_MESSAGE_SIZE_WITH_ECDH, NONCE_SIZE, OVERHEAD_WITHOUT_ECDH, OVERHEAD_WITH_ECDH,
    SIGNATURE_SIZE,
};

const ECDH_FLAG: u8 = 0b1000_0000;
const ZERO_KEY: [u8; KEY_SIZE] = [0u8; KEY_SIZE];

/// Which header key authenticated an inbound frame.
pub(crate) enum MacMatch {
    /// A ratchet step's receive header key, current or next.
    Ratchet { index: usize, used_next: bool },
    /// The pre-shared application key: a handshake message.
    Application,
    /// The server's stored first receive header key (round 3, no ratchet
    /// installed yet).
    ServerFirst,
}

/// Header key to use when deconstructing, resolved from a [`MacMatch`].
pub(crate) enum HeaderKeySource {
    Ratchet { index: usize, used_next: bool },
    ServerFirst,
}

// ── Shared helpers ───────────────────────────────────────────────────────

/// In-place AES-CTR over `data`.
pub(crate) fn crypt(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    aesctr::apply_keystream(key, iv, data)?;
    Ok(())
}

/// Compute the truncated Poly1305-AES tag over everything but the trailing
/// tag bytes, writing it into them.
pub(crate) fn compute_mac(data: &mut [u8], key: &[u8; KEY_SIZE], iv: &[u8; 16]) -> Result<()> {
    let split = data.len() - MAC_SIZE;
    let tag = Poly1305Aes::new(key, iv)?.tag(&data[..split]);
    data[split..].copy_from_slice(&tag[..MAC_SIZE]);
    Ok(())
}

/// Constant-time check of the trailing tag bytes.
pub(crate) fn verify_mac(data: &[u8], key: &[u8; KEY_SIZE], iv: &[u8; 16]) -> Result<bool> {
    let split = data.len() - MAC_SIZE;
    let tag = Poly1305Aes::new(key, iv)?.tag(&data[..split]);
    Ok(tag[..MAC_SIZE].ct_eq(&data[split..]).into())
}

/// Sign a frame in place: digest everything before the trailing signature
/// slot, write the signature into it.
pub(crate) fn sign_frame(identity: &EcdsaIdentity, frame: &mut [u8]) -> Result<()> {
    let sig_offset = frame.len() - SIGNATURE_SIZE;
    let digest = sha::digest(&frame[..sig_offset]);
    let signature = identity.sign(&digest)?;
    frame[sig_offset..].copy_from_slice(&signature);
    Ok(())
}

/// Verify a trailing frame signature against an X-only public key.
pub(crate) fn verify_frame(frame: &[u8], public_x: &[u8; 32]) -> bool {
    let sig_offset = frame.len() - SIGNATURE_SIZE;
    let digest = sha::digest(&frame[..sig_offset]);
    let signature: [u8; SIGNATURE_SIZE] = match frame[sig_offset..].try_into() {
        Ok(signature) => signature,
        Err(_) => return false,
    };
    ecdsa::verify(&signature, &digest, public_x)
}

impl Session {
    /// Find the header key that authenticates `message`. First match wins;
    /// the search order is load-bearing for the handshake.
    pub(crate) fn interpret_mac(&self, message: &[u8]) -> Result<MacMatch> {
        let mac_iv: [u8; MAC_IV_SIZE] = message[..MAC_IV_SIZE].try_into().unwrap();

        for (index, step) in self.ratchets.iter().enumerate() {
            if step.receive_header_key == ZERO_KEY {
                continue;
            }
            if verify_mac(message, &step.receive_header_key, &mac_iv)? {
                trace!(index, "mac matches ratchet header key");
                return Ok(MacMatch::Ratchet { index, used_next: false });
            }
            if step.next_receive_header_key != ZERO_KEY
                && verify_mac(message, &step.next_receive_header_key, &mac_iv)?
            {
                trace!(index, "mac matches next ratchet header key");
                return Ok(MacMatch::Ratchet { index, used_next: true });
            }
        }

        if verify_mac(message, &self.config.application_key, &mac_iv)? {
            trace!("mac matches application key");
            return Ok(MacMatch::Application);
        }

        if !self.is_client() && !self.initialized && self.ratchets.is_empty() {
            if let InitState::Server(Some(server)) = &self.init {
                if server.first_receive_header_key != ZERO_KEY
                    && verify_mac(message, &server.first_receive_header_key, &mac_iv)?
                {
                    trace!("mac matches first receive header key");
                    return Ok(MacMatch::ServerFirst);
                }
            }
        }

        Err(SessionError::NotFound("the message does not match any known header key"))
    }

    /// Build a data message in place. The payload occupies the front of
    /// `buffer`; the whole buffer becomes the frame.
    pub(crate) fn construct_message(
        &mut self,
        buffer: &mut [u8],
        amount: usize,
        include_ecdh: bool,
        step_index: usize,
    ) -> Result<()> {
        let space = buffer.len();
        if include_ecdh {
            if space < MIN_MESSAGE_SIZE_WITH_ECDH {
                return Err(SessionError::InvalidSize(
                    "a message with ECDH parameters is at least 64 bytes",
                ));
            }
            if space < amount + OVERHEAD_WITH_ECDH {
                return Err(SessionError::InvalidSize(
                    "a message with ECDH parameters needs 48 bytes beyond the payload",
                ));
            }
        } else {
            if space < MIN_MESSAGE_SIZE {
                return Err(SessionError::InvalidSize("a message is at least 32 bytes"));
            }
            if space < amount + OVERHEAD_WITHOUT_ECDH {
                return Err(SessionError::InvalidSize(
                    "a message needs 16 bytes beyond the payload",
                ));
            }
        }

        let step = self
            .ratchets
            .get_mut(step_index)
            .ok_or(SessionError::InvalidOp("could not find the required ratchet step"))?;

        // Committed from here on: the chain does not rewind on failure.
        let (mut message_key, generation) = step.sending_chain.ratchet_for_sending()?;
        if generation > 0x7fff_ffff {
            return Err(SessionError::InvalidOp(
                "the sending generation exhausted its counter; a DH ratchet must happen first",
            ));
        }

        let header_size = NONCE_SIZE + if include_ecdh { EC_NUM_SIZE } else { 0 };
        let mac_offset = space - MAC_SIZE;
        let header_iv_offset = mac_offset - HEADER_IV_SIZE;

        buffer.copy_within(..amount, header_size);
        buffer[header_size + amount..mac_offset].fill(0);
        buffer[..NONCE_SIZE].copy_from_slice(&generation.to_be_bytes());

        let nonce_iv: [u8; NONCE_SIZE] = buffer[..NONCE_SIZE].try_into().unwrap();
        crypt(&message_key, &nonce_iv, &mut buffer[header_size..mac_offset])?;
        message_key.zeroize();

        if include_ecdh {
            let public = step
                .ecdh_key
                .as_ref()
                .ok_or(SessionError::InvalidOp("the ratchet step has no ECDH key to announce"))?
                .public_x();
            buffer[NONCE_SIZE..header_size].copy_from_slice(&public);
            buffer[0] |= ECDH_FLAG;
        } else {
            buffer[0] &= !ECDH_FLAG;
        }

        let send_header_key = step.send_header_key;
        let header_iv: [u8; HEADER_IV_SIZE] =
            buffer[header_iv_offset..mac_offset].try_into().unwrap();
        crypt(&send_header_key, &header_iv, &mut buffer[..header_size])?;

        let mac_iv: [u8; MAC_IV_SIZE] = buffer[..MAC_IV_SIZE].try_into().unwrap();
        compute_mac(buffer, &send_header_key, &mac_iv)?;
        Ok(())
    }

    /// Take a data message apart in place, performing whatever ratchet work
    /// the header demands. Returns the payload region (offset, length).
    pub(crate) fn deconstruct_message(
        &mut self,
        buffer: &mut [u8],
        amount: usize,
        source: HeaderKeySource,
    ) -> Result<(usize, usize)> {
        if amount < MIN_MESSAGE_SIZE {
            return Err(SessionError::InvalidSize("a message is at least 32 bytes"));
        }

        let header_key: [u8; KEY_SIZE] = match &source {
            HeaderKeySource::Ratchet { index, used_next } => {
                let step = self
                    .ratchets
                    .get(*index)
                    .ok_or(SessionError::InvalidOp("the matched ratchet step is gone"))?;
                if *used_next {
                    step.next_receive_header_key
                } else {
                    step.receive_header_key
                }
            }
            HeaderKeySource::ServerFirst => {
                let InitState::Server(Some(server)) = &self.init else {
                    return Err(SessionError::InvalidOp(
                        "the session is not in a state to process this message",
                    ));
                };
                server.first_receive_header_key
            }
        };

        // Decrypt the nonce, peek at the ECDH flag, and keep the keystream
        // running for the ECDH block so the header reads as one stream.
        let header_iv_offset = amount - MAC_SIZE - HEADER_IV_SIZE;
        let header_iv: [u8; HEADER_IV_SIZE] =
            buffer[header_iv_offset..amount - MAC_SIZE].try_into().unwrap();
        let header_aes = AesKey::new(&header_key)?;
        let mut header_ctr = AesCtr::new(&header_aes, &header_iv);
        header_ctr.apply(&mut buffer[..NONCE_SIZE]);

        let has_ecdh = buffer[0] & ECDH_FLAG != 0;
        buffer[0] &= !ECDH_FLAG;
        if has_ecdh {
            header_ctr.apply(&mut buffer[NONCE_SIZE..NONCE_SIZE + EC_NUM_SIZE]);
        }

        let generation = u32::from_be_bytes(buffer[..NONCE_SIZE].try_into().unwrap());
        let payload_offset = NONCE_SIZE + if has_ecdh { EC_NUM_SIZE } else { 0 };
        let payload_size = amount - payload_offset - MAC_SIZE;

        let step_index = if has_ecdh {
            let remote_ecdh: [u8; EC_NUM_SIZE] =
                buffer[NONCE_SIZE..NONCE_SIZE + EC_NUM_SIZE].try_into().unwrap();
            match source {
                HeaderKeySource::ServerFirst => {
                    // No ratchet exists yet: install the first step from the
                    // handshake ephemerals and the carried ECDH key.
                    if self.is_client() {
                        return Err(SessionError::InvalidOp(
                            "only the server can initialize a ratchet from the handshake key",
                        ));
                    }
                    let InitState::Server(Some(server)) = &mut self.init else {
                        return Err(SessionError::InvalidOp(
                            "the session is not in a state to process this message",
                        ));
                    };
                    debug!("initializing first server ratchet step");
                    let step1 = server.local_ratchet_step1.take().ok_or(SessionError::InvalidOp(
                        "the server ratchet ephemeral was already consumed",
                    ))?;
                    let step0 = server.local_ratchet_step0.as_ref().ok_or(
                        SessionError::InvalidOp("the server ratchet ephemeral is missing"),
                    )?;
                    let step = RatchetStep::initialize_server(
                        step0,
                        &server.root_key,
                        &remote_ecdh,
                        step1,
                        Some(&server.first_receive_header_key),
                        Some(&server.first_send_header_key),
                    )?;
                    server.local_ratchet_step0 = None;
                    self.ratchets.add(step);
                    0
                }
                HeaderKeySource::Ratchet { index, used_next } => {
                    if used_next {
                        // The peer moved to its next header key: DH ratchet.
                        debug!("performing DH ratchet step");
                        let keypair = EcdhKeypair::generate(self.rng.as_mut())?;
                        let step = self
                            .ratchets
                            .get_mut(index)
                            .ok_or(SessionError::InvalidOp("the matched ratchet step is gone"))?;
                        let next = step.ratchet(&remote_ecdh, keypair)?;
                        self.ratchets.add(next);
                        0
                    } else {
                        index
                    }
                }
            }
        } else {
            match source {
                HeaderKeySource::Ratchet { index, .. } => index,
                HeaderKeySource::ServerFirst => {
                    return Err(SessionError::InvalidOp(
                        "a handshake header key was used but the message carried no ECDH key",
                    ));
                }
            }
        };

        let step = self
            .ratchets
            .get_mut(step_index)
            .ok_or(SessionError::InvalidOp("could not find the ratchet step for the message"))?;
        let mut message_key = step.receiving_chain.ratchet_for_receiving(generation)?;

        let nonce_iv: [u8; NONCE_SIZE] = buffer[..NONCE_SIZE].try_into().unwrap();
        crypt(&message_key, &nonce_iv, &mut buffer[payload_offset..amount - MAC_SIZE])?;
        message_key.zeroize();

        Ok((payload_offset, payload_size))
    }
}
