//! Session state machine
//!
//! A [`Session`] owns one end of the protocol: the role, the pre-shared
//! application key, an optional signing identity, the handshake state for
//! whichever role it plays, and the ratchet list once traffic flows.
//!
//! All entry points operate in place on caller buffers. `receive` hands back
//! either the decrypted payload region, the same buffer rewritten into a
//! handshake reply that must go back over the wire, or the news that the
//! handshake just completed.

use tracing::{debug, trace};
use zeroize::{Zeroize, ZeroizeOnDrop};

use mr_crypto::ecdh::EcdhKeypair;
use mr_crypto::ecdsa::EcdsaIdentity;
use mr_crypto::kdf::kdf;
use mr_crypto::rng::{SecureRng, SystemRng};
use mr_crypto::sha;

use crate::error::{Result, SessionError};
use crate::message::{self, HeaderKeySource, MacMatch};
use crate::ratchet::{RatchetList, RatchetStep};
use crate::{
    INITIALIZATION_NONCE_SIZE, INIT_REQUEST_SIZE, INIT_RESPONSE_SIZE, KEY_SIZE, MAC_SIZE,
    MIN_MESSAGE_SIZE, OVERHEAD_WITHOUT_ECDH, OVERHEAD_WITH_ECDH, SIGNATURE_SIZE,
};

/// Which end of the protocol this session is. Only a client can initiate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Static session parameters.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionConfig {
    #[zeroize(skip)]
    pub role: Role,
    /// Pre-shared by every peer of a deployment. Authenticates and conceals
    /// the handshake; established traffic does not depend on its secrecy.
    pub application_key: [u8; KEY_SIZE],
}

/// Client-side handshake state, alive between `initiate` and completion.
#[derive(Default, PartialEq, Zeroize, ZeroizeOnDrop)]
pub(crate) struct ClientInit {
    pub(crate) initialization_nonce: [u8; INITIALIZATION_NONCE_SIZE],
    pub(crate) local_ecdh_for_init: Option<EcdhKeypair>,
}

/// Server-side handshake state, alive from the first init request until the
/// first post-handshake data message decrypts.
#[derive(Default, PartialEq, Zeroize, ZeroizeOnDrop)]
pub(crate) struct ServerInit {
    pub(crate) next_initialization_nonce: [u8; INITIALIZATION_NONCE_SIZE],
    pub(crate) root_key: [u8; KEY_SIZE],
    pub(crate) first_send_header_key: [u8; KEY_SIZE],
    pub(crate) first_receive_header_key: [u8; KEY_SIZE],
    pub(crate) local_ratchet_step0: Option<EcdhKeypair>,
    pub(crate) local_ratchet_step1: Option<EcdhKeypair>,
    pub(crate) client_public_key: [u8; 32],
}

/// Role-specific handshake state slot.
#[derive(PartialEq)]
pub(crate) enum InitState {
    Client(Option<Box<ClientInit>>),
    Server(Option<Box<ServerInit>>),
}

/// Outcome of feeding a frame to [`Session::receive`].
pub enum Received<'a> {
    /// A data message decrypted; the slice is the payload region inside the
    /// caller's buffer, trailing zero padding included.
    Payload(&'a [u8]),
    /// The buffer was rewritten into a handshake frame that must be
    /// transmitted back to the peer.
    SendBack(&'a [u8]),
    /// The handshake just completed; there is nothing to deliver or send.
    Established,
}

pub(crate) enum InitOutcome {
    SendBack,
    Established,
}

pub struct Session {
    pub(crate) config: SessionConfig,
    pub(crate) identity: Option<EcdsaIdentity>,
    pub(crate) initialized: bool,
    pub(crate) init: InitState,
    pub(crate) ratchets: RatchetList,
    pub(crate) rng: Box<dyn SecureRng>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session drawing randomness from the operating system.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_rng(config, Box::new(SystemRng))
    }

    /// Create a session with a caller-supplied entropy source.
    pub fn with_rng(config: SessionConfig, rng: Box<dyn SecureRng>) -> Self {
        let init = match config.role {
            Role::Client => InitState::Client(None),
            Role::Server => InitState::Server(None),
        };
        Self { config, identity: None, initialized: false, init, ratchets: RatchetList::new(), rng }
    }

    /// Install the long-term signing identity. Required before the handshake;
    /// not needed again once the session is established.
    pub fn set_identity(&mut self, identity: EcdsaIdentity) {
        self.identity = Some(identity);
    }

    pub fn identity(&self) -> Option<&EcdsaIdentity> {
        self.identity.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_client(&self) -> bool {
        self.config.role == Role::Client
    }

    /// Start (or with `force`, restart) the handshake. Fills `frame` with
    /// the init request; the whole frame must be transmitted to the server.
    pub fn initiate(&mut self, frame: &mut [u8], force: bool) -> Result<()> {
        if self.initialized && !force {
            return Err(SessionError::InvalidOp(
                "the session is already initialized; pass force to re-initialize",
            ));
        }
        if !self.is_client() {
            return Err(SessionError::InvalidOp("only a client can initiate a session"));
        }
        debug!("initiating session");

        self.initialized = false;
        if let InitState::Client(slot) = &mut self.init {
            *slot = Some(Box::default());
        }
        self.ratchets.clear();

        self.send_initialization_request(frame)
    }

    /// Process one inbound frame in place. `message_len` is the length of
    /// the message inside `buffer`; the remainder of the buffer is writable
    /// scratch for handshake replies.
    pub fn receive<'a>(&mut self, buffer: &'a mut [u8], message_len: usize) -> Result<Received<'a>> {
        if message_len < MIN_MESSAGE_SIZE {
            return Err(SessionError::InvalidSize("a message is at least 32 bytes"));
        }
        if buffer.len() < message_len {
            return Err(SessionError::InvalidSize("the buffer must hold the whole message"));
        }

        let matched = self.interpret_mac(&buffer[..message_len])?;

        if matches!(matched, MacMatch::Application) || !self.initialized {
            if let InitState::Server(slot) = &mut self.init {
                if slot.is_none() {
                    *slot = Some(Box::default());
                }
            }
            match self.process_initialization(buffer, message_len, matched)? {
                InitOutcome::SendBack => Ok(Received::SendBack(&buffer[..])),
                InitOutcome::Established => Ok(Received::Established),
            }
        } else {
            let MacMatch::Ratchet { index, used_next } = matched else {
                return Err(SessionError::InvalidOp(
                    "could not identify the ratchet step used for the message",
                ));
            };
            let (offset, len) = self.deconstruct_message(
                buffer,
                message_len,
                HeaderKeySource::Ratchet { index, used_next },
            )?;

            // First ordinary message: the handshake state has served its
            // purpose on this side.
            if let InitState::Server(slot) = &mut self.init {
                if slot.is_some() {
                    debug!("releasing server initialization state");
                    *slot = None;
                }
            }

            Ok(Received::Payload(&buffer[offset..offset + len]))
        }
    }

    /// Encrypt the first `payload_len` bytes of `buffer` in place, filling
    /// the entire buffer as the wire frame. ECDH parameters ride along
    /// whenever the frame has room for them.
    pub fn send(&mut self, buffer: &mut [u8], payload_len: usize) -> Result<()> {
        if !self.initialized {
            return Err(SessionError::InvalidOp("the session has not been initialized"));
        }
        if buffer.len() < payload_len + OVERHEAD_WITHOUT_ECDH {
            return Err(SessionError::InvalidSize(
                "the buffer must exceed the payload by at least 16 bytes",
            ));
        }

        let include_ecdh = buffer.len() - payload_len >= OVERHEAD_WITH_ECDH;
        let index = if include_ecdh {
            if self.ratchets.is_empty() {
                None
            } else {
                Some(0)
            }
        } else {
            self.ratchets.second_to_last_index(self.is_client())
        };
        let index =
            index.ok_or(SessionError::InvalidOp("could not find the required ratchet step"))?;

        self.construct_message(buffer, payload_len, include_ecdh, index)
    }

    // ── Handshake rounds ─────────────────────────────────────────────────

    /// Round 1, client: nonce, identity key and init ECDH, signed, concealed
    /// and authenticated under the application key.
    fn send_initialization_request(&mut self, output: &mut [u8]) -> Result<()> {
        if output.len() < INIT_REQUEST_SIZE {
            return Err(SessionError::InvalidSize("the init request needs at least 156 bytes"));
        }
        let identity = self
            .identity
            .as_ref()
            .ok_or(SessionError::InvalidOp("the session has no identity"))?;
        let InitState::Client(Some(client)) = &mut self.init else {
            return Err(SessionError::InvalidOp("client initialization state is missing"));
        };

        self.rng.fill(&mut client.initialization_nonce)?;
        let keypair = EcdhKeypair::generate(self.rng.as_mut())?;

        // nonce(16) | identity(32) | ecdh(32) | padding | signature(64) | mac(12)
        let mac_offset = output.len() - MAC_SIZE;
        let sig_offset = mac_offset - SIGNATURE_SIZE;
        output[..16].copy_from_slice(&client.initialization_nonce);
        output[16..48].copy_from_slice(&identity.public_x());
        output[48..80].copy_from_slice(&keypair.public_x());
        output[80..sig_offset].fill(0);

        message::sign_frame(identity, &mut output[..mac_offset])?;
        let iv: [u8; 16] = output[..16].try_into().unwrap();
        message::crypt(&self.config.application_key, &iv, &mut output[16..mac_offset])?;
        message::compute_mac(output, &self.config.application_key, &iv)?;

        client.local_ecdh_for_init = Some(keypair);
        Ok(())
    }

    /// Round 1, server: authenticate the request, handle restarts, record the
    /// client identity. Returns the client's nonce and init ECDH key.
    fn receive_initialization_request(
        &mut self,
        data: &mut [u8],
        amount: usize,
    ) -> Result<([u8; INITIALIZATION_NONCE_SIZE], [u8; 32])> {
        if amount < INIT_REQUEST_SIZE {
            return Err(SessionError::InvalidSize("the init request is too small"));
        }
        if self.identity.is_none() {
            return Err(SessionError::InvalidOp("the session has no identity"));
        }

        let mac_offset = amount - MAC_SIZE;
        let iv: [u8; 16] = data[..16].try_into().unwrap();
        message::crypt(&self.config.application_key, &iv, &mut data[16..mac_offset])?;

        let client_public: [u8; 32] = data[16..48].try_into().unwrap();
        let InitState::Server(Some(server)) = &mut self.init else {
            return Err(SessionError::InvalidOp("server initialization state is missing"));
        };

        if server.client_public_key != [0u8; 32] {
            if server.client_public_key != client_public {
                return Err(SessionError::InvalidOp(
                    "the session was initialized before with a different client identity",
                ));
            }
            // Same client starting over: drop the previous handshake state.
            trace!("client restarted initialization");
            **server = ServerInit::default();
        }

        if !message::verify_frame(&data[..mac_offset], &client_public) {
            return Err(SessionError::InvalidOp("the client signature was invalid"));
        }
        server.client_public_key = client_public;

        let nonce: [u8; INITIALIZATION_NONCE_SIZE] = data[..16].try_into().unwrap();
        let remote_ecdh: [u8; 32] = data[48..80].try_into().unwrap();
        Ok((nonce, remote_ecdh))
    }

    /// Round 2, server: derive the root pre-key from the client's init ECDH,
    /// expand root and first header keys, generate the two ratchet
    /// ephemerals, and build the signed, doubly concealed response.
    fn send_initialization_response(
        &mut self,
        init_nonce: &[u8; INITIALIZATION_NONCE_SIZE],
        remote_ecdh: &[u8; 32],
        output: &mut [u8],
    ) -> Result<()> {
        if output.len() < INIT_RESPONSE_SIZE {
            return Err(SessionError::InvalidSize("the init response needs at least 236 bytes"));
        }
        let identity = self
            .identity
            .as_ref()
            .ok_or(SessionError::InvalidOp("the session has no identity"))?;
        let InitState::Server(Some(server)) = &mut self.init else {
            return Err(SessionError::InvalidOp("server initialization state is missing"));
        };

        self.rng.fill(&mut server.next_initialization_nonce)?;

        let root_pre_ecdh = EcdhKeypair::generate(self.rng.as_mut())?;
        let mut shared = root_pre_ecdh.derive(remote_ecdh)?;
        let root_pre_key = sha::digest(&shared);
        shared.zeroize();

        let mut derived = [0u8; KEY_SIZE * 3];
        kdf(&root_pre_key, &server.next_initialization_nonce, &mut derived)?;
        server.root_key.copy_from_slice(&derived[..32]);
        server.first_send_header_key.copy_from_slice(&derived[32..64]);
        server.first_receive_header_key.copy_from_slice(&derived[64..96]);
        derived.zeroize();

        // Two ratchet ephemerals: one covering the client's first ratchet,
        // one that becomes this side's first installed step.
        let step0 = EcdhKeypair::generate(self.rng.as_mut())?;
        let step1 = EcdhKeypair::generate(self.rng.as_mut())?;
        let rre0 = step0.public_x();
        let rre1 = step1.public_x();
        server.local_ratchet_step0 = Some(step0);
        server.local_ratchet_step1 = Some(step1);

        // nonce(16) | root ecdh(32) | [ echo(16) | identity(32) | rre0(32) |
        // rre1(32) | padding | signature(64) ] | mac(12)
        let mac_offset = output.len() - MAC_SIZE;
        let sig_offset = mac_offset - SIGNATURE_SIZE;
        let payload_offset = 48;
        output[..16].copy_from_slice(&server.next_initialization_nonce);
        output[16..48].copy_from_slice(&root_pre_ecdh.public_x());
        output[48..64].copy_from_slice(init_nonce);
        output[64..96].copy_from_slice(&identity.public_x());
        output[96..128].copy_from_slice(&rre0);
        output[128..160].copy_from_slice(&rre1);
        output[160..sig_offset].fill(0);

        message::sign_frame(identity, &mut output[..mac_offset])?;

        let nonce_iv = server.next_initialization_nonce;
        message::crypt(&root_pre_key, &nonce_iv, &mut output[payload_offset..mac_offset])?;
        let header_iv: [u8; 16] = output[mac_offset - 16..mac_offset].try_into().unwrap();
        message::crypt(&self.config.application_key, &header_iv, &mut output[..payload_offset])?;
        let mac_iv: [u8; 16] = output[..16].try_into().unwrap();
        message::compute_mac(output, &self.config.application_key, &mac_iv)?;
        Ok(())
    }

    /// Round 2, client: authenticate the response, adopt the server's nonce,
    /// and install the initial two ratchet steps.
    fn receive_initialization_response(&mut self, data: &mut [u8], amount: usize) -> Result<()> {
        if amount < INIT_RESPONSE_SIZE {
            return Err(SessionError::InvalidSize("the init response is too small"));
        }

        let mac_offset = amount - MAC_SIZE;
        let payload_offset = 48;
        let header_iv: [u8; 16] = data[mac_offset - 16..mac_offset].try_into().unwrap();
        message::crypt(&self.config.application_key, &header_iv, &mut data[..payload_offset])?;

        let InitState::Client(Some(client)) = &mut self.init else {
            return Err(SessionError::InvalidOp("client initialization state is missing"));
        };
        let local = client
            .local_ecdh_for_init
            .as_ref()
            .ok_or(SessionError::InvalidOp("no local key agreement for initialization"))?;

        let remote_root_public: [u8; 32] = data[16..48].try_into().unwrap();
        let mut shared = local.derive(&remote_root_public)?;
        let root_pre_key = sha::digest(&shared);
        shared.zeroize();

        let nonce_iv: [u8; 16] = data[..16].try_into().unwrap();
        message::crypt(&root_pre_key, &nonce_iv, &mut data[payload_offset..mac_offset])?;

        if data[48..64] != client.initialization_nonce {
            return Err(SessionError::InvalidOp(
                "the echoed initialization nonce did not match the one sent earlier",
            ));
        }
        let server_public: [u8; 32] = data[64..96].try_into().unwrap();
        if !message::verify_frame(&data[..mac_offset], &server_public) {
            return Err(SessionError::InvalidOp("the server signature was invalid"));
        }

        // The server's nonce binds the remaining rounds.
        client.initialization_nonce.copy_from_slice(&data[..16]);
        let server_nonce = client.initialization_nonce;

        let mut derived = [0u8; KEY_SIZE * 3];
        kdf(&root_pre_key, &server_nonce, &mut derived)?;
        let root_key: [u8; 32] = derived[..32].try_into().unwrap();
        let receive_header_key: [u8; 32] = derived[32..64].try_into().unwrap();
        let send_header_key: [u8; 32] = derived[64..96].try_into().unwrap();
        derived.zeroize();

        let local0 = EcdhKeypair::generate(self.rng.as_mut())?;
        let local1 = EcdhKeypair::generate(self.rng.as_mut())?;
        let remote0: [u8; 32] = data[96..128].try_into().unwrap();
        let remote1: [u8; 32] = data[128..160].try_into().unwrap();

        let (first, second) = RatchetStep::initialize_client(
            &root_key,
            &remote0,
            &remote1,
            local0,
            &receive_header_key,
            &send_header_key,
            local1,
        )?;
        self.ratchets.add(first);
        self.ratchets.add(second);
        Ok(())
    }

    /// Round 3, client: an ordinary data message on the second-to-last step,
    /// carrying the server's nonce and this side's ratchet ECDH.
    fn send_first_client_message(&mut self, output: &mut [u8]) -> Result<()> {
        let InitState::Client(Some(client)) = &self.init else {
            return Err(SessionError::InvalidOp("client initialization state is missing"));
        };
        let nonce = client.initialization_nonce;
        let index = self
            .ratchets
            .second_to_last_index(true)
            .ok_or(SessionError::InvalidOp("could not get the second-to-last ratchet step"))?;
        output[..INITIALIZATION_NONCE_SIZE].copy_from_slice(&nonce);
        self.construct_message(output, INITIALIZATION_NONCE_SIZE, true, index)
    }

    /// Round 3, server: the message authenticates under the stored first
    /// receive header key and must echo the nonce; decrypting it installs
    /// the first ratchet step from the carried ECDH.
    fn receive_first_client_message(&mut self, data: &mut [u8], amount: usize) -> Result<()> {
        let (offset, len) = self.deconstruct_message(data, amount, HeaderKeySource::ServerFirst)?;
        let InitState::Server(Some(server)) = &self.init else {
            return Err(SessionError::InvalidOp("server initialization state is missing"));
        };
        if len < INITIALIZATION_NONCE_SIZE
            || data[offset..offset + INITIALIZATION_NONCE_SIZE]
                != server.next_initialization_nonce
        {
            return Err(SessionError::InvalidOp(
                "the nonce received did not match the one sent earlier",
            ));
        }
        Ok(())
    }

    /// Round 4, server: answer on the freshly installed step, echoing the
    /// nonce, without ECDH.
    fn send_first_server_response(&mut self, output: &mut [u8]) -> Result<()> {
        let InitState::Server(Some(server)) = &self.init else {
            return Err(SessionError::InvalidOp("server initialization state is missing"));
        };
        let nonce = server.next_initialization_nonce;
        if self.ratchets.is_empty() {
            return Err(SessionError::InvalidOp("the first ratchet step is not populated"));
        }
        output[..INITIALIZATION_NONCE_SIZE].copy_from_slice(&nonce);
        self.construct_message(output, INITIALIZATION_NONCE_SIZE, false, 0)
    }

    /// Round 4, client: decrypt, require the nonce echo.
    fn receive_first_server_response(
        &mut self,
        data: &mut [u8],
        amount: usize,
        index: usize,
        used_next: bool,
    ) -> Result<()> {
        let (offset, len) =
            self.deconstruct_message(data, amount, HeaderKeySource::Ratchet { index, used_next })?;
        let InitState::Client(Some(client)) = &self.init else {
            return Err(SessionError::InvalidOp("client initialization state is missing"));
        };
        if len < INITIALIZATION_NONCE_SIZE
            || data[offset..offset + INITIALIZATION_NONCE_SIZE] != client.initialization_nonce
        {
            return Err(SessionError::InvalidOp(
                "the nonce received did not match the one sent earlier",
            ));
        }
        Ok(())
    }

    /// Dispatch one handshake message according to role and matched key.
    pub(crate) fn process_initialization(
        &mut self,
        buffer: &mut [u8],
        message_len: usize,
        matched: MacMatch,
    ) -> Result<InitOutcome> {
        match self.config.role {
            Role::Client => match matched {
                MacMatch::Application => {
                    if !self.ratchets.is_empty() {
                        return Err(SessionError::InvalidOp(
                            "received an unexpected or duplicate response from the server",
                        ));
                    }
                    trace!("processing initialization response");
                    self.receive_initialization_response(buffer, message_len)?;
                    self.send_first_client_message(buffer)?;
                    Ok(InitOutcome::SendBack)
                }
                MacMatch::Ratchet { index, used_next } => {
                    trace!("processing first server response");
                    self.receive_first_server_response(buffer, message_len, index, used_next)?;
                    if let InitState::Client(slot) = &mut self.init {
                        *slot = None;
                    }
                    self.initialized = true;
                    debug!("session established");
                    Ok(InitOutcome::Established)
                }
                MacMatch::ServerFirst => Err(SessionError::InvalidOp(
                    "unexpected message received during initialization",
                )),
            },
            Role::Server => match matched {
                MacMatch::Application => {
                    trace!("processing initialization request");
                    let (nonce, remote_ecdh) =
                        self.receive_initialization_request(buffer, message_len)?;
                    self.send_initialization_response(&nonce, &remote_ecdh, buffer)?;
                    self.initialized = false;
                    self.ratchets.clear();
                    Ok(InitOutcome::SendBack)
                }
                MacMatch::ServerFirst => {
                    trace!("processing first client message");
                    self.receive_first_client_message(buffer, message_len)?;
                    self.send_first_server_response(buffer)?;
                    self.initialized = true;
                    debug!("session established");
                    Ok(InitOutcome::SendBack)
                }
                MacMatch::Ratchet { .. } => Err(SessionError::InvalidOp(
                    "unexpected message received during initialization",
                )),
            },
        }
    }
}
