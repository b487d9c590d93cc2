//! Session persistence
//!
//! A 32-bit little-endian header carries the storage version in the high
//! byte, the ratchet count in the next byte, and presence bits for the
//! handshake state in the low bits; tagged fields follow in a fixed order,
//! then one record per ratchet step with its own presence-bit header.
//! Nothing optional is ever written as zeroes: absence is a cleared bit.
//!
//! ECDH keys are stored as their 32-byte secret scalar; the public half is
//! recomputed on load. Loading ignores unexpected trailing bytes, fails
//! `InvalidSize` on truncation and `InvalidOp` on a scalar that does not
//! reconstruct.

use mr_crypto::ecdh::EcdhKeypair;
use tracing::trace;

use crate::chain::ChainState;
use crate::error::{Result, SessionError};
use crate::ratchet::{RatchetList, RatchetStep};
use crate::session::{ClientInit, InitState, Role, ServerInit, Session};
use crate::{INITIALIZATION_NONCE_SIZE, KEY_SIZE};

const STORAGE_VERSION: u8 = 1;

// Main header bits.
const HAS_INIT: u32 = 1 << 0;
// Client handshake state.
const HAS_CLIENT: u32 = 1 << 2;
const HAS_INITIALIZATION_NONCE: u32 = 1 << 3;
const HAS_LOCAL_ECDH: u32 = 1 << 4;
// Server handshake state.
const HAS_SERVER: u32 = 1 << 2;
const HAS_NEXT_INITIALIZATION_NONCE: u32 = 1 << 3;
const HAS_ROOT_KEY: u32 = 1 << 4;
const HAS_FIRST_SEND_HEADER_KEY: u32 = 1 << 5;
const HAS_FIRST_RECEIVE_HEADER_KEY: u32 = 1 << 6;
const HAS_LOCAL_STEP0: u32 = 1 << 7;
const HAS_LOCAL_STEP1: u32 = 1 << 8;
const HAS_CLIENT_PUBLIC: u32 = 1 << 9;

// Ratchet record bits. Bit 0 is reserved.
const R_HAS_ECDH: u32 = 1 << 1;
const R_HAS_NEXT_ROOT_KEY: u32 = 1 << 2;
const R_HAS_SEND_HEADER_KEY: u32 = 1 << 3;
const R_HAS_NEXT_SEND_HEADER_KEY: u32 = 1 << 4;
const R_HAS_RECEIVE_HEADER_KEY: u32 = 1 << 5;
const R_HAS_NEXT_RECEIVE_HEADER_KEY: u32 = 1 << 6;
const R_HAS_SENDING_CHAIN: u32 = 1 << 7;
const R_HAS_SENDING_CHAIN_OLD: u32 = 1 << 8;
const R_HAS_RECEIVING_CHAIN: u32 = 1 << 9;
const R_HAS_RECEIVING_CHAIN_OLD: u32 = 1 << 10;

const ECDH_STORED_SIZE: usize = 32;
const ZERO_KEY: [u8; KEY_SIZE] = [0u8; KEY_SIZE];

fn nonzero(bytes: &[u8]) -> bool {
    bytes.iter().any(|&b| b != 0)
}

// ── Cursors ──────────────────────────────────────────────────────────────

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn bytes(&mut self, data: &[u8]) -> Result<()> {
        if self.buf.len() - self.pos < data.len() {
            return Err(SessionError::InvalidSize("the state buffer is too small"));
        }
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
        Ok(())
    }

    fn u32_le(&mut self, value: u32) -> Result<()> {
        self.bytes(&value.to_le_bytes())
    }

    fn ecdh(&mut self, keypair: &EcdhKeypair) -> Result<()> {
        self.bytes(keypair.scalar_bytes())
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, amount: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < amount {
            return Err(SessionError::InvalidSize("the stored state is truncated"));
        }
        let out = &self.buf[self.pos..self.pos + amount];
        self.pos += amount;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        Ok(self.bytes(N)?.try_into().unwrap())
    }

    fn u32_le(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn ecdh(&mut self) -> Result<EcdhKeypair> {
        let scalar: [u8; ECDH_STORED_SIZE] = self.array()?;
        EcdhKeypair::from_scalar_bytes(&scalar)
            .map_err(|_| SessionError::InvalidOp("a stored key did not reconstruct"))
    }
}

// ── Per-record helpers ───────────────────────────────────────────────────

fn ratchet_flags(step: &RatchetStep) -> u32 {
    let mut flags = 0;
    if step.ecdh_key.is_some() {
        flags |= R_HAS_ECDH;
    }
    if nonzero(&step.next_root_key) {
        flags |= R_HAS_NEXT_ROOT_KEY;
    }
    if nonzero(&step.send_header_key) {
        flags |= R_HAS_SEND_HEADER_KEY;
    }
    if nonzero(&step.next_send_header_key) {
        flags |= R_HAS_NEXT_SEND_HEADER_KEY;
    }
    if nonzero(&step.receive_header_key) {
        flags |= R_HAS_RECEIVE_HEADER_KEY;
    }
    if nonzero(&step.next_receive_header_key) {
        flags |= R_HAS_NEXT_RECEIVE_HEADER_KEY;
    }
    if nonzero(&step.sending_chain.chain_key) {
        flags |= R_HAS_SENDING_CHAIN;
        if nonzero(&step.sending_chain.old_chain_key) {
            flags |= R_HAS_SENDING_CHAIN_OLD;
        }
    }
    if nonzero(&step.receiving_chain.chain_key) {
        flags |= R_HAS_RECEIVING_CHAIN;
        if nonzero(&step.receiving_chain.old_chain_key) {
            flags |= R_HAS_RECEIVING_CHAIN_OLD;
        }
    }
    flags
}

fn ratchet_size(step: &RatchetStep) -> usize {
    let flags = ratchet_flags(step);
    let mut size = 4;
    if flags & R_HAS_ECDH != 0 {
        size += ECDH_STORED_SIZE;
    }
    for bit in [
        R_HAS_NEXT_ROOT_KEY,
        R_HAS_SEND_HEADER_KEY,
        R_HAS_NEXT_SEND_HEADER_KEY,
        R_HAS_RECEIVE_HEADER_KEY,
        R_HAS_NEXT_RECEIVE_HEADER_KEY,
    ] {
        if flags & bit != 0 {
            size += KEY_SIZE;
        }
    }
    for bit in [
        R_HAS_SENDING_CHAIN,
        R_HAS_SENDING_CHAIN_OLD,
        R_HAS_RECEIVING_CHAIN,
        R_HAS_RECEIVING_CHAIN_OLD,
    ] {
        if flags & bit != 0 {
            size += 4 + KEY_SIZE;
        }
    }
    size
}

fn write_ratchet(w: &mut Writer<'_>, step: &RatchetStep) -> Result<()> {
    let flags = ratchet_flags(step);
    w.u32_le(flags)?;
    if let Some(keypair) = &step.ecdh_key {
        w.ecdh(keypair)?;
    }
    if flags & R_HAS_NEXT_ROOT_KEY != 0 {
        w.bytes(&step.next_root_key)?;
    }
    if flags & R_HAS_SEND_HEADER_KEY != 0 {
        w.bytes(&step.send_header_key)?;
    }
    if flags & R_HAS_NEXT_SEND_HEADER_KEY != 0 {
        w.bytes(&step.next_send_header_key)?;
    }
    if flags & R_HAS_RECEIVE_HEADER_KEY != 0 {
        w.bytes(&step.receive_header_key)?;
    }
    if flags & R_HAS_NEXT_RECEIVE_HEADER_KEY != 0 {
        w.bytes(&step.next_receive_header_key)?;
    }
    if flags & R_HAS_SENDING_CHAIN != 0 {
        w.u32_le(step.sending_chain.generation)?;
        w.bytes(&step.sending_chain.chain_key)?;
        if flags & R_HAS_SENDING_CHAIN_OLD != 0 {
            w.u32_le(step.sending_chain.old_generation)?;
            w.bytes(&step.sending_chain.old_chain_key)?;
        }
    }
    if flags & R_HAS_RECEIVING_CHAIN != 0 {
        w.u32_le(step.receiving_chain.generation)?;
        w.bytes(&step.receiving_chain.chain_key)?;
        if flags & R_HAS_RECEIVING_CHAIN_OLD != 0 {
            w.u32_le(step.receiving_chain.old_generation)?;
            w.bytes(&step.receiving_chain.old_chain_key)?;
        }
    }
    Ok(())
}

fn read_ratchet(r: &mut Reader<'_>) -> Result<RatchetStep> {
    let flags = r.u32_le()?;
    let mut step = RatchetStep::default();
    if flags & R_HAS_ECDH != 0 {
        step.ecdh_key = Some(r.ecdh()?);
    }
    if flags & R_HAS_NEXT_ROOT_KEY != 0 {
        step.next_root_key = r.array()?;
    }
    if flags & R_HAS_SEND_HEADER_KEY != 0 {
        step.send_header_key = r.array()?;
    }
    if flags & R_HAS_NEXT_SEND_HEADER_KEY != 0 {
        step.next_send_header_key = r.array()?;
    }
    if flags & R_HAS_RECEIVE_HEADER_KEY != 0 {
        step.receive_header_key = r.array()?;
    }
    if flags & R_HAS_NEXT_RECEIVE_HEADER_KEY != 0 {
        step.next_receive_header_key = r.array()?;
    }
    if flags & R_HAS_SENDING_CHAIN != 0 {
        let mut chain = ChainState::default();
        chain.generation = r.u32_le()?;
        chain.chain_key = r.array()?;
        if flags & R_HAS_SENDING_CHAIN_OLD != 0 {
            chain.old_generation = r.u32_le()?;
            chain.old_chain_key = r.array()?;
        }
        step.sending_chain = chain;
    }
    if flags & R_HAS_RECEIVING_CHAIN != 0 {
        let mut chain = ChainState::default();
        chain.generation = r.u32_le()?;
        chain.chain_key = r.array()?;
        if flags & R_HAS_RECEIVING_CHAIN_OLD != 0 {
            chain.old_generation = r.u32_le()?;
            chain.old_chain_key = r.array()?;
        }
        step.receiving_chain = chain;
    }
    Ok(step)
}

// ── Session entry points ─────────────────────────────────────────────────

impl Session {
    fn main_flags(&self) -> u32 {
        let mut flags =
            ((STORAGE_VERSION as u32) << 24) | ((self.ratchets.len() as u32 & 0xff) << 16);
        if self.initialized {
            return flags;
        }
        flags |= HAS_INIT;
        match &self.init {
            InitState::Client(Some(client)) => {
                flags |= HAS_CLIENT;
                if nonzero(&client.initialization_nonce) {
                    flags |= HAS_INITIALIZATION_NONCE;
                }
                if client.local_ecdh_for_init.is_some() {
                    flags |= HAS_LOCAL_ECDH;
                }
            }
            InitState::Server(Some(server)) => {
                flags |= HAS_SERVER;
                if nonzero(&server.next_initialization_nonce) {
                    flags |= HAS_NEXT_INITIALIZATION_NONCE;
                }
                if nonzero(&server.root_key) {
                    flags |= HAS_ROOT_KEY;
                }
                if nonzero(&server.first_send_header_key) {
                    flags |= HAS_FIRST_SEND_HEADER_KEY;
                }
                if nonzero(&server.first_receive_header_key) {
                    flags |= HAS_FIRST_RECEIVE_HEADER_KEY;
                }
                if server.local_ratchet_step0.is_some() {
                    flags |= HAS_LOCAL_STEP0;
                }
                if server.local_ratchet_step1.is_some() {
                    flags |= HAS_LOCAL_STEP1;
                }
                if nonzero(&server.client_public_key) {
                    flags |= HAS_CLIENT_PUBLIC;
                }
            }
            _ => {}
        }
        flags
    }

    /// Bytes needed by [`Session::state_store`].
    pub fn state_size(&self) -> usize {
        let flags = self.main_flags();
        let mut size = 4;
        if flags & HAS_INIT != 0 {
            match &self.init {
                InitState::Client(Some(_)) => {
                    if flags & HAS_INITIALIZATION_NONCE != 0 {
                        size += INITIALIZATION_NONCE_SIZE;
                    }
                    if flags & HAS_LOCAL_ECDH != 0 {
                        size += ECDH_STORED_SIZE;
                    }
                }
                InitState::Server(Some(_)) => {
                    if flags & HAS_NEXT_INITIALIZATION_NONCE != 0 {
                        size += INITIALIZATION_NONCE_SIZE;
                    }
                    for bit in [HAS_ROOT_KEY, HAS_FIRST_SEND_HEADER_KEY, HAS_FIRST_RECEIVE_HEADER_KEY]
                    {
                        if flags & bit != 0 {
                            size += KEY_SIZE;
                        }
                    }
                    for bit in [HAS_LOCAL_STEP0, HAS_LOCAL_STEP1] {
                        if flags & bit != 0 {
                            size += ECDH_STORED_SIZE;
                        }
                    }
                    if flags & HAS_CLIENT_PUBLIC != 0 {
                        size += 32;
                    }
                }
                _ => {}
            }
        }
        for step in self.ratchets.iter() {
            size += ratchet_size(step);
        }
        size
    }

    /// Serialize the whole session into `output`.
    pub fn state_store(&self, output: &mut [u8]) -> Result<()> {
        let flags = self.main_flags();
        let mut w = Writer { buf: output, pos: 0 };
        w.u32_le(flags)?;

        if flags & HAS_INIT != 0 {
            match &self.init {
                InitState::Client(Some(client)) => {
                    if flags & HAS_INITIALIZATION_NONCE != 0 {
                        w.bytes(&client.initialization_nonce)?;
                    }
                    if let Some(keypair) = &client.local_ecdh_for_init {
                        w.ecdh(keypair)?;
                    }
                }
                InitState::Server(Some(server)) => {
                    if flags & HAS_NEXT_INITIALIZATION_NONCE != 0 {
                        w.bytes(&server.next_initialization_nonce)?;
                    }
                    if flags & HAS_ROOT_KEY != 0 {
                        w.bytes(&server.root_key)?;
                    }
                    if flags & HAS_FIRST_SEND_HEADER_KEY != 0 {
                        w.bytes(&server.first_send_header_key)?;
                    }
                    if flags & HAS_FIRST_RECEIVE_HEADER_KEY != 0 {
                        w.bytes(&server.first_receive_header_key)?;
                    }
                    if let Some(keypair) = &server.local_ratchet_step0 {
                        w.ecdh(keypair)?;
                    }
                    if let Some(keypair) = &server.local_ratchet_step1 {
                        w.ecdh(keypair)?;
                    }
                    if flags & HAS_CLIENT_PUBLIC != 0 {
                        w.bytes(&server.client_public_key)?;
                    }
                }
                _ => {}
            }
        }

        for step in self.ratchets.iter() {
            write_ratchet(&mut w, step)?;
        }
        trace!(bytes = w.pos, "stored session state");
        Ok(())
    }

    /// Rebuild the session from stored bytes, replacing all handshake and
    /// ratchet state. Returns how many bytes were consumed; trailing bytes
    /// are ignored.
    pub fn state_load(&mut self, data: &[u8]) -> Result<usize> {
        let mut r = Reader { buf: data, pos: 0 };
        let flags = r.u32_le()?;
        if (flags >> 24) as u8 != STORAGE_VERSION {
            return Err(SessionError::InvalidOp("unsupported storage version"));
        }

        if flags & HAS_INIT != 0 {
            self.initialized = false;
            match self.config.role {
                Role::Client => {
                    if flags & HAS_CLIENT != 0 {
                        let mut client = ClientInit::default();
                        if flags & HAS_INITIALIZATION_NONCE != 0 {
                            client.initialization_nonce = r.array()?;
                        }
                        if flags & HAS_LOCAL_ECDH != 0 {
                            client.local_ecdh_for_init = Some(r.ecdh()?);
                        }
                        self.init = InitState::Client(Some(Box::new(client)));
                    } else {
                        self.init = InitState::Client(None);
                    }
                }
                Role::Server => {
                    if flags & HAS_SERVER != 0 {
                        let mut server = ServerInit::default();
                        if flags & HAS_NEXT_INITIALIZATION_NONCE != 0 {
                            server.next_initialization_nonce = r.array()?;
                        }
                        if flags & HAS_ROOT_KEY != 0 {
                            server.root_key = r.array()?;
                        }
                        if flags & HAS_FIRST_SEND_HEADER_KEY != 0 {
                            server.first_send_header_key = r.array()?;
                        }
                        if flags & HAS_FIRST_RECEIVE_HEADER_KEY != 0 {
                            server.first_receive_header_key = r.array()?;
                        }
                        if flags & HAS_LOCAL_STEP0 != 0 {
                            server.local_ratchet_step0 = Some(r.ecdh()?);
                        }
                        if flags & HAS_LOCAL_STEP1 != 0 {
                            server.local_ratchet_step1 = Some(r.ecdh()?);
                        }
                        if flags & HAS_CLIENT_PUBLIC != 0 {
                            server.client_public_key = r.array()?;
                        }
                        self.init = InitState::Server(Some(Box::new(server)));
                    } else {
                        self.init = InitState::Server(None);
                    }
                }
            }
        } else {
            self.initialized = true;
            self.init = match self.config.role {
                Role::Client => InitState::Client(None),
                Role::Server => InitState::Server(None),
            };
        }

        self.ratchets = RatchetList::new();
        let count = (flags >> 16) & 0xff;
        for _ in 0..count {
            let step = read_ratchet(&mut r)?;
            self.ratchets.push_oldest(step);
        }

        trace!(bytes = r.pos, "loaded session state");
        Ok(r.pos)
    }
}

/// Persistence equivalence: everything `state_store` captures. The identity
/// and entropy source are deliberately outside the relation.
impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.config.role == other.config.role
            && self.initialized == other.initialized
            && self.init == other.init
            && self.ratchets == other.ratchets
    }
}
