//! Ratchet steps
//!
//! A ratchet step is one rung of the DH ladder: the local ephemeral that
//! produced it, the root key for the next rung, header keys for both
//! directions (current and next), and the two symmetric chains. Steps live
//! in a bounded newest-first list; older steps stay around so frames still
//! in flight on their receive chains keep decrypting, until they age out.
//!
//! Key derivation for a step runs the same way on both ends (the "server"
//! shape): shared secret from the previous local key and the remote public,
//! hashed, expanded against the root key for the receiving side; then the
//! same again with the step's own key for the sending side. A client
//! bootstrapping from the handshake builds a send-only step first and feeds
//! its output straight into a full second step.

use zeroize::{Zeroize, ZeroizeOnDrop};

use mr_crypto::ecdh::EcdhKeypair;
use mr_crypto::kdf::kdf;
use mr_crypto::sha;

use crate::chain::ChainState;
use crate::error::{Result, SessionError};
use crate::{KEY_SIZE, MAX_RATCHETS};

#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RatchetStep {
    /// Local ephemeral; absent once a newer step has ratcheted past this one.
    pub(crate) ecdh_key: Option<EcdhKeypair>,
    pub(crate) next_root_key: [u8; KEY_SIZE],
    pub(crate) send_header_key: [u8; KEY_SIZE],
    pub(crate) next_send_header_key: [u8; KEY_SIZE],
    pub(crate) receive_header_key: [u8; KEY_SIZE],
    pub(crate) next_receive_header_key: [u8; KEY_SIZE],
    pub(crate) sending_chain: ChainState,
    pub(crate) receiving_chain: ChainState,
}

impl RatchetStep {
    /// Derive a full step the way a responder does: the receiving chain from
    /// the previous local key, the sending chain from this step's own key.
    pub(crate) fn initialize_server(
        previous: &EcdhKeypair,
        root_key: &[u8; KEY_SIZE],
        remote_public: &[u8; 32],
        keypair: EcdhKeypair,
        receive_header_key: Option<&[u8; KEY_SIZE]>,
        send_header_key: Option<&[u8; KEY_SIZE]>,
    ) -> Result<Self> {
        let mut step = RatchetStep::default();
        if let Some(key) = receive_header_key {
            step.receive_header_key = *key;
        }
        if let Some(key) = send_header_key {
            step.send_header_key = *key;
        }

        // Receiving chain: ECDH(previous, remote) mixed with the root key.
        let mut shared = previous.derive(remote_public)?;
        let mut kdf_key = sha::digest(&shared);
        let mut derived = [0u8; KEY_SIZE * 3];
        kdf(&kdf_key, root_key, &mut derived)?;
        let mut working_root = [0u8; KEY_SIZE];
        working_root.copy_from_slice(&derived[..KEY_SIZE]);
        step.receiving_chain =
            ChainState::new(derived[KEY_SIZE..KEY_SIZE * 2].try_into().unwrap());
        step.next_receive_header_key.copy_from_slice(&derived[KEY_SIZE * 2..]);

        // Sending chain: ECDH(own, remote) mixed with the new root.
        shared = keypair.derive(remote_public)?;
        kdf_key = sha::digest(&shared);
        kdf(&kdf_key, &working_root, &mut derived)?;
        step.next_root_key.copy_from_slice(&derived[..KEY_SIZE]);
        step.sending_chain = ChainState::new(derived[KEY_SIZE..KEY_SIZE * 2].try_into().unwrap());
        step.next_send_header_key.copy_from_slice(&derived[KEY_SIZE * 2..]);

        step.ecdh_key = Some(keypair);

        shared.zeroize();
        kdf_key.zeroize();
        derived.zeroize();
        working_root.zeroize();
        Ok(step)
    }

    /// Build the client's initial pair of steps from the handshake output:
    /// a send-only first step against the server's first ratchet ephemeral,
    /// and a full second step chained off its derived root.
    pub(crate) fn initialize_client(
        root_key: &[u8; KEY_SIZE],
        remote_public0: &[u8; 32],
        remote_public1: &[u8; 32],
        keypair: EcdhKeypair,
        receive_header_key: &[u8; KEY_SIZE],
        send_header_key: &[u8; KEY_SIZE],
        next_keypair: EcdhKeypair,
    ) -> Result<(Self, Self)> {
        let mut shared = keypair.derive(remote_public0)?;
        let mut kdf_key = sha::digest(&shared);
        let mut derived = [0u8; KEY_SIZE * 3];
        kdf(&kdf_key, root_key, &mut derived)?;

        let next_root: [u8; KEY_SIZE] = derived[..KEY_SIZE].try_into().unwrap();
        let next_send_header_key: [u8; KEY_SIZE] = derived[KEY_SIZE * 2..].try_into().unwrap();

        let second = RatchetStep::initialize_server(
            &keypair,
            &next_root,
            remote_public1,
            next_keypair,
            Some(receive_header_key),
            Some(&next_send_header_key),
        )?;

        let mut first = RatchetStep::default();
        first.send_header_key = *send_header_key;
        first.sending_chain = ChainState::new(derived[KEY_SIZE..KEY_SIZE * 2].try_into().unwrap());
        first.ecdh_key = Some(keypair);

        shared.zeroize();
        kdf_key.zeroize();
        derived.zeroize();
        Ok((first, second))
    }

    /// DH-ratchet off this step: derive the successor from the next root and
    /// header keys, then retire the material that produced it. The step
    /// itself stays alive for frames still in flight on its receive chain.
    pub(crate) fn ratchet(
        &mut self,
        remote_public: &[u8; 32],
        keypair: EcdhKeypair,
    ) -> Result<Self> {
        let previous = self
            .ecdh_key
            .as_ref()
            .ok_or(SessionError::InvalidOp("the ratchet step has already been ratcheted"))?;
        let next = RatchetStep::initialize_server(
            previous,
            &self.next_root_key,
            remote_public,
            keypair,
            Some(&self.next_receive_header_key),
            Some(&self.next_send_header_key),
        )?;
        self.ecdh_key = None;
        self.next_root_key.zeroize();
        self.next_receive_header_key.zeroize();
        self.next_send_header_key.zeroize();
        Ok(next)
    }
}

/// Newest-first list of ratchet steps, bounded at [`MAX_RATCHETS`].
#[derive(Default, PartialEq, Eq)]
pub struct RatchetList {
    steps: Vec<RatchetStep>,
}

impl RatchetList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend a step, evicting the oldest beyond the bound.
    pub fn add(&mut self, step: RatchetStep) {
        self.steps.insert(0, step);
        self.steps.truncate(MAX_RATCHETS);
    }

    /// Append a step, preserving stored order. Used when reloading state,
    /// which records steps newest first already.
    pub(crate) fn push_oldest(&mut self, step: RatchetStep) {
        self.steps.push(step);
    }

    /// The newest step.
    pub fn last(&self) -> Option<&RatchetStep> {
        self.steps.first()
    }

    /// The step to send on when the frame has no room to announce a fresh
    /// ECDH key. One special case: a server that just finished the handshake
    /// holds a single step whose key the client already knows, so that step
    /// may be used directly.
    pub fn second_to_last_index(&self, is_client: bool) -> Option<usize> {
        match self.steps.len() {
            0 => None,
            1 if !is_client => Some(0),
            1 => None,
            _ => Some(1),
        }
    }

    pub fn get(&self, index: usize) -> Option<&RatchetStep> {
        self.steps.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut RatchetStep> {
        self.steps.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RatchetStep> {
        self.steps.iter()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn clear(&mut self) {
        self.steps.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mr_crypto::error::CryptoError;
    use mr_crypto::rng::SecureRng;

    struct TestRng(u64);

    impl SecureRng for TestRng {
        fn fill(&mut self, dest: &mut [u8]) -> core::result::Result<(), CryptoError> {
            for b in dest {
                self.0 ^= self.0 << 13;
                self.0 ^= self.0 >> 7;
                self.0 ^= self.0 << 17;
                *b = self.0 as u8;
            }
            Ok(())
        }
    }

    fn keypair(rng: &mut TestRng) -> EcdhKeypair {
        EcdhKeypair::generate(rng).unwrap()
    }

    #[test]
    fn client_and_server_steps_mirror_each_other() {
        let mut rng = TestRng(0x42);
        let root = [7u8; KEY_SIZE];
        let recv_hk = [1u8; KEY_SIZE];
        let send_hk = [2u8; KEY_SIZE];

        // Client side: local ephemerals L0, L1 against remote R0, R1.
        let l0 = keypair(&mut rng);
        let l1 = keypair(&mut rng);
        let r0 = keypair(&mut rng);
        let r1 = keypair(&mut rng);

        let (first, second) = RatchetStep::initialize_client(
            &root,
            &r0.public_x(),
            &r1.public_x(),
            l0.clone(),
            &recv_hk,
            &send_hk,
            l1,
        )
        .unwrap();

        // Server side: previous R0, own key R1, same root, remote L0.
        let server = RatchetStep::initialize_server(
            &r0,
            &root,
            &l0.public_x(),
            r1,
            Some(&send_hk), // the client's send header key is what it receives under
            Some(&recv_hk),
        )
        .unwrap();

        // The client's send-only chain is the server's receiving chain.
        assert_eq!(first.sending_chain.chain_key, server.receiving_chain.chain_key);
        // The server's sending chain is the client's second-step receive chain.
        assert_eq!(server.sending_chain.chain_key, second.receiving_chain.chain_key);
        // Next header keys line up across the two directions.
        assert_eq!(server.next_receive_header_key, second.send_header_key);
        assert_eq!(server.next_send_header_key, second.next_receive_header_key);
    }

    #[test]
    fn ratcheting_retires_the_source_step() {
        let mut rng = TestRng(0x43);
        let a0 = keypair(&mut rng);
        let a1 = keypair(&mut rng);
        let b = keypair(&mut rng);
        let root = [9u8; KEY_SIZE];

        let mut step = RatchetStep::initialize_server(
            &a0,
            &root,
            &b.public_x(),
            a1,
            Some(&[3u8; KEY_SIZE]),
            Some(&[4u8; KEY_SIZE]),
        )
        .unwrap();

        let fresh = keypair(&mut rng);
        let next = step.ratchet(&b.public_x(), fresh).unwrap();
        assert!(step.ecdh_key.is_none());
        assert_eq!(step.next_root_key, [0u8; KEY_SIZE]);
        assert_eq!(step.next_send_header_key, [0u8; KEY_SIZE]);
        assert_eq!(step.next_receive_header_key, [0u8; KEY_SIZE]);
        assert!(next.ecdh_key.is_some());

        // A second ratchet off the retired step is refused.
        let fresh = keypair(&mut rng);
        assert!(step.ratchet(&b.public_x(), fresh).is_err());
    }

    #[test]
    fn list_is_newest_first_and_bounded() {
        let mut list = RatchetList::new();
        for i in 0..(MAX_RATCHETS + 2) {
            let mut step = RatchetStep::default();
            step.sending_chain.generation = i as u32;
            list.add(step);
        }
        assert_eq!(list.len(), MAX_RATCHETS);
        assert_eq!(list.last().unwrap().sending_chain.generation, (MAX_RATCHETS + 1) as u32);
        // The oldest surviving entry is the one added MAX_RATCHETS ago.
        assert_eq!(
            list.get(MAX_RATCHETS - 1).unwrap().sending_chain.generation,
            2
        );
    }

    #[test]
    fn second_to_last_selection() {
        let mut list = RatchetList::new();
        assert_eq!(list.second_to_last_index(true), None);
        assert_eq!(list.second_to_last_index(false), None);

        list.add(RatchetStep::default());
        // A client never sends on its only step without announcing it...
        assert_eq!(list.second_to_last_index(true), None);
        // ...but a freshly initialized server may.
        assert_eq!(list.second_to_last_index(false), Some(0));

        list.add(RatchetStep::default());
        assert_eq!(list.second_to_last_index(true), Some(1));
        assert_eq!(list.second_to_last_index(false), Some(1));
    }
}
