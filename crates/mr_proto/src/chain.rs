//! Symmetric chain
//!
//! Each direction of a ratchet step owns one chain: a 32-byte chain key and
//! a generation counter, advanced through the KDF once per message. For
//! receiving, one earlier (chain key, generation) pair is retained so a
//! message that skipped ahead of its peers stays decryptable:
//!
//! - a wanted generation beyond the current one fast-forwards the chain and,
//!   if the jump left a gap, parks the pre-jump state in the old slot (only
//!   when the slot is empty);
//! - a wanted generation at `old_generation + 1` is served from the old
//!   slot, which then advances with it;
//! - anything at or before `old_generation` is gone for good.

use zeroize::{Zeroize, ZeroizeOnDrop};

use mr_crypto::kdf::kdf;

use crate::error::{Result, SessionError};
use crate::{KEY_SIZE, MSG_KEY_SIZE};

/// Domain constant fed to the KDF on every chain advancement.
pub(crate) const CHAIN_CONTEXT: [u8; 16] = [
    0x7d, 0x93, 0x96, 0x05, 0xf5, 0xb6, 0xd2, 0xe2, 0x65, 0xd0, 0xde, 0xe6, 0xe4, 0x5d, 0x7a,
    0x2c,
];

#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ChainState {
    pub generation: u32,
    pub chain_key: [u8; KEY_SIZE],
    pub old_generation: u32,
    pub old_chain_key: [u8; KEY_SIZE],
}

impl ChainState {
    pub fn new(chain_key: [u8; KEY_SIZE]) -> Self {
        Self { generation: 0, chain_key, old_generation: 0, old_chain_key: [0u8; KEY_SIZE] }
    }

    /// A chain that has never been keyed. A ratchet step created for sending
    /// only carries one of these on the receive side.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.chain_key.iter().all(|&b| b == 0)
    }

    /// Advance the chain one step and return the message key and the new
    /// generation. The advancement is committed before returning: a caller
    /// that fails afterwards must not retry with the same generation.
    pub fn ratchet_for_sending(&mut self) -> Result<([u8; MSG_KEY_SIZE], u32)> {
        let mut derived = [0u8; KEY_SIZE + MSG_KEY_SIZE];
        kdf(&self.chain_key, &CHAIN_CONTEXT, &mut derived)?;
        self.chain_key.copy_from_slice(&derived[..KEY_SIZE]);
        let mut key = [0u8; MSG_KEY_SIZE];
        key.copy_from_slice(&derived[KEY_SIZE..]);
        derived.zeroize();
        self.generation += 1;
        Ok((key, self.generation))
    }

    /// Derive the message key for `generation`, advancing from whichever of
    /// the current or old chain key can still reach it.
    pub fn ratchet_for_receiving(&mut self, generation: u32) -> Result<[u8; MSG_KEY_SIZE]> {
        let old_is_empty = self.old_chain_key.iter().all(|&b| b == 0);

        let (mut gen, start) = if generation > self.generation {
            (self.generation, self.chain_key)
        } else if generation > self.old_generation && !old_is_empty {
            (self.old_generation, self.old_chain_key)
        } else {
            return Err(SessionError::NotFound("the requested chain key has been lost"));
        };

        let must_skip = generation > self.generation && generation - self.generation > 1;
        let increment_old = generation <= self.generation
            && generation > self.old_generation
            && !old_is_empty
            && generation == self.old_generation + 1;

        let mut chain = start;
        let mut derived = [0u8; KEY_SIZE + MSG_KEY_SIZE];
        while gen < generation {
            kdf(&chain, &CHAIN_CONTEXT, &mut derived)?;
            chain.copy_from_slice(&derived[..KEY_SIZE]);
            gen += 1;
        }
        let mut key = [0u8; MSG_KEY_SIZE];
        key.copy_from_slice(&derived[KEY_SIZE..]);

        // A gapped forward jump parks the pre-jump state in the old slot.
        if must_skip && old_is_empty {
            self.old_chain_key = self.chain_key;
            self.old_generation = self.generation;
        }
        // Consuming exactly the next old-chain message advances the window.
        if increment_old {
            self.old_chain_key = chain;
            self.old_generation += 1;
        }
        if generation > self.generation {
            self.chain_key = chain;
            self.generation = generation;
        }

        chain.zeroize();
        derived.zeroize();
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender_and_receiver() -> (ChainState, ChainState) {
        let key = [0x21u8; KEY_SIZE];
        (ChainState::new(key), ChainState::new(key))
    }

    #[test]
    fn sender_receiver_symmetry() {
        let (mut tx, mut rx) = sender_and_receiver();
        for _ in 0..7 {
            let (tx_key, gen) = tx.ratchet_for_sending().unwrap();
            let rx_key = rx.ratchet_for_receiving(gen).unwrap();
            assert_eq!(tx_key, rx_key);
        }
    }

    #[test]
    fn receive_path_is_independent_of_order() {
        // Jumping straight to generation b yields the same key as stopping
        // at a first, for every a <= b that stays reachable.
        let (mut tx, rx) = sender_and_receiver();
        let mut keys = vec![];
        for _ in 0..6 {
            keys.push(tx.ratchet_for_sending().unwrap());
        }

        let mut direct = rx.clone();
        let key_at_5 = direct.ratchet_for_receiving(5).unwrap();
        assert_eq!(key_at_5, keys[4].0);

        let mut stepped = rx.clone();
        assert_eq!(stepped.ratchet_for_receiving(2).unwrap(), keys[1].0);
        assert_eq!(stepped.ratchet_for_receiving(5).unwrap(), keys[4].0);
    }

    #[test]
    fn forward_jump_parks_the_old_window() {
        let (mut tx, mut rx) = sender_and_receiver();
        let mut keys = vec![];
        for _ in 0..4 {
            keys.push(tx.ratchet_for_sending().unwrap());
        }

        assert_eq!(rx.ratchet_for_receiving(1).unwrap(), keys[0].0);
        assert_eq!(rx.old_generation, 0);

        // 1 -> 3 skips generation 2; the old slot holds the gen-1 state.
        assert_eq!(rx.ratchet_for_receiving(3).unwrap(), keys[2].0);
        assert_eq!(rx.generation, 3);
        assert_eq!(rx.old_generation, 1);

        // Generation 2 is served from the old chain, which advances with it.
        assert_eq!(rx.ratchet_for_receiving(2).unwrap(), keys[1].0);
        assert_eq!(rx.old_generation, 2);
    }

    #[test]
    fn consumed_window_is_gone() {
        let (mut tx, mut rx) = sender_and_receiver();
        let mut keys = vec![];
        for _ in 0..4 {
            keys.push(tx.ratchet_for_sending().unwrap());
        }
        rx.ratchet_for_receiving(1).unwrap();
        rx.ratchet_for_receiving(3).unwrap();
        rx.ratchet_for_receiving(2).unwrap();

        // Replaying generation 2 after the old window moved past it fails.
        assert!(matches!(
            rx.ratchet_for_receiving(2),
            Err(SessionError::NotFound(_))
        ));
        // And generation 1 was consumed by the main chain long ago.
        assert!(matches!(
            rx.ratchet_for_receiving(1),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn only_the_first_gap_is_recorded() {
        let (mut tx, mut rx) = sender_and_receiver();
        for _ in 0..8 {
            tx.ratchet_for_sending().unwrap();
        }
        rx.ratchet_for_receiving(1).unwrap();
        rx.ratchet_for_receiving(3).unwrap();
        assert_eq!(rx.old_generation, 1);
        // A second gapped jump leaves the occupied old slot untouched.
        rx.ratchet_for_receiving(6).unwrap();
        assert_eq!(rx.old_generation, 1);
        assert_eq!(rx.generation, 6);
    }

    #[test]
    fn an_unkeyed_chain_serves_nothing() {
        let mut chain = ChainState::empty();
        assert!(chain.is_empty());
        assert!(chain.ratchet_for_receiving(0).is_err());
    }
}
