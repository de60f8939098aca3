//! Key-slot table for token verification keys
//!
//! A fixed table of slots, each holding one verification key. Slot 0 is the
//! device identity key and is the one every container token is checked
//! against.

use ed25519_dalek::VerifyingKey;

use crate::error::{SealError, SealResult};

/// Number of key slots on the device.
pub const KEY_SLOTS: usize = 3;

/// Slot holding the device identity key.
pub const DEVICE_KEY_SLOT: usize = 0;

/// A verification key held in a slot.
#[derive(Debug, Clone)]
pub enum Key {
    /// Ed25519 public key for COSE_Sign1 tokens
    Ed25519(VerifyingKey),
    /// Shared secret for COSE_Mac0 tokens
    HmacSha256(Vec<u8>),
}

/// The device key-slot table.
#[derive(Debug, Default)]
pub struct KeyStore {
    slots: [Option<Key>; KEY_SLOTS],
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a key into a slot, replacing any previous occupant.
    pub fn install(&mut self, slot: usize, key: Key) -> SealResult<()> {
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or(SealError::KeySlotOutOfRange(slot))?;
        *entry = Some(key);
        Ok(())
    }

    /// Remove the key in a slot.
    pub fn remove(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = None;
        }
    }

    pub fn get(&self, slot: usize) -> Option<&Key> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// The device identity key, if provisioned.
    pub fn device_key(&self) -> SealResult<&Key> {
        self.get(DEVICE_KEY_SLOT)
            .ok_or(SealError::NoSuchKey(DEVICE_KEY_SLOT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_and_lookup() {
        let mut store = KeyStore::new();
        assert!(store.device_key().is_err());

        store
            .install(DEVICE_KEY_SLOT, Key::HmacSha256(vec![7u8; 32]))
            .unwrap();
        assert!(store.device_key().is_ok());

        store.remove(DEVICE_KEY_SLOT);
        assert!(store.get(DEVICE_KEY_SLOT).is_none());
    }

    #[test]
    fn out_of_range_slot_is_refused() {
        let mut store = KeyStore::new();
        assert!(matches!(
            store.install(KEY_SLOTS, Key::HmacSha256(vec![0u8; 32])),
            Err(SealError::KeySlotOutOfRange(_))
        ));
    }
}
