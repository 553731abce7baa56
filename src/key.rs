//! AES-128 keys for the five NTAG 424 DNA key slots, and the session keys
//! derived from them during authentication.

use crate::error::{invalid_arg, Error};
use std::fmt::{self, Debug};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key size in bytes. The NTAG 424 DNA only supports AES-128.
pub const SIZE: usize = 16;

/// Number of key slots on the tag
pub const SLOT_COUNT: u8 = 5;

/// A key slot number (`0..=4`). Slot 0 is the application master key;
/// only a session authenticated against slot 0 may change slots 1–4.
pub type KeySlot = u8;

/// Check that a key slot number is within range
pub(crate) fn check_slot(slot: KeySlot) -> Result<(), Error> {
    if slot >= SLOT_COUNT {
        return Err(invalid_arg!(
            "key slot {} out of range (0..={})",
            slot,
            SLOT_COUNT - 1
        ));
    }
    Ok(())
}

/// An AES-128 key: either one of the tag's five stored keys, or a session
/// key derived during EV2 authentication.
///
/// Wiped on drop. `Debug` never prints the key bytes.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Key([u8; SIZE]);

impl Key {
    /// Create a `Key` from the given byte array
    pub fn new(bytes: [u8; SIZE]) -> Self {
        Key(bytes)
    }

    /// Create a `Key` from a slice, returning an error on wrong length
    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        if slice.len() != SIZE {
            return Err(invalid_arg!(
                "expected a {}-byte AES key, got {}",
                SIZE,
                slice.len()
            ));
        }

        let mut bytes = [0u8; SIZE];
        bytes.copy_from_slice(slice);
        Ok(Key(bytes))
    }

    /// Borrow the raw key bytes
    pub(crate) fn as_bytes(&self) -> &[u8; SIZE] {
        &self.0
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never leak key material into logs
        write!(f, "ntag424::Key(...)")
    }
}

impl From<[u8; SIZE]> for Key {
    fn from(bytes: [u8; SIZE]) -> Key {
        Key::new(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert!(Key::from_slice(&[0u8; 15]).is_err());
        assert!(Key::from_slice(&[0u8; 17]).is_err());
        assert!(Key::from_slice(&[0u8; 16]).is_ok());
    }

    #[test]
    fn debug_redacts_key_material() {
        let key = Key::new([0xAB; 16]);
        assert_eq!(format!("{:?}", key), "ntag424::Key(...)");
    }

    #[test]
    fn slot_range() {
        for slot in 0..5 {
            assert!(check_slot(slot).is_ok());
        }
        assert!(check_slot(5).is_err());
    }
}
