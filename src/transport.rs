//! The ISO-DEP transport contract.
//!
//! The driver is transport-agnostic: anything that can move APDU bytes to
//! a tag and back (an NFC reader library, a PC/SC binding, the `MockTag`
//! simulation) plugs in here. The transport must preserve byte order and
//! add or strip no framing of its own.

use crate::error::Error;

/// A half-duplex ISO-DEP link to a single tag.
///
/// Exactly one command is in flight at any time; the driver serializes all
/// access by requiring `&mut self` on every call.
pub trait Transport {
    /// Acquire the ISO-DEP technology / connect to the tag
    fn connect(&mut self) -> Result<(), Error>;

    /// Transmit a raw command APDU and return the raw response,
    /// `data || SW1 SW2`
    fn transceive(&mut self, apdu: &[u8]) -> Result<Vec<u8>, Error>;

    /// Release the tag / cancel the technology request
    fn close(&mut self) -> Result<(), Error>;
}
