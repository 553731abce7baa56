//! The tag's application command set: instruction codes and APDU
//! skeletons.
//!
//! Apart from ISO `SelectFile` (class `00`), every command uses NXP's
//! wrapped class byte `90` with `P1 = P2 = 00` and a trailing `Le = 00`.

use crate::apdu::Apdu;

/// ISO class byte, used only by `SelectFile`
pub const CLA_ISO: u8 = 0x00;

/// NXP wrapped class byte used by every other command
pub const CLA_NTAG: u8 = 0x90;

/// Instruction codes for NTAG 424 DNA operations
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Code {
    /// ISO `SelectFile`
    SelectFile = 0xA4,

    /// First half of the EV2 mutual authentication, resetting TI and CC
    AuthenticateEv2First = 0x71,

    /// Key-rotating re-authentication inside an existing session
    AuthenticateEv2NonFirst = 0x77,

    /// Second frame of a two-part exchange
    AdditionalFrame = 0xAF,

    /// Read the 7-byte card UID (response always fully encrypted)
    GetCardUid = 0x51,

    /// Read a file's settings block
    GetFileSettings = 0xF5,

    /// Rewrite a file's settings block
    ChangeFileSettings = 0x5F,

    /// Read from a data file
    ReadData = 0xAD,

    /// Write to a data file
    WriteData = 0x8D,

    /// Replace a key slot's AES key
    ChangeKey = 0xC4,

    /// Read a key slot's one-byte version
    GetKeyVersion = 0x64,
}

impl Code {
    /// The instruction byte as transmitted
    pub fn ins(self) -> u8 {
        self as u8
    }

    /// APDU header for this command: `90 INS 00 00`
    pub(crate) fn header(self) -> [u8; 4] {
        [CLA_NTAG, self.ins(), 0x00, 0x00]
    }

    /// Complete APDU for this command with the given body
    pub(crate) fn apdu(self, body: Vec<u8>, le: bool) -> Apdu {
        Apdu::new(self.header(), body, le)
    }
}

/// APDU header for ISO `SelectFile` by name: `00 A4 00 0C`
pub(crate) fn select_header() -> [u8; 4] {
    [CLA_ISO, Code::SelectFile.ins(), 0x00, 0x0C]
}
