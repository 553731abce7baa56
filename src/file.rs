//! The tag's fixed file system: identifiers, sizes, and the communication
//! mode encoded in each file's settings.
//!
//! An NTAG 424 DNA ships with three data files inside its application:
//! the Capability Container (file number `01`), the NDEF file (`02`), and
//! a proprietary file (`03`). Each is addressed two ways: by ISO file
//! identifier when selecting, and by file number inside wrapped commands.

use crate::crypto::bits;
use crate::error::{invalid_arg, Error};

/// A selectable file or directory on the tag
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileId {
    /// The PICC-level master application (DF `3F00`)
    Master,

    /// The NDEF tag application (AID `E110`)
    Application,

    /// Capability Container file, ISO FID `E103`, file number `01`
    CapabilityContainer,

    /// NDEF data file, ISO FID `E104`, file number `02`
    Ndef,

    /// Proprietary data file, ISO FID `E105`, file number `03`
    Proprietary,
}

impl FileId {
    /// The two-byte name sent with `SelectFile`
    pub(crate) fn select_name(self) -> [u8; 2] {
        match self {
            FileId::Master => [0x3F, 0x00],
            FileId::Application => [0xE1, 0x10],
            FileId::CapabilityContainer => [0xE1, 0x03],
            FileId::Ndef => [0xE1, 0x04],
            FileId::Proprietary => [0xE1, 0x05],
        }
    }

    /// The file number used inside wrapped commands, if this is a data file
    pub(crate) fn file_no(self) -> Result<u8, Error> {
        match self {
            FileId::CapabilityContainer => Ok(0x01),
            FileId::Ndef => Ok(0x02),
            FileId::Proprietary => Ok(0x03),
            other => Err(invalid_arg!("{:?} is not a data file", other)),
        }
    }

    /// Total file size in bytes
    pub(crate) fn max_size(self) -> Result<usize, Error> {
        match self {
            FileId::CapabilityContainer => Ok(32),
            FileId::Ndef => Ok(256),
            FileId::Proprietary => Ok(128),
            other => Err(invalid_arg!("{:?} is not a data file", other)),
        }
    }

    /// Payload size a single `WriteData` carries. Write payloads are
    /// zero-padded to this length before wrapping; for the NDEF file it is
    /// capped at 248 bytes so the padded frame still fits a short APDU.
    pub(crate) fn write_size(self) -> Result<usize, Error> {
        match self {
            FileId::CapabilityContainer => Ok(32),
            FileId::Ndef => Ok(248),
            FileId::Proprietary => Ok(128),
            other => Err(invalid_arg!("{:?} is not a data file", other)),
        }
    }
}

/// Security level applied to a command and its response
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommMode {
    /// No protection
    Plain,

    /// Truncated CMAC appended to command and response
    Mac,

    /// Encrypt-then-MAC in both directions
    Full,
}

impl CommMode {
    /// Derive the communication mode from file-settings byte 1.
    ///
    /// Bits 0..1 select the mode: `0` plain, `1` MAC, `3` full. The value
    /// `2` is unspecified by the data sheet; fielded tags have been
    /// observed to treat it as plain, and we follow them.
    pub fn from_file_settings(option_byte: u8) -> CommMode {
        match bits(option_byte, 0, 1) {
            1 => CommMode::Mac,
            3 => CommMode::Full,
            _ => CommMode::Plain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_names() {
        assert_eq!(FileId::Master.select_name(), [0x3F, 0x00]);
        assert_eq!(FileId::Application.select_name(), [0xE1, 0x10]);
        assert_eq!(FileId::CapabilityContainer.select_name(), [0xE1, 0x03]);
        assert_eq!(FileId::Ndef.select_name(), [0xE1, 0x04]);
        assert_eq!(FileId::Proprietary.select_name(), [0xE1, 0x05]);
    }

    #[test]
    fn file_numbers() {
        assert_eq!(FileId::CapabilityContainer.file_no().unwrap(), 0x01);
        assert_eq!(FileId::Ndef.file_no().unwrap(), 0x02);
        assert_eq!(FileId::Proprietary.file_no().unwrap(), 0x03);
        assert!(FileId::Application.file_no().is_err());
        assert!(FileId::Master.file_no().is_err());
    }

    #[test]
    fn comm_mode_from_settings_byte() {
        assert_eq!(CommMode::from_file_settings(0x00), CommMode::Plain);
        assert_eq!(CommMode::from_file_settings(0x01), CommMode::Mac);
        assert_eq!(CommMode::from_file_settings(0x03), CommMode::Full);
        // Unspecified bit pattern observed in the field as plain
        assert_eq!(CommMode::from_file_settings(0x02), CommMode::Plain);
        // Upper bits (access-rights-related) do not affect the mode
        assert_eq!(CommMode::from_file_settings(0x43), CommMode::Full);
        assert_eq!(CommMode::from_file_settings(0xE0), CommMode::Plain);
    }
}
