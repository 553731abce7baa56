//! ISO 7816-4 short-form APDU framing.
//!
//! Everything the tag speaks fits in short-form frames: a four-byte header
//! `CLA INS P1 P2`, an optional one-byte `Lc` length prefix plus body, and
//! an optional `Le = 00` ("expect any length"). Responses carry a payload
//! followed by a two-byte status word.

use crate::error::{desync, invalid_arg, Error};

/// Complete success
pub const SW_SUCCESS: u16 = 0x9100;

/// Success, additional frames follow. Only ever seen in the first half of
/// the two-part EV2 authentication exchange.
pub const SW_ADDITIONAL_FRAME: u16 = 0x91AF;

/// A command APDU ready to put on the wire
#[derive(Debug, Clone)]
pub struct Apdu {
    /// `CLA INS P1 P2`
    pub header: [u8; 4],

    /// Command body (serialized with a leading `Lc` when non-empty)
    pub body: Vec<u8>,

    /// Whether to append `Le = 00`
    pub le: bool,
}

impl Apdu {
    /// Build an APDU from its header, body, and `Le` flag
    pub fn new(header: [u8; 4], body: Vec<u8>, le: bool) -> Self {
        Self { header, body, le }
    }

    /// First two header bytes (`CLA INS`), used in error diagnostics
    pub fn command_id(&self) -> [u8; 2] {
        [self.header[0], self.header[1]]
    }

    /// Serialize to wire form: `header || [Lc] || body || [Le]`
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        if self.body.len() > 255 {
            return Err(invalid_arg!(
                "APDU body of {} bytes exceeds short-form Lc",
                self.body.len()
            ));
        }

        let mut wire = Vec::with_capacity(4 + 1 + self.body.len() + 1);
        wire.extend_from_slice(&self.header);
        if !self.body.is_empty() {
            wire.push(self.body.len() as u8);
            wire.extend_from_slice(&self.body);
        }
        if self.le {
            wire.push(0x00);
        }
        Ok(wire)
    }
}

/// A parsed response: payload plus trailing status word
#[derive(Debug, Clone)]
pub struct Response {
    /// Response payload (everything before the status word)
    pub data: Vec<u8>,

    /// `SW1 SW2`, big-endian as transmitted
    pub sw: u16,
}

impl Response {
    /// Parse `data || SW1 SW2`, taking ownership of the raw bytes
    pub fn parse(mut raw: Vec<u8>) -> Result<Self, Error> {
        if raw.len() < 2 {
            return Err(desync!(
                "response too short: {} bytes (expected at least the status word)",
                raw.len()
            ));
        }

        let sw2 = raw.pop().unwrap();
        let sw1 = raw.pop().unwrap();

        Ok(Self {
            data: raw,
            sw: u16::from_be_bytes([sw1, sw2]),
        })
    }

    /// Whether the status word is `9100`
    pub fn is_success(&self) -> bool {
        self.sw == SW_SUCCESS
    }

    /// Whether the status word is `91AF` (more frames follow)
    pub fn is_additional_frame(&self) -> bool {
        self.sw == SW_ADDITIONAL_FRAME
    }

    /// Second status byte, bound into response MACs
    pub fn sw2(&self) -> u8 {
        (self.sw & 0xFF) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn serialize_with_body_and_le() {
        let apdu = Apdu::new([0x00, 0xA4, 0x00, 0x0C], vec![0xE1, 0x10], true);
        assert_eq!(apdu.serialize().unwrap(), hex!("00 A4 00 0C 02 E1 10 00"));
    }

    #[test]
    fn serialize_headers_only() {
        let apdu = Apdu::new([0x90, 0x51, 0x00, 0x00], vec![], false);
        assert_eq!(apdu.serialize().unwrap(), hex!("90 51 00 00"));
    }

    #[test]
    fn serialize_empty_body_with_le() {
        let apdu = Apdu::new([0x90, 0x71, 0x00, 0x00], vec![], true);
        assert_eq!(apdu.serialize().unwrap(), hex!("90 71 00 00 00"));
    }

    #[test]
    fn serialize_rejects_oversized_body() {
        let apdu = Apdu::new([0x90, 0x8D, 0x00, 0x00], vec![0u8; 256], true);
        assert!(matches!(
            apdu.serialize(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn parse_splits_data_and_status_word() {
        let resp = Response::parse(hex!("AA BB CC 91 00").to_vec()).unwrap();
        assert_eq!(resp.data, hex!("AA BB CC"));
        assert_eq!(resp.sw, SW_SUCCESS);
        assert!(resp.is_success());
        assert_eq!(resp.sw2(), 0x00);
    }

    #[test]
    fn parse_additional_frame() {
        let resp = Response::parse(hex!("91 AF").to_vec()).unwrap();
        assert!(resp.data.is_empty());
        assert!(resp.is_additional_frame());
    }

    #[test]
    fn parse_rejects_truncated_response() {
        assert!(matches!(
            Response::parse(vec![0x91]),
            Err(Error::ProtocolDesync(_))
        ));
    }
}
