//! Software simulation of an NTAG 424 DNA for integration testing.
//!
//! `MockTag` implements [`Transport`] and answers APDUs the way a real tag
//! would: it runs the card side of the EV2 handshake, derives the same
//! session keys, verifies command MACs against its own command counter,
//! decrypts full-mode payloads, and serves an in-memory copy of the tag's
//! three data files. Fault-injection hooks allow tests to corrupt a
//! response MAC or force an error status word.
//!
//! It is intended for testing only and enforces none of the tag's access
//! conditions beyond what the protocol itself requires. Always verify
//! against real tags as well.

use std::sync::{Arc, Mutex, MutexGuard};

use rand_core::{OsRng, RngCore};

use crate::apdu::{SW_ADDITIONAL_FRAME, SW_SUCCESS};
use crate::command::{Code, CLA_ISO, CLA_NTAG};
use crate::crypto::{
    aes_cbc_decrypt, aes_cbc_encrypt, crc32_jam, rotate_left_1, unpad_iso7816, WireMac, MAC_LEN,
    ZERO_IV,
};
use crate::error::Error;
use crate::file::{CommMode, FileId};
use crate::key::{Key, KeySlot, SLOT_COUNT};
use crate::session::SecureChannel;
use crate::transport::Transport;

/// Parameter error
const SW_PARAMETER_ERROR: u16 = 0x919E;

/// MAC or CRC integrity failure
const SW_INTEGRITY_ERROR: u16 = 0x911E;

/// Authentication state does not permit the command
const SW_AUTHENTICATION_ERROR: u16 = 0x91AE;

/// Offset or length outside the file
const SW_BOUNDARY_ERROR: u16 = 0x91BE;

/// File name not found
const SW_FILE_NOT_FOUND: u16 = 0x6A82;

/// Default UID reported by the mock
const DEFAULT_UID: [u8; 7] = [0x04, 0x86, 0x2A, 0x5A, 0x1B, 0x60, 0x80];

/// One in-memory data file
struct MockFile {
    data: Vec<u8>,
    /// File-settings byte 1 (communication mode in bits 0..1)
    option: u8,
    /// Access-rights bytes echoed in `GetFileSettings`
    access_rights: [u8; 2],
}

impl MockFile {
    fn new(size: usize, option: u8) -> Self {
        Self {
            data: vec![0u8; size],
            option,
            access_rights: [0xE0, 0xEE],
        }
    }

    fn comm_mode(&self) -> CommMode {
        CommMode::from_file_settings(self.option)
    }

    fn settings(&self) -> Vec<u8> {
        let mut settings = vec![0x00, self.option];
        settings.extend_from_slice(&self.access_rights);
        let size = (self.data.len() as u32).to_le_bytes();
        settings.extend_from_slice(&size[..3]);
        settings
    }
}

/// Pending first half of an authentication exchange
struct PendingAuth {
    slot: KeySlot,
    rand_b: [u8; 16],
    first: bool,
}

/// Reply payload plus how to protect it
struct SecuredReply {
    data: Vec<u8>,
    encrypted: bool,
}

impl SecuredReply {
    fn plain(data: Vec<u8>) -> Self {
        Self {
            data,
            encrypted: false,
        }
    }

    fn encrypted(data: Vec<u8>) -> Self {
        Self {
            data,
            encrypted: true,
        }
    }

    fn empty() -> Self {
        Self::plain(Vec::new())
    }
}

/// Card state behind a [`MockTag`] handle
struct MockState {
    uid: [u8; 7],
    keys: [Key; SLOT_COUNT as usize],
    key_versions: [u8; SLOT_COUNT as usize],
    cc_file: MockFile,
    ndef_file: MockFile,
    prop_file: MockFile,
    session: Option<SecureChannel>,
    pending_auth: Option<PendingAuth>,
    corrupt_next_mac: bool,
    force_sw: Option<u16>,
}

impl MockState {
    fn new() -> Self {
        Self {
            uid: DEFAULT_UID,
            keys: core::array::from_fn(|_| Key::new([0u8; 16])),
            key_versions: [0; SLOT_COUNT as usize],
            cc_file: MockFile::new(32, 0x00),
            ndef_file: MockFile::new(256, 0x00),
            prop_file: MockFile::new(128, 0x03),
            session: None,
            pending_auth: None,
            corrupt_next_mac: false,
            force_sw: None,
        }
    }

    /// Set a file's communication mode bits
    fn set_comm_mode(&mut self, file: FileId, mode: CommMode) {
        let option = match mode {
            CommMode::Plain => 0x00,
            CommMode::Mac => 0x01,
            CommMode::Full => 0x03,
        };
        if let Some(f) = self.file_mut_by_id(file) {
            f.option = option;
        }
    }

    /// Raw contents of a data file
    fn file_contents(&self, file: FileId) -> &[u8] {
        match file {
            FileId::CapabilityContainer => &self.cc_file.data,
            FileId::Ndef => &self.ndef_file.data,
            _ => &self.prop_file.data,
        }
    }

    /// Whether the card side currently holds a session
    fn has_session(&self) -> bool {
        self.session.is_some()
    }

    fn file_mut_by_id(&mut self, file: FileId) -> Option<&mut MockFile> {
        match file {
            FileId::CapabilityContainer => Some(&mut self.cc_file),
            FileId::Ndef => Some(&mut self.ndef_file),
            FileId::Proprietary => Some(&mut self.prop_file),
            _ => None,
        }
    }

    fn file(&self, file_no: u8) -> Option<&MockFile> {
        match file_no {
            0x01 => Some(&self.cc_file),
            0x02 => Some(&self.ndef_file),
            0x03 => Some(&self.prop_file),
            _ => None,
        }
    }

    fn file_mut(&mut self, file_no: u8) -> Option<&mut MockFile> {
        match file_no {
            0x01 => Some(&mut self.cc_file),
            0x02 => Some(&mut self.ndef_file),
            0x03 => Some(&mut self.prop_file),
            _ => None,
        }
    }

    fn handle(&mut self, raw: &[u8]) -> Vec<u8> {
        if let Some(sw) = self.force_sw.take() {
            return sw.to_be_bytes().to_vec();
        }

        let Some((cla, ins, body)) = parse_apdu(raw) else {
            return status(SW_PARAMETER_ERROR);
        };
        let body = body.to_vec();

        match (cla, ins) {
            (CLA_ISO, ins) if ins == Code::SelectFile.ins() => self.select(&body),
            (CLA_NTAG, ins) if ins == Code::AuthenticateEv2First.ins() => {
                self.auth_part1(&body, true)
            }
            (CLA_NTAG, ins) if ins == Code::AuthenticateEv2NonFirst.ins() => {
                self.auth_part1(&body, false)
            }
            (CLA_NTAG, ins) if ins == Code::AdditionalFrame.ins() => self.auth_part2(&body),
            (CLA_NTAG, ins) => self.secured_command(ins, &body),
            _ => status(SW_PARAMETER_ERROR),
        }
    }

    fn select(&mut self, body: &[u8]) -> Vec<u8> {
        let known = [
            [0x3F, 0x00],
            [0xE1, 0x10],
            [0xE1, 0x03],
            [0xE1, 0x04],
            [0xE1, 0x05],
        ];
        if body.len() != 2 || !known.iter().any(|name| name == body) {
            return status(SW_FILE_NOT_FOUND);
        }

        // A command inside a session consumes a counter tick on both ends
        self.tick_counter();
        status(SW_SUCCESS)
    }

    fn auth_part1(&mut self, body: &[u8], first: bool) -> Vec<u8> {
        let slot = match body.first() {
            Some(&slot) if slot < SLOT_COUNT => slot,
            _ => return status(SW_PARAMETER_ERROR),
        };
        if first {
            if body.len() != 5 {
                return status(SW_PARAMETER_ERROR);
            }
        } else {
            if body.len() != 1 {
                return status(SW_PARAMETER_ERROR);
            }
            if self.session.is_none() {
                return status(SW_AUTHENTICATION_ERROR);
            }
        }

        let mut rand_b = [0u8; 16];
        OsRng.fill_bytes(&mut rand_b);
        self.pending_auth = Some(PendingAuth {
            slot,
            rand_b,
            first,
        });

        let key = &self.keys[slot as usize];
        let mut response = aes_cbc_encrypt(key, &ZERO_IV, &rand_b).expect("block aligned");
        response.extend_from_slice(&SW_ADDITIONAL_FRAME.to_be_bytes());
        response
    }

    fn auth_part2(&mut self, body: &[u8]) -> Vec<u8> {
        let Some(pending) = self.pending_auth.take() else {
            return status(SW_AUTHENTICATION_ERROR);
        };
        if body.len() != 32 {
            return status(SW_PARAMETER_ERROR);
        }

        let key = self.keys[pending.slot as usize].clone();
        let pt = aes_cbc_decrypt(&key, &ZERO_IV, body).expect("block aligned");
        if pt[16..32] != rotate_left_1(&pending.rand_b) {
            // Host failed the challenge: no session survives
            self.session = None;
            return status(SW_AUTHENTICATION_ERROR);
        }

        let mut rand_a = [0u8; 16];
        rand_a.copy_from_slice(&pt[0..16]);

        if pending.first {
            let mut ti = [0u8; 4];
            OsRng.fill_bytes(&mut ti);
            self.session = Some(SecureChannel::new(
                &key,
                pending.slot,
                &rand_a,
                &pending.rand_b,
                ti,
            ));

            let mut reply = ti.to_vec();
            reply.extend_from_slice(&rotate_left_1(&rand_a));
            reply.extend_from_slice(&[0u8; 12]); // PDCap || PCDCap
            let mut response = aes_cbc_encrypt(&key, &ZERO_IV, &reply).expect("block aligned");
            response.extend_from_slice(&SW_SUCCESS.to_be_bytes());
            response
        } else {
            match self.session.as_mut() {
                Some(session) => session.rotate_keys(&key, pending.slot, &rand_a, &pending.rand_b),
                None => return status(SW_AUTHENTICATION_ERROR),
            }

            let mut response =
                aes_cbc_encrypt(&key, &ZERO_IV, &rotate_left_1(&rand_a)).expect("block aligned");
            response.extend_from_slice(&SW_SUCCESS.to_be_bytes());
            response
        }
    }

    fn secured_command(&mut self, ins: u8, body: &[u8]) -> Vec<u8> {
        if ins == Code::GetCardUid.ins() {
            self.get_card_uid(ins, body)
        } else if ins == Code::GetFileSettings.ins() {
            self.get_file_settings(ins, body)
        } else if ins == Code::GetKeyVersion.ins() {
            self.get_key_version(ins, body)
        } else if ins == Code::ReadData.ins() {
            self.read_data(ins, body)
        } else if ins == Code::WriteData.ins() {
            self.write_data(ins, body)
        } else if ins == Code::ChangeFileSettings.ins() {
            self.change_file_settings(ins, body)
        } else if ins == Code::ChangeKey.ins() {
            self.change_key(ins, body)
        } else {
            status(SW_PARAMETER_ERROR)
        }
    }

    fn get_card_uid(&mut self, ins: u8, body: &[u8]) -> Vec<u8> {
        match self.verify_mac_request(ins, body, 0) {
            Ok(()) => {}
            Err(sw) => return status(sw),
        }
        let uid = self.uid.to_vec();
        self.secure_reply(SecuredReply::encrypted(uid))
    }

    fn get_file_settings(&mut self, ins: u8, body: &[u8]) -> Vec<u8> {
        match self.verify_mac_request(ins, body, 1) {
            Ok(()) => {}
            Err(sw) => return status(sw),
        }
        let Some(file) = self.file(body[0]) else {
            return status(SW_PARAMETER_ERROR);
        };
        let settings = file.settings();
        self.secure_reply(SecuredReply::plain(settings))
    }

    fn get_key_version(&mut self, ins: u8, body: &[u8]) -> Vec<u8> {
        match self.verify_mac_request(ins, body, 1) {
            Ok(()) => {}
            Err(sw) => return status(sw),
        }
        let slot = body[0];
        if slot >= SLOT_COUNT {
            return status(SW_PARAMETER_ERROR);
        }
        let version = self.key_versions[slot as usize];
        self.secure_reply(SecuredReply::plain(vec![version]))
    }

    fn read_data(&mut self, ins: u8, body: &[u8]) -> Vec<u8> {
        let (mode, mac_len) = match self.request_shape(body, 7) {
            Ok(shape) => shape,
            Err(sw) => return status(sw),
        };
        let header = body[..7].to_vec();
        let (file_no, offset, length) = (header[0], header[1] as usize, header[4] as usize);

        if mode != CommMode::Plain {
            let (payload, mac) = body[7..].split_at(body.len() - 7 - mac_len);
            if !self.verify_command_mac(ins, &header, payload, mac) {
                return status(SW_INTEGRITY_ERROR);
            }
        }

        let Some(file) = self.file(file_no) else {
            return status(SW_PARAMETER_ERROR);
        };
        if offset + length > file.data.len() {
            return status(SW_BOUNDARY_ERROR);
        }
        let data = file.data[offset..offset + length].to_vec();

        match mode {
            CommMode::Plain => {
                self.tick_counter();
                let mut response = data;
                response.extend_from_slice(&SW_SUCCESS.to_be_bytes());
                response
            }
            CommMode::Mac => self.secure_reply(SecuredReply::plain(data)),
            CommMode::Full => self.secure_reply(SecuredReply::encrypted(data)),
        }
    }

    fn write_data(&mut self, ins: u8, body: &[u8]) -> Vec<u8> {
        let (mode, mac_len) = match self.request_shape(body, 7) {
            Ok(shape) => shape,
            Err(sw) => return status(sw),
        };
        let header = body[..7].to_vec();
        let (file_no, offset, length) = (header[0], header[1] as usize, header[4] as usize);

        let payload = match mode {
            CommMode::Plain => body[7..].to_vec(),
            CommMode::Mac => {
                let (payload, mac) = body[7..].split_at(body.len() - 7 - mac_len);
                if !self.verify_command_mac(ins, &header, payload, mac) {
                    return status(SW_INTEGRITY_ERROR);
                }
                payload.to_vec()
            }
            CommMode::Full => {
                let (ciphertext, mac) = body[7..].split_at(body.len() - 7 - mac_len);
                if !self.verify_command_mac(ins, &header, ciphertext, mac) {
                    return status(SW_INTEGRITY_ERROR);
                }
                let session = self.session.as_ref().expect("mode implies session");
                let Ok(padded) = session.decrypt_command_data(ciphertext) else {
                    return status(SW_INTEGRITY_ERROR);
                };
                match unpad_iso7816(&padded) {
                    Some(pt) => pt.to_vec(),
                    None => return status(SW_INTEGRITY_ERROR),
                }
            }
        };

        if payload.len() != length {
            return status(SW_PARAMETER_ERROR);
        }
        let Some(file) = self.file_mut(file_no) else {
            return status(SW_PARAMETER_ERROR);
        };
        if offset + length > file.data.len() {
            return status(SW_BOUNDARY_ERROR);
        }
        file.data[offset..offset + length].copy_from_slice(&payload);

        match mode {
            CommMode::Plain => {
                self.tick_counter();
                status(SW_SUCCESS)
            }
            _ => self.secure_reply(SecuredReply::empty()),
        }
    }

    fn change_file_settings(&mut self, ins: u8, body: &[u8]) -> Vec<u8> {
        let Some(settings) = self.full_mode_payload(ins, body, 1) else {
            return status(SW_INTEGRITY_ERROR);
        };
        if settings.is_empty() {
            return status(SW_PARAMETER_ERROR);
        }

        let Some(file) = self.file_mut(body[0]) else {
            return status(SW_PARAMETER_ERROR);
        };
        file.option = settings[0];
        if settings.len() >= 3 {
            file.access_rights = [settings[1], settings[2]];
        }

        self.secure_reply(SecuredReply::empty())
    }

    fn change_key(&mut self, ins: u8, body: &[u8]) -> Vec<u8> {
        match &self.session {
            Some(session) if session.authed_slot() == 0 => {}
            Some(_) => return status(SW_AUTHENTICATION_ERROR),
            None => return status(SW_AUTHENTICATION_ERROR),
        }

        let Some(data) = self.full_mode_payload(ins, body, 1) else {
            return status(SW_INTEGRITY_ERROR);
        };
        let slot = body[0];
        if slot >= SLOT_COUNT {
            return status(SW_PARAMETER_ERROR);
        }

        if slot == 0 {
            // newKey(16) || version
            if data.len() != 17 {
                return status(SW_PARAMETER_ERROR);
            }
            self.keys[0] = Key::from_slice(&data[..16]).expect("16 bytes");
            self.key_versions[0] = data[16];
        } else {
            // (oldKey xor newKey)(16) || version || JAMCRC(newKey)(4)
            if data.len() != 21 {
                return status(SW_PARAMETER_ERROR);
            }
            let mut new_key = [0u8; 16];
            for (i, byte) in new_key.iter_mut().enumerate() {
                *byte = data[i] ^ self.keys[slot as usize].as_bytes()[i];
            }
            if crc32_jam(&new_key) != data[17..21] {
                return status(SW_INTEGRITY_ERROR);
            }
            self.keys[slot as usize] = Key::new(new_key);
            self.key_versions[slot as usize] = data[16];
        }

        self.secure_reply(SecuredReply::empty())
    }

    // -- secured command plumbing ---------------------------------------

    /// Check shape and MAC of a MAC-mode request whose payload is empty:
    /// `cmd_header (header_len bytes) || MAC`
    fn verify_mac_request(&mut self, ins: u8, body: &[u8], header_len: usize) -> Result<(), u16> {
        if self.session.is_none() {
            return Err(SW_AUTHENTICATION_ERROR);
        }
        if body.len() != header_len + MAC_LEN {
            return Err(SW_PARAMETER_ERROR);
        }

        let (header, mac) = body.split_at(header_len);
        let header = header.to_vec();
        if !self.verify_command_mac(ins, &header, &[], mac) {
            return Err(SW_INTEGRITY_ERROR);
        }
        Ok(())
    }

    /// Work out a secured request's comm mode and whether a MAC trails it
    fn request_shape(&self, body: &[u8], header_len: usize) -> Result<(CommMode, usize), u16> {
        if body.len() < header_len {
            return Err(SW_PARAMETER_ERROR);
        }
        let Some(file) = self.file(body[0]) else {
            return Err(SW_PARAMETER_ERROR);
        };
        let mode = file.comm_mode();
        if mode != CommMode::Plain {
            if self.session.is_none() {
                return Err(SW_AUTHENTICATION_ERROR);
            }
            if body.len() < header_len + MAC_LEN {
                return Err(SW_PARAMETER_ERROR);
            }
            return Ok((mode, MAC_LEN));
        }
        Ok((mode, 0))
    }

    /// Verify a full-mode request and return its decrypted, unpadded
    /// payload
    fn full_mode_payload(&mut self, ins: u8, body: &[u8], header_len: usize) -> Option<Vec<u8>> {
        if self.session.is_none() || body.len() < header_len + MAC_LEN {
            return None;
        }
        let (header, rest) = body.split_at(header_len);
        let header = header.to_vec();
        let (ciphertext, mac) = rest.split_at(rest.len() - MAC_LEN);
        if !self.verify_command_mac(ins, &header, ciphertext, mac) {
            return None;
        }

        let session = self.session.as_ref()?;
        let padded = session.decrypt_command_data(ciphertext).ok()?;
        unpad_iso7816(&padded).map(<[u8]>::to_vec)
    }

    fn verify_command_mac(&mut self, ins: u8, header: &[u8], payload: &[u8], mac: &[u8]) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        let expected = session.command_mac(ins, header, payload);
        let Ok(received) = WireMac::from_slice(mac) else {
            return false;
        };
        if expected != received {
            // Integrity failure ends the session on the card too
            self.session = None;
            return false;
        }
        true
    }

    /// Advance the card-side counter if a session is active (mirrors the
    /// host, which ticks once per successful command in a session)
    fn tick_counter(&mut self) {
        if let Some(session) = self.session.as_mut() {
            if session.increment_counter().is_err() {
                self.session = None;
            }
        }
    }

    /// Tick the counter and wrap a reply with (optionally) encryption and
    /// a response MAC under the post-increment counter
    fn secure_reply(&mut self, reply: SecuredReply) -> Vec<u8> {
        self.tick_counter();
        let Some(session) = self.session.as_ref() else {
            return status(SW_AUTHENTICATION_ERROR);
        };

        let payload = if reply.encrypted {
            match session.encrypt_response_data(&reply.data) {
                Ok(ct) => ct,
                Err(_) => return status(SW_PARAMETER_ERROR),
            }
        } else {
            reply.data
        };

        let mac = session.response_mac(0x00, &payload);
        let mut mac_bytes = mac.as_slice().to_vec();
        if self.corrupt_next_mac {
            self.corrupt_next_mac = false;
            mac_bytes[0] ^= 0x80;
        }

        let mut response = payload;
        response.extend_from_slice(&mac_bytes);
        response.extend_from_slice(&SW_SUCCESS.to_be_bytes());
        response
    }
}

/// Software NTAG 424 DNA.
///
/// Cloning yields another handle onto the same card state, so a test can
/// keep one handle for inspection and fault injection while a
/// [`crate::Client`] owns the other as its transport.
#[derive(Clone)]
pub struct MockTag(Arc<Mutex<MockState>>);

impl MockTag {
    /// Create a mock tag with all five keys zeroed, as shipped from the
    /// factory
    pub fn new() -> Self {
        MockTag(Arc::new(Mutex::new(MockState::new())))
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().expect("mock tag state lock poisoned")
    }

    /// The UID the mock reports via `GetCardUID`
    pub fn uid(&self) -> [u8; 7] {
        self.state().uid
    }

    /// Install a key without going through `ChangeKey`
    pub fn set_key(&self, slot: KeySlot, key: Key) {
        self.state().keys[slot as usize] = key;
    }

    /// Current key material of a slot (for asserting `ChangeKey` results)
    pub fn key_bytes(&self, slot: KeySlot) -> [u8; 16] {
        *self.state().keys[slot as usize].as_bytes()
    }

    /// Stored version byte of a slot
    pub fn key_version(&self, slot: KeySlot) -> u8 {
        self.state().key_versions[slot as usize]
    }

    /// Set a file's communication mode bits
    pub fn set_comm_mode(&self, file: FileId, mode: CommMode) {
        self.state().set_comm_mode(file, mode);
    }

    /// Copy of a data file's raw contents
    pub fn file_contents(&self, file: FileId) -> Vec<u8> {
        self.state().file_contents(file).to_vec()
    }

    /// Whether the card side currently holds a session
    pub fn has_session(&self) -> bool {
        self.state().has_session()
    }

    /// Flip a bit in the next response MAC
    pub fn corrupt_next_response_mac(&self) {
        self.state().corrupt_next_mac = true;
    }

    /// Answer the next command with the given status word instead of
    /// processing it
    pub fn fail_next_with(&self, sw: u16) {
        self.state().force_sw = Some(sw);
    }
}

impl Default for MockTag {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTag {
    fn connect(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn transceive(&mut self, apdu: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(self.state().handle(apdu))
    }

    fn close(&mut self) -> Result<(), Error> {
        let mut state = self.state();
        state.session = None;
        state.pending_auth = None;
        Ok(())
    }
}

fn status(sw: u16) -> Vec<u8> {
    sw.to_be_bytes().to_vec()
}

/// Split a short-form APDU into `(CLA, INS, body)`
fn parse_apdu(raw: &[u8]) -> Option<(u8, u8, &[u8])> {
    if raw.len() < 4 {
        return None;
    }
    let (cla, ins) = (raw[0], raw[1]);
    if raw.len() <= 5 {
        // Header alone, or header plus a bare Le
        return Some((cla, ins, &[]));
    }

    let lc = raw[4] as usize;
    if raw.len() < 5 + lc {
        return None;
    }
    Some((cla, ins, &raw[5..5 + lc]))
}
