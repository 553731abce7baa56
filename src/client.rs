//! NTAG 424 DNA client: the main API in this crate.
//!
//! [`Client`] owns an ISO-DEP [`Transport`] and drives the whole protocol:
//! file selection, the EV2 mutual authentication handshake, and the
//! secured command set in its three communication modes.
//!
//! Within one secured call the order of observable effects is fixed:
//! build request, transceive, check the status word (failing before the
//! counter moves), increment the command counter, decrypt (full mode),
//! verify the response MAC, return. Failed commands therefore never
//! desynchronise the counter, and successful ones consume exactly one
//! tick.

use log::{debug, warn};
use rand_core::{OsRng, RngCore};
use zeroize::Zeroizing;

use crate::apdu::{Apdu, Response};
use crate::command::{select_header, Code};
use crate::crypto::{
    aes_cbc_decrypt, aes_cbc_encrypt, crc32_jam, rotate_left_1, WireMac, MAC_LEN, ZERO_IV,
};
use crate::error::{desync, invalid_arg, Error, Result};
use crate::file::{CommMode, FileId};
use crate::key::{check_slot, Key, KeySlot};
use crate::session::SecureChannel;
use crate::transport::Transport;

/// Length of the UID returned by `GetCardUID`
pub const UID_LEN: usize = 7;

/// Host-side driver for a single NTAG 424 DNA tag.
///
/// The tag is a half-duplex, single-session device, so the client is a
/// single-threaded engine: every operation takes `&mut self` for its full
/// duration, which serialises all access to the session state.
pub struct Client<T: Transport> {
    /// ISO-DEP link to the tag
    transport: T,

    /// EV2 session, present only between a successful
    /// `AuthenticateEV2First` and teardown
    channel: Option<SecureChannel>,
}

impl<T: Transport> Client<T> {
    /// Create a client over the given transport. No I/O happens until
    /// [`Client::initiate`].
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            channel: None,
        }
    }

    /// Bind the transport (acquire the ISO-DEP technology)
    pub fn initiate(&mut self) -> Result<()> {
        self.transport.connect()
    }

    /// Clear the session and release the transport
    pub fn terminate(&mut self) -> Result<()> {
        self.teardown_session();
        self.transport.close()
    }

    /// Select a file or application by its two-byte identifier.
    ///
    /// Selecting one of the data files implicitly selects the NDEF
    /// application first.
    pub fn select_file(&mut self, file: FileId) -> Result<()> {
        debug!("select_file({:?})", file);
        if file.file_no().is_ok() {
            self.select_raw(FileId::Application)?;
        }
        self.select_raw(file)
    }

    fn select_raw(&mut self, file: FileId) -> Result<()> {
        self.secured(
            select_header(),
            &file.select_name(),
            &[],
            CommMode::Plain,
            false,
        )
        .map(|_| ())
    }

    /// Perform the `AuthenticateEV2First` handshake against the given key
    /// slot and install a fresh session (new transaction identifier,
    /// command counter reset to zero).
    ///
    /// Any pre-existing session is discarded; any failure leaves the
    /// client unauthenticated.
    pub fn authenticate_ev2_first(&mut self, slot: KeySlot, key: &Key) -> Result<()> {
        check_slot(slot)?;
        debug!("authenticate_ev2_first(slot={})", slot);
        self.teardown_session();

        // Part 1: request the encrypted tag nonce
        let apdu = Code::AuthenticateEv2First.apdu(vec![slot, 0x03, 0x00, 0x00, 0x00], true);
        let rand_b = self.auth_part1(&apdu, key)?;

        // Part 2: prove knowledge of the key and recover the session TI
        let rand_a = random_nonce();
        let plaintext = self.auth_part2(key, &rand_a, &rand_b, 32)?;

        let mut ti = [0u8; 4];
        ti.copy_from_slice(&plaintext[0..4]);
        check_nonce_echo(&rand_a, &plaintext[4..20])?;
        // plaintext[20..32] carries PDCap/PCDCap, which we do not consume

        self.channel = Some(SecureChannel::new(key, slot, &rand_a, &rand_b, ti));
        Ok(())
    }

    /// Perform `AuthenticateEV2NonFirst`: rotate the session keys inside
    /// an existing session. The transaction identifier and command
    /// counter persist; only `K_enc`/`K_mac` (and the authenticated slot)
    /// change.
    pub fn authenticate_ev2_non_first(&mut self, slot: KeySlot, key: &Key) -> Result<()> {
        check_slot(slot)?;
        if self.channel.is_none() {
            return Err(Error::NotAuthenticated);
        }
        debug!("authenticate_ev2_non_first(slot={})", slot);

        let result = self.ev2_non_first_inner(slot, key);
        if let Err(ref err) = result {
            if err.is_fatal_to_session() {
                self.teardown_session();
            }
        }
        result
    }

    fn ev2_non_first_inner(&mut self, slot: KeySlot, key: &Key) -> Result<()> {
        let apdu = Code::AuthenticateEv2NonFirst.apdu(vec![slot], true);
        let rand_b = self.auth_part1(&apdu, key)?;

        let rand_a = random_nonce();
        let plaintext = self.auth_part2(key, &rand_a, &rand_b, 16)?;
        check_nonce_echo(&rand_a, &plaintext[0..16])?;

        let channel = self.channel.as_mut().ok_or(Error::NotAuthenticated)?;
        channel.rotate_keys(key, slot, &rand_a, &rand_b);
        Ok(())
    }

    /// Read the tag's 7-byte UID. MAC-mode request, but the response body
    /// comes back fully encrypted under the session keys.
    pub fn get_card_uid(&mut self) -> Result<[u8; UID_LEN]> {
        let data = self.secured(Code::GetCardUid.header(), &[], &[], CommMode::Mac, true)?;
        if data.len() < UID_LEN {
            let err = desync!("UID response too short: {} bytes", data.len());
            self.teardown_session();
            return Err(err);
        }

        let mut uid = [0u8; UID_LEN];
        uid.copy_from_slice(&data[..UID_LEN]);
        Ok(uid)
    }

    /// Read a data file's settings block. Advances the command counter.
    pub fn get_file_settings(&mut self, file: FileId) -> Result<Vec<u8>> {
        let file_no = file.file_no()?;
        self.secured(
            Code::GetFileSettings.header(),
            &[file_no],
            &[],
            CommMode::Mac,
            false,
        )
    }

    /// Rewrite a data file's settings block
    pub fn change_file_settings(&mut self, file: FileId, settings: &[u8]) -> Result<()> {
        let file_no = file.file_no()?;
        if settings.is_empty() {
            return Err(invalid_arg!("empty file settings"));
        }

        self.secured(
            Code::ChangeFileSettings.header(),
            &[file_no],
            settings,
            CommMode::Full,
            true,
        )
        .map(|_| ())
    }

    /// Read `length` bytes from a data file starting at `offset`.
    ///
    /// The communication mode is derived from the file's settings, so
    /// this issues a preliminary `GetFileSettings` (which itself advances
    /// the command counter).
    pub fn read_data(&mut self, file: FileId, offset: u8, length: u8) -> Result<Vec<u8>> {
        let file_no = file.file_no()?;
        let max = file.max_size()?;
        if length == 0 {
            return Err(invalid_arg!("read length must be non-zero"));
        }
        if usize::from(offset) + usize::from(length) > max {
            return Err(invalid_arg!(
                "read of {} bytes at offset {} exceeds {:?} size {}",
                length,
                offset,
                file,
                max
            ));
        }

        let mode = self.file_comm_mode(file)?;
        let cmd_header = [file_no, offset, 0, 0, length, 0, 0];
        let data = self.secured(
            Code::ReadData.header(),
            &cmd_header,
            &[],
            mode,
            mode == CommMode::Full,
        )?;

        if data.len() < usize::from(length) {
            let err = desync!("read returned {} bytes, expected {}", data.len(), length);
            self.teardown_session();
            return Err(err);
        }
        Ok(data[..usize::from(length)].to_vec())
    }

    /// Write `data` to a data file at `offset`.
    ///
    /// The payload is zero-padded to the file's per-command write size
    /// before wrapping. As with reads, the communication mode comes from
    /// a preliminary `GetFileSettings`.
    pub fn write_data(&mut self, file: FileId, data: &[u8], offset: u8) -> Result<()> {
        let file_no = file.file_no()?;
        let write_size = file.write_size()?;
        let max = file.max_size()?;
        if data.is_empty() {
            return Err(invalid_arg!("empty write payload"));
        }
        if data.len() > write_size {
            return Err(invalid_arg!(
                "write of {} bytes exceeds {:?} per-command size {}",
                data.len(),
                file,
                write_size
            ));
        }
        if usize::from(offset) + write_size > max {
            return Err(invalid_arg!(
                "write at offset {} exceeds {:?} size {}",
                offset,
                file,
                max
            ));
        }

        let mut padded = data.to_vec();
        padded.resize(write_size, 0x00);

        let mode = self.file_comm_mode(file)?;
        let cmd_header = [file_no, offset, 0, 0, write_size as u8, 0, 0];
        self.secured(
            Code::WriteData.header(),
            &cmd_header,
            &padded,
            mode,
            mode == CommMode::Full,
        )
        .map(|_| ())
    }

    /// Replace the application master key (slot 0). Requires a session
    /// authenticated against slot 0; issues a preliminary
    /// `GetKeyVersion`, so the command counter advances twice.
    pub fn change_master_key(&mut self, new_key: &Key) -> Result<()> {
        self.require_master_session()?;
        let version = self.get_key_version(0)?;

        let mut data = Zeroizing::new(Vec::with_capacity(17));
        data.extend_from_slice(new_key.as_bytes());
        data.push(version.wrapping_add(1));

        self.secured(Code::ChangeKey.header(), &[0x00], &data, CommMode::Full, true)
            .map(|_| ())
    }

    /// Replace one of the application keys (slots 1–4) using the
    /// XOR-and-CRC form. Requires a session authenticated against slot 0
    /// and knowledge of the slot's current key; issues a preliminary
    /// `GetKeyVersion`.
    pub fn change_application_key(
        &mut self,
        slot: KeySlot,
        old_key: &Key,
        new_key: &Key,
    ) -> Result<()> {
        check_slot(slot)?;
        if slot == 0 {
            return Err(invalid_arg!(
                "slot 0 is the master key; use change_master_key"
            ));
        }
        self.require_master_session()?;
        let version = self.get_key_version(slot)?;

        let mut data = Zeroizing::new(Vec::with_capacity(21));
        for (a, b) in old_key.as_bytes().iter().zip(new_key.as_bytes()) {
            data.push(a ^ b);
        }
        data.push(version);
        data.extend_from_slice(&crc32_jam(new_key.as_bytes()));

        self.secured(Code::ChangeKey.header(), &[slot], &data, CommMode::Full, true)
            .map(|_| ())
    }

    /// Read a key slot's one-byte version. Advances the command counter.
    pub fn get_key_version(&mut self, slot: KeySlot) -> Result<u8> {
        check_slot(slot)?;
        let data = self.secured(
            Code::GetKeyVersion.header(),
            &[slot],
            &[],
            CommMode::Mac,
            false,
        )?;
        match data.first() {
            Some(&version) => Ok(version),
            None => {
                self.teardown_session();
                Err(desync!("empty key version response"))
            }
        }
    }

    /// Send an authentication part-1 APDU and decrypt the tag's nonce
    fn auth_part1(&mut self, apdu: &Apdu, key: &Key) -> Result<Zeroizing<[u8; 16]>> {
        let resp = self.transceive_raw(apdu)?;
        if !resp.is_additional_frame() {
            return Err(Error::StatusWord {
                command: apdu.command_id(),
                sw: resp.sw,
            });
        }
        if resp.data.len() != 16 {
            return Err(desync!(
                "expected a 16-byte encrypted nonce, got {} bytes",
                resp.data.len()
            ));
        }

        let pt = aes_cbc_decrypt(key, &ZERO_IV, &resp.data)?;
        let mut rand_b = Zeroizing::new([0u8; 16]);
        rand_b.copy_from_slice(&pt);
        Ok(rand_b)
    }

    /// Send the part-2 frame `E(RandA || RandB')` and decrypt the tag's
    /// answer, which must be exactly `expected_len` bytes of plaintext
    fn auth_part2(
        &mut self,
        key: &Key,
        rand_a: &[u8; 16],
        rand_b: &[u8; 16],
        expected_len: usize,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let mut challenge = Zeroizing::new([0u8; 32]);
        challenge[0..16].copy_from_slice(rand_a);
        challenge[16..32].copy_from_slice(&rotate_left_1(rand_b));
        let ct = aes_cbc_encrypt(key, &ZERO_IV, &challenge[..])?;

        let apdu = Code::AdditionalFrame.apdu(ct, true);
        let resp = self.transceive_raw(&apdu)?;
        if !resp.is_success() {
            return Err(Error::StatusWord {
                command: apdu.command_id(),
                sw: resp.sw,
            });
        }
        if resp.data.len() != expected_len {
            return Err(desync!(
                "expected {} bytes of authentication data, got {}",
                expected_len,
                resp.data.len()
            ));
        }

        Ok(Zeroizing::new(aes_cbc_decrypt(key, &ZERO_IV, &resp.data)?))
    }

    /// Fetch a file's settings and derive the communication mode from
    /// byte 1
    fn file_comm_mode(&mut self, file: FileId) -> Result<CommMode> {
        let settings = self.get_file_settings(file)?;
        if settings.len() < 2 {
            let err = desync!("file settings too short: {} bytes", settings.len());
            self.teardown_session();
            return Err(err);
        }
        Ok(CommMode::from_file_settings(settings[1]))
    }

    fn require_master_session(&self) -> Result<()> {
        match &self.channel {
            None => Err(Error::NotAuthenticated),
            Some(channel) if channel.authed_slot() != 0 => Err(invalid_arg!(
                "key management requires a slot-0 session (authenticated slot {})",
                channel.authed_slot()
            )),
            Some(_) => Ok(()),
        }
    }

    /// The command-mode engine: build the secured body, transceive, and
    /// unwrap the response according to `mode`. `encrypted_response`
    /// selects full-mode response handling even for MAC-mode requests
    /// (`GetCardUID`).
    fn secured(
        &mut self,
        header: [u8; 4],
        cmd_header: &[u8],
        cmd_data: &[u8],
        mode: CommMode,
        encrypted_response: bool,
    ) -> Result<Vec<u8>> {
        let result = self.secured_inner(header, cmd_header, cmd_data, mode, encrypted_response);
        if let Err(ref err) = result {
            if matches!(err, Error::MacMismatch) {
                warn!("response MAC mismatch, tearing down session");
            }
            if err.is_fatal_to_session() {
                self.teardown_session();
            }
        }
        result
    }

    fn secured_inner(
        &mut self,
        header: [u8; 4],
        cmd_header: &[u8],
        cmd_data: &[u8],
        mode: CommMode,
        encrypted_response: bool,
    ) -> Result<Vec<u8>> {
        let ins = header[1];

        let body = match mode {
            CommMode::Plain => {
                let mut body = Vec::with_capacity(cmd_header.len() + cmd_data.len());
                body.extend_from_slice(cmd_header);
                body.extend_from_slice(cmd_data);
                body
            }
            CommMode::Mac => {
                let channel = self.channel.as_ref().ok_or(Error::NotAuthenticated)?;
                let mac = channel.command_mac(ins, cmd_header, cmd_data);

                let mut body = Vec::with_capacity(cmd_header.len() + cmd_data.len() + MAC_LEN);
                body.extend_from_slice(cmd_header);
                body.extend_from_slice(cmd_data);
                body.extend_from_slice(mac.as_slice());
                body
            }
            CommMode::Full => {
                let channel = self.channel.as_ref().ok_or(Error::NotAuthenticated)?;
                let enc_data = channel.encrypt_command_data(cmd_data)?;
                let mac = channel.command_mac(ins, cmd_header, &enc_data);

                let mut body = Vec::with_capacity(cmd_header.len() + enc_data.len() + MAC_LEN);
                body.extend_from_slice(cmd_header);
                body.extend_from_slice(&enc_data);
                body.extend_from_slice(mac.as_slice());
                body
            }
        };

        let apdu = Apdu::new(header, body, true);
        let resp = self.transceive_raw(&apdu)?;

        // Plain mode alone tolerates the additional-frame status
        let accepted = resp.is_success() || (mode == CommMode::Plain && resp.is_additional_frame());
        if !accepted {
            return Err(Error::StatusWord {
                command: apdu.command_id(),
                sw: resp.sw,
            });
        }

        match mode {
            CommMode::Plain => {
                if let Some(channel) = self.channel.as_mut() {
                    channel.increment_counter()?;
                }
                Ok(resp.data)
            }
            CommMode::Mac | CommMode::Full => {
                let channel = self.channel.as_mut().ok_or(Error::NotAuthenticated)?;
                channel.increment_counter()?;
                unwrap_secured(channel, resp, encrypted_response)
            }
        }
    }

    fn transceive_raw(&mut self, apdu: &Apdu) -> Result<Response> {
        let wire = apdu.serialize()?;
        debug!("=> {:02x?}", wire);
        let raw = self.transport.transceive(&wire)?;
        debug!("<= {:02x?}", raw);
        Response::parse(raw)
    }

    fn teardown_session(&mut self) {
        if self.channel.take().is_some() {
            debug!("session cleared");
        }
    }

    #[cfg(test)]
    fn install_session(&mut self, channel: SecureChannel) {
        self.channel = Some(channel);
    }

    #[cfg(test)]
    fn session_counter(&self) -> Option<u16> {
        self.channel.as_ref().map(|c| c.counter())
    }
}

/// Split a secured response into payload and MAC, decrypt if needed, and
/// verify the MAC over the data exactly as received. The caller has
/// already incremented the counter, so verification binds the
/// post-increment value.
fn unwrap_secured(channel: &SecureChannel, resp: Response, encrypted: bool) -> Result<Vec<u8>> {
    if resp.data.len() < MAC_LEN {
        return Err(desync!(
            "secured response of {} bytes is shorter than its MAC",
            resp.data.len()
        ));
    }

    let mac_index = resp.data.len() - MAC_LEN;
    let payload = &resp.data[..mac_index];
    let received = WireMac::from_slice(&resp.data[mac_index..])?;

    let plaintext = if encrypted {
        channel.decrypt_response_data(payload)?
    } else {
        payload.to_vec()
    };

    channel.verify_response_mac(resp.sw2(), payload, &received)?;
    Ok(plaintext)
}

/// Generate the host's 16-byte random nonce
fn random_nonce() -> Zeroizing<[u8; 16]> {
    let mut nonce = Zeroizing::new([0u8; 16]);
    OsRng.fill_bytes(&mut nonce[..]);
    nonce
}

/// Confirm the tag echoed `rotl1(RandA)`, proving it decrypted our nonce
fn check_nonce_echo(rand_a: &[u8; 16], echoed: &[u8]) -> Result<()> {
    if echoed != rotate_left_1(rand_a) {
        return Err(desync!("tag failed to echo the rotated host nonce"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{aes_cmac, aes_ecb_encrypt_block, pad_iso7816};
    use crate::session::kdf::derive_session_keys;
    use hex_literal::hex;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    const RAND_A: [u8; 16] = hex!("13c5db8a5930439fc3def9a4c675360f");
    const RAND_B: [u8; 16] = hex!("3af907807b6051236a0a4f9f96906d96");
    const TI: [u8; 4] = hex!("11223344");

    type Handler = Box<dyn FnMut(&[u8]) -> Vec<u8>>;

    /// Transport that records every request and answers from a script of
    /// handler closures
    #[derive(Default)]
    struct ScriptedTransport {
        requests: Vec<Vec<u8>>,
        handlers: VecDeque<Handler>,
    }

    impl ScriptedTransport {
        fn respond(mut self, raw: Vec<u8>) -> Self {
            self.handlers.push_back(Box::new(move |_| raw.clone()));
            self
        }

        fn respond_with(mut self, handler: impl FnMut(&[u8]) -> Vec<u8> + 'static) -> Self {
            self.handlers.push_back(Box::new(handler));
            self
        }
    }

    impl Transport for ScriptedTransport {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn transceive(&mut self, apdu: &[u8]) -> Result<Vec<u8>> {
            self.requests.push(apdu.to_vec());
            let mut handler = self.handlers.pop_front().expect("unscripted APDU");
            Ok(handler(apdu))
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn session_keys() -> (Key, Key) {
        derive_session_keys(&Key::new([0u8; 16]), &RAND_A, &RAND_B)
    }

    fn test_channel(counter: u16) -> SecureChannel {
        let (k_enc, k_mac) = session_keys();
        SecureChannel::from_parts(k_enc, k_mac, TI, counter, 0)
    }

    /// Response-direction IV as the card computes it
    fn card_response_iv(k_enc: &Key, counter: u16) -> [u8; 16] {
        let mut block = [0u8; 16];
        block[0..2].copy_from_slice(&[0x5A, 0xA5]);
        block[2..6].copy_from_slice(&TI);
        block[6..8].copy_from_slice(&counter.to_le_bytes());
        aes_ecb_encrypt_block(k_enc, &block)
    }

    #[test]
    fn select_application_wire_format() {
        let transport = ScriptedTransport::default().respond(hex!("9100").to_vec());
        let mut client = Client::new(transport);
        client.select_file(FileId::Application).unwrap();
        assert_eq!(client.transport.requests, vec![hex!("00A4000C02E11000").to_vec()]);
    }

    #[test]
    fn select_data_file_selects_application_first() {
        let transport = ScriptedTransport::default()
            .respond(hex!("9100").to_vec())
            .respond(hex!("9100").to_vec());
        let mut client = Client::new(transport);
        client.select_file(FileId::Ndef).unwrap();
        assert_eq!(
            client.transport.requests,
            vec![
                hex!("00A4000C02E11000").to_vec(),
                hex!("00A4000C02E10400").to_vec(),
            ]
        );
    }

    #[test]
    fn select_failure_surfaces_status_word() {
        let transport = ScriptedTransport::default().respond(hex!("6A82").to_vec());
        let mut client = Client::new(transport);
        let err = client.select_file(FileId::Application).unwrap_err();
        assert!(matches!(
            err,
            Error::StatusWord {
                command: [0x00, 0xA4],
                sw: 0x6A82,
            }
        ));
    }

    #[test]
    fn get_file_settings_wire_format_and_counter() {
        let (_, k_mac) = session_keys();
        let settings = hex!("0040EEEE000100").to_vec();

        // The card answers with the post-increment counter bound into
        // the response MAC
        let responder = test_channel(1);
        let mut response = settings.clone();
        response.extend_from_slice(responder.response_mac(0x00, &settings).as_slice());
        response.extend_from_slice(&hex!("9100"));

        let transport = ScriptedTransport::default().respond(response);
        let mut client = Client::new(transport);
        client.install_session(test_channel(0));

        let returned = client.get_file_settings(FileId::Ndef).unwrap();
        assert_eq!(returned, settings);
        assert_eq!(client.session_counter(), Some(1));

        // Wire APDU: 90 F5 00 00 | Lc=9 | 02 | mac | 00, with the MAC
        // computed over INS || CC || TI || file number
        let expected_mac = WireMac::truncate(&aes_cmac(&k_mac, &hex!("F5 0000 11223344 02")));
        let mut expected = hex!("90F5000009 02").to_vec();
        expected.extend_from_slice(expected_mac.as_slice());
        expected.push(0x00);
        assert_eq!(client.transport.requests, vec![expected]);
    }

    #[test]
    fn secured_commands_require_authentication() {
        let mut client = Client::new(ScriptedTransport::default());
        assert!(matches!(client.get_card_uid(), Err(Error::NotAuthenticated)));
        assert!(matches!(
            client.get_file_settings(FileId::Ndef),
            Err(Error::NotAuthenticated)
        ));
        assert!(matches!(
            client.change_file_settings(FileId::Ndef, &[0x00]),
            Err(Error::NotAuthenticated)
        ));
        assert!(client.transport.requests.is_empty());
    }

    #[test]
    fn status_word_failure_tears_down_session() {
        let transport = ScriptedTransport::default().respond(hex!("919E").to_vec());
        let mut client = Client::new(transport);
        client.install_session(test_channel(0));

        let err = client.get_file_settings(FileId::Ndef).unwrap_err();
        assert!(matches!(
            err,
            Error::StatusWord {
                command: [0x90, 0xF5],
                sw: 0x919E,
            }
        ));
        assert_eq!(client.session_counter(), None);

        // Subsequent secured calls fail closed without touching the wire
        let issued = client.transport.requests.len();
        assert!(matches!(client.get_card_uid(), Err(Error::NotAuthenticated)));
        assert_eq!(client.transport.requests.len(), issued);
    }

    #[test]
    fn corrupted_response_mac_tears_down_session() {
        let settings = hex!("0040EEEE000100").to_vec();
        let responder = test_channel(1);
        let mut response = settings.clone();
        response.extend_from_slice(responder.response_mac(0x00, &settings).as_slice());
        response[settings.len()] ^= 0x01; // flip a MAC bit
        response.extend_from_slice(&hex!("9100"));

        let transport = ScriptedTransport::default().respond(response);
        let mut client = Client::new(transport);
        client.install_session(test_channel(0));

        assert!(matches!(
            client.get_file_settings(FileId::Ndef),
            Err(Error::MacMismatch)
        ));
        assert_eq!(client.session_counter(), None);
    }

    #[test]
    fn get_card_uid_decrypts_full_response() {
        let uid = hex!("04112233445566");

        let (k_enc, _) = session_keys();
        let responder = test_channel(1);
        let ciphertext = aes_cbc_encrypt(
            &k_enc,
            &card_response_iv(&k_enc, 1),
            &pad_iso7816(&uid),
        )
        .unwrap();
        let mut response = ciphertext.clone();
        response.extend_from_slice(responder.response_mac(0x00, &ciphertext).as_slice());
        response.extend_from_slice(&hex!("9100"));

        let transport = ScriptedTransport::default().respond(response);
        let mut client = Client::new(transport);
        client.install_session(test_channel(0));

        assert_eq!(client.get_card_uid().unwrap(), uid);
        assert_eq!(client.session_counter(), Some(1));

        // Request is MAC-mode with an empty payload: 90 51 00 00 | Lc=8 | mac | 00
        let request = &client.transport.requests[0];
        assert_eq!(&request[..5], hex!("9051000008"));
        assert_eq!(request.len(), 5 + MAC_LEN + 1);
    }

    #[test]
    fn read_data_derives_plain_mode_from_settings() {
        let file_data = hex!("D1010ED1");

        // GetFileSettings answer: byte 1 bits 0..1 = 0 (plain)
        let settings = hex!("0000E0EE000100").to_vec();
        let responder = test_channel(1);
        let mut settings_response = settings.clone();
        settings_response.extend_from_slice(responder.response_mac(0x00, &settings).as_slice());
        settings_response.extend_from_slice(&hex!("9100"));

        let mut read_response = file_data.to_vec();
        read_response.extend_from_slice(&hex!("9100"));

        let transport = ScriptedTransport::default()
            .respond(settings_response)
            .respond(read_response);
        let mut client = Client::new(transport);
        client.install_session(test_channel(0));

        assert_eq!(client.read_data(FileId::Ndef, 0, 4).unwrap(), file_data);
        // One tick for GetFileSettings, one for the plain read
        assert_eq!(client.session_counter(), Some(2));
        // Plain read carries no MAC: 90 AD 00 00 | Lc=7 | header | 00
        assert_eq!(
            client.transport.requests[1],
            hex!("90AD000007 02 00 0000 04 0000 00").to_vec()
        );
    }

    #[test]
    fn read_data_derives_full_mode_from_settings() {
        let file_data = hex!("00112233445566778899");

        let settings = hex!("0003E0EE000100").to_vec(); // bits 0..1 = 3: full
        let responder = test_channel(1);
        let mut settings_response = settings.clone();
        settings_response.extend_from_slice(responder.response_mac(0x00, &settings).as_slice());
        settings_response.extend_from_slice(&hex!("9100"));

        let (k_enc, _) = session_keys();
        let read_responder = test_channel(2);
        let ciphertext = aes_cbc_encrypt(
            &k_enc,
            &card_response_iv(&k_enc, 2),
            &pad_iso7816(&file_data),
        )
        .unwrap();
        let mut read_response = ciphertext.clone();
        read_response.extend_from_slice(read_responder.response_mac(0x00, &ciphertext).as_slice());
        read_response.extend_from_slice(&hex!("9100"));

        let transport = ScriptedTransport::default()
            .respond(settings_response)
            .respond(read_response);
        let mut client = Client::new(transport);
        client.install_session(test_channel(0));

        assert_eq!(
            client.read_data(FileId::Ndef, 0, file_data.len() as u8).unwrap(),
            file_data
        );
        assert_eq!(client.session_counter(), Some(2));
    }

    #[test]
    fn write_data_zero_pads_to_per_file_size() {
        let settings = hex!("0000E0EE000100").to_vec(); // plain
        let responder = test_channel(1);
        let mut settings_response = settings.clone();
        settings_response.extend_from_slice(responder.response_mac(0x00, &settings).as_slice());
        settings_response.extend_from_slice(&hex!("9100"));

        let transport = ScriptedTransport::default()
            .respond(settings_response)
            .respond(hex!("9100").to_vec());
        let mut client = Client::new(transport);
        client.install_session(test_channel(0));

        client.write_data(FileId::Ndef, &[0xD1, 0x01], 0).unwrap();

        let request = &client.transport.requests[1];
        // 90 8D 00 00 | Lc=255 | 7-byte header | 248-byte padded payload | 00
        assert_eq!(&request[..5], hex!("908D0000FF"));
        assert_eq!(&request[5..12], hex!("02 00 0000 F8 0000"));
        assert_eq!(&request[12..14], [0xD1, 0x01]);
        assert!(request[14..12 + 248].iter().all(|&b| b == 0x00));
        assert_eq!(request.len(), 5 + 7 + 248 + 1);
    }

    #[test]
    fn argument_errors_precede_io_and_keep_session() {
        let mut client = Client::new(ScriptedTransport::default());
        client.install_session(test_channel(3));

        assert!(matches!(
            client.read_data(FileId::Ndef, 0, 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            client.read_data(FileId::CapabilityContainer, 30, 10),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            client.write_data(FileId::Proprietary, &[0u8; 200], 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            client.write_data(FileId::Ndef, &[], 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            client.get_key_version(9),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            client.read_data(FileId::Application, 0, 4),
            Err(Error::InvalidArgument(_))
        ));

        assert!(client.transport.requests.is_empty());
        assert_eq!(client.session_counter(), Some(3));
    }

    #[test]
    fn change_application_key_requires_master_session() {
        let old_key = Key::new([0u8; 16]);
        let new_key = Key::new([1u8; 16]);

        let mut client = Client::new(ScriptedTransport::default());
        assert!(matches!(
            client.change_application_key(3, &old_key, &new_key),
            Err(Error::NotAuthenticated)
        ));

        let (k_enc, k_mac) = session_keys();
        client.install_session(SecureChannel::from_parts(k_enc, k_mac, TI, 0, 2));
        assert!(matches!(
            client.change_application_key(3, &old_key, &new_key),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            client.change_application_key(0, &old_key, &new_key),
            Err(Error::InvalidArgument(_))
        ));
        assert!(client.transport.requests.is_empty());
    }

    #[test]
    fn ev2_first_handshake_installs_session() {
        let key = Key::new([0u8; 16]);
        let card_key = key.clone();
        let rand_a_seen: Rc<RefCell<Option<[u8; 16]>>> = Rc::new(RefCell::new(None));
        let rand_a_handle = rand_a_seen.clone();

        let transport = ScriptedTransport::default()
            .respond_with({
                let key = card_key.clone();
                move |request: &[u8]| {
                    assert_eq!(request, hex!("9071000005 0003000000 00"));
                    let mut response =
                        aes_cbc_encrypt(&key, &ZERO_IV, &RAND_B).unwrap();
                    response.extend_from_slice(&hex!("91AF"));
                    response
                }
            })
            .respond_with({
                let key = card_key.clone();
                move |request: &[u8]| {
                    // 90 AF 00 00 | Lc=32 | E(RandA || RandB') | 00
                    assert_eq!(&request[..5], hex!("90AF000020"));
                    let pt = aes_cbc_decrypt(&key, &ZERO_IV, &request[5..37]).unwrap();
                    assert_eq!(&pt[16..32], rotate_left_1(&RAND_B));

                    let mut rand_a = [0u8; 16];
                    rand_a.copy_from_slice(&pt[0..16]);
                    *rand_a_handle.borrow_mut() = Some(rand_a);

                    let mut reply = TI.to_vec();
                    reply.extend_from_slice(&rotate_left_1(&rand_a));
                    reply.extend_from_slice(&[0u8; 12]); // PDCap || PCDCap
                    let mut response = aes_cbc_encrypt(&key, &ZERO_IV, &reply).unwrap();
                    response.extend_from_slice(&hex!("9100"));
                    response
                }
            });

        let mut client = Client::new(transport);
        client.authenticate_ev2_first(0, &key).unwrap();
        assert_eq!(client.session_counter(), Some(0));

        // The installed keys must match a card-side derivation from the
        // same nonces
        let rand_a = rand_a_seen.borrow().unwrap();
        let (_, k_mac) = derive_session_keys(&key, &rand_a, &RAND_B);
        let card = SecureChannel::from_parts(Key::new([0u8; 16]), k_mac, TI, 0, 0);
        let expected_mac = card.command_mac(0x51, &[], &[]);

        let channel = client.channel.as_ref().unwrap();
        assert_eq!(channel.command_mac(0x51, &[], &[]), expected_mac);
    }

    #[test]
    fn ev2_first_rejects_bad_nonce_echo() {
        let key = Key::new([0u8; 16]);

        let transport = ScriptedTransport::default()
            .respond_with({
                let key = key.clone();
                move |_: &[u8]| {
                    let mut response = aes_cbc_encrypt(&key, &ZERO_IV, &RAND_B).unwrap();
                    response.extend_from_slice(&hex!("91AF"));
                    response
                }
            })
            .respond_with({
                let key = key.clone();
                move |_: &[u8]| {
                    let mut reply = TI.to_vec();
                    reply.extend_from_slice(&[0xEE; 16]); // wrong echo
                    reply.extend_from_slice(&[0u8; 12]);
                    let mut response = aes_cbc_encrypt(&key, &ZERO_IV, &reply).unwrap();
                    response.extend_from_slice(&hex!("9100"));
                    response
                }
            });

        let mut client = Client::new(transport);
        assert!(matches!(
            client.authenticate_ev2_first(0, &key),
            Err(Error::ProtocolDesync(_))
        ));
        assert_eq!(client.session_counter(), None);
    }

    #[test]
    fn ev2_first_failure_replaces_nothing() {
        let transport = ScriptedTransport::default().respond(hex!("911C").to_vec());
        let mut client = Client::new(transport);
        client.install_session(test_channel(7));

        let err = client.authenticate_ev2_first(1, &Key::new([9u8; 16])).unwrap_err();
        assert!(matches!(err, Error::StatusWord { sw: 0x911C, .. }));
        // The stale session is gone, not resurrected
        assert_eq!(client.session_counter(), None);
    }

    #[test]
    fn ev2_non_first_rotates_keys_and_keeps_counter() {
        let key = Key::new([4u8; 16]);

        let transport = ScriptedTransport::default()
            .respond_with({
                let key = key.clone();
                move |request: &[u8]| {
                    // 90 77 00 00 | Lc=1 | slot | 00
                    assert_eq!(request, hex!("90770000010300"));
                    let mut response = aes_cbc_encrypt(&key, &ZERO_IV, &RAND_B).unwrap();
                    response.extend_from_slice(&hex!("91AF"));
                    response
                }
            })
            .respond_with({
                let key = key.clone();
                move |request: &[u8]| {
                    let pt = aes_cbc_decrypt(&key, &ZERO_IV, &request[5..37]).unwrap();
                    let mut rand_a = [0u8; 16];
                    rand_a.copy_from_slice(&pt[0..16]);

                    let mut response =
                        aes_cbc_encrypt(&key, &ZERO_IV, &rotate_left_1(&rand_a)).unwrap();
                    response.extend_from_slice(&hex!("9100"));
                    response
                }
            });

        let mut client = Client::new(transport);
        client.install_session(test_channel(5));

        client.authenticate_ev2_non_first(3, &key).unwrap();
        assert_eq!(client.session_counter(), Some(5));
    }

    #[test]
    fn ev2_non_first_requires_session() {
        let mut client = Client::new(ScriptedTransport::default());
        assert!(matches!(
            client.authenticate_ev2_non_first(0, &Key::new([0u8; 16])),
            Err(Error::NotAuthenticated)
        ));
        assert!(client.transport.requests.is_empty());
    }

    #[test]
    fn terminate_clears_session() {
        let mut client = Client::new(ScriptedTransport::default());
        client.install_session(test_channel(2));
        client.terminate().unwrap();
        assert_eq!(client.session_counter(), None);
    }
}
