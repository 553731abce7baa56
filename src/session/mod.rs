//! EV2 secure-messaging session state.
//!
//! A [`SecureChannel`] is installed by a successful `AuthenticateEV2First`
//! and holds everything the wrapper needs to secure commands: the two
//! session keys, the transaction identifier the tag assigned, the 16-bit
//! command counter, and the key slot that authenticated. The channel owns
//! only the cryptography; transceiving and the ordering of observable
//! effects live in the client.

pub(crate) mod kdf;

use log::debug;

use crate::crypto::{
    aes_cbc_decrypt, aes_cbc_encrypt, aes_cmac, aes_ecb_encrypt_block, pad_iso7816, WireMac,
    BLOCK_SIZE,
};
use crate::error::{desync, Error};
use crate::key::{Key, KeySlot};

/// IV-derivation label for host-to-tag (command) data
const IV_LABEL_COMMAND: [u8; 2] = [0xA5, 0x5A];

/// IV-derivation label for tag-to-host (response) data
const IV_LABEL_RESPONSE: [u8; 2] = [0x5A, 0xA5];

/// State of one authenticated EV2 session.
///
/// All fields are present together or the session does not exist; the
/// client models that as `Option<SecureChannel>`. Session keys are wiped
/// when the channel is dropped.
pub(crate) struct SecureChannel {
    /// Session key for payload confidentiality
    k_enc: Key,

    /// Session key for command/response CMACs
    k_mac: Key,

    /// Transaction identifier, fixed for the life of the session
    ti: [u8; 4],

    /// Command counter, little-endian on the wire
    counter: u16,

    /// Key slot that established the session
    authed_slot: KeySlot,
}

impl SecureChannel {
    /// Install a fresh session from an `AuthenticateEV2First` exchange:
    /// derives both session keys and resets the counter.
    pub(crate) fn new(
        auth_key: &Key,
        slot: KeySlot,
        rand_a: &[u8; 16],
        rand_b: &[u8; 16],
        ti: [u8; 4],
    ) -> Self {
        let (k_enc, k_mac) = kdf::derive_session_keys(auth_key, rand_a, rand_b);
        debug!("session installed: slot={} ti={:02x?}", slot, ti);

        Self {
            k_enc,
            k_mac,
            ti,
            counter: 0,
            authed_slot: slot,
        }
    }

    /// Rotate the session keys after `AuthenticateEV2NonFirst`. The
    /// transaction identifier and command counter persist; the
    /// authenticated slot is updated to the one that re-authenticated.
    pub(crate) fn rotate_keys(
        &mut self,
        auth_key: &Key,
        slot: KeySlot,
        rand_a: &[u8; 16],
        rand_b: &[u8; 16],
    ) {
        let (k_enc, k_mac) = kdf::derive_session_keys(auth_key, rand_a, rand_b);
        self.k_enc = k_enc;
        self.k_mac = k_mac;
        self.authed_slot = slot;
        debug!("session keys rotated: ti={:02x?} cc={}", self.ti, self.counter);
    }

    /// Key slot this session authenticated against
    pub(crate) fn authed_slot(&self) -> KeySlot {
        self.authed_slot
    }

    /// Current command counter value
    pub(crate) fn counter(&self) -> u16 {
        self.counter
    }

    /// Advance the command counter by one.
    ///
    /// The chip leaves behaviour past `0xFFFF` undefined, so overflow is
    /// a hard protocol error rather than a wrap.
    pub(crate) fn increment_counter(&mut self) -> Result<(), Error> {
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| desync!("command counter overflow"))?;
        Ok(())
    }

    /// MAC for an outgoing command:
    /// `CMAC(K_mac, INS || CC_le || TI || cmd_header || payload)`,
    /// truncated to wire form. `payload` is the ciphertext in full mode.
    pub(crate) fn command_mac(&self, ins: u8, cmd_header: &[u8], payload: &[u8]) -> WireMac {
        let mut input = Vec::with_capacity(7 + cmd_header.len() + payload.len());
        input.push(ins);
        input.extend_from_slice(&self.counter.to_le_bytes());
        input.extend_from_slice(&self.ti);
        input.extend_from_slice(cmd_header);
        input.extend_from_slice(payload);
        WireMac::truncate(&aes_cmac(&self.k_mac, &input))
    }

    /// Expected MAC for a response:
    /// `CMAC(K_mac, SW2 || CC_le || TI || data)` over the data exactly as
    /// received (ciphertext in full mode). Callers must have incremented
    /// the counter first; verification binds the post-increment value.
    pub(crate) fn response_mac(&self, sw2: u8, data: &[u8]) -> WireMac {
        let mut input = Vec::with_capacity(7 + data.len());
        input.push(sw2);
        input.extend_from_slice(&self.counter.to_le_bytes());
        input.extend_from_slice(&self.ti);
        input.extend_from_slice(data);
        WireMac::truncate(&aes_cmac(&self.k_mac, &input))
    }

    /// Verify a received response MAC in constant time
    pub(crate) fn verify_response_mac(
        &self,
        sw2: u8,
        data: &[u8],
        received: &WireMac,
    ) -> Result<(), Error> {
        if self.response_mac(sw2, data) != *received {
            return Err(Error::MacMismatch);
        }
        Ok(())
    }

    /// Pad and encrypt a full-mode command payload under the
    /// command-direction IV and the current counter
    pub(crate) fn encrypt_command_data(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let padded = pad_iso7816(plaintext);
        aes_cbc_encrypt(&self.k_enc, &self.data_iv(IV_LABEL_COMMAND), &padded)
    }

    /// Decrypt a full-mode response payload under the response-direction
    /// IV. Padding is not stripped; callers slice to the documented
    /// length of the command they sent.
    pub(crate) fn decrypt_response_data(&self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        if ciphertext.is_empty() {
            return Ok(Vec::new());
        }
        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(desync!(
                "encrypted response of {} bytes is not block aligned",
                ciphertext.len()
            ));
        }
        aes_cbc_decrypt(&self.k_enc, &self.data_iv(IV_LABEL_RESPONSE), ciphertext)
    }

    /// Decrypt a full-mode command payload (the tag's side of
    /// [`Self::encrypt_command_data`])
    #[cfg(feature = "mocktag")]
    pub(crate) fn decrypt_command_data(&self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        aes_cbc_decrypt(&self.k_enc, &self.data_iv(IV_LABEL_COMMAND), ciphertext)
    }

    /// Pad and encrypt a response payload (the tag's side of
    /// [`Self::decrypt_response_data`])
    #[cfg(feature = "mocktag")]
    pub(crate) fn encrypt_response_data(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let padded = pad_iso7816(plaintext);
        aes_cbc_encrypt(&self.k_enc, &self.data_iv(IV_LABEL_RESPONSE), &padded)
    }

    /// Data-phase IVs are the AES-ECB encryption of
    /// `label || TI || CC_le || 00×8` under `K_enc`
    fn data_iv(&self, label: [u8; 2]) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[0..2].copy_from_slice(&label);
        block[2..6].copy_from_slice(&self.ti);
        block[6..8].copy_from_slice(&self.counter.to_le_bytes());
        aes_ecb_encrypt_block(&self.k_enc, &block)
    }

    /// Build a channel from explicit parts, bypassing the KDF
    #[cfg(any(test, feature = "mocktag"))]
    pub(crate) fn from_parts(
        k_enc: Key,
        k_mac: Key,
        ti: [u8; 4],
        counter: u16,
        authed_slot: KeySlot,
    ) -> Self {
        Self {
            k_enc,
            k_mac,
            ti,
            counter,
            authed_slot,
        }
    }
}
