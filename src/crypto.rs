//! Cryptographic primitives used by EV2 secure messaging: AES-128 in CBC
//! and single-block ECB, AES-CMAC with the NXP tag truncation, ISO 7816-4
//! padding, and the JAMCRC variant of CRC-32 used by `ChangeKey`.

use aes::cipher::{
    block_padding::NoPadding, generic_array::GenericArray, BlockDecryptMut, BlockEncrypt,
    BlockEncryptMut, KeyInit, KeyIvInit,
};
use aes::Aes128;
use cmac::{Cmac, Mac};
use subtle::ConstantTimeEq;

use crate::error::{invalid_arg, Error};
use crate::key::Key;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Size of a truncated wire MAC
pub const MAC_LEN: usize = 8;

/// An all-zero IV, used for the authentication-phase CBC operations
pub const ZERO_IV: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

/// AES-128-CBC encrypt without padding. The input length must be a
/// positive multiple of 16; the output has the same length.
pub fn aes_cbc_encrypt(key: &Key, iv: &[u8; BLOCK_SIZE], data: &[u8]) -> Result<Vec<u8>, Error> {
    check_block_aligned(data)?;

    let mut buf = data.to_vec();
    Aes128CbcEnc::new(key.as_bytes().into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(&mut buf, data.len())
        .map_err(|_| invalid_arg!("CBC input not block aligned"))?;
    Ok(buf)
}

/// AES-128-CBC decrypt without padding removal; the caller slices.
pub fn aes_cbc_decrypt(key: &Key, iv: &[u8; BLOCK_SIZE], data: &[u8]) -> Result<Vec<u8>, Error> {
    check_block_aligned(data)?;

    let mut buf = data.to_vec();
    Aes128CbcDec::new(key.as_bytes().into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|_| invalid_arg!("CBC input not block aligned"))?;
    Ok(buf)
}

/// Encrypt a single 16-byte block with AES-128-ECB. Only used to derive
/// the data-phase CBC IVs from the transaction identifier and counter.
pub fn aes_ecb_encrypt_block(key: &Key, block: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let cipher = Aes128::new(key.as_bytes().into());
    let mut out = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut out);
    out.into()
}

/// AES-CMAC (RFC 4493). Zero-length messages are valid input.
pub fn aes_cmac(key: &Key, message: &[u8]) -> [u8; BLOCK_SIZE] {
    let mut mac = <Cmac<Aes128> as Mac>::new(key.as_bytes().into());
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// A truncated 8-byte wire MAC.
///
/// The tag transmits only the odd-indexed bytes of the 16-byte CMAC
/// output; the full tag never appears on the wire. Comparison is
/// constant-time.
#[derive(Clone, Debug, Eq)]
pub struct WireMac([u8; MAC_LEN]);

impl WireMac {
    /// Truncate a full CMAC tag to its wire form: bytes 1, 3, 5, ..., 15
    pub fn truncate(tag: &[u8; BLOCK_SIZE]) -> Self {
        let mut mac = [0u8; MAC_LEN];
        for (i, byte) in mac.iter_mut().enumerate() {
            *byte = tag[2 * i + 1];
        }
        WireMac(mac)
    }

    /// Wrap an 8-byte wire MAC received from the tag
    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        if slice.len() != MAC_LEN {
            return Err(invalid_arg!(
                "expected an {}-byte MAC, got {}",
                MAC_LEN,
                slice.len()
            ));
        }

        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(slice);
        Ok(WireMac(mac))
    }

    /// Borrow the MAC bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq for WireMac {
    fn eq(&self, other: &WireMac) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

/// ISO/IEC 7816-4 padding method 2: append `0x80`, then zeros to the next
/// 16-byte boundary. Padding is always added, so block-aligned input grows
/// by a full block.
pub fn pad_iso7816(data: &[u8]) -> Vec<u8> {
    let padded_len = (data.len() / BLOCK_SIZE + 1) * BLOCK_SIZE;
    let mut padded = Vec::with_capacity(padded_len);
    padded.extend_from_slice(data);
    padded.push(0x80);
    padded.resize(padded_len, 0x00);
    padded
}

/// CRC-32/JAMCRC, little-endian.
///
/// Reflected CRC-32 with the IEEE 802.3 polynomial and initial value
/// `0xFFFFFFFF`, but without the final complement, emitted as four
/// little-endian bytes. Equivalently: the byte-wise complement of the
/// little-endian IEEE CRC-32. The tag checks this over the new key in the
/// XOR form of `ChangeKey`.
pub fn crc32_jam(data: &[u8]) -> [u8; 4] {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    crc.to_le_bytes()
}

/// Rotate a 16-byte value left by one whole byte:
/// `b[1..16] || b[0..1]`. Both ends of the EV2 handshake apply this to
/// the nonces before echoing them back.
pub fn rotate_left_1(block: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..15].copy_from_slice(&block[1..]);
    out[15] = block[0];
    out
}

/// Strip ISO/IEC 7816-4 padding: drop trailing zeros and the `0x80`
/// marker. Returns `None` when no marker is present.
pub fn unpad_iso7816(data: &[u8]) -> Option<&[u8]> {
    let marker = data.iter().rposition(|&b| b != 0x00)?;
    if data[marker] != 0x80 {
        return None;
    }
    Some(&data[..marker])
}

/// Extract bits `lo..=hi` of a byte, shifted down to the low end
pub fn bits(byte: u8, lo: u8, hi: u8) -> u8 {
    debug_assert!(lo <= hi && hi < 8);
    (byte >> lo) & ((1u16 << (hi - lo + 1)) - 1) as u8
}

fn check_block_aligned(data: &[u8]) -> Result<(), Error> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(invalid_arg!(
            "cipher input of {} bytes is not a positive multiple of {}",
            data.len(),
            BLOCK_SIZE
        ));
    }
    Ok(())
}
