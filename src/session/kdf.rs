//! EV2 session-key derivation.
//!
//! After the mutual challenge exchange both sides hold the two 16-byte
//! nonces `RandA` (host) and `RandB` (tag). Each session key is the
//! AES-CMAC of a 32-byte labelled derivation input over the
//! authentication key, per NIST SP 800-108 in CMAC mode with NXP's fixed
//! input layout.

use zeroize::Zeroizing;

use crate::crypto::aes_cmac;
use crate::key::Key;

/// Label selecting the encryption session key (SV1)
const SV_ENC_LABEL: [u8; 2] = [0xA5, 0x5A];

/// Label selecting the MAC session key (SV2)
const SV_MAC_LABEL: [u8; 2] = [0x5A, 0xA5];

/// Fixed part following the label: KDF counter `0001`, length `0080` bits
const SV_SUFFIX: [u8; 4] = [0x00, 0x01, 0x00, 0x80];

/// Derive `(K_enc, K_mac)` for a session from the authentication key and
/// the two nonces
pub(crate) fn derive_session_keys(
    auth_key: &Key,
    rand_a: &[u8; 16],
    rand_b: &[u8; 16],
) -> (Key, Key) {
    let sv1 = session_vector(SV_ENC_LABEL, rand_a, rand_b);
    let sv2 = session_vector(SV_MAC_LABEL, rand_a, rand_b);

    let k_enc = Key::new(aes_cmac(auth_key, &sv1[..]));
    let k_mac = Key::new(aes_cmac(auth_key, &sv2[..]));
    (k_enc, k_mac)
}

/// Assemble a 32-byte derivation input:
///
/// ```text
/// label || 00 01 00 80 || RandA[0..2] || RandA[2..8] xor RandB[0..6]
///       || RandB[6..16] || RandA[8..16]
/// ```
fn session_vector(label: [u8; 2], rand_a: &[u8; 16], rand_b: &[u8; 16]) -> Zeroizing<[u8; 32]> {
    let mut sv = Zeroizing::new([0u8; 32]);
    sv[0..2].copy_from_slice(&label);
    sv[2..6].copy_from_slice(&SV_SUFFIX);
    sv[6..8].copy_from_slice(&rand_a[0..2]);
    for i in 0..6 {
        sv[8 + i] = rand_a[2 + i] ^ rand_b[i];
    }
    sv[14..24].copy_from_slice(&rand_b[6..16]);
    sv[24..32].copy_from_slice(&rand_a[8..16]);
    sv
}
