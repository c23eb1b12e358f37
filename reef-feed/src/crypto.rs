//! Pod key derivation and feed payload encryption.

use std::fmt;

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sha3::Keccak256;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type HmacKeccak256 = Hmac<Keccak256>;

/// Domain separation salt for pod key derivation.
const POD_KEY_SALT: &[u8] = b"fds/pod/v1";

/// Length of the authentication tag appended to every feed payload.
pub(crate) const TAG_LEN: usize = 32;

/// The symmetric key material of one pod.
///
/// Derived from the pod password with HKDF-SHA256; the first half keys the
/// AES-256-CTR payload cipher, the second half the Keccak-256 HMAC that
/// authenticates the ciphertext.
#[derive(Clone, PartialEq, Eq)]
pub struct PodKey {
    enc: [u8; 32],
    mac: [u8; 32],
}

impl PodKey {
    /// Derive the key for a pod from its password.
    pub fn derive(password: &str) -> Self {
        let hk = Hkdf::<Sha256>::new(Some(POD_KEY_SALT), password.as_bytes());
        let mut okm = [0u8; 64];
        hk.expand(&[], &mut okm)
            .expect("64 bytes is a valid HKDF-SHA256 output length");
        let mut enc = [0u8; 32];
        let mut mac = [0u8; 32];
        enc.copy_from_slice(&okm[..32]);
        mac.copy_from_slice(&okm[32..]);
        PodKey { enc, mac }
    }

    /// Encrypt or decrypt `data` in place. CTR mode is an involution, so the
    /// same call serves both directions.
    pub(crate) fn apply_keystream(&self, nonce: &[u8; 16], data: &mut [u8]) {
        let mut cipher = Aes256Ctr::new(&self.enc.into(), nonce.into());
        cipher.apply_keystream(data);
    }

    /// Authentication tag over `data`.
    pub(crate) fn tag(&self, data: &[u8]) -> [u8; TAG_LEN] {
        let mut mac = HmacKeccak256::new_from_slice(&self.mac)
            .expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    /// Verify `tag` over `data` in constant time.
    pub(crate) fn verify_tag(&self, data: &[u8], tag: &[u8]) -> bool {
        let mut mac = match HmacKeccak256::new_from_slice(&self.mac) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(data);
        mac.verify_slice(tag).is_ok()
    }
}

impl fmt::Debug for PodKey {
    // key material never lands in logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PodKey(..)")
    }
}
