//! Key derivation function shared by BAC, PACE and Chip Authentication.
//!
//! The KDF is equivalent to:
//! ```plain
//! keydata = H(secret || be32(counter))[0..key_length]
//! ```
//! where `H` is SHA-1 for 3DES and AES-128 and SHA-256 for AES-192 and AES-256. For 3DES, the
//! key is used in EDE two-key mode (`K1 = keydata[0..8]`, `K2 = keydata[8..16]`, `K3 = K1`) and
//! every byte is adjusted to odd parity.


use digest::Digest;
use sha1::Sha1;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::crypt::cipher_mac::CipherSuite;


/// The purpose of a derived key, encoded as the counter appended to the secret.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum KeyPurpose {
    /// Session key for encryption.
    Encryption = 1,

    /// Session key for message authentication.
    Mac = 2,

    /// Static key derived from a PACE password.
    Password = 3,
}
impl KeyPurpose {
    pub const fn counter(&self) -> u32 {
        *self as u32
    }
}


/// Derives a key of the length appropriate for the given cipher suite.
pub fn derive_key(secret: &[u8], purpose: KeyPurpose, suite: CipherSuite) -> Zeroizing<Vec<u8>> {
    let counter = purpose.counter().to_be_bytes();
    let key_length = suite.key_size();
    let mut key = match suite {
        CipherSuite::Tdes|CipherSuite::Aes128 => {
            let mut hasher = Sha1::new();
            hasher.update(secret);
            hasher.update(counter);
            let digest = Zeroizing::new(hasher.finalize().to_vec());
            Zeroizing::new(digest[..key_length].to_vec())
        },
        CipherSuite::Aes192|CipherSuite::Aes256 => {
            let mut hasher = Sha256::new();
            hasher.update(secret);
            hasher.update(counter);
            let digest = Zeroizing::new(hasher.finalize().to_vec());
            Zeroizing::new(digest[..key_length].to_vec())
        },
    };
    if suite == CipherSuite::Tdes {
        adjust_parity(&mut key);
    }
    key
}

/// Derives the pair of session keys (encryption, MAC) from a shared secret.
pub fn derive_session_keys(secret: &[u8], suite: CipherSuite) -> (Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>) {
    (
        derive_key(secret, KeyPurpose::Encryption, suite),
        derive_key(secret, KeyPurpose::Mac, suite),
    )
}


/// Sets the least significant bit of each byte so that the byte has an odd number of set bits.
fn adjust_parity(key: &mut [u8]) {
    for b in key.iter_mut() {
        let upper_ones = (*b >> 1).count_ones();
        *b = (*b & 0b1111_1110) | u8::from(upper_ones % 2 == 0);
    }
}
