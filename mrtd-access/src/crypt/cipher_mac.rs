//! Cipher and MAC (message authentication code) combinations.


use std::fmt;

use aes::{Aes128, Aes192, Aes256};
use block_padding::NoPadding;
use cipher::{BlockModeDecrypt, BlockModeEncrypt, KeyIvInit};
use cmac::Cmac;
use des::{Des, TdesEde2};
use digest::{KeyInit, Mac};
use retail_mac::RetailMac;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::CryptoError;


/// The cipher suites used for Secure Messaging and key derivation.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CipherSuite {
    /// Two-key 3DES in CBC mode with Retail MAC.
    Tdes,

    /// AES-128 in CBC mode with CMAC.
    Aes128,

    /// AES-192 in CBC mode with CMAC.
    Aes192,

    /// AES-256 in CBC mode with CMAC.
    Aes256,
}
impl CipherSuite {
    pub fn cipher_and_mac(&self) -> &'static dyn CipherAndMac {
        match self {
            Self::Tdes => &Cam3Des,
            Self::Aes128 => &CamAes128,
            Self::Aes192 => &CamAes192,
            Self::Aes256 => &CamAes256,
        }
    }

    /// Size of the cipher key in bytes.
    pub fn key_size(&self) -> usize {
        self.cipher_and_mac().cipher_key_size()
    }

    /// Block size of the cipher in bytes.
    pub fn block_size(&self) -> usize {
        self.cipher_and_mac().cipher_block_size()
    }

    pub fn is_aes(&self) -> bool {
        !matches!(self, Self::Tdes)
    }
}
impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Tdes => "3DES",
            Self::Aes128 => "AES-128",
            Self::Aes192 => "AES-192",
            Self::Aes256 => "AES-256",
        };
        f.write_str(name)
    }
}


/// Pads data according to ISO/IEC 9797-1 padding method 2: a single `0x80` byte followed by as
/// many `0x00` bytes as necessary to reach a multiple of the block size.
///
/// A full block of padding is appended if the data already is a multiple of the block size.
pub fn pad(data: &[u8], block_size: usize) -> Vec<u8> {
    let padded_len = (data.len() / block_size + 1) * block_size;
    let mut ret = Vec::with_capacity(padded_len);
    ret.extend_from_slice(data);
    ret.push(0x80);
    ret.resize(padded_len, 0x00);
    ret
}


/// Strips ISO/IEC 9797-1 padding method 2.
pub fn unpad(data: &[u8]) -> Result<&[u8], CryptoError> {
    let trailing_zeroes = data.iter().rev().take_while(|b| **b == 0x00).count();
    match data[..data.len() - trailing_zeroes].split_last() {
        Some((0x80, unpadded)) => Ok(unpadded),
        _ => Err(CryptoError::InvalidPadding),
    }
}


/// A combination of cipher and MAC usable during authentication and Secure Messaging.
pub trait CipherAndMac {
    /// Size of the cipher key in bytes.
    fn cipher_key_size(&self) -> usize;

    /// Block size of the cipher in bytes.
    fn cipher_block_size(&self) -> usize;

    /// Block size of the MAC in bytes; 1 if the MAC algorithm pads internally (CMAC).
    fn mac_block_size(&self) -> usize;

    /// Decrypts data in-place using the given key and CBC IV.
    ///
    /// Does not strip padding.
    fn decrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), CryptoError>;

    /// Encrypts pre-padded data in-place using the given key and CBC IV.
    fn encrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), CryptoError>;

    /// Generates an 8-byte MAC for the given data, which must already be padded if the MAC
    /// algorithm requires it.
    fn mac_padded_data(&self, data: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError>;

    /// Verifies in constant time whether the given data fits the given MAC.
    fn verify_mac_padded_data(&self, data: &[u8], key: &[u8], expected_mac: &[u8]) -> Result<bool, CryptoError> {
        let computed_mac = self.mac_padded_data(data, key)?;
        Ok(computed_mac.as_slice().ct_eq(expected_mac).into())
    }
}


fn check_lengths(data: &[u8], key: &[u8], iv: &[u8], key_size: usize, block_size: usize) -> Result<(), CryptoError> {
    if key.len() != key_size {
        return Err(CryptoError::InvalidKeyLength { expected: key_size, obtained: key.len() });
    }
    if iv.len() != block_size || data.len() % block_size != 0 {
        return Err(CryptoError::InvalidDataLength { block_size, obtained: data.len() });
    }
    Ok(())
}

macro_rules! cbc_impl {
    ($cipher:ty) => {
        fn decrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), CryptoError> {
            check_lengths(data, key, iv, self.cipher_key_size(), self.cipher_block_size())?;
            let decryptor = cbc::Decryptor::<$cipher>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidKeyLength { expected: self.cipher_key_size(), obtained: key.len() })?;
            let data_len = data.len();
            decryptor.decrypt_padded::<NoPadding>(data)
                .map_err(|_| CryptoError::InvalidDataLength { block_size: self.cipher_block_size(), obtained: data_len })?;
            Ok(())
        }

        fn encrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), CryptoError> {
            check_lengths(data, key, iv, self.cipher_key_size(), self.cipher_block_size())?;
            let encryptor = cbc::Encryptor::<$cipher>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidKeyLength { expected: self.cipher_key_size(), obtained: key.len() })?;
            let data_len = data.len();
            encryptor.encrypt_padded::<NoPadding>(data, data_len)
                .map_err(|_| CryptoError::InvalidDataLength { block_size: self.cipher_block_size(), obtained: data_len })?;
            Ok(())
        }
    };
}


/// 3DES-based cipher and MAC.
///
/// 3DES is used in EDE two-key mode:
/// ```plain
/// encrypt((K1, K2), D) = encrypt(K1, decrypt(K2, encrypt(K1, D)))
/// ```
/// The MAC is Retail MAC (ISO/IEC 9797-1 algorithm 3) with DES and zero IV; the caller pads with
/// method 2.
pub struct Cam3Des;
impl CipherAndMac for Cam3Des {
    fn cipher_key_size(&self) -> usize { 16 }
    fn cipher_block_size(&self) -> usize { 8 }
    fn mac_block_size(&self) -> usize { 8 }

    cbc_impl!(TdesEde2);

    fn mac_padded_data(&self, data: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let mut mac = <RetailMac<Des> as KeyInit>::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength { expected: 16, obtained: key.len() })?;
        Mac::update(&mut mac, data);
        Ok(Zeroizing::new(mac.finalize().into_bytes().to_vec()))
    }
}


macro_rules! aes_cam {
    ($name:ident, $cipher:ty, $key_size:expr, $doc:literal) => {
        #[doc = $doc]
        ///
        /// The MAC is CMAC truncated to the initial 8 bytes.
        pub struct $name;
        impl CipherAndMac for $name {
            fn cipher_key_size(&self) -> usize { $key_size }
            fn cipher_block_size(&self) -> usize { 16 }
            fn mac_block_size(&self) -> usize { 1 }

            cbc_impl!($cipher);

            fn mac_padded_data(&self, data: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
                let mut mac = <Cmac<$cipher> as KeyInit>::new_from_slice(key)
                    .map_err(|_| CryptoError::InvalidKeyLength { expected: $key_size, obtained: key.len() })?;
                Mac::update(&mut mac, data);
                let full_mac = Zeroizing::new(mac.finalize().into_bytes().to_vec());
                Ok(Zeroizing::new(full_mac[..8].to_vec()))
            }
        }
    };
}

aes_cam!(CamAes128, Aes128, 16, "AES-128-based cipher (CBC mode) and MAC.");
aes_cam!(CamAes192, Aes192, 24, "AES-192-based cipher (CBC mode) and MAC.");
aes_cam!(CamAes256, Aes256, 32, "AES-256-based cipher (CBC mode) and MAC.");
