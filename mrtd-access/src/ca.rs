//! Chip Authentication (version 1, as used by Extended Access Control).
//!
//! The terminal agrees a shared secret between an ephemeral key pair and the static key pair of
//! the chip (published in DG14). Both sides derive new 3DES Secure Messaging keys from it; a chip
//! that does not hold the private key cannot continue the session.


use std::fmt;

use crypto_bigint::BoxedUint;
use digest::Digest;
use rand::{CryptoRng, RngCore};
use sha1::Sha1;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::crypt::cipher_mac::CipherSuite;
use crate::crypt::KeyExchange;
use crate::der_util::{minimal_be_bytes, tlv};
use crate::error::{CryptoError, Error, Operation};
use crate::iso7816::apdu::{Apdu, CommandHeader, Data};
use crate::kdf::derive_session_keys;
use crate::secure_messaging::{CardLink, SecureChannel};


/// The static public key of the chip together with its domain parameters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChipPublicKey {
    key_exchange: KeyExchange,
    public_key: Vec<u8>,
}
impl ChipPublicKey {
    /// Creates a chip public key.
    ///
    /// `public_key` is encoded as described at [`KeyExchange`].
    pub fn new(key_exchange: KeyExchange, public_key: Vec<u8>) -> Self {
        Self { key_exchange, public_key }
    }

    pub fn key_exchange(&self) -> &KeyExchange { &self.key_exchange }
    pub fn public_key(&self) -> &[u8] { &self.public_key }
}


/// The ephemeral key pair generated by the terminal.
#[derive(Clone, Eq, PartialEq)]
pub struct EphemeralKeyPair {
    private_key: Zeroizing<BoxedUint>,
    public_key: Zeroizing<Vec<u8>>,
}
impl EphemeralKeyPair {
    pub fn private_key(&self) -> &BoxedUint { &self.private_key }
    pub fn public_key(&self) -> &[u8] { &self.public_key }
}
impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public_key", &crate::HexBytes(&self.public_key))
            .finish_non_exhaustive()
    }
}


/// The outcome of a successful Chip Authentication; required to run Terminal Authentication.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChipAuthenticationResult {
    key_id: Option<u64>,
    chip_public_key: ChipPublicKey,
    key_hash: Vec<u8>,
    ephemeral_key_pair: EphemeralKeyPair,
}
impl ChipAuthenticationResult {
    pub fn key_id(&self) -> Option<u64> { self.key_id }
    pub fn chip_public_key(&self) -> &ChipPublicKey { &self.chip_public_key }
    pub fn ephemeral_key_pair(&self) -> &EphemeralKeyPair { &self.ephemeral_key_pair }

    /// The value identifying the ephemeral public key in the data signed during Terminal
    /// Authentication.
    pub fn key_hash(&self) -> &[u8] { &self.key_hash }
}


/// Computes the identifier of the ephemeral public key.
///
/// For DH this is the SHA-1 hash of the public value; for ECDH it is the x coordinate of the
/// point, which is not hashed.
fn ephemeral_key_hash(key_exchange: &KeyExchange, public_key: &[u8]) -> Result<Vec<u8>, Error> {
    match key_exchange {
        KeyExchange::DiffieHellman(_) => Ok(Sha1::digest(public_key).to_vec()),
        KeyExchange::PrimeWeierstrassEllipticDiffieHellman(_) => {
            // 0x04 || x || y
            let coordinates = match public_key.split_first() {
                Some((0x04, coordinates)) if coordinates.len() % 2 == 0 => coordinates,
                _ => return Err(CryptoError::InvalidPublicKey.into()),
            };
            Ok(coordinates[..coordinates.len() / 2].to_vec())
        },
    }
}


/// Sends MSE:Set KAT with the ephemeral public key and the optional key identifier.
pub fn set_key_agreement_template(link: &mut CardLink<'_>, ephemeral_public_key: &[u8], key_id: Option<u64>) -> Result<(), Error> {
    let mut request_data = tlv(0x91, ephemeral_public_key);
    if let Some(key_id) = key_id {
        request_data.extend(tlv(0x84, &minimal_be_bytes(key_id)));
    }
    let request = Apdu::new(
        // MANAGE SECURITY ENVIRONMENT: set for computation, key agreement template
        CommandHeader::new(0x00, 0x22, 0x41, 0xA6),
        Data::new(request_data, None),
    );
    link.expect_success(Operation::ChipAuthenticationSetKeyAgreementTemplate, &request)?;
    Ok(())
}


/// Performs Chip Authentication using the given ephemeral private key.
///
/// Returns the new Secure Messaging channel, which always uses 3DES with a send sequence counter
/// of zero, and the result required for Terminal Authentication.
#[instrument(skip_all)]
pub fn establish_with_key(
    link: &mut CardLink<'_>,
    chip_public_key: &ChipPublicKey,
    key_id: Option<u64>,
    private_key: Zeroizing<BoxedUint>,
) -> Result<(SecureChannel, ChipAuthenticationResult), Error> {
    let key_exchange = &chip_public_key.key_exchange;
    let public_key = key_exchange.calculate_public_key(&private_key)?;
    let shared_secret = key_exchange.exchange_keys(&private_key, &chip_public_key.public_key)?;
    let key_hash = ephemeral_key_hash(key_exchange, &public_key)?;

    set_key_agreement_template(link, &public_key, key_id)?;

    let (ks_enc, ks_mac) = derive_session_keys(&shared_secret, CipherSuite::Tdes);
    let channel = SecureChannel::new(CipherSuite::Tdes, &ks_enc, &ks_mac, 0)?;
    debug!(key_id, "Chip Authentication established");

    let result = ChipAuthenticationResult {
        key_id,
        chip_public_key: chip_public_key.clone(),
        key_hash,
        ephemeral_key_pair: EphemeralKeyPair {
            private_key,
            public_key,
        },
    };
    Ok((channel, result))
}


/// Performs Chip Authentication, drawing the ephemeral private key from `rng`.
#[instrument(skip_all)]
pub fn establish<R: RngCore + CryptoRng + ?Sized>(
    link: &mut CardLink<'_>,
    chip_public_key: &ChipPublicKey,
    key_id: Option<u64>,
    rng: &mut R,
) -> Result<(SecureChannel, ChipAuthenticationResult), Error> {
    let private_key = chip_public_key.key_exchange.generate_private_key(rng);
    establish_with_key(link, chip_public_key, key_id, private_key)
}


#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::ephemeral_key_hash;
    use crate::crypt::dh::get_rfc5114_1024_160;
    use crate::crypt::elliptic::curves::get_brainpool_p256r1;
    use crate::crypt::KeyExchange;
    use crate::error::{CryptoError, Error};

    #[test]
    fn elliptic_key_hash_is_x_coordinate() {
        let key_exchange = KeyExchange::PrimeWeierstrassEllipticDiffieHellman(get_brainpool_p256r1());
        let mut public_key = vec![0x04];
        public_key.extend([0x11; 32]);
        public_key.extend([0x22; 32]);
        assert_eq!(ephemeral_key_hash(&key_exchange, &public_key).unwrap(), vec![0x11; 32]);

        public_key[0] = 0x02;
        assert!(matches!(
            ephemeral_key_hash(&key_exchange, &public_key),
            Err(Error::CryptoFailure(CryptoError::InvalidPublicKey)),
        ));
    }

    #[test]
    fn diffie_hellman_key_hash_is_sha1() {
        let key_exchange = KeyExchange::DiffieHellman(get_rfc5114_1024_160());
        assert_eq!(
            ephemeral_key_hash(&key_exchange, b"abc").unwrap(),
            hex!("A9993E364706816ABA3E25717850C26C9CD0D89D").to_vec(),
        );
    }
}
