//! Cryptographic functionality.


pub mod cipher_mac;
pub mod dh;
pub mod elliptic;


use crypto_bigint::BoxedUint;
use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::crypt::dh::DiffieHellmanParams;
use crate::crypt::elliptic::PrimeWeierstrassCurve;
use crate::error::CryptoError;


/// A key exchange method together with its domain parameters.
///
/// Private keys are unsigned integers, serialized in big-endian byte order.
///
/// For classic Diffie-Hellman, public keys and shared secrets are unsigned integers in big-endian
/// byte order, left-padded to the length of the modulus.
///
/// For elliptic-curve Diffie-Hellman, public keys are points in uncompressed encoding:
/// 1. the byte `0x04`
/// 2. the x coordinate as an unsigned integer in big-endian byte order
/// 3. the y coordinate as an unsigned integer in big-endian byte order
///
/// with both coordinates left-padded to the byte length of the field prime. Shared secrets are the
/// x coordinate of the resulting point, padded the same way.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KeyExchange {
    DiffieHellman(DiffieHellmanParams),
    PrimeWeierstrassEllipticDiffieHellman(PrimeWeierstrassCurve),
}
impl KeyExchange {
    /// Returns the recommended number of bytes for a private key using this key exchange method.
    pub fn private_key_len_bytes(&self) -> usize {
        match self {
            Self::DiffieHellman(dhp) => dhp.subgroup_size_bytes(),
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => curve.field_size_bytes(),
        }
    }

    /// Draws a fresh private key of [`private_key_len_bytes`](Self::private_key_len_bytes) random
    /// bytes.
    pub fn generate_private_key<R: RngCore + CryptoRng + ?Sized>(&self, rng: &mut R) -> Zeroizing<BoxedUint> {
        let mut bytes = Zeroizing::new(vec![0u8; self.private_key_len_bytes()]);
        rng.fill_bytes(bytes.as_mut_slice());
        Zeroizing::new(boxed_uint_from_be_slice(&bytes))
    }

    /// Calculates the public key for the given private key, serialized to bytes.
    pub fn calculate_public_key(&self, private_key: &BoxedUint) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        match self {
            Self::DiffieHellman(dhp) => {
                let public_key = Zeroizing::new(dhp.calculate_public_key(private_key)?);
                be_bytes_fixed(&public_key, dhp.modulus_len_bytes())
                    .ok_or(CryptoError::InvalidPublicKey)
            },
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => {
                let public_key = curve.calculate_public_key(private_key)?;
                curve.encode_point(&public_key)
            },
        }
    }

    /// Performs the key agreement between our private key and the other party's public key.
    pub fn exchange_keys(&self, private_key: &BoxedUint, other_public_key: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        match self {
            Self::DiffieHellman(dhp) => {
                let other = dhp.decode_public_key(other_public_key)?;
                let shared_secret = Zeroizing::new(dhp.diffie_hellman(private_key, &other)?);
                be_bytes_fixed(&shared_secret, dhp.modulus_len_bytes())
                    .ok_or(CryptoError::InvalidSharedSecret)
            },
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => {
                let other = curve.decode_point(other_public_key)?;
                let shared_secret = curve.diffie_hellman(private_key, &other)?;
                be_bytes_fixed(shared_secret.x(), curve.field_size_bytes())
                    .ok_or(CryptoError::InvalidSharedSecret)
            },
        }
    }

    /// Derives the ephemeral domain parameters of the Generic Mapping.
    ///
    /// The shared secret `H` is agreed between our private key and the other party's public key
    /// under the current parameters; the new generator is `G~ = s·G + H` (elliptic curves) or
    /// `g~ = g^s · h` (finite fields) for the nonce `s`. Both coordinates of `H` are needed on
    /// elliptic curves, which is why the key agreement happens in here instead of going through
    /// [`Self::exchange_keys`].
    pub fn derive_generic_mapping(&self, nonce: &BoxedUint, private_key: &BoxedUint, other_public_key: &[u8]) -> Result<Self, CryptoError> {
        match self {
            Self::DiffieHellman(dhp) => {
                let other = dhp.decode_public_key(other_public_key)?;
                let shared_secret = Zeroizing::new(dhp.diffie_hellman(private_key, &other)?);
                Ok(Self::DiffieHellman(dhp.derive_generic_mapping(nonce, &shared_secret)?))
            },
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => {
                let other = curve.decode_point(other_public_key)?;
                let shared_secret = curve.diffie_hellman(private_key, &other)?;
                Ok(Self::PrimeWeierstrassEllipticDiffieHellman(curve.derive_generic_mapping(nonce, &shared_secret)?))
            },
        }
    }

    /// The tag of the public key data object within a public key template (`7F49`).
    pub fn public_key_tag(&self) -> u8 {
        match self {
            Self::DiffieHellman(_) => 0x84, // Diffie-Hellman public value
            Self::PrimeWeierstrassEllipticDiffieHellman(_) => 0x86, // elliptic curve point
        }
    }

    pub fn is_elliptic(&self) -> bool {
        matches!(self, Self::PrimeWeierstrassEllipticDiffieHellman(_))
    }
}


/// Decodes a big-endian unsigned integer with a precision of exactly the bits it occupies
/// (at least one byte).
pub fn boxed_uint_from_be_slice(slice: &[u8]) -> BoxedUint {
    let bits: u32 = (8 * slice.len().max(1)).try_into()
        .expect("integer byte length fits into u32");
    BoxedUint::from_be_slice(slice, bits)
        .expect("precision covers every input byte")
}


/// Decodes a big-endian unsigned integer into the given precision.
///
/// Leading zero bytes are skipped; returns `None` if the value does not fit.
pub fn uint_from_be_slice(slice: &[u8], bits_precision: u32) -> Option<BoxedUint> {
    let leading_zeroes = slice.iter().take_while(|b| **b == 0x00).count();
    BoxedUint::from_be_slice(&slice[leading_zeroes..], bits_precision).ok()
}


/// Re-encodes an integer with the given precision; returns `None` if the value does not fit.
pub fn with_precision(value: &BoxedUint, bits_precision: u32) -> Option<BoxedUint> {
    let bytes = Zeroizing::new(value.to_be_bytes());
    uint_from_be_slice(&bytes, bits_precision)
}


/// Encodes an integer into exactly `length` big-endian bytes.
///
/// Returns `None` if the value needs more than `length` bytes.
pub fn be_bytes_fixed(value: &BoxedUint, length: usize) -> Option<Zeroizing<Vec<u8>>> {
    let bytes = Zeroizing::new(value.to_be_bytes());
    let leading_zeroes = bytes.iter().take_while(|b| **b == 0x00).count();
    let significant = &bytes[leading_zeroes..];
    if significant.len() > length {
        return None;
    }
    let mut ret = Zeroizing::new(vec![0u8; length]);
    ret[length - significant.len()..].copy_from_slice(significant);
    Some(ret)
}


#[cfg(test)]
mod tests {
    use crypto_bigint::BoxedUint;
    use hex_literal::hex;

    use super::{be_bytes_fixed, boxed_uint_from_be_slice, uint_from_be_slice};

    #[test]
    fn fixed_length_encoding() {
        let value = boxed_uint_from_be_slice(&hex!("0102"));
        assert_eq!(be_bytes_fixed(&value, 4).unwrap().as_slice(), &hex!("00000102"));
        assert_eq!(be_bytes_fixed(&value, 2).unwrap().as_slice(), &hex!("0102"));
        assert!(be_bytes_fixed(&value, 1).is_none());

        // precision wider than the requested length
        let wide = uint_from_be_slice(&hex!("00 00 FF"), 576).unwrap();
        assert_eq!(be_bytes_fixed(&wide, 66).unwrap().len(), 66);
        assert_eq!(be_bytes_fixed(&BoxedUint::zero(), 2).unwrap().as_slice(), &[0, 0]);
    }

    #[test]
    fn precision_overflow() {
        assert!(uint_from_be_slice(&hex!("0000 01 0000"), 16).is_none());
        assert!(uint_from_be_slice(&hex!("0000 FFFF"), 16).is_some());
    }
}
