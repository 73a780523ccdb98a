//! Classic (finite-field) Diffie-Hellman.


use crypto_bigint::{BoxedUint, Integer};
use crypto_bigint::modular::{BoxedMontyForm, BoxedMontyParams};
use hex_literal::hex;
use zeroize_derive::ZeroizeOnDrop;

use crate::crypt::{boxed_uint_from_be_slice, uint_from_be_slice, with_precision};
use crate::error::CryptoError;


/// Diffie-Hellman domain parameters: a prime modulus, a generator of a subgroup and the order of
/// that subgroup.
///
/// All three values are stored with the precision of the prime.
#[derive(Clone, Debug, Eq, PartialEq, ZeroizeOnDrop)]
pub struct DiffieHellmanParams {
    prime: BoxedUint,
    generator: BoxedUint,
    subgroup_order: BoxedUint,
}
impl DiffieHellmanParams {
    pub fn new(prime: BoxedUint, generator: BoxedUint, subgroup_order: BoxedUint) -> Result<Self, CryptoError> {
        if !bool::from(prime.is_odd()) {
            return Err(CryptoError::InvalidDomainParameters);
        }
        let precision = prime.bits_precision();
        let generator = with_precision(&generator, precision)
            .ok_or(CryptoError::InvalidDomainParameters)?;
        let subgroup_order = with_precision(&subgroup_order, precision)
            .ok_or(CryptoError::InvalidDomainParameters)?;
        let one = BoxedUint::one_with_precision(precision);
        if generator <= one || generator >= prime || subgroup_order <= one || subgroup_order >= prime {
            return Err(CryptoError::InvalidDomainParameters);
        }
        Ok(Self { prime, generator, subgroup_order })
    }

    pub fn prime(&self) -> &BoxedUint { &self.prime }
    pub fn generator(&self) -> &BoxedUint { &self.generator }
    pub fn subgroup_order(&self) -> &BoxedUint { &self.subgroup_order }

    /// Length of the modulus in bytes; public keys and shared secrets are padded to this length.
    pub fn modulus_len_bytes(&self) -> usize {
        self.prime.bits().div_ceil(8) as usize
    }

    /// Length of the subgroup order in bytes, which is also the length of a private key.
    pub fn subgroup_size_bytes(&self) -> usize {
        self.subgroup_order.bits().div_ceil(8) as usize
    }

    fn monty_params(&self) -> Result<BoxedMontyParams, CryptoError> {
        let odd_prime = self.prime.to_odd().into_option()
            .ok_or(CryptoError::InvalidDomainParameters)?;
        Ok(BoxedMontyParams::new(odd_prime))
    }

    fn pow_mod(&self, params: &BoxedMontyParams, base: &BoxedUint, exponent: &BoxedUint) -> BoxedUint {
        BoxedMontyForm::new(base.clone(), params.clone())
            .pow(exponent)
            .retrieve()
    }

    /// Decodes the other party's public value and checks that it is a member of the subgroup.
    pub fn decode_public_key(&self, bytes: &[u8]) -> Result<BoxedUint, CryptoError> {
        if bytes.is_empty() || bytes.len() > self.modulus_len_bytes() {
            return Err(CryptoError::InvalidPublicKey);
        }
        let value = uint_from_be_slice(bytes, self.prime.bits_precision())
            .ok_or(CryptoError::InvalidPublicKey)?;
        self.validate_element(&value)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(value)
    }

    /// Checks `1 < value < p - 1` and `value^q ≡ 1 (mod p)`.
    fn validate_element(&self, value: &BoxedUint) -> Result<(), CryptoError> {
        let precision = self.prime.bits_precision();
        let one = BoxedUint::one_with_precision(precision);
        let prime_minus_one = self.prime.wrapping_sub(&one);
        if *value <= one || *value >= prime_minus_one {
            return Err(CryptoError::InvalidPublicKey);
        }
        let params = self.monty_params()?;
        if self.pow_mod(&params, value, &self.subgroup_order) != one {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(())
    }

    /// Calculates `g^x mod p`.
    pub fn calculate_public_key(&self, private_key: &BoxedUint) -> Result<BoxedUint, CryptoError> {
        let params = self.monty_params()?;
        let public_key = self.pow_mod(&params, &self.generator, private_key);
        if public_key <= BoxedUint::one_with_precision(self.prime.bits_precision()) {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(public_key)
    }

    /// Calculates `y^x mod p` for the other party's public value `y`.
    pub fn diffie_hellman(&self, private_key: &BoxedUint, other_public_key: &BoxedUint) -> Result<BoxedUint, CryptoError> {
        let params = self.monty_params()?;
        let other = with_precision(other_public_key, self.prime.bits_precision())
            .ok_or(CryptoError::InvalidPublicKey)?;
        let shared_secret = self.pow_mod(&params, &other, private_key);
        let one = BoxedUint::one_with_precision(self.prime.bits_precision());
        if shared_secret <= one {
            return Err(CryptoError::InvalidSharedSecret);
        }
        Ok(shared_secret)
    }

    /// Derives the ephemeral parameters of the Generic Mapping: `g~ = g^s · h mod p`.
    pub fn derive_generic_mapping(&self, nonce: &BoxedUint, shared_secret: &BoxedUint) -> Result<Self, CryptoError> {
        let params = self.monty_params()?;
        let shared = with_precision(shared_secret, self.prime.bits_precision())
            .ok_or(CryptoError::InvalidSharedSecret)?;
        let g_to_s = BoxedMontyForm::new(self.generator.clone(), params.clone()).pow(nonce);
        let h = BoxedMontyForm::new(shared, params);
        let mapped_generator = (&g_to_s * &h).retrieve();

        let one = BoxedUint::one_with_precision(self.prime.bits_precision());
        if mapped_generator <= one {
            return Err(CryptoError::InvalidSharedSecret);
        }
        Ok(Self {
            prime: self.prime.clone(),
            generator: mapped_generator,
            subgroup_order: self.subgroup_order.clone(),
        })
    }
}


/// The 1024-bit MODP group with 160-bit prime order subgroup from RFC 5114 § 2.1 (standardized
/// domain parameter ID 0).
pub fn get_rfc5114_1024_160() -> DiffieHellmanParams {
    let prime = boxed_uint_from_be_slice(&hex!("
        B10B8F96 A080E01D DE92DE5E AE5D54EC 52C99FBC FB06A3C6 9A6A9DCA 52D23B61
        6073E286 75A23D18 9838EF1E 2EE652C0 13ECB4AE A9061123 24975C3C D49B83BF
        ACCBDD7D 90C4BD70 98488E9C 219A7372 4EFFD6FA E5644738 FAA31A4F F55BCCC0
        A151AF5F 0DC8B4BD 45BF37DF 365C1A65 E68CFDA7 6D4DA708 DF1FB2BC 2E4A4371
    "));
    let generator = boxed_uint_from_be_slice(&hex!("
        A4D1CBD5 C3FD3412 6765A442 EFB99905 F8104DD2 58AC507F D6406CFF 14266D31
        266FEA1E 5C41564B 777E690F 5504F213 160217B4 B01B886A 5E91547F 9E2749F4
        D7FBD7D3 B9A92EE1 909D0D22 63F80A76 A6A24C08 7A091F53 1DBF0A01 69B6A28A
        D662A4D1 8E73AFA3 2D779D59 18D08BC8 858F4DCE F97C2A24 855E6EEB 22B3B2E5
    "));
    let subgroup_order = boxed_uint_from_be_slice(&hex!("
        F518AA87 81A8DF27 8ABA4E7D 64B7CB9D 49462353
    "));
    DiffieHellmanParams::new(prime, generator, subgroup_order)
        .expect("RFC 5114 group parameters are well-formed")
}


#[cfg(test)]
mod tests {
    use crypto_bigint::BoxedUint;
    use hex_literal::hex;

    use super::{DiffieHellmanParams, get_rfc5114_1024_160};
    use crate::crypt::boxed_uint_from_be_slice;
    use crate::error::CryptoError;

    fn small(value: u8) -> BoxedUint {
        boxed_uint_from_be_slice(&[value])
    }

    #[test]
    fn toy_group() {
        // 4 generates the subgroup of order 11 in (Z/23Z)*
        let params = DiffieHellmanParams::new(small(23), small(4), small(11)).unwrap();

        let alice_public = params.calculate_public_key(&small(3)).unwrap();
        assert_eq!(alice_public, small(64 % 23));
        let bob_public = params.calculate_public_key(&small(5)).unwrap();
        assert_eq!(bob_public, small((4u32.pow(5) % 23) as u8));

        let alice_secret = params.diffie_hellman(&small(3), &bob_public).unwrap();
        let bob_secret = params.diffie_hellman(&small(5), &alice_public).unwrap();
        assert_eq!(alice_secret, bob_secret);
        assert_eq!(alice_secret, small((4u32.pow(15) % 23) as u8));
    }

    #[test]
    fn rejects_non_members() {
        let params = DiffieHellmanParams::new(small(23), small(4), small(11)).unwrap();
        assert_eq!(params.decode_public_key(&[0x01]), Err(CryptoError::InvalidPublicKey));
        assert_eq!(params.decode_public_key(&[22]), Err(CryptoError::InvalidPublicKey));
        // 5 is a generator of the whole group, not of the subgroup of order 11
        assert_eq!(params.decode_public_key(&[5]), Err(CryptoError::InvalidPublicKey));
        assert_eq!(params.decode_public_key(&[0x00, 0x00]), Err(CryptoError::InvalidPublicKey));
        assert!(params.decode_public_key(&[2]).is_ok());
    }

    #[test]
    fn rejects_even_modulus() {
        assert_eq!(
            DiffieHellmanParams::new(small(24), small(5), small(11)),
            Err(CryptoError::InvalidDomainParameters),
        );
    }

    #[test]
    fn icao_doc9303_part11_secg2_example() {
        let params = get_rfc5114_1024_160();
        assert_eq!(params.modulus_len_bytes(), 128);
        assert_eq!(params.subgroup_size_bytes(), 20);

        let terminal_private = boxed_uint_from_be_slice(&hex!("
            5265030F 751F4AD1 8B08AC56 5FC7AC95 2E41618D
        "));
        let chip_private = boxed_uint_from_be_slice(&hex!("
            66DDAFEA C1609CB5 B963BB0C B3FF8B3E 047F336C
        "));

        let terminal_public = params.calculate_public_key(&terminal_private).unwrap();
        assert_eq!(
            terminal_public,
            boxed_uint_from_be_slice(&hex!("
                23FB3749 EA030D2A 25B278D2 A562047A DE3F01B7 4F17A154 02CB7352 CA7D2B3E
                B71C343D B13D1DEB CE9A3666 DBCFC920 B49174A6 02CB4796 5CAA73DC 702489A4
                4D41DB91 4DE9613D C5E98C94 160551C0 DF86274B 9359BC04 90D01B03 AD54022D
                CB4F57FA D6322497 D7A1E28D 46710F46 1AFE710F BBBC5F8B A166F431 1975EC6C
            ")),
        );
        let chip_public = params.calculate_public_key(&chip_private).unwrap();

        let terminal_secret = params.diffie_hellman(&terminal_private, &chip_public).unwrap();
        let chip_secret = params.diffie_hellman(&chip_private, &terminal_public).unwrap();
        assert_eq!(terminal_secret, chip_secret);
        assert_eq!(
            terminal_secret,
            boxed_uint_from_be_slice(&hex!("
                5BABEBEF 5B74E5BA 94B5C063 FDA15F1F 1CDE9487 3EE0A5D3 A2FCAB49 F258D07F
                544F13CB 66658C3A FEE9E727 389BE3F6 CBBBD321 28A8C21D D6EEA3CF 7091CDDF
                B08B8D00 7D40318D CCA4FFBF 51208790 FB4BD111 E5A968ED 6B6F08B2 6CA87C41
                0B3CE0C3 10CE104E ABD16629 AA48620C 1279270C B0750C0D 37C57FFF E302AE7F
            ")),
        );
    }
}
