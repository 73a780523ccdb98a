//! Elliptic-curve cryptography over prime fields.


pub mod curves;


use crypto_bigint::{BoxedUint, Integer};
use crypto_bigint::modular::{BoxedMontyForm, BoxedMontyParams};
use zeroize::Zeroizing;
use zeroize_derive::ZeroizeOnDrop;

use crate::crypt::{be_bytes_fixed, boxed_uint_from_be_slice, uint_from_be_slice, with_precision};
use crate::error::CryptoError;


/// A point in affine coordinates.
#[derive(Clone, Debug, Eq, PartialEq, ZeroizeOnDrop)]
pub struct AffinePoint {
    x: BoxedUint,
    y: BoxedUint,
}
impl AffinePoint {
    pub const fn new(x: BoxedUint, y: BoxedUint) -> Self {
        Self { x, y }
    }

    pub fn x(&self) -> &BoxedUint { &self.x }
    pub fn y(&self) -> &BoxedUint { &self.y }
}


/// A point in projective coordinates `(X : Y : Z)`, each in Montgomery form.
///
/// The point at infinity is `(0 : 1 : 0)`.
#[derive(Clone, Debug)]
struct ProjectivePoint {
    x: BoxedMontyForm,
    y: BoxedMontyForm,
    z: BoxedMontyForm,
}


/// Curve parameters converted into Montgomery form once per operation.
#[derive(Clone, Debug)]
struct MontyCurve {
    params: BoxedMontyParams,
    a: BoxedMontyForm,
    b3: BoxedMontyForm,
    b: BoxedMontyForm,
}
impl MontyCurve {
    fn to_monty(&self, value: &BoxedUint) -> BoxedMontyForm {
        BoxedMontyForm::new(value.clone(), self.params.clone())
    }

    fn lift(&self, point: &AffinePoint) -> ProjectivePoint {
        ProjectivePoint {
            x: self.to_monty(&point.x),
            y: self.to_monty(&point.y),
            z: BoxedMontyForm::one(self.params.clone()),
        }
    }

    fn infinity(&self) -> ProjectivePoint {
        ProjectivePoint {
            x: BoxedMontyForm::zero(self.params.clone()),
            y: BoxedMontyForm::one(self.params.clone()),
            z: BoxedMontyForm::zero(self.params.clone()),
        }
    }

    /// Converts back to affine coordinates; `None` for the point at infinity.
    fn normalize(&self, point: &ProjectivePoint) -> Option<AffinePoint> {
        let z_inverse = point.z.invert().into_option()?;
        Some(AffinePoint {
            x: (&point.x * &z_inverse).retrieve(),
            y: (&point.y * &z_inverse).retrieve(),
        })
    }

    fn is_on_curve(&self, point: &AffinePoint) -> bool {
        let x = self.to_monty(&point.x);
        let y = self.to_monty(&point.y);
        let lhs = &y * &y;
        let rhs = &(&(&x * &x) * &x) + &(&(&self.a * &x) + &self.b);
        lhs.retrieve() == rhs.retrieve()
    }

    /// Complete addition for short Weierstrass curves with arbitrary `a`
    /// (Renes, Costello, Batina 2015, <https://eprint.iacr.org/2015/1060>, algorithm 1).
    fn add(&self, p: &ProjectivePoint, q: &ProjectivePoint) -> ProjectivePoint {
        let t0 = &p.x * &q.x;
        let t1 = &p.y * &q.y;
        let t2 = &p.z * &q.z;
        let t3 = &(&(&p.x + &p.y) * &(&q.x + &q.y)) - &(&t0 + &t1);
        let t4 = &(&(&p.x + &p.z) * &(&q.x + &q.z)) - &(&t0 + &t2);
        let t5 = &(&(&p.y + &p.z) * &(&q.y + &q.z)) - &(&t1 + &t2);

        let z3 = &(&self.a * &t4) + &(&self.b3 * &t2);
        let x3 = &t1 - &z3;
        let z3 = &t1 + &z3;
        let y3 = &x3 * &z3;

        let t1 = &(&(&t0 + &t0) + &t0) + &(&self.a * &t2);
        let t2 = &self.a * &(&t0 - &(&self.a * &t2));
        let t4 = &(&self.b3 * &t4) + &t2;

        ProjectivePoint {
            x: &(&t3 * &x3) - &(&t5 * &t4),
            y: &y3 + &(&t1 * &t4),
            z: &(&t5 * &z3) + &(&t3 * &t1),
        }
    }

    /// Complete doubling for short Weierstrass curves with arbitrary `a`
    /// (Renes, Costello, Batina 2015, algorithm 3).
    fn double(&self, p: &ProjectivePoint) -> ProjectivePoint {
        let t0 = &p.x * &p.x;
        let t1 = &p.y * &p.y;
        let t2 = &p.z * &p.z;
        let xy = &p.x * &p.y;
        let t3 = &xy + &xy;
        let xz = &p.x * &p.z;
        let z3 = &xz + &xz;

        let x3 = &self.a * &z3;
        let y3 = &x3 + &(&self.b3 * &t2);
        let x3 = &t1 - &y3;
        let y3 = &(&t1 + &y3) * &x3;
        let x3 = &t3 * &x3;
        let z3 = &self.b3 * &z3;
        let t2 = &self.a * &t2;
        let t3 = &(&self.a * &(&t0 - &t2)) + &z3;
        let t0 = &(&(&(&t0 + &t0) + &t0) + &t2) * &t3;
        let y3 = &y3 + &t0;
        let yz = &p.y * &p.z;
        let t2 = &yz + &yz;
        let x3 = &x3 - &(&t2 * &t3);
        let z3 = &t2 * &t1;
        let z3 = &z3 + &z3;

        ProjectivePoint {
            x: x3,
            y: y3,
            z: &z3 + &z3,
        }
    }

    /// Double-and-add scalar multiplication, least significant bit first.
    fn multiply(&self, scalar: &BoxedUint, point: &ProjectivePoint) -> ProjectivePoint {
        let mut result = self.infinity();
        let mut addend = point.clone();
        for i in 0..scalar.bits() {
            if bool::from(scalar.bit(i)) {
                result = self.add(&result, &addend);
            }
            addend = self.double(&addend);
        }
        result
    }
}


/// An elliptic curve of the form `y**2 ≡ x**3 + ax + b` modulo a prime number.
///
/// All coordinates and coefficients are stored with the precision of the prime.
#[derive(Clone, Debug, Eq, PartialEq, ZeroizeOnDrop)]
pub struct PrimeWeierstrassCurve {
    /// The prime (modulus) of the curve.
    prime: BoxedUint,

    /// Coefficient `a` in the curve's formula.
    coefficient_a: BoxedUint,

    /// Coefficient `b` in the curve's formula.
    coefficient_b: BoxedUint,

    /// The generator point of the curve.
    generator: AffinePoint,

    /// The cofactor of the curve.
    cofactor: u8,
}
impl PrimeWeierstrassCurve {
    /// Creates a curve from untrusted parameters, verifying that the prime is odd and that the
    /// generator lies on the curve.
    pub fn new(
        prime: BoxedUint,
        coefficient_a: BoxedUint,
        coefficient_b: BoxedUint,
        generator: AffinePoint,
        cofactor: u8,
    ) -> Result<Self, CryptoError> {
        if !bool::from(prime.is_odd()) {
            return Err(CryptoError::InvalidDomainParameters);
        }
        let curve = Self::from_parts(prime, coefficient_a, coefficient_b, generator, cofactor)
            .ok_or(CryptoError::InvalidDomainParameters)?;
        curve.checked_point(&curve.generator)
            .map_err(|_| CryptoError::InvalidDomainParameters)?;
        Ok(curve)
    }

    /// Assembles a curve, bringing every value to the precision of the prime.
    fn from_parts(
        prime: BoxedUint,
        coefficient_a: BoxedUint,
        coefficient_b: BoxedUint,
        generator: AffinePoint,
        cofactor: u8,
    ) -> Option<Self> {
        let precision = prime.bits_precision();
        let coefficient_a = with_precision(&coefficient_a, precision)?;
        let coefficient_b = with_precision(&coefficient_b, precision)?;
        let generator = AffinePoint::new(
            with_precision(&generator.x, precision)?,
            with_precision(&generator.y, precision)?,
        );
        Some(Self { prime, coefficient_a, coefficient_b, generator, cofactor })
    }

    pub fn prime(&self) -> &BoxedUint { &self.prime }
    pub fn coefficient_a(&self) -> &BoxedUint { &self.coefficient_a }
    pub fn coefficient_b(&self) -> &BoxedUint { &self.coefficient_b }
    pub fn generator(&self) -> &AffinePoint { &self.generator }
    pub fn cofactor(&self) -> u8 { self.cofactor }

    /// The number of bytes in an encoded coordinate, which is also the length of a private key.
    pub fn field_size_bytes(&self) -> usize {
        self.prime.bits().div_ceil(8) as usize
    }

    fn monty(&self) -> Result<MontyCurve, CryptoError> {
        let odd_prime = self.prime.to_odd().into_option()
            .ok_or(CryptoError::InvalidDomainParameters)?;
        let params = BoxedMontyParams::new(odd_prime);
        let a = BoxedMontyForm::new(self.coefficient_a.clone(), params.clone());
        let b = BoxedMontyForm::new(self.coefficient_b.clone(), params.clone());
        let b3 = &(&b + &b) + &b;
        Ok(MontyCurve { params, a, b3, b })
    }

    /// Brings a point to the precision of the prime and checks that it lies on this curve.
    fn checked_point(&self, point: &AffinePoint) -> Result<AffinePoint, CryptoError> {
        let precision = self.prime.bits_precision();
        let x = with_precision(&point.x, precision).ok_or(CryptoError::InvalidPublicKey)?;
        let y = with_precision(&point.y, precision).ok_or(CryptoError::InvalidPublicKey)?;
        if x >= self.prime || y >= self.prime {
            return Err(CryptoError::InvalidPublicKey);
        }
        let point = AffinePoint::new(x, y);
        if !self.monty()?.is_on_curve(&point) {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(point)
    }

    pub fn is_on_curve(&self, point: &AffinePoint) -> bool {
        self.checked_point(point).is_ok()
    }

    /// Decodes an uncompressed point (`04 || x || y`) and checks that it lies on this curve.
    pub fn decode_point(&self, bytes: &[u8]) -> Result<AffinePoint, CryptoError> {
        let field_size = self.field_size_bytes();
        let (&format, coordinates) = bytes.split_first()
            .ok_or(CryptoError::InvalidPublicKey)?;
        if format != 0x04 || coordinates.len() != 2 * field_size {
            return Err(CryptoError::InvalidPublicKey);
        }
        let (x_bytes, y_bytes) = coordinates.split_at(field_size);
        let precision = self.prime.bits_precision();
        let point = AffinePoint::new(
            uint_from_be_slice(x_bytes, precision).ok_or(CryptoError::InvalidPublicKey)?,
            uint_from_be_slice(y_bytes, precision).ok_or(CryptoError::InvalidPublicKey)?,
        );
        self.checked_point(&point)
    }

    /// Encodes a point in uncompressed form (`04 || x || y`).
    pub fn encode_point(&self, point: &AffinePoint) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let field_size = self.field_size_bytes();
        let x = be_bytes_fixed(&point.x, field_size).ok_or(CryptoError::InvalidPublicKey)?;
        let y = be_bytes_fixed(&point.y, field_size).ok_or(CryptoError::InvalidPublicKey)?;
        let mut ret = Zeroizing::new(Vec::with_capacity(1 + 2 * field_size));
        ret.push(0x04);
        ret.extend_from_slice(&x);
        ret.extend_from_slice(&y);
        Ok(ret)
    }

    /// Calculates the public key `d·G` for the private key `d`.
    pub fn calculate_public_key(&self, private_key: &BoxedUint) -> Result<AffinePoint, CryptoError> {
        let monty = self.monty()?;
        let generator = monty.lift(&self.generator);
        let product = monty.multiply(private_key, &generator);
        monty.normalize(&product)
            .ok_or(CryptoError::InvalidPublicKey)
    }

    /// Calculates the shared point `d·Q` for the other party's public key `Q`.
    pub fn diffie_hellman(&self, private_key: &BoxedUint, other_public_key: &AffinePoint) -> Result<AffinePoint, CryptoError> {
        let other_public_key = self.checked_point(other_public_key)?;
        let monty = self.monty()?;
        let mut other = monty.lift(&other_public_key);
        if self.cofactor > 1 {
            let cofactor = boxed_uint_from_be_slice(&[self.cofactor]);
            other = monty.multiply(&cofactor, &other);
        }
        let product = monty.multiply(private_key, &other);
        monty.normalize(&product)
            .ok_or(CryptoError::InvalidSharedSecret)
    }

    /// Derives the curve of the Generic Mapping, whose generator is `s·G + H` for the nonce `s`
    /// and the shared point `H`.
    pub fn derive_generic_mapping(&self, nonce: &BoxedUint, shared_secret: &AffinePoint) -> Result<Self, CryptoError> {
        let shared_secret = self.checked_point(shared_secret)
            .map_err(|_| CryptoError::InvalidSharedSecret)?;
        let monty = self.monty()?;
        let generator = monty.lift(&self.generator);
        let shared = monty.lift(&shared_secret);
        let mapped = monty.add(&monty.multiply(nonce, &generator), &shared);
        let mapped_generator = monty.normalize(&mapped)
            .ok_or(CryptoError::InvalidSharedSecret)?;

        Ok(Self {
            prime: self.prime.clone(),
            coefficient_a: self.coefficient_a.clone(),
            coefficient_b: self.coefficient_b.clone(),
            generator: mapped_generator,
            cofactor: self.cofactor,
        })
    }
}


#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::AffinePoint;
    use super::curves::get_brainpool_p256r1;
    use crate::crypt::boxed_uint_from_be_slice;
    use crate::error::CryptoError;

    #[test]
    fn icao_doc9303_part11_secg1_example() {
        let curve = get_brainpool_p256r1();

        let nonce = boxed_uint_from_be_slice(&hex!("3F00C4D3 9D153F2B 2A214A07 8D899B22"));
        let terminal_private = boxed_uint_from_be_slice(&hex!("
            7F4EF07B 9EA82FD7 8AD689B3 8D0BC78C F21F249D 953BC46F 4C6E1925 9C010F99
        "));
        let chip_private = boxed_uint_from_be_slice(&hex!("
            498FF497 56F2DC15 87840041 839A8598 2BE7761D 14715FB0 91EFA7BC E9058560
        "));

        let terminal_public = curve.calculate_public_key(&terminal_private).unwrap();
        assert_eq!(
            curve.encode_point(&terminal_public).unwrap().as_slice(),
            &hex!("
                04
                7ACF3EFC 982EC455 65A4B155 129EFBC7 4650DCBF A6362D89 6FC70262 E0C2CC5E
                544552DC B6725218 799115B5 5C9BAA6D 9F6BC3A9 618E70C2 5AF71777 A9C4922D
            "),
        );
        let chip_public = curve.calculate_public_key(&chip_private).unwrap();
        assert_eq!(
            chip_public.x(),
            &boxed_uint_from_be_slice(&hex!("
                824FBA91 C9CBE26B EF53A0EB E7342A3B F178CEA9 F45DE0B7 0AA60165 1FBA3F57
            ")),
        );

        let terminal_secret = curve.diffie_hellman(&terminal_private, &chip_public).unwrap();
        let chip_secret = curve.diffie_hellman(&chip_private, &terminal_public).unwrap();
        assert_eq!(terminal_secret, chip_secret);
        assert_eq!(
            terminal_secret.y(),
            &boxed_uint_from_be_slice(&hex!("
                0840CA74 15BAF3E4 3BD414D3 5AA4608B 93A2CAF3 A4E3EA4E 82C9C13D 03EB7181
            ")),
        );

        let session_curve = curve.derive_generic_mapping(&nonce, &terminal_secret).unwrap();
        assert_eq!(
            session_curve.generator().x(),
            &boxed_uint_from_be_slice(&hex!("
                8CED63C9 1426D4F0 EB1435E7 CB1D74A4 6723A0AF 21C89634 F65A9AE8 7A9265E2
            ")),
        );
        assert_eq!(
            session_curve.generator().y(),
            &boxed_uint_from_be_slice(&hex!("
                8C879506 743F8611 AC33645C 5B985C80 B5F09A0B 83407C1B 6A4D857A E76FE522
            ")),
        );

        let session_terminal_private = boxed_uint_from_be_slice(&hex!("
            A73FB703 AC1436A1 8E0CFA5A BB3F7BEC 7A070E7A 6788486B EE230C4A 22762595
        "));
        let session_chip_private = boxed_uint_from_be_slice(&hex!("
            107CF586 96EF6155 053340FD 633392BA 81909DF7 B9706F22 6F32086C 7AFF974A
        "));
        let session_terminal_public = session_curve.calculate_public_key(&session_terminal_private).unwrap();
        let session_chip_public = session_curve.calculate_public_key(&session_chip_private).unwrap();
        assert_eq!(
            session_chip_public.y(),
            &boxed_uint_from_be_slice(&hex!("
                7764B222 77A2EDDC 3C265A9F 018F9CB8 52E111B7 68B32690 4B59A019 3776F094
            ")),
        );

        let expected_secret = boxed_uint_from_be_slice(&hex!("
            28768D20 701247DA E81804C9 E780EDE5 82A9996D B4A31502 0B273319 7DB84925
        "));
        let session_terminal_secret = session_curve.diffie_hellman(&session_terminal_private, &session_chip_public).unwrap();
        let session_chip_secret = session_curve.diffie_hellman(&session_chip_private, &session_terminal_public).unwrap();
        assert_eq!(session_terminal_secret.x(), &expected_secret);
        assert_eq!(session_chip_secret.x(), &expected_secret);
    }

    #[test]
    fn reject_points_off_curve() {
        let curve = get_brainpool_p256r1();
        let mut encoded = curve.encode_point(curve.generator()).unwrap().to_vec();
        assert!(curve.decode_point(&encoded).is_ok());

        let last = encoded.len() - 1;
        encoded[last] ^= 0x01;
        assert_eq!(curve.decode_point(&encoded), Err(CryptoError::InvalidPublicKey));

        // wrong length and compressed encodings
        assert_eq!(curve.decode_point(&encoded[..last]), Err(CryptoError::InvalidPublicKey));
        encoded[0] = 0x02;
        assert_eq!(curve.decode_point(&encoded[..33]), Err(CryptoError::InvalidPublicKey));
        assert_eq!(curve.decode_point(&[]), Err(CryptoError::InvalidPublicKey));

        let off_curve = AffinePoint::new(curve.generator().x().clone(), curve.generator().x().clone());
        let private_key = boxed_uint_from_be_slice(&[0x02]);
        assert_eq!(curve.diffie_hellman(&private_key, &off_curve), Err(CryptoError::InvalidPublicKey));
    }

    #[test]
    fn zero_scalar_has_no_public_key() {
        let curve = get_brainpool_p256r1();
        let zero = boxed_uint_from_be_slice(&[0x00]);
        assert_eq!(curve.calculate_public_key(&zero), Err(CryptoError::InvalidPublicKey));
    }
}
