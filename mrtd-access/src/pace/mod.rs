//! Implementation of Password Authenticated Connection Establishment.
//!
//! Only the Generic Mapping is implemented. Protocols using the Integrated Mapping or the Chip
//! Authentication Mapping are recognized and rejected with [`Error::Unsupported`].


pub mod oids;


use crypto_bigint::BoxedUint;
use rand::{CryptoRng, RngCore};
use rasn::{AsnType, Decode, Decoder, Encode};
use rasn::types::{Any, ObjectIdentifier, Oid, SetOf};
use subtle::ConstantTimeEq;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::crypt::{boxed_uint_from_be_slice, KeyExchange};
use crate::crypt::cipher_mac::{CipherSuite, pad};
use crate::crypt::dh::get_rfc5114_1024_160;
use crate::crypt::elliptic::curves;
use crate::der_util::{expect_single_tlv, find_tlv, oid_to_der_bytes, tlv};
use crate::error::{CryptoError, Error, IntegrityError, Operation};
use crate::iso7816::apdu::{Apdu, CommandHeader, Data};
use crate::kdf::{derive_key, derive_session_keys, KeyPurpose};
use crate::mrz::BacKey;
use crate::pace::oids::pace_arcs;
use crate::secure_messaging::{CardLink, SecureChannel};


/// The mapping of the nonce onto ephemeral domain parameters.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Mapping {
    Generic,

    /// Not supported; protocols with this mapping are rejected.
    Integrated,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Agreement {
    DiffieHellman,
    EllipticCurveDiffieHellman,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
}


/// Everything needed to run PACE: the protocol and the static domain parameters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PaceParameters {
    protocol: ObjectIdentifier,
    mapping: Mapping,
    agreement: Agreement,
    cipher_suite: CipherSuite,
    key_exchange: KeyExchange,
}
impl PaceParameters {
    /// Combines a PACE protocol identifier with domain parameters of the matching kind.
    pub fn from_oid(protocol: &Oid, key_exchange: KeyExchange) -> Result<Self, Error> {
        let (mapping_arc, cipher_arc) = pace_arcs(protocol)
            .ok_or(Error::Unsupported("unknown PACE protocol"))?;
        let (mapping, agreement) = match mapping_arc {
            1 => (Mapping::Generic, Agreement::DiffieHellman),
            2 => (Mapping::Generic, Agreement::EllipticCurveDiffieHellman),
            3|4 => return Err(Error::Unsupported("PACE with Integrated Mapping")),
            6 => return Err(Error::Unsupported("PACE with Chip Authentication Mapping")),
            _ => return Err(Error::Unsupported("unknown PACE protocol")),
        };
        let cipher_suite = match cipher_arc {
            1 => CipherSuite::Tdes,
            2 => CipherSuite::Aes128,
            3 => CipherSuite::Aes192,
            4 => CipherSuite::Aes256,
            _ => return Err(Error::Unsupported("unknown PACE cipher suite")),
        };
        match (agreement, &key_exchange) {
            (Agreement::DiffieHellman, KeyExchange::DiffieHellman(_)) => {},
            (Agreement::EllipticCurveDiffieHellman, KeyExchange::PrimeWeierstrassEllipticDiffieHellman(_)) => {},
            (Agreement::DiffieHellman, _) => return Err(CryptoError::DomainParameterMismatch { expected: "DH" }.into()),
            (Agreement::EllipticCurveDiffieHellman, _) => return Err(CryptoError::DomainParameterMismatch { expected: "ECDH" }.into()),
        }
        Ok(Self {
            protocol: protocol.to_owned(),
            mapping,
            agreement,
            cipher_suite,
            key_exchange,
        })
    }

    /// Derives the parameters from an entry of `EF.CardAccess` that references standardized domain
    /// parameters.
    pub fn from_pace_info(info: &PaceInfo) -> Result<Self, Error> {
        let parameter_id = info.parameter_id
            .ok_or(Error::Unsupported("PACE with explicit domain parameters"))?;
        Self::from_oid(&info.protocol, standard_domain_parameters(parameter_id)?)
    }

    pub fn protocol(&self) -> &Oid { &self.protocol }
    pub fn mapping(&self) -> Mapping { self.mapping }
    pub fn agreement(&self) -> Agreement { self.agreement }
    pub fn cipher_suite(&self) -> CipherSuite { self.cipher_suite }
    pub fn key_exchange(&self) -> &KeyExchange { &self.key_exchange }

    /// The hash function of the key derivation function.
    pub fn digest(&self) -> DigestAlgorithm {
        match self.cipher_suite {
            CipherSuite::Tdes|CipherSuite::Aes128 => DigestAlgorithm::Sha1,
            CipherSuite::Aes192|CipherSuite::Aes256 => DigestAlgorithm::Sha256,
        }
    }

    /// The effective key length in bits (two-key 3DES counts 112 bits).
    pub fn key_length_bits(&self) -> usize {
        match self.cipher_suite {
            CipherSuite::Tdes => 112,
            other => 8 * other.key_size(),
        }
    }
}


/// Returns the standardized domain parameters with the given identifier (ICAO Doc 9303 Part 11
/// § 9.5.1).
pub fn standard_domain_parameters(parameter_id: u32) -> Result<KeyExchange, Error> {
    use KeyExchange::PrimeWeierstrassEllipticDiffieHellman as Ecdh;

    Ok(match parameter_id {
        0 => KeyExchange::DiffieHellman(get_rfc5114_1024_160()),
        1|2 => return Err(Error::Unsupported("2048-bit MODP domain parameters")),
        8 => Ecdh(curves::get_nist_p192()),
        9 => Ecdh(curves::get_brainpool_p192r1()),
        10 => Ecdh(curves::get_nist_p224()),
        11 => Ecdh(curves::get_brainpool_p224r1()),
        12 => Ecdh(curves::get_nist_p256()),
        13 => Ecdh(curves::get_brainpool_p256r1()),
        14 => Ecdh(curves::get_brainpool_p320r1()),
        15 => Ecdh(curves::get_nist_p384()),
        16 => Ecdh(curves::get_brainpool_p384r1()),
        17 => Ecdh(curves::get_brainpool_p512r1()),
        18 => Ecdh(curves::get_nist_p521()),
        _ => return Err(Error::Unsupported("reserved standardized domain parameter identifier")),
    })
}


/// A `PaceInfo` entry of `EF.CardAccess` (ICAO Doc 9303 Part 11 § 9.2.1).
#[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
pub struct PaceInfo {
    pub protocol: ObjectIdentifier,
    pub version: u32,
    pub parameter_id: Option<u32>,
}


/// Extracts the `PaceInfo` entries from the contents of `EF.CardAccess`.
///
/// The file is a SET OF SecurityInfo, each of which is a SEQUENCE starting with a protocol OID.
/// Only entries with a PACE protocol OID are decoded as `PaceInfo`; entries for other protocols
/// (Chip Authentication, Terminal Authentication, PACE domain parameters, ...) are skipped.
pub fn parse_card_access(card_access: &[u8]) -> Result<Vec<PaceInfo>, Error> {
    let security_infos: SetOf<Any> = rasn::der::decode(card_access)?;

    let mut ret = Vec::new();
    for security_info in security_infos.to_vec() {
        let fields: Vec<Any> = rasn::der::decode(security_info.as_bytes())?;
        let Some(first_field) = fields.first() else {
            continue;
        };
        let Ok(protocol): Result<ObjectIdentifier, _> = rasn::der::decode(first_field.as_bytes()) else {
            continue;
        };
        if pace_arcs(&protocol).is_none() {
            continue;
        }

        let pace_info: PaceInfo = rasn::der::decode(security_info.as_bytes())?;
        ret.push(pace_info);
    }
    Ok(ret)
}


/// The password from which the PACE key is derived.
#[derive(Clone, Copy, Debug)]
pub enum PacePassword<'a> {
    /// The access key from the machine-readable zone.
    Mrz(&'a BacKey),

    /// The Card Access Number printed on the document.
    Can(&'a str),
}
impl<'a> PacePassword<'a> {
    /// The password reference sent in MSE:Set AT.
    pub fn source(&self) -> PasswordSource {
        match self {
            Self::Mrz(_) => PasswordSource::Mrz,
            Self::Can(_) => PasswordSource::Can,
        }
    }

    /// The shared secret from which the password key is derived.
    pub fn secret(&self) -> Zeroizing<Vec<u8>> {
        match self {
            Self::Mrz(key) => key.pace_key_seed(),
            Self::Can(can) => Zeroizing::new(can.as_bytes().to_vec()),
        }
    }
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PasswordSource {
    Mrz,
    Can,
}
impl PasswordSource {
    pub const fn reference(&self) -> u8 {
        match self {
            Self::Mrz => 0x01,
            Self::Can => 0x02,
        }
    }
}


/// Selects the PACE protocol and password with MSE:Set AT.
pub fn set_authentication_template(link: &mut CardLink<'_>, protocol: &Oid, password_source: PasswordSource) -> Result<(), Error> {
    let protocol_bytes = oid_to_der_bytes(protocol)
        .ok_or(Error::Unsupported("invalid protocol object identifier"))?;
    let mut request_data = tlv(0x80, &protocol_bytes);
    request_data.extend(tlv(0x83, &[password_source.reference()]));

    let request = Apdu::new(
        // MANAGE SECURITY ENVIRONMENT: set, authentication template
        CommandHeader::new(0x00, 0x22, 0xC1, 0xA4),
        Data::new(request_data, None),
    );
    link.expect_success(Operation::PaceSetAuthenticationTemplate, &request)?;
    Ok(())
}


/// Sends a step of GENERAL AUTHENTICATE and extracts the data object with `response_tag` from the
/// dynamic authentication data in the response.
fn general_authenticate(
    link: &mut CardLink<'_>,
    operation: Operation,
    last_in_chain: bool,
    request_object: Option<(u32, &[u8])>,
    response_tag: u32,
) -> Result<Zeroizing<Vec<u8>>, Error> {
    let inner = match request_object {
        Some((tag, value)) => Zeroizing::new(tlv(tag, value)),
        None => Zeroizing::new(Vec::new()),
    };
    let cla = if last_in_chain { 0x00 } else { 0x10 };
    let request = Apdu::new(
        CommandHeader::new(cla, 0x86, 0x00, 0x00), // GENERAL AUTHENTICATE
        Data::new(tlv(0x7C, &inner), Some(256)),
    );
    let response = link.expect_success(operation, &request)?;
    let dynamic_data = expect_single_tlv(&response.data, 0x7C)
        .ok_or(Error::malformed(operation, "missing dynamic authentication data"))?;
    let value = find_tlv(dynamic_data, response_tag)
        .ok_or(Error::malformed(operation, "missing data object in dynamic authentication data"))?;
    Ok(Zeroizing::new(value.to_vec()))
}

/// Requests the encrypted nonce from the chip.
pub fn obtain_encrypted_nonce(link: &mut CardLink<'_>) -> Result<Zeroizing<Vec<u8>>, Error> {
    general_authenticate(link, Operation::PaceObtainNonce, false, None, 0x80)
}

/// Exchanges the public keys of the Generic Mapping.
fn exchange_mapping_values(link: &mut CardLink<'_>, public_key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
    general_authenticate(link, Operation::PaceMapNonce, false, Some((0x81, public_key)), 0x82)
}

fn exchange_ephemeral_public_keys(link: &mut CardLink<'_>, public_key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
    general_authenticate(link, Operation::PaceKeyAgreement, false, Some((0x83, public_key)), 0x84)
}

fn mutual_authentication(link: &mut CardLink<'_>, outgoing_token: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
    general_authenticate(link, Operation::PaceMutualAuthentication, true, Some((0x85, outgoing_token)), 0x86)
}


/// Calculates the authentication token over the other party's ephemeral public key:
/// ```plain
/// MAC(K_mac, 7F49 { 06 protocol, 84|86 public_key })
/// ```
fn calculate_mutual_token(
    params: &PaceParameters,
    public_key: &[u8],
    k_session_mac: &[u8],
) -> Result<Zeroizing<Vec<u8>>, Error> {
    let cipher_and_mac = params.cipher_suite.cipher_and_mac();
    let protocol_bytes = oid_to_der_bytes(&params.protocol)
        .ok_or(Error::Unsupported("invalid protocol object identifier"))?;

    let mut inner_data = Zeroizing::new(tlv(0x06, &protocol_bytes));
    inner_data.extend(tlv(params.key_exchange.public_key_tag().into(), public_key));
    let mut outer_data = Zeroizing::new(tlv(0x7F49, &inner_data));

    if cipher_and_mac.mac_block_size() > 1 {
        *outer_data = pad(&outer_data, cipher_and_mac.mac_block_size());
    }
    Ok(cipher_and_mac.mac_padded_data(&outer_data, k_session_mac)?)
}


fn ensure_keys_differ(ours: &[u8], theirs: &[u8]) -> Result<(), Error> {
    if bool::from(ours.ct_eq(theirs)) {
        Err(CryptoError::EqualPublicKeys.into())
    } else {
        Ok(())
    }
}


/// Performs PACE with Generic Mapping using the given ephemeral private keys.
///
/// `mapping_private_key` is used for the mapping step under the static domain parameters and
/// `agreement_private_key` for the key agreement under the mapped ones.
#[instrument(skip_all)]
pub fn establish_with_keys(
    link: &mut CardLink<'_>,
    params: &PaceParameters,
    password: &PacePassword<'_>,
    mapping_private_key: &BoxedUint,
    agreement_private_key: &BoxedUint,
) -> Result<SecureChannel, Error> {
    let suite = params.cipher_suite;
    let cipher_and_mac = suite.cipher_and_mac();

    set_authentication_template(link, &params.protocol, password.source())?;

    // decrypt the nonce with the password key
    let k_pi = derive_key(&password.secret(), KeyPurpose::Password, suite);
    let mut nonce_bytes = obtain_encrypted_nonce(link)?;
    let nonce_iv = vec![0u8; cipher_and_mac.cipher_block_size()];
    cipher_and_mac.decrypt_padded_data(&mut nonce_bytes, &k_pi, &nonce_iv)?;
    let nonce = Zeroizing::new(boxed_uint_from_be_slice(&nonce_bytes));

    // map the nonce onto ephemeral domain parameters
    let mapped_key_exchange = {
        let public_key = params.key_exchange.calculate_public_key(mapping_private_key)?;
        let chip_public_key = exchange_mapping_values(link, &public_key)?;
        ensure_keys_differ(&public_key, &chip_public_key)?;
        params.key_exchange.derive_generic_mapping(&nonce, mapping_private_key, &chip_public_key)?
    };
    debug!("nonce mapped");

    // key agreement under the ephemeral domain parameters
    let public_key = mapped_key_exchange.calculate_public_key(agreement_private_key)?;
    let chip_public_key = exchange_ephemeral_public_keys(link, &public_key)?;
    ensure_keys_differ(&public_key, &chip_public_key)?;
    let shared_secret = mapped_key_exchange.exchange_keys(agreement_private_key, &chip_public_key)?;

    let (k_session_enc, k_session_mac) = derive_session_keys(&shared_secret, suite);

    // mutual authentication
    let outgoing_token = calculate_mutual_token(params, &chip_public_key, &k_session_mac)?;
    let expected_token = calculate_mutual_token(params, &public_key, &k_session_mac)?;
    let incoming_token = mutual_authentication(link, &outgoing_token)?;
    if !bool::from(incoming_token.as_slice().ct_eq(expected_token.as_slice())) {
        return Err(IntegrityError::AuthenticationToken.into());
    }

    // AES channels continue counting where the previous channel left off
    let send_sequence_counter = match (suite, link.secure_channel()) {
        (CipherSuite::Tdes, _) => 0,
        (_, Some(previous)) => previous.send_sequence_counter(),
        (_, None) => 0,
    };
    debug!(suite = %suite, ssc = send_sequence_counter, "PACE established");
    Ok(SecureChannel::new(suite, &k_session_enc, &k_session_mac, send_sequence_counter)?)
}


/// Performs PACE with Generic Mapping, drawing the ephemeral private keys from `rng`.
#[instrument(skip_all)]
pub fn establish<R: RngCore + CryptoRng + ?Sized>(
    link: &mut CardLink<'_>,
    params: &PaceParameters,
    password: &PacePassword<'_>,
    rng: &mut R,
) -> Result<SecureChannel, Error> {
    let mapping_private_key = params.key_exchange.generate_private_key(rng);
    let agreement_private_key = params.key_exchange.generate_private_key(rng);
    establish_with_keys(link, params, password, &mapping_private_key, &agreement_private_key)
}


#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::{Agreement, DigestAlgorithm, PaceParameters, parse_card_access, standard_domain_parameters};
    use super::oids::{PACE_DH_GM_AES_CBC_CMAC_128, PACE_DH_IM_3DES_CBC_CBC, PACE_ECDH_CAM_AES_CBC_CMAC_128, PACE_ECDH_GM_AES_CBC_CMAC_128, PACE_ECDH_GM_AES_CBC_CMAC_256};
    use crate::crypt::cipher_mac::CipherSuite;
    use crate::crypt::elliptic::curves::get_brainpool_p256r1;
    use crate::crypt::KeyExchange;
    use crate::error::{CryptoError, Error};

    #[test]
    fn protocol_from_oid() {
        let params = PaceParameters::from_oid(
            PACE_ECDH_GM_AES_CBC_CMAC_256,
            KeyExchange::PrimeWeierstrassEllipticDiffieHellman(get_brainpool_p256r1()),
        ).unwrap();
        assert_eq!(params.agreement(), Agreement::EllipticCurveDiffieHellman);
        assert_eq!(params.cipher_suite(), CipherSuite::Aes256);
        assert_eq!(params.digest(), DigestAlgorithm::Sha256);
        assert_eq!(params.key_length_bits(), 256);
    }

    #[test]
    fn integrated_mapping_is_rejected() {
        let params = PaceParameters::from_oid(PACE_DH_IM_3DES_CBC_CBC, standard_domain_parameters(0).unwrap());
        assert!(matches!(params, Err(Error::Unsupported(_))));
        let params = PaceParameters::from_oid(PACE_ECDH_CAM_AES_CBC_CMAC_128, standard_domain_parameters(13).unwrap());
        assert!(matches!(params, Err(Error::Unsupported(_))));
    }

    #[test]
    fn mismatched_domain_parameters() {
        let params = PaceParameters::from_oid(PACE_ECDH_GM_AES_CBC_CMAC_128, standard_domain_parameters(0).unwrap());
        assert!(matches!(params, Err(Error::CryptoFailure(CryptoError::DomainParameterMismatch { expected: "ECDH" }))));
        let params = PaceParameters::from_oid(PACE_DH_GM_AES_CBC_CMAC_128, standard_domain_parameters(12).unwrap());
        assert!(matches!(params, Err(Error::CryptoFailure(CryptoError::DomainParameterMismatch { expected: "DH" }))));
    }

    #[test]
    fn standard_parameters() {
        assert!(matches!(standard_domain_parameters(0), Ok(KeyExchange::DiffieHellman(_))));
        assert!(matches!(standard_domain_parameters(2), Err(Error::Unsupported(_))));
        assert!(matches!(standard_domain_parameters(7), Err(Error::Unsupported(_))));
        assert!(matches!(standard_domain_parameters(19), Err(Error::Unsupported(_))));
        for id in 8..=18 {
            assert!(standard_domain_parameters(id).unwrap().is_elliptic());
        }
    }

    #[test]
    fn card_access_icao_appendix_g1() {
        // EF.CardAccess of ICAO Doc 9303 Part 11 Appendix G.1
        let card_access = hex!("
            31 14 30 12 06 0A 04 00 7F 00 07 02 02 04 02 02 02 01 02 02 01 0D
        ");
        let infos = parse_card_access(&card_access).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(&*infos[0].protocol, PACE_ECDH_GM_AES_CBC_CMAC_128);
        assert_eq!(infos[0].version, 2);
        assert_eq!(infos[0].parameter_id, Some(13));

        let params = PaceParameters::from_pace_info(&infos[0]).unwrap();
        assert_eq!(params.cipher_suite(), CipherSuite::Aes128);
    }

    #[test]
    fn card_access_skips_other_protocols() {
        // ChipAuthenticationInfo (id-CA-ECDH-AES-CBC-CMAC-128) followed by a PaceInfo for DH
        let card_access = hex!("
            31 28
                30 12 06 0A 04 00 7F 00 07 02 02 03 02 02 02 01 02 02 01 41
                30 12 06 0A 04 00 7F 00 07 02 02 04 01 02 02 01 02 02 01 00
        ");
        let infos = parse_card_access(&card_access).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(&*infos[0].protocol, PACE_DH_GM_AES_CBC_CMAC_128);
        assert_eq!(infos[0].parameter_id, Some(0));

        assert!(matches!(parse_card_access(&hex!("31 05 30")), Err(Error::CardAccess(_))));
    }

    #[test]
    fn card_access_optional_parameter_id() {
        // PaceInfo without parameterId next to a PACEDomainParameterInfo (id-PACE-ECDH-GM)
        let card_access = hex!("
            31 2B
                30 0F 06 0A 04 00 7F 00 07 02 02 04 02 02 02 01 02
                30 18 06 09 04 00 7F 00 07 02 02 04 02 30 08 06 06 2B 24 03 03 02 08 02 01 01
        ");
        let infos = parse_card_access(&card_access).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(&*infos[0].protocol, PACE_ECDH_GM_AES_CBC_CMAC_128);
        assert_eq!(infos[0].version, 2);
        assert_eq!(infos[0].parameter_id, None);
        assert!(matches!(PaceParameters::from_pace_info(&infos[0]), Err(Error::Unsupported(_))));

        // a PaceInfo whose version is not an INTEGER
        let malformed = hex!("31 11 30 0F 06 0A 04 00 7F 00 07 02 02 04 02 02 04 01 02");
        assert!(matches!(parse_card_access(&malformed), Err(Error::CardAccess(_))));
    }
}
