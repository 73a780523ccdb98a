//! Terminal Authentication (version 1, as used by Extended Access Control).
//!
//! The terminal proves to the chip that it holds the private key of an inspection system
//! certificate which chains up to a CVCA trusted by the chip. The chip is taught the chain one
//! certificate at a time:
//! ```plain
//! for each certificate:
//!     MSE:Set DST      00 22 81 B6  83 authority_reference
//!     PSO:Verify Cert  00 2A 00 BE  body || 5F37 signature
//! MSE:Set AT           00 22 81 A4  83 holder_reference(IS)
//! GET CHALLENGE        00 84 00 00  (8 bytes)
//! EXTERNAL AUTH        00 82 00 00  sign(document_number || check_digit || challenge || key_hash)
//! ```
//!
//! Parsing card-verifiable certificates and computing signatures is left to the caller; see
//! [`TerminalCertificate`] and [`TerminalSigner`].


use smallstr::SmallString;
use tracing::{debug, instrument};

use crate::bac::get_challenge;
use crate::ca::ChipAuthenticationResult;
use crate::der_util::{ecdsa_der_to_plain, tlv};
use crate::error::{ChainError, CryptoError, Error, Operation};
use crate::iso7816::apdu::{Apdu, CommandHeader, Data};
use crate::mrz::document_number_with_check_digit;
use crate::secure_messaging::CardLink;


/// The number of bytes of certificate data sent per PSO:Verify Certificate command unless
/// configured otherwise.
pub const DEFAULT_CERTIFICATE_BLOCK_SIZE: usize = 223;


/// The role of a certificate holder, encoded in the top two bits of the relative authorization in
/// the certificate holder authorization template.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CertificateRole {
    Cvca,
    DocumentVerifierDomestic,
    DocumentVerifierForeign,
    InspectionSystem,
}
impl CertificateRole {
    /// Extracts the role from the relative authorization byte.
    pub const fn from_relative_authorization(authorization: u8) -> Self {
        match authorization >> 6 {
            0b11 => Self::Cvca,
            0b10 => Self::DocumentVerifierDomestic,
            0b01 => Self::DocumentVerifierForeign,
            _ => Self::InspectionSystem,
        }
    }
}


/// The validity period of a certificate as `YYMMDD` dates.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct ValidityPeriod {
    pub effective_date: SmallString<[u8; 6]>,
    pub expiration_date: SmallString<[u8; 6]>,
}


/// A card-verifiable certificate, already parsed by the caller.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TerminalCertificate {
    pub holder_reference: String,
    pub authority_reference: String,
    pub role: CertificateRole,

    /// The relative authorization with the role bits masked off.
    pub access_rights: u8,

    pub validity: ValidityPeriod,

    /// The complete certificate body (`7F4E`), including tag and length.
    pub body: Vec<u8>,

    /// The signature value, without the `5F37` tag and length.
    pub signature: Vec<u8>,

    /// The public key data object (`7F49`) from the certificate body.
    pub public_key: Vec<u8>,
}


/// A chain of terminal certificates, ordered from the issuer (CVCA or DV) to the inspection
/// system.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct TerminalCertificateChain {
    certificates: Vec<TerminalCertificate>,
}
impl TerminalCertificateChain {
    pub fn new(certificates: Vec<TerminalCertificate>) -> Self {
        Self { certificates }
    }

    pub fn certificates(&self) -> &[TerminalCertificate] { &self.certificates }

    /// Checks the structure of the chain and determines which certificates must be sent.
    ///
    /// A leading CVCA certificate is checked against `ca_reference` and dropped, since the chip
    /// already knows it. Returns the CA reference (given or adopted from the chain) and the
    /// certificates to send.
    pub fn validate(&self, ca_reference: Option<&str>) -> Result<(String, &[TerminalCertificate]), ChainError> {
        let mut ca_reference = ca_reference.map(|r| r.to_owned());

        let mut to_send = self.certificates.as_slice();
        let first = to_send.first().ok_or(ChainError::Empty)?;
        if first.role == CertificateRole::Cvca {
            match &ca_reference {
                Some(expected) if *expected != first.holder_reference => return Err(ChainError::CvcaReference {
                    expected: expected.clone(),
                    found: first.holder_reference.clone(),
                }),
                Some(_) => {},
                None => ca_reference = Some(first.holder_reference.clone()),
            }
            to_send = &to_send[1..];
        }

        let first = to_send.first().ok_or(ChainError::Empty)?;
        let ca_reference = match ca_reference {
            Some(expected) if expected != first.authority_reference => return Err(ChainError::AuthorityReference {
                expected,
                found: first.authority_reference.clone(),
            }),
            Some(expected) => expected,
            None => first.authority_reference.clone(),
        };

        for (index, pair) in to_send.windows(2).enumerate() {
            if pair[1].authority_reference != pair[0].holder_reference {
                return Err(ChainError::BrokenLink { index: index + 1 });
            }
        }

        // non-empty, checked above
        if let Some(last) = to_send.last() {
            if last.role != CertificateRole::InspectionSystem {
                return Err(ChainError::LeafRole(last.role));
            }
        }

        Ok((ca_reference, to_send))
    }
}


/// The kind of signature produced by a [`TerminalSigner`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SignatureAlgorithm {
    /// RSA (PKCS #1 v1.5 or PSS); the signature is sent as produced.
    Rsa { modulus_bytes: usize },

    /// ECDSA; the signer returns a DER `SEQUENCE { r, s }`, which is converted to plain `r || s`
    /// with each integer padded to `field_size` bytes.
    Ecdsa { field_size: usize },
}


/// Holds the private key of the inspection system and signs with it.
pub trait TerminalSigner {
    /// The signature algorithm declared by the inspection system certificate.
    fn algorithm(&self) -> SignatureAlgorithm;

    /// Signs the data, hashing it as the algorithm requires.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
}


/// The outcome of a successful Terminal Authentication.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TerminalAuthenticationResult {
    chip_authentication: ChipAuthenticationResult,
    ca_reference: String,
    certificates: Vec<TerminalCertificate>,
    terminal_key: SignatureAlgorithm,
    document_number: String,
    chip_challenge: [u8; 8],
}
impl TerminalAuthenticationResult {
    pub fn chip_authentication(&self) -> &ChipAuthenticationResult { &self.chip_authentication }
    pub fn ca_reference(&self) -> &str { &self.ca_reference }

    /// The certificates that were sent to the chip.
    pub fn certificates(&self) -> &[TerminalCertificate] { &self.certificates }

    pub fn terminal_key(&self) -> SignatureAlgorithm { self.terminal_key }
    pub fn document_number(&self) -> &str { &self.document_number }
    pub fn chip_challenge(&self) -> &[u8; 8] { &self.chip_challenge }
}


/// Assembles the data signed by the terminal.
pub fn data_to_be_signed(document_number: &str, chip_challenge: &[u8], key_hash: &[u8]) -> Vec<u8> {
    let mut ret = document_number_with_check_digit(document_number).as_bytes().to_vec();
    ret.extend_from_slice(chip_challenge);
    ret.extend_from_slice(key_hash);
    ret
}


fn manage_security_environment(link: &mut CardLink<'_>, operation: Operation, p2: u8, reference: &str) -> Result<(), Error> {
    let request = Apdu::new(
        CommandHeader::new(0x00, 0x22, 0x81, p2),
        Data::new(tlv(0x83, reference.as_bytes()), None),
    );
    link.expect_success(operation, &request)?;
    Ok(())
}

/// Has the chip verify a certificate against the public key selected by MSE:Set DST.
///
/// The certificate data is split into blocks of at most `block_size` bytes; all but the last
/// command are flagged as chained.
fn verify_certificate(link: &mut CardLink<'_>, certificate: &TerminalCertificate, block_size: usize) -> Result<(), Error> {
    let mut certificate_data = certificate.body.clone();
    certificate_data.extend(tlv(0x5F37, &certificate.signature));

    let block_count = certificate_data.chunks(block_size.max(1)).count();
    for (index, block) in certificate_data.chunks(block_size.max(1)).enumerate() {
        let cla = if index + 1 < block_count { 0x10 } else { 0x00 };
        let request = Apdu::new(
            CommandHeader::new(cla, 0x2A, 0x00, 0xBE), // PERFORM SECURITY OPERATION: verify certificate
            Data::new(block.to_vec(), None),
        );
        link.expect_success(Operation::TerminalVerifyCertificate, &request)?;
    }
    Ok(())
}

fn external_authenticate(link: &mut CardLink<'_>, signature: Vec<u8>) -> Result<(), Error> {
    let request = Apdu::new(
        CommandHeader::new(0x00, 0x82, 0x00, 0x00), // EXTERNAL AUTHENTICATE
        Data::new(signature, None),
    );
    link.expect_success(Operation::TerminalExternalAuthenticate, &request)?;
    Ok(())
}


/// Performs Terminal Authentication.
///
/// The chain is validated before any command is sent.
#[instrument(skip_all)]
pub fn authenticate(
    link: &mut CardLink<'_>,
    chip_authentication: &ChipAuthenticationResult,
    chain: &TerminalCertificateChain,
    ca_reference: Option<&str>,
    signer: &dyn TerminalSigner,
    document_number: &str,
    certificate_block_size: usize,
) -> Result<TerminalAuthenticationResult, Error> {
    let (ca_reference, certificates) = chain.validate(ca_reference)?;

    for certificate in certificates {
        manage_security_environment(
            link,
            Operation::TerminalSetDigitalSignatureTemplate,
            0xB6,
            &certificate.authority_reference,
        )?;
        verify_certificate(link, certificate, certificate_block_size)?;
        debug!(holder = %certificate.holder_reference, "certificate accepted by chip");
    }

    // validate() ensures the chain ends with an inspection system certificate
    let terminal_certificate = certificates.last()
        .ok_or(ChainError::Empty)?;
    manage_security_environment(
        link,
        Operation::TerminalSetAuthenticationTemplate,
        0xA4,
        &terminal_certificate.holder_reference,
    )?;

    let chip_challenge = get_challenge(link)?;
    let dtbs = data_to_be_signed(document_number, &chip_challenge, chip_authentication.key_hash());

    let terminal_key = signer.algorithm();
    let signature = signer.sign(&dtbs)?;
    let signature = match terminal_key {
        SignatureAlgorithm::Rsa { .. } => signature,
        SignatureAlgorithm::Ecdsa { field_size } => ecdsa_der_to_plain(&signature, field_size)
            .ok_or(CryptoError::InvalidSignature)?,
    };
    external_authenticate(link, signature)?;
    debug!("Terminal Authentication successful");

    Ok(TerminalAuthenticationResult {
        chip_authentication: chip_authentication.clone(),
        ca_reference,
        certificates: certificates.to_vec(),
        terminal_key,
        document_number: document_number.to_owned(),
        chip_challenge,
    })
}
