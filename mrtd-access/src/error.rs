//! Error types shared by all protocol steps.


use std::fmt;

use thiserror::Error;

use crate::iso7816::card::CommunicationError;
use crate::session::SessionState;
use crate::ta::CertificateRole;


/// An operation that sends a command to the chip or changes the session state.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    Open,
    Bac,
    Pace,
    ChipAuthentication,
    TerminalAuthentication,
    SelectApplet,
    SelectFile,
    ReadBinary,
    SecureMessaging,
    GetChallenge,
    MutualAuthenticate,
    PaceSetAuthenticationTemplate,
    PaceObtainNonce,
    PaceMapNonce,
    PaceKeyAgreement,
    PaceMutualAuthentication,
    ChipAuthenticationSetKeyAgreementTemplate,
    TerminalSetDigitalSignatureTemplate,
    TerminalVerifyCertificate,
    TerminalSetAuthenticationTemplate,
    TerminalExternalAuthenticate,
}
impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Bac => "BAC",
            Self::Pace => "PACE",
            Self::ChipAuthentication => "Chip Authentication",
            Self::TerminalAuthentication => "Terminal Authentication",
            Self::SelectApplet => "SELECT (applet)",
            Self::SelectFile => "SELECT (file)",
            Self::ReadBinary => "READ BINARY",
            Self::SecureMessaging => "Secure Messaging",
            Self::GetChallenge => "GET CHALLENGE",
            Self::MutualAuthenticate => "EXTERNAL AUTHENTICATE (BAC)",
            Self::PaceSetAuthenticationTemplate => "MSE:Set AT (PACE)",
            Self::PaceObtainNonce => "GENERAL AUTHENTICATE (nonce)",
            Self::PaceMapNonce => "GENERAL AUTHENTICATE (mapping)",
            Self::PaceKeyAgreement => "GENERAL AUTHENTICATE (key agreement)",
            Self::PaceMutualAuthentication => "GENERAL AUTHENTICATE (mutual authentication)",
            Self::ChipAuthenticationSetKeyAgreementTemplate => "MSE:Set KAT",
            Self::TerminalSetDigitalSignatureTemplate => "MSE:Set DST",
            Self::TerminalVerifyCertificate => "PSO:Verify Certificate",
            Self::TerminalSetAuthenticationTemplate => "MSE:Set AT (TA)",
            Self::TerminalExternalAuthenticate => "EXTERNAL AUTHENTICATE (TA)",
        };
        f.write_str(name)
    }
}


/// A value echoed back by the chip during BAC that did not match.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MismatchedValue {
    RndIc,
    RndIfd,
}


/// Failures of cryptographic primitives or of key material supplied by the chip.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum CryptoError {
    #[error("key has length {obtained}, expected {expected}")]
    InvalidKeyLength { expected: usize, obtained: usize },

    #[error("data length {obtained} is not a multiple of the block size {block_size}")]
    InvalidDataLength { block_size: usize, obtained: usize },

    #[error("invalid ISO/IEC 9797-1 padding")]
    InvalidPadding,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid domain parameters")]
    InvalidDomainParameters,

    #[error("key agreement produced an invalid shared secret")]
    InvalidSharedSecret,

    #[error("terminal and chip ephemeral public keys are equal")]
    EqualPublicKeys,

    #[error("domain parameters do not match the {expected} key agreement")]
    DomainParameterMismatch { expected: &'static str },

    #[error("invalid signature encoding")]
    InvalidSignature,

    #[error("signing failed: {0}")]
    Signer(String),
}


/// Failures of integrity checks (MACs, authentication tokens, echoed nonces).
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum IntegrityError {
    #[error("response MAC mismatch")]
    ResponseMac,

    #[error("response does not contain a MAC")]
    MissingResponseMac,

    #[error("chip authentication token mismatch")]
    AuthenticationToken,

    #[error("{0:?} echoed by the chip does not match")]
    Mismatch(MismatchedValue),
}


/// Structural problems of a terminal certificate chain.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ChainError {
    #[error("certificate chain is empty")]
    Empty,

    #[error("CVCA holder reference {found:?} does not match expected CA reference {expected:?}")]
    CvcaReference { expected: String, found: String },

    #[error("first certificate is issued by {found:?}, expected {expected:?}")]
    AuthorityReference { expected: String, found: String },

    #[error("certificate {index} is not issued by the holder of its predecessor")]
    BrokenLink { index: usize },

    #[error("last certificate has role {0:?}, expected an inspection system")]
    LeafRole(CertificateRole),
}


/// An error of this library.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{operation} failed with status 0x{status:04X}")]
    ProtocolAbort { operation: Operation, status: u16 },

    #[error("cryptographic failure: {0}")]
    CryptoFailure(#[from] CryptoError),

    #[error("integrity failure: {0}")]
    IntegrityFailure(#[from] IntegrityError),

    #[error("certificate chain rejected: {0}")]
    ChainValidationFailure(#[from] ChainError),

    #[error("malformed response to {operation}: {reason}")]
    MalformedResponse { operation: Operation, reason: &'static str },

    #[error("{operation} is not permitted in session state {state:?}")]
    InvalidState { operation: Operation, state: SessionState },

    #[error("not supported: {0}")]
    Unsupported(&'static str),

    #[error("file not found")]
    FileNotFound,

    #[error("failed to decode EF.CardAccess: {0}")]
    CardAccess(#[from] rasn::error::DecodeError),

    #[error("transport error: {0}")]
    Transport(#[from] CommunicationError),
}
impl Error {
    pub(crate) const fn malformed(operation: Operation, reason: &'static str) -> Self {
        Self::MalformedResponse { operation, reason }
    }
}
