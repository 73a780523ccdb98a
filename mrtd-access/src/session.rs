//! A session with a travel document chip.
//!
//! The session owns the card, the active Secure Messaging channel and the random number
//! generator, and sequences the handshakes according to the following transitions:
//! ```plain
//! Closed           --open-->  Open
//! Open             --BAC-->   BacAuthenticated
//! Open, BacAuth.   --PACE-->  BacAuthenticated
//! BacAuthenticated --CA-->    CaAuthenticated
//! CaAuthenticated  --TA-->    TaAuthenticated
//! any              --close--> Closed
//! ```
//! A handshake builds a new channel and the session installs it only once the handshake has
//! succeeded; after a failure, the previous channel remains active.


use std::sync::{Mutex, MutexGuard, PoisonError};

use hex_literal::hex;
use rand::{CryptoRng, RngCore};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{bac, ca, pace, ta};
use crate::ca::{ChipAuthenticationResult, ChipPublicKey};
use crate::crypt::cipher_mac::CipherSuite;
use crate::der_util::{minimal_be_bytes, tlv, try_decode_primitive_length, try_decode_tag};
use crate::error::{Error, Operation};
use crate::iso7816::apdu::{Apdu, CommandHeader, Data, MAX_EXTENDED_LC, MAX_SHORT_NE};
use crate::iso7816::card::SmartCard;
use crate::mrz::BacKey;
use crate::pace::{PaceParameters, PacePassword};
use crate::secure_messaging::{AcceptAnyMac, CardLink, ResponseMacCheck, SecureChannel, VerifyMac};
use crate::ta::{TerminalAuthenticationResult, TerminalCertificateChain, TerminalSigner};


/// The application identifier of the eMRTD applet.
pub const EMRTD_AID: [u8; 7] = hex!("A0000002471001");

/// `EF.CardAccess` in the master file.
pub const EF_CARD_ACCESS: u16 = 0x011C;

/// `EF.COM` in the eMRTD applet.
pub const EF_COM: u16 = 0x011E;

/// `EF.SOD` in the eMRTD applet.
pub const EF_SOD: u16 = 0x011D;

/// `EF.CVCA` in the eMRTD applet.
pub const EF_CVCA: u16 = 0x011C;

/// The file identifier of data group `number` (1 to 16) in the eMRTD applet.
pub const fn ef_dg(number: u8) -> u16 {
    0x0100 | (number as u16)
}

/// The highest offset reachable by READ BINARY with an offset in P1-P2.
const MAX_SHORT_READ_OFFSET: usize = 0x7FFF;

/// `EF.CVCA` starts with one or two bare `42` data objects and is padded to this length.
const CVCA_FILE_LENGTH: usize = 36;


/// The state of a session.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum SessionState {
    Closed,
    Open,

    /// BAC or PACE has succeeded.
    BacAuthenticated,

    CaAuthenticated,
    TaAuthenticated,
}
impl SessionState {
    /// The state reached by completing the handshake in this state, or `None` if the handshake is
    /// not permitted.
    pub const fn after(self, handshake: Handshake) -> Option<SessionState> {
        match (self, handshake) {
            (Self::Open, Handshake::Bac) => Some(Self::BacAuthenticated),
            (Self::Open|Self::BacAuthenticated, Handshake::Pace) => Some(Self::BacAuthenticated),
            (Self::BacAuthenticated, Handshake::ChipAuthentication) => Some(Self::CaAuthenticated),
            (Self::CaAuthenticated, Handshake::TerminalAuthentication) => Some(Self::TaAuthenticated),
            _ => None,
        }
    }
}


/// A protocol that changes the state of a session.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Handshake {
    Bac,
    Pace,
    ChipAuthentication,
    TerminalAuthentication,
}
impl Handshake {
    pub const fn operation(&self) -> Operation {
        match self {
            Self::Bac => Operation::Bac,
            Self::Pace => Operation::Pace,
            Self::ChipAuthentication => Operation::ChipAuthentication,
            Self::TerminalAuthentication => Operation::TerminalAuthentication,
        }
    }
}


/// How response MACs are judged on Secure Messaging channels installed by the session.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MacCheckMode {
    /// Reject responses with a wrong MAC.
    #[default]
    Strict,

    /// Accept responses with a wrong MAC, logging a warning.
    Lenient,
}
impl MacCheckMode {
    pub fn policy(&self) -> &'static dyn ResponseMacCheck {
        match self {
            Self::Strict => &VerifyMac,
            Self::Lenient => &AcceptAnyMac,
        }
    }
}


/// Tunable parameters of a session.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// The maximum number of bytes requested by a single READ BINARY while reading a file.
    pub max_read_length: usize,

    /// Whether the card accepts extended-length APDUs.
    pub extended_length: bool,

    /// The number of bytes per PSO:Verify Certificate command when not using extended length.
    pub certificate_block_size: usize,

    pub mac_check: MacCheckMode,
}
impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_read_length: 0xDF,
            extended_length: false,
            certificate_block_size: ta::DEFAULT_CERTIFICATE_BLOCK_SIZE,
            mac_check: MacCheckMode::Strict,
        }
    }
}


/// A cryptographically secure random number generator that can be owned by a session.
pub trait SessionRng: RngCore + CryptoRng + Send {}
impl<T: RngCore + CryptoRng + Send> SessionRng for T {}


struct SessionInner<SC> {
    card: SC,
    state: SessionState,
    secure_channel: Option<SecureChannel>,
    rng: Box<dyn SessionRng>,
}
impl<SC: SmartCard> SessionInner<SC> {
    fn link(&mut self) -> CardLink<'_> {
        CardLink::new(&mut self.card, self.secure_channel.as_mut())
    }
}


/// A session with a travel document chip.
///
/// All operations lock the session for their whole duration, so that commands of concurrent
/// callers cannot interleave.
pub struct Session<SC> {
    config: SessionConfig,
    inner: Mutex<SessionInner<SC>>,
}
impl<SC: SmartCard> Session<SC> {
    /// Creates a closed session with the default configuration and the operating system's random
    /// number generator.
    pub fn new(card: SC) -> Self {
        Self::with_config(card, SessionConfig::default())
    }

    pub fn with_config(card: SC, config: SessionConfig) -> Self {
        Self::with_rng(card, config, OsRng)
    }

    pub fn with_rng<R: SessionRng + 'static>(card: SC, config: SessionConfig, rng: R) -> Self {
        Self {
            config,
            inner: Mutex::new(SessionInner {
                card,
                state: SessionState::Closed,
                secure_channel: None,
                rng: Box::new(rng),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig { &self.config }

    /// Consumes the session, returning the card.
    pub fn into_card(self) -> SC {
        self.inner.into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .card
    }

    fn lock(&self, operation: Operation) -> Result<MutexGuard<'_, SessionInner<SC>>, Error> {
        self.inner.lock()
            .map_err(|poisoned| Error::InvalidState { operation, state: poisoned.get_ref().state })
    }

    /// Runs an operation that requires an open session, with commands passing through the active
    /// channel.
    fn with_link<T, F>(&self, operation: Operation, run: F) -> Result<T, Error>
        where F: FnOnce(&mut CardLink<'_>) -> Result<T, Error>
    {
        let mut inner = self.lock(operation)?;
        if inner.state == SessionState::Closed {
            return Err(Error::InvalidState { operation, state: inner.state });
        }
        run(&mut inner.link())
    }

    /// Runs a handshake and performs the state transition if it succeeds.
    ///
    /// If the handshake returns a channel, it replaces the active one.
    fn handshake<T, F>(&self, handshake: Handshake, run: F) -> Result<T, Error>
        where F: FnOnce(&mut CardLink<'_>, &mut dyn SessionRng) -> Result<(Option<SecureChannel>, T), Error>
    {
        let operation = handshake.operation();
        let mut guard = self.lock(operation)?;
        let inner = &mut *guard;
        let next_state = inner.state.after(handshake)
            .ok_or(Error::InvalidState { operation, state: inner.state })?;

        let (new_channel, result) = {
            let mut link = CardLink::new(&mut inner.card, inner.secure_channel.as_mut());
            run(&mut link, &mut *inner.rng)?
        };

        if let Some(channel) = new_channel {
            inner.secure_channel = Some(channel.with_mac_check(self.config.mac_check.policy()));
        }
        debug!(from = ?inner.state, to = ?next_state, "session state transition");
        inner.state = next_state;
        Ok(result)
    }

    /// Opens the session.
    pub fn open(&self) -> Result<(), Error> {
        let mut inner = self.lock(Operation::Open)?;
        if inner.state != SessionState::Closed {
            return Err(Error::InvalidState { operation: Operation::Open, state: inner.state });
        }
        inner.state = SessionState::Open;
        debug!("session opened");
        Ok(())
    }

    /// Closes the session, discarding the Secure Messaging channel.
    ///
    /// Always succeeds, even if an earlier operation panicked while holding the session lock.
    pub fn close(&self) {
        let mut inner = self.inner.lock()
            .unwrap_or_else(PoisonError::into_inner);
        inner.secure_channel = None;
        inner.state = SessionState::Closed;
        drop(inner);
        self.inner.clear_poison();
        debug!("session closed");
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// The cipher suite of the active Secure Messaging channel.
    pub fn secure_channel_suite(&self) -> Option<CipherSuite> {
        self.inner.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .secure_channel.as_ref()
            .map(|c| c.suite())
    }

    /// The send sequence counter of the active Secure Messaging channel.
    pub fn send_sequence_counter(&self) -> Option<u128> {
        self.inner.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .secure_channel.as_ref()
            .map(|c| c.send_sequence_counter())
    }

    /// Selects an application by its identifier.
    pub fn select_applet(&self, aid: &[u8]) -> Result<(), Error> {
        self.with_link(Operation::SelectApplet, |link| select_applet(link, aid))
    }

    /// Selects an elementary file by its identifier.
    pub fn select_file(&self, file_id: u16) -> Result<(), Error> {
        self.with_link(Operation::SelectFile, |link| select_file(link, file_id))
    }

    /// Reads up to `length` bytes from the selected file, starting at `offset`.
    pub fn read_binary(&self, offset: usize, length: usize) -> Result<Vec<u8>, Error> {
        self.with_link(Operation::ReadBinary, |link| read_binary(link, &self.config, offset, length))
    }

    /// Selects a file and reads it completely.
    ///
    /// The length is taken from the outer data object of the file.
    pub fn read_file(&self, file_id: u16) -> Result<Vec<u8>, Error> {
        self.with_link(Operation::ReadBinary, |link| {
            select_file(link, file_id)?;
            read_selected_file(link, &self.config)
        })
    }

    /// Performs Basic Access Control.
    #[instrument(skip_all)]
    pub fn do_bac(&self, key: &BacKey) -> Result<(), Error> {
        self.handshake(Handshake::Bac, |link, rng| {
            let channel = bac::establish(link, key, rng)?;
            Ok((Some(channel), ()))
        })
    }

    /// Performs PACE with Generic Mapping.
    ///
    /// If a channel is already active (BAC), the PACE commands are sent through it.
    #[instrument(skip_all)]
    pub fn do_pace(&self, params: &PaceParameters, password: &PacePassword<'_>) -> Result<(), Error> {
        self.handshake(Handshake::Pace, |link, rng| {
            let channel = pace::establish(link, params, password, rng)?;
            Ok((Some(channel), ()))
        })
    }

    /// Performs Chip Authentication with the chip's static public key.
    #[instrument(skip_all)]
    pub fn do_ca(&self, chip_public_key: &ChipPublicKey, key_id: Option<u64>) -> Result<ChipAuthenticationResult, Error> {
        self.handshake(Handshake::ChipAuthentication, |link, rng| {
            let (channel, result) = ca::establish(link, chip_public_key, key_id, rng)?;
            Ok((Some(channel), result))
        })
    }

    /// Performs Terminal Authentication.
    ///
    /// `ca_reference` is the CVCA the chip is expected to trust; if `None`, it is taken from the
    /// chain.
    #[instrument(skip_all)]
    pub fn do_ta(
        &self,
        chip_authentication: &ChipAuthenticationResult,
        chain: &TerminalCertificateChain,
        ca_reference: Option<&str>,
        signer: &dyn TerminalSigner,
        document_number: &str,
    ) -> Result<TerminalAuthenticationResult, Error> {
        let block_size = if self.config.extended_length {
            MAX_EXTENDED_LC
        } else {
            self.config.certificate_block_size
        };
        self.handshake(Handshake::TerminalAuthentication, |link, _rng| {
            let result = ta::authenticate(
                link,
                chip_authentication,
                chain,
                ca_reference,
                signer,
                document_number,
                block_size,
            )?;
            Ok((None, result))
        })
    }
}


fn select_applet(link: &mut CardLink<'_>, aid: &[u8]) -> Result<(), Error> {
    let request = Apdu::new(
        CommandHeader::new(0x00, 0xA4, 0x04, 0x0C), // SELECT by name, no response data
        Data::new(aid.to_vec(), None),
    );
    link.expect_success(Operation::SelectApplet, &request)?;
    Ok(())
}


fn select_file(link: &mut CardLink<'_>, file_id: u16) -> Result<(), Error> {
    let request = Apdu::new(
        CommandHeader::new(0x00, 0xA4, 0x02, 0x0C), // SELECT EF under current DF, no response data
        Data::new(file_id.to_be_bytes().to_vec(), None),
    );
    match link.expect_success(Operation::SelectFile, &request) {
        Ok(_) => Ok(()),
        Err(Error::ProtocolAbort { status: 0x6A82, .. }) => Err(Error::FileNotFound),
        Err(e) => Err(e),
    }
}


/// Sends READ BINARY, adapting the expected length to the status words of the chip.
///
/// `6282` (end of file reached) retries with one byte less, `6Cxx` (wrong length) retries once
/// with the length indicated by the chip.
fn read_binary(link: &mut CardLink<'_>, config: &SessionConfig, offset: usize, length: usize) -> Result<Vec<u8>, Error> {
    const OPERATION: Operation = Operation::ReadBinary;

    let mut length = if config.extended_length { length } else { length.min(MAX_SHORT_NE) };
    let mut corrected_length = false;
    loop {
        if length == 0 {
            return Ok(Vec::new());
        }

        let long_read = offset > MAX_SHORT_READ_OFFSET;
        let request = if long_read {
            // the response is wrapped in a 53 data object; make room for its tag and length
            let wrapped_length = match length {
                0..=127 => length + 2,
                128..=255 => (length + 3).min(MAX_SHORT_NE),
                _ => length,
            };
            let offset_bytes = minimal_be_bytes(offset as u64);
            Apdu::new(
                CommandHeader::new(0x00, 0xB1, 0x00, 0x00),
                Data::new(tlv(0x54, &offset_bytes), Some(wrapped_length)),
            )
        } else {
            let [p1, p2] = (offset as u16).to_be_bytes();
            Apdu::new(
                CommandHeader::new(0x00, 0xB0, p1, p2),
                Data::new(Vec::new(), Some(length)),
            )
        };

        let response = link.transmit(&request)?;
        match response.status() {
            0x9000 => {},
            0x6282 => {
                debug!(offset, length, "end of file reached; retrying with shorter length");
                length -= 1;
                continue;
            },
            status if status & 0xFF00 == 0x6C00 && !corrected_length => {
                corrected_length = true;
                length = match status & 0x00FF {
                    0 => MAX_SHORT_NE,
                    other => usize::from(other),
                };
                continue;
            },
            status => return Err(Error::ProtocolAbort { operation: OPERATION, status }),
        }

        if !long_read {
            return Ok(response.data);
        }
        let (tag, rest) = try_decode_tag(&response.data)
            .ok_or(Error::malformed(OPERATION, "empty response to long READ BINARY"))?;
        if tag != 0x53 {
            return Err(Error::malformed(OPERATION, "long READ BINARY response not wrapped in 53"));
        }
        let (inner_length, value) = try_decode_primitive_length(rest)
            .ok_or(Error::malformed(OPERATION, "invalid length in long READ BINARY response"))?;
        return value.get(..inner_length)
            .map(|v| v.to_vec())
            .ok_or(Error::malformed(OPERATION, "truncated long READ BINARY response"));
    }
}


/// Determines the total length of a file from its first bytes, or `None` if more bytes are needed.
fn file_length_from_header(header: &[u8]) -> Option<usize> {
    if header.first() == Some(&0x42) {
        return Some(CVCA_FILE_LENGTH);
    }
    let (_tag, rest) = try_decode_tag(header)?;
    let (length, value) = try_decode_primitive_length(rest)?;
    let header_length = header.len() - value.len();
    header_length.checked_add(length)
}


/// Reads the currently selected file, which must consist of one outer data object.
fn read_selected_file(link: &mut CardLink<'_>, config: &SessionConfig) -> Result<Vec<u8>, Error> {
    const OPERATION: Operation = Operation::ReadBinary;
    const HEADER_READ_LENGTH: usize = 4;

    let mut contents = read_binary(link, config, 0, HEADER_READ_LENGTH)?;
    let total_length = match file_length_from_header(&contents) {
        Some(length) => length,
        None => {
            // long tag or length; fetch more of the header
            let more = read_binary(link, config, contents.len(), HEADER_READ_LENGTH)?;
            contents.extend_from_slice(&more);
            file_length_from_header(&contents)
                .ok_or(Error::malformed(OPERATION, "file does not start with a data object header"))?
        },
    };

    let max_read_length = config.max_read_length.max(1);
    while contents.len() < total_length {
        let chunk_length = (total_length - contents.len()).min(max_read_length);
        let chunk = read_binary(link, config, contents.len(), chunk_length)?;
        if chunk.is_empty() {
            return Err(Error::malformed(OPERATION, "file ended before its announced length"));
        }
        contents.extend_from_slice(&chunk);
    }
    contents.truncate(total_length);
    debug!(length = contents.len(), "file read");
    Ok(contents)
}


#[cfg(test)]
mod tests {
    use super::{ef_dg, file_length_from_header, Handshake, MacCheckMode, SessionConfig, SessionState};

    #[test]
    fn transitions() {
        use Handshake::*;
        use SessionState::*;

        assert_eq!(Closed.after(Bac), None);
        assert_eq!(Closed.after(Pace), None);
        assert_eq!(Open.after(Bac), Some(BacAuthenticated));
        assert_eq!(Open.after(Pace), Some(BacAuthenticated));
        assert_eq!(BacAuthenticated.after(Pace), Some(BacAuthenticated));
        assert_eq!(BacAuthenticated.after(Bac), None);
        assert_eq!(Open.after(ChipAuthentication), None);
        assert_eq!(BacAuthenticated.after(ChipAuthentication), Some(CaAuthenticated));
        assert_eq!(BacAuthenticated.after(TerminalAuthentication), None);
        assert_eq!(CaAuthenticated.after(TerminalAuthentication), Some(TaAuthenticated));
        assert_eq!(CaAuthenticated.after(Pace), None);
        assert_eq!(TaAuthenticated.after(TerminalAuthentication), None);
    }

    #[test]
    fn file_lengths() {
        // EF.COM from ICAO Doc 9303 Part 11 Appendix D.4
        assert_eq!(file_length_from_header(&[0x60, 0x14, 0x5F, 0x01]), Some(0x16));
        assert_eq!(file_length_from_header(&[0x77, 0x82, 0x01, 0x00]), Some(0x104));
        assert_eq!(file_length_from_header(&[0x7F, 0x61, 0x83, 0x01]), None);
        assert_eq!(file_length_from_header(&[0x7F, 0x61, 0x83, 0x01, 0x00, 0x00, 0x00, 0x00]), Some(0x1_0000 + 6));
        assert_eq!(file_length_from_header(&[0x42, 0x0D, 0x44, 0x45]), Some(36));
        assert_eq!(file_length_from_header(&[]), None);
    }

    #[test]
    fn data_group_ids() {
        assert_eq!(ef_dg(1), 0x0101);
        assert_eq!(ef_dg(14), 0x010E);
    }

    #[test]
    fn config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_read_length, 0xDF);
        assert!(!config.extended_length);
        assert_eq!(config.certificate_block_size, 223);
        assert_eq!(config.mac_check, MacCheckMode::Strict);
    }
}
