//! Secure Messaging as established by BAC, PACE and Chip Authentication.
//!
//! A protected command APDU has the structure:
//! ```plain
//! CLA|0x0C INS P1 P2 Lc [DO85|DO87] [DO97] DO8E Le
//! ```
//! where `DO87` (or `DO85` for instructions with an odd INS byte) holds the encrypted command
//! data, `DO97` the expected response length and `DO8E` the MAC over the send sequence counter,
//! the padded header and the other data objects. A protected response has the structure:
//! ```plain
//! [DO85|DO87] DO99 DO8E SW1 SW2
//! ```
//! with `DO99` holding the status word of the command as processed by the chip.


use std::fmt;

use tracing::{debug, warn};
use zeroize::Zeroizing;
use zeroize_derive::ZeroizeOnDrop;

use crate::crypt::cipher_mac::{CipherSuite, pad, unpad};
use crate::der_util::{TlvIter, write_tlv};
use crate::error::{CryptoError, Error, IntegrityError, Operation};
use crate::iso7816::apdu::{Apdu, Data, MAX_EXTENDED_NE, MAX_SHORT_LC, MAX_SHORT_NE, Response};
use crate::iso7816::card::{SmartCard, trace_exchange};


const SECURE_MESSAGING_CLA: u8 = 0b0000_1100;


/// Decides whether a response is accepted based on its MAC.
pub trait ResponseMacCheck: Sync {
    /// Judges the MAC received from the chip.
    ///
    /// `mac_input` is already padded.
    fn check(&self, suite: CipherSuite, mac_key: &[u8], mac_input: &[u8], received_mac: &[u8]) -> Result<(), Error>;
}


/// Rejects responses whose MAC does not match; the comparison is constant-time.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct VerifyMac;
impl ResponseMacCheck for VerifyMac {
    fn check(&self, suite: CipherSuite, mac_key: &[u8], mac_input: &[u8], received_mac: &[u8]) -> Result<(), Error> {
        if suite.cipher_and_mac().verify_mac_padded_data(mac_input, mac_key, received_mac)? {
            Ok(())
        } else {
            Err(IntegrityError::ResponseMac.into())
        }
    }
}


/// Accepts responses whatever their MAC, logging a warning on mismatch.
///
/// Some chips in circulation compute response MACs incorrectly. Only use this for diagnostics.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct AcceptAnyMac;
impl ResponseMacCheck for AcceptAnyMac {
    fn check(&self, suite: CipherSuite, mac_key: &[u8], mac_input: &[u8], received_mac: &[u8]) -> Result<(), Error> {
        if !suite.cipher_and_mac().verify_mac_padded_data(mac_input, mac_key, received_mac)? {
            warn!("accepting response with mismatched MAC");
        }
        Ok(())
    }
}


/// The state of a Secure Messaging channel: session keys, send sequence counter and cipher suite.
///
/// Key material is zeroized when the channel is dropped.
#[derive(ZeroizeOnDrop)]
pub struct SecureChannel {
    #[zeroize(skip)] suite: CipherSuite,
    enc_key: Vec<u8>,
    mac_key: Vec<u8>,
    send_sequence_counter: u128,
    #[zeroize(skip)] mac_check: &'static dyn ResponseMacCheck,
}
impl SecureChannel {
    /// Creates a channel with the given session keys and initial send sequence counter.
    ///
    /// For 3DES, only the lower 64 bits of the counter are used.
    pub fn new(suite: CipherSuite, enc_key: &[u8], mac_key: &[u8], send_sequence_counter: u128) -> Result<Self, CryptoError> {
        for key in [enc_key, mac_key] {
            if key.len() != suite.key_size() {
                return Err(CryptoError::InvalidKeyLength { expected: suite.key_size(), obtained: key.len() });
            }
        }
        let mut channel = Self {
            suite,
            enc_key: enc_key.to_vec(),
            mac_key: mac_key.to_vec(),
            send_sequence_counter: 0,
            mac_check: &VerifyMac,
        };
        channel.set_send_sequence_counter(send_sequence_counter);
        Ok(channel)
    }

    /// Replaces the policy used to judge response MACs.
    pub fn with_mac_check(mut self, mac_check: &'static dyn ResponseMacCheck) -> Self {
        self.mac_check = mac_check;
        self
    }

    pub fn suite(&self) -> CipherSuite { self.suite }
    pub fn send_sequence_counter(&self) -> u128 { self.send_sequence_counter }
    pub fn mac_check(&self) -> &'static dyn ResponseMacCheck { self.mac_check }

    fn set_send_sequence_counter(&mut self, value: u128) {
        self.send_sequence_counter = match self.suite {
            CipherSuite::Tdes => value & u128::from(u64::MAX),
            _ => value,
        };
    }

    fn increment_send_sequence_counter(&mut self) {
        self.set_send_sequence_counter(self.send_sequence_counter.wrapping_add(1));
    }

    /// The send sequence counter as a big-endian byte string of the cipher's block size.
    fn send_sequence_counter_bytes(&self) -> Vec<u8> {
        let bytes = self.send_sequence_counter.to_be_bytes();
        bytes[bytes.len() - self.suite.block_size()..].to_vec()
    }

    /// The CBC IV: zero for 3DES, the encrypted send sequence counter for AES.
    fn iv(&self) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let block_size = self.suite.block_size();
        if !self.suite.is_aes() {
            return Ok(Zeroizing::new(vec![0u8; block_size]));
        }
        let mut iv = Zeroizing::new(self.send_sequence_counter_bytes());
        self.suite.cipher_and_mac().encrypt_padded_data(&mut iv, &self.enc_key, &vec![0u8; block_size])?;
        Ok(iv)
    }

    fn mac(&self, data: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let mut mac_input = self.send_sequence_counter_bytes();
        mac_input.extend_from_slice(data);
        let padded = pad(&mac_input, self.suite.block_size());
        self.suite.cipher_and_mac().mac_padded_data(&padded, &self.mac_key)
    }

    /// Protects a command APDU.
    ///
    /// Increments the send sequence counter.
    pub fn wrap(&mut self, request: &Apdu) -> Result<Apdu, Error> {
        let block_size = self.suite.block_size();

        let mut header = request.header;
        header.cla |= SECURE_MESSAGING_CLA;
        let padded_header = pad(&header.to_bytes(), block_size);

        self.increment_send_sequence_counter();

        let mut body = Vec::new();
        if let Some(request_data) = request.data.request_data() {
            let mut encrypted = Zeroizing::new(pad(request_data, block_size));
            let iv = self.iv()?;
            self.suite.cipher_and_mac().encrypt_padded_data(&mut encrypted, &self.enc_key, &iv)?;
            if header.ins & 0x01 == 0x01 {
                // odd INS: BER-TLV payload, no padding-content indicator
                write_tlv(&mut body, 0x85, &encrypted);
            } else {
                let mut value = Vec::with_capacity(1 + encrypted.len());
                value.push(0x01); // ISO/IEC 9797-1 padding method 2
                value.extend_from_slice(&encrypted);
                write_tlv(&mut body, 0x87, &value);
            }
        }

        let expected = request.data.expected_response_length();
        if let Some(ne) = expected {
            if ne <= MAX_SHORT_NE {
                write_tlv(&mut body, 0x97, &[(ne % MAX_SHORT_NE) as u8]);
            } else {
                write_tlv(&mut body, 0x97, &((ne % MAX_EXTENDED_NE) as u16).to_be_bytes());
            }
        }

        let mut mac_data = padded_header;
        mac_data.extend_from_slice(&body);
        let mac = self.mac(&mac_data)?;
        write_tlv(&mut body, 0x8E, &mac);

        let extended = body.len() > MAX_SHORT_LC || expected.map(|ne| ne > MAX_SHORT_NE).unwrap_or(false);
        let protected_ne = if extended { MAX_EXTENDED_NE } else { MAX_SHORT_NE };
        Ok(Apdu::new(header, Data::new(body, Some(protected_ne))))
    }

    /// Verifies and decrypts a protected response APDU.
    ///
    /// Increments the send sequence counter, whether or not the response is accepted.
    pub fn unwrap(&mut self, response: &Response) -> Result<Response, Error> {
        const OPERATION: Operation = Operation::SecureMessaging;

        self.increment_send_sequence_counter();

        if response.data.is_empty() {
            // the chip rejected the command at the Secure Messaging layer
            return Err(Error::ProtocolAbort { operation: OPERATION, status: response.status() });
        }

        let mut mac_data = Vec::with_capacity(response.data.len());
        let mut encrypted_object = None;
        let mut status_object = None;
        let mut received_mac = None;
        for tlv_res in TlvIter::new(&response.data) {
            let tlv = tlv_res
                .map_err(|_| Error::malformed(OPERATION, "invalid data object encoding"))?;
            if tlv.tag == 0x8E {
                received_mac = Some(tlv.value);
                continue;
            }
            if tlv.tag & 0x01 == 0x01 {
                mac_data.extend_from_slice(tlv.raw);
            }
            match tlv.tag {
                0x85|0x87 => encrypted_object = Some((tlv.tag, tlv.value)),
                0x99 => status_object = Some(tlv.value),
                _ => {},
            }
        }

        let received_mac = received_mac.ok_or(IntegrityError::MissingResponseMac)?;
        let mut mac_input = self.send_sequence_counter_bytes();
        mac_input.extend_from_slice(&mac_data);
        let padded_mac_input = pad(&mac_input, self.suite.block_size());
        self.mac_check.check(self.suite, &self.mac_key, &padded_mac_input, received_mac)?;

        let data = match encrypted_object {
            None => Vec::new(),
            Some((tag, value)) => {
                let ciphertext = if tag == 0x87 {
                    match value.split_first() {
                        Some((0x01, rest)) => rest,
                        _ => return Err(Error::malformed(OPERATION, "unknown padding-content indicator")),
                    }
                } else {
                    value
                };
                let mut plaintext = Zeroizing::new(ciphertext.to_vec());
                let iv = self.iv()?;
                self.suite.cipher_and_mac().decrypt_padded_data(&mut plaintext, &self.enc_key, &iv)?;
                unpad(&plaintext)?.to_vec()
            },
        };

        let status = match status_object {
            Some(&[sw1, sw2]) => u16::from_be_bytes([sw1, sw2]),
            Some(_) => return Err(Error::malformed(OPERATION, "status data object has wrong length")),
            None => return Err(Error::malformed(OPERATION, "status data object missing")),
        };
        Ok(Response::new(data, status))
    }
}
impl fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannel")
            .field("suite", &self.suite)
            .field("send_sequence_counter", &self.send_sequence_counter)
            .finish_non_exhaustive()
    }
}


/// A smart card together with the Secure Messaging channel (if any) that commands pass through.
pub struct CardLink<'a> {
    card: &'a mut dyn SmartCard,
    secure_channel: Option<&'a mut SecureChannel>,
}
impl<'a> CardLink<'a> {
    pub fn new(card: &'a mut dyn SmartCard, secure_channel: Option<&'a mut SecureChannel>) -> Self {
        Self { card, secure_channel }
    }

    /// A link sending commands without Secure Messaging.
    pub fn plain(card: &'a mut dyn SmartCard) -> Self {
        Self::new(card, None)
    }

    pub fn secure_channel(&self) -> Option<&SecureChannel> {
        self.secure_channel.as_deref()
    }

    /// Sends a command, protecting it if a Secure Messaging channel is active.
    pub fn transmit(&mut self, request: &Apdu) -> Result<Response, Error> {
        match self.secure_channel.as_deref_mut() {
            None => {
                let response = self.card.communicate(request)?;
                trace_exchange("plain", request, &response);
                Ok(response)
            },
            Some(channel) => {
                let protected_request = channel.wrap(request)?;
                let protected_response = self.card.communicate(&protected_request)?;
                trace_exchange("protected", &protected_request, &protected_response);
                let response = channel.unwrap(&protected_response)?;
                trace_exchange("unprotected", request, &response);
                debug!(ssc = channel.send_sequence_counter(), status = response.status(), "secure messaging exchange");
                Ok(response)
            },
        }
    }

    /// Sends a command and fails with [`Error::ProtocolAbort`] unless the status is `9000`.
    pub fn expect_success(&mut self, operation: Operation, request: &Apdu) -> Result<Response, Error> {
        let response = self.transmit(request)?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(Error::ProtocolAbort { operation, status: response.status() })
        }
    }
}


#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::{AcceptAnyMac, SecureChannel};
    use crate::crypt::cipher_mac::{CipherSuite, pad};
    use crate::der_util::tlv;
    use crate::error::{Error, IntegrityError};
    use crate::iso7816::apdu::{Apdu, CommandHeader, Data, Response};

    // ICAO Doc 9303 Part 11 Appendix D.4
    const KS_ENC: [u8; 16] = hex!("979EC13B1CBFE9DCD01AB0FED307EAE5");
    const KS_MAC: [u8; 16] = hex!("F1CB1F1FB5ADF208806B89DC579DC1F8");
    const SSC: u128 = 0x887022120C06C226;

    fn appendix_d_channel() -> SecureChannel {
        SecureChannel::new(CipherSuite::Tdes, &KS_ENC, &KS_MAC, SSC).unwrap()
    }

    #[test]
    fn select_ef_com_icao_appendix_d() {
        let mut channel = appendix_d_channel();
        let select = Apdu::new(
            CommandHeader::new(0x00, 0xA4, 0x02, 0x0C),
            Data::new(vec![0x01, 0x1E], None),
        );
        let protected = channel.wrap(&select).unwrap();
        assert_eq!(
            protected.to_bytes().unwrap(),
            hex!("0CA4020C158709016375432908C044F68E08BF8B92D635FF24F800"),
        );
        assert_eq!(channel.send_sequence_counter(), 0x887022120C06C227);

        let response = channel.unwrap(&Response::new(hex!("990290008E08FA855A5D4C50A8ED").to_vec(), 0x9000)).unwrap();
        assert_eq!(response.status(), 0x9000);
        assert!(response.data.is_empty());
        assert_eq!(channel.send_sequence_counter(), 0x887022120C06C228);
    }

    #[test]
    fn read_binary_icao_appendix_d() {
        let mut channel = SecureChannel::new(CipherSuite::Tdes, &KS_ENC, &KS_MAC, 0x887022120C06C228).unwrap();
        let read = Apdu::new(
            CommandHeader::new(0x00, 0xB0, 0x00, 0x00),
            Data::new(Vec::new(), Some(4)),
        );
        let protected = channel.wrap(&read).unwrap();
        assert_eq!(protected.to_bytes().unwrap(), hex!("0CB000000D9701048E08ED6705417E96BA5500"));

        let response = channel.unwrap(&Response::new(
            hex!("8709019FF0EC34F9922651990290008E08AD55CC17140B2DED").to_vec(),
            0x9000,
        )).unwrap();
        assert_eq!(response.data, hex!("60145F01"));
        assert_eq!(response.status(), 0x9000);
    }

    #[test]
    fn send_sequence_counter_advances_on_every_call() {
        let mac_key = [0x22u8; 16];
        let mut channel = SecureChannel::new(CipherSuite::Aes128, &[0x11; 16], &mac_key, 0).unwrap();
        let request = Apdu::new(CommandHeader::new(0x00, 0x84, 0x00, 0x00), Data::new(Vec::new(), Some(8)));
        for _ in 0..3 {
            channel.wrap(&request).unwrap();
        }

        // a correctly MACed response
        let chip = SecureChannel::new(CipherSuite::Aes128, &[0x11; 16], &mac_key, 4).unwrap();
        let mut body = tlv(0x99, &[0x90, 0x00]);
        let mac = chip.mac(&body).unwrap();
        body.extend(tlv(0x8E, &mac));
        assert_eq!(channel.unwrap(&Response::new(body, 0x9000)).unwrap().status(), 0x9000);
        assert_eq!(channel.send_sequence_counter(), 4);

        // a response whose MAC is wrong
        let forged = Response::new(hex!("990290008E080000000000000000").to_vec(), 0x9000);
        assert!(matches!(channel.unwrap(&forged), Err(Error::IntegrityFailure(IntegrityError::ResponseMac))));
        assert_eq!(channel.send_sequence_counter(), 5);

        // a response without any MAC
        let unmacced = Response::new(hex!("99029000").to_vec(), 0x9000);
        assert!(matches!(channel.unwrap(&unmacced), Err(Error::IntegrityFailure(IntegrityError::MissingResponseMac))));
        assert_eq!(channel.send_sequence_counter(), 6);
    }

    #[test]
    fn status_only_response_aborts() {
        let mut channel = appendix_d_channel();
        let err = channel.unwrap(&Response::new(Vec::new(), 0x6988)).unwrap_err();
        assert!(matches!(err, Error::ProtocolAbort { status: 0x6988, .. }));
        assert_eq!(channel.send_sequence_counter(), SSC + 1);
    }

    #[test]
    fn lenient_mac_check() {
        let mut channel = appendix_d_channel().with_mac_check(&AcceptAnyMac);
        let forged = Response::new(hex!("990290008E080000000000000000").to_vec(), 0x9000);
        assert_eq!(channel.unwrap(&forged).unwrap().status(), 0x9000);
    }

    #[test]
    fn aes_response_with_data() {
        // build the response the way the chip would, then check that it unwraps
        let enc_key = [0x42u8; 16];
        let mac_key = [0x24u8; 16];
        let mut channel = SecureChannel::new(CipherSuite::Aes128, &enc_key, &mac_key, 0x41).unwrap();
        let chip = SecureChannel::new(CipherSuite::Aes128, &enc_key, &mac_key, 0x42).unwrap();

        let plaintext = b"ICAO 9303 response data".to_vec();
        let mut encrypted = pad(&plaintext, 16);
        let iv = chip.iv().unwrap();
        CipherSuite::Aes128.cipher_and_mac().encrypt_padded_data(&mut encrypted, &enc_key, &iv).unwrap();
        let mut do87_value = vec![0x01];
        do87_value.extend_from_slice(&encrypted);
        let mut body = tlv(0x87, &do87_value);
        body.extend(tlv(0x99, &[0x90, 0x00]));
        let mac = chip.mac(&body).unwrap();
        body.extend(tlv(0x8E, &mac));

        let response = channel.unwrap(&Response::new(body, 0x9000)).unwrap();
        assert_eq!(response.data, plaintext);
        assert_eq!(channel.send_sequence_counter(), 0x42);
    }

    #[test]
    fn odd_instruction_and_extended_length() {
        let mut channel = SecureChannel::new(CipherSuite::Aes256, &[0x01; 32], &[0x02; 32], 0).unwrap();
        let read = Apdu::new(
            CommandHeader::new(0x00, 0xB1, 0x00, 0x00),
            Data::new(vec![0x54, 0x02, 0x80, 0x00], Some(0x1000)),
        );
        let protected = channel.wrap(&read).unwrap();
        assert_eq!(protected.header.cla, 0x0C);
        assert!(protected.data.is_extended());
        assert_eq!(protected.data.expected_response_length(), Some(65536));
        let body = protected.data.request_data().unwrap();
        // DO85 carries one AES block of ciphertext without padding-content indicator
        assert_eq!(&body[..2], &[0x85, 0x10]);
        assert_eq!(&body[18..22], &hex!("9702 1000"));
        assert_eq!(&body[22..24], &[0x8E, 0x08]);
    }

    #[test]
    fn rejects_wrong_key_sizes() {
        assert!(SecureChannel::new(CipherSuite::Aes192, &[0; 16], &[0; 24], 0).is_err());
        let channel = SecureChannel::new(CipherSuite::Tdes, &[0; 16], &[0; 16], u128::MAX).unwrap();
        assert_eq!(channel.send_sequence_counter(), u128::from(u64::MAX));
    }
}
