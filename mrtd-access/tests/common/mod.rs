//! Test doubles shared by the integration tests: a card that answers a fixed script of APDUs and
//! a random number generator that hands out fixed bytes.
#![allow(dead_code)]


use std::collections::VecDeque;

use mrtd_access::crypt::cipher_mac::{CipherSuite, pad};
use mrtd_access::iso7816::apdu::{Apdu, CommandHeader, Data, Response};
use mrtd_access::iso7816::card::{CommunicationError, SmartCard};
use mrtd_access::secure_messaging::SecureChannel;
use rand::{CryptoRng, RngCore};


pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}


pub fn apdu(header: [u8; 4], request_data: &[u8], expected: Option<usize>) -> Apdu {
    let [cla, ins, p1, p2] = header;
    Apdu::new(CommandHeader::new(cla, ins, p1, p2), Data::new(request_data.to_vec(), expected))
}

/// Serializes a command APDU.
pub fn command(header: [u8; 4], request_data: &[u8], expected: Option<usize>) -> Vec<u8> {
    apdu(header, request_data, expected)
        .to_bytes()
        .expect("failed to serialize command")
}


/// A command the card expects and the response it gives.
#[derive(Clone, Debug)]
pub struct Exchange {
    pub command: Vec<u8>,
    pub response: Response,
}
impl Exchange {
    pub fn new(command: Vec<u8>, response_data: &[u8], status: u16) -> Self {
        Self { command, response: Response::new(response_data.to_vec(), status) }
    }

    pub fn ok(command: Vec<u8>, response_data: &[u8]) -> Self {
        Self::new(command, response_data, 0x9000)
    }
}


/// A fake smart card that expects the commands of its script in order.
///
/// Any command that does not match the next expected one is answered with 0x69 0x88 (incorrect
/// Secure Messaging data objects) and does not advance the script.
#[derive(Debug, Default)]
pub struct ScriptedCard {
    script: VecDeque<Exchange>,
    pub received: Vec<Vec<u8>>,
}
impl ScriptedCard {
    pub fn new<I: IntoIterator<Item = Exchange>>(script: I) -> Self {
        Self {
            script: script.into_iter().collect(),
            received: Vec::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}
impl SmartCard for ScriptedCard {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        let command = request.to_bytes()?;
        println!("ScriptedCard received: {:02X?}", command);
        self.received.push(command.clone());
        match self.script.front() {
            Some(exchange) if exchange.command == command => {
                let exchange = self.script.pop_front().unwrap();
                Ok(exchange.response)
            },
            _ => Ok(Response::new(Vec::new(), 0x6988)),
        }
    }
}


/// Protects a plain exchange under 3DES Secure Messaging.
///
/// `channel` plays the terminal and is advanced past the exchange. The response is encrypted
/// under `enc_key` as the chip would encrypt it but carries an all-zero MAC, so it is only
/// accepted by a session that does not verify response MACs.
pub fn protect_tdes(channel: &mut SecureChannel, enc_key: &[u8], request: &Apdu, response_data: &[u8]) -> Exchange {
    let protected_command = channel.wrap(request)
        .expect("failed to protect command")
        .to_bytes()
        .expect("failed to serialize command");

    let mut body = Vec::new();
    if !response_data.is_empty() {
        let mut encrypted = pad(response_data, 8);
        CipherSuite::Tdes.cipher_and_mac()
            .encrypt_padded_data(&mut encrypted, enc_key, &[0u8; 8])
            .expect("failed to encrypt response");
        body.push(0x87);
        body.push(u8::try_from(encrypted.len() + 1).expect("response too long"));
        body.push(0x01);
        body.extend_from_slice(&encrypted);
    }
    body.extend_from_slice(&[0x99, 0x02, 0x90, 0x00, 0x8E, 0x08]);
    body.extend_from_slice(&[0x00; 8]);

    let unprotected = channel.unwrap(&Response::new(body.clone(), 0x9000))
        .expect("failed to unprotect response");
    assert_eq!(unprotected.data, response_data);

    Exchange::ok(protected_command, &body)
}


/// Returns predetermined bytes in order; panics once they run out.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRng {
    bytes: VecDeque<u8>,
}
impl ScriptedRng {
    pub fn new(chunks: &[&[u8]]) -> Self {
        Self {
            bytes: chunks.iter().flat_map(|c| c.iter().copied()).collect(),
        }
    }
}
impl RngCore for ScriptedRng {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.fill_bytes(&mut buf);
        u32::from_le_bytes(buf)
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.fill_bytes(&mut buf);
        u64::from_le_bytes(buf)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for b in dest {
            *b = self.bytes.pop_front().expect("scripted randomness exhausted");
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}
impl CryptoRng for ScriptedRng {}


/// The BAC and Secure Messaging example of ICAO Doc 9303 Part 11 Appendix D.
pub mod appendix_d {
    use hex_literal::hex;
    use mrtd_access::bac;
    use mrtd_access::secure_messaging::{AcceptAnyMac, CardLink, SecureChannel};

    use super::{command, Exchange, ScriptedCard};

    pub const DOCUMENT_NUMBER: &str = "L898902C<";
    pub const DATE_OF_BIRTH: &str = "690806";
    pub const DATE_OF_EXPIRY: &str = "940623";

    pub const K_SEED: [u8; 16] = hex!("239AB9CB282DAF66231DC5A4DF6BFBAE");
    pub const RND_IC: [u8; 8] = hex!("4608F91988702212");
    pub const RND_IFD: [u8; 8] = hex!("781723860C06C226");
    pub const K_IFD: [u8; 16] = hex!("0B795240CB7049B01C19B33E32804F0B");
    pub const SSC_AFTER_BAC: u128 = 0x887022120C06C226;
    pub const KS_ENC: [u8; 16] = hex!("979EC13B1CBFE9DCD01AB0FED307EAE5");

    const EXTERNAL_AUTHENTICATE_PAYLOAD: [u8; 40] = hex!("72C29C2371CC9BDB65B779B8E8D37B29ECC154AA56A8799FAE2F498F76ED92F25F1448EEA8AD90A7");
    const EXTERNAL_AUTHENTICATE_RESPONSE: [u8; 40] = hex!("46B9342A41396CD7386BF5803104D7CEDC122B9132139BAF2EEDC94EE178534F2F2D235D074D7449");
    const SELECT_PAYLOAD: [u8; 21] = hex!("8709016375432908C044F68E08BF8B92D635FF24F8");
    const SELECT_RESPONSE: [u8; 14] = hex!("990290008E08FA855A5D4C50A8ED");
    const READ_4_PAYLOAD: [u8; 13] = hex!("9701048E08ED6705417E96BA55");
    const READ_4_RESPONSE: [u8; 25] = hex!("8709019FF0EC34F9922651990290008E08AD55CC17140B2DED");
    const READ_REST_PAYLOAD: [u8; 13] = hex!("9701128E082EA28A70F3C7B535");
    const READ_REST_RESPONSE: [u8; 41] = hex!("871901FB9235F4E4037F2327DCC8964F1F9B8C30F42C8E2FFF224A990290008E08C8B2787EAEA07D74");

    pub const DECRYPTED_READ_4: [u8; 4] = hex!("60145F01");
    pub const DECRYPTED_READ_REST: [u8; 18] = hex!("04303130365F36063034303030305C026175");

    pub fn bac_script() -> Vec<Exchange> {
        vec![
            Exchange::ok(command([0x00, 0x84, 0x00, 0x00], &[], Some(8)), &RND_IC),
            Exchange::ok(
                command([0x00, 0x82, 0x00, 0x00], &EXTERNAL_AUTHENTICATE_PAYLOAD, Some(0x28)),
                &EXTERNAL_AUTHENTICATE_RESPONSE,
            ),
        ]
    }

    /// The channel established by [`bac_script`], computed apart from any session and accepting
    /// any response MAC.
    pub fn bac_channel() -> SecureChannel {
        let mut script = bac_script();
        let external_authenticate = script.split_off(1);
        let mut card = ScriptedCard::new(external_authenticate);
        let mut link = CardLink::plain(&mut card);
        bac::establish_from_values(&mut link, &K_SEED, &RND_IC, &RND_IFD, &K_IFD)
            .expect("failed to establish BAC")
            .with_mac_check(&AcceptAnyMac)
    }

    /// Selecting and reading EF.COM under Secure Messaging, following [`bac_script`].
    pub fn read_com_script() -> Vec<Exchange> {
        vec![
            Exchange::ok(command([0x0C, 0xA4, 0x02, 0x0C], &SELECT_PAYLOAD, Some(256)), &SELECT_RESPONSE),
            Exchange::ok(command([0x0C, 0xB0, 0x00, 0x00], &READ_4_PAYLOAD, Some(256)), &READ_4_RESPONSE),
            Exchange::ok(command([0x0C, 0xB0, 0x00, 0x04], &READ_REST_PAYLOAD, Some(256)), &READ_REST_RESPONSE),
        ]
    }
}


/// The PACE example with ECDH Generic Mapping of ICAO Doc 9303 Part 11 Appendix G.1.
pub mod appendix_g1 {
    use hex_literal::hex;
    use mrtd_access::iso7816::apdu::Apdu;

    use super::{apdu, Exchange};

    pub const DOCUMENT_NUMBER: &str = "T22000129";
    pub const DATE_OF_BIRTH: &str = "640812";
    pub const DATE_OF_EXPIRY: &str = "101031";

    pub const MAPPING_PRIVATE_KEY: [u8; 32] = hex!("
        7F4EF07B 9EA82FD7 8AD689B3 8D0BC78C
        F21F249D 953BC46F 4C6E1925 9C010F99
    ");
    pub const AGREEMENT_PRIVATE_KEY: [u8; 32] = hex!("
        A73FB703 AC1436A1 8E0CFA5A BB3F7BEC
        7A070E7A 6788486B EE230C4A 22762595
    ");

    /// The public key belonging to [`MAPPING_PRIVATE_KEY`] on brainpoolP256r1.
    pub const MAPPING_PUBLIC_KEY: [u8; 65] = hex!("
        04 7A CF 3E FC 98 2E C4 55 65 A4 B1 55
        12 9E FB C7 46 50 DC BF A6 36 2D 89 6F C7 02 62 E0 C2 CC 5E 54 45
        52 DC B6 72 52 18 79 91 15 B5 5C 9B AA 6D 9F 6B C3 A9 61 8E 70 C2
        5A F7 17 77 A9 C4 92 2D
    ");

    /// The chip's public key of the mapping step.
    pub const CHIP_MAPPING_PUBLIC_KEY: [u8; 65] = hex!("
        04 82 4F BA 91 C9 CB E2 6B EF 53 A0 EB E7 34 2A 3B F1
        78 CE A9 F4 5D E0 B7 0A A6 01 65 1F BA 3F 57 30 D8 C8 79 AA A9 C9
        F7 39 91 E6 1B 58 F4 D5 2E B8 7A 0A 0C 70 9A 49 DC 63 71 93 63 CC
        D1 3C 54
    ");

    const MSE_SET_AT_PAYLOAD: [u8; 15] = hex!("80 0A 04 00 7F 00 07 02 02 04 02 02 83 01 01");
    const GA_NONCE_RESPONSE: [u8; 20] = hex!("7C 12 80 10 95 A3 A0 16 52 2E E9 8D 01 E7 6C B6 B9 8B 42 C3");
    const GA_AGREEMENT_PAYLOAD: [u8; 69] = hex!("
        7C 43 83 41 04 2D B7 A6 4C 03 55 04 4E C9 DF 19
        05 14 C6 25 CB A2 CE A4 87 54 88 71 22 F3 A5 EF 0D 5E DD 30 1C
        35 56 F3 B3 B1 86 DF 10 B8 57 B5 8F 6A 7E B8 0F 20 BA 5D C7 BE
        1D 43 D9 BF 85 01 49 FB B3 64 62
    ");
    const GA_AGREEMENT_RESPONSE: [u8; 69] = hex!("
        7C 43 84 41 04 9E 88 0F 84 29 05 B8 B3 18 1F 7A F7 CA A9 F0 EF
        B7 43 84 7F 44 A3 06 D2 D2 8C 1D 9E C6 5D F6 DB 77 64 B2 22 77
        A2 ED DC 3C 26 5A 9F 01 8F 9C B8 52 E1 11 B7 68 B3 26 90 4B 59
        A0 19 37 76 F0 94
    ");
    const GA_MUTUAL_PAYLOAD: [u8; 12] = hex!("7C 0A 85 08 C2 B0 BD 78 D9 4B A8 66");
    pub const GA_MUTUAL_RESPONSE: [u8; 12] = hex!("7C 0A 86 08 3A BB 96 74 BC E9 3C 08");

    fn dynamic_authentication_data(tag: u8, public_key: &[u8; 65]) -> Vec<u8> {
        let mut ret = vec![0x7C, 0x43, tag, 0x41];
        ret.extend_from_slice(public_key);
        ret
    }

    /// The PACE commands and the chip's answers, with the chip answering the mutual
    /// authentication with `mutual_response`.
    pub fn pace_exchanges(mutual_response: &[u8]) -> Vec<(Apdu, Vec<u8>)> {
        vec![
            (apdu([0x00, 0x22, 0xC1, 0xA4], &MSE_SET_AT_PAYLOAD, None), Vec::new()),
            (apdu([0x10, 0x86, 0x00, 0x00], &[0x7C, 0x00], Some(256)), GA_NONCE_RESPONSE.to_vec()),
            (
                apdu([0x10, 0x86, 0x00, 0x00], &dynamic_authentication_data(0x81, &MAPPING_PUBLIC_KEY), Some(256)),
                dynamic_authentication_data(0x82, &CHIP_MAPPING_PUBLIC_KEY),
            ),
            (apdu([0x10, 0x86, 0x00, 0x00], &GA_AGREEMENT_PAYLOAD, Some(256)), GA_AGREEMENT_RESPONSE.to_vec()),
            (apdu([0x00, 0x86, 0x00, 0x00], &GA_MUTUAL_PAYLOAD, Some(256)), mutual_response.to_vec()),
        ]
    }

    /// The PACE exchanges without Secure Messaging.
    pub fn pace_script(mutual_response: &[u8]) -> Vec<Exchange> {
        pace_exchanges(mutual_response)
            .into_iter()
            .map(|(request, response)| {
                let command = request.to_bytes().expect("failed to serialize command");
                Exchange::ok(command, &response)
            })
            .collect()
    }
}
