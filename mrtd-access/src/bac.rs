//! Basic Access Control.


use rand::{CryptoRng, RngCore};
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::crypt::cipher_mac::{CipherSuite, pad};
use crate::error::{Error, IntegrityError, MismatchedValue, Operation};
use crate::iso7816::apdu::{Apdu, CommandHeader, Data};
use crate::kdf::derive_session_keys;
use crate::mrz::BacKey;
use crate::secure_messaging::{CardLink, SecureChannel};


/// Obtains an 8-byte challenge from the chip.
pub(crate) fn get_challenge(link: &mut CardLink<'_>) -> Result<[u8; 8], Error> {
    let get_challenge_apdu = Apdu::new(
        CommandHeader::new(0x00, 0x84, 0x00, 0x00), // GET CHALLENGE
        Data::new(Vec::new(), Some(8)),
    );
    let response = link.expect_success(Operation::GetChallenge, &get_challenge_apdu)?;
    response.data.as_slice().try_into()
        .map_err(|_| Error::malformed(Operation::GetChallenge, "challenge is not 8 bytes long"))
}


/// XORs the terminal's and the chip's key material into the seed of the session keys.
fn session_key_seed(k_ifd: &[u8; 16], k_ic: &[u8]) -> Zeroizing<[u8; 16]> {
    let mut k_session_seed = Zeroizing::new([0u8; 16]);
    for ((kss, kifd), kic) in k_session_seed.iter_mut().zip(k_ifd.iter()).zip(k_ic.iter()) {
        *kss = *kifd ^ *kic;
    }
    k_session_seed
}


/// Performs BAC with the given key seed and random values, returning the Secure Messaging channel
/// on success.
///
/// `rnd_ic` must have been obtained from the chip using GET CHALLENGE.
#[instrument(skip_all)]
pub fn establish_from_values(
    link: &mut CardLink<'_>,
    k_seed: &[u8],
    rnd_ic: &[u8; 8],
    rnd_ifd: &[u8; 8],
    k_ifd: &[u8; 16],
) -> Result<SecureChannel, Error> {
    let cam = CipherSuite::Tdes.cipher_and_mac();
    let (k_enc, k_mac) = derive_session_keys(k_seed, CipherSuite::Tdes);

    // S = RND.IFD || RND.IC || K.IFD
    let mut e_ifd = Zeroizing::new(Vec::with_capacity(32));
    e_ifd.extend_from_slice(rnd_ifd);
    e_ifd.extend_from_slice(rnd_ic);
    e_ifd.extend_from_slice(k_ifd);
    cam.encrypt_padded_data(&mut e_ifd, &k_enc, &[0u8; 8])?;

    let m_ifd = cam.mac_padded_data(&pad(&e_ifd, 8), &k_mac)?;
    let mut cmd_data = e_ifd.to_vec();
    cmd_data.extend_from_slice(&m_ifd);

    let ext_auth_request = Apdu::new(
        CommandHeader::new(0x00, 0x82, 0x00, 0x00), // EXTERNAL AUTHENTICATE
        Data::new(cmd_data, Some(40)),
    );
    let response = link.expect_success(Operation::MutualAuthenticate, &ext_auth_request)?;
    if response.data.len() != 40 {
        return Err(Error::malformed(Operation::MutualAuthenticate, "response is not 40 bytes long"));
    }

    let (e_ic, m_ic) = response.data.split_at(32);
    if !cam.verify_mac_padded_data(&pad(e_ic, 8), &k_mac, m_ic)? {
        return Err(IntegrityError::ResponseMac.into());
    }

    // R = RND.IC || RND.IFD || K.IC
    let mut r = Zeroizing::new(e_ic.to_vec());
    cam.decrypt_padded_data(&mut r, &k_enc, &[0u8; 8])?;
    if &r[0..8] != rnd_ic {
        return Err(IntegrityError::Mismatch(MismatchedValue::RndIc).into());
    }
    if &r[8..16] != rnd_ifd {
        return Err(IntegrityError::Mismatch(MismatchedValue::RndIfd).into());
    }

    let k_session_seed = session_key_seed(k_ifd, &r[16..32]);
    let (ks_enc, ks_mac) = derive_session_keys(k_session_seed.as_slice(), CipherSuite::Tdes);

    let mut ssc_bytes = [0u8; 8];
    ssc_bytes[0..4].copy_from_slice(&rnd_ic[4..8]);
    ssc_bytes[4..8].copy_from_slice(&rnd_ifd[4..8]);
    let send_sequence_counter = u64::from_be_bytes(ssc_bytes);
    debug!(ssc = send_sequence_counter, "BAC established");

    Ok(SecureChannel::new(CipherSuite::Tdes, &ks_enc, &ks_mac, send_sequence_counter.into())?)
}


/// Performs BAC using the access key from the MRZ, drawing the terminal's random values from
/// `rng`.
#[instrument(skip_all)]
pub fn establish<R: RngCore + CryptoRng + ?Sized>(
    link: &mut CardLink<'_>,
    key: &BacKey,
    rng: &mut R,
) -> Result<SecureChannel, Error> {
    let k_seed = key.bac_key_seed();

    let rnd_ic = get_challenge(link)?;

    let mut rnd_ifd = [0u8; 8];
    let mut k_ifd = Zeroizing::new([0u8; 16]);
    rng.fill_bytes(&mut rnd_ifd);
    rng.fill_bytes(k_ifd.as_mut_slice());

    establish_from_values(link, &k_seed, &rnd_ic, &rnd_ifd, &k_ifd)
}
