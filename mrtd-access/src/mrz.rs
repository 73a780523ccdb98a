//! The access key printed in the machine-readable zone.
//!
//! BAC and PACE with an MRZ password both derive their keys from the same three fields of the MRZ
//! together with their check digits:
//! ```plain
//! NNNNNNNNNCBBBBBBDEEEEEEF
//! ```
//! with
//! * `NNNNNNNNN`: document number (right-padded with `<`)
//! * `C`: check digit of document number
//! * `BBBBBB`: date of birth as YYMMDD
//! * `D`: check digit of date of birth
//! * `EEEEEE`: date of expiry as YYMMDD
//! * `F`: check digit of date of expiry


use std::fmt::Write;

use digest::Digest;
use sha1::Sha1;
use smallstr::SmallString;
use thiserror::Error;
use zeroize::Zeroizing;


/// Length of the document number field in the MRZ.
pub const DOCUMENT_NUMBER_LENGTH: usize = 9;


#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum MrzError {
    #[error("document number {0:?} is empty, longer than 9 characters or contains characters other than A-Z, 0-9 and <")]
    DocumentNumber(String),

    #[error("{0:?} is not a date in YYMMDD format")]
    Date(String),

    #[error("MRZ line has length {0}, expected 44")]
    LineLength(usize),
}


/// The fields of the MRZ from which BAC and PACE keys are derived.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BacKey {
    document_number: SmallString<[u8; 9]>,
    date_of_birth: SmallString<[u8; 6]>,
    date_of_expiry: SmallString<[u8; 6]>,
}
impl BacKey {
    /// Creates a new access key.
    ///
    /// Trailing filler characters (`<`) are removed from the document number.
    pub fn new(document_number: &str, date_of_birth: &str, date_of_expiry: &str) -> Result<Self, MrzError> {
        let trimmed_number = document_number.trim_end_matches('<');
        let number_valid = !trimmed_number.is_empty()
            && trimmed_number.len() <= DOCUMENT_NUMBER_LENGTH
            && trimmed_number.bytes().all(|b| b.is_ascii_digit() || b.is_ascii_uppercase() || b == b'<');
        if !number_valid {
            return Err(MrzError::DocumentNumber(document_number.to_owned()));
        }
        for date in [date_of_birth, date_of_expiry] {
            if date.len() != 6 || !date.bytes().all(|b| b.is_ascii_digit()) {
                return Err(MrzError::Date(date.to_owned()));
            }
        }
        Ok(Self {
            document_number: SmallString::from_str(trimmed_number),
            date_of_birth: SmallString::from_str(date_of_birth),
            date_of_expiry: SmallString::from_str(date_of_expiry),
        })
    }

    /// Extracts the access key from the second line of a TD3 (passport) MRZ.
    ///
    /// The line layout is:
    /// ```plain
    /// NNNNNNNNNCAAABBBBBBDXEEEEEEFOOOOOOOOOOOOOOQG
    /// ```
    /// Check digits in the line are not verified; they are recomputed from the fields.
    pub fn from_td3_line(line: &str) -> Result<Self, MrzError> {
        if line.len() != 44 || !line.is_ascii() {
            return Err(MrzError::LineLength(line.len()));
        }
        Self::new(&line[0..9], &line[13..19], &line[21..27])
    }

    /// The document number without trailing filler characters.
    pub fn document_number(&self) -> &str { &self.document_number }
    pub fn date_of_birth(&self) -> &str { &self.date_of_birth }
    pub fn date_of_expiry(&self) -> &str { &self.date_of_expiry }

    /// The MRZ information: document number, date of birth and date of expiry, each followed by
    /// its check digit.
    pub fn mrz_information(&self) -> Zeroizing<String> {
        let mut ret = Zeroizing::new(String::with_capacity(9 + 1 + 6 + 1 + 6 + 1));
        ret.push_str(&document_number_with_check_digit(self.document_number()));
        for field in [self.date_of_birth.as_str(), self.date_of_expiry.as_str()] {
            ret.push_str(field);
            // writing to a String is infallible
            let _ = write!(ret, "{}", check_digit(field.as_bytes()));
        }
        ret
    }

    /// The key seed for BAC: the first 16 bytes of the SHA-1 hash of the MRZ information.
    pub fn bac_key_seed(&self) -> Zeroizing<Vec<u8>> {
        let mut seed = self.pace_key_seed();
        seed.truncate(16);
        seed
    }

    /// The PACE password derived from the MRZ: the SHA-1 hash of the MRZ information.
    pub fn pace_key_seed(&self) -> Zeroizing<Vec<u8>> {
        let information = self.mrz_information();
        Zeroizing::new(Sha1::digest(information.as_bytes()).to_vec())
    }
}


/// The document number right-padded with `<` to 9 characters and followed by its check digit.
///
/// Trailing filler characters in `document_number` are ignored. Terminal Authentication signs
/// this as the chip identifier of BAC-protected documents.
pub fn document_number_with_check_digit(document_number: &str) -> SmallString<[u8; 10]> {
    let mut ret: SmallString<[u8; 10]> = SmallString::from_str(document_number.trim_end_matches('<'));
    while ret.len() < DOCUMENT_NUMBER_LENGTH {
        ret.push('<');
    }
    ret.push(char::from(b'0' + check_digit(ret.as_bytes())));
    ret
}


/// Calculates the check digit over MRZ characters.
///
/// Digits have their own value, letters `A` to `Z` the values 10 to 35; the filler `<` and any
/// other character count as 0. The values are weighted with 7, 3, 1, 7, 3, 1, ... and summed
/// modulo 10.
pub fn check_digit(data: &[u8]) -> u8 {
    const WEIGHTS: [u8; 3] = [7, 3, 1];

    let mut check_digit: u8 = 0;
    for (b, weight) in data.iter().copied().zip(WEIGHTS.iter().copied().cycle()) {
        let value = match b {
            b'0'..=b'9' => b - b'0',
            b'A'..=b'Z' => b + 10 - b'A',
            _ => continue,
        };

        // at most 7 * 35 + 9 = 254
        check_digit = (check_digit + value * weight) % 10;
    }
    check_digit
}
