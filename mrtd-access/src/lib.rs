//! Access control and Secure Messaging for electronic travel document chips as specified by ICAO
//! Doc 9303 and BSI TR-03110.
//!
//! The entry point is [`session::Session`], which wraps a [`iso7816::card::SmartCard`] and
//! sequences the handshakes ([`bac`], [`pace`], [`ca`], [`ta`]) that install a
//! [`secure_messaging::SecureChannel`].


pub mod bac;
pub mod ca;
pub mod crypt;
pub mod der_util;
pub mod error;
pub mod iso7816;
pub mod kdf;
pub mod mrz;
pub mod pace;
pub mod secure_messaging;
pub mod session;
pub mod ta;


use std::fmt;

pub use crate::error::Error;


/// Displays a byte slice as contiguous uppercase hexadecimal digits.
///
/// Used to render APDUs in log output without allocating up front.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct HexBytes<'a>(pub &'a [u8]);
impl<'a> fmt::Display for HexBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}
impl<'a> fmt::Debug for HexBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HexBytes({})", self)
    }
}
