//! Structures related to application protocol data units (APDUs).


use std::fmt;
use std::io::{self, Write};

use thiserror::Error;


/// Largest request data length encodable in a short Lc byte.
pub const MAX_SHORT_LC: usize = 255;

/// Largest expected response length encodable in a short Le byte (encoded as 0x00).
pub const MAX_SHORT_NE: usize = 256;

/// Largest request data length encodable in an extended Lc field.
pub const MAX_EXTENDED_LC: usize = 65535;

/// Largest expected response length encodable in an extended Le field (encoded as 0x0000).
pub const MAX_EXTENDED_NE: usize = 65536;


#[derive(Debug, Error)]
pub enum WriteError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("data is, but must not be, empty")]
    EmptyData,

    #[error("too much data: obtained {obtained} bytes, expected maximum {maximum} bytes")]
    DataTooLong { maximum: usize, obtained: usize },
}


#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CommandHeader {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
}
impl CommandHeader {
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self { cla, ins, p1, p2 }
    }

    pub const fn to_bytes(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }
}
impl fmt::Debug for CommandHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CommandHeader {} cla: 0x{:02X}, ins: 0x{:02X}, p1: 0x{:02X}, p2: 0x{:02X} {}",
            '{', self.cla, self.ins, self.p1, self.p2, '}',
        )
    }
}

#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ResponseTrailer {
    pub sw1: u8,
    pub sw2: u8,
}
impl ResponseTrailer {
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self { sw1, sw2 }
    }

    pub const fn from_word(word: u16) -> Self {
        let bytes = word.to_be_bytes();
        Self::new(bytes[0], bytes[1])
    }

    pub const fn to_bytes(&self) -> [u8; 2] {
        [self.sw1, self.sw2]
    }

    pub const fn to_word(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }
}
impl fmt::Debug for ResponseTrailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseTrailer {} sw1: 0x{:02X}, sw2: 0x{:02X} {}", '{', self.sw1, self.sw2, '}')
    }
}


/// The body of a command APDU, one variant per case of ISO/IEC 7816-3:2006 § 12.1.3.
///
/// The `response_data_length` fields hold the Le value as transmitted: a short Le of 0x00 stands
/// for 256 bytes and an extended Le of 0x0000 for 65536 bytes. Use
/// [`expected_response_length`](Data::expected_response_length) to obtain Ne.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Data {
    NoData,
    RequestDataShort {
        request_data: Vec<u8>,
    },
    RequestDataExtended {
        request_data: Vec<u8>,
    },
    ResponseDataShort {
        response_data_length: u8,
    },
    ResponseDataExtended {
        response_data_length: u16,
    },
    BothDataShort {
        request_data: Vec<u8>,
        response_data_length: u8,
    },
    BothDataExtended {
        request_data: Vec<u8>,
        response_data_length: u16,
    },
}
impl Data {
    /// Chooses the shortest case able to carry the given request data and Ne.
    ///
    /// Empty request data is treated as absent; `expected` is clamped to 65536.
    pub fn new(request_data: Vec<u8>, expected: Option<usize>) -> Self {
        let extended = request_data.len() > MAX_SHORT_LC
            || expected.map(|ne| ne > MAX_SHORT_NE).unwrap_or(false);
        match (request_data.is_empty(), expected, extended) {
            (true, None, _) => Self::NoData,
            (false, None, false) => Self::RequestDataShort { request_data },
            (false, None, true) => Self::RequestDataExtended { request_data },
            (true, Some(ne), false) => Self::ResponseDataShort { response_data_length: encode_short_le(ne) },
            (true, Some(ne), true) => Self::ResponseDataExtended { response_data_length: encode_extended_le(ne) },
            (false, Some(ne), false) => Self::BothDataShort { request_data, response_data_length: encode_short_le(ne) },
            (false, Some(ne), true) => Self::BothDataExtended { request_data, response_data_length: encode_extended_le(ne) },
        }
    }

    /// Ne, the maximum number of response bytes expected, if any response data is expected.
    pub fn expected_response_length(&self) -> Option<usize> {
        match self {
            Self::NoData|Self::RequestDataShort { .. }|Self::RequestDataExtended { .. } => None,
            Self::ResponseDataShort { response_data_length }
                |Self::BothDataShort { response_data_length, .. }
                => Some(decode_short_le(*response_data_length)),
            Self::ResponseDataExtended { response_data_length }
                |Self::BothDataExtended { response_data_length, .. }
                => Some(decode_extended_le(*response_data_length)),
        }
    }

    pub fn request_data(&self) -> Option<&[u8]> {
        match self {
            Self::RequestDataShort { request_data }
                |Self::RequestDataExtended { request_data }
                |Self::BothDataShort { request_data, .. }
                |Self::BothDataExtended { request_data, .. }
                => Some(request_data.as_slice()),
            Self::NoData|Self::ResponseDataShort { .. }|Self::ResponseDataExtended { .. } => None,
        }
    }

    pub fn is_extended(&self) -> bool {
        matches!(
            self,
            Self::RequestDataExtended { .. }|Self::ResponseDataExtended { .. }|Self::BothDataExtended { .. }
        )
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        fn checked_length(request_data: &[u8], max_length: usize) -> Result<usize, WriteError> {
            if request_data.is_empty() {
                Err(WriteError::EmptyData)
            } else if request_data.len() > max_length {
                Err(WriteError::DataTooLong { maximum: max_length, obtained: request_data.len() })
            } else {
                Ok(request_data.len())
            }
        }

        match self {
            Data::NoData => {
                // case 1
                Ok(())
            },
            Data::RequestDataShort { request_data } => {
                // case 3S: [Lc] [Data]
                let lc = checked_length(request_data, MAX_SHORT_LC)?;
                writer.write_all(&[lc as u8])?;
                writer.write_all(request_data)?;
                Ok(())
            },
            Data::RequestDataExtended { request_data } => {
                // case 3E: [0x00] [LcMSB] [LcLSB] [Data]
                let lc = checked_length(request_data, MAX_EXTENDED_LC)?;
                let lc_bytes = (lc as u16).to_be_bytes();
                writer.write_all(&[0x00, lc_bytes[0], lc_bytes[1]])?;
                writer.write_all(request_data)?;
                Ok(())
            },
            Data::ResponseDataShort { response_data_length } => {
                // case 2S: [Le]
                writer.write_all(&[*response_data_length])?;
                Ok(())
            },
            Data::ResponseDataExtended { response_data_length } => {
                // case 2E: [0x00] [LeMSB] [LeLSB]
                let le_bytes = response_data_length.to_be_bytes();
                writer.write_all(&[0x00, le_bytes[0], le_bytes[1]])?;
                Ok(())
            },
            Data::BothDataShort { request_data, response_data_length } => {
                // case 4S: [Lc] [Data] [Le]
                let lc = checked_length(request_data, MAX_SHORT_LC)?;
                writer.write_all(&[lc as u8])?;
                writer.write_all(request_data)?;
                writer.write_all(&[*response_data_length])?;
                Ok(())
            },
            Data::BothDataExtended { request_data, response_data_length } => {
                // case 4E: [0x00] [LcMSB] [LcLSB] [Data] [LeMSB] [LeLSB]
                let lc = checked_length(request_data, MAX_EXTENDED_LC)?;
                let lc_bytes = (lc as u16).to_be_bytes();
                writer.write_all(&[0x00, lc_bytes[0], lc_bytes[1]])?;
                writer.write_all(request_data)?;
                writer.write_all(&response_data_length.to_be_bytes())?;
                Ok(())
            },
        }
    }
}

fn encode_short_le(ne: usize) -> u8 {
    if ne >= MAX_SHORT_NE { 0x00 } else { ne as u8 }
}

fn encode_extended_le(ne: usize) -> u16 {
    if ne >= MAX_EXTENDED_NE { 0x0000 } else { ne as u16 }
}

fn decode_short_le(le: u8) -> usize {
    if le == 0x00 { MAX_SHORT_NE } else { le.into() }
}

fn decode_extended_le(le: u16) -> usize {
    if le == 0x0000 { MAX_EXTENDED_NE } else { le.into() }
}


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Apdu {
    pub header: CommandHeader,
    pub data: Data,
}
impl Apdu {
    pub fn new(header: CommandHeader, data: Data) -> Self {
        Self { header, data }
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        self.header.write_bytes(writer)?;
        self.data.write_bytes(writer)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WriteError> {
        let mut buf = Vec::with_capacity(4 + self.data.request_data().map(|d| d.len() + 3).unwrap_or(0) + 3);
        self.write_bytes(&mut buf)?;
        Ok(buf)
    }
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Response {
    pub data: Vec<u8>,
    pub trailer: ResponseTrailer,
}
impl Response {
    pub fn new(data: Vec<u8>, status: u16) -> Self {
        Self { data, trailer: ResponseTrailer::from_word(status) }
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let (data, trailer) = bytes.split_at_checked(bytes.len().checked_sub(2)?)?;
        Some(Self {
            data: data.to_vec(),
            trailer: ResponseTrailer::new(trailer[0], trailer[1]),
        })
    }

    pub const fn status(&self) -> u16 {
        self.trailer.to_word()
    }

    pub const fn is_success(&self) -> bool {
        self.status() == 0x9000
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.data.len() + 2);
        buf.extend_from_slice(&self.data);
        buf.extend_from_slice(&self.trailer.to_bytes());
        buf
    }
}
