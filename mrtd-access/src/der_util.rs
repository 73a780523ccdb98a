//! Utility functions for Distinguished Encoding Rules and the BER-TLV data objects exchanged with
//! the chip.


use rasn::types::Oid;


/// Encode an ASN.1 DER primitive value length.
pub fn encode_primitive_length(output: &mut Vec<u8>, length: usize) {
    if length < 128 {
        // single-byte encoding
        output.push(length as u8);
    } else {
        // 0b1nnn_nnnn and then n additional bytes that actually specify the length
        // (big-endian)
        let length_bytes = length.to_be_bytes();
        let leading_zeroes = length_bytes.iter().take_while(|b| **b == 0x00).count();
        let trimmed_length_slice = &length_bytes[leading_zeroes..];
        output.push(0b1000_0000 | (trimmed_length_slice.len() as u8));
        output.extend(trimmed_length_slice);
    }
}


/// Decode an ASN.1 DER primitive value length.
///
/// The length must be at the beginning of the input slice.
///
/// Returns a tuple `(length, rest)` where `rest` is the rest of the input slice once the length has
/// been removed.
pub fn try_decode_primitive_length(input: &[u8]) -> Option<(usize, &[u8])> {
    let (&start_byte, rest) = input.split_first()?;
    let start_lower_bits = start_byte & 0b0111_1111;
    if start_byte & 0b1000_0000 == 0 {
        return Some((start_lower_bits.into(), rest));
    }

    // multiple bytes
    let length_byte_count: usize = start_lower_bits.into();
    if length_byte_count == 0 || length_byte_count > rest.len() {
        return None;
    }
    let (length_bytes, rest) = rest.split_at(length_byte_count);
    let mut length: usize = 0;
    for length_byte in length_bytes {
        length = length.checked_mul(256)?.checked_add(usize::from(*length_byte))?;
    }
    Some((length, rest))
}


/// Decode a BER tag (one or more bytes) from the beginning of the input slice.
///
/// Returns the tag bytes interpreted as a big-endian integer together with the rest of the slice.
pub fn try_decode_tag(input: &[u8]) -> Option<(u32, &[u8])> {
    let (&first, mut rest) = input.split_first()?;
    let mut tag = u32::from(first);
    if first & 0b0001_1111 == 0b0001_1111 {
        // subsequent bytes follow while the top bit is set
        loop {
            let (&next, next_rest) = rest.split_first()?;
            rest = next_rest;
            tag = tag.checked_mul(256)? | u32::from(next);
            if next & 0b1000_0000 == 0 {
                break;
            }
        }
    }
    Some((tag, rest))
}


/// Append a TLV data object with the given tag and value.
///
/// The tag is written in the minimal number of big-endian bytes (`0x7F49` becomes two bytes,
/// `0x87` one).
pub fn write_tlv(output: &mut Vec<u8>, tag: u32, value: &[u8]) {
    let tag_bytes = tag.to_be_bytes();
    let leading_zeroes = tag_bytes.iter().take_while(|b| **b == 0x00).count().min(3);
    output.extend(&tag_bytes[leading_zeroes..]);
    encode_primitive_length(output, value.len());
    output.extend(value);
}

/// Builds a TLV data object with the given tag and value.
pub fn tlv(tag: u32, value: &[u8]) -> Vec<u8> {
    let mut ret = Vec::with_capacity(value.len() + 6);
    write_tlv(&mut ret, tag, value);
    ret
}


/// A data object decoded from a BER-TLV byte string.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Tlv<'a> {
    pub tag: u32,
    pub value: &'a [u8],

    /// The complete encoding of this data object (tag, length and value).
    pub raw: &'a [u8],
}


/// Iterates over a sequence of concatenated BER-TLV data objects.
///
/// Yields a single `Err` if the input is truncated or otherwise malformed; iteration stops
/// afterwards.
#[derive(Clone, Debug)]
pub struct TlvIter<'a> {
    rest: &'a [u8],
    failed: bool,
}
impl<'a> TlvIter<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { rest: input, failed: false }
    }
}
impl<'a> Iterator for TlvIter<'a> {
    type Item = Result<Tlv<'a>, MalformedTlv>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.rest.is_empty() {
            return None;
        }
        match decode_one(self.rest) {
            Some((tlv, rest)) => {
                self.rest = rest;
                Some(Ok(tlv))
            },
            None => {
                self.failed = true;
                Some(Err(MalformedTlv))
            },
        }
    }
}

fn decode_one(input: &[u8]) -> Option<(Tlv<'_>, &[u8])> {
    let (tag, after_tag) = try_decode_tag(input)?;
    let (length, after_length) = try_decode_primitive_length(after_tag)?;
    if length > after_length.len() {
        return None;
    }
    let (value, rest) = after_length.split_at(length);
    let raw = &input[..input.len() - rest.len()];
    Some((Tlv { tag, value, raw }, rest))
}


/// A BER-TLV byte string could not be decoded.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct MalformedTlv;


/// Decodes a single data object that must span the whole input and have the given tag.
pub fn expect_single_tlv(input: &[u8], tag: u32) -> Option<&[u8]> {
    let (tlv, rest) = decode_one(input)?;
    if tlv.tag == tag && rest.is_empty() {
        Some(tlv.value)
    } else {
        None
    }
}


/// Finds the first data object with the given tag among the concatenated data objects.
pub fn find_tlv(input: &[u8], tag: u32) -> Option<&[u8]> {
    TlvIter::new(input)
        .map_while(|r| r.ok())
        .find(|tlv| tlv.tag == tag)
        .map(|tlv| tlv.value)
}


/// Encode an object identifier value into bytes using DER encoding rules.
///
/// No tag or length is encoded, only the actual value. Returns `None` if the first two arcs do not
/// form a valid object identifier.
pub fn oid_to_der_bytes(oid: &Oid) -> Option<Vec<u8>> {
    if oid.len() < 2 || oid[0] > 2 || (oid[0] < 2 && oid[1] > 39) {
        return None;
    }

    fn encode_arc(ret: &mut Vec<u8>, arc: u32) {
        // base-128, most significant group first, top bit marks continuation
        let groups = ((32 - arc.leading_zeros()).max(1) + 6) / 7;
        for i in (0..groups).rev() {
            let group = ((arc >> (7 * i)) & 0b0111_1111) as u8;
            if i == 0 {
                ret.push(group);
            } else {
                ret.push(group | 0b1000_0000);
            }
        }
    }

    let mut ret = Vec::new();
    encode_arc(&mut ret, 40*oid[0] + oid[1]);
    for arc in oid.iter().skip(2) {
        encode_arc(&mut ret, *arc);
    }
    Some(ret)
}


/// Converts a DER-encoded ECDSA signature (`SEQUENCE { r INTEGER, s INTEGER }`) into the plain
/// `r || s` format, each half left-padded to `field_size` bytes.
pub fn ecdsa_der_to_plain(der: &[u8], field_size: usize) -> Option<Vec<u8>> {
    let sequence = expect_single_tlv(der, 0x30)?;
    let mut items = TlvIter::new(sequence);
    let r = items.next()?.ok()?;
    let s = items.next()?.ok()?;
    if r.tag != 0x02 || s.tag != 0x02 || items.next().is_some() {
        return None;
    }

    let mut ret = Vec::with_capacity(2 * field_size);
    for integer in [r.value, s.value] {
        let leading_zeroes = integer.iter().take_while(|b| **b == 0x00).count();
        let magnitude = &integer[leading_zeroes..];
        if magnitude.len() > field_size {
            return None;
        }
        ret.resize(ret.len() + field_size - magnitude.len(), 0x00);
        ret.extend(magnitude);
    }
    Some(ret)
}


/// Encodes an unsigned integer in the minimal number of big-endian bytes (at least one).
pub fn minimal_be_bytes(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let leading_zeroes = bytes.iter().take_while(|b| **b == 0x00).count().min(7);
    bytes[leading_zeroes..].to_vec()
}
