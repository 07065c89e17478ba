//! Recursive length prefix codec.
//!
//! Every structured value on the wire (handshake bodies, frame headers,
//! DevP2P/LES messages, discovery packets) goes through this module.
//!
//! Wire rules:
//!   - single byte < 0x80: the byte itself
//!   - string of 0..=55 bytes: 0x80 + len, then the bytes
//!   - longer string: 0xb7 + len(len), big-endian len, then the bytes
//!   - list: same scheme with 0xc0 / 0xf7 over the concatenated children
//!
//! Integers are minimal big-endian strings; zero is the empty string.

use primitive_types::{H256, U256};

/// Short-form payload limit shared by strings and lists.
const SHORT_LIMIT: usize = 55;

const STRING_OFFSET: u8 = 0x80;
const LIST_OFFSET: u8 = 0xc0;

/// Nesting limit for decoding untrusted input.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RlpError {
    #[error("unexpected end of input: need {needed} bytes, have {available}")]
    UnexpectedEnd { needed: usize, available: usize },
    #[error("expected a byte string, found a list")]
    ExpectedString,
    #[error("expected a list, found a byte string")]
    ExpectedList,
    #[error("integer does not fit in {bits} bits")]
    IntegerOverflow { bits: u32 },
    #[error("not enough fields: expected at least {expected}, got {got}")]
    NotEnoughFields { expected: usize, got: usize },
    #[error("{0} trailing bytes after item")]
    TrailingBytes(usize),
    #[error("invalid utf-8 in text field")]
    InvalidUtf8,
    #[error("invalid length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),
}

pub type Result<T> = std::result::Result<T, RlpError>;

/// A decoded (or to-be-encoded) item: a byte string or a list of items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rlp {
    String(Vec<u8>),
    List(Vec<Rlp>),
}

impl Rlp {
    pub fn empty() -> Self {
        Rlp::String(Vec::new())
    }

    pub fn list(items: Vec<Rlp>) -> Self {
        Rlp::List(items)
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Rlp::List(_))
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Rlp::String(bytes) => Ok(bytes),
            Rlp::List(_) => Err(RlpError::ExpectedString),
        }
    }

    pub fn as_list(&self) -> Result<&[Rlp]> {
        match self {
            Rlp::List(items) => Ok(items),
            Rlp::String(_) => Err(RlpError::ExpectedList),
        }
    }

    /// List items, failing with `NotEnoughFields` when fewer than `min` are present.
    pub fn fields(&self, min: usize) -> Result<&[Rlp]> {
        let items = self.as_list()?;
        if items.len() < min {
            return Err(RlpError::NotEnoughFields {
                expected: min,
                got: items.len(),
            });
        }
        Ok(items)
    }

    /// The `index`th list item.
    pub fn field(&self, index: usize) -> Result<&Rlp> {
        let items = self.fields(index + 1)?;
        Ok(&items[index])
    }

    pub fn as_u64(&self) -> Result<u64> {
        let bytes = strip_leading_zeros(self.as_bytes()?);
        if bytes.len() > 8 {
            return Err(RlpError::IntegerOverflow { bits: 64 });
        }
        Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    pub fn as_u16(&self) -> Result<u16> {
        u16::try_from(self.as_u64()?).map_err(|_| RlpError::IntegerOverflow { bits: 16 })
    }

    pub fn as_u8(&self) -> Result<u8> {
        u8::try_from(self.as_u64()?).map_err(|_| RlpError::IntegerOverflow { bits: 8 })
    }

    pub fn as_u256(&self) -> Result<U256> {
        let bytes = strip_leading_zeros(self.as_bytes()?);
        if bytes.len() > 32 {
            return Err(RlpError::IntegerOverflow { bits: 256 });
        }
        Ok(U256::from_big_endian(bytes))
    }

    pub fn as_h256(&self) -> Result<H256> {
        let fixed: [u8; 32] = self.as_fixed()?;
        Ok(H256(fixed))
    }

    pub fn as_fixed<const N: usize>(&self) -> Result<[u8; N]> {
        let bytes = self.as_bytes()?;
        bytes.try_into().map_err(|_| RlpError::InvalidLength {
            expected: N,
            got: bytes.len(),
        })
    }

    pub fn as_text(&self) -> Result<String> {
        String::from_utf8(self.as_bytes()?.to_vec()).map_err(|_| RlpError::InvalidUtf8)
    }

    /// Canonical encoding of this item.
    pub fn encoded(&self) -> Vec<u8> {
        let mut out = Vec::new();
        encode_into(self, &mut out);
        out
    }
}

/// Values that map onto an [`Rlp`] item.
pub trait Encodable {
    fn to_rlp(&self) -> Rlp;

    fn rlp_bytes(&self) -> Vec<u8> {
        self.to_rlp().encoded()
    }
}

impl Encodable for Rlp {
    fn to_rlp(&self) -> Rlp {
        self.clone()
    }
}

impl Encodable for u64 {
    fn to_rlp(&self) -> Rlp {
        let bytes = self.to_be_bytes();
        Rlp::String(strip_leading_zeros(&bytes).to_vec())
    }
}

impl Encodable for u32 {
    fn to_rlp(&self) -> Rlp {
        u64::from(*self).to_rlp()
    }
}

impl Encodable for u16 {
    fn to_rlp(&self) -> Rlp {
        u64::from(*self).to_rlp()
    }
}

impl Encodable for u8 {
    fn to_rlp(&self) -> Rlp {
        u64::from(*self).to_rlp()
    }
}

impl Encodable for usize {
    fn to_rlp(&self) -> Rlp {
        (*self as u64).to_rlp()
    }
}

impl Encodable for U256 {
    fn to_rlp(&self) -> Rlp {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        Rlp::String(strip_leading_zeros(&bytes).to_vec())
    }
}

impl Encodable for H256 {
    fn to_rlp(&self) -> Rlp {
        Rlp::String(self.as_bytes().to_vec())
    }
}

impl Encodable for [u8] {
    fn to_rlp(&self) -> Rlp {
        Rlp::String(self.to_vec())
    }
}

impl<const N: usize> Encodable for [u8; N] {
    fn to_rlp(&self) -> Rlp {
        Rlp::String(self.to_vec())
    }
}

impl Encodable for Vec<u8> {
    fn to_rlp(&self) -> Rlp {
        Rlp::String(self.clone())
    }
}

impl Encodable for str {
    fn to_rlp(&self) -> Rlp {
        Rlp::String(self.as_bytes().to_vec())
    }
}

impl Encodable for String {
    fn to_rlp(&self) -> Rlp {
        self.as_str().to_rlp()
    }
}

impl Encodable for bool {
    fn to_rlp(&self) -> Rlp {
        u64::from(*self).to_rlp()
    }
}

/// Encode a value to bytes.
pub fn encode<T: Encodable + ?Sized>(value: &T) -> Vec<u8> {
    value.rlp_bytes()
}

/// Append the encoding of `item` to `out`.
pub fn encode_into(item: &Rlp, out: &mut Vec<u8>) {
    match item {
        Rlp::String(bytes) => {
            if bytes.len() == 1 && bytes[0] < STRING_OFFSET {
                out.push(bytes[0]);
            } else {
                encode_length(bytes.len(), STRING_OFFSET, out);
                out.extend_from_slice(bytes);
            }
        }
        Rlp::List(items) => {
            let mut body = Vec::new();
            for child in items {
                encode_into(child, &mut body);
            }
            encode_length(body.len(), LIST_OFFSET, out);
            out.extend_from_slice(&body);
        }
    }
}

fn encode_length(len: usize, offset: u8, out: &mut Vec<u8>) {
    if len <= SHORT_LIMIT {
        out.push(offset + len as u8);
    } else {
        let len_bytes = (len as u64).to_be_bytes();
        let len_bytes = strip_leading_zeros(&len_bytes);
        out.push(offset + SHORT_LIMIT as u8 + len_bytes.len() as u8);
        out.extend_from_slice(len_bytes);
    }
}

/// Decode one item from the front of `input`, returning it with the number
/// of bytes it occupied.
pub fn decode(input: &[u8]) -> Result<(Rlp, usize)> {
    decode_at_depth(input, 0)
}

fn decode_at_depth(input: &[u8], depth: usize) -> Result<(Rlp, usize)> {
    if depth > MAX_DEPTH {
        return Err(RlpError::TooDeep(MAX_DEPTH));
    }
    let (is_list, header_len, payload_len) = decode_header(input)?;
    let end = header_len
        .checked_add(payload_len)
        .ok_or(RlpError::UnexpectedEnd {
            needed: usize::MAX,
            available: input.len(),
        })?;
    if input.len() < end {
        return Err(RlpError::UnexpectedEnd {
            needed: end,
            available: input.len(),
        });
    }

    let payload = &input[header_len..end];
    if !is_list {
        return Ok((Rlp::String(payload.to_vec()), end));
    }

    let mut items = Vec::new();
    let mut offset = 0;
    while offset < payload.len() {
        let (item, used) = decode_at_depth(&payload[offset..], depth + 1)?;
        items.push(item);
        offset += used;
    }
    Ok((Rlp::List(items), end))
}

/// Decode exactly one item; trailing bytes are an error.
pub fn decode_exact(input: &[u8]) -> Result<Rlp> {
    let (item, used) = decode(input)?;
    if used != input.len() {
        return Err(RlpError::TrailingBytes(input.len() - used));
    }
    Ok(item)
}

/// Parse an item header: (is_list, header length, payload length).
fn decode_header(input: &[u8]) -> Result<(bool, usize, usize)> {
    let prefix = *input.first().ok_or(RlpError::UnexpectedEnd {
        needed: 1,
        available: 0,
    })?;

    match prefix {
        0x00..=0x7f => Ok((false, 0, 1)),
        0x80..=0xb7 => Ok((false, 1, (prefix - STRING_OFFSET) as usize)),
        0xb8..=0xbf => {
            let len_of_len = (prefix - 0xb7) as usize;
            Ok((false, 1 + len_of_len, read_length(input, len_of_len)?))
        }
        0xc0..=0xf7 => Ok((true, 1, (prefix - LIST_OFFSET) as usize)),
        0xf8..=0xff => {
            let len_of_len = (prefix - 0xf7) as usize;
            Ok((true, 1 + len_of_len, read_length(input, len_of_len)?))
        }
    }
}

fn read_length(input: &[u8], len_of_len: usize) -> Result<usize> {
    if input.len() < 1 + len_of_len {
        return Err(RlpError::UnexpectedEnd {
            needed: 1 + len_of_len,
            available: input.len(),
        });
    }
    let raw = strip_leading_zeros(&input[1..1 + len_of_len]);
    if raw.len() > std::mem::size_of::<usize>() {
        return Err(RlpError::IntegerOverflow {
            bits: usize::BITS,
        });
    }
    Ok(raw.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize))
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}
