//! Bencode codec: the tagged data format used for torrent metadata and
//! tracker replies.
//!
//! Four value kinds: signed 64-bit integer, byte string, list, and an
//! ordered dictionary (string keys, sorted lexicographically on encode).
use std::collections::BTreeMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

/// Strings exceeding this are rejected outright; guards against a hostile
/// length prefix trying to make us allocate gigabytes.
pub const MAX_STRING_LEN: usize = 100_000_000;

/// Recursion depth cap for nested lists/dicts.
pub const MAX_DEPTH: usize = 200;

/// A decoded Bencode value.
///
/// `Dict` uses a `BTreeMap` (not a `HashMap`) so that key order is always
/// observable in sorted form, matching the encoding contract: dictionaries
/// are encoded with keys sorted as byte strings regardless of insertion
/// order.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_str_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// Errors the codec can raise while decoding or encoding.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("invalid integer format")]
    InvalidInteger,

    #[error("invalid string length")]
    InvalidStringLength,

    #[error("string length {0} exceeds cap of {1} bytes")]
    StringTooLong(usize, usize),

    #[error("recursion depth exceeded {0}")]
    DepthExceeded(usize),

    #[error("trailing data after root element")]
    TrailingData,

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("cannot encode type: {0}")]
    CannotEncodeType(&'static str),

    #[error("dictionary keys must be strings")]
    DictKeyNotString,
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;

/// Decode a single root element, erroring on any trailing bytes.
pub fn decode(data: &[u8]) -> BencodeResult<BencodeValue> {
    decoder::decode_root(data)
}

/// Encode a value to its canonical bencode bytes.
pub fn encode(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buf = Vec::new();
    encoder::encode(&mut buf, value)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_the_cow_spam_example() {
        let input = b"d3:cow3:moo4:spam4:eggse";
        let value = decode(input).expect("decode");
        let dict = value.as_dict().expect("dict");
        assert_eq!(dict.len(), 2);
        assert_eq!(
            dict.get(b"cow".as_slice()).unwrap().as_str_bytes(),
            Some(b"moo".as_slice())
        );
        assert_eq!(
            dict.get(b"spam".as_slice()).unwrap().as_str_bytes(),
            Some(b"eggs".as_slice())
        );
        let re_encoded = encode(&value).expect("encode");
        assert_eq!(re_encoded, input);
    }

    #[test]
    fn rejects_trailing_data() {
        let err = decode(b"i1ee").unwrap_err();
        assert!(matches!(err, BencodeError::TrailingData));
    }

    #[test]
    fn rejects_oversized_declared_string() {
        let err = decode(b"999999999999:x").unwrap_err();
        assert!(matches!(
            err,
            BencodeError::StringTooLong(_, _) | BencodeError::InvalidStringLength
        ));
    }

    #[test]
    fn rejects_excess_recursion_depth() {
        let mut data = Vec::new();
        for _ in 0..(MAX_DEPTH + 5) {
            data.push(b'l');
        }
        for _ in 0..(MAX_DEPTH + 5) {
            data.push(b'e');
        }
        let err = decode(&data).unwrap_err();
        assert!(matches!(err, BencodeError::DepthExceeded(_)));
    }
}
