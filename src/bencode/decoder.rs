//! Bencode decoding.
//!
//! Operates on a byte slice via a cursor rather than the teacher's
//! `Peekable<Bytes<R>>` stream, since callers (torrent file parsing,
//! tracker response parsing) already hold the whole payload in memory and
//! a cursor lets us report the exact offset and enforce the depth/size
//! caps cleanly.
use super::{BencodeError, BencodeResult, BencodeValue, MAX_DEPTH, MAX_STRING_LEN};
use std::collections::BTreeMap;

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> BencodeResult<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn next(&mut self) -> BencodeResult<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn expect(&mut self, byte: u8) -> BencodeResult<()> {
        let b = self.next()?;
        if b != byte {
            return Err(BencodeError::InvalidFormat(format!(
                "expected '{}' at offset {}, got '{}'",
                byte as char,
                self.pos - 1,
                b as char
            )));
        }
        Ok(())
    }

    /// Reads bytes until (and consuming) `delimiter`.
    fn read_until(&mut self, delimiter: u8) -> BencodeResult<&'a [u8]> {
        let start = self.pos;
        loop {
            let b = self.next()?;
            if b == delimiter {
                return Ok(&self.data[start..self.pos - 1]);
            }
        }
    }
}

/// Decodes a single root element and errors if any bytes remain afterward.
pub fn decode_root(data: &[u8]) -> BencodeResult<BencodeValue> {
    let mut cursor = Cursor { data, pos: 0 };
    let value = decode_value(&mut cursor, 0)?;
    if cursor.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

fn decode_value(cursor: &mut Cursor, depth: usize) -> BencodeResult<BencodeValue> {
    if depth > MAX_DEPTH {
        return Err(BencodeError::DepthExceeded(MAX_DEPTH));
    }
    match cursor.peek()? {
        b'0'..=b'9' => decode_string(cursor).map(BencodeValue::String),
        b'i' => decode_integer(cursor).map(BencodeValue::Integer),
        b'l' => decode_list(cursor, depth).map(BencodeValue::List),
        b'd' => decode_dict(cursor, depth).map(BencodeValue::Dict),
        other => Err(BencodeError::InvalidFormat(format!(
            "unexpected byte '{}' at offset {}",
            other as char, cursor.pos
        ))),
    }
}

/// Decodes a bencode string `<len>:<bytes>`.
fn decode_string(cursor: &mut Cursor) -> BencodeResult<Vec<u8>> {
    let len_bytes = cursor.read_until(b':')?;
    if len_bytes.is_empty() || !len_bytes.iter().all(u8::is_ascii_digit) {
        return Err(BencodeError::InvalidStringLength);
    }
    let len_str = std::str::from_utf8(len_bytes).map_err(|_| BencodeError::InvalidStringLength)?;
    let len: usize = len_str
        .parse()
        .map_err(|_| BencodeError::InvalidStringLength)?;
    if len > MAX_STRING_LEN {
        return Err(BencodeError::StringTooLong(len, MAX_STRING_LEN));
    }
    if cursor.pos + len > cursor.data.len() {
        return Err(BencodeError::UnexpectedEof);
    }
    let bytes = cursor.data[cursor.pos..cursor.pos + len].to_vec();
    cursor.pos += len;
    Ok(bytes)
}

/// Decodes a bencode integer `i<decimal>e`.
///
/// Rejects a missing `e`, a missing digit run, leading zeros (other than
/// the single digit `0`), and `-0`.
fn decode_integer(cursor: &mut Cursor) -> BencodeResult<i64> {
    cursor.expect(b'i')?;
    let digits = cursor.read_until(b'e')?;
    let num_str = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger)?;

    if num_str.is_empty() || num_str == "-0" {
        return Err(BencodeError::InvalidInteger);
    }
    let unsigned = num_str.strip_prefix('-').unwrap_or(num_str);
    if unsigned.is_empty() || !unsigned.chars().all(|c| c.is_ascii_digit()) {
        return Err(BencodeError::InvalidInteger);
    }
    if unsigned.len() > 1 && unsigned.starts_with('0') {
        return Err(BencodeError::InvalidInteger);
    }

    num_str.parse::<i64>().map_err(|_| BencodeError::InvalidInteger)
}

/// Decodes a bencode list `l<items>e`.
fn decode_list(cursor: &mut Cursor, depth: usize) -> BencodeResult<Vec<BencodeValue>> {
    cursor.expect(b'l')?;
    let mut list = Vec::new();
    loop {
        if cursor.peek()? == b'e' {
            cursor.pos += 1;
            return Ok(list);
        }
        list.push(decode_value(cursor, depth + 1)?);
    }
}

/// Decodes a bencode dictionary `d<key><value>...e`.
///
/// Keys must be byte strings; values may be any bencode value.
fn decode_dict(cursor: &mut Cursor, depth: usize) -> BencodeResult<BTreeMap<Vec<u8>, BencodeValue>> {
    cursor.expect(b'd')?;
    let mut dict = BTreeMap::new();
    loop {
        if cursor.peek()? == b'e' {
            cursor.pos += 1;
            return Ok(dict);
        }
        if !cursor.peek()?.is_ascii_digit() {
            return Err(BencodeError::DictKeyNotString);
        }
        let key = decode_string(cursor)?;
        let value = decode_value(cursor, depth + 1)?;
        dict.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use crate::bencode::decode;

    #[test]
    fn decodes_nested_structures() {
        let v = decode(b"d4:listli1ei2ee4:name3:zite").expect("decode");
        let dict = v.as_dict().unwrap();
        assert_eq!(
            dict.get(b"name".as_slice()).unwrap().as_str_bytes(),
            Some(b"zit".as_slice())
        );
        let list = dict.get(b"list".as_slice()).unwrap().as_list().unwrap();
        assert_eq!(list[0].as_integer(), Some(1));
        assert_eq!(list[1].as_integer(), Some(2));
    }

    #[test]
    fn rejects_leading_zero_integers() {
        assert!(decode(b"i03e").is_err());
        assert!(decode(b"i-0e").is_err());
        assert!(decode(b"ie").is_err());
    }

    #[test]
    fn rejects_truncated_string() {
        assert!(decode(b"5:ab").is_err());
    }
}
