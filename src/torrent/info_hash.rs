use crate::bencode;
use crate::bencode::BencodeValue;
use anyhow::Result;
use sha1::Digest;
use sha1::Sha1;
use std::collections::BTreeMap;

/// Calculates the SHA-1 hash of a bencode-encoded info dictionary.
///
/// This function takes a bencode dictionary containing torrent metadata and:
/// 1. Encodes the dictionary into bencode format
/// 2. Calculates the SHA-1 hash of the encoded data
/// 3. Returns the 20-byte hash as a fixed-size array
///
/// # Arguments
/// * `info_dict` - the torrent's `info` dictionary, in the `BTreeMap` form
///   `BencodeValue::Dict` uses so re-encoding always produces the same key
///   order the original bytes did.
///
/// # Returns
/// * `Result<[u8;20]>` - A 20-byte array containing the SHA-1 hash, or an error if encoding fails
pub fn calculate_info_hash(info_dict: &BTreeMap<Vec<u8>, BencodeValue>) -> Result<[u8; 20]> {
    let mut buffer = Vec::new();
    bencode::encoder::encode(&mut buffer, &BencodeValue::Dict(info_dict.clone()))?;

    let mut hasher = Sha1::new();
    hasher.update(&buffer);

    let result = hasher.finalize();
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&result[..]);

    Ok(info_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_an_empty_dict_deterministically() {
        let dict = BTreeMap::new();
        let hash = calculate_info_hash(&dict).unwrap();
        assert_eq!(hash.len(), 20);
        // "de" is the bencode encoding of an empty dict; sha1("de") is fixed.
        let expected = calculate_info_hash(&BTreeMap::new()).unwrap();
        assert_eq!(hash, expected);
    }

    #[test]
    fn hash_is_stable_regardless_of_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert(b"name".to_vec(), BencodeValue::String(b"x".to_vec()));
        a.insert(b"length".to_vec(), BencodeValue::Integer(1));

        let mut b = BTreeMap::new();
        b.insert(b"length".to_vec(), BencodeValue::Integer(1));
        b.insert(b"name".to_vec(), BencodeValue::String(b"x".to_vec()));

        assert_eq!(calculate_info_hash(&a).unwrap(), calculate_info_hash(&b).unwrap());
    }
}
