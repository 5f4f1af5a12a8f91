//! SHA-1 and byte-packing utilities.
//!
//! Grounded on `examples/original_source/src/sha1.h`/`sha1.cpp` (the
//! streamed-hash-over-a-file contract) and the teacher's direct use of the
//! `sha1` crate in `torrent/info_hash.rs`.
use sha1::{Digest, Sha1};
use std::io::Read;
use std::path::Path;
use thiserror::Error;

pub const HASH_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("offset {offset} + {len} bytes is out of range for a buffer of {available} bytes")]
    OutOfRange {
        offset: usize,
        len: usize,
        available: usize,
    },
}

/// SHA-1 of a contiguous byte slice.
pub fn sha1(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&digest);
    out
}

/// SHA-1 of a file's contents, read in 1 KiB chunks so hashing a
/// multi-gigabyte piece range doesn't require buffering it all at once.
pub fn sha1_file(path: &Path) -> Result<[u8; HASH_LEN], HashError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// SHA-1 over a byte range `[offset, offset+len)` of a reader that supports
/// seeking, read in 1 KiB chunks.
pub fn sha1_range<R: Read + std::io::Seek>(
    reader: &mut R,
    offset: u64,
    len: u64,
) -> Result<[u8; HASH_LEN], HashError> {
    reader.seek(std::io::SeekFrom::Start(offset))?;
    let mut hasher = Sha1::new();
    let mut remaining = len;
    let mut buf = [0u8; 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    let digest = hasher.finalize();
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// Uppercase hex formatting, per spec §4.2.
pub fn to_hex_upper(data: &[u8]) -> String {
    hex::encode_upper(data)
}

macro_rules! big_endian_pack {
    ($name_pack:ident, $name_unpack:ident, $ty:ty, $n:expr) => {
        #[doc = concat!("Packs a `", stringify!($ty), "` as ", stringify!($n), " big-endian bytes.")]
        pub fn $name_pack(value: $ty) -> [u8; $n] {
            value.to_be_bytes()
        }

        #[doc = concat!(
            "Unpacks a big-endian `",
            stringify!($ty),
            "` from `data[offset..offset+",
            stringify!($n),
            "]`, erroring if that range is out of bounds."
        )]
        pub fn $name_unpack(data: &[u8], offset: usize) -> Result<$ty, HashError> {
            if offset + $n > data.len() {
                return Err(HashError::OutOfRange {
                    offset,
                    len: $n,
                    available: data.len(),
                });
            }
            let mut buf = [0u8; $n];
            buf.copy_from_slice(&data[offset..offset + $n]);
            Ok(<$ty>::from_be_bytes(buf))
        }
    };
}

big_endian_pack!(pack_u16, unpack_u16, u16, 2);
big_endian_pack!(pack_u32, unpack_u32, u32, 4);
big_endian_pack!(pack_u64, unpack_u64, u64, 8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_of_empty_matches_known_digest() {
        let digest = sha1(b"");
        assert_eq!(to_hex_upper(&digest), "DA39A3EE5E6B4B0D3255BFEF95601890AFD80709");
    }

    #[test]
    fn big_endian_round_trip() {
        assert_eq!(unpack_u32(&pack_u32(0x01020304), 0).unwrap(), 0x01020304);
        assert_eq!(unpack_u16(&pack_u16(0xABCD), 0).unwrap(), 0xABCD);
        assert_eq!(unpack_u64(&pack_u64(0x1122334455667788), 0).unwrap(), 0x1122334455667788);
    }

    #[test]
    fn unpack_rejects_out_of_range_offset() {
        assert!(unpack_u32(&[1, 2, 3], 0).is_err());
    }

    #[test]
    fn sha1_file_matches_in_memory_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(sha1_file(&path).unwrap(), sha1(b"hello world"));
    }
}
