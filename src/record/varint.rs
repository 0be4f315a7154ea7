//! LEB128 varints and zigzag helpers

use crate::error::{ZarError, ZarResult};
use std::io::Read;

pub fn put_uvarint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

pub fn put_varint(out: &mut Vec<u8>, v: i64) {
    put_uvarint(out, zigzag(v));
}

pub fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

pub fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

/// Decode a uvarint from the front of `buf`, advancing it.
pub fn uvarint(buf: &mut &[u8]) -> ZarResult<u64> {
    let mut v: u64 = 0;
    let mut shift = 0;
    loop {
        let (&b, rest) = buf
            .split_first()
            .ok_or_else(|| ZarError::Corrupt("truncated varint".to_string()))?;
        *buf = rest;
        if shift >= 64 {
            return Err(ZarError::Corrupt("varint overflow".to_string()));
        }
        v |= ((b & 0x7f) as u64) << shift;
        if b & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
    }
}

pub fn varint(buf: &mut &[u8]) -> ZarResult<i64> {
    Ok(unzigzag(uvarint(buf)?))
}

/// Decode a uvarint from a byte stream.
pub fn read_uvarint<R: Read + ?Sized>(r: &mut R) -> ZarResult<u64> {
    let mut v: u64 = 0;
    let mut shift = 0;
    let mut byte = [0u8; 1];
    loop {
        r.read_exact(&mut byte).map_err(truncated)?;
        if shift >= 64 {
            return Err(ZarError::Corrupt("varint overflow".to_string()));
        }
        v |= ((byte[0] & 0x7f) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
    }
}

/// Map an unexpected EOF inside a message to a corruption error.
pub fn truncated(err: std::io::Error) -> ZarError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ZarError::Corrupt("truncated message".to_string())
    } else {
        ZarError::RawIo(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_edges() {
        for v in [0i64, 1, -1, 63, -64, i64::MAX, i64::MIN] {
            let mut buf = Vec::new();
            put_varint(&mut buf, v);
            let mut slice = buf.as_slice();
            assert_eq!(varint(&mut slice).unwrap(), v);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn test_truncated_varint() {
        let mut slice: &[u8] = &[0x80, 0x80];
        assert!(matches!(uvarint(&mut slice), Err(ZarError::Corrupt(_))));
    }
}
