// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Bitcoin-compatible binary codec primitives: CompactSize (a.k.a. VarInt)
//! integers and a small `Cursor`-backed reader used throughout the burn
//! parser (§4.C) and the special-TX payload decoders (§4.F).

use std::io::{self, Read, Write};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of buffer")]
    Eof,
    #[error("non-canonical CompactSize encoding")]
    NonCanonicalCompactSize,
    #[error("value exceeds declared limit")]
    LimitExceeded,
    #[error("io error: {0}")]
    Io(String),
}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        CodecError::Io(e.to_string())
    }
}

/// Reads a Bitcoin CompactSize integer, rejecting non-canonical (over-long)
/// encodings the way Bitcoin Core's `ReadCompactSize` does.
pub fn read_compact_size<R: Read>(r: &mut R) -> Result<u64, CodecError> {
    let mut prefix = [0u8; 1];
    r.read_exact(&mut prefix).map_err(|_| CodecError::Eof)?;
    match prefix[0] {
        0xff => {
            let mut buf = [0u8; 8];
            r.read_exact(&mut buf).map_err(|_| CodecError::Eof)?;
            let v = u64::from_le_bytes(buf);
            if v < 0x1_0000_0000 {
                return Err(CodecError::NonCanonicalCompactSize);
            }
            Ok(v)
        }
        0xfe => {
            let mut buf = [0u8; 4];
            r.read_exact(&mut buf).map_err(|_| CodecError::Eof)?;
            let v = u32::from_le_bytes(buf) as u64;
            if v < 0xfd {
                return Err(CodecError::NonCanonicalCompactSize);
            }
            Ok(v)
        }
        0xfd => {
            let mut buf = [0u8; 2];
            r.read_exact(&mut buf).map_err(|_| CodecError::Eof)?;
            let v = u16::from_le_bytes(buf) as u64;
            if v < 0xfd {
                return Err(CodecError::NonCanonicalCompactSize);
            }
            Ok(v)
        }
        n => Ok(n as u64),
    }
}

pub fn write_compact_size<W: Write>(w: &mut W, v: u64) -> Result<(), CodecError> {
    if v < 0xfd {
        w.write_all(&[v as u8])?;
    } else if v <= 0xffff {
        w.write_all(&[0xfd])?;
        w.write_all(&(v as u16).to_le_bytes())?;
    } else if v <= 0xffff_ffff {
        w.write_all(&[0xfe])?;
        w.write_all(&(v as u32).to_le_bytes())?;
    } else {
        w.write_all(&[0xff])?;
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

/// Reads a length-prefixed byte string (CompactSize length + bytes), capped
/// at `max_len` to bound allocation from untrusted input.
pub fn read_varbytes<R: Read>(r: &mut R, max_len: usize) -> Result<Vec<u8>, CodecError> {
    let len = read_compact_size(r)? as usize;
    if len > max_len {
        return Err(CodecError::LimitExceeded);
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(|_| CodecError::Eof)?;
    Ok(buf)
}

pub fn write_varbytes<W: Write>(w: &mut W, bytes: &[u8]) -> Result<(), CodecError> {
    write_compact_size(w, bytes.len() as u64)?;
    w.write_all(bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn compact_size_roundtrip_boundaries() {
        for v in [0u64, 0xfc, 0xfd, 0xffff, 0x1_0000, 0xffff_ffff, 0x1_0000_0000] {
            let mut buf = Vec::new();
            write_compact_size(&mut buf, v).unwrap();
            let got = read_compact_size(&mut Cursor::new(buf)).unwrap();
            assert_eq!(got, v);
        }
    }

    #[test]
    fn rejects_non_canonical_encoding() {
        // 0xfd prefix followed by a value that fits in one byte.
        let buf = vec![0xfd, 0x01, 0x00];
        assert_eq!(
            read_compact_size(&mut Cursor::new(buf)),
            Err(CodecError::NonCanonicalCompactSize)
        );
    }

    #[test]
    fn varbytes_respects_cap() {
        let mut buf = Vec::new();
        write_varbytes(&mut buf, &[0u8; 32]).unwrap();
        assert_eq!(
            read_varbytes(&mut Cursor::new(buf), 16),
            Err(CodecError::LimitExceeded)
        );
    }
}
