// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Fixed-width hash newtypes shared across every consensus-critical module.
//!
//! These mirror the role `stacks_common::util::hash` plays for the teacher
//! codebase: everything that needs a 20- or 32-byte digest reaches for one of
//! these types rather than passing raw `Vec<u8>` around.

use std::fmt;

use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::HexError;

/// A bare SHA256 digest (single round).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Sha256Sum(pub [u8; 32]);

/// A double-SHA256 digest, i.e. Bitcoin's txid/block-hash algorithm.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default)]
pub struct Sha256dHash(pub [u8; 32]);

/// RIPEMD160(SHA256(x)) — Bitcoin's pubkey/script hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default)]
pub struct Hash160(pub [u8; 20]);

macro_rules! impl_hash_common {
    ($ty:ident, $len:expr) => {
        impl $ty {
            pub const LEN: usize = $len;

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Result<Self, HexError> {
                let bytes = hex::decode(s).map_err(|_| HexError::BadHexLen)?;
                if bytes.len() != $len {
                    return Err(HexError::BadHexLen);
                }
                let mut out = [0u8; $len];
                out.copy_from_slice(&bytes);
                Ok($ty(out))
            }

            /// Bitcoin displays hashes byte-reversed (little-endian accumulator).
            pub fn to_hex_be(&self) -> String {
                let mut rev = self.0;
                rev.reverse();
                hex::encode(rev)
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($ty), self.to_hex())
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex_be())
            }
        }

        impl AsRef<[u8]> for $ty {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

impl_hash_common!(Sha256Sum, 32);
impl_hash_common!(Sha256dHash, 32);
impl_hash_common!(Hash160, 20);

/// Single round of SHA256.
pub fn sha256(data: &[u8]) -> Sha256Sum {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let out = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&out);
    Sha256Sum(bytes)
}

/// Bitcoin's double-SHA256, used for txids, block hashes and merkle nodes.
pub fn sha256d(data: &[u8]) -> Sha256dHash {
    let first = sha256(data);
    let second = sha256(&first.0);
    Sha256dHash(second.0)
}

/// RIPEMD160(SHA256(x)), used for P2PKH/P2SH script hashes.
pub fn hash160(data: &[u8]) -> Hash160 {
    let sha = sha256(data);
    let mut hasher = Ripemd160::new();
    hasher.update(sha.0);
    let out = hasher.finalize();
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&out);
    Hash160(bytes)
}

/// Interprets a 32-byte digest as a little-endian big integer, as Bitcoin's
/// proof-of-work check does: the serialized hash bytes are the little-endian
/// encoding of the integer that must not exceed the target.
pub fn hash_to_u256_le(h: &Sha256dHash) -> [u8; 32] {
    h.0
}
