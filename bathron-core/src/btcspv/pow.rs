// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Bitcoin's compact-target ("nBits") encoding, chain-work accumulation and
//! difficulty retargeting — independent of any particular header store so it
//! can be unit tested against known Bitcoin vectors.

/// A 256-bit unsigned integer stored big-endian, just wide enough for
/// targets and cumulative chain work. We only need add/compare/shift/div,
/// so a minimal big-uint beats pulling in a bignum crate the teacher itself
/// doesn't depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct U256(pub [u8; 32]);

impl U256 {
    pub const ZERO: U256 = U256([0u8; 32]);
    pub const ONE: U256 = {
        let mut b = [0u8; 32];
        b[31] = 1;
        U256(b)
    };
    pub const MAX: U256 = U256([0xff; 32]);

    pub fn from_u64(v: u64) -> Self {
        let mut b = [0u8; 32];
        b[24..32].copy_from_slice(&v.to_be_bytes());
        U256(b)
    }

    pub fn from_le_bytes(bytes: [u8; 32]) -> Self {
        let mut be = bytes;
        be.reverse();
        U256(be)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn checked_add(&self, other: &U256) -> Option<U256> {
        let mut out = [0u8; 32];
        let mut carry: u16 = 0;
        for i in (0..32).rev() {
            let sum = self.0[i] as u16 + other.0[i] as u16 + carry;
            out[i] = sum as u8;
            carry = sum >> 8;
        }
        if carry > 0 {
            None
        } else {
            Some(U256(out))
        }
    }

    pub fn saturating_add(&self, other: &U256) -> U256 {
        self.checked_add(other).unwrap_or(U256::MAX)
    }

    /// Standard integer division `self / divisor` (0 if `divisor` is zero).
    pub fn div_by(&self, divisor: &U256) -> U256 {
        if divisor.is_zero() {
            return U256::MAX;
        }
        // Simple long division; targets/works are only ever divided a few
        // times per header so performance is not a concern here.
        let mut remainder = U256::ZERO;
        let mut quotient = [0u8; 32];
        for byte_idx in 0..32 {
            for bit in (0..8).rev() {
                // remainder = (remainder << 1) | next bit of self
                remainder = shl1(&remainder);
                let bit_val = (self.0[byte_idx] >> bit) & 1;
                if bit_val == 1 {
                    remainder.0[31] |= 1;
                }
                if remainder >= *divisor {
                    remainder = sub(&remainder, divisor);
                    quotient[byte_idx] |= 1 << bit;
                }
            }
        }
        U256(quotient)
    }

    pub fn mul_u64(&self, m: u64) -> U256 {
        let mut acc = U256::ZERO;
        let mut base = *self;
        let mut m = m;
        while m > 0 {
            if m & 1 == 1 {
                acc = acc.saturating_add(&base);
            }
            base = base.saturating_add(&base);
            m >>= 1;
        }
        acc
    }

    pub fn div_u64(&self, d: u64) -> U256 {
        if d == 0 {
            return U256::MAX;
        }
        self.div_by(&U256::from_u64(d))
    }
}

fn shl1(v: &U256) -> U256 {
    let mut out = [0u8; 32];
    let mut carry = 0u8;
    for i in (0..32).rev() {
        let new_carry = v.0[i] >> 7;
        out[i] = (v.0[i] << 1) | carry;
        carry = new_carry;
    }
    U256(out)
}

fn sub(a: &U256, b: &U256) -> U256 {
    let mut out = [0u8; 32];
    let mut borrow: i16 = 0;
    for i in (0..32).rev() {
        let diff = a.0[i] as i16 - b.0[i] as i16 - borrow;
        if diff < 0 {
            out[i] = (diff + 256) as u8;
            borrow = 1;
        } else {
            out[i] = diff as u8;
            borrow = 0;
        }
    }
    U256(out)
}

/// Decodes Bitcoin's "compact" nBits target encoding into a 256-bit target.
/// Mirrors `arith_uint256::SetCompact`.
pub fn compact_to_target(bits: u32) -> U256 {
    let exponent = (bits >> 24) as i32;
    let mut mantissa = (bits & 0x007f_ffff) as u64;
    let is_negative = bits & 0x0080_0000 != 0;

    if is_negative || mantissa == 0 {
        return U256::ZERO;
    }

    if exponent <= 3 {
        mantissa >>= 8 * (3 - exponent);
        U256::from_u64(mantissa)
    } else {
        let shift_bytes = (exponent - 3) as usize;
        if shift_bytes >= 32 {
            return U256::MAX;
        }
        let mut out = [0u8; 32];
        let mantissa_bytes = mantissa.to_be_bytes();
        // place the 3 mantissa bytes starting `shift_bytes` from the right
        let start = 32 - shift_bytes - 3;
        if start > 32 || start + 3 > 32 {
            return U256::MAX;
        }
        out[start..start + 3].copy_from_slice(&mantissa_bytes[5..8]);
        U256(out)
    }
}

/// Encodes a target back into compact nBits form. Mirrors
/// `arith_uint256::GetCompact`.
pub fn target_to_compact(target: &U256) -> u32 {
    let bytes = target.0;
    let first_nonzero = bytes.iter().position(|b| *b != 0);
    let Some(first) = first_nonzero else {
        return 0;
    };
    let mut size = 32 - first;
    let mut compact: u32;
    if size <= 3 {
        let mut mantissa_bytes = [0u8; 3];
        let start = 32 - size;
        mantissa_bytes[3 - size..3].copy_from_slice(&bytes[start..32]);
        compact = u32::from_be_bytes([0, mantissa_bytes[0], mantissa_bytes[1], mantissa_bytes[2]]);
    } else {
        compact = u32::from_be_bytes([0, bytes[first], bytes[first + 1], bytes[first + 2]]);
    }
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact |= (size as u32) << 24;
    compact
}

/// Work contributed by a single header: `2^256 / (target + 1)`, computed as
/// Bitcoin Core does via `arith_uint256::~target / (target+1) + 1` to avoid
/// needing a 257-bit numerator.
pub fn work_from_bits(bits: u32) -> U256 {
    let target = compact_to_target(bits);
    if target.is_zero() {
        return U256::ZERO;
    }
    let target_plus_one = target.saturating_add(&U256::ONE);
    let complement = sub(&U256::MAX, &target);
    complement.div_by(&target_plus_one).saturating_add(&U256::ONE)
}

/// `true` iff `hash` (interpreted little-endian per Bitcoin convention)
/// is numerically <= `target`.
pub fn hash_meets_target(hash_le: &[u8; 32], target: &U256) -> bool {
    let as_u256 = U256::from_le_bytes(*hash_le);
    as_u256 <= *target
}

/// Bitcoin mainnet retarget: clamp the actual timespan to [expected/4, expected*4]
/// and rescale the previous target proportionally, then clamp to pow_limit.
pub fn retarget(previous_target: &U256, actual_timespan: i64, target_timespan: i64, pow_limit: &U256) -> U256 {
    let min_timespan = target_timespan / 4;
    let max_timespan = target_timespan * 4;
    let clamped = actual_timespan.clamp(min_timespan, max_timespan).max(1) as u64;

    let mut new_target = previous_target.mul_u64(clamped).div_u64(target_timespan as u64);
    if new_target > *pow_limit {
        new_target = *pow_limit;
    }
    new_target
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_roundtrip_mainnet_genesis_bits() {
        // Bitcoin genesis block nBits.
        let bits = 0x1d00ffff;
        let target = compact_to_target(bits);
        let back = target_to_compact(&target);
        assert_eq!(back, bits);
    }

    #[test]
    fn zero_exponent_small_mantissa() {
        let target = compact_to_target(0x01003456);
        assert_eq!(target, U256::from_u64(0));
    }

    #[test]
    fn higher_target_means_less_work() {
        let easy = work_from_bits(0x1d00ffff);
        let hard = work_from_bits(0x1b0404cb); // a much lower (harder) target
        assert!(hard > easy);
    }

    #[test]
    fn retarget_clamps_to_quadruple() {
        let prev = compact_to_target(0x1d00ffff);
        let pow_limit = compact_to_target(0x1d00ffff);
        let target_timespan = 14 * 24 * 60 * 60;
        // actual timespan 100x larger than expected should clamp to 4x
        let retargeted = retarget(&prev, target_timespan * 100, target_timespan, &pow_limit);
        assert_eq!(retargeted, pow_limit);
    }

    #[test]
    fn hash_meets_target_checks_le_interpretation() {
        let target = U256::from_u64(1000);
        let mut hash = [0u8; 32];
        hash[0] = 5; // LE: value 5
        assert!(hash_meets_target(&hash, &target));
        hash[31] = 1; // now a huge BE-most-significant byte -> LE value enormous
        assert!(!hash_meets_target(&hash, &target));
    }
}
