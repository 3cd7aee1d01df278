//! `lesqlite2`: a variable-length unsigned integer encoding tuned for small
//! values (genome coordinates, run lengths, dictionary indices).
//!
//! Ported byte-for-byte from
//! `original_source/backend-server/app/data/v14/numbers.py::lesqlite2`
//! ("props to stoklund" in the original comment).
//!
//! | range              | layout                                          |
//! |--------------------|--------------------------------------------------|
//! | `< 178`            | one byte: the value itself                       |
//! | `< 16562`          | `178+a, b` where `(a,b) = divmod(v-178, 256)`    |
//! | `< 540850`         | `242+a, c, b` where `(a,r)=divmod(v-16562,65536)`, `(b,c)=divmod(r,256)` |
//! | otherwise          | `247+n, d0, d1, …, d(n-1)` — `n` little-endian bytes |

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Lesqlite2Error {
    #[error("truncated lesqlite2 stream: expected {expected} more byte(s)")]
    Truncated { expected: usize },
}

const TWO_BYTE_BASE: u64 = 178;
const THREE_BYTE_BASE: u64 = 16562;
const BIG_BASE: u64 = 540850;

/// Encode a single value, appending its bytes to `out`.
pub fn encode_one(value: u64, out: &mut Vec<u8>) {
    if value < TWO_BYTE_BASE {
        out.push(value as u8);
    } else if value < THREE_BYTE_BASE {
        let rest = value - TWO_BYTE_BASE;
        let (a, b) = (rest / 256, rest % 256);
        out.push((TWO_BYTE_BASE as u8) + a as u8);
        out.push(b as u8);
    } else if value < BIG_BASE {
        let rest = value - THREE_BYTE_BASE;
        let (a, r) = (rest / 65536, rest % 65536);
        let (b, c) = (r / 256, r % 256);
        out.push(242 + a as u8);
        out.push(c as u8);
        out.push(b as u8);
    } else {
        let marker_pos = out.len();
        out.push(247);
        let mut remaining = value;
        while remaining > 0 {
            out[marker_pos] += 1;
            out.push((remaining % 256) as u8);
            remaining /= 256;
        }
    }
}

/// Encode a sequence of values into one contiguous byte run.
pub fn encode_sequence(values: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 2);
    for &v in values {
        encode_one(v, &mut out);
    }
    out
}

/// Decode a single value starting at `offset`, returning `(value, bytes_consumed)`.
pub fn decode_one(bytes: &[u8], offset: usize) -> Result<(u64, usize), Lesqlite2Error> {
    let marker = *bytes
        .get(offset)
        .ok_or(Lesqlite2Error::Truncated { expected: 1 })?;
    if marker < 178 {
        Ok((marker as u64, 1))
    } else if marker < 242 {
        let b = *bytes
            .get(offset + 1)
            .ok_or(Lesqlite2Error::Truncated { expected: 1 })?;
        let a = (marker - 178) as u64;
        Ok((TWO_BYTE_BASE + a * 256 + b as u64, 2))
    } else if marker < 250 {
        let c = *bytes
            .get(offset + 1)
            .ok_or(Lesqlite2Error::Truncated { expected: 2 })?;
        let b = *bytes
            .get(offset + 2)
            .ok_or(Lesqlite2Error::Truncated { expected: 1 })?;
        let a = (marker - 242) as u64;
        Ok((THREE_BYTE_BASE + a * 65536 + b as u64 * 256 + c as u64, 3))
    } else {
        let n = (marker - 247) as usize;
        if bytes.len() < offset + 1 + n {
            return Err(Lesqlite2Error::Truncated {
                expected: offset + 1 + n - bytes.len(),
            });
        }
        let mut value: u64 = 0;
        for i in (0..n).rev() {
            value = (value << 8) | bytes[offset + 1 + i] as u64;
        }
        Ok((value, 1 + n))
    }
}

/// Decode a run of `count` values from the start of `bytes`.
pub fn decode_sequence(bytes: &[u8], count: usize) -> Result<Vec<u64>, Lesqlite2Error> {
    let mut values = Vec::with_capacity(count);
    let mut offset = 0;
    for _ in 0..count {
        let (v, consumed) = decode_one(bytes, offset)?;
        values.push(v);
        offset += consumed;
    }
    Ok(values)
}
