//! Mutation primitives over structured seed values.
//!
//! Values are hexadecimal strings of unbounded width; the primitives work on
//! the big-endian byte form of the encoded integer and re-encode the result
//! as lowercase unpadded `0x…`. Targets plug in a [`Mutator`] implementation
//! to override the custom and string mutations.

use std::fmt;

use fuzzer_data::seed::SeedField;
use rand::{Rng, RngCore};

/// The fixed list of primitive mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    BitFlip,
    ByteFlip,
    Arith,
    InsertByte,
    DeleteByte,
}

pub const MUTATIONS: [Mutation; 5] = [
    Mutation::BitFlip,
    Mutation::ByteFlip,
    Mutation::Arith,
    Mutation::InsertByte,
    Mutation::DeleteByte,
];

const ARITH_DELTA_MAX: u8 = 10;

#[derive(Debug)]
pub enum MutateError {
    /// The seed value does not parse as a hexadecimal integer, or string
    /// bounds are missing/inconsistent.
    InvalidValue(String),
    /// A `mutator: "custom"` field the target does not know.
    UnknownKey(String),
}

impl fmt::Display for MutateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutateError::InvalidValue(value) => write!(f, "invalid seed value: {value}"),
            MutateError::UnknownKey(key) => write!(f, "unknown custom-mutated key: {key}"),
        }
    }
}

impl std::error::Error for MutateError {}

/// Uniformly picks one primitive mutation.
pub fn choose_one(rng: &mut dyn RngCore) -> Mutation {
    MUTATIONS[rng.random_range(0..MUTATIONS.len())]
}

/// Applies `mutation` to a hex-encoded value.
pub fn apply(rng: &mut dyn RngCore, mutation: Mutation, value: &str) -> Result<String, MutateError> {
    let mut bytes = hex_to_bytes(value)?;
    match mutation {
        Mutation::BitFlip => {
            let bitlen = bit_length(&bytes).max(1);
            let bit = rng.random_range(0..bitlen);
            let pos = bytes.len() - 1 - bit / 8;
            bytes[pos] ^= 1 << (bit % 8);
        }
        Mutation::ByteFlip => {
            let idx = rng.random_range(0..bytes.len());
            bytes[idx] ^= 0xff;
        }
        Mutation::Arith => {
            let idx = rng.random_range(0..bytes.len());
            let delta = rng.random_range(1..=ARITH_DELTA_MAX);
            if rng.random::<bool>() {
                bytes[idx] = bytes[idx].wrapping_add(delta);
            } else {
                bytes[idx] = bytes[idx].wrapping_sub(delta);
            }
        }
        Mutation::InsertByte => {
            let idx = rng.random_range(0..=bytes.len());
            bytes.insert(idx, rng.random_range(0..=255u16) as u8);
        }
        Mutation::DeleteByte => {
            // Single-byte values stay as they are.
            if bytes.len() > 1 {
                let idx = rng.random_range(0..bytes.len());
                bytes.remove(idx);
            }
        }
    }
    Ok(bytes_to_hex(&bytes))
}

/// Pluggable mutation dispatch; one implementation per target family.
pub trait Mutator: Send + Sync {
    /// One uniformly chosen primitive applied to `value`.
    fn mutate(&self, rng: &mut dyn RngCore, value: &str) -> Result<String, MutateError> {
        let mutation = choose_one(rng);
        apply(rng, mutation, value)
    }

    /// Target-specific mutation for fields tagged `mutator: "custom"`.
    fn custom_mutate(
        &self,
        _rng: &mut dyn RngCore,
        field_name: &str,
        _field: &SeedField,
    ) -> Result<String, MutateError> {
        Err(MutateError::UnknownKey(field_name.to_string()))
    }

    /// Random printable ASCII string of a length uniform in
    /// `[min_len, max_len]` (hex-encoded bounds), returned as the
    /// concatenated lowercase hex encoding of its bytes.
    fn mutate_string(
        &self,
        rng: &mut dyn RngCore,
        _value: &str,
        min_len_hex: &str,
        max_len_hex: &str,
    ) -> Result<String, MutateError> {
        let min = fuzzer_data::parse_hex(min_len_hex)
            .map_err(|_| MutateError::InvalidValue(min_len_hex.to_string()))?;
        let max = fuzzer_data::parse_hex(max_len_hex)
            .map_err(|_| MutateError::InvalidValue(max_len_hex.to_string()))?;
        if max < min {
            return Err(MutateError::InvalidValue(format!(
                "min_len {min_len_hex} exceeds max_len {max_len_hex}"
            )));
        }
        let length = rng.random_range(min..=max);
        let mut encoded = String::with_capacity(length as usize * 2);
        for _ in 0..length {
            // Printable ASCII without the whitespace controls.
            let byte = rng.random_range(0x21..=0x7eu16) as u8;
            encoded.push_str(&format!("{byte:02x}"));
        }
        Ok(encoded)
    }
}

/// Big-endian byte form of a hex-encoded integer, at least one byte,
/// leading zeros dropped.
fn hex_to_bytes(value: &str) -> Result<Vec<u8>, MutateError> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(MutateError::InvalidValue(value.to_string()));
    }

    let padded = if digits.len() % 2 == 1 {
        format!("0{digits}")
    } else {
        digits.to_string()
    };
    let mut bytes: Vec<u8> = (0..padded.len() / 2)
        .map(|i| u8::from_str_radix(&padded[i * 2..i * 2 + 2], 16).unwrap_or(0))
        .collect();

    let leading = bytes.iter().take_while(|&&b| b == 0).count();
    let keep = leading.min(bytes.len() - 1);
    bytes.drain(..keep);
    Ok(bytes)
}

/// Lowercase unpadded `0x…` form of a big-endian byte value.
fn bytes_to_hex(bytes: &[u8]) -> String {
    let first_nonzero = bytes.iter().position(|&b| b != 0);
    match first_nonzero {
        None => "0x0".to_string(),
        Some(idx) => {
            let mut out = format!("{:#x}", bytes[idx]);
            for byte in &bytes[idx + 1..] {
                out.push_str(&format!("{byte:02x}"));
            }
            out
        }
    }
}

/// Number of significant bits in a big-endian byte value.
fn bit_length(bytes: &[u8]) -> usize {
    match bytes.iter().position(|&b| b != 0) {
        None => 0,
        Some(idx) => (bytes.len() - idx - 1) * 8 + (8 - bytes[idx].leading_zeros() as usize),
    }
}
