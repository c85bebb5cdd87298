//! Shared data model for the fuzzing engine: configuration, address
//! filters, structured seeds and generated fuzz inputs.

use std::num::ParseIntError;

pub mod config;
pub mod input;
pub mod seed;

pub use config::{AddressFilterEntry, Config, FuzzingConfig, QemuParams, SshParams};
pub use input::{FuzzInput, FuzzValue};
pub use seed::{FieldKind, Seed, SeedField};

/// Parses a hexadecimal address of the form `0x…` (the `0x` prefix is
/// optional, case-insensitive).
pub fn parse_hex(value: &str) -> Result<u64, ParseIntError> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u64::from_str_radix(digits, 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_accepts_prefixed_and_bare() {
        assert_eq!(parse_hex("0x1000").unwrap(), 0x1000);
        assert_eq!(parse_hex("0XdeadBEEF").unwrap(), 0xdead_beef);
        assert_eq!(parse_hex("ff").unwrap(), 0xff);
        assert!(parse_hex("0xzz").is_err());
    }
}
