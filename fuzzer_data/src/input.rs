//! Generated fuzz inputs.
//!
//! A fuzz input is the concrete parameter map a target builds from a seed:
//! field name to typed value. Inputs are persisted verbatim when a test
//! crashes, so the value enum serializes to plain JSON scalars.

use indexmap::IndexMap;
use serde::Serialize;

/// Parameter map handed to `run_test` and persisted on crashes.
pub type FuzzInput = IndexMap<String, FuzzValue>;

/// One generated parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FuzzValue {
    /// Plain integer, rendered decimal.
    Int(i64),
    /// Hexadecimal integer kept in its lowercase `0x…` form. Mutations can
    /// grow these beyond 64 bits, so the textual form is authoritative.
    Hex(String),
    /// Hex-encoded byte string produced by string mutation.
    Str(String),
}

impl FuzzValue {
    /// The value as a harness command-line argument.
    pub fn as_arg(&self) -> String {
        match self {
            FuzzValue::Int(v) => v.to_string(),
            FuzzValue::Hex(v) => v.clone(),
            FuzzValue::Str(v) => v.clone(),
        }
    }

    /// The value in the form a `hex` typed seed field stores: `0x…`.
    pub fn as_seed_value(&self) -> String {
        match self {
            FuzzValue::Int(v) => v.to_string(),
            FuzzValue::Hex(v) => v.clone(),
            FuzzValue::Str(v) => v.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_serialize_as_plain_scalars() {
        let mut input = FuzzInput::new();
        input.insert("xtest_number".to_string(), FuzzValue::Int(1001));
        input.insert("a7".to_string(), FuzzValue::Hex("0x10".to_string()));
        input.insert("payload".to_string(), FuzzValue::Str("414141".to_string()));
        let json = serde_json::to_string(&input).unwrap();
        assert_eq!(
            json,
            r#"{"xtest_number":1001,"a7":"0x10","payload":"414141"}"#
        );
    }

    #[test]
    fn arg_rendering_matches_type() {
        assert_eq!(FuzzValue::Int(7).as_arg(), "7");
        assert_eq!(FuzzValue::Hex("0x2f".to_string()).as_arg(), "0x2f");
    }
}
