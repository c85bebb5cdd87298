//! Structured seed descriptors.
//!
//! A seed is an ordered mapping from field name to a descriptor carrying the
//! `fixed` pin, a type tag and mutation bounds. Seed files are JSON objects
//! with one entry per field; each entry's `order` key determines the
//! canonical field order.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

/// Type tag of a seed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Int,
    Hex,
    Str,
}

/// Descriptor of one seed field.
///
/// `min_len`, `max_len` (hex-encoded lengths) and `mutator` only apply to
/// non-fixed fields and are omitted from serialized form when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedField {
    pub order: u32,
    pub fixed: bool,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(deserialize_with = "string_or_number")]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_len: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_len: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutator: Option<String>,
}

/// Seed files written by hand sometimes carry numeric `value` entries;
/// normalize them to their decimal string form.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "seed value must be a string or number, got {other}"
        ))),
    }
}

/// An ordered field map. Equality ignores field order, matching the
/// re-test check in the corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seed(pub IndexMap<String, SeedField>);

impl Seed {
    /// Parses a seed file body and puts the fields into canonical order.
    pub fn from_json_str(json: &str) -> serde_json::Result<Self> {
        let mut seed: Seed = serde_json::from_str(json)?;
        seed.sort_by_order();
        Ok(seed)
    }

    /// Sorts the fields ascending by their `order` key.
    pub fn sort_by_order(&mut self) {
        self.0.sort_by(|_, a, _, b| a.order.cmp(&b.order));
    }

    /// Deterministic serialized form: the field map with sorted keys.
    /// Reordering entries in the source file does not change it.
    pub fn canonical_json(&self) -> String {
        let sorted: BTreeMap<&str, &SeedField> =
            self.0.iter().map(|(name, field)| (name.as_str(), field)).collect();
        serde_json::to_string(&sorted).expect("seed maps always serialize")
    }

    pub fn get(&self, name: &str) -> Option<&SeedField> {
        self.0.get(name)
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, String, SeedField> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SBI_SEED: &str = r#"{
        "a7": {"order": 0, "fixed": false, "type": "hex", "value": "0x10"},
        "a6": {"order": 1, "fixed": true, "type": "hex", "value": "0x0"},
        "a0": {"order": 2, "fixed": false, "type": "hex", "value": "0x0"}
    }"#;

    #[test]
    fn fields_sorted_by_order_key() {
        let shuffled = r#"{
            "a0": {"order": 2, "fixed": false, "type": "hex", "value": "0x0"},
            "a7": {"order": 0, "fixed": false, "type": "hex", "value": "0x10"},
            "a6": {"order": 1, "fixed": true, "type": "hex", "value": "0x0"}
        }"#;
        let seed = Seed::from_json_str(shuffled).unwrap();
        let names: Vec<&str> = seed.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["a7", "a6", "a0"]);
    }

    #[test]
    fn canonical_json_stable_under_reordering() {
        let a = Seed::from_json_str(SBI_SEED).unwrap();
        let b = Seed::from_json_str(
            r#"{
            "a6": {"order": 1, "type": "hex", "fixed": true, "value": "0x0"},
            "a0": {"order": 2, "fixed": false, "type": "hex", "value": "0x0"},
            "a7": {"fixed": false, "order": 0, "type": "hex", "value": "0x10"}
        }"#,
        )
        .unwrap();
        assert_eq!(a.canonical_json(), b.canonical_json());
        assert_eq!(a, b);
    }

    #[test]
    fn numeric_values_normalize_to_strings() {
        let seed = Seed::from_json_str(
            r#"{"xtest_number": {"order": 0, "fixed": true, "type": "int", "value": 1001}}"#,
        )
        .unwrap();
        assert_eq!(seed.get("xtest_number").unwrap().value, "1001");
    }

    #[test]
    fn optional_metadata_round_trips() {
        let seed = Seed::from_json_str(
            r#"{"payload": {"order": 0, "fixed": false, "type": "str", "value": "00",
                            "min_len": "0x1", "max_len": "0x20"}}"#,
        )
        .unwrap();
        let json = serde_json::to_string(&seed).unwrap();
        let reparsed = Seed::from_json_str(&json).unwrap();
        assert_eq!(seed, reparsed);
        assert!(!json.contains("mutator"));
    }
}
