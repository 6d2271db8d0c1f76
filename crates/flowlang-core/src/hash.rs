//! Deterministic content hashing over values and DAG specs using blake3.
//!
//! Hashes are stable across runs and depend only on structure:
//! - records hash by sorted field name, so field order never matters;
//! - map pairs hash as a sorted multiset;
//! - floats normalize every NaN to one canonical bit pattern and −0.0 to
//!   +0.0;
//! - the buffer and boxed forms of a list hash identically.
//!
//! Every variant mixes in a domain tag byte so values of different kinds
//! cannot collide by accident. DAG specs hash over their canonical JSON
//! serialization, which is deterministic for a given compilation.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::dag::DagSpec;
use crate::value::Value;

/// A 256-bit content digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Hex rendering of the digest.
    pub fn to_hex(self) -> String {
        let mut s = String::with_capacity(64);
        for b in self.0 {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }

    /// Parses a 64-character hex digest.
    pub fn from_hex(hex: &str) -> Option<ContentHash> {
        if hex.len() != 64 {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = (hi * 16 + lo) as u8;
        }
        Some(ContentHash(bytes))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        ContentHash::from_hex(&hex).ok_or_else(|| D::Error::custom("invalid content hash"))
    }
}

impl From<blake3::Hash> for ContentHash {
    fn from(h: blake3::Hash) -> Self {
        ContentHash(*h.as_bytes())
    }
}

// Domain tags, one per value kind.
const TAG_STRING: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_BOOLEAN: u8 = 0x04;
const TAG_RECORD: u8 = 0x05;
const TAG_LIST: u8 = 0x06;
const TAG_MAP: u8 = 0x07;
const TAG_PRESENT: u8 = 0x08;
const TAG_ABSENT: u8 = 0x09;

/// Content hash of a runtime value.
pub fn hash_value(value: &Value) -> ContentHash {
    let mut hasher = blake3::Hasher::new();
    hash_value_into(value, &mut hasher);
    hasher.finalize().into()
}

fn hash_value_into(value: &Value, hasher: &mut blake3::Hasher) {
    match value {
        Value::String(s) => {
            hasher.update(&[TAG_STRING]);
            hasher.update(&(s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Int(i) => {
            hasher.update(&[TAG_INT]);
            hasher.update(&i.to_le_bytes());
        }
        Value::Float(x) => {
            hasher.update(&[TAG_FLOAT]);
            hasher.update(&normalize_float(*x).to_le_bytes());
        }
        Value::Boolean(b) => {
            hasher.update(&[TAG_BOOLEAN, u8::from(*b)]);
        }
        Value::Record(fields) => {
            hasher.update(&[TAG_RECORD]);
            hasher.update(&(fields.len() as u64).to_le_bytes());
            let mut names: Vec<&String> = fields.keys().collect();
            names.sort();
            for name in names {
                hasher.update(&(name.len() as u64).to_le_bytes());
                hasher.update(name.as_bytes());
                hash_value_into(&fields[name.as_str()], hasher);
            }
        }
        Value::List(items) => {
            hasher.update(&[TAG_LIST]);
            hasher.update(&(items.len() as u64).to_le_bytes());
            for item in items {
                hash_value_into(item, hasher);
            }
        }
        // Buffers hash exactly as their boxed element sequence would.
        Value::IntBuffer(items) => {
            hasher.update(&[TAG_LIST]);
            hasher.update(&(items.len() as u64).to_le_bytes());
            for i in items.iter() {
                hasher.update(&[TAG_INT]);
                hasher.update(&i.to_le_bytes());
            }
        }
        Value::FloatBuffer(items) => {
            hasher.update(&[TAG_LIST]);
            hasher.update(&(items.len() as u64).to_le_bytes());
            for x in items.iter() {
                hasher.update(&[TAG_FLOAT]);
                hasher.update(&normalize_float(*x).to_le_bytes());
            }
        }
        Value::Map(pairs) => {
            hasher.update(&[TAG_MAP]);
            hasher.update(&(pairs.len() as u64).to_le_bytes());
            // Pair order is insignificant: hash each pair separately and
            // combine in sorted digest order.
            let mut digests: Vec<[u8; 32]> = pairs
                .iter()
                .map(|(k, v)| {
                    let mut pair_hasher = blake3::Hasher::new();
                    hash_value_into(k, &mut pair_hasher);
                    hash_value_into(v, &mut pair_hasher);
                    *pair_hasher.finalize().as_bytes()
                })
                .collect();
            digests.sort_unstable();
            for digest in digests {
                hasher.update(&digest);
            }
        }
        Value::Optional(Some(inner)) => {
            hasher.update(&[TAG_PRESENT]);
            hash_value_into(inner, hasher);
        }
        Value::Optional(None) => {
            hasher.update(&[TAG_ABSENT]);
        }
    }
}

/// One canonical bit pattern per numeric identity: all NaNs collapse to the
/// standard quiet NaN and −0.0 to +0.0.
fn normalize_float(x: f64) -> u64 {
    if x.is_nan() {
        f64::NAN.to_bits()
    } else if x == 0.0 {
        0.0f64.to_bits()
    } else {
        x.to_bits()
    }
}

/// Structural hash of a DAG spec: its identity for content-addressed
/// storage. Compilation is deterministic, so the canonical serialization is
/// too.
pub fn hash_dag(spec: &DagSpec) -> ContentHash {
    let bytes = serde_json::to_vec(spec).expect("dag specs always serialize");
    blake3::hash(&bytes).into()
}

/// Content hash of a named input assignment, used for module-level cache
/// keys: `(module name, inputs)`.
pub fn hash_named_inputs<'a, I>(module: &str, inputs: I) -> ContentHash
where
    I: IntoIterator<Item = (&'a str, &'a Value)>,
{
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(module.len() as u64).to_le_bytes());
    hasher.update(module.as_bytes());
    let mut entries: Vec<(&str, &Value)> = inputs.into_iter().collect();
    entries.sort_by_key(|(name, _)| *name);
    for (name, value) in entries {
        hasher.update(&(name.len() as u64).to_le_bytes());
        hasher.update(name.as_bytes());
        hash_value_into(value, &mut hasher);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn hash_is_deterministic() {
        let v = Value::record([("a", Value::Int(1)), ("b", Value::String("x".into()))]);
        assert_eq!(hash_value(&v), hash_value(&v));
    }

    #[test]
    fn hash_is_stable_under_record_field_reordering() {
        let a = Value::record([("x", Value::Int(1)), ("y", Value::Int(2))]);
        let b = Value::record([("y", Value::Int(2)), ("x", Value::Int(1))]);
        assert_eq!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn hash_is_stable_under_reserialization() {
        let v = Value::record([
            ("items", Value::List(vec![Value::Int(1), Value::Int(2)])),
            ("label", Value::present(Value::String("hi".into()))),
        ]);
        let json = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(hash_value(&v), hash_value(&back));
    }

    #[test]
    fn hash_distinguishes_different_values() {
        assert_ne!(hash_value(&Value::Int(1)), hash_value(&Value::Int(2)));
        assert_ne!(
            hash_value(&Value::Int(1)),
            hash_value(&Value::Float(1.0)),
            "int and float of the same magnitude must differ"
        );
        assert_ne!(
            hash_value(&Value::String("1".into())),
            hash_value(&Value::Int(1))
        );
    }

    #[test]
    fn nan_and_negative_zero_normalize() {
        let nan_a = Value::Float(f64::NAN);
        let nan_b = Value::Float(f64::from_bits(0x7ff8_0000_0000_0001));
        assert_eq!(hash_value(&nan_a), hash_value(&nan_b));
        assert_eq!(
            hash_value(&Value::Float(-0.0)),
            hash_value(&Value::Float(0.0))
        );
    }

    #[test]
    fn buffer_and_boxed_lists_hash_identically() {
        let buf = Value::IntBuffer(Arc::new(vec![1, 2, 3]));
        let boxed = Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(hash_value(&buf), hash_value(&boxed));

        let fbuf = Value::FloatBuffer(Arc::new(vec![0.5, -0.0]));
        let fboxed = Value::List(vec![Value::Float(0.5), Value::Float(0.0)]);
        assert_eq!(hash_value(&fbuf), hash_value(&fboxed));
    }

    #[test]
    fn map_hash_ignores_pair_order() {
        let a = Value::Map(vec![
            (Value::String("k1".into()), Value::Int(1)),
            (Value::String("k2".into()), Value::Int(2)),
        ]);
        let b = Value::Map(vec![
            (Value::String("k2".into()), Value::Int(2)),
            (Value::String("k1".into()), Value::Int(1)),
        ]);
        assert_eq!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn hex_roundtrip() {
        let h = hash_value(&Value::Int(42));
        let hex = h.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ContentHash::from_hex(&hex), Some(h));
        assert_eq!(ContentHash::from_hex("zz"), None);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn value_strategy() -> impl Strategy<Value = Value> {
            // Finite floats only: JSON has no representation for NaN or
            // infinities.
            let leaf = prop_oneof![
                any::<i64>().prop_map(Value::Int),
                (-1.0e9f64..1.0e9).prop_map(Value::Float),
                any::<bool>().prop_map(Value::Boolean),
                "[a-z]{0,8}".prop_map(Value::String),
                Just(Value::absent()),
            ];
            leaf.prop_recursive(3, 24, 4, |inner| {
                prop_oneof![
                    prop::collection::vec(inner.clone(), 0..4).prop_map(Value::List),
                    prop::collection::vec(("[a-z]{1,6}", inner.clone()), 0..4).prop_map(
                        |fields| Value::Record(fields.into_iter().collect())
                    ),
                    inner.prop_map(Value::present),
                ]
            })
        }

        proptest! {
            #[test]
            fn hash_stable_under_reserialization(value in value_strategy()) {
                let json = serde_json::to_string(&value).unwrap();
                let back: Value = serde_json::from_str(&json).unwrap();
                prop_assert_eq!(hash_value(&value), hash_value(&back));
            }

            #[test]
            fn zero_value_inhabits_the_type(value in value_strategy()) {
                let ty = value.type_of();
                let zero = Value::zero_of(&ty).unwrap();
                prop_assert!(zero.type_of().is_subtype_of(&ty));
            }

            #[test]
            fn compaction_preserves_equality_and_hash(value in value_strategy()) {
                let compacted = value.clone().compact();
                prop_assert_eq!(&compacted, &value);
                prop_assert_eq!(hash_value(&compacted), hash_value(&value));
            }
        }
    }

    #[test]
    fn named_input_hash_ignores_argument_order() {
        let x = Value::Int(1);
        let y = Value::Int(2);
        let a = hash_named_inputs("Concat", [("left", &x), ("right", &y)]);
        let b = hash_named_inputs("Concat", [("right", &y), ("left", &x)]);
        assert_eq!(a, b);
        let c = hash_named_inputs("Other", [("left", &x), ("right", &y)]);
        assert_ne!(a, c);
    }
}
