//! Runtime value representation.
//!
//! [`Value`] is the dynamic counterpart to the static [`DataType`] algebra:
//! one variant per type, with the variant tag always known. Equality is
//! structural. Large homogeneous lists of primitives additionally have raw
//! buffer representations ([`Value::IntBuffer`], [`Value::FloatBuffer`]) that
//! avoid per-element boxing in hot paths; conversion to and from the general
//! representation is lossless and the two compare equal.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::DataType;

/// A runtime value flowing through the DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    String(String),
    Int(i64),
    Float(f64),
    Boolean(bool),
    /// Record fields in insertion order.
    Record(IndexMap<String, Value>),
    List(Vec<Value>),
    /// Raw buffer form of `[Int]`.
    IntBuffer(Arc<Vec<i64>>),
    /// Raw buffer form of `[Float]`.
    FloatBuffer(Arc<Vec<f64>>),
    /// Unordered key/value pairs.
    Map(Vec<(Value, Value)>),
    /// Present with an inner value, or absent.
    Optional(Option<Box<Value>>),
}

impl Value {
    /// Builds a record value from (name, value) pairs.
    pub fn record<I, S>(fields: I) -> Value
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        Value::Record(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// A present optional.
    pub fn present(inner: Value) -> Value {
        Value::Optional(Some(Box::new(inner)))
    }

    /// The absent optional.
    pub fn absent() -> Value {
        Value::Optional(None)
    }

    /// The type of this value. For lists and maps the element type is the
    /// least upper bound over elements; empty containers use `Nothing`, the
    /// bottom type, so they fit any declared element type.
    pub fn type_of(&self) -> DataType {
        match self {
            Value::String(_) => DataType::String,
            Value::Int(_) => DataType::Int,
            Value::Float(_) => DataType::Float,
            Value::Boolean(_) => DataType::Boolean,
            Value::Record(fields) => DataType::Record(
                fields
                    .iter()
                    .map(|(name, v)| (name.clone(), v.type_of()))
                    .collect(),
            ),
            Value::List(items) => DataType::list(
                items
                    .iter()
                    .fold(DataType::Nothing, |acc, v| acc.lub(&v.type_of())),
            ),
            Value::IntBuffer(_) => DataType::list(DataType::Int),
            Value::FloatBuffer(_) => DataType::list(DataType::Float),
            Value::Map(pairs) => {
                let key = pairs
                    .iter()
                    .fold(DataType::Nothing, |acc, (k, _)| acc.lub(&k.type_of()));
                let value = pairs
                    .iter()
                    .fold(DataType::Nothing, |acc, (_, v)| acc.lub(&v.type_of()));
                DataType::Map(Box::new(key), Box::new(value))
            }
            Value::Optional(Some(inner)) => DataType::optional(inner.type_of()),
            Value::Optional(None) => DataType::optional(DataType::Nothing),
        }
    }

    /// Short name of the value's kind, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::String(_) => "String",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Boolean(_) => "Boolean",
            Value::Record(_) => "Record",
            Value::List(_) | Value::IntBuffer(_) | Value::FloatBuffer(_) => "List",
            Value::Map(_) => "Map",
            Value::Optional(_) => "Optional",
        }
    }

    /// Converts buffer representations to the general boxed form, leaving
    /// every other value untouched. Lossless.
    pub fn into_boxed(self) -> Value {
        match self {
            Value::IntBuffer(items) => Value::List(items.iter().map(|i| Value::Int(*i)).collect()),
            Value::FloatBuffer(items) => {
                Value::List(items.iter().map(|f| Value::Float(*f)).collect())
            }
            other => other,
        }
    }

    /// Compacts a boxed list of homogeneous `Int` or `Float` values into its
    /// raw buffer form; any other value is returned unchanged. Lossless.
    pub fn compact(self) -> Value {
        let Value::List(items) = self else {
            return self;
        };
        if !items.is_empty() && items.iter().all(|v| matches!(v, Value::Int(_))) {
            let buf: Vec<i64> = items
                .iter()
                .map(|v| match v {
                    Value::Int(i) => *i,
                    _ => unreachable!(),
                })
                .collect();
            return Value::IntBuffer(Arc::new(buf));
        }
        if !items.is_empty() && items.iter().all(|v| matches!(v, Value::Float(_))) {
            let buf: Vec<f64> = items
                .iter()
                .map(|v| match v {
                    Value::Float(f) => *f,
                    _ => unreachable!(),
                })
                .collect();
            return Value::FloatBuffer(Arc::new(buf));
        }
        Value::List(items)
    }

    /// Views any list-shaped value as a vector of elements.
    pub fn list_items(&self) -> Option<Vec<Value>> {
        match self {
            Value::List(items) => Some(items.clone()),
            Value::IntBuffer(items) => Some(items.iter().map(|i| Value::Int(*i)).collect()),
            Value::FloatBuffer(items) => Some(items.iter().map(|f| Value::Float(*f)).collect()),
            _ => None,
        }
    }

    /// Extracts a boolean or reports a type mismatch.
    pub fn as_boolean(&self) -> Result<bool, CoreError> {
        match self {
            Value::Boolean(b) => Ok(*b),
            other => Err(CoreError::type_mismatch("Boolean", other.kind_name())),
        }
    }

    /// Extracts record fields or reports a type mismatch.
    pub fn as_record(&self) -> Result<&IndexMap<String, Value>, CoreError> {
        match self {
            Value::Record(fields) => Ok(fields),
            other => Err(CoreError::type_mismatch("Record", other.kind_name())),
        }
    }

    /// Record merge with right-wins conflict resolution. When one operand is
    /// a list of records the merge broadcasts element-wise over it.
    pub fn merge(&self, other: &Value) -> Result<Value, CoreError> {
        match (self, other) {
            (Value::Record(a), Value::Record(b)) => {
                let mut merged = a.clone();
                for (name, v) in b {
                    merged.insert(name.clone(), v.clone());
                }
                Ok(Value::Record(merged))
            }
            (Value::List(items), Value::Record(_)) => Ok(Value::List(
                items
                    .iter()
                    .map(|item| item.merge(other))
                    .collect::<Result<_, _>>()?,
            )),
            (Value::Record(_), Value::List(items)) => Ok(Value::List(
                items
                    .iter()
                    .map(|item| self.merge(item))
                    .collect::<Result<_, _>>()?,
            )),
            _ => Err(CoreError::IncompatibleMerge {
                left: self.type_of(),
                right: other.type_of(),
            }),
        }
    }

    /// Record projection: keeps only the named fields, in the given order.
    /// Broadcasts element-wise over lists of records.
    pub fn project(&self, fields: &[String]) -> Result<Value, CoreError> {
        match self {
            Value::Record(record) => {
                let mut projected = IndexMap::with_capacity(fields.len());
                for name in fields {
                    match record.get(name) {
                        Some(v) => {
                            projected.insert(name.clone(), v.clone());
                        }
                        None => {
                            return Err(CoreError::InvalidProjection {
                                field: name.clone(),
                                available: record.keys().cloned().collect(),
                            })
                        }
                    }
                }
                Ok(Value::Record(projected))
            }
            Value::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|item| item.project(fields))
                    .collect::<Result<_, _>>()?,
            )),
            other => Err(CoreError::type_mismatch("Record", other.kind_name())),
        }
    }

    /// Record field access. Broadcasts element-wise over lists of records,
    /// yielding the list of field values.
    pub fn access(&self, field: &str) -> Result<Value, CoreError> {
        match self {
            Value::Record(record) => {
                record
                    .get(field)
                    .cloned()
                    .ok_or_else(|| CoreError::InvalidFieldAccess {
                        field: field.to_string(),
                        available: record.keys().cloned().collect(),
                    })
            }
            Value::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|item| item.access(field))
                    .collect::<Result<_, _>>()?,
            )),
            other => Err(CoreError::type_mismatch("Record", other.kind_name())),
        }
    }

    /// The zero value of a type, used by the `skip`/`log` error strategies.
    /// `Nothing` has none; a union zeroes to its first member.
    pub fn zero_of(ty: &DataType) -> Result<Value, CoreError> {
        match ty {
            DataType::String => Ok(Value::String(String::new())),
            DataType::Int => Ok(Value::Int(0)),
            DataType::Float => Ok(Value::Float(0.0)),
            DataType::Boolean => Ok(Value::Boolean(false)),
            DataType::Record(fields) => {
                let mut record = IndexMap::with_capacity(fields.len());
                for (name, field_ty) in fields {
                    record.insert(name.clone(), Value::zero_of(field_ty)?);
                }
                Ok(Value::Record(record))
            }
            DataType::List(_) => Ok(Value::List(Vec::new())),
            DataType::Map(_, _) => Ok(Value::Map(Vec::new())),
            DataType::Optional(_) => Ok(Value::absent()),
            DataType::Union(members) => match members.first() {
                Some(first) => Value::zero_of(first),
                None => Err(CoreError::NoZeroValue { ty: ty.clone() }),
            },
            DataType::Nothing => Err(CoreError::NoZeroValue { ty: ty.clone() }),
        }
    }

    /// Bare rendering used by string interpolation: strings render without
    /// quotes at the top level, containers render in literal form.
    pub fn render(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

// Structural equality. The buffer representations compare equal to their
// boxed counterparts, and map pair order is insignificant.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Optional(a), Value::Optional(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter().all(|pair| b.contains(pair))
                    && b.iter().all(|pair| a.contains(pair))
            }
            (Value::List(a), Value::List(b)) => a == b,
            (Value::IntBuffer(a), Value::IntBuffer(b)) => a == b,
            (Value::FloatBuffer(a), Value::FloatBuffer(b)) => a == b,
            (Value::IntBuffer(buf), Value::List(items))
            | (Value::List(items), Value::IntBuffer(buf)) => {
                buf.len() == items.len()
                    && buf
                        .iter()
                        .zip(items)
                        .all(|(i, v)| matches!(v, Value::Int(x) if x == i))
            }
            (Value::FloatBuffer(buf), Value::List(items))
            | (Value::List(items), Value::FloatBuffer(buf)) => {
                buf.len() == items.len()
                    && buf
                        .iter()
                        .zip(items)
                        .all(|(f, v)| matches!(v, Value::Float(x) if x == f))
            }
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{s:?}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Record(fields) => {
                write!(f, "{{")?;
                for (i, (name, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::List(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::IntBuffer(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::FloatBuffer(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Map(pairs) => {
                write!(f, "Map{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Optional(Some(inner)) => write!(f, "{inner}"),
            Value::Optional(None) => write!(f, "absent"),
        }
    }
}
