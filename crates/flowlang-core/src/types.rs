//! The flowlang type system.
//!
//! A closed structural algebra: four primitives, records, lists, maps,
//! optionals, unions, and the bottom type `Nothing`. Record fields use
//! [`IndexMap`] so field order is stable for display but insignificant for
//! equality. Subtyping is structural (width subtyping on records, covariant
//! lists/optionals/map values, invariant map keys) with `Nothing` below
//! everything.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A flowlang type. Each variant represents a distinct kind of type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DataType {
    /// UTF-8 text.
    String,
    /// 64-bit signed integer.
    Int,
    /// 64-bit IEEE-754 double.
    Float,
    Boolean,
    /// Structural record with insertion-ordered fields.
    Record(IndexMap<String, DataType>),
    /// Ordered, finite list.
    List(Box<DataType>),
    /// Unordered mapping. Keys are invariant under subtyping.
    Map(Box<DataType>, Box<DataType>),
    /// Present with a value of the inner type, or absent.
    Optional(Box<DataType>),
    /// Value of any member type. Always kept in flattened, deduplicated form
    /// via [`DataType::union`].
    Union(Vec<DataType>),
    /// Bottom: subtype of every type. Not constructible by user code.
    Nothing,
}

impl DataType {
    /// Builds a record type from (name, type) pairs.
    pub fn record<I, S>(fields: I) -> DataType
    where
        I: IntoIterator<Item = (S, DataType)>,
        S: Into<String>,
    {
        DataType::Record(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Builds a list type.
    pub fn list(element: DataType) -> DataType {
        DataType::List(Box::new(element))
    }

    /// Builds an optional type.
    pub fn optional(inner: DataType) -> DataType {
        DataType::Optional(Box::new(inner))
    }

    /// Builds a union type in normal form: nested unions are flattened,
    /// duplicate members removed. A single-member union collapses to that
    /// member; an empty union is `Nothing`.
    pub fn union<I: IntoIterator<Item = DataType>>(members: I) -> DataType {
        let mut flat: Vec<DataType> = Vec::new();
        for member in members {
            match member {
                DataType::Union(inner) => {
                    for m in inner {
                        if !flat.contains(&m) {
                            flat.push(m);
                        }
                    }
                }
                DataType::Nothing => {}
                other => {
                    if !flat.contains(&other) {
                        flat.push(other);
                    }
                }
            }
        }
        match flat.len() {
            0 => DataType::Nothing,
            1 => flat.pop().unwrap(),
            _ => DataType::Union(flat),
        }
    }

    /// Structural subtyping: `self <: other`.
    ///
    /// Reflexive and transitive. `Nothing` is below everything; a union is a
    /// subtype when every member is, and a supertype when some member covers
    /// the candidate. Records use width subtyping: extra fields on the left
    /// are allowed.
    pub fn is_subtype_of(&self, other: &DataType) -> bool {
        match (self, other) {
            (DataType::Nothing, _) => true,
            // Every member of the left union must fit the target. This arm
            // also covers union <: union.
            (DataType::Union(members), _) => members.iter().all(|m| m.is_subtype_of(other)),
            (_, DataType::Union(members)) => members.iter().any(|m| self.is_subtype_of(m)),
            (DataType::String, DataType::String)
            | (DataType::Int, DataType::Int)
            | (DataType::Float, DataType::Float)
            | (DataType::Boolean, DataType::Boolean) => true,
            (DataType::Record(a), DataType::Record(b)) => b
                .iter()
                .all(|(name, tb)| a.get(name).is_some_and(|ta| ta.is_subtype_of(tb))),
            (DataType::List(a), DataType::List(b)) => a.is_subtype_of(b),
            (DataType::Optional(a), DataType::Optional(b)) => a.is_subtype_of(b),
            // Keys are invariant, except that the `Nothing` key of an empty
            // map fits any key type.
            (DataType::Map(ka, va), DataType::Map(kb, vb)) => {
                (ka == kb || **ka == DataType::Nothing) && va.is_subtype_of(vb)
            }
            _ => false,
        }
    }

    /// Least upper bound of two types. Falls back to a union when no common
    /// supertype exists.
    pub fn lub(&self, other: &DataType) -> DataType {
        if self.is_subtype_of(other) {
            return other.clone();
        }
        if other.is_subtype_of(self) {
            return self.clone();
        }
        match (self, other) {
            (DataType::Record(a), DataType::Record(b)) => {
                let common: IndexMap<String, DataType> = a
                    .iter()
                    .filter_map(|(name, ta)| b.get(name).map(|tb| (name.clone(), ta.lub(tb))))
                    .collect();
                if common.is_empty() {
                    DataType::union([self.clone(), other.clone()])
                } else {
                    DataType::Record(common)
                }
            }
            (DataType::List(a), DataType::List(b)) => DataType::list(a.lub(b)),
            (DataType::Optional(a), DataType::Optional(b)) => DataType::optional(a.lub(b)),
            (DataType::Map(ka, va), DataType::Map(kb, vb)) if ka == kb => {
                DataType::Map(ka.clone(), Box::new(va.lub(vb)))
            }
            _ => DataType::union([self.clone(), other.clone()]),
        }
    }

    /// True for `Int` and `Float`.
    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Int | DataType::Float)
    }

    /// The element type if this is a list type.
    pub fn list_element(&self) -> Option<&DataType> {
        match self {
            DataType::List(e) => Some(e),
            _ => None,
        }
    }

    /// The record fields if this is a record type.
    pub fn record_fields(&self) -> Option<&IndexMap<String, DataType>> {
        match self {
            DataType::Record(fields) => Some(fields),
            _ => None,
        }
    }
}

// Equality is structural: record field order is insignificant (IndexMap
// equality already ignores order) and union members compare as sets.
impl PartialEq for DataType {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DataType::String, DataType::String)
            | (DataType::Int, DataType::Int)
            | (DataType::Float, DataType::Float)
            | (DataType::Boolean, DataType::Boolean)
            | (DataType::Nothing, DataType::Nothing) => true,
            (DataType::Record(a), DataType::Record(b)) => a == b,
            (DataType::List(a), DataType::List(b)) => a == b,
            (DataType::Optional(a), DataType::Optional(b)) => a == b,
            (DataType::Map(ka, va), DataType::Map(kb, vb)) => ka == kb && va == vb,
            (DataType::Union(a), DataType::Union(b)) => {
                a.iter().all(|m| b.contains(m)) && b.iter().all(|m| a.contains(m))
            }
            _ => false,
        }
    }
}

impl Eq for DataType {}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::String => write!(f, "String"),
            DataType::Int => write!(f, "Int"),
            DataType::Float => write!(f, "Float"),
            DataType::Boolean => write!(f, "Boolean"),
            DataType::Record(fields) => {
                write!(f, "{{")?;
                for (i, (name, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {ty}")?;
                }
                write!(f, "}}")
            }
            DataType::List(e) => write!(f, "[{e}]"),
            DataType::Map(k, v) => write!(f, "Map<{k}, {v}>"),
            DataType::Optional(inner) => match inner.as_ref() {
                DataType::Union(_) => write!(f, "({inner})?"),
                _ => write!(f, "{inner}?"),
            },
            DataType::Union(members) => {
                for (i, m) in members.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{m}")?;
                }
                Ok(())
            }
            DataType::Nothing => write!(f, "Nothing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> DataType {
        DataType::record([("x", DataType::Int), ("y", DataType::Int)])
    }

    fn point3() -> DataType {
        DataType::record([
            ("x", DataType::Int),
            ("y", DataType::Int),
            ("z", DataType::Int),
        ])
    }

    #[test]
    fn subtyping_is_reflexive() {
        for ty in [
            DataType::String,
            DataType::Int,
            point(),
            DataType::list(DataType::Float),
            DataType::optional(DataType::Boolean),
            DataType::union([DataType::Int, DataType::String]),
        ] {
            assert!(ty.is_subtype_of(&ty), "{ty} must be a subtype of itself");
        }
    }

    #[test]
    fn nothing_is_below_everything() {
        for ty in [DataType::String, point(), DataType::list(DataType::Int)] {
            assert!(DataType::Nothing.is_subtype_of(&ty));
            assert!(!ty.is_subtype_of(&DataType::Nothing));
        }
    }

    #[test]
    fn record_width_subtyping() {
        assert!(point3().is_subtype_of(&point()));
        assert!(!point().is_subtype_of(&point3()));
    }

    #[test]
    fn record_depth_subtyping() {
        let narrow = DataType::record([("p", point3())]);
        let wide = DataType::record([("p", point())]);
        assert!(narrow.is_subtype_of(&wide));
    }

    #[test]
    fn empty_record_is_top_record() {
        let empty = DataType::record(Vec::<(String, DataType)>::new());
        assert!(point().is_subtype_of(&empty));
        assert!(empty.is_subtype_of(&empty));
    }

    #[test]
    fn list_covariance() {
        assert!(DataType::list(point3()).is_subtype_of(&DataType::list(point())));
        assert!(DataType::list(DataType::Nothing).is_subtype_of(&DataType::list(DataType::Int)));
    }

    #[test]
    fn map_keys_invariant_values_covariant() {
        let a = DataType::Map(Box::new(DataType::String), Box::new(point3()));
        let b = DataType::Map(Box::new(DataType::String), Box::new(point()));
        assert!(a.is_subtype_of(&b));

        let c = DataType::Map(Box::new(point3()), Box::new(DataType::Int));
        let d = DataType::Map(Box::new(point()), Box::new(DataType::Int));
        assert!(!c.is_subtype_of(&d), "keys must be invariant");
    }

    #[test]
    fn empty_map_fits_any_key_type() {
        let empty = DataType::Map(Box::new(DataType::Nothing), Box::new(DataType::Nothing));
        let target = DataType::Map(Box::new(DataType::String), Box::new(DataType::Int));
        assert!(empty.is_subtype_of(&target));
    }

    #[test]
    fn union_membership_rules() {
        let u = DataType::union([DataType::Int, DataType::String]);
        assert!(DataType::Int.is_subtype_of(&u));
        assert!(DataType::String.is_subtype_of(&u));
        assert!(!DataType::Float.is_subtype_of(&u));
        // Union on the left: every member must fit the target.
        assert!(u.is_subtype_of(&DataType::union([
            DataType::Int,
            DataType::String,
            DataType::Float
        ])));
        assert!(!u.is_subtype_of(&DataType::Int));
    }

    #[test]
    fn union_flattens_and_dedups() {
        let nested = DataType::union([
            DataType::Int,
            DataType::union([DataType::String, DataType::Int]),
        ]);
        assert_eq!(nested, DataType::union([DataType::Int, DataType::String]));

        let single = DataType::union([DataType::Int]);
        assert_eq!(single, DataType::Int);
    }

    #[test]
    fn union_equality_ignores_member_order() {
        let a = DataType::union([DataType::Int, DataType::String]);
        let b = DataType::union([DataType::String, DataType::Int]);
        assert_eq!(a, b);
    }

    #[test]
    fn record_equality_ignores_field_order() {
        let a = DataType::record([("x", DataType::Int), ("y", DataType::String)]);
        let b = DataType::record([("y", DataType::String), ("x", DataType::Int)]);
        assert_eq!(a, b);
    }

    #[test]
    fn lub_of_subtype_pair_is_supertype() {
        assert_eq!(point3().lub(&point()), point());
        assert_eq!(point().lub(&point3()), point());
    }

    #[test]
    fn lub_of_disjoint_records_keeps_common_fields() {
        let a = DataType::record([("x", DataType::Int), ("s", DataType::String)]);
        let b = DataType::record([("x", DataType::Int), ("f", DataType::Float)]);
        assert_eq!(a.lub(&b), DataType::record([("x", DataType::Int)]));
    }

    #[test]
    fn lub_falls_back_to_union() {
        assert_eq!(
            DataType::Int.lub(&DataType::String),
            DataType::union([DataType::Int, DataType::String])
        );
    }

    #[test]
    fn lub_with_nothing_is_identity() {
        assert_eq!(DataType::Nothing.lub(&DataType::Int), DataType::Int);
        assert_eq!(point().lub(&DataType::Nothing), point());
    }

    #[test]
    fn display_formats() {
        assert_eq!(DataType::list(DataType::Int).to_string(), "[Int]");
        assert_eq!(
            DataType::optional(DataType::String).to_string(),
            "String?"
        );
        assert_eq!(point().to_string(), "{x: Int, y: Int}");
        assert_eq!(
            DataType::union([DataType::Int, DataType::String]).to_string(),
            "Int | String"
        );
        assert_eq!(
            DataType::Map(Box::new(DataType::String), Box::new(DataType::Int)).to_string(),
            "Map<String, Int>"
        );
    }

    #[test]
    fn deep_nesting_is_supported() {
        let mut ty = DataType::Int;
        for _ in 0..12 {
            ty = DataType::record([("inner", ty)]);
        }
        assert!(ty.is_subtype_of(&ty));
        let json = serde_json::to_string(&ty).unwrap();
        let back: DataType = serde_json::from_str(&json).unwrap();
        assert_eq!(ty, back);
    }

    #[test]
    fn serde_roundtrip() {
        let ty = DataType::record([
            ("items", DataType::list(point())),
            ("label", DataType::optional(DataType::String)),
            ("tag", DataType::union([DataType::Int, DataType::String])),
        ]);
        let json = serde_json::to_string(&ty).unwrap();
        let back: DataType = serde_json::from_str(&json).unwrap();
        assert_eq!(ty, back);
    }
}
