//! Keys, key paths and key ranges.
//!
//! Keys follow the IndexedDB ordering: every number sorts before every
//! string, every string before every array, and arrays compare element by
//! element with a shorter prefix sorting first.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

/// A record key or index key.
#[derive(Debug, Clone)]
pub enum Key {
    /// A finite number.
    Number(f64),
    /// A string.
    String(String),
    /// An array of keys.
    Array(Vec<Key>),
}

impl Key {
    fn rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::String(_) => 1,
            Key::Array(_) => 2,
        }
    }

    /// Converts a JSON value into a key.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Data`] for booleans, null, objects and
    /// non-finite numbers, which are not valid keys.
    pub fn from_value(value: &Value) -> EngineResult<Self> {
        match value {
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.is_finite() => Ok(Key::Number(f)),
                _ => Err(EngineError::data(format!("{n} is not a valid key"))),
            },
            Value::String(s) => Ok(Key::String(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(Key::from_value)
                .collect::<EngineResult<Vec<_>>>()
                .map(Key::Array),
            other => Err(EngineError::data(format!("{other} is not a valid key"))),
        }
    }

    /// Converts the key into a JSON value.
    ///
    /// Integral numbers become JSON integers so that generated keys read
    /// back as `1` rather than `1.0`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(f) => {
                if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
                    Value::from(*f as i64)
                } else {
                    Value::from(*f)
                }
            }
            Key::String(s) => Value::String(s.clone()),
            Key::Array(items) => Value::Array(items.iter().map(Key::to_value).collect()),
        }
    }

    /// Returns the number if this is a numeric key.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Key::Number(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the string if this is a string key.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::String(s) => Some(s),
            _ => None,
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) => a.partial_cmp(b).unwrap_or_else(|| a.total_cmp(b)),
            (Key::String(a), Key::String(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Key::from_value(&value).map_err(serde::de::Error::custom)
    }
}

macro_rules! key_from_number {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Key {
            fn from(n: $ty) -> Self {
                Key::Number(n as f64)
            }
        })*
    };
}

key_from_number!(i32, i64, u32, u64, usize, f64);

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::String(s)
    }
}

impl From<Vec<Key>> for Key {
    fn from(items: Vec<Key>) -> Self {
        Key::Array(items)
    }
}

/// Where a key lives inside a record.
///
/// A single path is a dotted property path (`"address.city"`); the empty
/// string addresses the record itself. A compound path yields an array key
/// made of each component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
    /// One dotted property path.
    Single(String),
    /// Several property paths combined into an array key.
    Compound(Vec<String>),
}

impl KeyPath {
    /// Creates a single key path.
    pub fn single(path: impl Into<String>) -> Self {
        KeyPath::Single(path.into())
    }

    /// Creates a compound key path.
    pub fn compound<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeyPath::Compound(paths.into_iter().map(Into::into).collect())
    }

    /// Returns true for compound key paths.
    #[must_use]
    pub fn is_compound(&self) -> bool {
        matches!(self, KeyPath::Compound(_))
    }

    /// Checks that every path segment is usable.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidAccess`] for empty compound paths or
    /// empty segments.
    pub fn validate(&self) -> EngineResult<()> {
        let check = |path: &str| {
            if !path.is_empty() && path.split('.').any(str::is_empty) {
                return Err(EngineError::InvalidAccess(format!(
                    "invalid key path segment in {path:?}"
                )));
            }
            Ok(())
        };
        match self {
            KeyPath::Single(path) => check(path),
            KeyPath::Compound(paths) if paths.is_empty() => Err(EngineError::InvalidAccess(
                "compound key path must not be empty".into(),
            )),
            KeyPath::Compound(paths) => paths.iter().try_for_each(|p| {
                if p.is_empty() {
                    return Err(EngineError::InvalidAccess(
                        "compound key path components must not be empty".into(),
                    ));
                }
                check(p)
            }),
        }
    }

    /// Evaluates the key path against a record.
    ///
    /// Returns `Ok(None)` when any addressed property is missing.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Data`] when the addressed value exists but is
    /// not a valid key.
    pub fn extract(&self, record: &Value) -> EngineResult<Option<Key>> {
        match self {
            KeyPath::Single(path) => lookup(record, path).map(Key::from_value).transpose(),
            KeyPath::Compound(paths) => {
                let mut parts = Vec::with_capacity(paths.len());
                for path in paths {
                    match lookup(record, path) {
                        Some(value) => parts.push(Key::from_value(value)?),
                        None => return Ok(None),
                    }
                }
                Ok(Some(Key::Array(parts)))
            }
        }
    }

    /// Writes a generated key into the record at this path.
    ///
    /// Missing intermediate objects are created.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Data`] for compound paths, for the empty path
    /// and when a non-object value sits on the path.
    pub fn inject(&self, record: &mut Value, key: &Key) -> EngineResult<()> {
        let path = match self {
            KeyPath::Single(path) if !path.is_empty() => path,
            _ => {
                return Err(EngineError::data(format!(
                    "cannot inject a key at key path {self}"
                )))
            }
        };

        let mut segments: Vec<&str> = path.split('.').collect();
        let last = segments.pop().unwrap_or_default();
        let mut target = record;
        for segment in segments {
            let object = target
                .as_object_mut()
                .ok_or_else(|| EngineError::data(format!("{path}: {segment} is not an object")))?;
            target = object
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        let object = target
            .as_object_mut()
            .ok_or_else(|| EngineError::data(format!("{path}: record is not an object")))?;
        object.insert(last.to_string(), key.to_value());
        Ok(())
    }
}

fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(record);
    }
    path.split('.')
        .try_fold(record, |value, segment| value.as_object()?.get(segment))
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPath::Single(path) => write!(f, "{path:?}"),
            KeyPath::Compound(paths) => write!(f, "{paths:?}"),
        }
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        KeyPath::Single(path.to_string())
    }
}

impl From<String> for KeyPath {
    fn from(path: String) -> Self {
        KeyPath::Single(path)
    }
}

/// A contiguous interval of keys.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyRange {
    lower: Option<Key>,
    upper: Option<Key>,
    lower_open: bool,
    upper_open: bool,
}

impl KeyRange {
    /// A range matching every key.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// A range matching exactly one key.
    pub fn only(key: impl Into<Key>) -> Self {
        let key = key.into();
        Self {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        }
    }

    /// A range with only a lower bound.
    pub fn lower_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: Some(key.into()),
            lower_open: open,
            ..Self::default()
        }
    }

    /// A range with only an upper bound.
    pub fn upper_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            upper: Some(key.into()),
            upper_open: open,
            ..Self::default()
        }
    }

    /// A range with both bounds.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Data`] if the range is empty.
    pub fn bound(
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        lower_open: bool,
        upper_open: bool,
    ) -> EngineResult<Self> {
        let lower = lower.into();
        let upper = upper.into();
        match lower.cmp(&upper) {
            Ordering::Greater => {
                return Err(EngineError::data(format!(
                    "lower bound {lower} is greater than upper bound {upper}"
                )))
            }
            Ordering::Equal if lower_open || upper_open => {
                return Err(EngineError::data(format!(
                    "range with equal bounds {lower} cannot be open"
                )))
            }
            _ => {}
        }
        Ok(Self {
            lower: Some(lower),
            upper: Some(upper),
            lower_open,
            upper_open,
        })
    }

    /// The lower bound, if any.
    #[must_use]
    pub fn lower(&self) -> Option<&Key> {
        self.lower.as_ref()
    }

    /// The upper bound, if any.
    #[must_use]
    pub fn upper(&self) -> Option<&Key> {
        self.upper.as_ref()
    }

    /// Whether the lower bound is excluded.
    #[must_use]
    pub fn lower_open(&self) -> bool {
        self.lower_open
    }

    /// Whether the upper bound is excluded.
    #[must_use]
    pub fn upper_open(&self) -> bool {
        self.upper_open
    }

    /// The range as map bounds. Construction rules out empty ranges.
    pub(crate) fn bounds(&self) -> (Bound<&Key>, Bound<&Key>) {
        fn side(key: Option<&Key>, open: bool) -> Bound<&Key> {
            match key {
                None => Bound::Unbounded,
                Some(key) if open => Bound::Excluded(key),
                Some(key) => Bound::Included(key),
            }
        }
        (
            side(self.lower.as_ref(), self.lower_open),
            side(self.upper.as_ref(), self.upper_open),
        )
    }

    /// Returns true if the key lies within the range.
    #[must_use]
    pub fn contains(&self, key: &Key) -> bool {
        let above = match &self.lower {
            None => true,
            Some(lower) if self.lower_open => key > lower,
            Some(lower) => key >= lower,
        };
        let below = match &self.upper {
            None => true,
            Some(upper) if self.upper_open => key < upper,
            Some(upper) => key <= upper,
        };
        above && below
    }
}

impl From<Key> for KeyRange {
    fn from(key: Key) -> Self {
        KeyRange::only(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn numbers_sort_before_strings_before_arrays() {
        let mut keys = vec![
            Key::Array(vec![Key::from(1)]),
            Key::from("a"),
            Key::from(10),
            Key::from(-3),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                Key::from(-3),
                Key::from(10),
                Key::from("a"),
                Key::Array(vec![Key::from(1)])
            ]
        );
    }

    #[test]
    fn arrays_compare_elementwise() {
        let short = Key::Array(vec![Key::from(1)]);
        let long = Key::Array(vec![Key::from(1), Key::from(0)]);
        let bigger = Key::Array(vec![Key::from(2)]);
        assert!(short < long);
        assert!(long < bigger);
    }

    #[test]
    fn from_value_rejects_non_keys() {
        assert!(Key::from_value(&json!(true)).is_err());
        assert!(Key::from_value(&json!(null)).is_err());
        assert!(Key::from_value(&json!({"a": 1})).is_err());
        assert!(Key::from_value(&json!([1, null])).is_err());
        assert_eq!(Key::from_value(&json!("x")).unwrap(), Key::from("x"));
    }

    #[test]
    fn integral_numbers_serialize_as_integers() {
        assert_eq!(Key::from(7).to_value(), json!(7));
        assert_eq!(Key::from(1.5).to_value(), json!(1.5));
    }

    #[test]
    fn key_path_extracts_nested_values() {
        let record = json!({"id": 4, "address": {"city": "Oslo"}});
        assert_eq!(
            KeyPath::single("address.city").extract(&record).unwrap(),
            Some(Key::from("Oslo"))
        );
        assert_eq!(KeyPath::single("missing").extract(&record).unwrap(), None);
        assert!(KeyPath::single("address").extract(&record).is_err());
    }

    #[test]
    fn compound_key_path_builds_array_key() {
        let record = json!({"first": "Ada", "last": "Lovelace"});
        let path = KeyPath::compound(["last", "first"]);
        assert_eq!(
            path.extract(&record).unwrap(),
            Some(Key::Array(vec![Key::from("Lovelace"), Key::from("Ada")]))
        );
        assert_eq!(
            KeyPath::compound(["last", "middle"]).extract(&record).unwrap(),
            None
        );
    }

    #[test]
    fn inject_creates_intermediate_objects() {
        let mut record = json!({"name": "x"});
        KeyPath::single("meta.id")
            .inject(&mut record, &Key::from(3))
            .unwrap();
        assert_eq!(record, json!({"name": "x", "meta": {"id": 3}}));
    }

    #[test]
    fn inject_into_compound_path_fails() {
        let mut record = json!({});
        let path = KeyPath::compound(["a", "b"]);
        assert!(path.inject(&mut record, &Key::from(1)).is_err());
    }

    #[test]
    fn key_path_validation() {
        assert!(KeyPath::single("a.b").validate().is_ok());
        assert!(KeyPath::single("").validate().is_ok());
        assert!(KeyPath::single("a..b").validate().is_err());
        assert!(KeyPath::Compound(vec![]).validate().is_err());
    }

    #[test]
    fn key_path_deserializes_from_string_or_array() {
        let single: KeyPath = serde_json::from_value(json!("id")).unwrap();
        assert_eq!(single, KeyPath::single("id"));
        let compound: KeyPath = serde_json::from_value(json!(["a", "b"])).unwrap();
        assert_eq!(compound, KeyPath::compound(["a", "b"]));
    }

    #[test]
    fn range_bounds() {
        let range = KeyRange::bound(1, 5, true, false).unwrap();
        assert!(!range.contains(&Key::from(1)));
        assert!(range.contains(&Key::from(2)));
        assert!(range.contains(&Key::from(5)));
        assert!(!range.contains(&Key::from(6)));
        assert!(!range.contains(&Key::from("a")));
    }

    #[test]
    fn range_bounds_select_map_entries() {
        let map: std::collections::BTreeMap<Key, u32> =
            (1..=6).map(|n| (Key::from(n), n)).collect();
        let pick = |range: &KeyRange| map.range(range.bounds()).map(|(_, v)| *v).collect::<Vec<_>>();

        let range = KeyRange::bound(2, 5, true, false).unwrap();
        assert_eq!(range.bounds(), (Bound::Excluded(&Key::from(2)), Bound::Included(&Key::from(5))));
        assert_eq!(pick(&range), vec![3, 4, 5]);
        assert_eq!(pick(&KeyRange::upper_bound(3, true)), vec![1, 2]);
        assert_eq!(pick(&KeyRange::lower_bound(5, false)), vec![5, 6]);
        assert_eq!(pick(&KeyRange::all()).len(), 6);
    }

    #[test]
    fn invalid_ranges_are_rejected() {
        assert!(KeyRange::bound(5, 1, false, false).is_err());
        assert!(KeyRange::bound(1, 1, true, false).is_err());
        assert!(KeyRange::bound(1, 1, false, false).is_ok());
    }

    #[test]
    fn unbounded_range_contains_everything() {
        let all = KeyRange::all();
        assert!(all.contains(&Key::from(-1e9)));
        assert!(all.contains(&Key::Array(vec![])));
    }

    fn arb_key() -> impl Strategy<Value = Key> {
        let leaf = prop_oneof![
            (-1e6f64..1e6).prop_map(Key::Number),
            "[a-z]{0,6}".prop_map(Key::String),
        ];
        leaf.prop_recursive(2, 8, 4, |inner| {
            prop::collection::vec(inner, 0..4).prop_map(Key::Array)
        })
    }

    proptest! {
        #[test]
        fn ordering_is_antisymmetric(a in arb_key(), b in arb_key()) {
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        }

        #[test]
        fn only_range_contains_exactly_its_key(a in arb_key(), b in arb_key()) {
            let range = KeyRange::only(a.clone());
            prop_assert!(range.contains(&a));
            prop_assert_eq!(range.contains(&b), a == b);
        }
    }
}
