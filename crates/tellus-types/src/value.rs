//! Open-ended property values attached to entities, agents, and events.
//!
//! The simulation decides the shape of an entity's properties at runtime,
//! so the engine stores them in a schema-free map. Values come from a
//! closed set of kinds (number, text, boolean, nested map, list) which
//! keeps serialization and comparison total:
//!
//! - Numbers are always written as finite values. A `NaN` or infinity that
//!   slips into a [`PropertyValue::Number`] is serialized as `0.0`.
//! - Nested maps are [`BTreeMap`]s, so key order is deterministic.
//! - The JSON form is untagged: `3.5`, `"oak"`, `true`, `[..]`, `{..}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, Serializer};

/// A schema-free property map with deterministic key ordering.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// A single property value.
///
/// Variant order matters for untagged deserialization: booleans and
/// numbers are tried before strings, lists before maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// A boolean flag.
    Bool(bool),
    /// A finite floating-point number.
    Number(#[serde(serialize_with = "serialize_finite")] f64),
    /// Free text.
    Text(String),
    /// An ordered list of values.
    List(Vec<PropertyValue>),
    /// A nested map of values.
    Map(BTreeMap<String, PropertyValue>),
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_finite<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(finite_or_zero(*value))
}

/// Coerce a non-finite number to `0.0`.
pub const fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

impl PropertyValue {
    /// Build a number value, coercing `NaN` and infinities to `0.0`.
    pub const fn number(value: f64) -> Self {
        Self::Number(finite_or_zero(value))
    }

    /// Build an empty nested map.
    pub const fn empty_map() -> Self {
        Self::Map(BTreeMap::new())
    }

    /// Short name of the value kind, used in log fields.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::Text(_) => "text",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// The numeric value, if this is a number.
    pub const fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(finite_or_zero(*n)),
            _ => None,
        }
    }

    /// The text value, if this is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The boolean value, if this is a flag.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The nested map, if this is a map.
    pub const fn as_map(&self) -> Option<&PropertyMap> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// The list items, if this is a list.
    pub fn as_list(&self) -> Option<&[Self]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::number(value)
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<Self>> for PropertyValue {
    fn from(value: Vec<Self>) -> Self {
        Self::List(value)
    }
}

impl From<PropertyMap> for PropertyValue {
    fn from(value: PropertyMap) -> Self {
        Self::Map(value)
    }
}

/// Typed accessors over a [`PropertyMap`].
///
/// Every read is absent-tolerant: a missing key or a value of the wrong
/// kind yields `None` (or the supplied default) rather than an error.
pub trait PropertyMapExt {
    /// Read a number.
    fn number(&self, key: &str) -> Option<f64>;

    /// Read a number, falling back to `default`.
    fn number_or(&self, key: &str, default: f64) -> f64 {
        self.number(key).unwrap_or(default)
    }

    /// Write a number (non-finite values become `0.0`).
    fn set_number(&mut self, key: &str, value: f64);

    /// Read text.
    fn text(&self, key: &str) -> Option<&str>;

    /// Write text.
    fn set_text(&mut self, key: &str, value: &str);

    /// Read a flag, treating anything but `true` as `false`.
    fn flag(&self, key: &str) -> bool;

    /// Write a flag.
    fn set_flag(&mut self, key: &str, value: bool);

    /// Read a nested map.
    fn nested(&self, key: &str) -> Option<&PropertyMap>;

    /// Read a number inside a nested map, defaulting to `0.0`.
    fn nested_number(&self, key: &str, inner: &str) -> f64 {
        self.nested(key)
            .and_then(|m| m.number(inner))
            .unwrap_or(0.0)
    }

    /// Mutate a nested map in place, creating it (or replacing a value of
    /// another kind) when needed.
    fn with_nested<R>(&mut self, key: &str, f: impl FnOnce(&mut PropertyMap) -> R) -> R;

    /// Add `delta` to a number inside a nested map and return the result.
    fn add_nested_number(&mut self, key: &str, inner: &str, delta: f64) -> f64 {
        self.with_nested(key, |map| {
            let next = map.number_or(inner, 0.0) + delta;
            map.set_number(inner, next);
            finite_or_zero(next)
        })
    }
}

impl PropertyMapExt for PropertyMap {
    fn number(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(PropertyValue::as_number)
    }

    fn set_number(&mut self, key: &str, value: f64) {
        self.insert(key.to_owned(), PropertyValue::number(value));
    }

    fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(PropertyValue::as_text)
    }

    fn set_text(&mut self, key: &str, value: &str) {
        self.insert(key.to_owned(), PropertyValue::from(value));
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key)
            .and_then(PropertyValue::as_bool)
            .unwrap_or(false)
    }

    fn set_flag(&mut self, key: &str, value: bool) {
        self.insert(key.to_owned(), PropertyValue::Bool(value));
    }

    fn nested(&self, key: &str) -> Option<&PropertyMap> {
        self.get(key).and_then(PropertyValue::as_map)
    }

    fn with_nested<R>(&mut self, key: &str, f: impl FnOnce(&mut PropertyMap) -> R) -> R {
        let mut inner = match self.remove(key) {
            Some(PropertyValue::Map(map)) => map,
            _ => PropertyMap::new(),
        };
        let out = f(&mut inner);
        self.insert(key.to_owned(), PropertyValue::Map(inner));
        out
    }
}
