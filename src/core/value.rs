//! BP-002: Configuration value store.
//!
//! Global variables, module settings, backend configuration and validator
//! inputs all live in a [`Dict`]: an insertion-ordered map from setting name
//! to [`Value`]. Every entry may carry a provenance tag naming the module whose
//! `use` wiring produced it, so expansion can later tell which used modules
//! actually contributed a setting.

use super::reference::{self, Expression, MalformedReference, Reference};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

// ============================================================================
// Values
// ============================================================================

/// A partially-typed configuration value.
///
/// Values deserialize from YAML as literals. Strings holding reference markers
/// become [`Value::Expr`] only when expansion parses them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "serde_yaml_ng::Value", into = "serde_yaml_ng::Value")]
pub enum Value {
    Null,
    Bool(bool),
    Number(serde_yaml_ng::Number),
    String(String),
    List(Vec<Value>),
    Object(IndexMap<String, Value>),
    Expr(Expression),
}

impl Value {
    /// The string payload of a literal string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The key/value pairs of an object value.
    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Self::Object(m) => Some(m),
            _ => None,
        }
    }

    /// All references embedded anywhere in this value, in document order.
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Expr(e) => out.extend(e.references()),
            Self::List(items) => items.iter().for_each(|v| v.collect_references(out)),
            Self::Object(m) => m.values().for_each(|v| v.collect_references(out)),
            _ => {}
        }
    }

    /// Visit every literal string inside this value (keys excluded).
    pub fn visit_strings(&self, f: &mut impl FnMut(&str)) {
        match self {
            Self::String(s) => f(s),
            Self::List(items) => items.iter().for_each(|v| v.visit_strings(f)),
            Self::Object(m) => m.values().for_each(|v| v.visit_strings(f)),
            _ => {}
        }
    }

    /// Parse reference markers in every nested string.
    ///
    /// Already-parsed expressions and non-string literals pass through
    /// unchanged, so running this twice is a no-op.
    pub fn resolve_markers(self) -> Result<Value, MalformedReference> {
        Ok(match self {
            Self::String(s) => reference::parse_string(&s)?,
            Self::List(items) => Self::List(
                items
                    .into_iter()
                    .map(Value::resolve_markers)
                    .collect::<Result<_, _>>()?,
            ),
            Self::Object(m) => Self::Object(
                m.into_iter()
                    .map(|(k, v)| v.resolve_markers().map(|v| (k, v)))
                    .collect::<Result<_, _>>()?,
            ),
            other => other,
        })
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<Reference> for Value {
    fn from(r: Reference) -> Self {
        Self::Expr(Expression::from_reference(r))
    }
}

impl From<serde_yaml_ng::Value> for Value {
    fn from(v: serde_yaml_ng::Value) -> Self {
        use serde_yaml_ng::Value as Y;
        match v {
            Y::Null => Self::Null,
            Y::Bool(b) => Self::Bool(b),
            Y::Number(n) => Self::Number(n),
            Y::String(s) => Self::String(s),
            Y::Sequence(seq) => Self::List(seq.into_iter().map(Value::from).collect()),
            Y::Mapping(m) => Self::Object(
                m.into_iter()
                    .map(|(k, v)| (yaml_key_to_string(&k), Value::from(v)))
                    .collect(),
            ),
            Y::Tagged(t) => Value::from(t.value),
        }
    }
}

impl From<Value> for serde_yaml_ng::Value {
    fn from(v: Value) -> Self {
        use serde_yaml_ng::Value as Y;
        match v {
            Value::Null => Y::Null,
            Value::Bool(b) => Y::Bool(b),
            Value::Number(n) => Y::Number(n),
            Value::String(s) => Y::String(s),
            Value::List(items) => Y::Sequence(items.into_iter().map(Y::from).collect()),
            Value::Object(m) => Y::Mapping(
                m.into_iter()
                    .map(|(k, v)| (Y::String(k), Y::from(v)))
                    .collect(),
            ),
            Value::Expr(e) => Y::String(e.to_string()),
        }
    }
}

fn yaml_key_to_string(key: &serde_yaml_ng::Value) -> String {
    match key {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        serde_yaml_ng::Value::Null => String::new(),
        other => format!("{:?}", other),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => write!(f, "{}", s),
            Self::Expr(e) => write!(f, "{}", e),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Self::Object(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

// ============================================================================
// Dict
// ============================================================================

/// A value paired with the module whose `use` wiring produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Setting {
    pub value: Value,
    pub produced_by: Option<String>,
}

/// Ordered setting store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dict {
    entries: IndexMap<String, Setting>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|s| &s.value)
    }

    pub fn setting(&self, key: &str) -> Option<&Setting> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Set an authored value. Replacing a key keeps its position.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.entries.insert(
            key.into(),
            Setting {
                value: value.into(),
                produced_by: None,
            },
        );
        self
    }

    /// Set a value produced by wiring in the outputs of `module`.
    pub fn set_produced_by(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
        module: &str,
    ) -> &mut Self {
        self.entries.insert(
            key.into(),
            Setting {
                value: value.into(),
                produced_by: Some(module.to_string()),
            },
        );
        self
    }

    /// True when at least one setting was produced by `module`.
    pub fn has_product_of(&self, module: &str) -> bool {
        self.entries
            .values()
            .any(|s| s.produced_by.as_deref() == Some(module))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter().map(|(k, s)| (k, &s.value))
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = (&String, &mut Value)> {
        self.entries.iter_mut().map(|(k, s)| (k, &mut s.value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Dict {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut dict = Dict::new();
        for (k, v) in iter {
            dict.set(k, v);
        }
        dict
    }
}

impl Serialize for Dict {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter())
    }
}

impl<'de> Deserialize<'de> for Dict {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = IndexMap::<String, Value>::deserialize(deserializer)?;
        Ok(map.into_iter().collect())
    }
}

// ============================================================================
// Tests
// ============================================================================
