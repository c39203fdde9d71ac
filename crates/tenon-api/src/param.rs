//! Typed parameters.
//!
//! Parameters flow from runs into task and pipeline specs. A parameter value
//! is one of three shapes (string, array of strings, or a string-keyed
//! object) and the declared type must match the supplied shape. The wire
//! format is the natural JSON form of each shape (untagged).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Declared type of a parameter or result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// A single string value.
    #[default]
    String,
    /// An ordered list of strings.
    Array,
    /// A string-keyed map of string values.
    Object,
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Array => write!(f, "array"),
            Self::Object => write!(f, "object"),
        }
    }
}

/// A parameter value: string, array, or object.
///
/// The three shapes map onto a tagged variant; arithmetic over values is
/// exhaustive pattern matching rather than dynamic dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// A single string.
    String(String),
    /// An ordered list of strings.
    Array(Vec<String>),
    /// A string-keyed map of string values.
    Object(BTreeMap<String, String>),
}

impl ParamValue {
    /// Returns the shape of this value as a [`ParamType`].
    #[must_use]
    pub const fn param_type(&self) -> ParamType {
        match self {
            Self::String(_) => ParamType::String,
            Self::Array(_) => ParamType::Array,
            Self::Object(_) => ParamType::Object,
        }
    }

    /// Returns the string value, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the array elements, if this is an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[String]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the object map, if this is an object.
    #[must_use]
    pub fn as_object(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(items: Vec<String>) -> Self {
        Self::Array(items)
    }
}

/// Schema of a single declared object property.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertySpec {
    /// Property value type; only `string` is supported.
    #[serde(default, rename = "type")]
    pub type_: ParamType,
}

/// A declared parameter on a Task or Pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamSpec {
    /// Parameter name, unique within the declaring spec.
    pub name: String,

    /// Declared type. Defaults to `string`.
    #[serde(default, rename = "type")]
    pub type_: ParamType,

    /// Human-readable description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Declared property schema for object params.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, PropertySpec>,

    /// Value used when the run supplies none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ParamValue>,
}

impl ParamSpec {
    /// Creates a string param declaration with no default.
    #[must_use]
    pub fn string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_: ParamType::String,
            description: String::new(),
            properties: BTreeMap::new(),
            default: None,
        }
    }

    /// Creates an array param declaration with no default.
    #[must_use]
    pub fn array(name: impl Into<String>) -> Self {
        Self {
            type_: ParamType::Array,
            ..Self::string(name)
        }
    }

    /// Sets the default value.
    #[must_use]
    pub fn with_default(mut self, default: ParamValue) -> Self {
        self.default = Some(default);
        self
    }
}

/// A supplied parameter on a run or pipeline task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Param {
    /// Name of the declared parameter this value binds.
    pub name: String,
    /// The supplied value.
    pub value: ParamValue,
}

impl Param {
    /// Creates a named param binding.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_shapes_deserialize_untagged() {
        let s: ParamValue = serde_json::from_str("\"hello\"").unwrap();
        assert_eq!(s, ParamValue::String("hello".into()));

        let a: ParamValue = serde_json::from_str("[\"a\", \"b\"]").unwrap();
        assert_eq!(a.param_type(), ParamType::Array);

        let o: ParamValue = serde_json::from_str("{\"url\": \"https://example.com\"}").unwrap();
        assert_eq!(o.param_type(), ParamType::Object);
    }

    #[test]
    fn param_spec_defaults_to_string_type() {
        let spec: ParamSpec = serde_json::from_str("{\"name\": \"greeting\"}").unwrap();
        assert_eq!(spec.type_, ParamType::String);
        assert!(spec.default.is_none());
    }

    #[test]
    fn accessors_are_shape_checked() {
        let v = ParamValue::Array(vec!["x".into()]);
        assert!(v.as_str().is_none());
        assert_eq!(v.as_array().map(<[String]>::len), Some(1));
    }
}
