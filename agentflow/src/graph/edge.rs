//! Edges, transformations and validation rules.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A transformation applied to a value as it crosses an edge.
///
/// Stream-valued edges apply the transformation to every chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "arg", rename_all = "snake_case")]
pub enum Transformation {
    /// Pass the value through unchanged.
    Identity,
    /// Select a sub-value by JSON pointer (`/a/0/b`).
    Pointer(String),
    /// Wrap the value in an object under the given key.
    Wrap(String),
    /// Render the value as a string. Strings pass through unchanged.
    Stringify,
}

impl Transformation {
    /// Applies the transformation.
    ///
    /// # Errors
    ///
    /// Returns a message if a pointer does not resolve.
    pub fn apply(&self, value: Value) -> Result<Value, String> {
        match self {
            Self::Identity => Ok(value),
            Self::Pointer(pointer) => value
                .pointer(pointer)
                .cloned()
                .ok_or_else(|| format!("pointer '{pointer}' did not resolve")),
            Self::Wrap(key) => {
                let mut map = serde_json::Map::new();
                map.insert(key.clone(), value);
                Ok(Value::Object(map))
            }
            Self::Stringify => match value {
                Value::String(_) => Ok(value),
                other => Ok(Value::String(other.to_string())),
            },
        }
    }
}

/// A validation rule checked against the (transformed) value of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "arg", rename_all = "snake_case")]
pub enum ValidationRule {
    /// Value must not be null.
    NotNull,
    /// Value must have the given JSON type (`string`, `number`, `boolean`,
    /// `object`, `array`, `null`, `any`).
    TypeTag(String),
    /// Serialized value must not exceed this many bytes.
    MaxBytes(usize),
    /// Strings, arrays and objects must not be empty.
    NonEmpty,
}

impl ValidationRule {
    /// Checks the rule.
    ///
    /// # Errors
    ///
    /// Returns a message describing the violation.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        match self {
            Self::NotNull => {
                if value.is_null() {
                    return Err("value is null".to_string());
                }
            }
            Self::TypeTag(tag) => {
                if !type_matches(tag, value) {
                    return Err(format!("expected {tag}, got {}", type_name(value)));
                }
            }
            Self::MaxBytes(limit) => {
                let size = value.to_string().len();
                if size > *limit {
                    return Err(format!("value is {size} bytes, limit is {limit}"));
                }
            }
            Self::NonEmpty => {
                let empty = match value {
                    Value::String(s) => s.is_empty(),
                    Value::Array(a) => a.is_empty(),
                    Value::Object(o) => o.is_empty(),
                    Value::Null => true,
                    _ => false,
                };
                if empty {
                    return Err("value is empty".to_string());
                }
            }
        }
        Ok(())
    }
}

/// Returns the JSON type name of a value.
#[must_use]
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_matches(tag: &str, value: &Value) -> bool {
    tag == "any" || tag == type_name(value)
}

/// A directed data dependency between two node slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Producing node.
    pub source: String,
    /// Output slot on the producer.
    pub source_slot: String,
    /// Consuming node.
    pub target: String,
    /// Input slot on the consumer.
    pub target_slot: String,
    /// Optional transformation.
    #[serde(default)]
    pub transformation: Option<Transformation>,
    /// Validation rules, checked in order.
    #[serde(default)]
    pub validations: Vec<ValidationRule>,
}

impl Edge {
    /// Creates an edge between two slots.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        source_slot: impl Into<String>,
        target: impl Into<String>,
        target_slot: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            source_slot: source_slot.into(),
            target: target.into(),
            target_slot: target_slot.into(),
            transformation: None,
            validations: Vec::new(),
        }
    }

    /// Sets the transformation.
    #[must_use]
    pub fn with_transformation(mut self, transformation: Transformation) -> Self {
        self.transformation = Some(transformation);
        self
    }

    /// Adds a validation rule.
    #[must_use]
    pub fn with_validation(mut self, rule: ValidationRule) -> Self {
        self.validations.push(rule);
        self
    }

    /// Whether values need processing when crossing this edge.
    #[must_use]
    pub fn is_passthrough(&self) -> bool {
        matches!(self.transformation, None | Some(Transformation::Identity))
            && self.validations.is_empty()
    }

    /// Transforms then validates a value crossing this edge.
    ///
    /// # Errors
    ///
    /// Returns a message naming the edge and the failure.
    pub fn carry(&self, value: Value) -> Result<Value, String> {
        let value = match &self.transformation {
            Some(t) => t.apply(value).map_err(|e| format!("{self}: {e}"))?,
            None => value,
        };
        for rule in &self.validations {
            rule.check(&value).map_err(|e| format!("{self}: {e}"))?;
        }
        Ok(value)
    }
}

impl std::fmt::Display for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.source, self.source_slot, self.target, self.target_slot
        )
    }
}
