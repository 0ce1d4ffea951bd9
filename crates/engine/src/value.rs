//! Adapter over the externally supplied dynamic value type.
//!
//! The engine treats values as opaque carriers: everything it needs —
//! emptiness, kind, dotted-path navigation, assignment compatibility,
//! literal parsing, and the coercions the comparison/condition instructions
//! rely on — lives here. No other module inspects the representation.

use std::cmp::Ordering;

use indexmap::IndexMap;
use proctree_types::EngineError;
use serde_json::{Number, Value};

/// Broad classification of a dynamic value, used for assignment and
/// comparison compatibility checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// The empty (unset) value.
    Empty,
    Bool,
    Integer,
    Float,
    String,
    Array,
    Struct,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Bool => "bool",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Array => "array",
            Self::Struct => "struct",
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }
}

/// Classifies a value.
pub fn kind_of(value: &Value) -> ValueKind {
    match value {
        Value::Null => ValueKind::Empty,
        Value::Bool(_) => ValueKind::Bool,
        Value::Number(number) => {
            if number.is_f64() {
                ValueKind::Float
            } else {
                ValueKind::Integer
            }
        }
        Value::String(_) => ValueKind::String,
        Value::Array(_) => ValueKind::Array,
        Value::Object(_) => ValueKind::Struct,
    }
}

/// Returns `true` when the value carries nothing.
pub fn is_empty(value: &Value) -> bool {
    value.is_null()
}

/// Reads the value at a dotted `path` ("a.b.0.c"); an empty path addresses
/// the value itself. Numeric segments index arrays.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.').filter(|segment| !segment.is_empty()) {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                current = items.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Writes `new_value` at a dotted `path`, creating nothing: every
/// intermediate segment must already exist. An empty path replaces the
/// whole value. Returns `false` when the path cannot be resolved.
pub fn set_path(value: &mut Value, path: &str, new_value: Value) -> bool {
    let mut current = value;
    let segments: Vec<&str> = path.split('.').filter(|segment| !segment.is_empty()).collect();
    for segment in &segments {
        match current {
            Value::Object(map) => {
                let Some(next) = map.get_mut(*segment) else {
                    return false;
                };
                current = next;
            }
            Value::Array(items) => {
                let Ok(index) = segment.parse::<usize>() else {
                    return false;
                };
                let Some(next) = items.get_mut(index) else {
                    return false;
                };
                current = next;
            }
            _ => return false,
        }
    }
    *current = new_value;
    true
}

/// Assigns `source` into `destination`.
///
/// The assignment succeeds when the destination is empty, when the kinds
/// are compatible (identical, or both numeric), or when `dynamic` permits
/// re-typing the destination.
pub fn assign(destination: &mut Value, source: &Value, dynamic: bool) -> Result<(), EngineError> {
    let destination_kind = kind_of(destination);
    let source_kind = kind_of(source);
    let compatible = destination_kind == ValueKind::Empty
        || destination_kind == source_kind
        || (destination_kind.is_numeric() && source_kind.is_numeric());
    if !compatible && !dynamic {
        return Err(EngineError::TypeMismatch(format!(
            "cannot assign {} into {}",
            source_kind.as_str(),
            destination_kind.as_str()
        )));
    }
    *destination = source.clone();
    Ok(())
}

/// Parses a literal attribute string against a declared type name.
///
/// Scalar names parse strictly; `array`, `struct` and registered JSON type
/// descriptors fall back to JSON parsing. A `string` declaration takes the
/// text verbatim.
pub fn parse_literal(type_name: &str, text: &str) -> Result<Value, EngineError> {
    let parse_error = |reason: &str| {
        EngineError::TypeMismatch(format!("'{text}' is not a valid {type_name}: {reason}"))
    };
    match type_name {
        "string" => Ok(Value::String(text.to_string())),
        "bool" | "boolean" => match text {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(parse_error("expected true/false")),
        },
        "int8" | "int16" | "int32" | "int64" | "int" | "integer" => text
            .parse::<i64>()
            .map(|parsed| Value::Number(parsed.into()))
            .map_err(|parse| parse_error(&parse.to_string())),
        "uint8" | "uint16" | "uint32" | "uint64" | "uint" => text
            .parse::<u64>()
            .map(|parsed| Value::Number(parsed.into()))
            .map_err(|parse| parse_error(&parse.to_string())),
        "float32" | "float64" | "float" | "double" => text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| parse_error("expected a finite number")),
        _ => serde_json::from_str(text).map_err(|parse| parse_error(&parse.to_string())),
    }
}

/// Coerces a value to a boolean, with the condition-instruction rules:
/// integer zero and float zero/NaN are false, non-empty strings are true,
/// arrays and structures do not coerce.
pub fn as_bool(value: &Value) -> Result<bool, EngineError> {
    match value {
        Value::Bool(flag) => Ok(*flag),
        Value::Number(number) => {
            if let Some(integer) = number.as_i64() {
                Ok(integer != 0)
            } else if let Some(unsigned) = number.as_u64() {
                Ok(unsigned != 0)
            } else {
                let float = number.as_f64().unwrap_or(f64::NAN);
                Ok(!float.is_nan() && float != 0.0)
            }
        }
        Value::String(text) => Ok(!text.is_empty()),
        other => Err(EngineError::TypeMismatch(format!(
            "{} does not coerce to a boolean",
            kind_of(other).as_str()
        ))),
    }
}

/// Coerces a value to an unsigned integer (numbers and numeric strings).
pub fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Coerces a value to a signed integer (numbers and numeric strings).
pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Coerces a value to a float (numbers and numeric strings).
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Equality with numeric widening: `1`, `1u64` and `1.0` compare equal.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => match (as_f64(left), as_f64(right)) {
            (Some(a), Some(b)) => a == b,
            _ => left == right,
        },
        _ => left == right,
    }
}

/// Orders two values after lexical type coercion: numbers (including
/// numeric strings) compare numerically, strings lexically. `None` means
/// the kinds are incompatible.
pub fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (as_f64(left), as_f64(right)) {
        return a.partial_cmp(&b);
    }
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Renders a value the way the user interface displays it: scalars bare,
/// aggregates as compact JSON.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Registry of named type descriptors, held by the workspace.
///
/// Descriptors are opaque JSON handed to the external type parser; the
/// engine only registers and looks them up. Scalar names (`uint32`,
/// `float64`, ...) are implicitly known and need no registration.
#[derive(Debug, Default, Clone)]
pub struct TypeRegistry {
    descriptors: IndexMap<String, Value>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor under `name`; re-registration is rejected.
    pub fn register(&mut self, name: impl Into<String>, descriptor: Value) -> Result<(), EngineError> {
        let name = name.into();
        if self.descriptors.contains_key(&name) {
            return Err(EngineError::DuplicateName(name));
        }
        self.descriptors.insert(name, descriptor);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.descriptors.get(name)
    }

    /// Whether `name` resolves to a usable type: a built-in scalar, an
    /// aggregate keyword, or a registered descriptor.
    pub fn is_known(&self, name: &str) -> bool {
        matches!(
            name,
            "string"
                | "bool"
                | "boolean"
                | "int8"
                | "int16"
                | "int32"
                | "int64"
                | "int"
                | "integer"
                | "uint8"
                | "uint16"
                | "uint32"
                | "uint64"
                | "uint"
                | "float32"
                | "float64"
                | "float"
                | "double"
                | "array"
                | "struct"
        ) || self.descriptors.contains_key(name)
    }
}
