//! Declarative attribute system shared by instructions and variables.
//!
//! Concrete types register [`AttributeDefinition`]s and [`Constraint`]s in
//! their constructors; `validate` runs fail-fast at setup time, and the
//! retrieval helpers resolve literals and workspace references at tick time.

use std::fmt;

use indexmap::IndexMap;
use proctree_types::EngineError;
use serde_json::Value;

use crate::value;
use crate::workspace::Workspace;

/// Ordered bag of raw string attributes, as written in the procedure
/// document.
pub type AttributeBag = IndexMap<String, String>;

/// How an attribute value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeCategory {
    /// The raw string is a literal of the declared type.
    Literal,
    /// The raw string names a workspace variable, optionally with a dotted
    /// field path (`var.field`).
    VariableName,
    /// Literal by default; a leading `@` marks a workspace reference.
    Both,
}

/// Declared shape of a single attribute.
#[derive(Debug, Clone)]
pub struct AttributeDefinition {
    pub name: String,
    /// Declared scalar type name; defaults to `string`.
    pub value_type: String,
    pub category: AttributeCategory,
    pub mandatory: bool,
}

impl AttributeDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type: "string".to_string(),
            category: AttributeCategory::Literal,
            mandatory: false,
        }
    }

    pub fn with_type(mut self, value_type: impl Into<String>) -> Self {
        self.value_type = value_type.into();
        self
    }

    pub fn with_category(mut self, category: AttributeCategory) -> Self {
        self.category = category;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

/// Boolean predicate over the attribute bag, checked at setup.
#[derive(Debug, Clone)]
pub enum Constraint {
    /// The named attribute is present.
    Exists(String),
    And(Box<Constraint>, Box<Constraint>),
    Or(Box<Constraint>, Box<Constraint>),
    Xor(Box<Constraint>, Box<Constraint>),
    Not(Box<Constraint>),
}

impl Constraint {
    pub fn exists(name: impl Into<String>) -> Self {
        Self::Exists(name.into())
    }

    pub fn and(self, other: Constraint) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Constraint) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    pub fn xor(self, other: Constraint) -> Self {
        Self::Xor(Box::new(self), Box::new(other))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }

    pub fn evaluate(&self, bag: &AttributeBag) -> bool {
        match self {
            Self::Exists(name) => bag.contains_key(name),
            Self::And(left, right) => left.evaluate(bag) && right.evaluate(bag),
            Self::Or(left, right) => left.evaluate(bag) || right.evaluate(bag),
            Self::Xor(left, right) => left.evaluate(bag) != right.evaluate(bag),
            Self::Not(inner) => !inner.evaluate(bag),
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exists(name) => write!(f, "exists({name})"),
            Self::And(left, right) => write!(f, "({left} and {right})"),
            Self::Or(left, right) => write!(f, "({left} or {right})"),
            Self::Xor(left, right) => write!(f, "({left} xor {right})"),
            Self::Not(inner) => write!(f, "not {inner}"),
        }
    }
}

/// Validates a bag against its definitions and constraints.
///
/// Checks, in order: every mandatory attribute is present; every present
/// attribute with a matching definition is well-formed for its category;
/// every constraint holds. The first violation is returned and nothing is
/// mutated, so a failed setup leaves no side effects.
pub fn validate(
    bag: &AttributeBag,
    definitions: &[AttributeDefinition],
    constraints: &[Constraint],
) -> Result<(), EngineError> {
    for definition in definitions {
        let Some(raw) = bag.get(&definition.name) else {
            if definition.mandatory {
                return Err(EngineError::attribute(&definition.name, "mandatory attribute missing"));
            }
            continue;
        };
        match definition.category {
            AttributeCategory::Literal => {
                value::parse_literal(&definition.value_type, raw)
                    .map_err(|parse| EngineError::attribute(&definition.name, parse.to_string()))?;
            }
            AttributeCategory::VariableName => {
                if raw.is_empty() {
                    return Err(EngineError::attribute(&definition.name, "variable name must not be empty"));
                }
            }
            AttributeCategory::Both => {
                if let Some(reference) = raw.strip_prefix('@') {
                    if reference.is_empty() {
                        return Err(EngineError::attribute(&definition.name, "variable reference after '@' is empty"));
                    }
                } else {
                    value::parse_literal(&definition.value_type, raw)
                        .map_err(|parse| EngineError::attribute(&definition.name, parse.to_string()))?;
                }
            }
        }
    }

    for constraint in constraints {
        if !constraint.evaluate(bag) {
            return Err(EngineError::attribute(
                constraint.to_string(),
                "attribute constraint violated",
            ));
        }
    }

    Ok(())
}

/// Splits a workspace reference into variable name and field path.
fn split_reference(reference: &str) -> (&str, &str) {
    match reference.split_once('.') {
        Some((variable, field)) => (variable, field),
        None => (reference, ""),
    }
}

/// Resolves an attribute to its raw value.
///
/// Literals parse against the declared type; variable references read the
/// named field from the workspace. Absent attributes resolve to `None`;
/// an unreadable workspace reference is an error.
pub fn resolve(
    bag: &AttributeBag,
    definitions: &[AttributeDefinition],
    name: &str,
    workspace: &Workspace,
) -> Result<Option<Value>, EngineError> {
    let Some(raw) = bag.get(name) else {
        return Ok(None);
    };
    let definition = definitions.iter().find(|definition| definition.name == name);
    let (category, value_type) = definition
        .map(|definition| (definition.category, definition.value_type.as_str()))
        .unwrap_or((AttributeCategory::Literal, "string"));

    let read_reference = |reference: &str| -> Result<Option<Value>, EngineError> {
        let (variable, field) = split_reference(reference);
        workspace
            .get_value(variable, field)
            .map(Some)
            .ok_or_else(|| EngineError::VariableUnavailable(variable.to_string()))
    };

    match category {
        AttributeCategory::Literal => {
            let parsed = value::parse_literal(value_type, raw)
                .map_err(|parse| EngineError::attribute(name, parse.to_string()))?;
            Ok(Some(parsed))
        }
        AttributeCategory::VariableName => read_reference(raw),
        AttributeCategory::Both => match raw.strip_prefix('@') {
            Some(reference) => read_reference(reference),
            None => {
                let parsed = value::parse_literal(value_type, raw)
                    .map_err(|parse| EngineError::attribute(name, parse.to_string()))?;
                Ok(Some(parsed))
            }
        },
    }
}

/// Conversion target for typed attribute retrieval.
pub trait FromAttribute: Sized {
    fn from_attribute(value: &Value) -> Option<Self>;
}

impl FromAttribute for bool {
    fn from_attribute(value: &Value) -> Option<Self> {
        value::as_bool(value).ok()
    }
}

impl FromAttribute for u64 {
    fn from_attribute(value: &Value) -> Option<Self> {
        value::as_u64(value)
    }
}

impl FromAttribute for u32 {
    fn from_attribute(value: &Value) -> Option<Self> {
        value::as_u64(value).and_then(|wide| u32::try_from(wide).ok())
    }
}

impl FromAttribute for usize {
    fn from_attribute(value: &Value) -> Option<Self> {
        value::as_u64(value).and_then(|wide| usize::try_from(wide).ok())
    }
}

impl FromAttribute for i64 {
    fn from_attribute(value: &Value) -> Option<Self> {
        value::as_i64(value)
    }
}

impl FromAttribute for f64 {
    fn from_attribute(value: &Value) -> Option<Self> {
        value::as_f64(value)
    }
}

impl FromAttribute for String {
    fn from_attribute(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => Some(text.clone()),
            other => Some(value::format_value(other)),
        }
    }
}

impl FromAttribute for Value {
    fn from_attribute(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}
