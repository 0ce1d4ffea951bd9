//! In-memory variable backend.

use proctree_types::EngineError;
use serde_json::Value;

use crate::attribute::{self, AttributeBag, AttributeDefinition};
use crate::value::{self, TypeRegistry};

use super::{SetupTeardownActions, Variable};

/// The `Local` variable type: a value held in process memory.
///
/// Attributes: `type` (json type name, default `string`), `value` (literal
/// of that type), `dynamicType` (bool; permits re-typing assignments).
pub struct LocalVariable {
    attributes: AttributeBag,
    definitions: Vec<AttributeDefinition>,
    initial: Value,
    current: Value,
    dynamic: bool,
    available: bool,
}

impl LocalVariable {
    pub const TYPE_NAME: &'static str = "Local";

    pub fn new() -> Self {
        Self {
            attributes: AttributeBag::new(),
            definitions: vec![
                AttributeDefinition::new("type"),
                AttributeDefinition::new("value"),
                AttributeDefinition::new("dynamicType").with_type("bool"),
            ],
            initial: Value::Null,
            current: Value::Null,
            dynamic: false,
            available: false,
        }
    }
}

impl Default for LocalVariable {
    fn default() -> Self {
        Self::new()
    }
}

impl Variable for LocalVariable {
    fn type_name(&self) -> &str {
        Self::TYPE_NAME
    }

    fn attributes(&self) -> &AttributeBag {
        &self.attributes
    }

    fn add_attribute(&mut self, name: &str, value: &str) {
        self.attributes.insert(name.to_string(), value.to_string());
    }

    fn definitions(&self) -> &[AttributeDefinition] {
        &self.definitions
    }

    fn setup(&mut self, types: &TypeRegistry) -> Result<Option<SetupTeardownActions>, EngineError> {
        attribute::validate(&self.attributes, &self.definitions, &[])?;

        let type_name = self
            .attributes
            .get("type")
            .map(String::as_str)
            .unwrap_or("string")
            .to_string();
        if !types.is_known(&type_name) {
            return Err(EngineError::attribute("type", format!("unknown type '{type_name}'")));
        }

        self.initial = match self.attributes.get("value") {
            Some(literal) => value::parse_literal(&type_name, literal)
                .map_err(|parse| EngineError::attribute("value", parse.to_string()))?,
            None => Value::Null,
        };
        self.dynamic = match self.attributes.get("dynamicType") {
            Some(raw) => value::as_bool(&value::parse_literal("bool", raw)?)?,
            None => false,
        };
        self.current = self.initial.clone();
        self.available = true;
        Ok(None)
    }

    fn teardown(&mut self) {
        self.available = false;
        self.initial = Value::Null;
        self.current = Value::Null;
        self.dynamic = false;
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn get(&self, field: &str) -> Option<Value> {
        if !self.available {
            return None;
        }
        value::get_path(&self.current, field).cloned()
    }

    fn set(&mut self, field: &str, new_value: Value) -> bool {
        if !self.available {
            return false;
        }
        if field.is_empty() {
            return value::assign(&mut self.current, &new_value, self.dynamic).is_ok();
        }
        let Some(existing) = value::get_path(&self.current, field) else {
            return false;
        };
        if !self.dynamic {
            let mut probe = existing.clone();
            if value::assign(&mut probe, &new_value, false).is_err() {
                return false;
            }
        }
        value::set_path(&mut self.current, field, new_value)
    }

    fn reset_value(&mut self) -> bool {
        if !self.available {
            return false;
        }
        self.current = self.initial.clone();
        true
    }
}
