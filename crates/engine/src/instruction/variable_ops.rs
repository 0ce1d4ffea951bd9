//! Workspace-value actions: boolean conditions, comparisons, copies,
//! arithmetic, and structural edits. All of them complete within a single
//! tick.

use proctree_types::ExecutionStatus;
use serde_json::{Number, Value};

use crate::attribute::{AttributeCategory, AttributeDefinition};
use crate::value;

use super::{Behavior, Instruction, Scope};

fn variable_attr(name: &str) -> AttributeDefinition {
    AttributeDefinition::new(name)
        .with_category(AttributeCategory::VariableName)
        .mandatory()
}

/// `Success` iff the referenced value coerces to `true`. Aggregates do not
/// coerce and fail with a logged message.
#[derive(Debug, Default)]
pub struct Condition;

impl Behavior for Condition {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![variable_attr("varName")]
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        let current = match scope.attr_value("varName") {
            Ok(Some(current)) => current,
            Ok(None) => return scope.fail("missing varName attribute"),
            Err(error) => return scope.fail(error),
        };
        match value::as_bool(&current) {
            Ok(true) => ExecutionStatus::Success,
            Ok(false) => ExecutionStatus::Failure,
            Err(error) => scope.fail(error),
        }
    }
}

/// Which relation a comparison instruction asserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Equal,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
}

impl Relation {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Equal => "Equals",
            Self::Greater => "GreaterThan",
            Self::GreaterOrEqual => "GreaterThanOrEqual",
            Self::Less => "LessThan",
            Self::LessOrEqual => "LessThanOrEqual",
        }
    }
}

/// Compares two workspace values after lexical coercion; incompatible
/// kinds fail.
#[derive(Debug)]
pub struct Compare {
    relation: Relation,
}

impl Compare {
    pub fn new(relation: Relation) -> Self {
        Self { relation }
    }
}

impl Behavior for Compare {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![variable_attr("leftVar"), variable_attr("rightVar")]
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        let left = match scope.attr_value("leftVar") {
            Ok(Some(left)) => left,
            _ => return scope.fail("cannot read leftVar"),
        };
        let right = match scope.attr_value("rightVar") {
            Ok(Some(right)) => right,
            _ => return scope.fail("cannot read rightVar"),
        };

        if self.relation == Relation::Equal {
            return if value::values_equal(&left, &right) {
                ExecutionStatus::Success
            } else {
                ExecutionStatus::Failure
            };
        }

        let Some(ordering) = value::compare(&left, &right) else {
            return scope.fail(format!(
                "cannot order {} against {}",
                value::kind_of(&left).as_str(),
                value::kind_of(&right).as_str()
            ));
        };
        let holds = match self.relation {
            Relation::Equal => unreachable!("handled above"),
            Relation::Greater => ordering.is_gt(),
            Relation::GreaterOrEqual => ordering.is_ge(),
            Relation::Less => ordering.is_lt(),
            Relation::LessOrEqual => ordering.is_le(),
        };
        if holds {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failure
        }
    }
}

/// Copies the input reference's value into the output reference.
#[derive(Debug, Default)]
pub struct Copy;

impl Behavior for Copy {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![variable_attr("inputVar"), variable_attr("outputVar")]
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        let Ok(Some(input)) = scope.attr_value("inputVar") else {
            return scope.fail("cannot read inputVar");
        };
        let Some(output) = scope.attr_raw("outputVar").map(str::to_string) else {
            return scope.fail("missing outputVar attribute");
        };
        if scope.write_reference(&output, input) {
            ExecutionStatus::Success
        } else {
            scope.fail(format!("cannot write '{output}'"))
        }
    }
}

/// Restores a variable to the value it held right after setup.
#[derive(Debug, Default)]
pub struct ResetVariable;

impl Behavior for ResetVariable {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![variable_attr("varName")]
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        let Some(name) = scope.attr_raw("varName").map(str::to_string) else {
            return scope.fail("missing varName attribute");
        };
        if scope.workspace().reset_value(&name) {
            ExecutionStatus::Success
        } else {
            scope.fail(format!("cannot reset '{name}'"))
        }
    }
}

fn bumped(current: &Value, delta: i64) -> Option<Value> {
    if let Some(integer) = current.as_i64() {
        return integer.checked_add(delta).map(|sum| Value::Number(sum.into()));
    }
    if let Some(unsigned) = current.as_u64() {
        let sum = if delta >= 0 {
            unsigned.checked_add(delta as u64)
        } else {
            unsigned.checked_sub(delta.unsigned_abs())
        };
        return sum.map(|sum| Value::Number(sum.into()));
    }
    if let Some(float) = current.as_f64() {
        return Number::from_f64(float + delta as f64).map(Value::Number);
    }
    None
}

/// Adds `delta` (±1) to a numeric variable. Overflow fails; it never
/// panics.
#[derive(Debug)]
pub struct Step {
    delta: i64,
}

impl Step {
    pub fn increment() -> Self {
        Self { delta: 1 }
    }

    pub fn decrement() -> Self {
        Self { delta: -1 }
    }
}

impl Behavior for Step {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![variable_attr("varName")]
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        let Ok(Some(current)) = scope.attr_value("varName") else {
            return scope.fail("cannot read varName");
        };
        let Some(reference) = scope.attr_raw("varName").map(str::to_string) else {
            return scope.fail("missing varName attribute");
        };
        let Some(next) = bumped(&current, self.delta) else {
            return scope.fail(format!("cannot step value of kind {}", value::kind_of(&current).as_str()));
        };
        if scope.write_reference(&reference, next) {
            ExecutionStatus::Success
        } else {
            scope.fail(format!("cannot write '{reference}'"))
        }
    }
}

/// Appends the input value to the array referenced by `outputVar`.
/// The output must be an array and the element kind must match the
/// existing elements.
#[derive(Debug, Default)]
pub struct AddElement;

impl Behavior for AddElement {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![variable_attr("inputVar"), variable_attr("outputVar")]
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        let Ok(Some(element)) = scope.attr_value("inputVar") else {
            return scope.fail("cannot read inputVar");
        };
        let Some(reference) = scope.attr_raw("outputVar").map(str::to_string) else {
            return scope.fail("missing outputVar attribute");
        };
        let Some(target) = scope.read_reference(&reference) else {
            return scope.fail(format!("cannot read '{reference}'"));
        };
        let Value::Array(mut items) = target else {
            return scope.fail(format!("'{reference}' is not an array"));
        };
        if let Some(first) = items.first() {
            let mut probe = first.clone();
            if value::assign(&mut probe, &element, false).is_err() {
                return scope.fail(format!(
                    "element kind {} does not match array of {}",
                    value::kind_of(&element).as_str(),
                    value::kind_of(first).as_str()
                ));
            }
        }
        items.push(element);
        if scope.write_reference(&reference, Value::Array(items)) {
            ExecutionStatus::Success
        } else {
            scope.fail(format!("cannot write '{reference}'"))
        }
    }
}

/// Adds a new named member to the structure referenced by `outputVar`.
/// Fails when the target is not a structure or the member already exists.
#[derive(Debug, Default)]
pub struct AddMember;

impl Behavior for AddMember {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![
            variable_attr("inputVar"),
            AttributeDefinition::new("varName").mandatory(),
            variable_attr("outputVar"),
        ]
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        let Ok(Some(member_value)) = scope.attr_value("inputVar") else {
            return scope.fail("cannot read inputVar");
        };
        let Some(member_name) = scope.attr_raw("varName").map(str::to_string) else {
            return scope.fail("missing varName attribute");
        };
        let Some(reference) = scope.attr_raw("outputVar").map(str::to_string) else {
            return scope.fail("missing outputVar attribute");
        };
        let Some(target) = scope.read_reference(&reference) else {
            return scope.fail(format!("cannot read '{reference}'"));
        };
        let Value::Object(mut members) = target else {
            return scope.fail(format!("'{reference}' does not accept members"));
        };
        if members.contains_key(&member_name) {
            return scope.fail(format!("member '{member_name}' already exists in '{reference}'"));
        }
        members.insert(member_name, member_value);
        if scope.write_reference(&reference, Value::Object(members)) {
            ExecutionStatus::Success
        } else {
            scope.fail(format!("cannot write '{reference}'"))
        }
    }
}

/// `Success` iff the named variable exists in the workspace.
#[derive(Debug, Default)]
pub struct VarExists;

impl Behavior for VarExists {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![AttributeDefinition::new("varName").mandatory()]
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        let Some(name) = scope.attr_raw("varName") else {
            return scope.fail("missing varName attribute");
        };
        if scope.workspace().has_variable(name) {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failure
        }
    }
}

/// Builds a `Condition` node.
pub fn condition() -> Instruction {
    Instruction::new("Condition", Box::new(Condition))
}

/// Builds an `Equals` node.
pub fn equals() -> Instruction {
    comparison(Relation::Equal)
}

/// Builds a comparison node for `relation`.
pub fn comparison(relation: Relation) -> Instruction {
    Instruction::new(relation.type_name(), Box::new(Compare::new(relation)))
}

/// Builds a `GreaterThan` node.
pub fn greater_than() -> Instruction {
    comparison(Relation::Greater)
}

/// Builds a `GreaterThanOrEqual` node.
pub fn greater_than_or_equal() -> Instruction {
    comparison(Relation::GreaterOrEqual)
}

/// Builds a `LessThan` node.
pub fn less_than() -> Instruction {
    comparison(Relation::Less)
}

/// Builds a `LessThanOrEqual` node.
pub fn less_than_or_equal() -> Instruction {
    comparison(Relation::LessOrEqual)
}

/// Builds a `Copy` node.
pub fn copy() -> Instruction {
    Instruction::new("Copy", Box::new(Copy))
}

/// Builds a `ResetVariable` node.
pub fn reset_variable() -> Instruction {
    Instruction::new("ResetVariable", Box::new(ResetVariable))
}

/// Builds an `Increment` node.
pub fn increment() -> Instruction {
    Instruction::new("Increment", Box::new(Step::increment()))
}

/// Builds a `Decrement` node.
pub fn decrement() -> Instruction {
    Instruction::new("Decrement", Box::new(Step::decrement()))
}

/// Builds an `AddElement` node.
pub fn add_element() -> Instruction {
    Instruction::new("AddElement", Box::new(AddElement))
}

/// Builds an `AddMember` node.
pub fn add_member() -> Instruction {
    Instruction::new("AddMember", Box::new(AddMember))
}

/// Builds a `VarExists` node.
pub fn var_exists() -> Instruction {
    Instruction::new("VarExists", Box::new(VarExists))
}
