//! Decorator instructions: single-child wrappers that reshape a child's
//! outcome or repeat its execution.

use proctree_types::{EngineError, ExecutionStatus};
use serde_json::Value;

use crate::attribute::{AttributeCategory, AttributeDefinition};

use super::{Behavior, Instruction, Scope, SetupScope};

/// Swaps the child's terminal statuses; non-terminal passes through.
#[derive(Debug, Default)]
pub struct Inverter;

impl Behavior for Inverter {
    fn on_setup(&mut self, scope: &SetupScope<'_>) -> Result<(), EngineError> {
        scope.require_children(1..=1)
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        match scope.tick_child(0) {
            ExecutionStatus::Success => ExecutionStatus::Failure,
            ExecutionStatus::Failure => ExecutionStatus::Success,
            other => other,
        }
    }
}

/// Waits for the child to reach any terminal status and reports `Success`.
#[derive(Debug, Default)]
pub struct ForceSuccess;

impl Behavior for ForceSuccess {
    fn on_setup(&mut self, scope: &SetupScope<'_>) -> Result<(), EngineError> {
        scope.require_children(1..=1)
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        let status = scope.tick_child(0);
        if status.is_terminal() {
            ExecutionStatus::Success
        } else {
            status
        }
    }
}

/// Re-runs the child until it has succeeded `maxCount` times (−1 for
/// unbounded), failing as soon as the child fails. One completed child
/// cycle is counted per tick so an always-succeeding child cannot pin the
/// tick loop.
#[derive(Debug, Default)]
pub struct Repeat {
    max_count: i64,
    successes: u64,
}

impl Behavior for Repeat {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![AttributeDefinition::new("maxCount")
            .with_type("int64")
            .with_category(AttributeCategory::Both)]
    }

    fn on_setup(&mut self, scope: &SetupScope<'_>) -> Result<(), EngineError> {
        scope.require_children(1..=1)
    }

    fn on_init(&mut self, scope: &mut Scope<'_, '_>) -> bool {
        self.max_count = 1;
        self.successes = 0;
        scope.attr_into("maxCount", &mut self.max_count)
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        if self.max_count == 0 {
            return ExecutionStatus::Success;
        }
        match scope.tick_child(0) {
            ExecutionStatus::Failure => ExecutionStatus::Failure,
            ExecutionStatus::Success => {
                self.successes += 1;
                if self.max_count >= 0 && self.successes >= self.max_count as u64 {
                    return ExecutionStatus::Success;
                }
                scope.children[0].reset(scope.ctx.ui);
                ExecutionStatus::NotFinished
            }
            other => other,
        }
    }

    fn on_reset(&mut self) {
        self.successes = 0;
    }
}

/// Runs the child once per element of a workspace array, copying the
/// current element into `elementVar` first and resetting the child between
/// elements. The array itself is left untouched; the first child failure
/// fails the loop.
#[derive(Debug, Default)]
pub struct For {
    elements: Vec<Value>,
    cursor: usize,
    fresh: bool,
}

impl Behavior for For {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![
            AttributeDefinition::new("elementVar")
                .with_category(AttributeCategory::VariableName)
                .mandatory(),
            AttributeDefinition::new("arrayVar")
                .with_category(AttributeCategory::VariableName)
                .mandatory(),
        ]
    }

    fn on_setup(&mut self, scope: &SetupScope<'_>) -> Result<(), EngineError> {
        scope.require_children(1..=1)
    }

    fn on_init(&mut self, scope: &mut Scope<'_, '_>) -> bool {
        let Ok(Some(Value::Array(elements))) = scope.attr_value("arrayVar") else {
            return false;
        };
        self.elements = elements;
        self.cursor = 0;
        self.fresh = true;
        true
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        loop {
            if self.cursor >= self.elements.len() {
                return ExecutionStatus::Success;
            }
            if self.fresh {
                let Some(reference) = scope.attr_raw("elementVar").map(str::to_string) else {
                    return scope.fail("missing elementVar attribute");
                };
                let element = self.elements[self.cursor].clone();
                if !scope.write_reference(&reference, element) {
                    return scope.fail(format!("cannot write element into '{reference}'"));
                }
                if scope.children[0].status().is_terminal() {
                    scope.children[0].reset(scope.ctx.ui);
                }
                self.fresh = false;
            }
            match scope.tick_child(0) {
                ExecutionStatus::Success => {
                    self.cursor += 1;
                    self.fresh = true;
                }
                ExecutionStatus::Failure => return ExecutionStatus::Failure,
                other => return other,
            }
        }
    }

    fn on_reset(&mut self) {
        self.elements.clear();
        self.cursor = 0;
        self.fresh = false;
    }
}

/// Delegates to a subtree referenced by name from the same procedure (or,
/// with `file`, from an external one). Resolution runs during procedure
/// setup, which instantiates the referenced tree as this node's child and
/// rejects reference cycles.
#[derive(Debug, Default)]
pub struct Include;

impl Behavior for Include {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![
            AttributeDefinition::new("path").mandatory(),
            AttributeDefinition::new("file"),
        ]
    }

    fn on_setup(&mut self, scope: &SetupScope<'_>) -> Result<(), EngineError> {
        if scope.child_count != 1 {
            return Err(EngineError::attribute("path", "include was not resolved"));
        }
        Ok(())
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        scope.tick_child(0)
    }
}

/// Like [`Include`] for an external procedure file, additionally merging
/// that procedure's workspace into the current one. On a name collision
/// the external variable is skipped; the current workspace wins.
#[derive(Debug, Default)]
pub struct IncludeProcedure;

impl Behavior for IncludeProcedure {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![
            AttributeDefinition::new("file").mandatory(),
            AttributeDefinition::new("path"),
        ]
    }

    fn on_setup(&mut self, scope: &SetupScope<'_>) -> Result<(), EngineError> {
        if scope.child_count != 1 {
            return Err(EngineError::attribute("file", "include was not resolved"));
        }
        Ok(())
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        scope.tick_child(0)
    }
}

/// Builds an `Inverter` node.
pub fn inverter() -> Instruction {
    Instruction::new("Inverter", Box::new(Inverter))
}

/// Builds a `ForceSuccess` node.
pub fn force_success() -> Instruction {
    Instruction::new("ForceSuccess", Box::new(ForceSuccess))
}

/// Builds a `Repeat` node.
pub fn repeat() -> Instruction {
    Instruction::new("Repeat", Box::<Repeat>::default())
}

/// Builds a `For` node.
pub fn for_each() -> Instruction {
    Instruction::new("For", Box::<For>::default())
}

/// Builds an `Include` node.
pub fn include() -> Instruction {
    Instruction::new("Include", Box::new(Include))
}

/// Builds an `IncludeProcedure` node.
pub fn include_procedure() -> Instruction {
    Instruction::new("IncludeProcedure", Box::new(IncludeProcedure))
}

#[cfg(test)]
mod tests {
    use super::super::testing::{recording_ui, tick_ctx, StubBehavior};
    use super::*;
    use crate::variable::{LocalVariable, Variable as _};
    use crate::workspace::Workspace;
    use proctree_types::ExecutionStatus::{Failure, NotFinished, Success};
    use serde_json::json;

    fn stub(status: ExecutionStatus) -> Instruction {
        Instruction::new("Stub", Box::new(StubBehavior::fixed(status)))
    }

    fn staged(statuses: Vec<ExecutionStatus>) -> Instruction {
        Instruction::new("Stub", Box::new(StubBehavior::sequence(statuses)))
    }

    fn workspace_with(entries: &[(&str, &str, &str)]) -> Workspace {
        let mut workspace = Workspace::new();
        for (name, type_name, literal) in entries {
            let mut variable = LocalVariable::new();
            variable.add_attribute("type", type_name);
            variable.add_attribute("value", literal);
            workspace.add_variable(*name, Box::new(variable)).expect("add");
        }
        workspace.setup_all().expect("setup");
        workspace
    }

    #[test]
    fn inverter_swaps_terminal_statuses() {
        let workspace = Workspace::new();
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = inverter().with_child(stub(Success));
        assert_eq!(node.tick(&ctx), Failure);

        let mut node = inverter().with_child(staged(vec![NotFinished, Failure]));
        assert_eq!(node.tick(&ctx), NotFinished);
        assert_eq!(node.tick(&ctx), Success);
    }

    #[test]
    fn inverter_requires_exactly_one_child() {
        let workspace = Workspace::new();
        let mut node = inverter();
        assert!(node.setup(&workspace).is_err());
        let mut node = inverter().with_child(stub(Success)).with_child(stub(Success));
        assert!(node.setup(&workspace).is_err());
    }

    #[test]
    fn force_success_masks_failure() {
        let workspace = Workspace::new();
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = force_success().with_child(stub(Failure));
        assert_eq!(node.tick(&ctx), Success);
    }

    #[test]
    fn repeat_counts_child_successes() {
        let workspace = Workspace::new();
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = repeat().with_attribute("maxCount", "3").with_child(stub(Success));
        assert_eq!(node.tick(&ctx), NotFinished);
        assert_eq!(node.tick(&ctx), NotFinished);
        assert_eq!(node.tick(&ctx), Success);
    }

    #[test]
    fn repeat_fails_on_first_child_failure() {
        let workspace = Workspace::new();
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = repeat().with_attribute("maxCount", "5").with_child(staged(vec![Success, Failure]));
        assert_eq!(node.tick(&ctx), NotFinished);
        assert_eq!(node.tick(&ctx), Failure);
    }

    #[test]
    fn repeat_default_runs_once() {
        let workspace = Workspace::new();
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = repeat().with_child(stub(Success));
        assert_eq!(node.tick(&ctx), Success);
    }

    #[test]
    fn for_each_copies_elements_and_stops_on_failure() {
        let workspace = workspace_with(&[
            ("items", "array", "[10,20,30]"),
            ("element", "uint32", "0"),
        ]);
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);

        let mut node = for_each()
            .with_attribute("elementVar", "element")
            .with_attribute("arrayVar", "items")
            .with_child(stub(Success));
        assert_eq!(node.tick(&ctx), Success);
        // Last element remains in the element variable; the array is
        // untouched.
        assert_eq!(workspace.get_value("element", ""), Some(json!(30)));
        assert_eq!(workspace.get_value("items", ""), Some(json!([10, 20, 30])));
    }

    #[test]
    fn for_each_fails_when_array_is_missing() {
        let workspace = workspace_with(&[("element", "uint32", "0")]);
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = for_each()
            .with_attribute("elementVar", "element")
            .with_attribute("arrayVar", "absent")
            .with_child(stub(Success));
        assert_eq!(node.tick(&ctx), Failure);
    }

    #[test]
    fn unresolved_include_fails_setup() {
        let workspace = Workspace::new();
        let mut node = include().with_attribute("path", "other");
        assert!(node.setup(&workspace).is_err());
    }

    #[test]
    fn include_delegates_to_resolved_child() {
        let workspace = Workspace::new();
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = include().with_attribute("path", "other").with_child(stub(Success));
        node.setup(&workspace).expect("resolved include");
        assert_eq!(node.tick(&ctx), Success);
    }
}
