//! Time-based instructions. Deadlines are monotonic and best-effort: an
//! instruction observes them at tick boundaries, so precision is bounded
//! by the runner's tick cadence.

use std::time::{Duration, Instant};

use proctree_types::ExecutionStatus;

use crate::attribute::{AttributeCategory, AttributeDefinition};
use crate::value;

use super::{Behavior, Instruction, Scope};

fn deadline_after(seconds: f64) -> Instant {
    let clamped = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
    Instant::now() + Duration::from_secs_f64(clamped)
}

/// Succeeds once the configured number of seconds has elapsed; reports
/// `Running` until then. A missing or zero timeout succeeds immediately;
/// halting ends the wait promptly.
#[derive(Debug, Default)]
pub struct Wait {
    deadline: Option<Instant>,
}

impl Behavior for Wait {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![AttributeDefinition::new("timeout")
            .with_type("float64")
            .with_category(AttributeCategory::Both)]
    }

    fn on_init(&mut self, scope: &mut Scope<'_, '_>) -> bool {
        let mut timeout = 0.0f64;
        if !scope.attr_into("timeout", &mut timeout) {
            return false;
        }
        self.deadline = Some(deadline_after(timeout));
        true
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        if scope.halted() {
            return ExecutionStatus::Failure;
        }
        match self.deadline {
            Some(deadline) if Instant::now() < deadline => ExecutionStatus::Running,
            _ => ExecutionStatus::Success,
        }
    }

    fn on_reset(&mut self) {
        self.deadline = None;
    }
}

/// Succeeds as soon as `varName` is readable and non-empty (and equal to
/// `equalsVar` when given); fails at the deadline.
#[derive(Debug, Default)]
pub struct WaitForVariable {
    deadline: Option<Instant>,
}

impl Behavior for WaitForVariable {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![
            AttributeDefinition::new("timeout")
                .with_type("float64")
                .with_category(AttributeCategory::Both)
                .mandatory(),
            AttributeDefinition::new("varName")
                .with_category(AttributeCategory::VariableName)
                .mandatory(),
            AttributeDefinition::new("equalsVar").with_category(AttributeCategory::VariableName),
        ]
    }

    fn on_init(&mut self, scope: &mut Scope<'_, '_>) -> bool {
        let mut timeout = 0.0f64;
        if !scope.attr_into("timeout", &mut timeout) {
            return false;
        }
        self.deadline = Some(deadline_after(timeout));
        true
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        if scope.halted() {
            return ExecutionStatus::Failure;
        }

        let current = scope.attr_value("varName").ok().flatten();
        if let Some(current) = current {
            if !value::is_empty(&current) {
                match scope.attr_value("equalsVar") {
                    Ok(Some(expected)) => {
                        if value::values_equal(&current, &expected) {
                            return ExecutionStatus::Success;
                        }
                    }
                    Ok(None) => {
                        if !scope.has_attribute("equalsVar") {
                            return ExecutionStatus::Success;
                        }
                    }
                    Err(_) => {}
                }
            }
        }

        match self.deadline {
            Some(deadline) if Instant::now() < deadline => ExecutionStatus::Running,
            _ => ExecutionStatus::Failure,
        }
    }

    fn on_reset(&mut self) {
        self.deadline = None;
    }
}

/// Succeeds once every workspace variable of the given registered type is
/// available; fails at the deadline.
#[derive(Debug, Default)]
pub struct WaitForVariables {
    deadline: Option<Instant>,
}

impl Behavior for WaitForVariables {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![
            AttributeDefinition::new("timeout")
                .with_type("float64")
                .with_category(AttributeCategory::Both)
                .mandatory(),
            AttributeDefinition::new("varType").mandatory(),
        ]
    }

    fn on_init(&mut self, scope: &mut Scope<'_, '_>) -> bool {
        let mut timeout = 0.0f64;
        if !scope.attr_into("timeout", &mut timeout) {
            return false;
        }
        self.deadline = Some(deadline_after(timeout));
        true
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        if scope.halted() {
            return ExecutionStatus::Failure;
        }
        let Some(type_name) = scope.attr_raw("varType") else {
            return scope.fail("missing varType attribute");
        };
        let names = scope.workspace().variables_of_type(type_name);
        if names.iter().all(|name| scope.workspace().is_available(name)) {
            return ExecutionStatus::Success;
        }
        match self.deadline {
            Some(deadline) if Instant::now() < deadline => ExecutionStatus::Running,
            _ => ExecutionStatus::Failure,
        }
    }

    fn on_reset(&mut self) {
        self.deadline = None;
    }
}

/// Builds a `Wait` node.
pub fn wait() -> Instruction {
    Instruction::new("Wait", Box::<Wait>::default())
}

/// Builds a `Wait` node with a literal timeout in seconds.
pub fn wait_for(seconds: f64) -> Instruction {
    wait().with_attribute("timeout", seconds.to_string())
}

/// Builds a `WaitForVariable` node.
pub fn wait_for_variable() -> Instruction {
    Instruction::new("WaitForVariable", Box::<WaitForVariable>::default())
}

/// Builds a `WaitForVariables` node.
pub fn wait_for_variables() -> Instruction {
    Instruction::new("WaitForVariables", Box::<WaitForVariables>::default())
}
