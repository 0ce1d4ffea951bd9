//! Compound instructions: child sequencing, fallbacks, reactive variants,
//! threshold-based parallelism, and index-driven choice.

use proctree_types::{EngineError, ExecutionStatus};

use crate::attribute::{AttributeCategory, AttributeDefinition};
use crate::value;

use super::{Behavior, Instruction, Scope};

/// Ticks children left to right starting at the first non-`Success` child.
/// The first `Failure` fails the sequence; all-`Success` succeeds it.
/// Children are never implicitly reset, so partial progress carries across
/// ticks.
#[derive(Debug, Default)]
pub struct Sequence;

impl Behavior for Sequence {
    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        for index in 0..scope.children.len() {
            if scope.children[index].status() == ExecutionStatus::Success {
                continue;
            }
            match scope.tick_child(index) {
                ExecutionStatus::Success => continue,
                other => return other,
            }
        }
        ExecutionStatus::Success
    }
}

/// Dual of [`Sequence`]: short-circuits on the first `Success`, fails only
/// when every child failed.
#[derive(Debug, Default)]
pub struct Fallback;

impl Behavior for Fallback {
    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        for index in 0..scope.children.len() {
            if scope.children[index].status() == ExecutionStatus::Failure {
                continue;
            }
            match scope.tick_child(index) {
                ExecutionStatus::Failure => continue,
                other => return other,
            }
        }
        ExecutionStatus::Failure
    }
}

/// Restarts evaluation from the first child on every tick, so earlier
/// children act as continuously monitored guards. A child that was the
/// active one and lost that position is halted and reset.
#[derive(Debug, Default)]
pub struct ReactiveSequence {
    active: Option<usize>,
}

impl Behavior for ReactiveSequence {
    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        for index in 0..scope.children.len() {
            if scope.children[index].status().is_terminal() {
                scope.children[index].reset(scope.ctx.ui);
            }
            match scope.tick_child(index) {
                ExecutionStatus::Success => {
                    if self.active == Some(index) {
                        self.active = None;
                    }
                }
                ExecutionStatus::Failure => {
                    self.abandon_active(scope, None);
                    return ExecutionStatus::Failure;
                }
                status => {
                    self.abandon_active(scope, Some(index));
                    self.active = Some(index);
                    return status;
                }
            }
        }
        self.active = None;
        ExecutionStatus::Success
    }

    fn on_reset(&mut self) {
        self.active = None;
    }
}

impl ReactiveSequence {
    fn abandon_active(&mut self, scope: &mut Scope<'_, '_>, keep: Option<usize>) {
        if let Some(previous) = self.active {
            if keep != Some(previous) {
                scope.children[previous].halt();
                scope.children[previous].reset(scope.ctx.ui);
                self.active = None;
            }
        }
    }
}

/// Dual of [`ReactiveSequence`].
#[derive(Debug, Default)]
pub struct ReactiveFallback {
    active: Option<usize>,
}

impl Behavior for ReactiveFallback {
    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        for index in 0..scope.children.len() {
            if scope.children[index].status().is_terminal() {
                scope.children[index].reset(scope.ctx.ui);
            }
            match scope.tick_child(index) {
                ExecutionStatus::Failure => {
                    if self.active == Some(index) {
                        self.active = None;
                    }
                }
                ExecutionStatus::Success => {
                    self.abandon_active(scope, None);
                    return ExecutionStatus::Success;
                }
                status => {
                    self.abandon_active(scope, Some(index));
                    self.active = Some(index);
                    return status;
                }
            }
        }
        self.active = None;
        ExecutionStatus::Failure
    }

    fn on_reset(&mut self) {
        self.active = None;
    }
}

impl ReactiveFallback {
    fn abandon_active(&mut self, scope: &mut Scope<'_, '_>, keep: Option<usize>) {
        if let Some(previous) = self.active {
            if keep != Some(previous) {
                scope.children[previous].halt();
                scope.children[previous].reset(scope.ctx.ui);
                self.active = None;
            }
        }
    }
}

/// Ticks all children each tick and terminates on configurable success and
/// failure counts.
///
/// With `N` children the effective thresholds satisfy `s + f <= N + 1`:
/// a threshold the user did not supply yields to one they did, and when
/// both are explicit and oversized, `failureThreshold` is the one reduced.
#[derive(Debug, Default)]
pub struct ParallelSequence {
    success_threshold: usize,
    failure_threshold: usize,
}

impl Behavior for ParallelSequence {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![
            AttributeDefinition::new("successThreshold").with_type("uint32"),
            AttributeDefinition::new("failureThreshold").with_type("uint32"),
        ]
    }

    fn on_init(&mut self, scope: &mut Scope<'_, '_>) -> bool {
        let child_count = scope.children.len();
        let mut success = child_count.max(1);
        let mut failure = 1usize;
        let success_given = scope.has_attribute("successThreshold");
        let failure_given = scope.has_attribute("failureThreshold");
        if !scope.attr_into("successThreshold", &mut success) {
            return false;
        }
        if !scope.attr_into("failureThreshold", &mut failure) {
            return false;
        }

        success = success.clamp(1, child_count.max(1));
        failure = failure.clamp(1, child_count.max(1));
        let limit = child_count + 1;
        if success + failure > limit {
            if success_given && !failure_given {
                failure = limit - success;
            } else if failure_given && !success_given {
                success = limit - failure;
            } else {
                failure = limit - success;
            }
        }
        self.success_threshold = success;
        self.failure_threshold = failure;
        true
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        if scope.children.is_empty() {
            return ExecutionStatus::Success;
        }
        for index in 0..scope.children.len() {
            if !scope.children[index].status().is_terminal() {
                scope.tick_child(index);
            }
        }

        let successes = scope
            .children
            .iter()
            .filter(|child| child.status() == ExecutionStatus::Success)
            .count();
        let failures = scope
            .children
            .iter()
            .filter(|child| child.status() == ExecutionStatus::Failure)
            .count();

        if successes >= self.success_threshold {
            self.halt_remaining(scope);
            return ExecutionStatus::Success;
        }
        if failures >= self.failure_threshold {
            self.halt_remaining(scope);
            return ExecutionStatus::Failure;
        }

        if scope
            .children
            .iter()
            .any(|child| child.status() == ExecutionStatus::Running)
        {
            ExecutionStatus::Running
        } else {
            ExecutionStatus::NotFinished
        }
    }
}

impl ParallelSequence {
    fn halt_remaining(&self, scope: &mut Scope<'_, '_>) {
        for child in scope.children.iter() {
            if !child.status().is_terminal() {
                child.halt();
            }
        }
    }
}

/// Executes the children selected by an index (or index array) read from a
/// workspace variable, with `Sequence` semantics over the selection.
/// Repeated indices re-run the child; an out-of-range index fails.
#[derive(Debug, Default)]
pub struct Choice {
    selection: Vec<usize>,
    cursor: usize,
    fresh: bool,
}

impl Behavior for Choice {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![AttributeDefinition::new("varName")
            .with_category(AttributeCategory::VariableName)
            .mandatory()]
    }

    fn on_init(&mut self, scope: &mut Scope<'_, '_>) -> bool {
        let Ok(Some(selector)) = scope.attr_value("varName") else {
            return false;
        };
        self.selection = match &selector {
            serde_json::Value::Array(items) => {
                let mut selection = Vec::with_capacity(items.len());
                for item in items {
                    match value::as_u64(item) {
                        Some(index) => selection.push(index as usize),
                        None => return false,
                    }
                }
                selection
            }
            single => match value::as_u64(single) {
                Some(index) => vec![index as usize],
                None => return false,
            },
        };
        self.cursor = 0;
        self.fresh = true;
        true
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        while self.cursor < self.selection.len() {
            let child_index = self.selection[self.cursor];
            if child_index >= scope.children.len() {
                return scope.fail(EngineError::OutOfRange {
                    index: child_index,
                    count: scope.children.len(),
                });
            }
            if self.fresh && scope.children[child_index].status().is_terminal() {
                scope.children[child_index].reset(scope.ctx.ui);
            }
            self.fresh = false;
            match scope.tick_child(child_index) {
                ExecutionStatus::Success => {
                    self.cursor += 1;
                    self.fresh = true;
                }
                other => return other,
            }
        }
        ExecutionStatus::Success
    }

    fn on_reset(&mut self) {
        self.selection.clear();
        self.cursor = 0;
        self.fresh = false;
    }
}

/// Builds a `Sequence` node.
pub fn sequence() -> Instruction {
    Instruction::new("Sequence", Box::new(Sequence))
}

/// Builds a `Fallback` node.
pub fn fallback() -> Instruction {
    Instruction::new("Fallback", Box::new(Fallback))
}

/// Builds a `ReactiveSequence` node.
pub fn reactive_sequence() -> Instruction {
    Instruction::new("ReactiveSequence", Box::<ReactiveSequence>::default())
}

/// Builds a `ReactiveFallback` node.
pub fn reactive_fallback() -> Instruction {
    Instruction::new("ReactiveFallback", Box::<ReactiveFallback>::default())
}

/// Builds a `ParallelSequence` node.
pub fn parallel_sequence() -> Instruction {
    Instruction::new("ParallelSequence", Box::<ParallelSequence>::default())
}

/// Builds a `Choice` node.
pub fn choice() -> Instruction {
    Instruction::new("Choice", Box::<Choice>::default())
}

#[cfg(test)]
mod tests {
    use super::super::testing::{recording_ui, tick_ctx, StubBehavior};
    use super::*;
    use crate::variable::LocalVariable;
    use crate::workspace::Workspace;
    use proctree_types::ExecutionStatus::{Failure, NotFinished, Running, Success};

    fn stub(status: ExecutionStatus) -> Instruction {
        Instruction::new("Stub", Box::new(StubBehavior::fixed(status)))
    }

    fn staged(statuses: Vec<ExecutionStatus>) -> Instruction {
        Instruction::new("Stub", Box::new(StubBehavior::sequence(statuses)))
    }

    fn workspace_with_uint(name: &str, literal: &str) -> Workspace {
        let mut workspace = Workspace::new();
        let mut variable = LocalVariable::new();
        variable.add_attribute("type", "array");
        variable.add_attribute("value", literal);
        use crate::variable::Variable as _;
        workspace.add_variable(name, Box::new(variable)).expect("add");
        workspace.setup_all().expect("setup");
        workspace
    }

    #[test]
    fn sequence_succeeds_when_all_children_succeed() {
        let workspace = Workspace::new();
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = sequence().with_child(stub(Success)).with_child(stub(Success));
        assert_eq!(node.tick(&ctx), Success);
    }

    #[test]
    fn sequence_reports_first_failure() {
        let workspace = Workspace::new();
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = sequence()
            .with_child(stub(Success))
            .with_child(stub(Failure))
            .with_child(stub(Success));
        assert_eq!(node.tick(&ctx), Failure);
        assert_eq!(node.children()[2].status(), ExecutionStatus::NotStarted);
    }

    #[test]
    fn sequence_resumes_from_first_unfinished_child() {
        let workspace = Workspace::new();
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = sequence()
            .with_child(stub(Success))
            .with_child(staged(vec![NotFinished, Success]))
            .with_child(stub(Success));
        assert_eq!(node.tick(&ctx), NotFinished);
        assert_eq!(node.tick(&ctx), Success);
    }

    #[test]
    fn fallback_short_circuits_on_success() {
        let workspace = Workspace::new();
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = fallback()
            .with_child(stub(Failure))
            .with_child(stub(Success))
            .with_child(stub(Failure));
        assert_eq!(node.tick(&ctx), Success);
        assert_eq!(node.children()[2].status(), ExecutionStatus::NotStarted);
    }

    #[test]
    fn fallback_fails_when_every_child_fails() {
        let workspace = Workspace::new();
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = fallback().with_child(stub(Failure)).with_child(stub(Failure));
        assert_eq!(node.tick(&ctx), Failure);
    }

    #[test]
    fn reactive_sequence_reevaluates_guards() {
        let workspace = Workspace::new();
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        // Guard succeeds twice; the worker takes two ticks. The guard must
        // be ticked again on the second pass.
        let mut node = reactive_sequence()
            .with_child(staged(vec![Success, Success]))
            .with_child(staged(vec![NotFinished, Success]));
        assert_eq!(node.tick(&ctx), NotFinished);
        assert_eq!(node.tick(&ctx), Success);
    }

    #[test]
    fn reactive_sequence_fails_as_soon_as_a_guard_fails() {
        let workspace = Workspace::new();
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = reactive_sequence()
            .with_child(staged(vec![Success, Failure]))
            .with_child(staged(vec![NotFinished, NotFinished, Success]));
        assert_eq!(node.tick(&ctx), NotFinished);
        assert_eq!(node.tick(&ctx), Failure);
    }

    #[test]
    fn reactive_fallback_recovers_when_an_earlier_child_succeeds() {
        let workspace = Workspace::new();
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = reactive_fallback()
            .with_child(staged(vec![Failure, Success]))
            .with_child(staged(vec![NotFinished, NotFinished]));
        assert_eq!(node.tick(&ctx), NotFinished);
        assert_eq!(node.tick(&ctx), Success);
    }

    #[test]
    fn parallel_defaults_require_all_successes() {
        let workspace = Workspace::new();
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = parallel_sequence()
            .with_child(stub(Success))
            .with_child(staged(vec![NotFinished, Success]));
        assert_eq!(node.tick(&ctx), NotFinished);
        assert_eq!(node.tick(&ctx), Success);
    }

    #[test]
    fn parallel_single_failure_fails_by_default() {
        let workspace = Workspace::new();
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = parallel_sequence()
            .with_child(staged(vec![NotFinished, NotFinished]))
            .with_child(stub(Failure));
        assert_eq!(node.tick(&ctx), Failure);
    }

    #[test]
    fn parallel_success_threshold_halts_stragglers() {
        let workspace = Workspace::new();
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = parallel_sequence()
            .with_attribute("successThreshold", "2")
            .with_child(stub(Success))
            .with_child(stub(Success))
            .with_child(stub(Running));
        assert_eq!(node.tick(&ctx), Success);
        assert!(node.children()[2].halt_signal().is_halted());
    }

    #[test]
    fn parallel_clamps_oversized_explicit_thresholds() {
        let workspace = Workspace::new();
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = parallel_sequence()
            .with_attribute("successThreshold", "3")
            .with_attribute("failureThreshold", "3")
            .with_child(staged(vec![NotFinished; 4]))
            .with_child(staged(vec![NotFinished; 4]))
            .with_child(stub(Failure));
        // N = 3: failureThreshold must shrink to 1, so one failure ends it.
        assert_eq!(node.tick(&ctx), Failure);
    }

    #[test]
    fn choice_runs_selected_children_in_listed_order() {
        let workspace = workspace_with_uint("choice", "[1,0,1]");
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = choice()
            .with_attribute("varName", "choice")
            .with_child(stub(Success))
            .with_child(stub(Success))
            .with_child(stub(Success));
        assert_eq!(node.tick(&ctx), Success);
        assert_eq!(node.children()[2].status(), ExecutionStatus::NotStarted);
    }

    #[test]
    fn choice_fails_on_out_of_range_index() {
        let workspace = workspace_with_uint("choice", "[7]");
        let (ui, events) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = choice().with_attribute("varName", "choice").with_child(stub(Success));
        assert_eq!(node.tick(&ctx), Failure);
        assert!(!events.log_lines().is_empty());
    }

    #[test]
    fn choice_fails_on_missing_variable() {
        let workspace = Workspace::new();
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = choice().with_attribute("varName", "absent").with_child(stub(Success));
        assert_eq!(node.tick(&ctx), Failure);
    }
}
