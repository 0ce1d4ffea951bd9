//! Change-driven instructions: listeners and condition/action combinators
//! that re-evaluate when workspace variables change.
//!
//! Workspace notifications arrive on the dispatcher thread; here they only
//! bump an atomic change counter. The owning instruction observes that
//! counter at its next tick, so instruction logic stays on the tick
//! thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use proctree_types::{EngineError, ExecutionStatus};

use crate::attribute::{AttributeCategory, AttributeDefinition};
use crate::ui::{InputFuture, InputRequest};
use crate::value;
use crate::workspace::{SubscriptionHandle, Workspace};

use super::{Behavior, Instruction, Scope, SetupScope};

/// Edge-trigger bookkeeping for a set of watched variables.
struct ChangeWatch {
    changes: Arc<AtomicUsize>,
    handles: Vec<SubscriptionHandle>,
}

impl ChangeWatch {
    /// Subscribes to every name in a comma-separated list.
    fn subscribe(workspace: &Workspace, names: &str) -> Self {
        let changes = Arc::new(AtomicUsize::new(0));
        let handles = names
            .split(',')
            .filter(|name| !name.is_empty())
            .map(|name| {
                let counter = Arc::clone(&changes);
                workspace.subscribe(
                    name,
                    Box::new(move |_, _, _| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                )
            })
            .collect();
        Self { changes, handles }
    }

    /// Consumes and reports whether changes arrived since the last call.
    fn take_dirty(&self) -> bool {
        self.changes.swap(0, Ordering::SeqCst) > 0
    }

    fn unsubscribe(&mut self, workspace: &Workspace) {
        for handle in self.handles.drain(..) {
            workspace.unsubscribe(handle);
        }
    }
}

fn drop_watch(watch: &mut Option<ChangeWatch>, workspace: &Workspace) {
    if let Some(mut old) = watch.take() {
        old.unsubscribe(workspace);
    }
}

fn deadline_after(seconds: f64) -> Instant {
    let clamped = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
    Instant::now() + Duration::from_secs_f64(clamped)
}

/// Re-runs its child whenever one of the listed variables changes.
///
/// With `forceSuccess`, a successful child round just re-arms the
/// listener and only child `Failure` ends it; otherwise the first child
/// terminal status is adopted. Halting ends the listener as well.
#[derive(Default)]
pub struct Listen {
    watch: Option<ChangeWatch>,
    force_success: bool,
}

impl Behavior for Listen {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![
            AttributeDefinition::new("varNames").mandatory(),
            AttributeDefinition::new("forceSuccess").with_type("bool"),
        ]
    }

    fn on_setup(&mut self, scope: &SetupScope<'_>) -> Result<(), EngineError> {
        scope.require_children(1..=1)
    }

    fn on_init(&mut self, scope: &mut Scope<'_, '_>) -> bool {
        drop_watch(&mut self.watch, scope.workspace());
        self.force_success = false;
        if !scope.attr_into("forceSuccess", &mut self.force_success) {
            return false;
        }
        let Some(names) = scope.attr_raw("varNames") else {
            return false;
        };
        self.watch = Some(ChangeWatch::subscribe(scope.workspace(), names));
        true
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        if scope.halted() {
            drop_watch(&mut self.watch, scope.workspace());
            return ExecutionStatus::Failure;
        }

        let child_in_progress = scope.children[0].status().is_in_progress();
        let dirty = self.watch.as_ref().map(ChangeWatch::take_dirty).unwrap_or(false);
        if !child_in_progress && !dirty {
            return ExecutionStatus::Running;
        }

        if !child_in_progress && scope.children[0].status().is_terminal() {
            scope.children[0].reset(scope.ctx.ui);
        }
        match scope.tick_child(0) {
            ExecutionStatus::Success if self.force_success => ExecutionStatus::Running,
            status if status.is_terminal() => {
                drop_watch(&mut self.watch, scope.workspace());
                status
            }
            status => status,
        }
    }

    fn on_reset(&mut self) {
        // Handles are released on the next init; the stale listeners only
        // touch a detached counter until then.
        self.watch = None;
        self.force_success = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AchievePhase {
    InitialCheck,
    Acting,
    FinalCheck,
    Prompting,
    WaitingForChange,
}

const CONDITION: usize = 0;
const ACTION: usize = 1;

fn tick_condition(scope: &mut Scope<'_, '_>, reset_terminal: bool) -> ExecutionStatus {
    if reset_terminal && scope.children[CONDITION].status().is_terminal() {
        scope.children[CONDITION].reset(scope.ctx.ui);
    }
    scope.tick_child(CONDITION)
}

/// Runs its action child until its condition child holds.
///
/// The condition is checked first; only when it fails does the action
/// run. While the action reports `Running` the condition is re-evaluated
/// alongside it and can cut the action short; after the action ends the
/// condition has the final word.
#[derive(Debug)]
pub struct AchieveCondition {
    phase: AchievePhase,
}

impl Default for AchieveCondition {
    fn default() -> Self {
        Self {
            phase: AchievePhase::InitialCheck,
        }
    }
}

impl Behavior for AchieveCondition {
    fn on_setup(&mut self, scope: &SetupScope<'_>) -> Result<(), EngineError> {
        scope.require_children(2..=2)
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        loop {
            match self.phase {
                AchievePhase::InitialCheck => match tick_condition(scope, false) {
                    ExecutionStatus::Success => return ExecutionStatus::Success,
                    ExecutionStatus::Failure => {
                        self.phase = AchievePhase::Acting;
                    }
                    status => return status,
                },
                AchievePhase::Acting => match scope.tick_child(ACTION) {
                    ExecutionStatus::Running => {
                        if tick_condition(scope, true) == ExecutionStatus::Success {
                            scope.children[ACTION].halt();
                            return ExecutionStatus::Success;
                        }
                        return ExecutionStatus::Running;
                    }
                    status if status.is_terminal() => {
                        self.phase = AchievePhase::FinalCheck;
                    }
                    status => return status,
                },
                AchievePhase::FinalCheck => return tick_condition(scope, true),
                AchievePhase::Prompting | AchievePhase::WaitingForChange => {
                    unreachable!("phase unused by AchieveCondition")
                }
            }
        }
    }

    fn on_reset(&mut self) {
        self.phase = AchievePhase::InitialCheck;
    }
}

/// [`AchieveCondition`] that falls back to a retry/override/abort prompt
/// when the final condition check fails. With a single child only the
/// condition is checked.
#[derive(Default)]
pub struct AchieveConditionWithOverride {
    phase: Option<AchievePhase>,
    prompt: Option<InputFuture>,
}

impl Behavior for AchieveConditionWithOverride {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![AttributeDefinition::new("description")]
    }

    fn on_setup(&mut self, scope: &SetupScope<'_>) -> Result<(), EngineError> {
        scope.require_children(1..=2)
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        let has_action = scope.children.len() == 2;
        let mut phase = self.phase.unwrap_or(AchievePhase::InitialCheck);
        loop {
            match phase {
                AchievePhase::InitialCheck => match tick_condition(scope, true) {
                    ExecutionStatus::Success => return ExecutionStatus::Success,
                    ExecutionStatus::Failure if has_action => phase = AchievePhase::Acting,
                    ExecutionStatus::Failure => phase = AchievePhase::Prompting,
                    status => {
                        self.phase = Some(phase);
                        return status;
                    }
                },
                AchievePhase::Acting => match scope.tick_child(ACTION) {
                    ExecutionStatus::Running => {
                        if tick_condition(scope, true) == ExecutionStatus::Success {
                            scope.children[ACTION].halt();
                            return ExecutionStatus::Success;
                        }
                        self.phase = Some(phase);
                        return ExecutionStatus::Running;
                    }
                    status if status.is_terminal() => phase = AchievePhase::FinalCheck,
                    status => {
                        self.phase = Some(phase);
                        return status;
                    }
                },
                AchievePhase::FinalCheck => match tick_condition(scope, true) {
                    ExecutionStatus::Success => return ExecutionStatus::Success,
                    ExecutionStatus::Failure => phase = AchievePhase::Prompting,
                    status => {
                        self.phase = Some(phase);
                        return status;
                    }
                },
                AchievePhase::Prompting => {
                    if self.prompt.is_none() {
                        let description = scope
                            .attr_raw("description")
                            .unwrap_or("condition not met")
                            .to_string();
                        let request = InputRequest::Choice {
                            description,
                            options: vec!["Retry".to_string(), "Override".to_string(), "Abort".to_string()],
                        };
                        let future = scope.ui().request_input(request);
                        let cancel_handle = future.clone();
                        scope
                            .halt_signal()
                            .register_canceller(Box::new(move || cancel_handle.cancel()));
                        self.prompt = Some(future);
                    }
                    let future = self.prompt.as_ref().expect("prompt created above");
                    if !future.is_ready() {
                        self.phase = Some(phase);
                        return ExecutionStatus::Running;
                    }
                    let reply = match future.get() {
                        Ok(reply) => reply,
                        Err(error) => {
                            self.prompt = None;
                            return scope.fail(error);
                        }
                    };
                    self.prompt = None;
                    match value::as_u64(&reply) {
                        // Retry: start the whole node over.
                        Some(0) => {
                            for child in scope.children.iter_mut() {
                                child.reset(scope.ctx.ui);
                            }
                            self.phase = Some(AchievePhase::InitialCheck);
                            return ExecutionStatus::NotFinished;
                        }
                        // Override: accept despite the failed condition.
                        Some(1) => return ExecutionStatus::Success,
                        // Abort (or anything else): give up.
                        _ => return ExecutionStatus::Failure,
                    }
                }
                AchievePhase::WaitingForChange => unreachable!("phase unused by AchieveConditionWithOverride"),
            }
        }
    }

    fn on_reset(&mut self) {
        if let Some(prompt) = self.prompt.take() {
            prompt.cancel();
        }
        self.phase = None;
    }
}

/// [`AchieveCondition`] that, after the action finishes with the condition
/// still failing, keeps re-checking the condition on watched-variable
/// changes until a timeout expires.
#[derive(Default)]
pub struct AchieveConditionWithTimeout {
    phase: Option<AchievePhase>,
    watch: Option<ChangeWatch>,
    deadline: Option<Instant>,
}

impl Behavior for AchieveConditionWithTimeout {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![
            AttributeDefinition::new("varNames").mandatory(),
            AttributeDefinition::new("timeout")
                .with_type("float64")
                .with_category(AttributeCategory::Both)
                .mandatory(),
        ]
    }

    fn on_setup(&mut self, scope: &SetupScope<'_>) -> Result<(), EngineError> {
        scope.require_children(2..=2)
    }

    fn on_init(&mut self, scope: &mut Scope<'_, '_>) -> bool {
        drop_watch(&mut self.watch, scope.workspace());
        self.phase = Some(AchievePhase::InitialCheck);
        self.deadline = None;
        let mut timeout = 0.0f64;
        if !scope.attr_into("timeout", &mut timeout) {
            return false;
        }
        self.deadline = Some(deadline_after(timeout));
        true
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        let mut phase = self.phase.unwrap_or(AchievePhase::InitialCheck);
        loop {
            match phase {
                AchievePhase::InitialCheck => match tick_condition(scope, false) {
                    ExecutionStatus::Success => return self.finish(scope, ExecutionStatus::Success),
                    ExecutionStatus::Failure => phase = AchievePhase::Acting,
                    status => {
                        self.phase = Some(phase);
                        return status;
                    }
                },
                AchievePhase::Acting => match scope.tick_child(ACTION) {
                    ExecutionStatus::Running => {
                        if tick_condition(scope, true) == ExecutionStatus::Success {
                            scope.children[ACTION].halt();
                            return self.finish(scope, ExecutionStatus::Success);
                        }
                        self.phase = Some(phase);
                        return ExecutionStatus::Running;
                    }
                    status if status.is_terminal() => phase = AchievePhase::FinalCheck,
                    status => {
                        self.phase = Some(phase);
                        return status;
                    }
                },
                AchievePhase::FinalCheck => match tick_condition(scope, true) {
                    ExecutionStatus::Success => return self.finish(scope, ExecutionStatus::Success),
                    ExecutionStatus::Failure => {
                        let Some(names) = scope.attr_raw("varNames") else {
                            return scope.fail("missing varNames attribute");
                        };
                        self.watch = Some(ChangeWatch::subscribe(scope.workspace(), names));
                        phase = AchievePhase::WaitingForChange;
                        self.phase = Some(phase);
                        return ExecutionStatus::Running;
                    }
                    status => {
                        self.phase = Some(phase);
                        return status;
                    }
                },
                AchievePhase::WaitingForChange => {
                    if scope.halted() {
                        return self.finish(scope, ExecutionStatus::Failure);
                    }
                    let dirty = self.watch.as_ref().map(ChangeWatch::take_dirty).unwrap_or(false);
                    let condition_pending = scope.children[CONDITION].status().is_in_progress();
                    if dirty || condition_pending {
                        match tick_condition(scope, !condition_pending) {
                            ExecutionStatus::Success => return self.finish(scope, ExecutionStatus::Success),
                            ExecutionStatus::Failure => {}
                            status => {
                                self.phase = Some(phase);
                                return status;
                            }
                        }
                    }
                    if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        return self.finish(scope, ExecutionStatus::Failure);
                    }
                    self.phase = Some(phase);
                    return ExecutionStatus::Running;
                }
                AchievePhase::Prompting => unreachable!("phase unused by AchieveConditionWithTimeout"),
            }
        }
    }

    fn on_reset(&mut self) {
        self.phase = None;
        self.watch = None;
        self.deadline = None;
    }
}

impl AchieveConditionWithTimeout {
    fn finish(&mut self, scope: &Scope<'_, '_>, status: ExecutionStatus) -> ExecutionStatus {
        drop_watch(&mut self.watch, scope.workspace());
        status
    }
}

/// Runs its action child while a condition child keeps holding.
///
/// Children are `[action, condition]`. The condition is re-evaluated on
/// every change of the listed variables; a failing condition halts the
/// action and fails the node. The node succeeds only when the action
/// finishes successfully with the condition intact.
#[derive(Default)]
pub struct ExecuteWhile {
    watch: Option<ChangeWatch>,
    checking: bool,
}

const EW_ACTION: usize = 0;
const EW_CONDITION: usize = 1;

impl Behavior for ExecuteWhile {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![AttributeDefinition::new("varNames").mandatory()]
    }

    fn on_setup(&mut self, scope: &SetupScope<'_>) -> Result<(), EngineError> {
        scope.require_children(2..=2)
    }

    fn on_init(&mut self, scope: &mut Scope<'_, '_>) -> bool {
        drop_watch(&mut self.watch, scope.workspace());
        self.checking = false;
        let Some(names) = scope.attr_raw("varNames") else {
            return false;
        };
        self.watch = Some(ChangeWatch::subscribe(scope.workspace(), names));
        true
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        let dirty = self.watch.as_ref().map(ChangeWatch::take_dirty).unwrap_or(false);
        if self.checking || dirty {
            let reset_needed = !self.checking;
            if reset_needed && scope.children[EW_CONDITION].status().is_terminal() {
                scope.children[EW_CONDITION].reset(scope.ctx.ui);
            }
            match scope.tick_child(EW_CONDITION) {
                ExecutionStatus::Failure => {
                    scope.children[EW_ACTION].halt();
                    drop_watch(&mut self.watch, scope.workspace());
                    return ExecutionStatus::Failure;
                }
                ExecutionStatus::Success => self.checking = false,
                _ => {
                    self.checking = true;
                    return ExecutionStatus::NotFinished;
                }
            }
        }

        match scope.tick_child(EW_ACTION) {
            status if status.is_terminal() => {
                drop_watch(&mut self.watch, scope.workspace());
                status
            }
            status => status,
        }
    }

    fn on_reset(&mut self) {
        self.watch = None;
        self.checking = false;
    }
}

/// Ticks its condition child, then waits for watched-variable changes and
/// re-ticks it until it succeeds or the timeout expires.
#[derive(Default)]
pub struct WaitForCondition {
    watch: Option<ChangeWatch>,
    deadline: Option<Instant>,
}

impl Behavior for WaitForCondition {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![
            AttributeDefinition::new("varNames").mandatory(),
            AttributeDefinition::new("timeout")
                .with_type("float64")
                .with_category(AttributeCategory::Both)
                .mandatory(),
        ]
    }

    fn on_setup(&mut self, scope: &SetupScope<'_>) -> Result<(), EngineError> {
        scope.require_children(1..=1)
    }

    fn on_init(&mut self, scope: &mut Scope<'_, '_>) -> bool {
        drop_watch(&mut self.watch, scope.workspace());
        let mut timeout = 0.0f64;
        if !scope.attr_into("timeout", &mut timeout) {
            return false;
        }
        self.deadline = Some(deadline_after(timeout));
        let Some(names) = scope.attr_raw("varNames") else {
            return false;
        };
        self.watch = Some(ChangeWatch::subscribe(scope.workspace(), names));
        true
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        if scope.halted() {
            drop_watch(&mut self.watch, scope.workspace());
            return ExecutionStatus::Failure;
        }

        let condition_pending = !scope.children[CONDITION].status().is_terminal();
        let dirty = self.watch.as_ref().map(ChangeWatch::take_dirty).unwrap_or(false);
        if condition_pending || dirty {
            if !condition_pending {
                scope.children[CONDITION].reset(scope.ctx.ui);
            }
            match scope.tick_child(CONDITION) {
                ExecutionStatus::Success => {
                    drop_watch(&mut self.watch, scope.workspace());
                    return ExecutionStatus::Success;
                }
                ExecutionStatus::Failure => {}
                status => return status,
            }
        }

        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            drop_watch(&mut self.watch, scope.workspace());
            return ExecutionStatus::Failure;
        }
        ExecutionStatus::Running
    }

    fn on_reset(&mut self) {
        self.watch = None;
        self.deadline = None;
    }
}

/// Builds a `Listen` node.
pub fn listen() -> Instruction {
    Instruction::new("Listen", Box::<Listen>::default())
}

/// Builds an `AchieveCondition` node.
pub fn achieve_condition() -> Instruction {
    Instruction::new("AchieveCondition", Box::<AchieveCondition>::default())
}

/// Builds an `AchieveConditionWithOverride` node.
pub fn achieve_condition_with_override() -> Instruction {
    Instruction::new(
        "AchieveConditionWithOverride",
        Box::<AchieveConditionWithOverride>::default(),
    )
}

/// Builds an `AchieveConditionWithTimeout` node.
pub fn achieve_condition_with_timeout() -> Instruction {
    Instruction::new(
        "AchieveConditionWithTimeout",
        Box::<AchieveConditionWithTimeout>::default(),
    )
}

/// Builds an `ExecuteWhile` node.
pub fn execute_while() -> Instruction {
    Instruction::new("ExecuteWhile", Box::<ExecuteWhile>::default())
}

/// Builds a `WaitForCondition` node.
pub fn wait_for_condition() -> Instruction {
    Instruction::new("WaitForCondition", Box::<WaitForCondition>::default())
}
