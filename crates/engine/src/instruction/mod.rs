//! Instruction nodes and their life-cycle.
//!
//! [`Instruction`] is the concrete node type: it owns the status machine,
//! the attribute bag, the halt signal and the children, and enforces the
//! life-cycle contract around a boxed [`Behavior`]. Behaviors implement the
//! hooks only; status accounting and observer notification always happen
//! here, regardless of what a hook does. Once a node reports `Success` or
//! `Failure`, further ticks return that status without invoking the hook,
//! until `reset`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use proctree_types::{EngineError, ExecutionStatus, InstructionId, Severity};
use serde_json::Value;
use tracing::debug;

use crate::attribute::{self, AttributeBag, AttributeDefinition, Constraint, FromAttribute};
use crate::ui::{InstructionView, UserInterface};
use crate::workspace::Workspace;

pub mod compound;
pub mod decorator;
pub mod interaction;
pub mod reactive;
pub mod timing;
pub mod variable_ops;

#[derive(Default)]
struct HaltInner {
    flag: AtomicBool,
    children: Mutex<Vec<HaltSignal>>,
    cancellers: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

/// Cooperative halt request, shared between the tree and any thread that
/// needs to stop it.
///
/// Halting sets an atomic flag, fires registered cancellers (input future
/// cancellation, worker shutdown), and propagates to attached child
/// signals. Behaviors observe the flag at tick boundaries; nothing is
/// pre-empted.
#[derive(Clone, Default)]
pub struct HaltSignal {
    inner: Arc<HaltInner>,
}

impl HaltSignal {
    /// Raises the halt request. Safe from any thread.
    pub fn halt(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        let cancellers = self.inner.cancellers.lock().expect("canceller lock");
        for canceller in cancellers.iter() {
            canceller();
        }
        drop(cancellers);
        let children = self.inner.children.lock().expect("halt child lock");
        for child in children.iter() {
            child.halt();
        }
    }

    pub fn is_halted(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Clears the flag and drops episode-scoped cancellers. Attached child
    /// signals are kept; reset recursion clears them individually.
    fn clear(&self) {
        self.inner.flag.store(false, Ordering::SeqCst);
        self.inner.cancellers.lock().expect("canceller lock").clear();
    }

    fn attach_child(&self, child: HaltSignal) {
        self.inner.children.lock().expect("halt child lock").push(child);
    }

    fn detach_child(&self, child: &HaltSignal) {
        let mut children = self.inner.children.lock().expect("halt child lock");
        children.retain(|existing| !Arc::ptr_eq(&existing.inner, &child.inner));
    }

    /// Registers a cancellation hook for the current execution episode.
    /// Runs immediately when the signal is already halted, so a request
    /// racing a halt cannot be missed.
    pub fn register_canceller(&self, canceller: Box<dyn Fn() + Send + Sync>) {
        let mut cancellers = self.inner.cancellers.lock().expect("canceller lock");
        if self.inner.flag.load(Ordering::SeqCst) {
            canceller();
            return;
        }
        cancellers.push(canceller);
    }
}

/// Shared references a tick needs: the observer and the variable store.
pub struct TickCtx<'a> {
    pub ui: &'a dyn UserInterface,
    pub workspace: &'a Workspace,
}

/// What a behavior hook sees during setup.
pub struct SetupScope<'a> {
    pub attributes: &'a AttributeBag,
    pub child_count: usize,
    pub workspace: &'a Workspace,
}

impl SetupScope<'_> {
    /// Convenience check for fixed-arity instructions.
    pub fn require_children(&self, expected: std::ops::RangeInclusive<usize>) -> Result<(), EngineError> {
        if expected.contains(&self.child_count) {
            return Ok(());
        }
        Err(EngineError::attribute(
            "children",
            format!(
                "expected {} to {} children, found {}",
                expected.start(),
                expected.end(),
                self.child_count
            ),
        ))
    }
}

/// What a behavior hook sees during init and tick: its children, its
/// attributes, the halt signal, and the shared tick context.
pub struct Scope<'a, 'ctx> {
    pub ctx: &'a TickCtx<'ctx>,
    pub children: &'a mut Vec<Instruction>,
    attributes: &'a AttributeBag,
    definitions: &'a [AttributeDefinition],
    halt: &'a HaltSignal,
    label: &'a str,
}

impl Scope<'_, '_> {
    pub fn halted(&self) -> bool {
        self.halt.is_halted()
    }

    pub fn halt_signal(&self) -> &HaltSignal {
        self.halt
    }

    pub fn workspace(&self) -> &Workspace {
        self.ctx.workspace
    }

    pub fn ui(&self) -> &dyn UserInterface {
        self.ctx.ui
    }

    /// Ticks child `index` through its own life-cycle.
    pub fn tick_child(&mut self, index: usize) -> ExecutionStatus {
        self.children[index].tick(self.ctx)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    /// Raw attribute string, exactly as written in the document.
    pub fn attr_raw(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Resolves an attribute to its raw value: literals parse against the
    /// declared type, references read through the workspace.
    pub fn attr_value(&self, name: &str) -> Result<Option<Value>, EngineError> {
        attribute::resolve(self.attributes, self.definitions, name, self.ctx.workspace)
    }

    /// Typed attribute retrieval with preset-default semantics: an absent
    /// attribute leaves `out` unchanged and reports success; a resolution
    /// or conversion failure is logged to the user interface and reported
    /// as `false`.
    pub fn attr_into<T: FromAttribute>(&self, name: &str, out: &mut T) -> bool {
        match self.attr_value(name) {
            Ok(None) => true,
            Ok(Some(value)) => match T::from_attribute(&value) {
                Some(converted) => {
                    *out = converted;
                    true
                }
                None => {
                    self.ctx.ui.log(
                        Severity::Error,
                        &format!("{}: attribute '{name}' has an unconvertible value", self.label),
                    );
                    false
                }
            },
            Err(error) => {
                self.ctx.ui.log(Severity::Error, &format!("{}: {error}", self.label));
                false
            }
        }
    }

    /// Reads a `var` or `var.field` workspace reference.
    pub fn read_reference(&self, reference: &str) -> Option<Value> {
        let (variable, field) = split_reference(reference);
        self.ctx.workspace.get_value(variable, field)
    }

    /// Writes through a `var` or `var.field` workspace reference.
    pub fn write_reference(&self, reference: &str, value: Value) -> bool {
        let (variable, field) = split_reference(reference);
        self.ctx.workspace.set_value(variable, field, value)
    }

    /// Logs a tick-time failure to the user interface and yields `Failure`;
    /// tick-time errors never propagate out of the tree.
    pub fn fail(&self, reason: impl std::fmt::Display) -> ExecutionStatus {
        self.ctx.ui.log(Severity::Error, &format!("{}: {reason}", self.label));
        ExecutionStatus::Failure
    }
}

fn split_reference(reference: &str) -> (&str, &str) {
    match reference.split_once('.') {
        Some((variable, field)) => (variable, field),
        None => (reference, ""),
    }
}

/// Hooks implemented by concrete instruction kinds.
///
/// The public life-cycle operations on [`Instruction`] call these; nothing
/// else does. `on_tick` must return a status reachable from the current
/// one and never `NotStarted`.
pub trait Behavior: Send {
    /// Declared attribute shapes, collected once at node construction.
    fn definitions(&self) -> Vec<AttributeDefinition> {
        Vec::new()
    }

    /// Declared cross-attribute constraints.
    fn constraints(&self) -> Vec<Constraint> {
        Vec::new()
    }

    /// Extra validation/resolution at setup, after attribute validation.
    fn on_setup(&mut self, scope: &SetupScope<'_>) -> Result<(), EngineError> {
        let _ = scope;
        Ok(())
    }

    /// One-time preparation when leaving `NotStarted`. Returning `false`
    /// fails the node without invoking `on_tick`.
    fn on_init(&mut self, scope: &mut Scope<'_, '_>) -> bool {
        let _ = scope;
        true
    }

    /// One unit of work; called on every tick while non-terminal.
    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus;

    /// Clears episode state so the node can run again after `reset`.
    fn on_reset(&mut self) {}
}

/// A node of the procedure tree.
pub struct Instruction {
    id: InstructionId,
    type_name: String,
    name: Option<String>,
    attributes: AttributeBag,
    definitions: Vec<AttributeDefinition>,
    constraints: Vec<Constraint>,
    status: ExecutionStatus,
    halt: HaltSignal,
    is_root: bool,
    children: Vec<Instruction>,
    behavior: Box<dyn Behavior>,
}

impl Instruction {
    /// Wraps a behavior into a node, pulling its attribute declarations.
    pub fn new(type_name: impl Into<String>, behavior: Box<dyn Behavior>) -> Self {
        let definitions = behavior.definitions();
        let constraints = behavior.constraints();
        Self {
            id: InstructionId::next(),
            type_name: type_name.into(),
            name: None,
            attributes: AttributeBag::new(),
            definitions,
            constraints,
            status: ExecutionStatus::NotStarted,
            halt: HaltSignal::default(),
            is_root: false,
            children: Vec::new(),
            behavior,
        }
    }

    pub fn id(&self) -> InstructionId {
        self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.set_name(name);
        self
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn set_root(&mut self, is_root: bool) {
        self.is_root = is_root;
    }

    pub fn with_root(mut self) -> Self {
        self.is_root = true;
        self
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn attributes(&self) -> &AttributeBag {
        &self.attributes
    }

    /// Adds or replaces a raw string attribute.
    pub fn add_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_attribute(name, value);
        self
    }

    pub fn children(&self) -> &[Instruction] {
        &self.children
    }

    pub(crate) fn children_mut(&mut self) -> &mut [Instruction] {
        &mut self.children
    }

    /// Takes ownership of `child` and links it into halt propagation.
    pub fn add_child(&mut self, child: Instruction) {
        self.halt.attach_child(child.halt.clone());
        self.children.push(child);
    }

    pub fn with_child(mut self, child: Instruction) -> Self {
        self.add_child(child);
        self
    }

    /// Removes and returns the child at `index`, unlinking it from halt
    /// propagation; ownership returns to the caller.
    pub fn remove_child(&mut self, index: usize) -> Instruction {
        let child = self.children.remove(index);
        self.halt.detach_child(&child.halt);
        child
    }

    /// A clone of the node's halt signal, for cross-thread halting.
    pub fn halt_signal(&self) -> HaltSignal {
        self.halt.clone()
    }

    /// Requests a cooperative stop of this subtree. Safe from any thread.
    pub fn halt(&self) {
        self.halt.halt();
    }

    /// Identity view handed to the user interface.
    pub fn view(&self) -> InstructionView<'_> {
        InstructionView {
            id: self.id,
            type_name: &self.type_name,
            name: self.name.as_deref(),
        }
    }

    /// Depth-first lookup by node identity.
    pub fn find(&self, id: InstructionId) -> Option<&Instruction> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    /// Validates attributes and constraints, runs the behavior's setup
    /// hook, then recursively sets up children. Nothing of a failed setup
    /// persists beyond the returned error.
    pub fn setup(&mut self, workspace: &Workspace) -> Result<(), EngineError> {
        attribute::validate(&self.attributes, &self.definitions, &self.constraints)?;
        let scope = SetupScope {
            attributes: &self.attributes,
            child_count: self.children.len(),
            workspace,
        };
        self.behavior.on_setup(&scope)?;
        for child in &mut self.children {
            child.setup(workspace)?;
        }
        Ok(())
    }

    /// One synchronous tick through the life-cycle contract.
    pub fn tick(&mut self, ctx: &TickCtx<'_>) -> ExecutionStatus {
        if self.status.is_terminal() {
            return self.status;
        }

        if self.status == ExecutionStatus::NotStarted {
            self.halt.clear();
            let initialized = {
                let mut scope = Scope {
                    ctx,
                    children: &mut self.children,
                    attributes: &self.attributes,
                    definitions: &self.definitions,
                    halt: &self.halt,
                    label: &self.type_name,
                };
                self.behavior.on_init(&mut scope)
            };
            if !initialized {
                self.set_status(ctx.ui, ExecutionStatus::Failure);
                return ExecutionStatus::Failure;
            }
            self.set_status(ctx.ui, ExecutionStatus::NotFinished);
        }

        let next = {
            let mut scope = Scope {
                ctx,
                children: &mut self.children,
                attributes: &self.attributes,
                definitions: &self.definitions,
                halt: &self.halt,
                label: &self.type_name,
            };
            self.behavior.on_tick(&mut scope)
        };
        debug_assert!(next != ExecutionStatus::NotStarted, "on_tick may not yield NotStarted");

        if next != self.status {
            self.set_status(ctx.ui, next);
        }
        next
    }

    /// Returns the subtree to `NotStarted` and clears halt flags.
    pub fn reset(&mut self, ui: &dyn UserInterface) {
        self.halt.clear();
        self.behavior.on_reset();
        if self.status != ExecutionStatus::NotStarted {
            self.set_status(ui, ExecutionStatus::NotStarted);
        }
        for child in &mut self.children {
            child.reset(ui);
        }
    }

    fn set_status(&mut self, ui: &dyn UserInterface, status: ExecutionStatus) {
        debug!(
            instruction = %self.id,
            kind = %self.type_name,
            from = %self.status,
            to = %status,
            "status transition"
        );
        self.status = status;
        ui.update_instruction_status(&self.view(), status);
    }
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instruction")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("children", &self.children.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing;
