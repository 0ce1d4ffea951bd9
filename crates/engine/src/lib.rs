//! Behavior-tree execution engine for automating operational procedures.
//!
//! A procedure is a tree of instructions plus a workspace of named, typed
//! variables. An external runner ticks the tree from a single controlling
//! thread; workspace change notifications and asynchronous operator input
//! arrive from background threads and are observed at tick boundaries.
//!
//! - `instruction` holds the node life-cycle and the built-in instruction
//!   library
//! - `workspace` / `variable` are the shared variable store and its
//!   backends
//! - `attribute` is the declarative attribute/constraint system
//! - `procedure` is the document model and container, `runner` the tick
//!   loop, `registry` the name-to-factory maps
//! - `ui` is the contract towards the operator-facing interface

pub mod attribute;
pub mod instruction;
pub mod procedure;
pub mod registry;
pub mod runner;
pub mod ui;
pub mod value;
pub mod variable;
pub mod workspace;

pub use proctree_types::{EngineError, ExecutionStatus, InstructionId, Severity};

pub use attribute::{AttributeCategory, AttributeDefinition, Constraint};
pub use instruction::{Behavior, HaltSignal, Instruction, Scope, SetupScope, TickCtx};
pub use procedure::{load_procedure_file, InstructionSpec, Procedure, ProcedureSpec, VariableSpec};
pub use runner::{RunOutcome, Runner, RunnerHandle};
pub use ui::{InputFuture, InputPromise, InputRequest, InstructionView, SilentUserInterface, UserInterface};
pub use variable::{LocalVariable, SetupTeardownActions, Variable};
pub use workspace::{SubscriptionHandle, Workspace};
