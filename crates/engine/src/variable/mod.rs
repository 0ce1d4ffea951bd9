//! Workspace variables: the polymorphic `Variable` trait and the built-in
//! `Local` backend.
//!
//! A variable is created by the registry from its type name, configured by
//! string attributes, validated and activated by `setup`, and read/written
//! through the workspace under a per-variable lock. Before `setup` and
//! after `teardown` reads and writes fail. I/O-backed variable types
//! (file, network, CA/PVA) are supplied by the host through the registry.

use proctree_types::EngineError;
use serde_json::Value;

use crate::attribute::{AttributeBag, AttributeDefinition, Constraint};
use crate::value::TypeRegistry;

mod local;

pub use local::LocalVariable;

/// Zero-argument action boxed for deferred execution.
pub type DeferredAction = Box<dyn FnOnce() + Send>;

/// Actions a variable hands back from `setup`, run once per identifier:
/// post-setup actions run after every variable is set up, pre-teardown
/// actions run before any variable is torn down.
pub struct SetupTeardownActions {
    /// Deduplication key; the workspace keeps the first registration.
    pub identifier: String,
    pub post_setup: Option<DeferredAction>,
    pub pre_teardown: Option<DeferredAction>,
}

impl SetupTeardownActions {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            post_setup: None,
            pre_teardown: None,
        }
    }

    pub fn with_post_setup(mut self, action: DeferredAction) -> Self {
        self.post_setup = Some(action);
        self
    }

    pub fn with_pre_teardown(mut self, action: DeferredAction) -> Self {
        self.pre_teardown = Some(action);
        self
    }
}

/// Callback used by backend-driven variables to push spontaneous updates
/// into the workspace notification stream.
pub type VariableNotifier = std::sync::Arc<dyn Fn(&Value, bool) + Send + Sync>;

/// A named, dynamically typed slot in the workspace.
pub trait Variable: Send {
    /// Stable type name this variable was registered under.
    fn type_name(&self) -> &str;

    /// Raw attribute bag, populated before `setup`.
    fn attributes(&self) -> &AttributeBag;

    /// Adds or replaces a raw attribute. Only meaningful before `setup`.
    fn add_attribute(&mut self, name: &str, value: &str);

    /// Declared attribute shapes, validated during `setup`.
    fn definitions(&self) -> &[AttributeDefinition] {
        &[]
    }

    /// Declared cross-attribute constraints.
    fn constraints(&self) -> &[Constraint] {
        &[]
    }

    /// Validates attributes and activates the backend. Returns optional
    /// run-once actions to be registered with the workspace.
    fn setup(&mut self, types: &TypeRegistry) -> Result<Option<SetupTeardownActions>, EngineError>;

    /// Deactivates the backend; the variable returns to its
    /// post-attribute-construction form.
    fn teardown(&mut self);

    /// Whether the backend is ready; `get` may succeed only when available.
    fn is_available(&self) -> bool;

    /// Reads the value at `field` (empty for the whole value).
    fn get(&self, field: &str) -> Option<Value>;

    /// Writes the value at `field`. Returns `false` when unavailable, the
    /// path does not resolve, or the types are incompatible.
    fn set(&mut self, field: &str, value: Value) -> bool;

    /// Restores the value the variable held right after `setup`. Returns
    /// `false` when the backend does not support it or is unavailable.
    fn reset_value(&mut self) -> bool {
        false
    }

    /// Installs the workspace-side notifier for backend-driven updates.
    /// In-memory backends ignore this; network backends forward
    /// connection/value changes through it.
    fn set_notify_callback(&mut self, _notifier: VariableNotifier) {}
}
