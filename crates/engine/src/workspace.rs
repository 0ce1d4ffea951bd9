//! Named-variable store with change notifications.
//!
//! Variables live behind per-variable locks so reads and writes are safe
//! from any thread. Successful writes publish a change event onto a
//! background dispatcher thread which fans it out to subscribers; no
//! listener ever runs while a variable lock is held. Per variable,
//! notification order is write order.

use std::collections::HashMap;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use indexmap::IndexMap;
use proctree_types::EngineError;
use serde_json::Value;
use tracing::{debug, warn};

use crate::value::TypeRegistry;
use crate::variable::{DeferredAction, Variable};

/// Listener invoked from the dispatcher thread with
/// `(variable-name, new-value, available)`. Must not block.
pub type ChangeListener = Box<dyn Fn(&str, &Value, bool) + Send>;

/// Handle returned by [`Workspace::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

enum DispatchEvent {
    Change {
        name: String,
        value: Value,
        available: bool,
    },
    Shutdown,
}

#[derive(Default)]
struct SubscriberTable {
    next_id: u64,
    entries: HashMap<u64, (String, ChangeListener)>,
}

struct VariableSlot {
    variable: Mutex<Box<dyn Variable>>,
}

/// The procedure's shared variable store.
pub struct Workspace {
    variables: IndexMap<String, Arc<VariableSlot>>,
    types: TypeRegistry,
    subscribers: Arc<Mutex<SubscriberTable>>,
    sender: Mutex<Sender<DispatchEvent>>,
    dispatcher: Option<JoinHandle<()>>,
    pre_teardown: Vec<(String, DeferredAction)>,
    is_set_up: bool,
}

impl Workspace {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<DispatchEvent>();
        let subscribers: Arc<Mutex<SubscriberTable>> = Arc::default();
        let table = Arc::clone(&subscribers);
        let dispatcher = thread::Builder::new()
            .name("workspace-notify".to_string())
            .spawn(move || {
                while let Ok(event) = receiver.recv() {
                    match event {
                        DispatchEvent::Change { name, value, available } => {
                            let table = table.lock().expect("subscriber table lock");
                            for (variable, listener) in table.entries.values() {
                                if variable == &name {
                                    listener(&name, &value, available);
                                }
                            }
                        }
                        DispatchEvent::Shutdown => break,
                    }
                }
            })
            .expect("spawn workspace dispatcher");

        Self {
            variables: IndexMap::new(),
            types: TypeRegistry::new(),
            subscribers,
            sender: Mutex::new(sender),
            dispatcher: Some(dispatcher),
            pre_teardown: Vec::new(),
            is_set_up: false,
        }
    }

    /// The type registry handed to variables during setup.
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn types_mut(&mut self) -> &mut TypeRegistry {
        &mut self.types
    }

    /// Adds a variable under a unique, case-sensitive name.
    pub fn add_variable(&mut self, name: impl Into<String>, variable: Box<dyn Variable>) -> Result<(), EngineError> {
        let name = name.into();
        if self.variables.contains_key(&name) {
            return Err(EngineError::DuplicateName(name));
        }
        let slot = Arc::new(VariableSlot {
            variable: Mutex::new(variable),
        });
        {
            // Wire the backend notifier so spontaneous updates reach the
            // dispatcher like ordinary writes.
            let sender = Mutex::new(self.sender.lock().expect("sender lock").clone());
            let variable_name = name.clone();
            let mut guard = slot.variable.lock().expect("variable lock");
            guard.set_notify_callback(Arc::new(move |value: &Value, available: bool| {
                let _ = sender.lock().expect("notifier sender lock").send(DispatchEvent::Change {
                    name: variable_name.clone(),
                    value: value.clone(),
                    available,
                });
            }));
        }
        self.variables.insert(name, slot);
        Ok(())
    }

    /// Names in insertion order.
    pub fn variable_names(&self) -> Vec<String> {
        self.variables.keys().cloned().collect()
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// The registered type name of a variable.
    pub fn variable_type(&self, name: &str) -> Option<String> {
        let slot = self.variables.get(name)?;
        let guard = slot.variable.lock().expect("variable lock");
        Some(guard.type_name().to_string())
    }

    /// Names of all variables of the given registered type, insertion order.
    pub fn variables_of_type(&self, type_name: &str) -> Vec<String> {
        self.variables
            .iter()
            .filter(|(_, slot)| {
                let guard = slot.variable.lock().expect("variable lock");
                guard.type_name() == type_name
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn is_available(&self, name: &str) -> bool {
        let Some(slot) = self.variables.get(name) else {
            return false;
        };
        let guard = slot.variable.lock().expect("variable lock");
        guard.is_available()
    }

    /// Sets up every variable in insertion order, collecting run-once
    /// setup/teardown actions deduplicated by identifier. On the first
    /// failure the variables already set up are torn down again and the
    /// failure is returned.
    pub fn setup_all(&mut self) -> Result<(), EngineError> {
        let mut post_setup: Vec<(String, DeferredAction)> = Vec::new();
        let mut seen: Vec<String> = Vec::new();
        let mut completed: Vec<Arc<VariableSlot>> = Vec::new();

        for (name, slot) in &self.variables {
            let outcome = {
                let mut guard = slot.variable.lock().expect("variable lock");
                guard.setup(&self.types)
            };
            match outcome {
                Ok(actions) => {
                    debug!(variable = %name, "variable set up");
                    completed.push(Arc::clone(slot));
                    if let Some(actions) = actions {
                        if seen.contains(&actions.identifier) {
                            continue;
                        }
                        seen.push(actions.identifier.clone());
                        if let Some(action) = actions.post_setup {
                            post_setup.push((actions.identifier.clone(), action));
                        }
                        if let Some(action) = actions.pre_teardown {
                            self.pre_teardown.push((actions.identifier, action));
                        }
                    }
                }
                Err(error) => {
                    warn!(variable = %name, error = %error, "variable setup failed, rolling back");
                    for slot in completed.iter().rev() {
                        slot.variable.lock().expect("variable lock").teardown();
                    }
                    self.pre_teardown.clear();
                    return Err(error);
                }
            }
        }

        for (identifier, action) in post_setup {
            debug!(action = %identifier, "running post-setup action");
            action();
        }
        self.is_set_up = true;
        Ok(())
    }

    /// Runs pre-teardown actions in registration order, then tears down
    /// variables in reverse insertion order.
    pub fn teardown_all(&mut self) {
        for (identifier, action) in self.pre_teardown.drain(..) {
            debug!(action = %identifier, "running pre-teardown action");
            action();
        }
        for slot in self.variables.values().rev() {
            slot.variable.lock().expect("variable lock").teardown();
        }
        self.is_set_up = false;
    }

    pub fn is_set_up(&self) -> bool {
        self.is_set_up
    }

    /// Reads `name` at `field` under the per-variable lock.
    pub fn get_value(&self, name: &str, field: &str) -> Option<Value> {
        let slot = self.variables.get(name)?;
        let guard = slot.variable.lock().expect("variable lock");
        guard.get(field)
    }

    /// Writes `name` at `field` under the per-variable lock and, on
    /// success, publishes a change notification. The event is queued while
    /// the lock is held so per-variable ordering matches write order; the
    /// listeners themselves run later on the dispatcher thread.
    pub fn set_value(&self, name: &str, field: &str, new_value: Value) -> bool {
        let Some(slot) = self.variables.get(name) else {
            return false;
        };
        let mut guard = slot.variable.lock().expect("variable lock");
        if !guard.set(field, new_value) {
            return false;
        }
        let snapshot = guard.get("").unwrap_or(Value::Null);
        let available = guard.is_available();
        self.publish(name, snapshot, available);
        true
    }

    /// Restores a variable's setup-time value and notifies subscribers.
    pub fn reset_value(&self, name: &str) -> bool {
        let Some(slot) = self.variables.get(name) else {
            return false;
        };
        let mut guard = slot.variable.lock().expect("variable lock");
        if !guard.reset_value() {
            return false;
        }
        let snapshot = guard.get("").unwrap_or(Value::Null);
        let available = guard.is_available();
        self.publish(name, snapshot, available);
        true
    }

    fn publish(&self, name: &str, value: Value, available: bool) {
        let sender = self.sender.lock().expect("sender lock");
        let _ = sender.send(DispatchEvent::Change {
            name: name.to_string(),
            value,
            available,
        });
    }

    /// Registers a listener for changes to `name`.
    pub fn subscribe(&self, name: impl Into<String>, listener: ChangeListener) -> SubscriptionHandle {
        let mut table = self.subscribers.lock().expect("subscriber table lock");
        table.next_id += 1;
        let id = table.next_id;
        table.entries.insert(id, (name.into(), listener));
        SubscriptionHandle(id)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut table = self.subscribers.lock().expect("subscriber table lock");
        table.entries.remove(&handle.0);
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        {
            let sender = self.sender.lock().expect("sender lock");
            let _ = sender.send(DispatchEvent::Shutdown);
        }
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
    }
}
