//! User-interface contract: the observer/prompter trait and the
//! asynchronous input handle.
//!
//! Status and variable notifications may arrive from the tick thread and
//! the workspace dispatcher thread respectively, so implementations must
//! be thread-safe. Prompts are only issued from the tick thread and hand
//! back an [`InputFuture`] the requesting instruction polls on later
//! ticks; ticks never block on user input.

use std::sync::{Arc, Mutex};

use proctree_types::{EngineError, ExecutionStatus, InstructionId, Severity};
use serde_json::Value;

/// Borrowed identity of an instruction node, as shown to the interface.
#[derive(Debug, Clone, Copy)]
pub struct InstructionView<'a> {
    pub id: InstructionId,
    pub type_name: &'a str,
    /// Optional human label from the procedure document.
    pub name: Option<&'a str>,
}

impl InstructionView<'_> {
    /// Human label when present, type name otherwise.
    pub fn display_name(&self) -> &str {
        self.name.unwrap_or(self.type_name)
    }
}

/// A prompt issued to the operator.
#[derive(Debug, Clone)]
pub enum InputRequest {
    /// Free-form value entry; the reply is the entered value.
    Value { description: String },
    /// Selection among labelled options; the reply is the chosen index.
    Choice { description: String, options: Vec<String> },
    /// Yes/no confirmation; the reply is a boolean.
    Confirmation {
        description: String,
        ok_text: String,
        cancel_text: String,
    },
}

#[derive(Debug)]
enum InputState {
    Pending,
    Ready(Value),
    Cancelled,
}

#[derive(Debug)]
struct InputSlot {
    state: Mutex<InputState>,
}

/// Pending user reply, polled by the requesting instruction.
#[derive(Clone, Debug)]
pub struct InputFuture {
    slot: Arc<InputSlot>,
}

impl InputFuture {
    /// Whether `get` would complete (with a reply or a cancellation).
    pub fn is_ready(&self) -> bool {
        !matches!(*self.slot.state.lock().expect("input slot lock"), InputState::Pending)
    }

    /// The reply, once ready. Cancellation surfaces as an error.
    pub fn get(&self) -> Result<Value, EngineError> {
        match &*self.slot.state.lock().expect("input slot lock") {
            InputState::Pending => Err(EngineError::CancellationError("input not ready".to_string())),
            InputState::Ready(value) => Ok(value.clone()),
            InputState::Cancelled => Err(EngineError::CancellationError("input request cancelled".to_string())),
        }
    }

    /// Cancels the request; a pending `get` fails promptly. Safe from any
    /// thread, so halt propagation can call it directly.
    pub fn cancel(&self) {
        let mut state = self.slot.state.lock().expect("input slot lock");
        if matches!(*state, InputState::Pending) {
            *state = InputState::Cancelled;
        }
    }
}

/// Fulfilment side of an input request, owned by the user interface.
#[derive(Clone)]
pub struct InputPromise {
    slot: Arc<InputSlot>,
}

impl InputPromise {
    /// Delivers the operator's reply. Ignored after cancellation.
    pub fn fulfill(&self, value: Value) {
        let mut state = self.slot.state.lock().expect("input slot lock");
        if matches!(*state, InputState::Pending) {
            *state = InputState::Ready(value);
        }
    }

    /// Whether the requesting side gave up.
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.slot.state.lock().expect("input slot lock"), InputState::Cancelled)
    }
}

/// Creates a connected promise/future pair.
pub fn input_channel() -> (InputPromise, InputFuture) {
    let slot = Arc::new(InputSlot {
        state: Mutex::new(InputState::Pending),
    });
    (
        InputPromise { slot: Arc::clone(&slot) },
        InputFuture { slot },
    )
}

/// Creates a future that is already cancelled; the default answer of an
/// interface without prompt support.
pub fn cancelled_input() -> InputFuture {
    let (_, future) = input_channel();
    future.cancel();
    future
}

/// The engine's view of the operator.
///
/// All methods default to no-ops so implementations override only what
/// they render. `update_instruction_status`, `variable_updated` and `log`
/// must tolerate calls from the tick thread and the workspace dispatcher
/// thread; prompts arrive on the tick thread only.
pub trait UserInterface: Send + Sync {
    /// Called on every instruction status transition, from the tick thread.
    fn update_instruction_status(&self, _instruction: &InstructionView<'_>, _status: ExecutionStatus) {}

    /// Called from the workspace dispatcher when a variable changes.
    fn variable_updated(&self, _name: &str, _value: &Value, _connected: bool) {}

    /// One-way operator-visible message.
    fn message(&self, _text: &str) {}

    /// Leveled log line from a `Log` instruction or a tick-time failure.
    fn log(&self, _severity: Severity, _text: &str) {}

    /// Issues a prompt and returns the pending reply. The default refuses
    /// by handing back an already-cancelled future.
    fn request_input(&self, _request: InputRequest) -> InputFuture {
        cancelled_input()
    }
}

/// No-op interface for headless runs and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentUserInterface;

impl UserInterface for SilentUserInterface {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn future_completes_after_fulfillment() {
        let (promise, future) = input_channel();
        assert!(!future.is_ready());
        promise.fulfill(json!(3));
        assert!(future.is_ready());
        assert_eq!(future.get().expect("ready"), json!(3));
    }

    #[test]
    fn cancellation_wins_over_late_fulfillment() {
        let (promise, future) = input_channel();
        future.cancel();
        promise.fulfill(json!(3));
        assert!(promise.is_cancelled());
        assert!(future.get().is_err());
    }

    #[test]
    fn default_interface_refuses_prompts() {
        let ui = SilentUserInterface;
        let future = ui.request_input(InputRequest::Value {
            description: "value?".to_string(),
        });
        assert!(future.is_ready());
        assert!(future.get().is_err());
    }
}
