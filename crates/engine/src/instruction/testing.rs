//! Shared test doubles for instruction and runner tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use proctree_types::{ExecutionStatus, InstructionId, Severity};
use serde_json::Value;

use crate::ui::{input_channel, InputFuture, InputPromise, InputRequest, InstructionView, UserInterface};
use crate::workspace::Workspace;

use super::{Behavior, Scope, TickCtx};

/// Shared, thread-safe record of observer notifications.
#[derive(Clone, Default)]
pub(crate) struct EventLog {
    events: Arc<Mutex<Vec<(InstructionId, ExecutionStatus)>>>,
    logs: Arc<Mutex<Vec<(Severity, String)>>>,
}

impl EventLog {
    pub(crate) fn statuses_of(&self, id: InstructionId) -> Vec<ExecutionStatus> {
        self.events
            .lock()
            .expect("event log lock")
            .iter()
            .filter(|(event_id, _)| *event_id == id)
            .map(|(_, status)| *status)
            .collect()
    }

    pub(crate) fn all(&self) -> Vec<(InstructionId, ExecutionStatus)> {
        self.events.lock().expect("event log lock").clone()
    }

    pub(crate) fn log_lines(&self) -> Vec<(Severity, String)> {
        self.logs.lock().expect("log line lock").clone()
    }
}

/// User interface that records every notification it receives.
pub(crate) struct RecordingUi {
    events: EventLog,
}

impl UserInterface for RecordingUi {
    fn update_instruction_status(&self, instruction: &InstructionView<'_>, status: ExecutionStatus) {
        self.events
            .events
            .lock()
            .expect("event log lock")
            .push((instruction.id, status));
    }

    fn log(&self, severity: Severity, text: &str) {
        self.events
            .logs
            .lock()
            .expect("log line lock")
            .push((severity, text.to_string()));
    }
}

pub(crate) fn recording_ui() -> (RecordingUi, EventLog) {
    let events = EventLog::default();
    (RecordingUi { events: events.clone() }, events)
}

pub(crate) fn tick_ctx<'a>(ui: &'a RecordingUi, workspace: &'a Workspace) -> TickCtx<'a> {
    TickCtx { ui, workspace }
}

/// Interface with scripted prompt replies. Replies queued up front are
/// served immediately; otherwise the promise is parked for the test to
/// fulfil later through `fulfill_next`.
pub(crate) struct ScriptedUi {
    pub(crate) events: EventLog,
    replies: Mutex<VecDeque<Value>>,
    parked: Mutex<Vec<InputPromise>>,
    requests: Mutex<Vec<InputRequest>>,
}

impl ScriptedUi {
    pub(crate) fn new(replies: Vec<Value>) -> Self {
        Self {
            events: EventLog::default(),
            replies: Mutex::new(replies.into()),
            parked: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answers the oldest still-pending prompt.
    pub(crate) fn fulfill_next(&self, value: Value) -> bool {
        let mut parked = self.parked.lock().expect("parked promises lock");
        if parked.is_empty() {
            return false;
        }
        parked.remove(0).fulfill(value);
        true
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().expect("request lock").len()
    }
}

impl UserInterface for ScriptedUi {
    fn update_instruction_status(&self, instruction: &InstructionView<'_>, status: ExecutionStatus) {
        self.events
            .events
            .lock()
            .expect("event log lock")
            .push((instruction.id, status));
    }

    fn log(&self, severity: Severity, text: &str) {
        self.events
            .logs
            .lock()
            .expect("log line lock")
            .push((severity, text.to_string()));
    }

    fn request_input(&self, request: InputRequest) -> InputFuture {
        self.requests.lock().expect("request lock").push(request);
        let (promise, future) = input_channel();
        let mut replies = self.replies.lock().expect("reply lock");
        match replies.pop_front() {
            Some(reply) => promise.fulfill(reply),
            None => self.parked.lock().expect("parked promises lock").push(promise),
        }
        future
    }
}

enum StubMode {
    Fixed(ExecutionStatus),
    Sequence(VecDeque<ExecutionStatus>),
    FailInit,
}

/// Minimal behavior with scripted outcomes, for exercising the node
/// life-cycle itself.
pub(crate) struct StubBehavior {
    mode: StubMode,
    ticks: Arc<AtomicUsize>,
}

impl StubBehavior {
    pub(crate) fn fixed(status: ExecutionStatus) -> Self {
        Self {
            mode: StubMode::Fixed(status),
            ticks: Arc::default(),
        }
    }

    pub(crate) fn counted(status: ExecutionStatus) -> (Box<dyn Behavior>, Arc<AtomicUsize>) {
        let stub = Self::fixed(status);
        let ticks = Arc::clone(&stub.ticks);
        (Box::new(stub), ticks)
    }

    pub(crate) fn sequence(statuses: Vec<ExecutionStatus>) -> Self {
        Self {
            mode: StubMode::Sequence(statuses.into()),
            ticks: Arc::default(),
        }
    }

    pub(crate) fn failing_init() -> Self {
        Self {
            mode: StubMode::FailInit,
            ticks: Arc::default(),
        }
    }
}

impl Behavior for StubBehavior {
    fn on_init(&mut self, _scope: &mut Scope<'_, '_>) -> bool {
        !matches!(self.mode, StubMode::FailInit)
    }

    fn on_tick(&mut self, _scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        match &mut self.mode {
            StubMode::Fixed(status) => *status,
            StubMode::Sequence(statuses) => statuses.pop_front().unwrap_or(ExecutionStatus::Success),
            StubMode::FailInit => ExecutionStatus::Failure,
        }
    }
}
