//! Operator-facing instructions. Prompts go through the asynchronous
//! input future of the user-interface contract and are polled at tick
//! boundaries; a tick never blocks on the operator.

use std::str::FromStr;

use proctree_types::{EngineError, ExecutionStatus, Severity};

use crate::attribute::{AttributeCategory, AttributeDefinition};
use crate::ui::{InputFuture, InputRequest};
use crate::value;

use super::{Behavior, Instruction, Scope, SetupScope};

fn request_with_cancellation(scope: &mut Scope<'_, '_>, request: InputRequest) -> InputFuture {
    let future = scope.ui().request_input(request);
    let cancel_handle = future.clone();
    scope
        .halt_signal()
        .register_canceller(Box::new(move || cancel_handle.cancel()));
    future
}

/// Asks the operator for a value and stores the reply in `outputVar`.
#[derive(Debug, Default)]
pub struct Input {
    pending: Option<InputFuture>,
}

impl Behavior for Input {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![
            AttributeDefinition::new("outputVar")
                .with_category(AttributeCategory::VariableName)
                .mandatory(),
            AttributeDefinition::new("description"),
        ]
    }

    fn on_init(&mut self, scope: &mut Scope<'_, '_>) -> bool {
        let description = scope.attr_raw("description").unwrap_or("enter a value").to_string();
        self.pending = Some(request_with_cancellation(scope, InputRequest::Value { description }));
        true
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        let Some(future) = &self.pending else {
            return scope.fail("no pending input request");
        };
        if !future.is_ready() {
            return ExecutionStatus::Running;
        }
        let reply = match future.get() {
            Ok(reply) => reply,
            Err(error) => return scope.fail(error),
        };
        let Some(reference) = scope.attr_raw("outputVar").map(str::to_string) else {
            return scope.fail("missing outputVar attribute");
        };
        if scope.write_reference(&reference, reply) {
            ExecutionStatus::Success
        } else {
            scope.fail(format!("cannot write '{reference}'"))
        }
    }

    fn on_reset(&mut self) {
        if let Some(future) = self.pending.take() {
            future.cancel();
        }
    }
}

/// Shows a workspace value to the operator.
#[derive(Debug, Default)]
pub struct Output;

impl Behavior for Output {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![
            AttributeDefinition::new("varName")
                .with_category(AttributeCategory::VariableName)
                .mandatory(),
            AttributeDefinition::new("description"),
        ]
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        let current = match scope.attr_value("varName") {
            Ok(Some(current)) => current,
            _ => return scope.fail("cannot read varName"),
        };
        let rendered = value::format_value(&current);
        match scope.attr_raw("description") {
            Some(description) => scope.ui().message(&format!("{description}: {rendered}")),
            None => scope.ui().message(&rendered),
        }
        ExecutionStatus::Success
    }
}

/// Sends a fixed text to the operator.
#[derive(Debug, Default)]
pub struct Message;

impl Behavior for Message {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![AttributeDefinition::new("text").mandatory()]
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        let Some(text) = scope.attr_raw("text") else {
            return scope.fail("missing text attribute");
        };
        scope.ui().message(text);
        ExecutionStatus::Success
    }
}

/// Emits a leveled log line through the user interface. The severity
/// name is validated at setup; `@var` messages read from the workspace.
#[derive(Debug, Default)]
pub struct Log {
    severity: Severity,
}

impl Behavior for Log {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![
            AttributeDefinition::new("message")
                .with_category(AttributeCategory::Both)
                .mandatory(),
            AttributeDefinition::new("severity"),
        ]
    }

    fn on_setup(&mut self, scope: &SetupScope<'_>) -> Result<(), EngineError> {
        self.severity = match scope.attributes.get("severity") {
            Some(raw) => Severity::from_str(raw)
                .map_err(|unknown| EngineError::attribute("severity", unknown.to_string()))?,
            None => Severity::Info,
        };
        Ok(())
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        let message = match scope.attr_value("message") {
            Ok(Some(message)) => value::format_value(&message),
            _ => return scope.fail("cannot resolve message attribute"),
        };
        scope.ui().log(self.severity, &message);
        ExecutionStatus::Success
    }
}

/// Asks the operator to confirm; rejection and cancellation fail.
#[derive(Debug, Default)]
pub struct UserConfirmation {
    pending: Option<InputFuture>,
}

impl Behavior for UserConfirmation {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![
            AttributeDefinition::new("description").mandatory(),
            AttributeDefinition::new("okText"),
            AttributeDefinition::new("cancelText"),
        ]
    }

    fn on_init(&mut self, scope: &mut Scope<'_, '_>) -> bool {
        let request = InputRequest::Confirmation {
            description: scope.attr_raw("description").unwrap_or("confirm").to_string(),
            ok_text: scope.attr_raw("okText").unwrap_or("Ok").to_string(),
            cancel_text: scope.attr_raw("cancelText").unwrap_or("Cancel").to_string(),
        };
        self.pending = Some(request_with_cancellation(scope, request));
        true
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        let Some(future) = &self.pending else {
            return scope.fail("no pending confirmation");
        };
        if !future.is_ready() {
            return ExecutionStatus::Running;
        }
        let reply = match future.get() {
            Ok(reply) => reply,
            Err(error) => return scope.fail(error),
        };
        match value::as_bool(&reply) {
            Ok(true) => ExecutionStatus::Success,
            Ok(false) => scope.fail(EngineError::UserRejection("confirmation declined".to_string())),
            Err(error) => scope.fail(error),
        }
    }

    fn on_reset(&mut self) {
        if let Some(future) = self.pending.take() {
            future.cancel();
        }
    }
}

/// Lets the operator pick one child by index, then adopts that child's
/// outcome. An out-of-range reply fails.
#[derive(Debug, Default)]
pub struct UserChoice {
    pending: Option<InputFuture>,
    chosen: Option<usize>,
}

impl Behavior for UserChoice {
    fn definitions(&self) -> Vec<AttributeDefinition> {
        vec![AttributeDefinition::new("description")]
    }

    fn on_init(&mut self, scope: &mut Scope<'_, '_>) -> bool {
        let options = scope
            .children
            .iter()
            .map(|child| child.view().display_name().to_string())
            .collect();
        let request = InputRequest::Choice {
            description: scope.attr_raw("description").unwrap_or("choose a branch").to_string(),
            options,
        };
        self.pending = Some(request_with_cancellation(scope, request));
        self.chosen = None;
        true
    }

    fn on_tick(&mut self, scope: &mut Scope<'_, '_>) -> ExecutionStatus {
        if self.chosen.is_none() {
            let Some(future) = &self.pending else {
                return scope.fail("no pending choice");
            };
            if !future.is_ready() {
                return ExecutionStatus::Running;
            }
            let reply = match future.get() {
                Ok(reply) => reply,
                Err(error) => return scope.fail(error),
            };
            let Some(index) = value::as_u64(&reply).map(|wide| wide as usize) else {
                return scope.fail("choice reply is not an index");
            };
            if index >= scope.children.len() {
                return scope.fail(EngineError::OutOfRange {
                    index,
                    count: scope.children.len(),
                });
            }
            self.chosen = Some(index);
        }
        let index = self.chosen.expect("choice resolved above");
        scope.tick_child(index)
    }

    fn on_reset(&mut self) {
        if let Some(future) = self.pending.take() {
            future.cancel();
        }
        self.chosen = None;
    }
}

/// Builds an `Input` node.
pub fn input() -> Instruction {
    Instruction::new("Input", Box::<Input>::default())
}

/// Builds an `Output` node.
pub fn output() -> Instruction {
    Instruction::new("Output", Box::new(Output))
}

/// Builds a `Message` node.
pub fn message() -> Instruction {
    Instruction::new("Message", Box::new(Message))
}

/// Builds a `Log` node.
pub fn log() -> Instruction {
    Instruction::new("Log", Box::<Log>::default())
}

/// Builds a `UserConfirmation` node.
pub fn user_confirmation() -> Instruction {
    Instruction::new("UserConfirmation", Box::<UserConfirmation>::default())
}

/// Builds a `UserChoice` node.
pub fn user_choice() -> Instruction {
    Instruction::new("UserChoice", Box::<UserChoice>::default())
}

#[cfg(test)]
mod tests {
    use super::super::testing::{recording_ui, tick_ctx, ScriptedUi, StubBehavior};
    use super::*;
    use crate::instruction::TickCtx;
    use crate::variable::{LocalVariable, Variable as _};
    use crate::workspace::Workspace;
    use proctree_types::ExecutionStatus::{Failure, Running, Success};
    use serde_json::json;

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

    fn stub(status: ExecutionStatus) -> Instruction {
        Instruction::new("Stub", Box::new(StubBehavior::fixed(status)))
    }

    #[test]
    fn input_waits_for_the_reply_then_writes() {
        let workspace = workspace_with(&[("target", "uint32", "0")]);
        let ui = ScriptedUi::new(vec![]);
        let ctx = TickCtx { ui: &ui, workspace: &workspace };

        let mut node = input().with_attribute("outputVar", "target");
        assert_eq!(node.tick(&ctx), Running);
        assert!(ui.fulfill_next(json!(17)));
        assert_eq!(node.tick(&ctx), Success);
        assert_eq!(workspace.get_value("target", ""), Some(json!(17)));
    }

    #[test]
    fn input_fails_when_halted_mid_prompt() {
        let workspace = workspace_with(&[("target", "uint32", "0")]);
        let ui = ScriptedUi::new(vec![]);
        let ctx = TickCtx { ui: &ui, workspace: &workspace };

        let mut node = input().with_attribute("outputVar", "target");
        assert_eq!(node.tick(&ctx), Running);
        node.halt();
        assert_eq!(node.tick(&ctx), Failure);
    }

    #[test]
    fn output_formats_value_with_description() {
        let workspace = workspace_with(&[("pressure", "float64", "2.5")]);
        let (ui, _) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = output()
            .with_attribute("varName", "pressure")
            .with_attribute("description", "pressure");
        assert_eq!(node.tick(&ctx), Success);
    }

    #[test]
    fn log_validates_severity_at_setup() {
        let workspace = Workspace::new();
        let mut node = log()
            .with_attribute("message", "hello")
            .with_attribute("severity", "loud");
        assert!(node.setup(&workspace).is_err());

        let mut node = log()
            .with_attribute("message", "hello")
            .with_attribute("severity", "warning");
        assert!(node.setup(&workspace).is_ok());
    }

    #[test]
    fn log_emits_through_the_interface() {
        let workspace = workspace_with(&[("state", "string", "armed")]);
        let (ui, events) = recording_ui();
        let ctx = tick_ctx(&ui, &workspace);
        let mut node = log()
            .with_attribute("message", "@state")
            .with_attribute("severity", "notice");
        node.setup(&workspace).expect("setup");
        assert_eq!(node.tick(&ctx), Success);
        assert_eq!(events.log_lines(), vec![(Severity::Notice, "armed".to_string())]);
    }

    #[test]
    fn confirmation_accepts_and_rejects() {
        let workspace = Workspace::new();
        let ui = ScriptedUi::new(vec![json!(true)]);
        let ctx = TickCtx { ui: &ui, workspace: &workspace };
        let mut node = user_confirmation().with_attribute("description", "go?");
        assert_eq!(node.tick(&ctx), Success);

        let ui = ScriptedUi::new(vec![json!(false)]);
        let ctx = TickCtx { ui: &ui, workspace: &workspace };
        let mut node = user_confirmation().with_attribute("description", "go?");
        assert_eq!(node.tick(&ctx), Failure);
    }

    #[test]
    fn user_choice_runs_the_picked_child() {
        let workspace = Workspace::new();
        let ui = ScriptedUi::new(vec![json!(1)]);
        let ctx = TickCtx { ui: &ui, workspace: &workspace };
        let mut node = user_choice()
            .with_child(stub(Failure))
            .with_child(stub(Success));
        assert_eq!(node.tick(&ctx), Success);
        assert_eq!(node.children()[0].status(), ExecutionStatus::NotStarted);
        assert_eq!(ui.request_count(), 1);
    }

    #[test]
    fn user_choice_rejects_out_of_range_replies() {
        let workspace = Workspace::new();
        let ui = ScriptedUi::new(vec![json!(5)]);
        let ctx = TickCtx { ui: &ui, workspace: &workspace };
        let mut node = user_choice().with_child(stub(Success));
        assert_eq!(node.tick(&ctx), Failure);
    }
}
