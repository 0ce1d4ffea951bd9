//! End-to-end scenarios driven through the runner, exercising compound
//! semantics, workspace-change-driven re-evaluation, and timeouts against
//! wall-clock expectations.

use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use proctree_engine::instruction::{compound, decorator, reactive, timing, variable_ops};
use proctree_engine::ui::{cancelled_input, InputFuture, InputRequest};
use proctree_engine::{
    ExecutionStatus, Instruction, InstructionId, InstructionView, LocalVariable, Procedure, RunOutcome, Runner,
    UserInterface, Variable,
};
use serde_json::Value;

/// Records every status transition and counts prompts.
#[derive(Default)]
struct ObserverUi {
    transitions: Mutex<Vec<(InstructionId, ExecutionStatus)>>,
    prompts: Mutex<usize>,
}

impl ObserverUi {
    fn transitions_of(&self, id: InstructionId) -> Vec<ExecutionStatus> {
        self.transitions
            .lock()
            .expect("transition lock")
            .iter()
            .filter(|(seen, _)| *seen == id)
            .map(|(_, status)| *status)
            .collect()
    }

    fn prompt_count(&self) -> usize {
        *self.prompts.lock().expect("prompt lock")
    }
}

impl UserInterface for ObserverUi {
    fn update_instruction_status(&self, instruction: &InstructionView<'_>, status: ExecutionStatus) {
        self.transitions
            .lock()
            .expect("transition lock")
            .push((instruction.id, status));
    }

    fn request_input(&self, _request: InputRequest) -> InputFuture {
        *self.prompts.lock().expect("prompt lock") += 1;
        cancelled_input()
    }
}

fn local(type_name: &str, literal: &str) -> Box<dyn Variable> {
    let mut variable = LocalVariable::new();
    variable.add_attribute("type", type_name);
    variable.add_attribute("value", literal);
    Box::new(variable)
}

fn procedure_with(variables: &[(&str, &str, &str)], root: Instruction) -> Procedure {
    let mut procedure = Procedure::new();
    for (name, type_name, literal) in variables {
        procedure
            .add_variable(*name, local(type_name, literal))
            .expect("unique variable name");
    }
    procedure.add_instruction(root.with_root());
    procedure
}

fn equals(left: &str, right: &str) -> Instruction {
    variable_ops::equals()
        .with_attribute("leftVar", left)
        .with_attribute("rightVar", right)
}

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn run(ui: Arc<ObserverUi>, procedure: Procedure) -> (RunOutcome, Duration) {
    init_tracing();
    let mut runner = Runner::new(ui).with_backoff(Duration::from_millis(5));
    runner.set_procedure(procedure).expect("procedure installs");
    let started = Instant::now();
    let outcome = runner.execute_procedure().expect("procedure runs");
    (outcome, started.elapsed())
}

#[test]
fn sequence_with_inverted_third_child_fails() {
    let first = timing::wait_for(0.0);
    let second = timing::wait_for(0.0);
    let third = decorator::inverter().with_child(timing::wait_for(0.0));
    let (first_id, second_id, third_id) = (first.id(), second.id(), third.id());

    let root = compound::sequence().with_child(first).with_child(second).with_child(third);

    let ui = Arc::new(ObserverUi::default());
    let (outcome, _) = run(Arc::clone(&ui), procedure_with(&[], root));

    assert_eq!(outcome, RunOutcome::Finished(ExecutionStatus::Failure));
    for id in [first_id, second_id] {
        assert_eq!(
            ui.transitions_of(id),
            vec![ExecutionStatus::NotFinished, ExecutionStatus::Success]
        );
    }
    assert_eq!(ui.transitions_of(third_id).last(), Some(&ExecutionStatus::Failure));
}

#[test]
fn fallback_short_circuits_before_the_slow_branch() {
    let slow = timing::wait_for(3.0);
    let slow_id = slow.id();
    let root = compound::fallback()
        .with_child(decorator::inverter().with_child(timing::wait_for(0.0)))
        .with_child(timing::wait_for(0.0))
        .with_child(slow);

    let ui = Arc::new(ObserverUi::default());
    let (outcome, elapsed) = run(Arc::clone(&ui), procedure_with(&[], root));

    assert_eq!(outcome, RunOutcome::Finished(ExecutionStatus::Success));
    assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
    assert!(ui.transitions_of(slow_id).is_empty(), "third child was ticked");
}

#[test]
fn parallel_success_threshold_finishes_early_and_halts_stragglers() {
    let straggler = timing::wait_for(3.0);
    let straggler_id = straggler.id();
    let root = compound::parallel_sequence()
        .with_attribute("successThreshold", "2")
        .with_child(timing::wait_for(0.10))
        .with_child(timing::wait_for(0.20))
        .with_child(straggler);

    let ui = Arc::new(ObserverUi::default());
    let (outcome, elapsed) = run(Arc::clone(&ui), procedure_with(&[], root));

    assert_eq!(outcome, RunOutcome::Finished(ExecutionStatus::Success));
    assert!(elapsed >= Duration::from_millis(190), "took {elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
    assert!(
        !ui.transitions_of(straggler_id).contains(&ExecutionStatus::Success),
        "straggler should have been halted, not completed"
    );
}

#[test]
fn choice_executes_the_indexed_children() {
    let children: Vec<Instruction> = (0..3).map(|_| timing::wait_for(0.0)).collect();
    let never = decorator::inverter().with_child(timing::wait_for(0.0));
    let never_id = never.id();
    let child_ids: Vec<InstructionId> = children.iter().map(Instruction::id).collect();

    let mut root = compound::choice().with_attribute("varName", "choice");
    for child in children {
        root.add_child(child);
    }
    root.add_child(never);

    let ui = Arc::new(ObserverUi::default());
    let (outcome, _) = run(
        Arc::clone(&ui),
        procedure_with(&[("choice", "array", "[1,0,2]")], root),
    );

    assert_eq!(outcome, RunOutcome::Finished(ExecutionStatus::Success));
    for id in child_ids {
        let successes = ui
            .transitions_of(id)
            .iter()
            .filter(|status| **status == ExecutionStatus::Success)
            .count();
        assert_eq!(successes, 1);
    }
    assert!(ui.transitions_of(never_id).is_empty(), "unselected child was ticked");
}

#[test]
fn listen_drives_reevaluation_through_the_tree() {
    let listen = reactive::listen()
        .with_attribute("varNames", "monitor")
        .with_child(decorator::inverter().with_child(equals("monitor", "update")));
    let copy = compound::sequence().with_child(
        variable_ops::copy()
            .with_attribute("inputVar", "update")
            .with_attribute("outputVar", "monitor"),
    );
    let guard = decorator::inverter().with_child(timing::wait_for(2.0));

    let root = compound::fallback()
        .with_child(
            compound::parallel_sequence()
                .with_child(listen)
                .with_child(copy)
                .with_child(guard),
        )
        .with_child(equals("monitor", "update"));

    let ui = Arc::new(ObserverUi::default());
    let (outcome, elapsed) = run(
        Arc::clone(&ui),
        procedure_with(
            &[("monitor", "uint32", "0"), ("update", "uint32", "1729")],
            root,
        ),
    );

    assert_eq!(outcome, RunOutcome::Finished(ExecutionStatus::Success));
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
}

#[test]
fn execute_while_condition_holds_for_the_full_action() {
    let root = reactive::execute_while()
        .with_attribute("varNames", "live")
        .with_child(timing::wait_for(1.0))
        .with_child(equals("live", "zero"));

    let ui = Arc::new(ObserverUi::default());
    let (outcome, elapsed) = run(
        Arc::clone(&ui),
        procedure_with(&[("live", "uint32", "0"), ("zero", "uint32", "0")], root),
    );

    assert_eq!(outcome, RunOutcome::Finished(ExecutionStatus::Success));
    assert!(elapsed >= Duration::from_millis(900), "took {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
}

#[test]
fn wait_for_condition_times_out_without_prompting() {
    let root = reactive::wait_for_condition()
        .with_attribute("varNames", "live")
        .with_attribute("timeout", "2.0")
        .with_child(equals("live", "one"));

    let ui = Arc::new(ObserverUi::default());
    let (outcome, elapsed) = run(
        Arc::clone(&ui),
        procedure_with(&[("live", "uint32", "0"), ("one", "uint32", "1")], root),
    );

    assert_eq!(outcome, RunOutcome::Finished(ExecutionStatus::Failure));
    assert!(elapsed >= Duration::from_millis(1800), "took {elapsed:?}");
    assert!(elapsed < Duration::from_millis(3500), "took {elapsed:?}");
    assert_eq!(ui.prompt_count(), 0);
}

#[test]
fn repeat_runs_exactly_the_requested_cycles() {
    let root = decorator::repeat()
        .with_attribute("maxCount", "4")
        .with_child(
            variable_ops::increment().with_attribute("varName", "counter"),
        );

    let ui = Arc::new(ObserverUi::default());
    let mut runner = Runner::new(Arc::clone(&ui) as Arc<dyn UserInterface>);
    let procedure = procedure_with(&[("counter", "int64", "0")], root);
    runner.set_procedure(procedure).expect("procedure installs");
    let outcome = runner.execute_procedure().expect("procedure runs");

    assert_eq!(outcome, RunOutcome::Finished(ExecutionStatus::Success));
    let counter = runner
        .procedure()
        .expect("procedure present")
        .workspace()
        .get_value("counter", "");
    assert_eq!(counter, Some(Value::from(4)));
}
