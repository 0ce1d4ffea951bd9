//! Process-wide registries mapping type names to factories.
//!
//! Both maps are pre-populated with the built-in instruction and variable
//! types and accept further registrations during plugin load at startup.
//! Lookups are read-only and thread-safe; steady-state reads share the
//! lock uncontended.

use std::collections::HashMap;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use proctree_types::EngineError;
use tracing::debug;

use crate::instruction::{compound, decorator, interaction, reactive, timing, variable_ops, Instruction};
use crate::variable::{LocalVariable, Variable};

/// Factory for an instruction node of a registered type.
pub type InstructionFactory = fn() -> Instruction;

/// Factory for a variable of a registered type.
pub type VariableFactory = fn() -> Box<dyn Variable>;

static INSTRUCTIONS: Lazy<RwLock<HashMap<String, InstructionFactory>>> =
    Lazy::new(|| RwLock::new(builtin_instructions()));

static VARIABLES: Lazy<RwLock<HashMap<String, VariableFactory>>> = Lazy::new(|| RwLock::new(builtin_variables()));

fn builtin_instructions() -> HashMap<String, InstructionFactory> {
    let entries: [(&str, InstructionFactory); 40] = [
        ("Sequence", compound::sequence),
        ("Fallback", compound::fallback),
        ("ReactiveSequence", compound::reactive_sequence),
        ("ReactiveFallback", compound::reactive_fallback),
        ("ParallelSequence", compound::parallel_sequence),
        ("Choice", compound::choice),
        ("Inverter", decorator::inverter),
        ("ForceSuccess", decorator::force_success),
        ("Repeat", decorator::repeat),
        ("For", decorator::for_each),
        ("Include", decorator::include),
        ("IncludeProcedure", decorator::include_procedure),
        ("Condition", variable_ops::condition),
        ("Equals", variable_ops::equals),
        ("GreaterThan", variable_ops::greater_than),
        ("GreaterThanOrEqual", variable_ops::greater_than_or_equal),
        ("LessThan", variable_ops::less_than),
        ("LessThanOrEqual", variable_ops::less_than_or_equal),
        ("Copy", variable_ops::copy),
        ("ResetVariable", variable_ops::reset_variable),
        ("Increment", variable_ops::increment),
        ("Decrement", variable_ops::decrement),
        ("AddElement", variable_ops::add_element),
        ("AddMember", variable_ops::add_member),
        ("VarExists", variable_ops::var_exists),
        ("Input", interaction::input),
        ("Output", interaction::output),
        ("Message", interaction::message),
        ("Log", interaction::log),
        ("UserConfirmation", interaction::user_confirmation),
        ("UserChoice", interaction::user_choice),
        ("Wait", timing::wait),
        ("WaitForVariable", timing::wait_for_variable),
        ("WaitForVariables", timing::wait_for_variables),
        ("Listen", reactive::listen),
        ("AchieveCondition", reactive::achieve_condition),
        ("AchieveConditionWithOverride", reactive::achieve_condition_with_override),
        ("AchieveConditionWithTimeout", reactive::achieve_condition_with_timeout),
        ("ExecuteWhile", reactive::execute_while),
        ("WaitForCondition", reactive::wait_for_condition),
    ];
    entries
        .into_iter()
        .map(|(name, factory)| (name.to_string(), factory))
        .collect()
}

// I/O-backed variable types (file, network, CA/PVA) are host collaborators
// and arrive through `register_variable` during plugin load.
fn builtin_variables() -> HashMap<String, VariableFactory> {
    let local: VariableFactory = || Box::new(LocalVariable::new());
    HashMap::from([(LocalVariable::TYPE_NAME.to_string(), local)])
}

/// Registers an instruction factory; re-registration is rejected.
pub fn register_instruction(name: impl Into<String>, factory: InstructionFactory) -> Result<(), EngineError> {
    let name = name.into();
    let mut instructions = INSTRUCTIONS.write().expect("instruction registry lock");
    if instructions.contains_key(&name) {
        return Err(EngineError::DuplicateName(name));
    }
    debug!(instruction = %name, "instruction type registered");
    instructions.insert(name, factory);
    Ok(())
}

/// Creates an instruction node by registered type name.
pub fn create_instruction(name: &str) -> Option<Instruction> {
    let factory = *INSTRUCTIONS.read().expect("instruction registry lock").get(name)?;
    Some(factory())
}

/// Known instruction type names, sorted.
pub fn instruction_names() -> Vec<String> {
    let mut names: Vec<String> = INSTRUCTIONS
        .read()
        .expect("instruction registry lock")
        .keys()
        .cloned()
        .collect();
    names.sort();
    names
}

/// Registers a variable factory; re-registration is rejected.
pub fn register_variable(name: impl Into<String>, factory: VariableFactory) -> Result<(), EngineError> {
    let name = name.into();
    let mut variables = VARIABLES.write().expect("variable registry lock");
    if variables.contains_key(&name) {
        return Err(EngineError::DuplicateName(name));
    }
    debug!(variable = %name, "variable type registered");
    variables.insert(name, factory);
    Ok(())
}

/// Creates a variable by registered type name.
pub fn create_variable(name: &str) -> Option<Box<dyn Variable>> {
    let factory = *VARIABLES.read().expect("variable registry lock").get(name)?;
    Some(factory())
}

/// Known variable type names, sorted.
pub fn variable_names() -> Vec<String> {
    let mut names: Vec<String> = VARIABLES.read().expect("variable registry lock").keys().cloned().collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_available() {
        for name in [
            "Sequence",
            "Fallback",
            "ParallelSequence",
            "Choice",
            "Inverter",
            "Repeat",
            "Wait",
            "Listen",
            "AchieveCondition",
            "WaitForCondition",
        ] {
            let node = create_instruction(name).unwrap_or_else(|| panic!("missing builtin '{name}'"));
            assert_eq!(node.type_name(), name);
        }
        assert!(create_variable("Local").is_some());
    }

    #[test]
    fn unknown_names_yield_none() {
        assert!(create_instruction("Teleport").is_none());
        assert!(create_variable("Quantum").is_none());
        // Host-supplied backends are absent until the host registers them.
        assert!(create_variable("File").is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let error = register_instruction("Sequence", compound::sequence).expect_err("duplicate");
        assert!(matches!(error, EngineError::DuplicateName(_)));
        let local: VariableFactory = || Box::new(LocalVariable::new());
        let error = register_variable("Local", local).expect_err("duplicate");
        assert!(matches!(error, EngineError::DuplicateName(_)));
    }

    #[test]
    fn custom_registration_round_trips() {
        register_instruction("SequenceAlias", compound::sequence).expect("fresh name");
        let node = create_instruction("SequenceAlias").expect("alias resolves");
        assert_eq!(node.type_name(), "Sequence");
        assert!(instruction_names().contains(&"SequenceAlias".to_string()));
    }
}
