//! Procedure container: top-level instruction trees, the workspace, the
//! preamble, and the serde document model procedure files use.
//!
//! Include references are resolved here during setup: the referenced
//! subtree's spec is re-instantiated through the registry as the include
//! node's child, with a resolution stack rejecting cycles before anything
//! is built.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use proctree_types::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::instruction::Instruction;
use crate::registry;
use crate::ui::UserInterface;
use crate::variable::Variable;
use crate::workspace::{SubscriptionHandle, Workspace};

/// Serialized form of one instruction node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionSpec {
    /// Registered instruction type name (the XML element name).
    #[serde(rename = "type")]
    pub type_name: String,
    /// Optional human label; include references resolve against it.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "isRoot")]
    pub is_root: bool,
    #[serde(default)]
    pub attributes: IndexMap<String, String>,
    #[serde(default)]
    pub children: Vec<InstructionSpec>,
}

impl InstructionSpec {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: None,
            is_root: false,
            attributes: IndexMap::new(),
            children: Vec::new(),
        }
    }

    /// Instantiates this spec (and its children) through the registry.
    pub fn build(&self) -> Result<Instruction, EngineError> {
        let mut node = registry::create_instruction(&self.type_name).ok_or_else(|| {
            EngineError::attribute("type", format!("unknown instruction type '{}'", self.type_name))
        })?;
        if let Some(name) = &self.name {
            node.set_name(name.clone());
        }
        node.set_root(self.is_root);
        for (attribute, value) in &self.attributes {
            node.add_attribute(attribute.clone(), value.clone());
        }
        for child in &self.children {
            node.add_child(child.build()?);
        }
        Ok(node)
    }

    /// Snapshots a built node back into its spec form; this is how include
    /// resolution re-instantiates referenced subtrees.
    pub fn from_instruction(node: &Instruction) -> Self {
        Self {
            type_name: node.type_name().to_string(),
            name: node.name().map(str::to_string),
            is_root: node.is_root(),
            attributes: node.attributes().clone(),
            children: node.children().iter().map(Self::from_instruction).collect(),
        }
    }
}

/// Serialized form of one workspace variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableSpec {
    /// Registered variable type name: the built-in `Local`, or a
    /// host-registered backend (the `File` element of the XML syntax).
    #[serde(rename = "type")]
    pub type_name: String,
    pub name: String,
    #[serde(default)]
    pub attributes: IndexMap<String, String>,
}

impl VariableSpec {
    /// Instantiates the variable through the registry.
    pub fn build(&self) -> Result<Box<dyn Variable>, EngineError> {
        let mut variable = registry::create_variable(&self.type_name).ok_or_else(|| {
            EngineError::attribute("type", format!("unknown variable type '{}'", self.type_name))
        })?;
        for (attribute, value) in &self.attributes {
            variable.add_attribute(attribute, value);
        }
        Ok(variable)
    }
}

/// One preamble type registration: an inline descriptor or a file holding
/// one. The descriptor's `type` field names the registered type.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TypeRegistrationSpec {
    #[serde(default)]
    pub jsontype: Option<Value>,
    #[serde(default)]
    pub jsonfile: Option<String>,
}

/// Serialized procedure document, mirroring the XML shape: preamble,
/// top-level instructions, and the workspace.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProcedureSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub plugins: Vec<String>,
    #[serde(default)]
    pub types: Vec<TypeRegistrationSpec>,
    #[serde(default)]
    pub instructions: Vec<InstructionSpec>,
    #[serde(default)]
    pub workspace: Vec<VariableSpec>,
    #[serde(default)]
    pub attributes: IndexMap<String, String>,
}

/// Reads a procedure document from a JSON file.
pub fn load_procedure_file(path: impl AsRef<Path>) -> Result<ProcedureSpec> {
    let contents = fs::read_to_string(path.as_ref()).with_context(|| format!("read {}", path.as_ref().display()))?;
    let spec: ProcedureSpec = serde_json::from_str(&contents).context("parse procedure json")?;
    Ok(spec)
}

/// A runnable procedure: top-level trees plus their workspace.
pub struct Procedure {
    name: Option<String>,
    version: Option<String>,
    attributes: IndexMap<String, String>,
    plugins: Vec<String>,
    types: Vec<TypeRegistrationSpec>,
    roots: Vec<Instruction>,
    workspace: Workspace,
    ui_subscriptions: Vec<SubscriptionHandle>,
    is_set_up: bool,
}

impl Procedure {
    pub fn new() -> Self {
        Self {
            name: None,
            version: None,
            attributes: IndexMap::new(),
            plugins: Vec::new(),
            types: Vec::new(),
            roots: Vec::new(),
            workspace: Workspace::new(),
            ui_subscriptions: Vec::new(),
            is_set_up: false,
        }
    }

    /// Builds a procedure from its document form: variables and
    /// instructions are instantiated through the registry, includes stay
    /// unresolved until `setup`.
    pub fn from_spec(spec: &ProcedureSpec) -> Result<Self, EngineError> {
        let mut procedure = Self::new();
        procedure.name = spec.name.clone();
        procedure.version = spec.version.clone();
        procedure.attributes = spec.attributes.clone();
        procedure.plugins = spec.plugins.clone();
        procedure.types = spec.types.clone();
        for variable in &spec.workspace {
            procedure.workspace.add_variable(variable.name.clone(), variable.build()?)?;
        }
        for instruction in &spec.instructions {
            procedure.roots.push(instruction.build()?);
        }
        Ok(procedure)
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn attributes(&self) -> &IndexMap<String, String> {
        &self.attributes
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn workspace_mut(&mut self) -> &mut Workspace {
        &mut self.workspace
    }

    /// Adds a top-level instruction tree.
    pub fn add_instruction(&mut self, instruction: Instruction) {
        self.roots.push(instruction);
    }

    /// Adds a workspace variable.
    pub fn add_variable(&mut self, name: impl Into<String>, variable: Box<dyn Variable>) -> Result<(), EngineError> {
        self.workspace.add_variable(name, variable)
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.roots
    }

    /// The designated root: the tree marked `isRoot`, else the first
    /// top-level instruction.
    pub fn root(&self) -> Option<&Instruction> {
        self.roots
            .iter()
            .find(|instruction| instruction.is_root())
            .or_else(|| self.roots.first())
    }

    /// Split borrow for the tick loop: the mutable root tree alongside a
    /// shared view of the workspace.
    pub(crate) fn tick_parts(&mut self) -> (Option<&mut Instruction>, &Workspace) {
        let index = self
            .roots
            .iter()
            .position(|instruction| instruction.is_root())
            .unwrap_or(0);
        (self.roots.get_mut(index), &self.workspace)
    }

    pub fn is_set_up(&self) -> bool {
        self.is_set_up
    }

    /// Sets the procedure up: preamble type registrations, include
    /// resolution, workspace setup, instruction setup, and forwarding of
    /// workspace changes to the user interface. A failure tears down what
    /// was already set up and is returned to the caller.
    pub fn setup(&mut self, ui: &Arc<dyn UserInterface>) -> Result<(), EngineError> {
        let marked_roots = self.roots.iter().filter(|instruction| instruction.is_root()).count();
        if marked_roots > 1 {
            return Err(EngineError::attribute("isRoot", "more than one instruction is marked as root"));
        }

        for plugin in &self.plugins {
            // Shared-library loading belongs to the host; the preamble
            // entry is recorded for it.
            debug!(plugin = %plugin, "plugin load delegated to host");
        }
        let registrations = self.types.clone();
        for registration in &registrations {
            self.register_type(registration)?;
        }

        if let Err(error) = resolve_includes(&mut self.roots, &mut self.workspace) {
            strip_resolved_includes(&mut self.roots);
            return Err(error);
        }

        self.workspace.setup_all()?;

        for instruction in &mut self.roots {
            if let Err(error) = instruction.setup(&self.workspace) {
                self.workspace.teardown_all();
                return Err(error);
            }
        }

        for name in self.workspace.variable_names() {
            let observer = Arc::clone(ui);
            let handle = self.workspace.subscribe(
                name,
                Box::new(move |variable, value, available| {
                    observer.variable_updated(variable, value, available);
                }),
            );
            self.ui_subscriptions.push(handle);
        }

        self.is_set_up = true;
        info!(
            procedure = self.name.as_deref().unwrap_or("unnamed"),
            top_level = self.roots.len(),
            variables = self.workspace.len(),
            "procedure set up"
        );
        Ok(())
    }

    fn register_type(&mut self, registration: &TypeRegistrationSpec) -> Result<(), EngineError> {
        let descriptor = match (&registration.jsontype, &registration.jsonfile) {
            (Some(descriptor), _) => descriptor.clone(),
            (None, Some(path)) => {
                let contents = fs::read_to_string(path)
                    .map_err(|io| EngineError::attribute("jsonfile", format!("{path}: {io}")))?;
                serde_json::from_str(&contents)
                    .map_err(|parse| EngineError::attribute("jsonfile", format!("{path}: {parse}")))?
            }
            (None, None) => {
                return Err(EngineError::attribute("RegisterType", "neither jsontype nor jsonfile given"));
            }
        };
        let type_name = descriptor
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::attribute("jsontype", "descriptor has no 'type' name"))?
            .to_string();
        // A repeated setup re-registers the same preamble; only a
        // conflicting descriptor is an error.
        if self.workspace.types().lookup(&type_name) == Some(&descriptor) {
            return Ok(());
        }
        self.workspace.types_mut().register(type_name, descriptor)
    }

    /// Tears down instructions, then the workspace.
    pub fn teardown(&mut self, ui: &Arc<dyn UserInterface>) {
        for handle in self.ui_subscriptions.drain(..) {
            self.workspace.unsubscribe(handle);
        }
        for instruction in &mut self.roots {
            instruction.reset(ui.as_ref());
        }
        self.workspace.teardown_all();
        self.is_set_up = false;
    }
}

impl Default for Procedure {
    fn default() -> Self {
        Self::new()
    }
}

fn include_key(file: Option<&str>, path: &str) -> String {
    format!("{}::{}", file.unwrap_or(""), path)
}

/// Expands every `Include`/`IncludeProcedure` node under `roots` into a
/// copy of its referenced subtree, rejecting reference cycles.
fn resolve_includes(roots: &mut Vec<Instruction>, workspace: &mut Workspace) -> Result<(), EngineError> {
    let library: HashMap<String, InstructionSpec> = roots
        .iter()
        .filter_map(|instruction| {
            instruction
                .name()
                .map(|name| (name.to_string(), InstructionSpec::from_instruction(instruction)))
        })
        .collect();

    let mut stack = Vec::new();
    for instruction in roots.iter_mut() {
        expand_node(instruction, &library, workspace, &mut stack)?;
    }
    Ok(())
}

/// Undoes partial include expansion after a failed resolution, so a
/// failed setup leaves the tree in its pre-setup shape.
fn strip_resolved_includes(nodes: &mut [Instruction]) {
    for node in nodes {
        if matches!(node.type_name(), "Include" | "IncludeProcedure") {
            while !node.children().is_empty() {
                node.remove_child(0);
            }
        } else {
            strip_resolved_includes(node.children_mut());
        }
    }
}

fn expand_node(
    node: &mut Instruction,
    library: &HashMap<String, InstructionSpec>,
    workspace: &mut Workspace,
    stack: &mut Vec<String>,
) -> Result<(), EngineError> {
    match node.type_name() {
        "Include" => expand_include(node, library, workspace, stack, false),
        "IncludeProcedure" => expand_include(node, library, workspace, stack, true),
        _ => {
            for child in node.children_mut() {
                expand_node(child, library, workspace, stack)?;
            }
            Ok(())
        }
    }
}

fn expand_include(
    node: &mut Instruction,
    library: &HashMap<String, InstructionSpec>,
    workspace: &mut Workspace,
    stack: &mut Vec<String>,
    pulls_workspace: bool,
) -> Result<(), EngineError> {
    // Re-setup after a previous resolution keeps the existing child.
    if !node.children().is_empty() {
        return Ok(());
    }

    let path = node.attributes().get("path").cloned().unwrap_or_default();
    let file = node.attributes().get("file").cloned();
    if path.is_empty() && file.is_none() {
        return Err(EngineError::attribute("path", "include references nothing"));
    }

    let key = include_key(file.as_deref(), &path);
    if stack.contains(&key) {
        return Err(EngineError::CyclicInclude(if path.is_empty() {
            file.unwrap_or_default()
        } else {
            path
        }));
    }
    stack.push(key);

    let (spec, child_library) = match &file {
        Some(file_path) => {
            let external = load_procedure_file(file_path)
                .map_err(|load| EngineError::attribute("file", format!("{file_path}: {load:#}")))?;

            if pulls_workspace {
                merge_external_workspace(workspace, &external)?;
            }

            let child_library: HashMap<String, InstructionSpec> = external
                .instructions
                .iter()
                .filter_map(|spec| spec.name.clone().map(|name| (name, spec.clone())))
                .collect();
            let spec = if path.is_empty() {
                external
                    .instructions
                    .iter()
                    .find(|spec| spec.is_root)
                    .or_else(|| external.instructions.first())
                    .cloned()
                    .ok_or_else(|| EngineError::attribute("file", format!("{file_path}: no instructions")))?
            } else {
                external
                    .instructions
                    .iter()
                    .find(|spec| spec.name.as_deref() == Some(path.as_str()))
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::attribute("path", format!("no instruction named '{path}' in {file_path}"))
                    })?
            };
            (spec, Some(child_library))
        }
        None => {
            let spec = library
                .get(&path)
                .cloned()
                .ok_or_else(|| EngineError::attribute("path", format!("no top-level instruction named '{path}'")))?;
            (spec, None)
        }
    };

    let mut child = spec.build()?;
    child.set_root(false);
    expand_node(&mut child, child_library.as_ref().unwrap_or(library), workspace, stack)?;
    node.add_child(child);

    stack.pop();
    Ok(())
}

/// Adds the external procedure's variables to `workspace`, skipping names
/// the current workspace already defines.
fn merge_external_workspace(workspace: &mut Workspace, external: &ProcedureSpec) -> Result<(), EngineError> {
    for variable in &external.workspace {
        if workspace.has_variable(&variable.name) {
            debug!(variable = %variable.name, "external variable shadowed by current workspace");
            continue;
        }
        workspace.add_variable(variable.name.clone(), variable.build()?)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::SilentUserInterface;
    use serde_json::json;
    use std::path::PathBuf;

    fn silent_ui() -> Arc<dyn UserInterface> {
        Arc::new(SilentUserInterface)
    }

    fn spec_json(value: Value) -> ProcedureSpec {
        serde_json::from_value(value).expect("valid procedure spec")
    }

    fn temp_file(name: &str, contents: &Value) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("proctree-proc-{}-{}.json", std::process::id(), name));
        fs::write(&path, serde_json::to_string_pretty(contents).expect("serialize")).expect("write fixture");
        path
    }

    #[test]
    fn builds_and_sets_up_from_document() {
        let spec = spec_json(json!({
            "name": "demo",
            "version": "1.0",
            "workspace": [
                {"type": "Local", "name": "counter", "attributes": {"type": "uint32", "value": "0"}}
            ],
            "instructions": [
                {"type": "Sequence", "isRoot": true, "children": [
                    {"type": "Wait", "attributes": {"timeout": "0.0"}}
                ]}
            ]
        }));
        let mut procedure = Procedure::from_spec(&spec).expect("build");
        procedure.setup(&silent_ui()).expect("setup");
        assert!(procedure.is_set_up());
        assert_eq!(procedure.workspace().get_value("counter", ""), Some(json!(0)));
        assert_eq!(procedure.root().expect("root").type_name(), "Sequence");
    }

    #[test]
    fn rejects_multiple_marked_roots() {
        let spec = spec_json(json!({
            "instructions": [
                {"type": "Wait", "isRoot": true},
                {"type": "Wait", "isRoot": true}
            ]
        }));
        let mut procedure = Procedure::from_spec(&spec).expect("build");
        assert!(procedure.setup(&silent_ui()).is_err());
    }

    #[test]
    fn include_instantiates_named_sibling() {
        let spec = spec_json(json!({
            "instructions": [
                {"type": "Sequence", "isRoot": true, "children": [
                    {"type": "Include", "attributes": {"path": "helper"}}
                ]},
                {"type": "Wait", "name": "helper", "attributes": {"timeout": "0.0"}}
            ]
        }));
        let mut procedure = Procedure::from_spec(&spec).expect("build");
        procedure.setup(&silent_ui()).expect("setup");
        let root = procedure.root().expect("root");
        let include = &root.children()[0];
        assert_eq!(include.children().len(), 1);
        assert_eq!(include.children()[0].type_name(), "Wait");
    }

    #[test]
    fn cyclic_includes_fail_setup() {
        let spec = spec_json(json!({
            "instructions": [
                {"type": "Include", "name": "a", "isRoot": true, "attributes": {"path": "b"}},
                {"type": "Include", "name": "b", "attributes": {"path": "a"}}
            ]
        }));
        let mut procedure = Procedure::from_spec(&spec).expect("build");
        let error = procedure.setup(&silent_ui()).expect_err("cycle");
        assert!(matches!(error, EngineError::CyclicInclude(_)));
        assert!(!procedure.is_set_up());
        // Nothing of the failed resolution sticks to the tree.
        assert!(procedure
            .instructions()
            .iter()
            .all(|instruction| instruction.children().is_empty()));
    }

    #[test]
    fn self_include_is_a_cycle() {
        let spec = spec_json(json!({
            "instructions": [
                {"type": "Include", "name": "loop", "isRoot": true, "attributes": {"path": "loop"}}
            ]
        }));
        let mut procedure = Procedure::from_spec(&spec).expect("build");
        assert!(matches!(
            procedure.setup(&silent_ui()).expect_err("cycle"),
            EngineError::CyclicInclude(_)
        ));
    }

    #[test]
    fn include_procedure_merges_without_overriding() {
        let external = json!({
            "workspace": [
                {"type": "Local", "name": "shared", "attributes": {"type": "uint32", "value": "7"}},
                {"type": "Local", "name": "fresh", "attributes": {"type": "uint32", "value": "9"}}
            ],
            "instructions": [
                {"type": "Wait", "name": "entry", "isRoot": true, "attributes": {"timeout": "0.0"}}
            ]
        });
        let path = temp_file("external", &external);

        let spec = spec_json(json!({
            "workspace": [
                {"type": "Local", "name": "shared", "attributes": {"type": "uint32", "value": "1"}}
            ],
            "instructions": [
                {"type": "IncludeProcedure", "isRoot": true,
                 "attributes": {"file": path.to_str().expect("utf8")}}
            ]
        }));
        let mut procedure = Procedure::from_spec(&spec).expect("build");
        procedure.setup(&silent_ui()).expect("setup");

        // The collision keeps the local value; the new name is merged in.
        assert_eq!(procedure.workspace().get_value("shared", ""), Some(json!(1)));
        assert_eq!(procedure.workspace().get_value("fresh", ""), Some(json!(9)));

        let _ = fs::remove_file(path);
    }

    #[test]
    fn type_registrations_land_in_the_workspace_registry() {
        let spec = spec_json(json!({
            "types": [
                {"jsontype": {"type": "MyStruct", "attributes": [{"x": {"type": "float64"}}]}}
            ],
            "instructions": [{"type": "Wait", "isRoot": true}]
        }));
        let mut procedure = Procedure::from_spec(&spec).expect("build");
        procedure.setup(&silent_ui()).expect("setup");
        assert!(procedure.workspace().types().is_known("MyStruct"));
    }

    #[test]
    fn workspace_changes_reach_the_user_interface() {
        use std::sync::Mutex;
        use std::time::{Duration, Instant};

        #[derive(Default)]
        struct VariableWatcher {
            seen: Mutex<Vec<(String, Value)>>,
        }

        impl UserInterface for VariableWatcher {
            fn variable_updated(&self, name: &str, value: &Value, _connected: bool) {
                self.seen
                    .lock()
                    .expect("seen lock")
                    .push((name.to_string(), value.clone()));
            }
        }

        let spec = spec_json(json!({
            "workspace": [
                {"type": "Local", "name": "level", "attributes": {"type": "uint32", "value": "0"}}
            ],
            "instructions": [{"type": "Wait", "isRoot": true}]
        }));
        let watcher = Arc::new(VariableWatcher::default());
        let ui: Arc<dyn UserInterface> = Arc::clone(&watcher) as Arc<dyn UserInterface>;
        let mut procedure = Procedure::from_spec(&spec).expect("build");
        procedure.setup(&ui).expect("setup");

        assert!(procedure.workspace().set_value("level", "", json!(42)));
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            {
                let seen = watcher.seen.lock().expect("seen lock");
                if seen.contains(&("level".to_string(), json!(42))) {
                    break;
                }
            }
            assert!(Instant::now() < deadline, "variable update never forwarded");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn teardown_reverses_setup() {
        let spec = spec_json(json!({
            "workspace": [
                {"type": "Local", "name": "x", "attributes": {"type": "uint32", "value": "3"}}
            ],
            "instructions": [{"type": "Wait", "isRoot": true}]
        }));
        let ui = silent_ui();
        let mut procedure = Procedure::from_spec(&spec).expect("build");
        procedure.setup(&ui).expect("setup");
        procedure.teardown(&ui);
        assert!(!procedure.is_set_up());
        assert_eq!(procedure.workspace().get_value("x", ""), None);
    }
}
