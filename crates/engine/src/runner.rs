//! Drives a procedure's root instruction from a single controlling
//! thread: repeated ticks with back-off, single-stepping, pause and halt
//! controls, and identity-based breakpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use proctree_types::{ExecutionStatus, InstructionId};
use tracing::{debug, info};

use crate::instruction::{HaltSignal, Instruction, TickCtx};
use crate::procedure::Procedure;
use crate::ui::UserInterface;

/// Default sleep between ticks while the root reports `Running`.
const DEFAULT_BACKOFF: Duration = Duration::from_millis(10);

/// Invoked after every root tick with a read-only view of the procedure.
pub type TickCallback = Box<dyn FnMut(&Procedure) + Send>;

/// Why [`Runner::execute_procedure`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The root reached a terminal status.
    Finished(ExecutionStatus),
    /// A pause request took effect after the current tick.
    Paused,
    /// A halt request stopped the tick loop.
    Halted,
    /// An armed breakpoint matched the next instruction to be ticked; the
    /// tree was suspended without ticking it.
    Breakpoint(InstructionId),
}

#[derive(Debug, Clone, Copy)]
struct Breakpoint {
    id: InstructionId,
    armed: bool,
}

/// Cloneable cross-thread controls for a running procedure.
#[derive(Clone)]
pub struct RunnerHandle {
    pause: Arc<AtomicBool>,
    halt: HaltSignal,
}

impl RunnerHandle {
    /// Requests a stop after the current tick; safe from any thread.
    pub fn pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    /// Raises the cooperative halt on the whole tree; safe from any
    /// thread.
    pub fn halt(&self) {
        self.halt.halt();
    }
}

/// The tick loop around a procedure.
pub struct Runner {
    ui: Arc<dyn UserInterface>,
    procedure: Option<Procedure>,
    breakpoints: Vec<Breakpoint>,
    tick_callback: Option<TickCallback>,
    pause: Arc<AtomicBool>,
    halt: HaltSignal,
    skip_breakpoint: Option<InstructionId>,
    last_status: Option<ExecutionStatus>,
    backoff: Duration,
}

impl Runner {
    pub fn new(ui: Arc<dyn UserInterface>) -> Self {
        Self {
            ui,
            procedure: None,
            breakpoints: Vec::new(),
            tick_callback: None,
            pause: Arc::new(AtomicBool::new(false)),
            halt: HaltSignal::default(),
            skip_breakpoint: None,
            last_status: None,
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// Overrides the `Running` back-off duration.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Installs a procedure, setting it up first when necessary. Rejected
    /// while descendants of the current procedure are still running.
    pub fn set_procedure(&mut self, mut procedure: Procedure) -> Result<()> {
        if self.is_running() {
            bail!("cannot replace the procedure while it is running");
        }
        if !procedure.is_set_up() {
            procedure.setup(&self.ui)?;
        }
        self.halt = procedure
            .root()
            .map(Instruction::halt_signal)
            .unwrap_or_default();
        self.procedure = Some(procedure);
        self.last_status = None;
        self.skip_breakpoint = None;
        Ok(())
    }

    pub fn procedure(&self) -> Option<&Procedure> {
        self.procedure.as_ref()
    }

    /// Removes and returns the procedure, e.g. for teardown.
    pub fn take_procedure(&mut self) -> Option<Procedure> {
        self.last_status = None;
        self.procedure.take()
    }

    /// Installs a callback invoked after every root tick.
    pub fn set_tick_callback(&mut self, callback: TickCallback) {
        self.tick_callback = Some(callback);
    }

    /// Cross-thread pause/halt controls.
    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            pause: Arc::clone(&self.pause),
            halt: self.halt.clone(),
        }
    }

    /// Arms a breakpoint on the instruction with the given identity.
    /// Only call between steps or while suspended.
    pub fn set_breakpoint(&mut self, id: InstructionId) {
        if let Some(existing) = self.breakpoints.iter_mut().find(|breakpoint| breakpoint.id == id) {
            existing.armed = true;
            return;
        }
        self.breakpoints.push(Breakpoint { id, armed: true });
    }

    pub fn remove_breakpoint(&mut self, id: InstructionId) {
        self.breakpoints.retain(|breakpoint| breakpoint.id != id);
    }

    pub fn breakpoints(&self) -> Vec<InstructionId> {
        self.breakpoints.iter().map(|breakpoint| breakpoint.id).collect()
    }

    /// `true` when the last observed root status was `Running`, i.e. some
    /// descendant still works on another thread. This is not "currently
    /// ticking".
    pub fn is_running(&self) -> bool {
        self.last_status == Some(ExecutionStatus::Running)
    }

    /// `true` when the last observed root status was terminal.
    pub fn is_finished(&self) -> bool {
        self.last_status.is_some_and(|status| status.is_terminal())
    }

    /// Requests a stop after the current tick. Another
    /// `execute_procedure` call resumes.
    pub fn pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    /// Raises the cooperative halt on the root and returns without
    /// ticking.
    pub fn halt(&self) {
        self.halt.halt();
    }

    /// Resets the procedure tree to `NotStarted`.
    pub fn reset(&mut self) -> Result<()> {
        let Some(procedure) = self.procedure.as_mut() else {
            bail!("no procedure installed");
        };
        let ui = Arc::clone(&self.ui);
        let (root, _) = procedure.tick_parts();
        if let Some(root) = root {
            root.reset(ui.as_ref());
        }
        self.last_status = None;
        Ok(())
    }

    fn tick_once(&mut self) -> Result<ExecutionStatus> {
        let Some(procedure) = self.procedure.as_mut() else {
            bail!("no procedure installed");
        };
        let ui = Arc::clone(&self.ui);
        let (root, workspace) = procedure.tick_parts();
        let Some(root) = root else {
            bail!("procedure has no instructions");
        };
        let ctx = TickCtx {
            ui: ui.as_ref(),
            workspace,
        };
        let status = root.tick(&ctx);
        self.last_status = Some(status);
        if let Some(callback) = &mut self.tick_callback {
            callback(&*procedure);
        }
        Ok(status)
    }

    /// One root tick, ignoring breakpoints. Never blocks on user input:
    /// prompts come back as futures and leave their instruction
    /// `Running`.
    pub fn execute_single(&mut self) -> Result<ExecutionStatus> {
        self.tick_once()
    }

    fn armed_breakpoint_at_next_leaf(&mut self) -> Option<InstructionId> {
        let procedure = self.procedure.as_ref()?;
        let root = procedure.root()?;
        let leaf = next_leaf(root)?;
        if self.skip_breakpoint == Some(leaf) {
            return None;
        }
        self.skip_breakpoint = None;
        self.breakpoints
            .iter()
            .find(|breakpoint| breakpoint.armed && breakpoint.id == leaf)
            .map(|breakpoint| breakpoint.id)
    }

    /// Ticks the root until it terminates, a pause or halt takes effect,
    /// or an armed breakpoint matches the next instruction due to be
    /// ticked. While the root reports `Running` a back-off sleep avoids a
    /// busy loop; `NotFinished` re-ticks immediately.
    pub fn execute_procedure(&mut self) -> Result<RunOutcome> {
        self.pause.store(false, Ordering::SeqCst);
        info!("procedure execution started");

        loop {
            if self.halt.is_halted() {
                info!("procedure execution halted");
                return Ok(RunOutcome::Halted);
            }
            if let Some(id) = self.armed_breakpoint_at_next_leaf() {
                debug!(breakpoint = %id, "breakpoint hit");
                self.skip_breakpoint = Some(id);
                return Ok(RunOutcome::Breakpoint(id));
            }

            let status = self.tick_once()?;
            match status {
                status if status.is_terminal() => {
                    info!(status = %status, "procedure finished");
                    return Ok(RunOutcome::Finished(status));
                }
                ExecutionStatus::Running => {
                    if self.pause.swap(false, Ordering::SeqCst) {
                        return Ok(RunOutcome::Paused);
                    }
                    thread::sleep(self.backoff);
                }
                _ => {
                    if self.pause.swap(false, Ordering::SeqCst) {
                        return Ok(RunOutcome::Paused);
                    }
                }
            }
        }
    }
}

/// The next instruction due to be ticked: the first `NotStarted` or
/// `NotFinished` leaf reached by descending into non-terminal children in
/// order.
fn next_leaf(node: &Instruction) -> Option<InstructionId> {
    if node.status().is_terminal() {
        return None;
    }
    if node.children().is_empty() {
        return match node.status() {
            ExecutionStatus::NotStarted | ExecutionStatus::NotFinished => Some(node.id()),
            _ => None,
        };
    }
    node.children().iter().find_map(next_leaf)
}
