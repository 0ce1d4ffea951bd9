//! Shared vocabulary for the proctree procedure engine: the execution status
//! state machine, log severities, node identities, and the error taxonomy.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status of an instruction node within its life-cycle.
///
/// `Success` and `Failure` are terminal and absorbing until the node is
/// reset. `Running` signals that descendant work is happening on another
/// thread and the caller should back off before the next tick;
/// `NotFinished` means the node is ready to be ticked again immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Node has never been ticked (or has been reset).
    #[default]
    NotStarted,
    /// Node is mid-execution and wants an immediate re-tick.
    NotFinished,
    /// Node is waiting on work owned by another thread.
    Running,
    /// Node finished successfully.
    Success,
    /// Node finished unsuccessfully.
    Failure,
}

impl ExecutionStatus {
    /// Returns `true` for `Success` and `Failure`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// Returns `true` while the node is between its first tick and a
    /// terminal status.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::NotFinished | Self::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotStarted => "not-started",
            Self::NotFinished => "not-finished",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
        };
        f.write_str(text)
    }
}

/// Syslog-style severity accepted by the `Log` instruction and the
/// user-interface log channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    #[default]
    Info,
    Debug,
    Trace,
}

impl Severity {
    /// The canonical lowercase name, as written in procedure attributes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Emergency => "emergency",
            Self::Alert => "alert",
            Self::Critical => "critical",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Notice => "notice",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error produced when a severity attribute does not name a known level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSeverityError(pub String);

impl fmt::Display for ParseSeverityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown severity '{}'", self.0)
    }
}

impl std::error::Error for ParseSeverityError {}

impl FromStr for Severity {
    type Err = ParseSeverityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "emergency" => Ok(Self::Emergency),
            "alert" => Ok(Self::Alert),
            "critical" => Ok(Self::Critical),
            "error" => Ok(Self::Error),
            "warning" => Ok(Self::Warning),
            "notice" => Ok(Self::Notice),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(ParseSeverityError(other.to_string())),
        }
    }
}

/// Process-unique identity of an instruction node.
///
/// Identities are handed out at node construction and never reused, so they
/// are safe to hold across resets (breakpoints, UI bookkeeping).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstructionId(u64);

static NEXT_INSTRUCTION_ID: AtomicU64 = AtomicU64::new(1);

impl InstructionId {
    /// Allocates the next free identity.
    pub fn next() -> Self {
        Self(NEXT_INSTRUCTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstructionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Closed error taxonomy of the engine.
///
/// Setup-time variants abort `Procedure::setup` and surface to the caller;
/// tick-time conditions are logged to the user interface and translated to
/// `ExecutionStatus::Failure` instead of propagating.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing mandatory attribute, unparseable literal, or constraint
    /// violation, detected fail-fast during setup.
    #[error("attribute error on '{attribute}': {reason}")]
    Attribute { attribute: String, reason: String },

    /// Workspace variable name collision at build time.
    #[error("variable '{0}' already present in workspace")]
    DuplicateName(String),

    /// Include resolution found a reference cycle at setup.
    #[error("cyclic include involving '{0}'")]
    CyclicInclude(String),

    /// Value assignment or comparison across incompatible types.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Variable read/write outside its set-up window, or the backend is
    /// not available.
    #[error("variable '{0}' is not available")]
    VariableUnavailable(String),

    /// Child index outside the child count.
    #[error("index {index} out of range for {count} children")]
    OutOfRange { index: usize, count: usize },

    /// An asynchronous operation was halted before completion.
    #[error("operation cancelled: {0}")]
    CancellationError(String),

    /// The user returned a negative confirmation.
    #[error("rejected by user: {0}")]
    UserRejection(String),
}

impl EngineError {
    /// Shorthand for the attribute variant.
    pub fn attribute(attribute: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Attribute {
            attribute: attribute.into(),
            reason: reason.into(),
        }
    }
}
