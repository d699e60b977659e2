//! The single authoritative outcome reported for an isolated unit.

use chrono::{DateTime, Utc};

/// Exit code reported by [`Termination::code`] when the unit was forcibly
/// terminated by the deadline governor. Reserved: a guest exiting with this
/// status on its own is still reported as [`Outcome::Exit`].
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported by [`Termination::code`] for any runtime fault.
pub const FAULT_EXIT_CODE: i32 = 1;

/// How an isolated unit ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The guest exited on its own with this status.
    Exit(i32),
    /// The deadline elapsed and the unit was forcibly terminated.
    Timeout,
    /// The guest (or its setup) faulted before reaching a natural exit.
    Fault(Fault),
}

/// A runtime fault, including resource-ceiling violations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fault {
    kind: FaultKind,
    message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// A configured resource ceiling (memory or stack) was violated.
    ResourceLimit,
    /// The guest trapped during execution.
    Trap,
    /// The module could not be loaded, linked, or instantiated.
    Instantiation,
}

impl Fault {
    pub(crate) fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            FaultKind::ResourceLimit => write!(f, "resource limit violated: {}", self.message),
            FaultKind::Trap => write!(f, "guest trapped: {}", self.message),
            FaultKind::Instantiation => write!(f, "instantiation failed: {}", self.message),
        }
    }
}

/// The termination event delivered to the caller, exactly once per unit.
#[derive(Clone, Debug)]
pub struct Termination {
    outcome: Outcome,
    at: DateTime<Utc>,
}

impl Termination {
    pub(crate) fn now(outcome: Outcome) -> Self {
        Self {
            outcome,
            at: Utc::now(),
        }
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// When the terminal state was observed.
    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    /// The guest's own exit status, if it exited naturally.
    pub fn exit_code(&self) -> Option<i32> {
        match self.outcome {
            Outcome::Exit(code) => Some(code),
            _ => None,
        }
    }

    pub fn fault(&self) -> Option<&Fault> {
        match &self.outcome {
            Outcome::Fault(fault) => Some(fault),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.outcome, Outcome::Timeout)
    }

    /// A single process-style exit code for callers that do not inspect the
    /// structured outcome: the guest's own status for a natural exit,
    /// [`TIMEOUT_EXIT_CODE`] for a forced termination, [`FAULT_EXIT_CODE`]
    /// for any fault.
    pub fn code(&self) -> i32 {
        match &self.outcome {
            Outcome::Exit(code) => *code,
            Outcome::Timeout => TIMEOUT_EXIT_CODE,
            Outcome::Fault(_) => FAULT_EXIT_CODE,
        }
    }
}
