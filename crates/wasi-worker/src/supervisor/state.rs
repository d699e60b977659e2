//! Lifecycle state machine for an isolated unit.

use crate::supervisor::Error::FailedPrecondition;
use crate::supervisor::Result;

/// `Created → Running → {Exited, Killed, Faulted}`. Exactly one terminal
/// state is reached, exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Created,
    Running,
    /// The guest exited on its own.
    Exited,
    /// The unit was forcibly terminated by the deadline governor.
    Killed,
    /// The guest or its setup faulted.
    Faulted,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::Killed | Self::Faulted)
    }

    pub(crate) fn start(&mut self) -> Result<()> {
        *self = match self {
            Self::Created => Ok(Self::Running),
            _ => state_transition_error(*self, Self::Running),
        }?;
        Ok(())
    }

    pub(crate) fn finish(&mut self, terminal: UnitState) -> Result<()> {
        if !terminal.is_terminal() {
            return state_transition_error(*self, terminal);
        }
        *self = match self {
            Self::Running => Ok(terminal),
            _ => state_transition_error(*self, terminal),
        }?;
        Ok(())
    }
}

fn state_transition_error<T>(from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Result<T> {
    Err(FailedPrecondition(format!(
        "invalid state transition: {from:?} => {to:?}"
    )))
}
