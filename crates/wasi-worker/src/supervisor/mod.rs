//! Supervises a single WASI guest: request validation, an isolated worker
//! thread running the guest, a cancellable deadline, and exactly one
//! termination outcome per unit.

pub mod error;
pub mod request;
pub mod state;
pub mod sync;
pub mod termination;
pub mod worker;

pub use error::{Error, Result, ValidationError};
pub use request::{ResourceLimits, RunRequest, ValidatedRequest};
pub use state::UnitState;
pub use termination::{Fault, FaultKind, Outcome, Termination, FAULT_EXIT_CODE, TIMEOUT_EXIT_CODE};
pub use worker::WasiWorker;

pub(crate) mod deadline;
pub(crate) mod runtime;
