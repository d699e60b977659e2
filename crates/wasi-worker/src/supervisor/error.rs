//! Error types used by the supervisor.

use anyhow::Error as AnyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Supplied request is malformed
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// An error that can occur while standing up the worker thread
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// The operation was rejected because the unit is not in the required state
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    /// Any other error
    #[error("{0}")]
    Any(#[from] AnyError),
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

/// A rejected request field. Each shape check that the type system cannot
/// express gets its own variant; validation stops at the first violation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("wasm file path must not be empty")]
    EmptyWasmFile,
    #[error("argument {0} must not contain NUL")]
    ArgContainsNul(usize),
    #[error("environment variable name must not be empty")]
    EmptyEnvName,
    #[error("environment variable name {0:?} must not contain '=' or NUL")]
    InvalidEnvName(String),
    #[error("environment variable {0:?} has a value containing NUL")]
    InvalidEnvValue(String),
    #[error("preopen guest path must not be empty")]
    EmptyGuestPath,
    #[error("preopen guest path {0:?} must be absolute")]
    RelativeGuestPath(String),
    #[error("preopen {0:?} maps to an empty host path")]
    EmptyHostPath(String),
    #[error("wasm stack ceiling must be non-zero")]
    ZeroStackCeiling,
}
