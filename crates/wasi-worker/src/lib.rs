//! Run WASI guests on supervised worker threads.
//!
//! Each execution request produces one isolated unit: a dedicated thread
//! owning a wasmtime store configured with the request's arguments,
//! environment, preopened directories and resource ceilings. Creation never
//! blocks on the guest; the unit's lifecycle ends in exactly one
//! [`Termination`](supervisor::Termination) — a natural exit code, a fault
//! (including resource-ceiling violations), or a forced termination when
//! the request's deadline elapses.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use wasi_worker::supervisor::{RunRequest, WasiWorker};
//!
//! # fn main() -> wasi_worker::supervisor::Result<()> {
//! let mut request = RunRequest::new("guest.wasm");
//! request
//!     .set_args(["foo", "-bar"])
//!     .set_preopen("/sandbox", "/srv/fixtures")
//!     .set_timeout(Duration::from_secs(5));
//!
//! let worker = WasiWorker::create(request)?;
//! let termination = worker.wait();
//! println!("guest finished: {:?}", termination.outcome());
//! # Ok(())
//! # }
//! ```

pub mod supervisor;

#[cfg(test)]
#[path = "tests.rs"]
mod worker_tests;
