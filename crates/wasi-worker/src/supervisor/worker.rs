//! Supervision of a single WASI guest on a dedicated worker thread.

use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use wasmtime::Trap;

use super::deadline::DeadlineTimer;
use super::request::{RunRequest, ValidatedRequest};
use super::runtime::{self, BreachFlag, GuestError};
use super::state::UnitState;
use super::sync::OutcomeCell;
use super::termination::{Fault, FaultKind, Outcome, Termination};
use super::Result;

/// Handle to one isolated unit of execution. Exclusively owned: the unit it
/// supervises cannot be shared, restarted, or re-run.
///
/// Creation returns immediately; the guest runs on its own thread and its
/// single [`Termination`] is observed through [`wait`](Self::wait) /
/// [`wait_timeout`](Self::wait_timeout).
pub struct WasiWorker {
    outcome: OutcomeCell<Termination>,
    state: Arc<RwLock<UnitState>>,
}

impl WasiWorker {
    /// Validates `request` and runs it. Equivalent to
    /// `request.into_validated()` followed by [`run`](Self::run).
    pub fn create(request: RunRequest) -> Result<Self> {
        Self::run(request.into_validated()?)
    }

    /// Starts the guest described by `request` on a new worker thread and
    /// returns its handle without waiting for completion.
    ///
    /// Errors are synchronous and leave nothing behind: engine construction
    /// and thread spawn happen before any guest-side resource exists.
    /// Everything after that point (reading the module, instantiating it,
    /// running it) reports through the unit's termination outcome instead.
    pub fn run(request: ValidatedRequest) -> Result<Self> {
        let engine = runtime::build_engine(request.resource_limits())?;
        let outcome = OutcomeCell::new();
        let state = Arc::new(RwLock::new(UnitState::Created));

        state.write().unwrap().start()?;

        let thread_name = match request.wasm_file().file_stem() {
            Some(stem) => format!("wasi-worker:{}", stem.to_string_lossy()),
            None => "wasi-worker".to_string(),
        };
        {
            let outcome = outcome.clone();
            let state = state.clone();
            thread::Builder::new()
                .name(thread_name)
                .spawn(move || runner(engine, request, outcome, state))?;
        }

        Ok(Self { outcome, state })
    }

    /// Blocks until the unit terminates and returns its outcome. Every call
    /// observes the same single [`Termination`].
    pub fn wait(&self) -> Termination {
        self.outcome.wait()
    }

    /// Like [`wait`](Self::wait), bounded by `timeout`. Returns `None` if
    /// the unit has not terminated in time; the unit keeps running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Termination> {
        self.outcome.wait_timeout(timeout)
    }

    /// The outcome, if the unit has already terminated.
    pub fn termination(&self) -> Option<Termination> {
        self.outcome.get()
    }

    pub fn state(&self) -> UnitState {
        *self.state.read().unwrap()
    }
}

/// Body of the worker thread: runs the guest, cancels the deadline on the
/// first termination signal, and publishes the one authoritative outcome.
fn runner(
    engine: wasmtime::Engine,
    request: ValidatedRequest,
    outcome: OutcomeCell<Termination>,
    state: Arc<RwLock<UnitState>>,
) {
    // Last-resort delivery: a panicking runner still yields an outcome.
    let _guard = {
        let state = state.clone();
        outcome.publish_on_drop(move || {
            if let Ok(mut state) = state.write() {
                let _ = state.finish(UnitState::Faulted);
            }
            Termination::now(Outcome::Fault(Fault::new(
                FaultKind::Instantiation,
                "worker thread terminated without reporting an outcome",
            )))
        })
    };

    log::debug!("starting guest {:?}", request.wasm_file());
    let breached = BreachFlag::default();
    let mut timer = None;
    let verdict = runtime::run_guest(&engine, &request, &breached, &mut timer);

    // First termination signal: the deadline is cancelled before the
    // outcome becomes visible, so it can only ever cause the forced
    // termination it already fired for.
    if let Some(timer) = &timer {
        timer.cancel();
    }

    let outcome_value = classify(verdict, &breached, timer.as_ref(), &request);
    let terminal = match &outcome_value {
        Outcome::Exit(code) => {
            log::info!("guest exited with status {code}");
            UnitState::Exited
        }
        Outcome::Timeout => {
            log::info!("guest forcibly terminated on deadline");
            UnitState::Killed
        }
        Outcome::Fault(fault) => {
            log::error!("{fault}");
            UnitState::Faulted
        }
    };
    if let Err(err) = state.write().unwrap().finish(terminal) {
        log::error!("could not record terminal state: {err}");
    }
    let _ = outcome.set(Termination::now(outcome_value));
}

/// Folds the guest verdict, the breach flag and the deadline state into the
/// single reported outcome. A recorded ceiling breach always wins,
/// whatever the guest managed to do around it.
fn classify(
    verdict: Result<i32, GuestError>,
    breached: &BreachFlag,
    timer: Option<&DeadlineTimer>,
    request: &ValidatedRequest,
) -> Outcome {
    if breached.load(Ordering::SeqCst) {
        let message = match &verdict {
            Err(GuestError::Setup(err)) | Err(GuestError::Wasm(err)) => format!("{err:#}"),
            Ok(_) => "resource ceiling exceeded".to_string(),
        };
        return Outcome::Fault(Fault::new(FaultKind::ResourceLimit, message));
    }

    match verdict {
        Ok(code) => Outcome::Exit(code),
        Err(GuestError::Setup(err)) => {
            Outcome::Fault(Fault::new(FaultKind::Instantiation, format!("{err:#}")))
        }
        Err(GuestError::Wasm(err)) => match err.downcast_ref::<Trap>() {
            Some(Trap::Interrupt) if timer.is_some_and(|timer| timer.fired()) => Outcome::Timeout,
            Some(Trap::StackOverflow) if has_stack_ceiling(request) => Outcome::Fault(Fault::new(
                FaultKind::ResourceLimit,
                "guest stack ceiling exceeded",
            )),
            Some(trap) => Outcome::Fault(Fault::new(FaultKind::Trap, trap.to_string())),
            None => Outcome::Fault(Fault::new(FaultKind::Instantiation, format!("{err:#}"))),
        },
    }
}

fn has_stack_ceiling(request: &ValidatedRequest) -> bool {
    request
        .resource_limits()
        .is_some_and(|limits| limits.wasm_stack().is_some())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::supervisor::request::ResourceLimits;

    fn request() -> ValidatedRequest {
        RunRequest::new("guest.wasm").into_validated().unwrap()
    }

    fn request_with_stack_ceiling() -> ValidatedRequest {
        let mut limits = ResourceLimits::new();
        limits.set_wasm_stack(1 << 16);
        let mut request = RunRequest::new("guest.wasm");
        request.set_resource_limits(limits);
        request.into_validated().unwrap()
    }

    fn fired_timer() -> DeadlineTimer {
        let mut config = wasmtime::Config::new();
        config.epoch_interruption(true);
        let engine = wasmtime::Engine::new(&config).unwrap();
        let timer = DeadlineTimer::arm(engine, Duration::ZERO).unwrap();
        while !timer.fired() {
            thread::sleep(Duration::from_millis(1));
        }
        timer
    }

    #[test]
    fn natural_exit_is_passed_through() {
        let breached = BreachFlag::default();
        assert_eq!(
            classify(Ok(120), &breached, None, &request()),
            Outcome::Exit(120)
        );
    }

    #[test]
    fn a_breach_outranks_a_clean_exit() {
        let breached = BreachFlag::default();
        breached.store(true, Ordering::SeqCst);
        let outcome = classify(Ok(0), &breached, None, &request());
        let Outcome::Fault(fault) = outcome else {
            panic!("expected a fault, got {outcome:?}");
        };
        assert_eq!(fault.kind(), FaultKind::ResourceLimit);
    }

    #[test]
    fn setup_failures_are_instantiation_faults() {
        let breached = BreachFlag::default();
        let verdict = Err(GuestError::Setup(anyhow::anyhow!("no such file")));
        let outcome = classify(verdict, &breached, None, &request());
        let Outcome::Fault(fault) = outcome else {
            panic!("expected a fault, got {outcome:?}");
        };
        assert_eq!(fault.kind(), FaultKind::Instantiation);
        assert!(fault.message().contains("no such file"));
    }

    #[test]
    fn guest_traps_are_trap_faults() {
        let breached = BreachFlag::default();
        let verdict = Err(GuestError::Wasm(anyhow::Error::new(
            Trap::UnreachableCodeReached,
        )));
        let outcome = classify(verdict, &breached, None, &request());
        let Outcome::Fault(fault) = outcome else {
            panic!("expected a fault, got {outcome:?}");
        };
        assert_eq!(fault.kind(), FaultKind::Trap);
    }

    #[test]
    fn an_interrupt_with_a_fired_deadline_is_a_timeout() {
        let breached = BreachFlag::default();
        let timer = fired_timer();
        let verdict = Err(GuestError::Wasm(anyhow::Error::new(Trap::Interrupt)));
        assert_eq!(
            classify(verdict, &breached, Some(&timer), &request()),
            Outcome::Timeout
        );
    }

    #[test]
    fn stack_overflow_with_a_ceiling_is_a_limit_fault() {
        let breached = BreachFlag::default();
        let verdict = Err(GuestError::Wasm(anyhow::Error::new(Trap::StackOverflow)));
        let outcome = classify(verdict, &breached, None, &request_with_stack_ceiling());
        let Outcome::Fault(fault) = outcome else {
            panic!("expected a fault, got {outcome:?}");
        };
        assert_eq!(fault.kind(), FaultKind::ResourceLimit);
    }

    #[test]
    fn stack_overflow_without_a_ceiling_is_a_plain_trap() {
        let breached = BreachFlag::default();
        let verdict = Err(GuestError::Wasm(anyhow::Error::new(Trap::StackOverflow)));
        let outcome = classify(verdict, &breached, None, &request());
        let Outcome::Fault(fault) = outcome else {
            panic!("expected a fault, got {outcome:?}");
        };
        assert_eq!(fault.kind(), FaultKind::Trap);
    }
}
