//! wasmtime integration: engine configuration, WASI context building, and
//! the guest execution path that runs on the worker thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use wasmtime::{Engine, Linker, Module, Store};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, WasiCtxBuilder};

use super::deadline::DeadlineTimer;
use super::request::{ResourceLimits, ValidatedRequest};

/// Set by the limiter the moment any configured ceiling is violated, and
/// consulted when classifying the unit's outcome: a breach is reported as a
/// fault even if the guest would have produced an exit code around the same
/// time.
pub(crate) type BreachFlag = Arc<AtomicBool>;

/// A guest failure, split by phase so the reporter can tell a module that
/// never ran from one that died running.
pub(crate) enum GuestError {
    /// Failed before any guest code could run (read, compile, link).
    Setup(anyhow::Error),
    /// Failed while guest code was running (instantiation onward).
    Wasm(anyhow::Error),
}

pub(crate) fn build_engine(limits: Option<ResourceLimits>) -> Result<Engine> {
    let mut config = wasmtime::Config::new();
    config.epoch_interruption(true);
    if let Some(stack) = limits.and_then(|limits| limits.wasm_stack()) {
        config.max_wasm_stack(stack);
    }
    Engine::new(&config).context("could not create wasmtime engine")
}

pub(crate) struct StoreData {
    wasi: WasiP1Ctx,
    limiter: CeilingLimiter,
}

/// Enforces the request's resource ceilings on the store. Growth past the
/// memory ceiling both traps the guest and records the breach, so a
/// violation can never be masked by whatever the guest does afterwards.
pub(crate) struct CeilingLimiter {
    memory_size: Option<usize>,
    breached: BreachFlag,
}

impl CeilingLimiter {
    pub(crate) fn new(limits: Option<ResourceLimits>, breached: BreachFlag) -> Self {
        Self {
            memory_size: limits.and_then(|limits| limits.memory_size()),
            breached,
        }
    }
}

impl wasmtime::ResourceLimiter for CeilingLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> Result<bool> {
        if let Some(ceiling) = self.memory_size {
            if desired > ceiling {
                self.breached.store(true, Ordering::SeqCst);
                anyhow::bail!(
                    "memory ceiling of {ceiling} bytes exceeded by growth from {current} to {desired} bytes"
                );
            }
        }
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: u32,
        _desired: u32,
        _maximum: Option<u32>,
    ) -> Result<bool> {
        Ok(true)
    }
}

fn build_wasi_ctx(request: &ValidatedRequest) -> Result<WasiP1Ctx> {
    log::debug!("building wasi context");
    let mut builder = WasiCtxBuilder::new();
    builder.args(request.args());
    for (name, value) in request.env() {
        builder.env(name, value);
    }
    builder.inherit_stdio();
    for (guest_path, host_path) in request.preopens() {
        builder
            .preopened_dir(host_path, guest_path, DirPerms::all(), FilePerms::all())
            .with_context(|| {
                format!(
                    "could not preopen {} as {guest_path:?}",
                    host_path.display()
                )
            })?;
    }
    Ok(builder.build_p1())
}

/// Runs the guest to completion on the calling thread and returns its exit
/// status. The deadline timer is armed through `timer` (strictly after the
/// store's epoch deadline is installed) so the caller can cancel it and
/// inspect whether it fired.
pub(crate) fn run_guest(
    engine: &Engine,
    request: &ValidatedRequest,
    breached: &BreachFlag,
    timer: &mut Option<DeadlineTimer>,
) -> Result<i32, GuestError> {
    let wasi = build_wasi_ctx(request).map_err(GuestError::Setup)?;
    let limiter = CeilingLimiter::new(request.resource_limits(), breached.clone());

    let mut store = Store::new(engine, StoreData { wasi, limiter });
    if request.resource_limits().is_some() {
        store.limiter(|data| &mut data.limiter);
    }
    store.set_epoch_deadline(1);

    if let Some(timeout) = request.timeout() {
        let armed = DeadlineTimer::arm(engine.clone(), timeout)
            .context("could not arm deadline timer")
            .map_err(GuestError::Setup)?;
        *timer = Some(armed);
    }

    log::debug!("loading module from file {:?}", request.wasm_file());
    let bytes = std::fs::read(request.wasm_file())
        .with_context(|| format!("could not read module {:?}", request.wasm_file()))
        .map_err(GuestError::Setup)?;
    let module = Module::new(engine, &bytes)
        .context("could not compile module")
        .map_err(GuestError::Setup)?;

    let mut linker = Linker::new(engine);
    preview1::add_to_linker_sync(&mut linker, |data: &mut StoreData| &mut data.wasi)
        .map_err(GuestError::Setup)?;

    log::debug!("instantiating module");
    let instance = linker
        .instantiate(&mut store, &module)
        .map_err(GuestError::Wasm)?;
    let start = instance
        .get_func(&mut store, "_start")
        .context("module does not have a WASI start function")
        .map_err(GuestError::Setup)?;

    log::debug!("running start function");
    match start.call(&mut store, &[], &mut []) {
        Ok(()) => Ok(0),
        Err(err) => match err.downcast_ref::<I32Exit>() {
            // On Windows, exit status 3 indicates an abort, so return 1
            // indicating a non-zero status to avoid ambiguity.
            #[cfg(windows)]
            Some(I32Exit(3..)) => Ok(1),
            Some(I32Exit(status)) => Ok(*status),
            None => Err(GuestError::Wasm(err)),
        },
    }
}

#[cfg(test)]
mod tests {
    use wasmtime::ResourceLimiter;

    use super::*;

    #[test]
    fn limiter_allows_growth_under_the_ceiling() {
        let breached = BreachFlag::default();
        let mut limits = ResourceLimits::new();
        limits.set_memory_size(1 << 20);
        let mut limiter = CeilingLimiter::new(Some(limits), breached.clone());

        assert!(limiter.memory_growing(0, 1 << 16, None).unwrap());
        assert!(!breached.load(Ordering::SeqCst));
    }

    #[test]
    fn limiter_records_and_refuses_a_breach() {
        let breached = BreachFlag::default();
        let mut limits = ResourceLimits::new();
        limits.set_memory_size(1 << 16);
        let mut limiter = CeilingLimiter::new(Some(limits), breached.clone());

        let err = limiter.memory_growing(1 << 16, 1 << 20, None).unwrap_err();
        assert!(err.to_string().contains("memory ceiling"));
        assert!(breached.load(Ordering::SeqCst));
    }

    #[test]
    fn limiter_without_ceilings_is_unbounded() {
        let breached = BreachFlag::default();
        let mut limiter = CeilingLimiter::new(None, breached.clone());

        assert!(limiter.memory_growing(0, usize::MAX, None).unwrap());
        assert!(limiter.table_growing(0, 1 << 20, None).unwrap());
        assert!(!breached.load(Ordering::SeqCst));
    }
}
