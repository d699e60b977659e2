//! Execution requests and their validation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::ValidationError;

/// Describes one guest execution: which module to run and the arguments,
/// environment, filesystem exposure and budgets it runs under.
///
/// The wire shape (camelCase field names, defaulted collections, `timeout`
/// in integer milliseconds) is what hosts submit as JSON:
///
/// ```json
/// { "wasmFile": "guest.wasm", "args": ["foo"], "preopens": { "/sandbox": "/tmp/fix" } }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    wasm_file: PathBuf,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    preopens: BTreeMap<String, PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resource_limits: Option<ResourceLimits>,
    #[serde(
        default,
        with = "timeout_millis",
        skip_serializing_if = "Option::is_none"
    )]
    timeout: Option<Duration>,
}

impl RunRequest {
    pub fn new(wasm_file: impl Into<PathBuf>) -> Self {
        Self {
            wasm_file: wasm_file.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            preopens: BTreeMap::new(),
            resource_limits: None,
            timeout: None,
        }
    }

    /// set the argument vector passed to the guest, verbatim
    pub fn set_args(&mut self, args: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// set one environment variable visible to the guest
    pub fn set_env(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// expose one host directory to the guest under a virtual path
    pub fn set_preopen(
        &mut self,
        guest_path: impl Into<String>,
        host_path: impl Into<PathBuf>,
    ) -> &mut Self {
        self.preopens.insert(guest_path.into(), host_path.into());
        self
    }

    /// set the resource ceilings enforced for the unit
    pub fn set_resource_limits(&mut self, limits: ResourceLimits) -> &mut Self {
        self.resource_limits = Some(limits);
        self
    }

    /// set the deadline after which the unit is forcibly terminated
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn wasm_file(&self) -> &Path {
        &self.wasm_file
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn preopens(&self) -> &BTreeMap<String, PathBuf> {
        &self.preopens
    }

    pub fn resource_limits(&self) -> Option<ResourceLimits> {
        self.resource_limits
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Checks the shape constraints the type system cannot express. Pure:
    /// no I/O (in particular, the wasm file is not opened here), no side
    /// effects, safe to call repeatedly and concurrently.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.wasm_file.as_os_str().is_empty() {
            return Err(ValidationError::EmptyWasmFile);
        }
        for (idx, arg) in self.args.iter().enumerate() {
            if arg.contains('\0') {
                return Err(ValidationError::ArgContainsNul(idx));
            }
        }
        for (name, value) in &self.env {
            if name.is_empty() {
                return Err(ValidationError::EmptyEnvName);
            }
            if name.contains('=') || name.contains('\0') {
                return Err(ValidationError::InvalidEnvName(name.clone()));
            }
            if value.contains('\0') {
                return Err(ValidationError::InvalidEnvValue(name.clone()));
            }
        }
        for (guest_path, host_path) in &self.preopens {
            if guest_path.is_empty() {
                return Err(ValidationError::EmptyGuestPath);
            }
            if !guest_path.starts_with('/') {
                return Err(ValidationError::RelativeGuestPath(guest_path.clone()));
            }
            if host_path.as_os_str().is_empty() {
                return Err(ValidationError::EmptyHostPath(guest_path.clone()));
            }
        }
        if let Some(limits) = &self.resource_limits {
            if limits.wasm_stack() == Some(0) {
                return Err(ValidationError::ZeroStackCeiling);
            }
        }
        Ok(())
    }

    /// Validates the request and seals it for execution.
    pub fn into_validated(self) -> Result<ValidatedRequest, ValidationError> {
        self.validate()?;
        Ok(ValidatedRequest { inner: self })
    }
}

/// A [`RunRequest`] that passed validation; immutable for the rest of the
/// flow. The only input the supervisor accepts.
#[derive(Clone, Debug)]
pub struct ValidatedRequest {
    inner: RunRequest,
}

impl std::ops::Deref for ValidatedRequest {
    type Target = RunRequest;

    fn deref(&self) -> &RunRequest {
        &self.inner
    }
}

/// Host-enforced ceilings applied to one unit. Absent fields are unbounded
/// (subject to engine defaults).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    memory_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wasm_stack: Option<usize>,
}

impl ResourceLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// set the linear-memory ceiling, in bytes
    pub fn set_memory_size(&mut self, bytes: usize) -> &mut Self {
        self.memory_size = Some(bytes);
        self
    }

    /// set the guest stack ceiling, in bytes
    pub fn set_wasm_stack(&mut self, bytes: usize) -> &mut Self {
        self.wasm_stack = Some(bytes);
        self
    }

    pub fn memory_size(&self) -> Option<usize> {
        self.memory_size
    }

    pub fn wasm_stack(&self) -> Option<usize> {
        self.wasm_stack
    }
}

mod timeout_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        timeout: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match timeout {
            Some(timeout) => serializer.serialize_some(&(timeout.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
