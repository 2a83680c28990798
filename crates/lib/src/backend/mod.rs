//! The backend contract: the pluggable driver that executes build
//! steps against a concrete container runtime, plus the data carried
//! across that boundary.

pub mod docker;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::step::BuildTask;
use crate::cancel::CancelToken;
use crate::observer::BuildObserver;

/// Path of the scratch work directory mounted when a step declares no
/// mount target.
pub const WORK_PATH: &str = "/work";

/// Size of the tmpfs backing the scratch work directory.
pub const WORK_SIZE_BYTES: u64 = 100 * 1024 * 1024;

/// Identities and options a backend runs workloads with.
#[derive(Debug, Clone, Default)]
pub struct BackendContext {
  pub uid: u32,
  pub gid: u32,
  /// Flat backend options, merged by the caller from settings,
  /// `{BACKENDNAME}_*` process environment and command-line overrides.
  /// Keys are lowercase with underscores.
  pub options: HashMap<String, String>,
}

impl BackendContext {
  pub fn option(&self, key: &str) -> Option<&str> {
    self.options.get(key).map(String::as_str)
  }
}

/// Outcome of one prepare or build run. Execution-time failures are
/// data, not errors: once a task is running, every failure kind folds
/// into one of these.
///
/// Invariant: a non-zero `code` or a present `error` always names the
/// responsible `step`; only a wholesale cancellation leaves it unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
  pub ok: bool,
  pub code: i64,
  pub error: Option<String>,
  /// Index of the responsible step, if any.
  pub step: Option<usize>,
}

impl BuildResult {
  pub fn success() -> Self {
    Self {
      ok: true,
      code: 0,
      error: None,
      step: None,
    }
  }

  pub fn failed(code: i64, error: Option<String>, step: usize) -> Self {
    Self {
      ok: false,
      code,
      error,
      step: Some(step),
    }
  }

  pub fn cancelled(step: Option<usize>) -> Self {
    Self {
      ok: false,
      code: 0,
      error: None,
      step,
    }
  }

  /// A run stopped by a cancellation request rather than a failure.
  pub fn is_cancelled(&self) -> bool {
    !self.ok && self.code == 0
  }

  /// A run stopped by a failing step.
  pub fn is_failed(&self) -> bool {
    !self.ok && self.code != 0
  }
}

/// Pre-execution backend failures: construction, reachability probes
/// and housekeeping.
#[derive(Debug, Error)]
pub enum BackendError {
  #[error("unknown backend '{0}'")]
  Unknown(String),

  #[error("container runtime unavailable: {0}")]
  Unavailable(String),

  #[error("container runtime error: {0}")]
  Api(String),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

/// Operations every container runtime driver implements. The driver is
/// the only component that talks to the external runtime.
#[async_trait]
pub trait Backend: Send + Sync {
  /// Short registry name of this backend.
  fn name(&self) -> &'static str;

  /// Pre-fetch and validate resources for every step, in order. Must
  /// not run workload code.
  async fn prepare(&self, task: &BuildTask, observer: &mut BuildObserver, cancel: &CancelToken) -> BuildResult;

  /// Execute every step in order, stopping at the first non-ok result.
  async fn build(&self, task: &BuildTask, observer: &mut BuildObserver, cancel: &CancelToken) -> BuildResult;

  /// Check that the runtime is reachable. No side effects.
  async fn verify(&self) -> Result<(), BackendError>;

  /// Best-effort removal of stray resources created by previous runs,
  /// limited to expired ones unless `force`.
  async fn cleanup(&self, force: bool) -> Result<(), BackendError>;

  /// Human-readable runtime diagnostics.
  async fn version_info(&self) -> Result<String, BackendError>;
}

/// Short names accepted by [`create_backend`].
pub fn backend_names() -> &'static [&'static str] {
  &["docker"]
}

/// Resolve a short backend name to a driver. Names are matched
/// exactly; anything unknown fails construction.
pub fn create_backend(name: &str, context: BackendContext) -> Result<Box<dyn Backend>, BackendError> {
  match name {
    "docker" => Ok(Box::new(docker::DockerBackend::new(context))),
    other => Err(BackendError::Unknown(other.to_string())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn success_is_neither_cancelled_nor_failed() {
    let result = BuildResult::success();
    assert!(result.ok);
    assert!(!result.is_cancelled());
    assert!(!result.is_failed());
    assert_eq!(result.code, 0);
    assert!(result.error.is_none() && result.step.is_none());
  }

  #[test]
  fn non_ok_with_code_zero_is_cancelled() {
    let result = BuildResult::cancelled(None);
    assert!(result.is_cancelled());
    assert!(!result.is_failed());
  }

  #[test]
  fn failed_names_the_step() {
    let result = BuildResult::failed(3, None, 1);
    assert!(result.is_failed());
    assert!(!result.is_cancelled());
    assert_eq!(result.step, Some(1));
  }

  #[test]
  fn unknown_backend_fails_construction() {
    match create_backend("podmann", BackendContext::default()) {
      Err(BackendError::Unknown(name)) => assert_eq!(name, "podmann"),
      Err(other) => panic!("unexpected error: {other}"),
      Ok(_) => panic!("construction should fail for an unknown backend"),
    }
  }

  #[test]
  fn docker_backend_resolves() {
    let backend = create_backend("docker", BackendContext::default()).unwrap();
    assert_eq!(backend.name(), "docker");
  }
}
