//! Build orchestration.
//!
//! The builder owns a project's raw step list and a backend, and drives
//! one run through its phases: normalize and select steps, let the
//! backend prepare resources, materialize the output directory, then
//! execute. Failures inside a running task come back as a
//! [`BuildResult`]; everything before execution is an error.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info};

use crate::backend::{Backend, BuildResult};
use crate::cancel::CancelToken;
use crate::env::Entry;
use crate::observer::BuildObserver;
use crate::step::{BuildStep, BuildTask, ConfigError, RawStep};

/// Output directory created under the project root before execution.
pub const BUILD_DIR: &str = "_build";

/// A step reference that matches nothing in the project.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StepLookupError {
  #[error("step index {0} is out of range")]
  IndexOutOfRange(usize),

  #[error("no step named '{0}'")]
  UnknownName(String),
}

#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Lookup(#[from] StepLookupError),

  #[error("failed to prepare output directory {path}")]
  OutputDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// One project bound to one backend.
pub struct Builder {
  path: PathBuf,
  raw_steps: Vec<RawStep>,
  project_env: Vec<Entry>,
  backend: Box<dyn Backend>,
}

impl Builder {
  pub fn new(path: PathBuf, raw_steps: Vec<RawStep>, project_env: Vec<Entry>, backend: Box<dyn Backend>) -> Self {
    Self {
      path,
      raw_steps,
      project_env,
      backend,
    }
  }

  pub fn path(&self) -> &PathBuf {
    &self.path
  }

  pub fn backend(&self) -> &dyn Backend {
    self.backend.as_ref()
  }

  /// Normalize every step and select the ones named by `refs`: a run of
  /// digits selects by position, anything else by case-insensitive
  /// name. No refs selects everything. Duplicate selections collapse to
  /// one occurrence, keeping the order the refs first named them.
  pub fn get_steps(&self, refs: &[String]) -> Result<Vec<BuildStep>, BuildError> {
    let mut steps = Vec::with_capacity(self.raw_steps.len());
    for (index, raw) in self.raw_steps.iter().enumerate() {
      steps.push(BuildStep::from_config(index, raw, &self.project_env)?);
    }

    let mut seen_names: Vec<String> = Vec::new();
    for step in &steps {
      if let Some(name) = &step.name {
        let lowered = name.to_lowercase();
        if seen_names.contains(&lowered) {
          return Err(ConfigError::DuplicateName(name.clone()).into());
        }
        seen_names.push(lowered);
      }
    }

    if refs.is_empty() {
      return Ok(steps);
    }

    let mut selected: Vec<usize> = Vec::new();
    for reference in refs {
      let index = if reference.chars().all(|c| c.is_ascii_digit()) {
        let index: usize = reference
          .parse()
          .map_err(|_| StepLookupError::IndexOutOfRange(usize::MAX))?;
        if index >= steps.len() {
          return Err(StepLookupError::IndexOutOfRange(index).into());
        }
        index
      } else {
        let lowered = reference.to_lowercase();
        steps
          .iter()
          .position(|s| s.name.as_ref().is_some_and(|n| n.to_lowercase() == lowered))
          .ok_or_else(|| StepLookupError::UnknownName(reference.clone()))?
      };
      if !selected.contains(&index) {
        selected.push(index);
      }
    }

    Ok(selected.into_iter().map(|index| steps[index].clone()).collect())
  }

  /// Run the selected steps through prepare and build. `clean` wipes
  /// the output directory first. Execution-time outcomes come back as
  /// the returned [`BuildResult`].
  pub async fn build(
    &self,
    refs: &[String],
    clean: bool,
    observer: &mut BuildObserver,
    cancel: &CancelToken,
  ) -> Result<BuildResult, BuildError> {
    let steps = self.get_steps(refs)?;
    let task = BuildTask::new(self.path.clone(), steps);
    info!(path = %task.path.display(), steps = task.steps.len(), "starting build");

    observer.enter_prepare();
    let prepared = if cancel.is_cancelled() {
      BuildResult::cancelled(None)
    } else {
      self.backend.prepare(&task, observer, cancel).await
    };
    observer.result_msg(&prepared);
    if !prepared.ok {
      observer.done(&prepared);
      return Ok(prepared);
    }

    self.prepare_output_dir(clean)?;

    observer.enter_build();
    let result = if cancel.is_cancelled() {
      BuildResult::cancelled(None)
    } else {
      self.backend.build(&task, observer, cancel).await
    };
    observer.result_msg(&result);
    observer.done(&result);
    Ok(result)
  }

  fn prepare_output_dir(&self, clean: bool) -> Result<(), BuildError> {
    let out = self.path.join(BUILD_DIR);
    let io_err = |source| BuildError::OutputDir {
      path: out.clone(),
      source,
    };
    if clean && out.exists() {
      debug!(path = %out.display(), "removing previous output");
      std::fs::remove_dir_all(&out).map_err(io_err)?;
    }
    std::fs::create_dir_all(&out).map_err(io_err)?;
    Ok(())
  }
}
