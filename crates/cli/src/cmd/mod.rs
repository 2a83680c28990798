//! Command implementations and the context shared between them.

mod build;
mod cleanup;
mod steps;
mod verify;
mod version;

pub use build::cmd_build;
pub use cleanup::cmd_cleanup;
pub use steps::cmd_steps;
pub use verify::cmd_verify;
pub use version::cmd_version;

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

use lectern_lib::backend::{create_backend, Backend, BackendContext};

use crate::config::{backend_options, current_ids, ProjectConfig, Settings};

const DEFAULT_BACKEND: &str = "docker";

/// Global arguments every command shares.
pub struct GlobalArgs {
  pub project: Option<PathBuf>,
  pub backend: Option<String>,
  pub backend_options: Vec<String>,
  pub settings: Option<PathBuf>,
}

impl GlobalArgs {
  pub(crate) fn load_settings(&self) -> Result<Settings> {
    let path = self.settings.clone().unwrap_or_else(Settings::default_path);
    Settings::load(&path)
  }

  pub(crate) fn project_dir(&self) -> Result<PathBuf> {
    match &self.project {
      Some(path) => Ok(path.clone()),
      None => env::current_dir().context("failed to resolve current directory"),
    }
  }

  pub(crate) fn load_project(&self) -> Result<(PathBuf, ProjectConfig)> {
    let dir = self.project_dir()?;
    let (path, config) = ProjectConfig::find_from(&dir)?;
    tracing::debug!(path = %path.display(), "loaded project configuration");
    Ok((dir, config))
  }

  /// Resolve the backend name and construct the driver with merged
  /// options and the caller's identity.
  pub(crate) fn make_backend(&self, settings: &Settings) -> Result<(String, Box<dyn Backend>)> {
    let name = self
      .backend
      .clone()
      .or_else(|| settings.backend.clone())
      .unwrap_or_else(|| DEFAULT_BACKEND.to_string());
    let options = backend_options(&name, settings, env::vars(), &self.backend_options)?;
    let (uid, gid) = current_ids();
    let backend = create_backend(&name, BackendContext { uid, gid, options })?;
    Ok((name, backend))
  }
}
