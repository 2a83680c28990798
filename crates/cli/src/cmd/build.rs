//! Implementation of the `lectern build` command.

use std::process::ExitCode;

use anyhow::Result;
use tracing::{debug, warn};

use lectern_lib::backend::BuildResult;
use lectern_lib::builder::Builder;
use lectern_lib::cancel::CancelToken;
use lectern_lib::observer::BuildObserver;

use crate::cmd::GlobalArgs;
use crate::output::{print_error, StreamSink};

/// Execute the build command.
///
/// Loads the project, runs the selected steps through the backend and
/// exits with the failing step's exit code (clamped to 1..=255; any
/// other non-ok outcome, cancellation included, exits 1).
pub async fn cmd_build(args: &GlobalArgs, refs: &[String], clean: bool) -> Result<ExitCode> {
  let (dir, project) = args.load_project()?;
  let settings = args.load_settings()?;
  let (name, backend) = args.make_backend(&settings)?;
  debug!(backend = %name, path = %dir.display(), "building project");

  let mut env = settings.environment;
  env.extend(project.environment);
  let builder = Builder::new(dir, project.steps, env, backend);

  let cancel = CancelToken::new();
  let trigger = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!("interrupt received, stopping the build");
      trigger.cancel();
    }
  });

  let mut observer = BuildObserver::new(Box::new(StreamSink));
  let result = builder.build(refs, clean, &mut observer, &cancel).await?;

  if result.ok {
    return Ok(ExitCode::SUCCESS);
  }
  if let Some(error) = &result.error {
    print_error(error);
  } else if result.is_cancelled() {
    print_error("build cancelled");
  }
  Ok(ExitCode::from(failure_code(&result)))
}

/// Map a non-ok result onto a process exit code: a failed step keeps
/// its own code clamped to 1..=255, everything else exits 1.
fn failure_code(result: &BuildResult) -> u8 {
  if result.is_failed() {
    result.code.clamp(1, 255) as u8
  } else {
    1
  }
}
