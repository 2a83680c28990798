//! Docker driver.
//!
//! Talks to the Docker runtime through the `docker` command line client,
//! which keeps the driver working against any reachable daemon (local
//! socket or remote via the `host` option) without a vendored API
//! surface. Every spawned client process is killed when dropped, so a
//! cancelled run never leaves a client hanging.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendContext, BackendError, BuildResult, WORK_PATH, WORK_SIZE_BYTES};
use crate::builder::BUILD_DIR;
use crate::cache::ImageCache;
use crate::cancel::CancelToken;
use crate::env::stringify;
use crate::observer::BuildObserver;
use crate::step::{BuildStep, BuildTask};

/// Prefix of the labels stamped on every container this driver creates.
pub const LABEL_PREFIX: &str = "io.lectern";

/// How long a created container may linger before `cleanup` reaps it.
const CONTAINER_TTL_HOURS: i64 = 24;

const DEFAULT_BIN: &str = "docker";
const DEFAULT_WAIT_SECS: u64 = 600;

/// Container runtime driver backed by the `docker` client binary.
///
/// Recognized options: `bin` (client binary), `host` (daemon address,
/// exported as `DOCKER_HOST`), `timeout` (seconds to wait for a
/// finished container to report its exit code), `cache_file`
/// (image pull cache location).
pub struct DockerBackend {
  context: BackendContext,
  docker_bin: String,
  wait_timeout: std::time::Duration,
  cache: Mutex<ImageCache>,
}

impl DockerBackend {
  pub fn new(context: BackendContext) -> Self {
    let docker_bin = context.option("bin").unwrap_or(DEFAULT_BIN).to_string();
    let wait_secs = context
      .option("timeout")
      .and_then(|v| v.parse().ok())
      .unwrap_or(DEFAULT_WAIT_SECS);
    let cache_path = context
      .option("cache_file")
      .map(PathBuf::from)
      .unwrap_or_else(ImageCache::default_path);
    Self {
      context,
      docker_bin,
      wait_timeout: std::time::Duration::from_secs(wait_secs),
      cache: Mutex::new(ImageCache::load(cache_path)),
    }
  }

  fn command(&self) -> Command {
    let mut cmd = Command::new(&self.docker_bin);
    if let Some(host) = self.context.option("host") {
      cmd.env("DOCKER_HOST", host);
    }
    cmd.kill_on_drop(true);
    cmd
  }

  async fn docker_output(&self, args: &[&str]) -> Result<std::process::Output, BackendError> {
    let mut cmd = self.command();
    cmd.args(args).stdin(Stdio::null());
    debug!(bin = %self.docker_bin, ?args, "running docker client");
    Ok(cmd.output().await?)
  }

  /// Whether the daemon already holds `image`.
  async fn image_present(&self, image: &str) -> Result<bool, BackendError> {
    let output = self
      .docker_output(&["image", "inspect", "--format", "{{.Id}}", image])
      .await?;
    Ok(output.status.success())
  }

  /// Pull `image`, racing against cancellation. `Ok(true)` means the
  /// pull completed; `Ok(false)` means it was cancelled.
  async fn pull_image(&self, image: &str, cancel: &CancelToken) -> Result<bool, BackendError> {
    let mut cmd = self.command();
    cmd
      .args(["pull", image])
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::piped());
    tokio::select! {
      output = cmd.output() => {
        let output = output?;
        if output.status.success() {
          self.cache.lock().map_err(poisoned)?.record_pull(image, Utc::now());
          Ok(true)
        } else {
          Err(BackendError::Api(stderr_line(&output.stderr)))
        }
      }
      _ = cancel.cancelled() => Ok(false),
    }
  }

  /// Arguments for `docker create` covering one step.
  fn create_args(&self, project_path: &Path, step: &BuildStep) -> Vec<String> {
    let created = Utc::now();
    let expire = created + Duration::hours(CONTAINER_TTL_HOURS);
    let mut args = vec![
      "create".to_string(),
      "--label".to_string(),
      format!("{LABEL_PREFIX}.created={}", created.to_rfc3339()),
      "--label".to_string(),
      format!("{LABEL_PREFIX}.expire={}", expire.to_rfc3339()),
      "--user".to_string(),
      format!("{}:{}", self.context.uid, self.context.gid),
    ];
    for (key, value) in &step.env {
      args.push("-e".to_string());
      args.push(format!("{key}={}", stringify(value)));
    }
    args.extend(mount_args(project_path, step));
    args.push(step.image.clone());
    if let Some(command) = &step.command {
      args.extend(command.to_args());
    }
    args
  }

  async fn create_container(&self, task: &BuildTask, step: &BuildStep) -> Result<String, BackendError> {
    let args = self.create_args(&task.path, step);
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = self.docker_output(&arg_refs).await?;
    if !output.status.success() {
      return Err(BackendError::Api(stderr_line(&output.stderr)));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
  }

  async fn start_container(&self, id: &str) -> Result<(), BackendError> {
    let output = self.docker_output(&["start", id]).await?;
    if !output.status.success() {
      return Err(BackendError::Api(stderr_line(&output.stderr)));
    }
    Ok(())
  }

  /// Stream container output to the observer until the log stream
  /// closes or the run is cancelled. Returns `false` on cancellation.
  async fn stream_logs(
    &self,
    id: &str,
    step: usize,
    observer: &mut BuildObserver,
    cancel: &CancelToken,
  ) -> Result<bool, BackendError> {
    let mut cmd = self.command();
    cmd
      .args(["logs", "--follow", id])
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take().ok_or_else(|| BackendError::Api("log stream has no stdout".to_string()))?;
    let stderr = child.stderr.take().ok_or_else(|| BackendError::Api("log stream has no stderr".to_string()))?;
    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
      tokio::select! {
        line = out_lines.next_line(), if out_open => match line? {
          Some(line) => observer.container_msg(step, line),
          None => out_open = false,
        },
        line = err_lines.next_line(), if err_open => match line? {
          Some(line) => observer.container_msg(step, line),
          None => err_open = false,
        },
        _ = cancel.cancelled() => return Ok(false),
      }
    }
    Ok(true)
  }

  /// Block until the container exits and report its exit code.
  async fn wait_container(&self, id: &str) -> Result<i64, BackendError> {
    let waited = tokio::time::timeout(self.wait_timeout, self.docker_output(&["wait", id])).await;
    let output = match waited {
      Ok(output) => output?,
      Err(_) => {
        return Err(BackendError::Api(format!(
          "timed out after {}s waiting for container {id}",
          self.wait_timeout.as_secs()
        )));
      }
    };
    if !output.status.success() {
      return Err(BackendError::Api(stderr_line(&output.stderr)));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    text
      .trim()
      .parse()
      .map_err(|_| BackendError::Api(format!("unparseable wait status '{}'", text.trim())))
  }

  async fn remove_container(&self, id: &str) {
    match self.docker_output(&["rm", "-f", id]).await {
      Ok(output) if !output.status.success() => {
        warn!(container = %id, error = %stderr_line(&output.stderr), "failed to remove container");
      }
      Err(error) => warn!(container = %id, %error, "failed to remove container"),
      Ok(_) => {}
    }
  }

  /// Run one created container to completion. The caller removes the
  /// container afterwards regardless of outcome.
  async fn run_container(
    &self,
    id: &str,
    step: usize,
    observer: &mut BuildObserver,
    cancel: &CancelToken,
  ) -> Result<BuildResult, BackendError> {
    self.start_container(id).await?;
    observer.step_running(step);

    if !self.stream_logs(id, step, observer, cancel).await? {
      observer.step_stopping(step);
      return Ok(BuildResult::cancelled(Some(step)));
    }

    observer.step_postflight(step);
    let code = tokio::select! {
      code = self.wait_container(id) => code?,
      _ = cancel.cancelled() => {
        observer.step_stopping(step);
        return Ok(BuildResult::cancelled(Some(step)));
      }
    };
    if code != 0 {
      return Ok(BuildResult::failed(code, None, step));
    }
    Ok(BuildResult::success())
  }
}

#[async_trait]
impl Backend for DockerBackend {
  fn name(&self) -> &'static str {
    "docker"
  }

  async fn prepare(&self, task: &BuildTask, observer: &mut BuildObserver, cancel: &CancelToken) -> BuildResult {
    for step in &task.steps {
      if cancel.is_cancelled() {
        return BuildResult::cancelled(Some(step.index));
      }
      observer.step_preflight(step.index);

      let present = match self.image_present(&step.image).await {
        Ok(present) => present,
        Err(error) => return BuildResult::failed(-1, Some(error.to_string()), step.index),
      };

      if !present {
        observer.manager_msg(step.index, format!("downloading image {}", step.image));
        match self.pull_image(&step.image, cancel).await {
          Ok(true) => {}
          Ok(false) => return BuildResult::cancelled(Some(step.index)),
          Err(error) => return BuildResult::failed(-1, Some(error.to_string()), step.index),
        }
      } else {
        let stale = match self.cache.lock() {
          Ok(cache) => cache.needs_refresh(&step.image, Utc::now()),
          Err(_) => false,
        };
        if stale {
          observer.manager_msg(step.index, format!("refreshing image {}", step.image));
          match self.pull_image(&step.image, cancel).await {
            Ok(true) => {}
            Ok(false) => return BuildResult::cancelled(Some(step.index)),
            Err(error) => {
              // the image is already usable, keep going with the old one
              warn!(image = %step.image, %error, "image refresh failed");
              observer.manager_msg(step.index, format!("using cached image {}: {error}", step.image));
            }
          }
        }
      }
      observer.step_succeeded(step.index);
    }
    BuildResult::success()
  }

  async fn build(&self, task: &BuildTask, observer: &mut BuildObserver, cancel: &CancelToken) -> BuildResult {
    for step in &task.steps {
      if cancel.is_cancelled() {
        return BuildResult::cancelled(Some(step.index));
      }
      observer.step_pending(step.index);
      observer.manager_msg(step.index, format!("running container {}:", step.image));

      let id = match self.create_container(task, step).await {
        Ok(id) => id,
        Err(error) => return BuildResult::failed(-1, Some(error.to_string()), step.index),
      };

      let result = self.run_container(&id, step.index, observer, cancel).await;
      self.remove_container(&id).await;

      match result {
        Ok(result) if result.ok => {}
        Ok(result) => return result,
        Err(error) => return BuildResult::failed(-1, Some(error.to_string()), step.index),
      }
    }
    BuildResult::success()
  }

  async fn verify(&self) -> Result<(), BackendError> {
    let output = self
      .docker_output(&["version", "--format", "{{.Server.Version}}"])
      .await?;
    if !output.status.success() {
      return Err(BackendError::Unavailable(stderr_line(&output.stderr)));
    }
    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!(%version, "docker daemon reachable");
    Ok(())
  }

  async fn cleanup(&self, force: bool) -> Result<(), BackendError> {
    let filter = format!("label={LABEL_PREFIX}.created");
    let template = format!("{{{{.ID}}}}\t{{{{.Label \"{LABEL_PREFIX}.expire\"}}}}");
    let output = self
      .docker_output(&["ps", "-a", "--filter", &filter, "--format", &template])
      .await?;
    if !output.status.success() {
      return Err(BackendError::Api(stderr_line(&output.stderr)));
    }

    let now = Utc::now();
    let mut removed = 0usize;
    for line in String::from_utf8_lossy(&output.stdout).lines() {
      let Some((id, expire)) = line.split_once('\t') else { continue };
      let expired = parse_expire(expire).is_some_and(|at| at <= now);
      if force || expired {
        self.remove_container(id).await;
        removed += 1;
      }
    }
    info!(removed, force, "cleaned up stray containers");
    Ok(())
  }

  async fn version_info(&self) -> Result<String, BackendError> {
    let output = self.docker_output(&["version"]).await?;
    if !output.status.success() {
      return Err(BackendError::Unavailable(stderr_line(&output.stderr)));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
  }
}

impl Drop for DockerBackend {
  fn drop(&mut self) {
    if let Ok(mut cache) = self.cache.lock() {
      if cache.is_dirty() {
        if let Err(error) = cache.save() {
          warn!(path = %cache.path().display(), %error, "failed to save image cache");
        }
      }
    }
  }
}

/// Mount and workdir arguments: with an explicit mount target the
/// project is bound read-write there, otherwise a tmpfs scratch layout
/// exposes the sources read-only and the output directory read-write.
fn mount_args(project_path: &Path, step: &BuildStep) -> Vec<String> {
  let project = project_path.display();
  match &step.mount {
    Some(target) => vec![
      "-v".to_string(),
      format!("{project}:{target}"),
      "-w".to_string(),
      target.clone(),
    ],
    None => vec![
      "--mount".to_string(),
      format!("type=tmpfs,destination={WORK_PATH},tmpfs-size={WORK_SIZE_BYTES}"),
      "-v".to_string(),
      format!("{project}:{WORK_PATH}/src:ro"),
      "-v".to_string(),
      format!("{project}/{BUILD_DIR}:{WORK_PATH}/build"),
      "-w".to_string(),
      WORK_PATH.to_string(),
    ],
  }
}

fn parse_expire(value: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(value.trim())
    .ok()
    .map(|at| at.with_timezone(&Utc))
}

fn stderr_line(stderr: &[u8]) -> String {
  let text = String::from_utf8_lossy(stderr);
  let text = text.trim();
  if text.is_empty() {
    "docker client failed without output".to_string()
  } else {
    text.to_string()
  }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> BackendError {
  BackendError::Api("image cache lock poisoned".to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::step::RawStep;

  fn step_with_mount(mount: Option<&str>) -> BuildStep {
    let raw = RawStep::Config(crate::step::StepConfig {
      img: "hello-world".to_string(),
      mnt: mount.map(str::to_string),
      ..Default::default()
    });
    BuildStep::from_config(0, &raw, &[]).unwrap()
  }

  #[test]
  fn explicit_mount_binds_read_write() {
    let step = step_with_mount(Some("/compile"));
    let args = mount_args(Path::new("/course"), &step);
    assert_eq!(args, vec!["-v", "/course:/compile", "-w", "/compile"]);
  }

  #[test]
  fn default_mount_uses_scratch_layout() {
    let step = step_with_mount(None);
    let args = mount_args(Path::new("/course"), &step);
    assert_eq!(
      args,
      vec![
        "--mount",
        "type=tmpfs,destination=/work,tmpfs-size=104857600",
        "-v",
        "/course:/work/src:ro",
        "-v",
        "/course/_build:/work/build",
        "-w",
        "/work",
      ]
    );
  }

  #[test]
  fn create_args_carry_identity_env_and_labels() {
    let raw = RawStep::Config(crate::step::StepConfig {
      img: "builder:2".to_string(),
      cmd: Some(crate::step::StepCommand::Line("make html".to_string())),
      ..Default::default()
    });
    let step = BuildStep::from_config(0, &raw, &[crate::env::Entry::assign("LANG=C")]).unwrap();
    let backend = DockerBackend::new(BackendContext {
      uid: 1000,
      gid: 100,
      ..Default::default()
    });

    let args = backend.create_args(Path::new("/course"), &step);
    assert_eq!(args[0], "create");
    let user_at = args.iter().position(|a| a == "--user").unwrap();
    assert_eq!(args[user_at + 1], "1000:100");
    let env_at = args.iter().position(|a| a == "-e").unwrap();
    assert_eq!(args[env_at + 1], "LANG=C");
    assert!(args.iter().any(|a| a.starts_with("io.lectern.created=")));
    assert!(args.iter().any(|a| a.starts_with("io.lectern.expire=")));
    let image_at = args.iter().position(|a| a == "builder:2").unwrap();
    assert_eq!(&args[image_at + 1..], &["/bin/sh", "-c", "make html"]);
  }

  #[test]
  fn expire_label_round_trips() {
    let at = Utc::now();
    let parsed = parse_expire(&at.to_rfc3339()).unwrap();
    assert_eq!(parsed, at);
  }

  #[test]
  fn garbage_expire_label_is_ignored() {
    assert_eq!(parse_expire("not a timestamp"), None);
    assert_eq!(parse_expire(""), None);
  }

  #[test]
  fn options_configure_binary_and_timeout() {
    let mut context = BackendContext::default();
    context.options.insert("bin".to_string(), "podman".to_string());
    context.options.insert("timeout".to_string(), "30".to_string());
    let backend = DockerBackend::new(context);
    assert_eq!(backend.docker_bin, "podman");
    assert_eq!(backend.wait_timeout, std::time::Duration::from_secs(30));
  }

  #[test]
  fn cache_file_option_overrides_cache_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pulls.json");
    let mut context = BackendContext::default();
    context
      .options
      .insert("cache_file".to_string(), path.to_string_lossy().into_owned());
    let backend = DockerBackend::new(context);
    assert_eq!(backend.cache.lock().unwrap().path(), path);
  }
}
