//! Step and task model: typed step records from the validated project
//! document, normalized into immutable [`BuildStep`]s bound to a
//! [`BuildTask`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::env::{Entry, EnvDict, EnvError, EnvMap};

/// One step as it appears in the project document: a bare image name
/// or a full record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawStep {
  Image(String),
  Config(StepConfig),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
  #[serde(default)]
  pub img: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cmd: Option<StepCommand>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub mnt: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub env: Option<Vec<Entry>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
}

/// Container command: a shell line or an explicit argument vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepCommand {
  Line(String),
  Args(Vec<String>),
}

impl StepCommand {
  /// The argument vector passed to the container. Shell lines run
  /// through `/bin/sh -c`, matching Dockerfile shell form.
  pub fn to_args(&self) -> Vec<String> {
    match self {
      StepCommand::Line(line) => vec!["/bin/sh".to_string(), "-c".to_string(), line.clone()],
      StepCommand::Args(args) => args.clone(),
    }
  }
}

/// Configuration-time failures, raised before any task starts running.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("step {0} is missing an image")]
  MissingImage(usize),

  #[error("step name '{0}' is used more than once")]
  DuplicateName(String),

  #[error(transparent)]
  Env(#[from] EnvError),
}

/// One normalized container invocation. Immutable after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildStep {
  /// Position in the project's step list.
  pub index: usize,
  pub name: Option<String>,
  /// Image reference, always carrying a tag.
  pub image: String,
  pub command: Option<StepCommand>,
  /// Path inside the container where project data is bound read-write.
  /// When absent, the backend mounts the project read-only under a
  /// scratch work directory instead.
  pub mount: Option<String>,
  /// Flat environment, resolved once at normalization time.
  pub env: EnvMap,
}

impl BuildStep {
  /// Normalize a raw step record. `project_env` is the project-level
  /// environment layer; the step's own `env` is applied on top of it.
  pub fn from_config(index: usize, raw: &RawStep, project_env: &[Entry]) -> Result<Self, ConfigError> {
    let config = match raw {
      RawStep::Image(img) => StepConfig {
        img: img.clone(),
        ..StepConfig::default()
      },
      RawStep::Config(config) => config.clone(),
    };
    if config.img.is_empty() {
      return Err(ConfigError::MissingImage(index));
    }

    let mut dict = EnvDict::new();
    dict.add_layer("project", project_env.to_vec());
    dict.add_layer("step", config.env.unwrap_or_default());
    let env = dict.combine()?;

    Ok(BuildStep {
      index,
      name: config.name,
      image: normalize_image(&config.img),
      command: config.cmd,
      mount: config.mnt,
      env,
    })
  }
}

/// Append `:latest` when the reference carries neither a tag nor a
/// digest. The tag delimiter must come after the last `/` so
/// `registry:5000/img` still gets tagged.
fn normalize_image(image: &str) -> String {
  if image.contains('@') {
    return image.to_string();
  }
  let tail = image.rsplit('/').next().unwrap_or(image);
  if tail.contains(':') {
    image.to_string()
  } else {
    format!("{image}:latest")
  }
}

/// The full ordered set of steps selected for one build run, bound to
/// the project directory. Created once per invocation, never mutated.
#[derive(Debug, Clone)]
pub struct BuildTask {
  pub path: PathBuf,
  pub steps: Vec<BuildStep>,
}

impl BuildTask {
  pub fn new(path: PathBuf, steps: Vec<BuildStep>) -> Self {
    Self { path, steps }
  }

  pub fn step(&self, index: usize) -> Option<&BuildStep> {
    self.steps.iter().find(|s| s.index == index)
  }
}

/// Convenience for tests and simple callers: a step record with only
/// an image.
impl From<&str> for RawStep {
  fn from(img: &str) -> Self {
    RawStep::Image(img.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn bare_string_becomes_tagged_image() {
    let step = BuildStep::from_config(0, &"alpine".into(), &[]).unwrap();
    assert_eq!(step.image, "alpine:latest");
    assert_eq!(step.index, 0);
    assert!(step.name.is_none());
    assert!(step.env.is_empty());
  }

  #[test]
  fn explicit_tag_is_kept() {
    let step = BuildStep::from_config(0, &"alpine:3.20".into(), &[]).unwrap();
    assert_eq!(step.image, "alpine:3.20");
  }

  #[test]
  fn registry_port_is_not_a_tag() {
    let step = BuildStep::from_config(0, &"registry:5000/tools/builder".into(), &[]).unwrap();
    assert_eq!(step.image, "registry:5000/tools/builder:latest");
  }

  #[test]
  fn digest_reference_is_kept() {
    let img = "alpine@sha256:0000000000000000000000000000000000000000000000000000000000000000";
    let step = BuildStep::from_config(0, &img.into(), &[]).unwrap();
    assert_eq!(step.image, img);
  }

  #[test]
  fn missing_image_is_a_config_error() {
    let raw = RawStep::Config(StepConfig::default());
    let err = BuildStep::from_config(3, &raw, &[]).unwrap_err();
    assert!(matches!(err, ConfigError::MissingImage(3)));
  }

  #[test]
  fn step_env_layers_over_project_env() {
    let raw = RawStep::Config(StepConfig {
      img: "builder".to_string(),
      env: Some(vec![Entry::pair("TEST", json!("${VAR}d"))]),
      ..StepConfig::default()
    });
    let project = vec![Entry::pair("VAR", json!("abc"))];
    let step = BuildStep::from_config(0, &raw, &project).unwrap();
    assert_eq!(step.env["VAR"], json!("abc"));
    assert_eq!(step.env["TEST"], json!("abcd"));
  }

  #[test]
  fn step_env_does_not_leak_between_steps() {
    let with_env = RawStep::Config(StepConfig {
      img: "a".to_string(),
      env: Some(vec![Entry::pair("a", json!("b"))]),
      ..StepConfig::default()
    });
    let without = RawStep::Image("b".to_string());
    let first = BuildStep::from_config(0, &with_env, &[]).unwrap();
    let second = BuildStep::from_config(1, &without, &[]).unwrap();
    assert_eq!(first.env["a"], json!("b"));
    assert!(second.env.is_empty());
  }

  #[test]
  fn env_failures_carry_the_step_layer() {
    let raw = RawStep::Config(StepConfig {
      img: "a".to_string(),
      env: Some(vec![Entry::pair("test1", json!("${test2}"))]),
      ..StepConfig::default()
    });
    let err = BuildStep::from_config(0, &raw, &[]).unwrap_err();
    let ConfigError::Env(env_err) = err else {
      panic!("expected env error");
    };
    assert_eq!(env_err.layer, "step");
    assert_eq!(env_err.index, 0);
  }

  #[test]
  fn shell_line_runs_through_sh() {
    let cmd = StepCommand::Line("make html".to_string());
    assert_eq!(cmd.to_args(), vec!["/bin/sh", "-c", "make html"]);
  }

  #[test]
  fn raw_step_deserializes_both_shapes() {
    let steps: Vec<RawStep> =
      serde_json::from_value(json!(["alpine", {"img": "builder", "name": "docs"}])).unwrap();
    assert_eq!(steps[0], RawStep::Image("alpine".to_string()));
    assert!(matches!(&steps[1], RawStep::Config(c) if c.name.as_deref() == Some("docs")));
  }
}
