//! Project and user configuration loading.
//!
//! The library core only ever sees typed data; everything read from
//! disk is deserialized here. A project directory carries one of
//! `lectern.{yml,yaml,json}` or `course.{yml,yaml,json}`; user-wide
//! settings live in `{config_dir}/lectern/settings.yml`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use lectern_lib::env::Entry;
use lectern_lib::step::RawStep;

const PROJECT_NAMES: &[&str] = &["lectern", "course"];
const PROJECT_EXTENSIONS: &[&str] = &["yml", "yaml", "json"];

/// The project definition file.
#[derive(Debug, Default, Deserialize)]
pub struct ProjectConfig {
  #[serde(default)]
  pub version: Option<String>,
  #[serde(default)]
  pub environment: Vec<Entry>,
  #[serde(default)]
  pub steps: Vec<RawStep>,
}

impl ProjectConfig {
  /// Locate and load the project file in `dir`. File names are probed
  /// in preference order; the first hit wins.
  pub fn find_from(dir: &Path) -> Result<(PathBuf, Self)> {
    if !dir.is_dir() {
      bail!("path {} doesn't exist or is not a directory", dir.display());
    }
    for name in PROJECT_NAMES {
      for ext in PROJECT_EXTENSIONS {
        let candidate = dir.join(format!("{name}.{ext}"));
        if candidate.is_file() {
          let config = Self::load(&candidate)?;
          return Ok((candidate, config));
        }
      }
    }
    let expected: Vec<String> = PROJECT_NAMES
      .iter()
      .flat_map(|name| PROJECT_EXTENSIONS.iter().map(move |ext| format!("{name}.{ext}")))
      .collect();
    bail!(
      "couldn't find a project configuration in {}\nexpected one of: {}",
      dir.display(),
      expected.join(", ")
    );
  }

  fn load(path: &Path) -> Result<Self> {
    let content = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let config = if path.extension().is_some_and(|e| e == "json") {
      serde_json::from_str(&content).with_context(|| format!("invalid project file {}", path.display()))?
    } else {
      serde_yaml::from_str(&content).with_context(|| format!("invalid project file {}", path.display()))?
    };
    Ok(config)
  }
}

/// User-wide settings, all optional.
#[derive(Debug, Default, Deserialize)]
pub struct Settings {
  /// Default backend name when the command line names none.
  #[serde(default)]
  pub backend: Option<String>,
  /// Environment layer applied below every project's own layer.
  #[serde(default)]
  pub environment: Vec<Entry>,
  /// Per-backend option blocks, keyed by backend name.
  #[serde(default)]
  pub backends: HashMap<String, HashMap<String, String>>,
}

impl Settings {
  pub fn default_path() -> PathBuf {
    dirs::config_dir()
      .unwrap_or_else(|| PathBuf::from("."))
      .join("lectern")
      .join("settings.yml")
  }

  /// Load settings from `path`. A missing file yields defaults; an
  /// unreadable or invalid one is an error.
  pub fn load(path: &Path) -> Result<Self> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
      Err(error) => {
        return Err(error).with_context(|| format!("failed to read settings {}", path.display()));
      }
    };
    serde_yaml::from_str(&content).with_context(|| format!("invalid settings file {}", path.display()))
  }
}

fn normalize_key(key: &str) -> String {
  key.to_lowercase().replace('-', "_")
}

/// Merge backend options from lowest to highest precedence: the
/// settings block, `{BACKENDNAME}_*` process environment variables,
/// then explicit `KEY=VALUE` overrides. Keys are normalized to
/// lowercase underscore form.
pub fn backend_options(
  backend: &str,
  settings: &Settings,
  process_env: impl Iterator<Item = (String, String)>,
  overrides: &[String],
) -> Result<HashMap<String, String>> {
  let mut options = HashMap::new();

  if let Some(block) = settings.backends.get(backend) {
    for (key, value) in block {
      options.insert(normalize_key(key), value.clone());
    }
  }

  let prefix = format!("{}_", backend.to_uppercase());
  for (key, value) in process_env {
    if let Some(rest) = key.strip_prefix(&prefix) {
      if !rest.is_empty() {
        options.insert(normalize_key(rest), value);
      }
    }
  }

  for raw in overrides {
    let Some((key, value)) = raw.split_once('=') else {
      bail!("invalid backend option '{raw}', expected KEY=VALUE");
    };
    options.insert(normalize_key(key), value.to_string());
  }

  Ok(options)
}

/// Identity the backend runs workloads as.
pub fn current_ids() -> (u32, u32) {
  #[cfg(unix)]
  {
    (nix::unistd::getuid().as_raw(), nix::unistd::getgid().as_raw())
  }
  #[cfg(not(unix))]
  {
    (0, 0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn project_file_names_probe_in_order() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("course.yml"), "steps:\n  - hello-world\n").unwrap();
    fs::write(
      dir.path().join("lectern.yml"),
      "steps:\n  - img: builder\n    name: html\n",
    )
    .unwrap();

    let (path, config) = ProjectConfig::find_from(dir.path()).unwrap();
    assert!(path.ends_with("lectern.yml"));
    assert_eq!(config.steps.len(), 1);
  }

  #[test]
  fn json_project_files_load() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
      dir.path().join("course.json"),
      r#"{"version": "2", "steps": ["hello-world"]}"#,
    )
    .unwrap();

    let (_, config) = ProjectConfig::find_from(dir.path()).unwrap();
    assert_eq!(config.version.as_deref(), Some("2"));
    assert_eq!(config.steps.len(), 1);
  }

  #[test]
  fn missing_project_lists_expected_names() {
    let dir = tempfile::tempdir().unwrap();
    let err = ProjectConfig::find_from(dir.path()).unwrap_err();
    assert!(err.to_string().contains("lectern.yml"));
    assert!(err.to_string().contains("course.json"));
  }

  #[test]
  fn missing_settings_default() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::load(&dir.path().join("settings.yml")).unwrap();
    assert!(settings.backend.is_none());
    assert!(settings.backends.is_empty());
  }

  #[test]
  fn option_precedence_settings_env_cli() {
    let mut settings = Settings::default();
    settings.backends.insert(
      "docker".to_string(),
      HashMap::from([
        ("Timeout".to_string(), "100".to_string()),
        ("bin".to_string(), "docker".to_string()),
      ]),
    );
    let env = vec![
      ("DOCKER_TIMEOUT".to_string(), "200".to_string()),
      ("PODMAN_BIN".to_string(), "ignored".to_string()),
    ];
    let overrides = vec!["timeout=300".to_string()];

    let options = backend_options("docker", &settings, env.into_iter(), &overrides).unwrap();
    assert_eq!(options.get("timeout").map(String::as_str), Some("300"));
    assert_eq!(options.get("bin").map(String::as_str), Some("docker"));
    assert!(!options.contains_key("podman_bin"));
  }

  #[test]
  fn malformed_override_is_rejected() {
    let settings = Settings::default();
    let err = backend_options("docker", &settings, std::iter::empty(), &["nodelimiter".to_string()]).unwrap_err();
    assert!(err.to_string().contains("KEY=VALUE"));
  }
}
