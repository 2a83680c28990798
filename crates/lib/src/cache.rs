//! Image pull bookkeeping.
//!
//! Records when each container image was last pulled so the backend can
//! skip re-pulling fresh images and refresh stale ones. The cache is a
//! single JSON file mapping image references to pull timestamps:
//!
//! ```text
//! {cache_dir}/lectern/images.json
//! ```
//!
//! The cache is advisory. A missing or unreadable file degrades to an
//! empty cache; every image then looks stale and gets re-pulled.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Images pulled within this window are not re-pulled.
const REFRESH_AFTER_HOURS: i64 = 24;

/// Cache file name within the cache directory.
const CACHE_FILENAME: &str = "images.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
  images: HashMap<String, DateTime<Utc>>,
}

/// In-memory view of the pull timestamp file.
#[derive(Debug)]
pub struct ImageCache {
  path: PathBuf,
  entries: HashMap<String, DateTime<Utc>>,
  dirty: bool,
}

impl ImageCache {
  /// Load the cache from `path`. A missing file yields an empty cache;
  /// a corrupt one is discarded with a warning and rebuilt on save.
  pub fn load(path: PathBuf) -> Self {
    let entries = match fs::read_to_string(&path) {
      Ok(content) => match serde_json::from_str::<CacheFile>(&content) {
        Ok(file) => file.images,
        Err(error) => {
          warn!(path = %path.display(), %error, "discarding corrupt image cache");
          HashMap::new()
        }
      },
      Err(error) if error.kind() == io::ErrorKind::NotFound => HashMap::new(),
      Err(error) => {
        warn!(path = %path.display(), %error, "failed to read image cache");
        HashMap::new()
      }
    };
    Self {
      path,
      entries,
      dirty: false,
    }
  }

  /// Default cache location, `{cache_dir}/lectern/images.json`.
  pub fn default_path() -> PathBuf {
    dirs::cache_dir()
      .unwrap_or_else(|| PathBuf::from("."))
      .join("lectern")
      .join(CACHE_FILENAME)
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// When `image` was last pulled, if recorded.
  pub fn last_pull(&self, image: &str) -> Option<DateTime<Utc>> {
    self.entries.get(image).copied()
  }

  /// Whether `image` should be pulled again: unrecorded, or last pulled
  /// more than the refresh window ago.
  pub fn needs_refresh(&self, image: &str, now: DateTime<Utc>) -> bool {
    match self.entries.get(image) {
      Some(pulled) => now - *pulled > Duration::hours(REFRESH_AFTER_HOURS),
      None => true,
    }
  }

  /// Record a successful pull of `image` at `now`.
  pub fn record_pull(&mut self, image: &str, now: DateTime<Utc>) {
    self.entries.insert(image.to_string(), now);
    self.dirty = true;
  }

  pub fn is_dirty(&self) -> bool {
    self.dirty
  }

  /// Persist the cache if it changed since loading. Writes to a temp
  /// file and renames it into place.
  pub fn save(&mut self) -> io::Result<()> {
    if !self.dirty {
      return Ok(());
    }
    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent)?;
    }
    let file = CacheFile {
      images: self.entries.clone(),
    };
    let content = serde_json::to_string_pretty(&file).map_err(io::Error::other)?;
    let temp_path = self.path.with_extension("json.tmp");
    fs::write(&temp_path, &content)?;
    fs::rename(&temp_path, &self.path)?;
    self.dirty = false;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn cache_in(dir: &tempfile::TempDir) -> ImageCache {
    ImageCache::load(dir.path().join(CACHE_FILENAME))
  }

  #[test]
  fn missing_file_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(&dir);
    assert_eq!(cache.last_pull("hello-world:latest"), None);
    assert!(cache.needs_refresh("hello-world:latest", Utc::now()));
  }

  #[test]
  fn corrupt_file_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(CACHE_FILENAME);
    fs::write(&path, "not json").unwrap();
    let cache = ImageCache::load(path);
    assert!(cache.needs_refresh("hello-world:latest", Utc::now()));
  }

  #[test]
  fn fresh_pull_within_window() {
    let dir = tempfile::tempdir().unwrap();
    let mut cache = cache_in(&dir);
    let now = Utc::now();
    cache.record_pull("hello-world:latest", now);
    assert!(!cache.needs_refresh("hello-world:latest", now + Duration::hours(1)));
    assert!(cache.needs_refresh("hello-world:latest", now + Duration::hours(25)));
    assert!(cache.needs_refresh("other:latest", now));
  }

  #[test]
  fn save_and_reload_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();
    let mut cache = cache_in(&dir);
    cache.record_pull("hello-world:latest", now);
    assert!(cache.is_dirty());
    cache.save().unwrap();
    assert!(!cache.is_dirty());

    let reloaded = cache_in(&dir);
    assert_eq!(reloaded.last_pull("hello-world:latest"), Some(now));
  }

  #[test]
  fn save_creates_parent_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("deeper").join(CACHE_FILENAME);
    let mut cache = ImageCache::load(path.clone());
    cache.record_pull("img:latest", Utc::now());
    cache.save().unwrap();
    assert!(path.exists());
  }
}
