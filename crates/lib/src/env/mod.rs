//! Environment resolution: named, ordered layers of variable entries
//! merged into one flat mapping.
//!
//! A layer is an ordered list of [`Entry`] values coming from one
//! configuration source (global settings, project file, step record).
//! [`EnvDict::combine`] walks layers in insertion order and entries in
//! list order, expanding each value against the mapping built so far,
//! so later entries can reference (and re-assign) earlier ones:
//!
//! ```
//! use lectern_lib::env::{Entry, EnvDict};
//! use serde_json::json;
//!
//! let mut dict = EnvDict::new();
//! dict.add_layer("project", vec![Entry::assign("GREETING=hello")]);
//! dict.add_layer("step", vec![Entry::pair("GREETING", json!("${GREETING}!"))]);
//! let combined = dict.combine().unwrap();
//! assert_eq!(combined["GREETING"], json!("hello!"));
//! ```

pub mod subst;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

pub use subst::{stringify, EnvMap, SubstError};

/// One environment entry inside a layer.
///
/// The three source shapes a validated document can hand us:
/// a `"KEY=VALUE"` string, a `{name: ..., value: ...}` /
/// `{name: ..., unset: true}` directive, or a plain mapping of keys to
/// values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Entry {
  /// `"KEY=VALUE"`; everything after the first `=` is the value.
  Assign(String),

  /// Explicit directive, either assigning or unsetting a variable.
  Directive(Directive),

  /// Mapping of keys to values, applied in order.
  Map(IndexMap<String, Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub value: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub unset: Option<bool>,
}

impl Entry {
  pub fn assign(text: impl Into<String>) -> Self {
    Entry::Assign(text.into())
  }

  pub fn pair(key: impl Into<String>, value: Value) -> Self {
    let mut map = IndexMap::new();
    map.insert(key.into(), value);
    Entry::Map(map)
  }

  pub fn unset(name: impl Into<String>) -> Self {
    Entry::Directive(Directive {
      name: name.into(),
      value: None,
      unset: Some(true),
    })
  }

  /// Whether this entry assigns or unsets `key`.
  fn matches(&self, key: &str) -> bool {
    match self {
      Entry::Assign(text) => text.split('=').next() == Some(key),
      Entry::Directive(d) => d.name == key,
      Entry::Map(map) => map.contains_key(key),
    }
  }

  fn is_unset(&self) -> bool {
    matches!(self, Entry::Directive(d) if d.unset.is_some())
  }
}

/// A `combine` failure, locating the offending entry for the document
/// collaborator to render against its source.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid environment variable at index {index} in {layer}: {source}")]
pub struct EnvError {
  pub layer: String,
  pub index: usize,
  #[source]
  pub source: SubstError,
}

/// Named, ordered environment layers. Rebuilt per invocation from
/// configuration sources; never persisted.
#[derive(Debug, Clone, Default)]
pub struct EnvDict {
  layers: IndexMap<String, Vec<Entry>>,
}

impl EnvDict {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a layer. Layers combine in the order they were added.
  pub fn add_layer(&mut self, name: impl Into<String>, entries: Vec<Entry>) {
    self.layers.insert(name.into(), entries);
  }

  pub fn layer(&self, name: &str) -> Option<&[Entry]> {
    self.layers.get(name).map(Vec::as_slice)
  }

  /// Append an entry to an existing layer.
  pub fn push(&mut self, layer: &str, entry: Entry) {
    self.layers.entry(layer.to_string()).or_default().push(entry);
  }

  /// Assign `key` in `layer`, replacing the first matching entry in
  /// place and dropping any later entries for the same key.
  pub fn set(&mut self, layer: &str, key: &str, value: &str) {
    let entries = self.layers.entry(layer.to_string()).or_default();
    let item = Entry::Assign(format!("{key}={value}"));
    match entries.iter().position(|e| e.matches(key)) {
      None => entries.push(item),
      Some(first) => {
        entries[first] = item;
        let mut idx = first + 1;
        while idx < entries.len() {
          if entries[idx].matches(key) {
            entries.remove(idx);
          } else {
            idx += 1;
          }
        }
      }
    }
  }

  /// Remove entries for `key` from `layer`. Unset directives are kept
  /// unless `delete_unset`. Returns whether anything was removed.
  pub fn delete(&mut self, layer: &str, key: &str, delete_unset: bool) -> bool {
    let Some(entries) = self.layers.get_mut(layer) else {
      return false;
    };
    let before = entries.len();
    entries.retain(|e| !e.matches(key) || (!delete_unset && e.is_unset()));
    before != entries.len()
  }

  /// Merge all layers into one flat mapping, expanding substitutions
  /// entry by entry against the result built so far.
  pub fn combine(&self) -> Result<EnvMap, EnvError> {
    let mut combined = EnvMap::new();
    for (layer, entries) in &self.layers {
      trace!(layer = %layer, entries = entries.len(), "combining environment layer");
      for (index, entry) in entries.iter().enumerate() {
        apply_entry(&mut combined, entry).map_err(|source| EnvError {
          layer: layer.clone(),
          index,
          source,
        })?;
      }
    }
    Ok(combined)
  }
}

fn apply_entry(combined: &mut EnvMap, entry: &Entry) -> Result<(), SubstError> {
  match entry {
    Entry::Assign(text) => {
      let (key, value) = text.split_once('=').unwrap_or((text.as_str(), ""));
      insert_expanded(combined, key, &Value::String(value.to_string()))
    }
    Entry::Directive(d) => {
      if d.unset == Some(true) {
        combined.shift_remove(&d.name);
        return Ok(());
      }
      let value = d.value.clone().unwrap_or(Value::String(String::new()));
      insert_expanded(combined, &d.name, &value)
    }
    Entry::Map(map) => {
      for (key, value) in map {
        insert_expanded(combined, key, value)?;
      }
      Ok(())
    }
  }
}

fn insert_expanded(combined: &mut EnvMap, key: &str, value: &Value) -> Result<(), SubstError> {
  let expanded = subst::expand_value(combined, key, value)?;
  combined.insert(key.to_string(), expanded);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn single_layer(entries: Vec<Entry>) -> EnvDict {
    let mut dict = EnvDict::new();
    dict.add_layer("test", entries);
    dict
  }

  #[test]
  fn assign_string_splits_on_first_equals() {
    let env = single_layer(vec![Entry::assign("a=b=c")]).combine().unwrap();
    assert_eq!(env["a"], json!("b=c"));
  }

  #[test]
  fn name_value_directive_assigns() {
    let entry = Entry::Directive(Directive {
      name: "a".to_string(),
      value: Some(json!("b")),
      unset: None,
    });
    let env = single_layer(vec![entry]).combine().unwrap();
    assert_eq!(env["a"], json!("b"));
  }

  #[test]
  fn unset_directive_removes_earlier_assignment() {
    let env = single_layer(vec![Entry::pair("a", json!("b")), Entry::unset("a")])
      .combine()
      .unwrap();
    assert!(env.is_empty());
  }

  #[test]
  fn later_entries_see_earlier_ones() {
    let env = single_layer(vec![
      Entry::pair("VAR", json!("abc")),
      Entry::pair("TEST1", json!("${VAR}")),
      Entry::pair("TEST2", json!("${TEST1}")),
    ])
    .combine()
    .unwrap();
    assert_eq!(env["TEST1"], json!("abc"));
    assert_eq!(env["TEST2"], json!("abc"));
  }

  #[test]
  fn reassignment_expands_in_declaration_order() {
    let env = single_layer(vec![
      Entry::pair("VAR", json!(1)),
      Entry::pair("TEST1", json!("${VAR}")),
      Entry::pair("VAR", json!(2)),
      Entry::pair("TEST2", json!("${VAR}")),
    ])
    .combine()
    .unwrap();
    assert_eq!(env["VAR"], json!(2));
    assert_eq!(env["TEST1"], json!(1));
    assert_eq!(env["TEST2"], json!(2));
  }

  #[test]
  fn later_layer_overrides_and_references_earlier_layer() {
    let mut dict = EnvDict::new();
    dict.add_layer(
      "a",
      vec![Entry::pair("VAR1", json!("test")), Entry::pair("VAR2", json!("hello"))],
    );
    dict.add_layer(
      "b",
      vec![
        Entry::pair("VAR2", json!("${VAR2}!")),
        Entry::pair("VAR3", json!("${VAR1}2")),
      ],
    );
    let env = dict.combine().unwrap();
    assert_eq!(env["VAR1"], json!("test"));
    assert_eq!(env["VAR2"], json!("hello!"));
    assert_eq!(env["VAR3"], json!("test2"));
  }

  #[test]
  fn combine_error_names_layer_and_index() {
    let mut dict = EnvDict::new();
    dict.add_layer("step hello", vec![Entry::pair("test1", json!("${test2}"))]);
    let err = dict.combine().unwrap_err();
    assert_eq!(err.layer, "step hello");
    assert_eq!(err.index, 0);
    assert_eq!(err.source, SubstError::Undefined("test2".to_string()));
  }

  #[test]
  fn set_replaces_first_match_and_drops_duplicates() {
    let mut dict = single_layer(vec![
      Entry::unset("a"),
      Entry::assign("a=b"),
      Entry::pair("a", json!("c")),
    ]);
    dict.set("test", "a", "1");
    assert_eq!(dict.layer("test").unwrap(), &[Entry::assign("a=1")][..]);
  }

  #[test]
  fn delete_skips_unset_directives_by_default() {
    let mut dict = single_layer(vec![Entry::unset("a"), Entry::assign("a=b")]);
    assert!(dict.delete("test", "a", false));
    assert_eq!(dict.layer("test").unwrap(), &[Entry::unset("a")][..]);
    assert!(dict.delete("test", "a", true));
    assert!(dict.layer("test").unwrap().is_empty());
  }

  #[test]
  fn delete_reports_when_nothing_matched() {
    let mut dict = single_layer(vec![Entry::assign("a=b")]);
    assert!(!dict.delete("test", "missing", false));
  }

  #[test]
  fn entry_deserializes_all_three_shapes() {
    let entries: Vec<Entry> =
      serde_json::from_value(json!(["a=b", {"name": "c", "value": "d"}, {"e": "f"}])).unwrap();
    assert_eq!(entries[0], Entry::assign("a=b"));
    assert!(matches!(&entries[1], Entry::Directive(d) if d.name == "c"));
    assert_eq!(entries[2], Entry::pair("e", json!("f")));
  }
}
