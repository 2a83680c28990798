//! The `${...}` substitution interpreter used by [`EnvDict::combine`].
//!
//! A value being combined is scanned left to right for the leftmost
//! `${...}` token. A token whose body is a bare identifier is a plain
//! reference into the mapping built so far; any other body is split on
//! the first-occurring operator:
//!
//! - `${VAR:-default}` - value of VAR if defined, else `default`
//! - `${VAR:+alt}` - `alt` if VAR is defined, else empty string
//! - `${VAR/pattern/repl}` - regex replace-once within VAR's value
//! - `${VAR//pattern/repl}` - regex replace-all within VAR's value
//!
//! Pattern and replacement may individually be single- or double-quoted
//! to allow a literal `/` inside. Scanning repeats until no token
//! remains, so defaults and replacements may themselves contain
//! references. When a value is exactly one plain reference (or one
//! `:-` falling back to a defined variable), the referenced value keeps
//! its original type; anything spliced into a larger string is
//! stringified as compact JSON.
//!
//! [`EnvDict::combine`]: super::EnvDict::combine
//!
//! # Example
//!
//! ```
//! use indexmap::IndexMap;
//! use serde_json::Value;
//! use lectern_lib::env::subst::expand_value;
//!
//! let mut env = IndexMap::new();
//! env.insert("VAR".to_string(), Value::String("abc".to_string()));
//! let out = expand_value(&env, "TEST", &Value::String("${VAR}d".to_string())).unwrap();
//! assert_eq!(out, Value::String("abcd".to_string()));
//! ```

use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// A flat, ordered variable mapping.
pub type EnvMap = IndexMap<String, Value>;

/// Upper bound on scan/substitute rounds for a single value. References
/// always resolve to already-expanded values, so this only trips if a
/// replacement keeps reintroducing tokens.
const MAX_ROUNDS: usize = 1000;

/// Errors produced while expanding a single value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubstError {
  /// A variable referenced itself before being defined.
  #[error("variable {0} references itself")]
  SelfReference(String),

  /// A referenced variable is not defined in the mapping built so far.
  #[error("{0} hasn't been defined")]
  Undefined(String),

  /// The token body contains no recognized operator.
  #[error("unrecognized parameter substitution pattern")]
  Unrecognized,

  /// A replace operator body does not split into pattern/replacement.
  #[error("wrong replacement syntax, the format should be ${{var{0}pattern/replacement}}")]
  MalformedReplacement(&'static str),

  /// The replacement pattern is not a valid regex.
  #[error("invalid replacement pattern: {0}")]
  BadPattern(String),

  /// Expansion did not terminate within the round limit.
  #[error("substitution did not terminate after {0} rounds")]
  IterationLimit(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
  Default,
  Alternative,
  ReplaceAll,
  ReplaceOnce,
}

impl Operator {
  fn token(self) -> &'static str {
    match self {
      Operator::Default => ":-",
      Operator::Alternative => ":+",
      Operator::ReplaceAll => "//",
      Operator::ReplaceOnce => "/",
    }
  }
}

// Checked in precedence order; position wins, ties go to the earlier entry.
const OPERATORS: [Operator; 4] = [
  Operator::Default,
  Operator::Alternative,
  Operator::ReplaceAll,
  Operator::ReplaceOnce,
];

fn sub_rgx() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"\$\{[^}{]+\}").unwrap())
}

fn var_rgx() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"^\$\{[a-zA-Z_][a-zA-Z0-9_]*\}$").unwrap())
}

/// Render a value the way it is spliced into a surrounding string:
/// strings verbatim, everything else as compact JSON.
pub fn stringify(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

/// Expand every `${...}` token in `value` against `env`, the mapping
/// built so far. `key` is the name currently being defined and is used
/// for self-reference detection. String leaves are interpreted; list
/// elements and map values are expanded element-wise; other leaves pass
/// through untouched.
pub fn expand_value(env: &EnvMap, key: &str, value: &Value) -> Result<Value, SubstError> {
  match value {
    Value::String(s) => expand_str(env, key, s),
    Value::Array(items) => {
      let expanded = items
        .iter()
        .map(|item| expand_value(env, key, item))
        .collect::<Result<Vec<_>, _>>()?;
      Ok(Value::Array(expanded))
    }
    Value::Object(map) => {
      let mut expanded = serde_json::Map::with_capacity(map.len());
      for (k, v) in map {
        expanded.insert(k.clone(), expand_value(env, key, v)?);
      }
      Ok(Value::Object(expanded))
    }
    other => Ok(other.clone()),
  }
}

fn expand_str(env: &EnvMap, key: &str, input: &str) -> Result<Value, SubstError> {
  let mut value = input.to_string();

  for _ in 0..MAX_ROUNDS {
    let token = match sub_rgx().find(&value) {
      None => return Ok(Value::String(value)),
      Some(m) => m.as_str().to_string(),
    };
    let body = &token[2..token.len() - 1];

    let resolved = if var_rgx().is_match(&token) {
      match env.get(body) {
        Some(v) => v.clone(),
        None if body == key => return Err(SubstError::SelfReference(key.to_string())),
        None => return Err(SubstError::Undefined(body.to_string())),
      }
    } else {
      apply_operator(env, key, body)?
    };

    // A value that is exactly one token keeps the resolved type.
    if value == token {
      return Ok(resolved);
    }
    value = value.replace(&token, &stringify(&resolved));
  }

  Err(SubstError::IterationLimit(MAX_ROUNDS))
}

fn apply_operator(env: &EnvMap, key: &str, body: &str) -> Result<Value, SubstError> {
  let (op, name, arg) = split_operator(body)?;
  // null counts as undefined for the operators, unlike plain references.
  let current = env.get(name).filter(|v| !v.is_null());

  match op {
    Operator::Default => Ok(match current {
      Some(v) => v.clone(),
      None => Value::String(arg.to_string()),
    }),
    Operator::Alternative => Ok(Value::String(match current {
      Some(_) => arg.to_string(),
      None => String::new(),
    })),
    Operator::ReplaceOnce | Operator::ReplaceAll => {
      let subject = match current {
        Some(v) => stringify(v),
        None if name == key => return Err(SubstError::SelfReference(key.to_string())),
        None => return Err(SubstError::Undefined(name.to_string())),
      };
      let (pattern, replacement) =
        parse_replacement(arg).ok_or(SubstError::MalformedReplacement(op.token()))?;
      let re = Regex::new(&pattern).map_err(|e| SubstError::BadPattern(e.to_string()))?;
      let out = if op == Operator::ReplaceOnce {
        re.replacen(&subject, 1, replacement.as_str())
      } else {
        re.replace_all(&subject, replacement.as_str())
      };
      Ok(Value::String(out.into_owned()))
    }
  }
}

/// Split an operator body on the first-occurring operator token.
fn split_operator(body: &str) -> Result<(Operator, &str, &str), SubstError> {
  let mut found: Option<(usize, Operator)> = None;
  for op in OPERATORS {
    if let Some(pos) = body.find(op.token()) {
      if found.is_none_or(|(best, _)| pos < best) {
        found = Some((pos, op));
      }
    }
  }
  let (pos, op) = found.ok_or(SubstError::Unrecognized)?;
  Ok((op, &body[..pos], &body[pos + op.token().len()..]))
}

fn quoted() -> &'static str {
  r#"("[^"]*")|('[^']*')"#
}

fn replacement_shapes() -> &'static [Regex; 4] {
  static SHAPES: OnceLock<[Regex; 4]> = OnceLock::new();
  SHAPES.get_or_init(|| {
    let q = quoted();
    [
      // neither side quoted, no stray '/'
      Regex::new("^[^/]+/[^/]*$").unwrap(),
      // both sides quoted
      Regex::new(&format!("^({q})/({q})$")).unwrap(),
      // pattern quoted
      Regex::new(&format!("^({q})/[^/]*$")).unwrap(),
      // replacement quoted
      Regex::new(&format!("^[^/]+/({q})$")).unwrap(),
    ]
  })
}

/// Divide a replace-operator argument into (pattern, replacement). The
/// four admissible quote shapes are tried in a fixed order and the
/// first full match wins; quotes are stripped before regex compilation.
fn parse_replacement(arg: &str) -> Option<(String, String)> {
  let shapes = replacement_shapes();
  let strip = |s: &str| s.trim_matches(|c| c == '"' || c == '\'').to_string();

  if shapes[0].is_match(arg) {
    let (pattern, replacement) = arg.split_once('/')?;
    return Some((strip(pattern), strip(replacement)));
  }
  if shapes[1].is_match(arg) {
    let quoted_re = Regex::new(quoted()).unwrap();
    let mut parts = quoted_re.find_iter(arg);
    let pattern = parts.next()?.as_str();
    let replacement = parts.next()?.as_str();
    return Some((strip(pattern), strip(replacement)));
  }
  if shapes[2].is_match(arg) {
    let quoted_re = Regex::new(quoted()).unwrap();
    let pattern = quoted_re.find(arg)?.as_str();
    let (_, replacement) = arg.rsplit_once('/')?;
    return Some((strip(pattern), strip(replacement)));
  }
  if shapes[3].is_match(arg) {
    let quoted_re = Regex::new(quoted()).unwrap();
    let replacement = quoted_re.find(arg)?.as_str();
    let (pattern, _) = arg.split_once('/')?;
    return Some((strip(pattern), strip(replacement)));
  }
  None
}
