use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// JSON object key used to encode [`Value::Unknown`] when a value containing
/// unknowns must be serialized (plan output). State attrsJSON never contains
/// unknowns, so decoding state never produces this sentinel accidentally.
const UNKNOWN_SENTINEL: &str = "$strata:unknown";

// ── Values ────────────────────────────────────────────────────────────────────

/// A configuration or state value. Mirrors JSON, with one addition: `Unknown`
/// represents a value that will only be decided at apply time.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Unknown,
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn int(i: i64) -> Self {
        Value::Number(serde_json::Number::from(i))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Value::Unknown)
    }

    /// True when no `Unknown` occurs anywhere in the value tree.
    pub fn is_known_deep(&self) -> bool {
        match self {
            Value::Unknown => false,
            Value::List(items) => items.iter().all(Value::is_known_deep),
            Value::Map(entries) => entries.values().all(Value::is_known_deep),
            _ => true,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Decode a plain JSON value. Total: every JSON value is representable.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(entries) => {
                if entries.len() == 1 && entries.contains_key(UNKNOWN_SENTINEL) {
                    return Value::Unknown;
                }
                Value::Map(
                    entries
                        .into_iter()
                        .map(|(k, v)| (k, Value::from_json(v)))
                        .collect(),
                )
            }
        }
    }

    /// Encode to plain JSON. Returns `None` if any `Unknown` occurs anywhere;
    /// state writes require fully-known values.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Value::Null => Some(serde_json::Value::Null),
            Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Value::Number(n) => Some(serde_json::Value::Number(n.clone())),
            Value::String(s) => Some(serde_json::Value::String(s.clone())),
            Value::List(items) => items
                .iter()
                .map(Value::to_json)
                .collect::<Option<Vec<_>>>()
                .map(serde_json::Value::Array),
            Value::Map(entries) => entries
                .iter()
                .map(|(k, v)| v.to_json().map(|v| (k.clone(), v)))
                .collect::<Option<serde_json::Map<_, _>>>()
                .map(serde_json::Value::Object),
            Value::Unknown => None,
        }
    }

    /// Encode to JSON with `Unknown` replaced by its sentinel object. Used for
    /// plan serialization only; never written to state.
    pub fn to_json_lossy(&self) -> serde_json::Value {
        match self {
            Value::Unknown => {
                let mut m = serde_json::Map::new();
                m.insert(UNKNOWN_SENTINEL.to_string(), serde_json::Value::Bool(true));
                serde_json::Value::Object(m)
            }
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json_lossy).collect())
            }
            Value::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json_lossy()))
                    .collect(),
            ),
            known => known.to_json().expect("scalar is always known"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json_lossy().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from_json(json))
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

// ── Attribute paths ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathStep {
    Attr(String),
    Index(i64),
    Key(String),
}

/// A path from the root of a value down to one nested element. Also the shape
/// of provider `RequiresReplace` entries and state sensitive-path records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttrPath(pub Vec<PathStep>);

impl AttrPath {
    pub fn root() -> Self {
        AttrPath(Vec::new())
    }

    pub fn attr(name: impl Into<String>) -> Self {
        AttrPath(vec![PathStep::Attr(name.into())])
    }

    pub fn then_attr(mut self, name: impl Into<String>) -> Self {
        self.0.push(PathStep::Attr(name.into()));
        self
    }

    pub fn then_index(mut self, index: i64) -> Self {
        self.0.push(PathStep::Index(index));
        self
    }

    pub fn then_key(mut self, key: impl Into<String>) -> Self {
        self.0.push(PathStep::Key(key.into()));
        self
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for AttrPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for step in &self.0 {
            match step {
                PathStep::Attr(name) => write!(f, ".{}", name)?,
                PathStep::Index(i) => write!(f, "[{}]", i)?,
                PathStep::Key(k) => write!(f, "[{:?}]", k)?,
            }
        }
        Ok(())
    }
}

// ── Marks ─────────────────────────────────────────────────────────────────────

/// Out-of-band metadata attached to a value and propagated through every
/// operator during expression evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mark {
    Sensitive,
    Deprecated,
}

/// A set of (path, mark) pairs. A root-path mark applies to the whole value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marks(BTreeSet<(AttrPath, Mark)>);

impl Marks {
    pub fn new() -> Self {
        Marks::default()
    }

    pub fn root(mark: Mark) -> Self {
        let mut set = BTreeSet::new();
        set.insert((AttrPath::root(), mark));
        Marks(set)
    }

    pub fn from_paths(paths: impl IntoIterator<Item = AttrPath>, mark: Mark) -> Self {
        Marks(paths.into_iter().map(|p| (p, mark)).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, path: AttrPath, mark: Mark) {
        self.0.insert((path, mark));
    }

    pub fn merge(&mut self, other: Marks) {
        self.0.extend(other.0);
    }

    /// Whether the value as a whole carries the mark.
    pub fn has_root(&self, mark: Mark) -> bool {
        self.0.contains(&(AttrPath::root(), mark))
    }

    /// Whether the mark occurs anywhere, at any depth.
    pub fn contains(&self, mark: Mark) -> bool {
        self.0.iter().any(|(_, m)| *m == mark)
    }

    /// Paths carrying the given mark.
    pub fn paths_with(&self, mark: Mark) -> Vec<AttrPath> {
        self.0
            .iter()
            .filter(|(_, m)| *m == mark)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Marks seen from one step down: root marks stay root (a marked
    /// container marks everything inside it), marks whose first step matches
    /// are re-rooted below it, everything else drops away. `Attr` and `Key`
    /// steps with the same name match each other: schema-derived marks use
    /// attribute steps while evaluated map values use key steps.
    pub fn descend(&self, step: &PathStep) -> Marks {
        let mut out = BTreeSet::new();
        for (path, mark) in &self.0 {
            if path.is_root() {
                out.insert((AttrPath::root(), *mark));
            } else if steps_match(&path.0[0], step) {
                out.insert((AttrPath(path.0[1..].to_vec()), *mark));
            }
        }
        Marks(out)
    }

    /// Marks seen from one step up: every path gains the step as a prefix.
    pub fn ascend(&self, step: PathStep) -> Marks {
        let mut out = BTreeSet::new();
        for (path, mark) in &self.0 {
            let mut steps = Vec::with_capacity(path.0.len() + 1);
            steps.push(step.clone());
            steps.extend(path.0.iter().cloned());
            out.insert((AttrPath(steps), *mark));
        }
        Marks(out)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(AttrPath, Mark)> {
        self.0.iter()
    }
}

fn steps_match(a: &PathStep, b: &PathStep) -> bool {
    match (a, b) {
        (PathStep::Attr(x), PathStep::Key(y)) | (PathStep::Key(x), PathStep::Attr(y)) => x == y,
        _ => a == b,
    }
}

// ── Marked values ─────────────────────────────────────────────────────────────

/// The unit expression evaluation trades in: a value plus its marks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkedValue {
    pub value: Value,
    pub marks: Marks,
}

impl MarkedValue {
    pub fn unmarked(value: Value) -> Self {
        MarkedValue { value, marks: Marks::new() }
    }

    pub fn new(value: Value, marks: Marks) -> Self {
        MarkedValue { value, marks }
    }

    pub fn with_root_mark(mut self, mark: Mark) -> Self {
        self.marks.insert(AttrPath::root(), mark);
        self
    }

    /// Whether the value as a whole is sensitive.
    pub fn is_sensitive(&self) -> bool {
        self.marks.has_root(Mark::Sensitive)
    }

    /// Whether any part of the value is sensitive.
    pub fn contains_sensitive(&self) -> bool {
        self.marks.contains(Mark::Sensitive)
    }

    /// Split into the bare value and the marks that must be re-applied to any
    /// derived result. Providers only ever see the bare value.
    pub fn strip(self) -> (Value, Marks) {
        (self.value, self.marks)
    }
}
