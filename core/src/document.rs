//! Document model shared by every store adapter.
//!
//! Documents are ordered maps of field names to [`Value`]s. Nested fields are
//! addressed with dotted paths (`context.app.user`), which is why field names
//! written by the session layer never contain a raw `.`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A single stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Binary(Vec<u8>),
    Document(Document),
}

/// A document (or sub-document) keyed by field name.
pub type Document = BTreeMap<String, Value>;

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(d) => Some(d),
            _ => None,
        }
    }

    /// Ordering used by range conditions. Values of unrelated kinds do not compare.
    fn partial_order(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Double(b)) => (*a as f64).partial_cmp(b),
            (Value::Double(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{}", d),
            Value::String(s) => write!(f, "{:?}", s),
            Value::DateTime(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
            Value::Document(d) => {
                write!(f, "{{")?;
                for (i, (k, v)) in d.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Document> for Value {
    fn from(d: Document) -> Self {
        Value::Document(d)
    }
}

/// Look up a dotted path inside a document.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = doc.get(first)?;
    for part in parts {
        current = current.as_document()?.get(part)?;
    }
    Some(current)
}

/// Set a dotted path, creating intermediate sub-documents as needed.
///
/// A non-document value sitting on an intermediate segment is replaced.
pub fn set_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Document(Document::new()));
            if !matches!(entry, Value::Document(_)) {
                *entry = Value::Document(Document::new());
            }
            if let Value::Document(child) = entry {
                set_path(child, rest, value);
            }
        }
    }
}

/// Remove a dotted path. Returns the removed value, if any.
pub fn unset_path(doc: &mut Document, path: &str) -> Option<Value> {
    match path.split_once('.') {
        None => doc.remove(path),
        Some((head, rest)) => match doc.get_mut(head) {
            Some(Value::Document(child)) => unset_path(child, rest),
            _ => None,
        },
    }
}

/// A predicate on one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    In(Vec<Value>),
    Lt(Value),
}

impl Condition {
    fn matches(&self, field: Option<&Value>) -> bool {
        match self {
            // A missing field only equals null.
            Condition::Eq(expected) => match field {
                Some(actual) => actual == expected,
                None => *expected == Value::Null,
            },
            Condition::In(candidates) => match field {
                Some(actual) => candidates.iter().any(|c| c == actual),
                None => candidates.contains(&Value::Null),
            },
            Condition::Lt(bound) => field
                .and_then(|actual| actual.partial_order(bound))
                .is_some_and(|ord| ord == Ordering::Less),
        }
    }
}

/// Conjunction of field conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Condition)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((path.into(), Condition::Eq(value.into())));
        self
    }

    pub fn is_in<I, V>(mut self, path: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.clauses.push((path.into(), Condition::In(values)));
        self
    }

    pub fn lt(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((path.into(), Condition::Lt(value.into())));
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses
            .iter()
            .all(|(path, cond)| cond.matches(get_path(doc, path)))
    }

    /// Seed document for an upsert: every equality clause becomes a field.
    pub fn seed_document(&self) -> Document {
        let mut doc = Document::new();
        for (path, cond) in &self.clauses {
            if let Condition::Eq(value) = cond {
                set_path(&mut doc, path, value.clone());
            }
        }
        doc
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (path, cond)) in self.clauses.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match cond {
                Condition::Eq(v) => write!(f, "{}: {}", path, v)?,
                Condition::Lt(v) => write!(f, "{}: {{$lt: {}}}", path, v)?,
                Condition::In(vs) => write!(f, "{}: {{$in: [{} values]}}", path, vs.len())?,
            }
        }
        write!(f, "}}")
    }
}

/// Field-level update operators, applied in the order `$set`, `$unset`, `$inc`.
///
/// `$setOnInsert` fields are written only when an upsert creates the document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    set_on_insert: Vec<(String, Value)>,
    set: Vec<(String, Value)>,
    unset: Vec<String>,
    inc: Vec<(String, i64)>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.push((path.into(), value.into()));
        self
    }

    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.unset.push(path.into());
        self
    }

    pub fn inc(mut self, path: impl Into<String>, by: i64) -> Self {
        self.inc.push((path.into(), by));
        self
    }

    pub fn set_on_insert(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_on_insert.push((path.into(), value.into()));
        self
    }

    /// Apply to a document being created by an upsert.
    pub fn apply_on_insert(&self, doc: &mut Document) {
        for (path, value) in &self.set_on_insert {
            set_path(doc, path, value.clone());
        }
        self.apply(doc);
    }

    /// Apply to an existing document. `$setOnInsert` fields are skipped.
    pub fn apply(&self, doc: &mut Document) {
        for (path, value) in &self.set {
            set_path(doc, path, value.clone());
        }
        for path in &self.unset {
            unset_path(doc, path);
        }
        for (path, by) in &self.inc {
            let current = get_path(doc, path).and_then(Value::as_i64).unwrap_or(0);
            set_path(doc, path, Value::Int(current + by));
        }
    }
}

impl fmt::Display for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let on_insert: Vec<String> = self
            .set_on_insert
            .iter()
            .map(|(p, v)| format!("{}: {}", p, v))
            .collect();
        let sets: Vec<String> = self.set.iter().map(|(p, v)| format!("{}: {}", p, v)).collect();
        let incs: Vec<String> = self.inc.iter().map(|(p, n)| format!("{}: {}", p, n)).collect();
        write!(
            f,
            "{{$setOnInsert: {{{}}}, $set: {{{}}}, $unset: [{}], $inc: {{{}}}}}",
            on_insert.join(", "),
            sets.join(", "),
            self.unset.join(", "),
            incs.join(", ")
        )
    }
}

/// Restricts which fields a lookup returns.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    fields: Vec<String>,
}

impl Projection {
    pub fn of<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn apply(&self, doc: &Document) -> Document {
        let mut projected = Document::new();
        for field in &self.fields {
            if let Some(value) = get_path(doc, field) {
                set_path(&mut projected, field, value.clone());
            }
        }
        projected
    }
}

/// Index definition passed to `ensure_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub keys: Vec<String>,
    pub unique: bool,
    pub sparse: bool,
}

impl IndexSpec {
    pub fn unique<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            unique: true,
            sparse: false,
        }
    }

    /// Conventional index name, e.g. `id_1_version_1`.
    pub fn name(&self) -> String {
        self.keys
            .iter()
            .map(|k| format!("{}_1", k))
            .collect::<Vec<_>>()
            .join("_")
    }
}

/// Outcome of an `update` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteResult {
    pub matched: usize,
    pub modified: usize,
    pub upserted: bool,
}
