//! Diff/reconcile engine.
//!
//! Computes the minimal change that moves an observed object toward a
//! desired manifest. Only fields present in the desired manifest are owned:
//! anything else on the observed object is left alone. A desired `null`
//! claims a field must be absent.
//!
//! Lists compare positionally unless a merge key is known for the list, in
//! which case entries are matched by key and reordering is not a change.
//! Keyed entries may carry `"$patch": "delete"` to request removal.

use std::collections::BTreeMap;
use std::fmt;

use keel_core::{Error, Result};
use serde_json::{Map, Value};

const PATCH_DIRECTIVE: &str = "$patch";
const DELETE: &str = "delete";

/// One step of a path into a manifest.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
    /// List entry whose `key` field equals `value`.
    Keyed { key: String, value: Value },
}

/// A single mutation of an observed object.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
    Set { path: Vec<PathSegment>, value: Value },
    Remove { path: Vec<PathSegment> },
}

impl PatchOp {
    #[must_use]
    pub fn path(&self) -> &[PathSegment] {
        match self {
            Self::Set { path, .. } | Self::Remove { path } => path,
        }
    }
}

impl fmt::Display for PatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set { path, value } => write!(f, "set {} = {value}", display_path(path)),
            Self::Remove { path } => write!(f, "remove {}", display_path(path)),
        }
    }
}

/// Render a path as `spec.containers[name=web].image`.
#[must_use]
pub fn display_path(path: &[PathSegment]) -> String {
    let mut out = String::new();
    for segment in path {
        match segment {
            PathSegment::Field(name) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(name);
            }
            PathSegment::Index(i) => out.push_str(&format!("[{i}]")),
            PathSegment::Keyed { key, value } => match value {
                Value::String(s) => out.push_str(&format!("[{key}={s}]")),
                other => out.push_str(&format!("[{key}={other}]")),
            },
        }
    }
    out
}

/// What must happen to bring one object to its desired state.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// The object does not exist; create it with this content.
    Create(Value),
    /// The object exists and differs in owned fields.
    Patch(Vec<PatchOp>),
    /// Nothing to do.
    NoOp,
}

impl Plan {
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp)
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Patch(_) => "patch",
            Self::NoOp => "noop",
        }
    }
}

/// Merge keys for lists, looked up by dotted field path first and then by
/// the list's own field name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeKeys {
    by_path: BTreeMap<String, String>,
    by_field: BTreeMap<String, String>,
}

impl Default for MergeKeys {
    fn default() -> Self {
        let by_field = [
            ("containers", "name"),
            ("initContainers", "name"),
            ("ephemeralContainers", "name"),
            ("env", "name"),
            ("volumes", "name"),
            ("imagePullSecrets", "name"),
            ("volumeMounts", "mountPath"),
            ("volumeDevices", "devicePath"),
            ("ports", "containerPort"),
        ]
        .into_iter()
        .map(|(field, key)| (field.to_string(), key.to_string()))
        .collect();

        Self {
            by_path: BTreeMap::new(),
            by_field,
        }
    }
}

impl MergeKeys {
    /// No merge keys at all: every list compares positionally.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            by_path: BTreeMap::new(),
            by_field: BTreeMap::new(),
        }
    }

    /// Defaults extended with configured keys.
    #[must_use]
    pub fn from_config(extra: &BTreeMap<String, String>) -> Self {
        extra
            .iter()
            .fold(Self::default(), |keys, (path, key)| keys.with_key(path, key))
    }

    /// Register a key. A path containing `.` matches that exact field path;
    /// a bare name matches any list with that field name.
    #[must_use]
    pub fn with_key(mut self, path: impl Into<String>, key: impl Into<String>) -> Self {
        let path = path.into();
        if path.contains('.') {
            self.by_path.insert(path, key.into());
        } else {
            self.by_field.insert(path, key.into());
        }
        self
    }

    fn key_for(&self, path: &[PathSegment]) -> Option<&str> {
        let fields: Vec<&str> = path
            .iter()
            .filter_map(|s| match s {
                PathSegment::Field(name) => Some(name.as_str()),
                _ => None,
            })
            .collect();

        self.by_path
            .get(&fields.join("."))
            .or_else(|| fields.last().and_then(|last| self.by_field.get(*last)))
            .map(String::as_str)
    }
}

/// Plan with the default merge keys.
#[must_use]
pub fn plan(desired: &Value, observed: Option<&Value>) -> Plan {
    plan_with(desired, observed, &MergeKeys::default())
}

/// Plan the change from `observed` (if any) to `desired`.
#[must_use]
pub fn plan_with(desired: &Value, observed: Option<&Value>, keys: &MergeKeys) -> Plan {
    let Some(observed) = observed else {
        return Plan::Create(normalized(desired));
    };

    let mut differ = Differ {
        keys,
        ops: Vec::new(),
    };
    differ.value(&mut Vec::new(), desired, observed);

    if differ.ops.is_empty() {
        Plan::NoOp
    } else {
        Plan::Patch(differ.ops)
    }
}

struct Differ<'a> {
    keys: &'a MergeKeys,
    ops: Vec<PatchOp>,
}

impl Differ<'_> {
    fn value(&mut self, path: &mut Vec<PathSegment>, desired: &Value, observed: &Value) {
        match (desired, observed) {
            (Value::Object(d), Value::Object(o)) => self.object(path, d, o),
            (Value::Array(d), Value::Array(o)) => self.array(path, d, o),
            (d, o) if values_equal(d, o) => {}
            (d, _) => self.set(path, d),
        }
    }

    fn object(
        &mut self,
        path: &mut Vec<PathSegment>,
        desired: &Map<String, Value>,
        observed: &Map<String, Value>,
    ) {
        for (key, d) in desired {
            if key == PATCH_DIRECTIVE {
                continue;
            }
            path.push(PathSegment::Field(key.clone()));
            match (d, observed.get(key)) {
                (Value::Null, None | Some(Value::Null)) => {}
                (Value::Null, Some(_)) => self.ops.push(PatchOp::Remove { path: path.clone() }),
                (d, None | Some(Value::Null)) => self.set(path, d),
                (d, Some(o)) => self.value(path, d, o),
            }
            path.pop();
        }
    }

    fn array(&mut self, path: &mut Vec<PathSegment>, desired: &[Value], observed: &[Value]) {
        if let Some(key) = self.keys.key_for(path).filter(|key| keyed(desired, key)) {
            let key = key.to_string();
            self.keyed_array(path, &key, desired, observed);
            return;
        }

        let effective: Vec<&Value> = desired.iter().filter(|e| !is_delete(e)).collect();
        if effective.len() != observed.len() {
            self.set(path, &Value::Array(desired.to_vec()));
            return;
        }
        for (i, (d, o)) in effective.into_iter().zip(observed).enumerate() {
            path.push(PathSegment::Index(i));
            self.value(path, d, o);
            path.pop();
        }
    }

    fn keyed_array(
        &mut self,
        path: &mut Vec<PathSegment>,
        key: &str,
        desired: &[Value],
        observed: &[Value],
    ) {
        for entry in desired {
            let Some(key_value) = entry.get(key) else {
                continue;
            };
            let current = observed.iter().find(|o| key_matches(o, key, key_value));
            path.push(PathSegment::Keyed {
                key: key.to_string(),
                value: key_value.clone(),
            });
            match current {
                Some(_) if is_delete(entry) => {
                    self.ops.push(PatchOp::Remove { path: path.clone() });
                }
                None if is_delete(entry) => {}
                Some(o) => self.value(path, entry, o),
                None => self.set(path, entry),
            }
            path.pop();
        }
    }

    fn set(&mut self, path: &[PathSegment], value: &Value) {
        self.ops.push(PatchOp::Set {
            path: path.to_vec(),
            value: normalized(value),
        });
    }
}

/// A list is keyed when every entry is an object carrying a unique scalar key.
fn keyed(entries: &[Value], key: &str) -> bool {
    let mut seen: Vec<&Value> = Vec::with_capacity(entries.len());
    entries.iter().all(|entry| match entry.get(key) {
        Some(value @ (Value::String(_) | Value::Number(_) | Value::Bool(_))) => {
            let unique = !seen.iter().any(|prior| values_equal(prior, value));
            seen.push(value);
            unique
        }
        _ => false,
    })
}

fn is_delete(entry: &Value) -> bool {
    entry
        .get(PATCH_DIRECTIVE)
        .and_then(Value::as_str)
        .is_some_and(|d| d == DELETE)
}

fn key_matches(entry: &Value, key: &str, expected: &Value) -> bool {
    entry.get(key).is_some_and(|v| values_equal(v, expected))
}

/// Scalars compare by value: `1` and `1.0` are equal, large integers
/// compare exactly.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return x == y;
            }
            if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                return x == y;
            }
            match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => (x - y).abs() <= f64::EPSILON * x.abs().max(y.abs()),
                _ => false,
            }
        }
        _ => a == b,
    }
}

/// The form an object takes once stored: explicit nulls, patch directives
/// and delete entries dropped.
#[must_use]
pub fn normalized(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, v)| !v.is_null() && k.as_str() != PATCH_DIRECTIVE)
                .map(|(k, v)| (k.clone(), normalized(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .filter(|e| !is_delete(e))
                .map(normalized)
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Apply patch operations to an object in place.
///
/// # Errors
///
/// Returns `Error::InvalidManifest` if a `Set` targets a missing parent or
/// an index out of range.
pub fn apply_patch(target: &mut Value, ops: &[PatchOp]) -> Result<()> {
    for op in ops {
        match op {
            PatchOp::Set { path, value } => set_at(target, path, value.clone())?,
            PatchOp::Remove { path } => remove_at(target, path),
        }
    }
    Ok(())
}

fn descend<'a>(mut current: &'a mut Value, segments: &[PathSegment]) -> Option<&'a mut Value> {
    for segment in segments {
        current = match segment {
            PathSegment::Field(name) => current.get_mut(name.as_str())?,
            PathSegment::Index(i) => current.get_mut(*i)?,
            PathSegment::Keyed { key, value } => current
                .as_array_mut()?
                .iter_mut()
                .find(|entry| key_matches(entry, key, value))?,
        };
    }
    Some(current)
}

fn set_at(target: &mut Value, path: &[PathSegment], value: Value) -> Result<()> {
    let Some((last, parents)) = path.split_last() else {
        *target = value;
        return Ok(());
    };
    let missing =
        || Error::invalid_manifest(format!("patch target {} not found", display_path(path)));
    let parent = descend(target, parents).ok_or_else(missing)?;

    match (last, parent) {
        (PathSegment::Field(name), Value::Object(map)) => {
            map.insert(name.clone(), value);
        }
        (PathSegment::Index(i), Value::Array(items)) => {
            let slot = items.get_mut(*i).ok_or_else(missing)?;
            *slot = value;
        }
        (PathSegment::Keyed { key, value: key_value }, Value::Array(items)) => {
            match items.iter_mut().find(|entry| key_matches(entry, key, key_value)) {
                Some(slot) => *slot = value,
                None => items.push(value),
            }
        }
        _ => {
            return Err(Error::invalid_manifest(format!(
                "patch target {} has the wrong shape",
                display_path(path)
            )));
        }
    }
    Ok(())
}

fn remove_at(target: &mut Value, path: &[PathSegment]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let Some(parent) = descend(target, parents) else {
        return;
    };
    match (last, parent) {
        (PathSegment::Field(name), Value::Object(map)) => {
            map.remove(name);
        }
        (PathSegment::Index(i), Value::Array(items)) => {
            if *i < items.len() {
                items.remove(*i);
            }
        }
        (PathSegment::Keyed { key, value }, Value::Array(items)) => {
            items.retain(|entry| !key_matches(entry, key, value));
        }
        _ => {}
    }
}
