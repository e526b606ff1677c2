// Deep-path mutation of JSON-shaped documents.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// How the value at the final path segment is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchMode {
    Replace,
    /// Concatenate onto an existing string (incremental token streaming).
    Append,
}

impl PatchMode {
    pub fn from_incremental(is_incremental_string_change: bool) -> Self {
        if is_incremental_string_change {
            Self::Append
        } else {
            Self::Replace
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum PatchError {
    #[error("patch path is empty")]
    EmptyPath,
    #[error("cannot descend into `{path}`: not an object")]
    NotAnObject { path: String },
    #[error("cannot append at `{path}`: existing value is not a string")]
    AppendToNonString { path: String },
    #[error("cannot append at `{path}`: patch value is not a string")]
    AppendValueNotString { path: String },
    #[error("patched document no longer matches its schema: {0}")]
    Schema(String),
}

/// Walk `path` inside `target` and write `value` at the final segment.
///
/// Missing or null intermediate segments become empty objects. Array
/// elements can be addressed with numeric segments. In `Append` mode the
/// existing value must already be a string.
pub fn set_path<S: AsRef<str>>(
    target: &mut Value,
    path: &[S],
    value: Value,
    mode: PatchMode,
) -> Result<(), PatchError> {
    let Some((last, parents)) = path.split_last() else {
        return Err(PatchError::EmptyPath);
    };

    let mut current = target;
    for (depth, segment) in parents.iter().enumerate() {
        let segment = segment.as_ref();
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => {
                map.entry(segment.to_string()).or_insert_with(|| Value::Object(Map::new()))
            }
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(item) => item,
                None => return Err(PatchError::NotAnObject { path: join(&path[..=depth]) }),
            },
            _ => return Err(PatchError::NotAnObject { path: join(&path[..depth]) }),
        };
    }

    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    let slot = match current {
        Value::Object(map) => {
            if mode == PatchMode::Replace {
                map.insert(last.as_ref().to_string(), value);
                return Ok(());
            }
            map.get_mut(last.as_ref())
        }
        Value::Array(items) => last.as_ref().parse::<usize>().ok().and_then(|i| items.get_mut(i)),
        _ => return Err(PatchError::NotAnObject { path: join(parents) }),
    };

    match (mode, slot) {
        (PatchMode::Replace, Some(slot)) => {
            *slot = value;
            Ok(())
        }
        (PatchMode::Replace, None) => Err(PatchError::NotAnObject { path: join(path) }),
        (PatchMode::Append, Some(Value::String(existing))) => match value {
            Value::String(suffix) => {
                existing.push_str(&suffix);
                Ok(())
            }
            _ => Err(PatchError::AppendValueNotString { path: join(path) }),
        },
        (PatchMode::Append, _) => Err(PatchError::AppendToNonString { path: join(path) }),
    }
}

/// Patch a typed document by round-tripping it through JSON.
///
/// Returns a new document; `target` is never modified, so a failed patch
/// leaves the caller's value untouched.
pub fn patch_typed<T, S>(target: &T, path: &[S], value: Value, mode: PatchMode) -> Result<T, PatchError>
where
    T: Serialize + DeserializeOwned,
    S: AsRef<str>,
{
    let mut document =
        serde_json::to_value(target).map_err(|error| PatchError::Schema(error.to_string()))?;
    set_path(&mut document, path, value, mode)?;
    serde_json::from_value(document).map_err(|error| PatchError::Schema(error.to_string()))
}

pub fn join<S: AsRef<str>>(path: &[S]) -> String {
    path.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(".")
}
