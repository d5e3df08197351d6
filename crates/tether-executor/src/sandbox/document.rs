//! Host-side document the constrained capability surface operates on.

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Document operation error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocError {
    #[error("Invalid pointer {0:?}: must be empty or start with '/'")]
    InvalidPointer(String),
    #[error("No parent container for {0:?}")]
    MissingParent(String),
    #[error("Index out of bounds at {0:?}")]
    OutOfBounds(String),
    #[error("Value at {0:?} is not an array")]
    NotAnArray(String),
    #[error("Cannot replace the document root with {0}")]
    InvalidRoot(&'static str),
}

/// One capability call, as it crosses the sandbox boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum DocOp {
    /// Read the value at a JSON pointer (`null` when absent).
    Get { pointer: String },
    /// Write a value, creating the final key if needed.
    Set { pointer: String, value: Value },
    /// Remove and return the value at a pointer.
    Remove { pointer: String },
    /// Elements of the array at `pointer` whose `key` equals `value`.
    Query {
        pointer: String,
        key: String,
        value: Value,
    },
    /// Object keys, or array indices, at a pointer.
    Keys { pointer: String },
}

/// Shared JSON document.
#[derive(Debug, Clone)]
pub struct Document {
    root: Arc<RwLock<Value>>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new(Value::Object(serde_json::Map::new()))
    }
}

impl Document {
    #[must_use]
    pub fn new(root: Value) -> Self {
        Self {
            root: Arc::new(RwLock::new(root)),
        }
    }

    /// Copy of the whole document.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        self.root
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the whole document.
    pub fn replace(&self, root: Value) {
        *self.root.write().unwrap_or_else(PoisonError::into_inner) = root;
    }

    /// Apply one operation.
    ///
    /// # Errors
    /// Returns error if the pointer is malformed or does not fit the document shape.
    pub fn apply(&self, op: DocOp) -> Result<Value, DocError> {
        match op {
            DocOp::Get { pointer } => {
                check_pointer(&pointer)?;
                let root = self.root.read().unwrap_or_else(PoisonError::into_inner);
                Ok(root.pointer(&pointer).cloned().unwrap_or(Value::Null))
            }
            DocOp::Set { pointer, value } => {
                let mut root = self.root.write().unwrap_or_else(PoisonError::into_inner);
                set(&mut root, &pointer, value)
            }
            DocOp::Remove { pointer } => {
                let mut root = self.root.write().unwrap_or_else(PoisonError::into_inner);
                remove(&mut root, &pointer)
            }
            DocOp::Query {
                pointer,
                key,
                value,
            } => {
                check_pointer(&pointer)?;
                let root = self.root.read().unwrap_or_else(PoisonError::into_inner);
                match root.pointer(&pointer) {
                    Some(Value::Array(items)) => Ok(Value::Array(
                        items
                            .iter()
                            .filter(|item| item.get(&key) == Some(&value))
                            .cloned()
                            .collect(),
                    )),
                    Some(_) => Err(DocError::NotAnArray(pointer)),
                    None => Ok(Value::Array(Vec::new())),
                }
            }
            DocOp::Keys { pointer } => {
                check_pointer(&pointer)?;
                let root = self.root.read().unwrap_or_else(PoisonError::into_inner);
                Ok(match root.pointer(&pointer) {
                    Some(Value::Object(map)) => {
                        Value::Array(map.keys().cloned().map(Value::String).collect())
                    }
                    Some(Value::Array(items)) => Value::Array((0..items.len()).map(Value::from).collect()),
                    _ => Value::Array(Vec::new()),
                })
            }
        }
    }
}

fn check_pointer(pointer: &str) -> Result<(), DocError> {
    if pointer.is_empty() || pointer.starts_with('/') {
        Ok(())
    } else {
        Err(DocError::InvalidPointer(pointer.to_string()))
    }
}

/// Split into parent pointer and unescaped final token.
fn split_last(pointer: &str) -> Result<(&str, String), DocError> {
    check_pointer(pointer)?;
    let idx = pointer
        .rfind('/')
        .ok_or_else(|| DocError::InvalidPointer(pointer.to_string()))?;
    let token = pointer[idx + 1..].replace("~1", "/").replace("~0", "~");
    Ok((&pointer[..idx], token))
}

fn set(root: &mut Value, pointer: &str, value: Value) -> Result<Value, DocError> {
    if pointer.is_empty() {
        if !value.is_object() && !value.is_array() {
            return Err(DocError::InvalidRoot("a scalar"));
        }
        return Ok(std::mem::replace(root, value));
    }
    let (parent, token) = split_last(pointer)?;
    match root.pointer_mut(parent) {
        Some(Value::Object(map)) => Ok(map.insert(token, value).unwrap_or(Value::Null)),
        Some(Value::Array(items)) => {
            if token == "-" {
                items.push(value);
                return Ok(Value::Null);
            }
            let index: usize = token
                .parse()
                .map_err(|_| DocError::OutOfBounds(pointer.to_string()))?;
            match index.cmp(&items.len()) {
                std::cmp::Ordering::Less => Ok(std::mem::replace(&mut items[index], value)),
                std::cmp::Ordering::Equal => {
                    items.push(value);
                    Ok(Value::Null)
                }
                std::cmp::Ordering::Greater => Err(DocError::OutOfBounds(pointer.to_string())),
            }
        }
        _ => Err(DocError::MissingParent(pointer.to_string())),
    }
}

fn remove(root: &mut Value, pointer: &str) -> Result<Value, DocError> {
    if pointer.is_empty() {
        return Err(DocError::InvalidRoot("nothing"));
    }
    let (parent, token) = split_last(pointer)?;
    Ok(match root.pointer_mut(parent) {
        Some(Value::Object(map)) => map.remove(&token).unwrap_or(Value::Null),
        Some(Value::Array(items)) => match token.parse::<usize>() {
            Ok(index) if index < items.len() => items.remove(index),
            _ => Value::Null,
        },
        _ => Value::Null,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc() -> Document {
        Document::new(json!({
            "title": "Inbox",
            "items": [
                {"id": 1, "state": "open"},
                {"id": 2, "state": "done"},
                {"id": 3, "state": "open"},
            ],
            "a/b": {"c~d": 5},
        }))
    }

    #[test]
    fn get_existing_and_missing() {
        let d = doc();
        assert_eq!(d.apply(DocOp::Get { pointer: "/title".into() }).unwrap(), "Inbox");
        assert_eq!(d.apply(DocOp::Get { pointer: "/nope".into() }).unwrap(), Value::Null);
        assert_eq!(d.apply(DocOp::Get { pointer: "/a~1b/c~0d".into() }).unwrap(), 5);
        assert!(d.apply(DocOp::Get { pointer: "title".into() }).is_err());
    }

    #[test]
    fn set_object_key_and_array_slots() {
        let d = doc();
        let prev = d
            .apply(DocOp::Set { pointer: "/title".into(), value: json!("Archive") })
            .unwrap();
        assert_eq!(prev, "Inbox");
        d.apply(DocOp::Set { pointer: "/items/-".into(), value: json!({"id": 4}) })
            .unwrap();
        d.apply(DocOp::Set { pointer: "/items/0/state".into(), value: json!("done") })
            .unwrap();

        let snap = d.snapshot();
        assert_eq!(snap["title"], "Archive");
        assert_eq!(snap["items"].as_array().unwrap().len(), 4);
        assert_eq!(snap["items"][0]["state"], "done");
    }

    #[test]
    fn set_without_parent_fails() {
        let d = doc();
        assert_eq!(
            d.apply(DocOp::Set { pointer: "/missing/leaf".into(), value: json!(1) }),
            Err(DocError::MissingParent("/missing/leaf".into()))
        );
        assert!(matches!(
            d.apply(DocOp::Set { pointer: "/items/9".into(), value: json!(1) }),
            Err(DocError::OutOfBounds(_))
        ));
    }

    #[test]
    fn query_filters_array() {
        let d = doc();
        let open = d
            .apply(DocOp::Query {
                pointer: "/items".into(),
                key: "state".into(),
                value: json!("open"),
            })
            .unwrap();
        assert_eq!(open, json!([{"id": 1, "state": "open"}, {"id": 3, "state": "open"}]));
        assert!(matches!(
            d.apply(DocOp::Query { pointer: "/title".into(), key: "x".into(), value: json!(1) }),
            Err(DocError::NotAnArray(_))
        ));
    }

    #[test]
    fn remove_and_keys() {
        let d = doc();
        assert_eq!(d.apply(DocOp::Remove { pointer: "/items/1".into() }).unwrap()["id"], 2);
        assert_eq!(d.apply(DocOp::Keys { pointer: "/items".into() }).unwrap(), json!([0, 1]));
        d.apply(DocOp::Remove { pointer: "/a~1b".into() }).unwrap();
        let keys = d.apply(DocOp::Keys { pointer: String::new() }).unwrap();
        let mut keys: Vec<&str> = keys
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["items", "title"]);
    }
}
