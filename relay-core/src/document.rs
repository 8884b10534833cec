//! The state document: a tree of tagged sum nodes (object | array | scalar |
//! measurement) rather than a dynamic `serde_json::Value` tree, so that path
//! resolution and patch application share one pattern match and strictly
//! typed measurement records get a distinct node kind instead of an
//! ad hoc map shape.

use std::collections::BTreeMap;

use relay_types::Measurement;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Node {
    Object(BTreeMap<String, Node>),
    Array(Vec<Node>),
    Scalar(serde_json::Value),
    Measurement(Measurement),
}

impl Node {
    pub fn empty_object() -> Self {
        Node::Object(BTreeMap::new())
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Node::Object(map) => {
                serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
            Node::Array(items) => serde_json::Value::Array(items.iter().map(Node::to_json).collect()),
            Node::Scalar(value) => value.clone(),
            Node::Measurement(m) => serde_json::to_value(m).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(map) => {
                if let Ok(m) = serde_json::from_value::<Measurement>(serde_json::Value::Object(map.clone())) {
                    return Node::Measurement(m);
                }
                Node::Object(map.into_iter().map(|(k, v)| (k, Node::from_json(v))).collect())
            }
            serde_json::Value::Array(items) => Node::Array(items.into_iter().map(Node::from_json).collect()),
            other => Node::Scalar(other),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum DocError {
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("invalid array index in path: {0}")]
    InvalidIndex(String),
    #[error("path does not address a container: {0}")]
    NotAContainer(String),
}

/// Splits `/a/b/c` into `["a", "b", "c"]`. The empty path (root) is `[]`.
pub fn split_path(path: &str) -> Vec<&str> {
    path.trim_start_matches('/').split('/').filter(|s| !s.is_empty()).collect()
}

pub struct Document {
    pub root: Node,
}

impl Default for Document {
    fn default() -> Self {
        Self { root: Node::empty_object() }
    }
}

impl Document {
    pub fn get(&self, path: &str) -> Option<&Node> {
        let segments = split_path(path);
        let mut current = &self.root;
        for seg in segments {
            current = index_into(current, seg)?;
        }
        Some(current)
    }

    /// `add`: creates intermediate objects as needed along the path.
    pub fn add(&mut self, path: &str, value: Node) -> Result<(), DocError> {
        let segments = split_path(path);
        if segments.is_empty() {
            self.root = value;
            return Ok(());
        }
        let (parent_segments, last) = segments.split_at(segments.len() - 1);
        let parent = ensure_object_path(&mut self.root, parent_segments)?;
        set_child(parent, last[0], value)
    }

    /// `replace`: fails with `PathNotFound` if the parent path does not exist.
    pub fn replace(&mut self, path: &str, value: Node) -> Result<(), DocError> {
        let segments = split_path(path);
        if segments.is_empty() {
            self.root = value;
            return Ok(());
        }
        let (parent_segments, last) = segments.split_at(segments.len() - 1);
        let parent = index_into_mut(&mut self.root, parent_segments)
            .ok_or_else(|| DocError::PathNotFound(path.to_string()))?;
        set_child(parent, last[0], value)
    }

    pub fn remove(&mut self, path: &str) -> Result<(), DocError> {
        let segments = split_path(path);
        if segments.is_empty() {
            self.root = Node::empty_object();
            return Ok(());
        }
        let (parent_segments, last) = segments.split_at(segments.len() - 1);
        let parent = index_into_mut(&mut self.root, parent_segments)
            .ok_or_else(|| DocError::PathNotFound(path.to_string()))?;
        remove_child(parent, last[0])
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.root.to_json()
    }
}

fn index_into<'a>(node: &'a Node, segment: &str) -> Option<&'a Node> {
    match node {
        Node::Object(map) => map.get(segment),
        Node::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

fn index_into_mut<'a>(root: &'a mut Node, segments: &[&str]) -> Option<&'a mut Node> {
    let mut current = root;
    for seg in segments {
        current = match current {
            Node::Object(map) => map.get_mut(*seg)?,
            Node::Array(items) => items.get_mut(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn ensure_object_path<'a>(root: &'a mut Node, segments: &[&str]) -> Result<&'a mut Node, DocError> {
    let mut current = root;
    for seg in segments {
        if matches!(current, Node::Scalar(_) | Node::Measurement(_)) {
            return Err(DocError::NotAContainer(seg.to_string()));
        }
        if let Node::Object(_) = current {
        } else if matches!(current, Node::Array(_)) {
            // Arrays are addressed by index, not auto-vivified by add.
            return Err(DocError::InvalidIndex(seg.to_string()));
        }
        let map = match current {
            Node::Object(map) => map,
            _ => unreachable!(),
        };
        current = map.entry(seg.to_string()).or_insert_with(Node::empty_object);
    }
    Ok(current)
}

fn set_child(parent: &mut Node, key: &str, value: Node) -> Result<(), DocError> {
    match parent {
        Node::Object(map) => {
            map.insert(key.to_string(), value);
            Ok(())
        }
        Node::Array(items) => {
            if key == "-" {
                items.push(value);
                return Ok(());
            }
            let idx: usize = key.parse().map_err(|_| DocError::InvalidIndex(key.to_string()))?;
            if idx == items.len() {
                items.push(value);
            } else if idx < items.len() {
                items[idx] = value;
            } else {
                return Err(DocError::InvalidIndex(key.to_string()));
            }
            Ok(())
        }
        _ => Err(DocError::NotAContainer(key.to_string())),
    }
}

fn remove_child(parent: &mut Node, key: &str) -> Result<(), DocError> {
    match parent {
        Node::Object(map) => {
            map.remove(key).map(|_| ()).ok_or_else(|| DocError::PathNotFound(key.to_string()))
        }
        Node::Array(items) => {
            let idx: usize = key.parse().map_err(|_| DocError::InvalidIndex(key.to_string()))?;
            if idx < items.len() {
                items.remove(idx);
                Ok(())
            } else {
                Err(DocError::InvalidIndex(key.to_string()))
            }
        }
        _ => Err(DocError::NotAContainer(key.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_creates_intermediate_objects() {
        let mut doc = Document::default();
        doc.add("/navigation/position", Node::Scalar(serde_json::json!({"lat": 1.0}))).unwrap();
        assert_eq!(doc.get("/navigation/position").unwrap().to_json(), serde_json::json!({"lat": 1.0}));
    }

    #[test]
    fn replace_missing_parent_fails() {
        let mut doc = Document::default();
        let err = doc.replace("/navigation/position", Node::Scalar(serde_json::json!(1))).unwrap_err();
        assert_eq!(err, DocError::PathNotFound("/navigation/position".to_string()));
    }

    #[test]
    fn remove_missing_path_fails() {
        let mut doc = Document::default();
        doc.add("/alerts", Node::empty_object()).unwrap();
        let err = doc.remove("/alerts/active").unwrap_err();
        assert_eq!(err, DocError::PathNotFound("active".to_string()));
    }

    #[test]
    fn array_index_replace_and_out_of_bounds() {
        let mut doc = Document::default();
        doc.add("/alerts/active", Node::Array(vec![])).unwrap();
        doc.add("/alerts/active/0", Node::Scalar(serde_json::json!("a"))).unwrap();
        doc.replace("/alerts/active/0", Node::Scalar(serde_json::json!("b"))).unwrap();
        assert_eq!(doc.get("/alerts/active/0").unwrap().to_json(), serde_json::json!("b"));
        let err = doc.replace("/alerts/active/5", Node::Scalar(serde_json::json!("c"))).unwrap_err();
        assert_eq!(err, DocError::InvalidIndex("5".to_string()));
    }
}
