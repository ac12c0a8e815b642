//! Dot/bracket paths into a section's JSON tree.
//!
//! `activities[0].name` walks key `activities`, sequence index `0`, key `name`. Keys that
//! are not plain identifiers are written in quoted bracket form: `["fy.2024"]`. The empty
//! path addresses the section value itself.

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath {
    segments: Vec<PathSegment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldPathError {
    #[error("malformed field path '{path}' at byte {position}")]
    Syntax { path: String, position: usize },
    #[error("'{path}' does not lead through mappings and sequences")]
    NotAContainer { path: String },
    #[error("index {index} out of bounds in '{path}' (len {len})")]
    IndexOutOfBounds { path: String, index: usize, len: usize },
}

impl FieldPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn child_key(&self, key: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(PathSegment::Key(key.to_owned()));
        Self { segments }
    }

    /// Last key segment, ignoring trailing indices.
    pub fn last_key(&self) -> Option<&str> {
        self.segments.iter().rev().find_map(|segment| match segment {
            PathSegment::Key(key) => Some(key.as_str()),
            PathSegment::Index(_) => None,
        })
    }

    pub fn parse(path: &str) -> Result<Self, FieldPathError> {
        path.parse()
    }

    pub fn get<'v>(&self, root: &'v Value) -> Option<&'v Value> {
        let mut current = root;
        for segment in &self.segments {
            current = match (segment, current) {
                (PathSegment::Key(key), Value::Object(map)) => map.get(key)?,
                (PathSegment::Index(index), Value::Array(items)) => items.get(*index)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Writes `value` at this path, creating intermediate mappings for missing keys.
    /// An index equal to the sequence length appends.
    pub fn set(&self, root: &mut Value, value: Value) -> Result<(), FieldPathError> {
        let Some((last, parents)) = self.segments.split_last() else {
            *root = value;
            return Ok(());
        };
        let parent = self.descend_creating(root, parents)?;
        match (last, parent) {
            (PathSegment::Key(key), Value::Object(map)) => {
                map.insert(key.clone(), value);
                Ok(())
            }
            (PathSegment::Index(index), Value::Array(items)) => {
                if *index < items.len() {
                    items[*index] = value;
                    Ok(())
                } else if *index == items.len() {
                    items.push(value);
                    Ok(())
                } else {
                    Err(FieldPathError::IndexOutOfBounds {
                        path: self.to_string(),
                        index: *index,
                        len: items.len(),
                    })
                }
            }
            _ => Err(FieldPathError::NotAContainer {
                path: self.to_string(),
            }),
        }
    }

    /// Removes the value at this path. Returns it if there was one.
    pub fn remove(&self, root: &mut Value) -> Option<Value> {
        let (last, parents) = self.segments.split_last()?;
        let mut current = root;
        for segment in parents {
            current = match (segment, current) {
                (PathSegment::Key(key), Value::Object(map)) => map.get_mut(key)?,
                (PathSegment::Index(index), Value::Array(items)) => items.get_mut(*index)?,
                _ => return None,
            };
        }
        match (last, current) {
            (PathSegment::Key(key), Value::Object(map)) => map.remove(key),
            (PathSegment::Index(index), Value::Array(items)) if *index < items.len() => {
                Some(items.remove(*index))
            }
            _ => None,
        }
    }

    fn descend_creating<'v>(
        &self,
        root: &'v mut Value,
        segments: &[PathSegment],
    ) -> Result<&'v mut Value, FieldPathError> {
        let mut current = root;
        for segment in segments {
            if current.is_null() {
                *current = Value::Object(Map::new());
            }
            current = match (segment, current) {
                (PathSegment::Key(key), Value::Object(map)) => map
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new())),
                (PathSegment::Index(index), Value::Array(items)) => {
                    let len = items.len();
                    items
                        .get_mut(*index)
                        .ok_or_else(|| FieldPathError::IndexOutOfBounds {
                            path: self.to_string(),
                            index: *index,
                            len,
                        })?
                }
                _ => {
                    return Err(FieldPathError::NotAContainer {
                        path: self.to_string(),
                    })
                }
            };
        }
        Ok(current)
    }
}

fn is_plain_key(key: &str) -> bool {
    !key.is_empty()
        && !key.chars().next().is_some_and(|c| c.is_ascii_digit())
        && key
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '$')
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, segment) in self.segments.iter().enumerate() {
            match segment {
                PathSegment::Key(key) if is_plain_key(key) => {
                    if position > 0 {
                        f.write_str(".")?;
                    }
                    f.write_str(key)?;
                }
                PathSegment::Key(key) => {
                    let quoted = serde_json::to_string(key).map_err(|_| fmt::Error)?;
                    write!(f, "[{quoted}]")?;
                }
                PathSegment::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

fn key_end(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && !matches!(bytes[pos], b'.' | b'[' | b']') {
        pos += 1;
    }
    pos
}

impl FromStr for FieldPath {
    type Err = FieldPathError;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        let syntax = |position: usize| FieldPathError::Syntax {
            path: path.to_owned(),
            position,
        };
        let bytes = path.as_bytes();
        let mut segments = Vec::new();
        let mut pos = 0;

        while pos < bytes.len() {
            match bytes[pos] {
                b'.' => {
                    if segments.is_empty() {
                        return Err(syntax(pos));
                    }
                    pos += 1;
                    let start = pos;
                    pos = key_end(bytes, pos);
                    if start == pos {
                        return Err(syntax(start));
                    }
                    segments.push(PathSegment::Key(path[start..pos].to_owned()));
                }
                b'[' if bytes.get(pos + 1) == Some(&b'"') => {
                    let start = pos + 1;
                    let mut end = start + 1;
                    while end < bytes.len() {
                        match bytes[end] {
                            b'\\' => end += 2,
                            b'"' => break,
                            _ => end += 1,
                        }
                    }
                    if end >= bytes.len() || bytes.get(end + 1) != Some(&b']') {
                        return Err(syntax(pos));
                    }
                    let key: String =
                        serde_json::from_str(&path[start..=end]).map_err(|_| syntax(start))?;
                    segments.push(PathSegment::Key(key));
                    pos = end + 2;
                }
                b'[' => {
                    let start = pos + 1;
                    let mut end = start;
                    while end < bytes.len() && bytes[end].is_ascii_digit() {
                        end += 1;
                    }
                    if end == start || bytes.get(end) != Some(&b']') {
                        return Err(syntax(pos));
                    }
                    let index = path[start..end].parse().map_err(|_| syntax(start))?;
                    segments.push(PathSegment::Index(index));
                    pos = end + 1;
                }
                _ if segments.is_empty() => {
                    let start = pos;
                    pos = key_end(bytes, pos);
                    segments.push(PathSegment::Key(path[start..pos].to_owned()));
                }
                _ => return Err(syntax(pos)),
            }
        }

        Ok(Self { segments })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(text: &str) -> FieldPath {
        FieldPath::parse(text).expect("path")
    }

    #[test]
    fn parses_keys_indices_and_quoted_keys() {
        let parsed = path(r#"activities[0].costs["fy.2024"]"#);
        assert_eq!(
            parsed.segments(),
            &[
                PathSegment::Key("activities".into()),
                PathSegment::Index(0),
                PathSegment::Key("costs".into()),
                PathSegment::Key("fy.2024".into()),
            ]
        );
        assert_eq!(parsed.to_string(), r#"activities[0].costs["fy.2024"]"#);
        assert_eq!(parsed.last_key(), Some("fy.2024"));
    }

    #[test]
    fn empty_path_is_root() {
        assert!(path("").is_root());
        assert_eq!(FieldPath::root().to_string(), "");
    }

    #[test]
    fn rejects_malformed_paths() {
        for bad in [".a", "a..b", "a[", "a[x]", "a]b", r#"a["open]"#] {
            assert!(FieldPath::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn set_creates_intermediate_mappings_and_appends() {
        let mut root = json!({});
        path("budget.federal").set(&mut root, json!(90)).expect("set");
        path("items").set(&mut root, json!([])).expect("set");
        path("items[0]").set(&mut root, json!("first")).expect("append");
        assert_eq!(root, json!({"budget": {"federal": 90}, "items": ["first"]}));

        let err = path("items[5]").set(&mut root, json!("far")).unwrap_err();
        assert!(matches!(err, FieldPathError::IndexOutOfBounds { index: 5, len: 1, .. }));
        assert_eq!(err.to_string(), "index 5 out of bounds in 'items[5]' (len 1)");

        let err = path("budget.federal.share").set(&mut root, json!(1)).unwrap_err();
        assert!(matches!(err, FieldPathError::NotAContainer { .. }));
    }

    #[test]
    fn get_and_remove_follow_the_same_path() {
        let mut root = json!({"a": {"b": [1, {"c": true}]}});
        assert_eq!(path("a.b[1].c").get(&root), Some(&json!(true)));
        assert_eq!(path("a.missing").get(&root), None);
        assert_eq!(path("a.b[1].c").remove(&mut root), Some(json!(true)));
        assert_eq!(root, json!({"a": {"b": [1, {}]}}));
    }
}
