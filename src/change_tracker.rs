//! Field-level diffs between two section snapshots.
//!
//! Traversal is section key order, then field key order. Both come from the canonical
//! ordering of [`Sections`], so the same two snapshots always produce the same list.
//! Recursion continues only while both sides are mappings; anything else that differs
//! (scalars, sequences, a mapping replaced by a scalar) is reported as one leaf change.
//!
//! [`apply`] is the exact inverse of [`diff`]: `apply(a, diff(a, b)) == b`.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};

use crate::field_path::{FieldPath, FieldPathError};
use crate::ids::{DocumentId, FieldChangeId};
use crate::local_db_model::{ChangeType, FieldChange, Sections};

/// A difference before it is stamped with an id, document and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDelta {
    pub section: String,
    pub path: FieldPath,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub change_type: ChangeType,
}

impl FieldDelta {
    pub fn into_change(self, document_id: &DocumentId, timestamp: DateTime<Utc>) -> FieldChange {
        let field_label = field_label(&self.section, &self.path);
        FieldChange {
            id: FieldChangeId::generate(),
            document_id: document_id.clone(),
            section: self.section,
            field_path: self.path.to_string(),
            field_label,
            old_value: self.old_value,
            new_value: self.new_value,
            change_type: self.change_type,
            timestamp,
            version_id: None,
        }
    }
}

pub fn diff(document_id: &DocumentId, old: &Sections, new: &Sections) -> Vec<FieldChange> {
    diff_at(document_id, old, new, Utc::now())
}

/// Like [`diff`] with an explicit clock. Changes of one diff get strictly increasing
/// timestamps starting at `at` so the change log keeps traversal order.
pub fn diff_at(
    document_id: &DocumentId,
    old: &Sections,
    new: &Sections,
    at: DateTime<Utc>,
) -> Vec<FieldChange> {
    field_deltas(old, new)
        .into_iter()
        .zip(0i64..)
        .map(|(delta, offset)| delta.into_change(document_id, at + Duration::microseconds(offset)))
        .collect()
}

pub fn field_deltas(old: &Sections, new: &Sections) -> Vec<FieldDelta> {
    let mut deltas = Vec::new();
    for (section, old_value, new_value) in walk_maps(old, new) {
        collect(section, &FieldPath::root(), old_value, new_value, &mut deltas);
    }
    deltas
}

/// The change produced by writing `new` where `old` was, if the two differ.
pub fn diff_field(
    section: &str,
    path: &FieldPath,
    old: Option<&Value>,
    new: Option<&Value>,
) -> Option<FieldDelta> {
    if old == new {
        return None;
    }
    Some(FieldDelta {
        section: section.to_owned(),
        path: path.clone(),
        old_value: old.cloned(),
        new_value: new.cloned(),
        change_type: classify(old, new),
    })
}

/// Replays `changes` on a copy of `old`, oldest first.
pub fn apply(old: &Sections, changes: &[FieldChange]) -> Result<Sections, FieldPathError> {
    let mut sections = old.clone();
    for change in changes {
        let path = FieldPath::parse(&change.field_path)?;
        apply_one(&mut sections, &change.section, &path, change.new_value.clone())?;
    }
    Ok(sections)
}

/// Writes `value` at `section`/`path`, or removes it when `value` is `None`.
pub(crate) fn apply_one(
    sections: &mut Sections,
    section: &str,
    path: &FieldPath,
    value: Option<Value>,
) -> Result<(), FieldPathError> {
    if path.is_root() {
        match value {
            Some(value) => {
                sections.insert(section.to_owned(), value);
            }
            None => {
                sections.remove(section);
            }
        }
        return Ok(());
    }
    match value {
        Some(value) => {
            let root = sections
                .entry(section.to_owned())
                .or_insert_with(|| Value::Object(Map::new()));
            path.set(root, value)
        }
        None => {
            if let Some(root) = sections.get_mut(section) {
                path.remove(root);
            }
            Ok(())
        }
    }
}

/// `"executiveSummary"`, `"executive-summary"` and `"executive_summary"` all read
/// `"Executive summary"`. Falls back to the section id for whole-section changes.
pub fn field_label(section: &str, path: &FieldPath) -> String {
    humanize(path.last_key().unwrap_or(section))
}

fn humanize(key: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut previous_lower = false;
    for c in key.chars() {
        if c == '-' || c == '_' || c == ' ' {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            previous_lower = false;
            continue;
        }
        if c.is_uppercase() && previous_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        previous_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }

    let sentence = words.join(" ");
    let mut chars = sentence.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => key.to_owned(),
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// A key missing on one side is an addition or a removal. When the key exists on both
/// sides, filling an empty field counts as `added` and clearing one as `removed`.
fn classify(old: Option<&Value>, new: Option<&Value>) -> ChangeType {
    match (old, new) {
        (None, _) => ChangeType::Added,
        (_, None) => ChangeType::Removed,
        (Some(old), Some(new)) => match (is_blank(old), is_blank(new)) {
            (true, false) => ChangeType::Added,
            (false, true) => ChangeType::Removed,
            _ => ChangeType::Modified,
        },
    }
}

type KeyPair<'a> = (&'a str, Option<&'a Value>, Option<&'a Value>);

/// Union of both key sets in canonical order, paired with each side's value.
fn walk_maps<'a>(old: &'a Map<String, Value>, new: &'a Map<String, Value>) -> Vec<KeyPair<'a>> {
    let mut pairs: Vec<KeyPair<'a>> = Vec::with_capacity(old.len().max(new.len()));
    let mut old_iter = old.iter().peekable();
    let mut new_iter = new.iter().peekable();
    loop {
        let next = match (old_iter.peek(), new_iter.peek()) {
            (None, None) => break,
            (Some((old_key, _)), Some((new_key, _))) => old_key.as_str().cmp(new_key.as_str()),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
        };
        match next {
            std::cmp::Ordering::Less => {
                if let Some((key, value)) = old_iter.next() {
                    pairs.push((key.as_str(), Some(value), None));
                }
            }
            std::cmp::Ordering::Greater => {
                if let Some((key, value)) = new_iter.next() {
                    pairs.push((key.as_str(), None, Some(value)));
                }
            }
            std::cmp::Ordering::Equal => {
                if let (Some((key, old_value)), Some((_, new_value))) =
                    (old_iter.next(), new_iter.next())
                {
                    pairs.push((key.as_str(), Some(old_value), Some(new_value)));
                }
            }
        }
    }
    pairs
}

fn collect(
    section: &str,
    path: &FieldPath,
    old: Option<&Value>,
    new: Option<&Value>,
    out: &mut Vec<FieldDelta>,
) {
    match (old, new) {
        (Some(Value::Object(old_map)), Some(Value::Object(new_map))) => {
            for (key, old_child, new_child) in walk_maps(old_map, new_map) {
                collect(section, &path.child_key(key), old_child, new_child, out);
            }
        }
        _ => out.extend(diff_field(section, path, old, new)),
    }
}
