//! Dot-path addressing over JSON session documents.
//!
//! A path such as `loop.progress.posts` walks nested objects one segment at
//! a time. Caller-supplied segments (context names, item keys) may contain
//! dots themselves, so [`join`] escapes `%` and `.` before joining; escaped
//! segments are stored as-is and never decoded.

use serde_json::{Map, Value};

/// Separator between path segments.
pub const SEPARATOR: char = '.';

/// Escape a single segment so it can never be split by [`SEPARATOR`].
pub fn segment(raw: &str) -> String {
    if !raw.contains(['%', SEPARATOR]) {
        return raw.to_string();
    }
    raw.replace('%', "%25").replace(SEPARATOR, "%2E")
}

/// Build a path from raw segments, escaping each one.
pub fn join(segments: &[&str]) -> String {
    segments
        .iter()
        .map(|s| segment(s))
        .collect::<Vec<_>>()
        .join(".")
}

/// Read the value at `path`.
///
/// Returns `None` if any segment is absent, an intermediate value is not an
/// object, or the leaf is `null`.
pub fn lookup<'a>(doc: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split(SEPARATOR);
    let first = segments.next()?;
    let mut current = doc.get(first)?;
    for seg in segments {
        current = current.as_object()?.get(seg)?;
    }
    if current.is_null() {
        return None;
    }
    Some(current)
}

/// Assign `value` at `path`, creating intermediate objects as needed.
///
/// A non-object intermediate is replaced by an empty object. Siblings along
/// the path are left untouched and nothing is merged: the leaf is replaced
/// wholesale.
pub fn assign(doc: &mut Map<String, Value>, path: &str, value: Value) {
    let segments: Vec<&str> = path.split(SEPARATOR).collect();
    let Some((leaf, parents)) = segments.split_last() else {
        return;
    };

    let mut current = doc;
    for seg in parents {
        let entry = current
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            unreachable!("intermediate entry was just normalized to an object");
        };
        current = next;
    }
    current.insert(leaf.to_string(), value);
}
