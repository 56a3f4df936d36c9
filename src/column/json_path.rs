//! Escaped paths for JSON sub-columns.
//!
//! A path is a list of keys joined by `.`. A key containing a `.` is wrapped in backticks, with
//! backticks inside it doubled, so `["a.b", "c"]` becomes `` `a.b`.c ``.

use std::collections::BTreeMap;

use serde_json::Value as Json;

/// Whether a key has a `.` outside a closed backtick pair, or leaves a backtick open.
fn needs_escape(key: &str) -> bool {
    let mut quoted = false;
    let mut dot = false;
    for c in key.chars() {
        match c {
            '`' if quoted => {
                quoted = false;
                dot = false;
            }
            '`' => quoted = true,
            '.' => dot = true,
            _ => {}
        }
    }
    dot || quoted
}

/// Escape a single key for use in a path. Keys that already read as one wrapped segment are
/// returned unchanged.
pub fn escape_json_path(key: &str) -> String {
    if !needs_escape(key) {
        return key.to_string();
    }
    let mut out = String::with_capacity(key.len() + 2);
    out.push('`');
    for c in key.chars() {
        if c == '`' {
            out.push('`');
        }
        out.push(c);
    }
    out.push('`');
    out
}

/// Reverse [`escape_json_path`]. Segments that are not a single wrapped key with only doubled
/// backticks inside are returned unchanged.
pub fn unescape_json_path(segment: &str) -> String {
    let inner = match segment
        .strip_prefix('`')
        .and_then(|s| s.strip_suffix('`'))
    {
        Some(inner) if segment.len() > 2 => inner,
        _ => return segment.to_string(),
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '`' {
            if chars.peek() != Some(&'`') {
                return segment.to_string();
            }
            chars.next();
        }
        out.push(c);
    }
    out
}

/// Split a path into unescaped keys.
pub fn split_json_path(path: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in path.chars() {
        match c {
            '`' => {
                quoted = !quoted;
                current.push(c);
            }
            '.' if !quoted => {
                parts.push(unescape_json_path(&current));
                current.clear();
            }
            _ => current.push(c),
        }
    }
    parts.push(unescape_json_path(&current));
    parts
}

/// Join keys into a path, escaping each.
pub fn build_json_path<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(|p| escape_json_path(p.as_ref()))
        .collect::<Vec<_>>()
        .join(".")
}

/// Turn a flat `path -> value` map into nested objects.
pub fn nest_json(flat: &BTreeMap<String, Json>) -> Json {
    let mut root = serde_json::Map::new();
    for (path, value) in flat {
        let parts = split_json_path(path);
        let Some((last, parents)) = parts.split_last() else {
            continue;
        };
        let mut node = &mut root;
        for part in parents {
            let entry = node
                .entry(part.clone())
                .or_insert_with(|| Json::Object(Default::default()));
            if !entry.is_object() {
                *entry = Json::Object(Default::default());
            }
            node = match entry {
                Json::Object(next) => next,
                _ => unreachable!("entry was just made an object"),
            };
        }
        node.insert(last.clone(), value.clone());
    }
    Json::Object(root)
}
