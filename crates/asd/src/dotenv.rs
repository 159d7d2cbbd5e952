use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use parking_lot::Mutex;
use tracing::debug;

/// The dotenv is shared with the user and other tools; writes within one
/// process are serialized so a reconcile never interleaves half a map.
static WRITE_LOCK: Mutex<()> = Mutex::new(());

/// Read a dotenv file into a map with last-write-wins semantics.
/// A missing file reads as empty.
pub fn load(path: &Path) -> anyhow::Result<HashMap<String, String>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    let mut map = HashMap::new();
    for line in content.lines() {
        if let Some((key, value)) = parse_line(line) {
            map.insert(key.to_string(), value.to_string());
        }
    }
    Ok(map)
}

/// Apply a set of key/value updates, preserving unrelated lines and comments.
///
/// Idempotent at key level: a key whose stored value already equals the new
/// value is left untouched, and the file is only rewritten when at least one
/// key actually changed. Returns the keys that were written.
pub fn upsert(path: &Path, updates: &[(String, String)]) -> anyhow::Result<Vec<String>> {
    let _guard = WRITE_LOCK.lock();

    let existing = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };

    let current = {
        let mut map = HashMap::new();
        for line in existing.lines() {
            if let Some((k, v)) = parse_line(line) {
                map.insert(k.to_string(), v.to_string());
            }
        }
        map
    };

    let changed: Vec<&(String, String)> = updates
        .iter()
        .filter(|(k, v)| current.get(k) != Some(v))
        .collect();
    if changed.is_empty() {
        return Ok(Vec::new());
    }

    let mut lines: Vec<String> = existing.lines().map(str::to_string).collect();
    let mut written = Vec::new();
    for (key, value) in changed {
        let rendered = format!("{key}={value}");
        // Last occurrence wins on read, so rewrite the last matching line.
        let found = lines
            .iter()
            .rposition(|line| parse_line(line).map(|(k, _)| k) == Some(key.as_str()));
        match found {
            Some(idx) => lines[idx] = rendered,
            None => lines.push(rendered),
        }
        written.push(key.clone());
    }

    let mut output = lines.join("\n");
    if !output.is_empty() {
        output.push('\n');
    }
    std::fs::write(path, output).with_context(|| format!("failed to write {}", path.display()))?;
    debug!(path = %path.display(), keys = written.len(), "dotenv updated");
    Ok(written)
}

/// Parse one dotenv line into `(key, value)`. Comments and malformed lines
/// yield `None`. Surrounding single or double quotes on the value are
/// stripped; an optional `export ` prefix is accepted.
fn parse_line(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let (key, value) = trimmed.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value);
    Some((key, value))
}
