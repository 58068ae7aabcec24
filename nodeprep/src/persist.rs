//! Idempotent writes to persisted host configuration.
//!
//! Every mutation of a configuration file goes through this module:
//! - managed blocks delimited by `# BEGIN nodeprep <id>` / `# END nodeprep <id>`
//!   are replaced in place, never duplicated
//! - JSON settings are merged into the existing document
//! - files are only rewritten when their content digest changes, and then
//!   atomically through a temporary file in the same directory

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::Path;

const MARKER: &str = "nodeprep";

fn begin_marker(id: &str) -> String {
    format!("# BEGIN {MARKER} {id}")
}

fn end_marker(id: &str) -> String {
    format!("# END {MARKER} {id}")
}

/// Hex-encoded SHA-256 of `bytes`.
#[must_use]
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Digest of the file at `path`, or `None` if it does not exist.
pub fn file_digest(path: &Path) -> io::Result<Option<String>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(content_digest(&bytes))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Reads a file as text; a missing file reads as empty.
pub fn read_or_empty(path: &Path) -> io::Result<String> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}

/// Replaces `path` with `contents` through a temporary sibling file.
///
/// Parent directories are created as needed.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Writes `contents` unless the file already holds exactly that.
///
/// Returns true if the file was written.
pub fn write_if_changed(path: &Path, contents: &[u8]) -> io::Result<bool> {
    if file_digest(path)?.as_deref() == Some(content_digest(contents).as_str()) {
        return Ok(false);
    }
    write_atomic(path, contents)?;
    Ok(true)
}

/// Copies `src` over `dst` when their digests differ.
///
/// Returns true if `dst` was written.
pub fn copy_if_changed(src: &Path, dst: &Path) -> io::Result<bool> {
    let contents = fs::read(src)?;
    write_if_changed(dst, &contents)
}

/// Returns the lines of the managed block `id` in `content`, if present.
#[must_use]
pub fn find_block(content: &str, id: &str) -> Option<Vec<String>> {
    let begin = begin_marker(id);
    let end = end_marker(id);
    let mut lines = content.lines();

    lines.by_ref().find(|line| line.trim_end() == begin)?;
    let mut body = Vec::new();
    for line in lines {
        if line.trim_end() == end {
            return Some(body);
        }
        body.push(line.to_string());
    }
    None
}

/// Returns `content` with the managed block `id` replaced by `body`, or
/// removed when `body` is `None`.
///
/// A new block is appended at the end. Text outside the block is untouched.
#[must_use]
pub fn splice_block(content: &str, id: &str, body: Option<&[String]>) -> String {
    let begin = begin_marker(id);
    let end = end_marker(id);

    let mut out: Vec<String> = Vec::new();
    let mut inside = false;
    let mut placed = false;

    for line in content.lines() {
        let trimmed = line.trim_end();
        if !inside && trimmed == begin {
            inside = true;
            continue;
        }
        if inside {
            if trimmed == end {
                inside = false;
                if let (Some(body), false) = (body, placed) {
                    out.push(begin.clone());
                    out.extend(body.iter().cloned());
                    out.push(end.clone());
                    placed = true;
                }
            }
            continue;
        }
        out.push(line.to_string());
    }

    if let (Some(body), false) = (body, placed) {
        out.push(begin);
        out.extend(body.iter().cloned());
        out.push(end);
    }

    if out.is_empty() {
        return String::new();
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}

/// Returns true if `path` contains the managed block `id`.
pub fn has_block(path: &Path, id: &str) -> io::Result<bool> {
    Ok(find_block(&read_or_empty(path)?, id).is_some())
}

/// Makes the managed block `id` in `path` hold exactly `body`.
///
/// Returns true if the file changed.
pub fn ensure_block(path: &Path, id: &str, body: &[String]) -> io::Result<bool> {
    let content = read_or_empty(path)?;
    if find_block(&content, id).as_deref() == Some(body) {
        return Ok(false);
    }
    write_if_changed(path, splice_block(&content, id, Some(body)).as_bytes())
}

/// Removes the managed block `id` from `path`.
///
/// Returns true if the file changed. A missing file is left missing.
pub fn remove_block(path: &Path, id: &str) -> io::Result<bool> {
    let content = read_or_empty(path)?;
    if find_block(&content, id).is_none() {
        return Ok(false);
    }
    write_if_changed(path, splice_block(&content, id, None).as_bytes())
}

/// Reads a JSON object document; a missing or blank file reads as `{}`.
pub fn read_json(path: &Path) -> io::Result<Value> {
    let content = read_or_empty(path)?;
    if content.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    let value: Value = serde_json::from_str(&content)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if !value.is_object() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} does not hold a JSON object", path.display()),
        ));
    }
    Ok(value)
}

fn render_json(value: &Value) -> io::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Recursively merges `overlay` into `base`.
///
/// Objects merge key by key; any other value in `overlay` replaces the
/// value in `base`.
pub fn merge_json(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Returns true if merging `subset` into `base` would change nothing.
#[must_use]
pub fn json_contains(base: &Value, subset: &Value) -> bool {
    match (base, subset) {
        (Value::Object(base), Value::Object(subset)) => subset
            .iter()
            .all(|(key, value)| base.get(key).is_some_and(|b| json_contains(b, value))),
        (base, subset) => base == subset,
    }
}

/// A key path into a JSON document, one segment per object level.
///
/// Segments are taken verbatim, so keys may contain dots.
pub type KeyPath = Vec<String>;

/// Builds a [`KeyPath`] from its segments.
#[must_use]
pub fn key_path(segments: &[&str]) -> KeyPath {
    segments.iter().map(|s| (*s).to_string()).collect()
}

/// Removes the value at `path`, e.g. `["runtimes", "nvidia"]`.
///
/// Returns true if something was removed.
pub fn remove_json_path(base: &mut Value, path: &[String]) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };

    let mut current = base;
    for segment in parents {
        match current.get_mut(segment.as_str()) {
            Some(next) => current = next,
            None => return false,
        }
    }
    current
        .as_object_mut()
        .is_some_and(|map| map.remove(last).is_some())
}

/// Merges `overlay` into the JSON document at `path`.
///
/// Returns true if the file changed.
pub fn merge_json_file(path: &Path, overlay: &Value) -> io::Result<bool> {
    let mut doc = read_json(path)?;
    if json_contains(&doc, overlay) && path.exists() {
        return Ok(false);
    }
    merge_json(&mut doc, overlay);
    write_if_changed(path, &render_json(&doc)?)
}

/// Removes `keys` from the JSON document at `path`.
///
/// Returns true if the file changed. A missing file is left missing.
pub fn remove_json_keys(path: &Path, keys: &[KeyPath]) -> io::Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let mut doc = read_json(path)?;
    let mut removed = false;
    for key in keys {
        removed |= remove_json_path(&mut doc, key);
    }
    if !removed {
        return Ok(false);
    }
    write_if_changed(path, &render_json(&doc)?)
}
