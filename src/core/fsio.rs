//! Crash-safe file primitives shared by the ledger and checkpoint stores.
//!
//! Every whole-file persist goes through [`write_atomic`]: the bytes land in a
//! sibling temp file, are synced, and are renamed over the target. A reader
//! therefore sees either the old or the new content, never a mix.

use crate::core::error::TagError;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use ulid::Ulid;

fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    target.with_file_name(format!(".{}.{}.tmp", name, Ulid::new()))
}

pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), TagError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(target);
    let result = (|| -> Result<(), TagError> {
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        fs::rename(&tmp, target)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

pub fn write_json_atomic<T: Serialize>(target: &Path, value: &T) -> Result<(), TagError> {
    let mut body = serde_json::to_vec_pretty(value)?;
    body.push(b'\n');
    write_atomic(target, &body)
}

/// Appends one already-serialized line with a single append-mode write.
/// Existing content is never truncated or rewritten.
pub fn append_line(path: &Path, line: &str) -> Result<(), TagError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    f.write_all(&buf)?;
    f.sync_data()?;
    Ok(())
}

pub fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<(), TagError> {
    let line = serde_json::to_string(value)?;
    append_line(path, &line)
}
