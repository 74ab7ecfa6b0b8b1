//! Checkpoint & rollback manager.
//!
//! A checkpoint is a metadata document (`checkpoints/<id>.json`) plus a backup
//! directory (`checkpoints/backups/<id>/`) holding a byte copy of every listed
//! file under a flattened name. Backups are written temp-then-rename and the
//! metadata is written last, so a listed checkpoint always has its files.
//!
//! Fingerprints are SHA-256 of the file bytes and are comparable across runs
//! and machines.

use crate::core::error::TagError;
use crate::core::fsio;
use crate::core::lock::{self, LockOutcome};
use crate::core::policy::Policy;
use crate::core::store::Store;
use crate::core::time;
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub id: String,
    /// Unix milliseconds; strictly increasing within a store.
    pub timestamp: u64,
    pub description: String,
    /// Root-relative path key to SHA-256 hex fingerprint.
    pub file_states: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, JsonValue>,
}

#[derive(Serialize, Debug, Clone)]
pub struct CheckpointReceipt {
    pub checkpoint: Checkpoint,
    /// Files that could not be read and were left out.
    pub skipped: Vec<String>,
    /// Checkpoints evicted by the retention cap.
    pub evicted: Vec<String>,
    pub discovery_truncated: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FailedRestore {
    pub path: String,
    pub reason: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct RollbackReport {
    pub checkpoint_id: String,
    pub description: String,
    pub success: bool,
    pub restored: Vec<String>,
    pub failed: Vec<FailedRestore>,
    pub safety_checkpoint: Option<String>,
    pub locked: bool,
}

impl RollbackReport {
    pub fn file_count(&self) -> usize {
        self.restored.len() + self.failed.len()
    }

    /// Converts a partial restore into `PartialRestoreFailure`.
    pub fn ensure_complete(self) -> Result<Self, TagError> {
        if self.success {
            Ok(self)
        } else {
            Err(TagError::PartialRestoreFailure {
                checkpoint_id: self.checkpoint_id.clone(),
                failed: self.failed.len(),
                total: self.file_count(),
            })
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RollbackOutcome {
    Success,
    Partial,
    Aborted,
}

/// One line of `rollback_history.jsonl`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RollbackHistoryEntry {
    pub timestamp: String,
    pub checkpoint_id: String,
    pub description: String,
    pub file_count: usize,
    pub outcome: RollbackOutcome,
    #[serde(default)]
    pub restored: usize,
    #[serde(default)]
    pub failed: Vec<FailedRestore>,
    #[serde(default)]
    pub safety_checkpoint: Option<String>,
}

pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Maps a path key to a single-level file name. Injective: `%` is escaped
/// before separators are.
pub fn flatten_key(key: &str) -> String {
    key.replace('%', "%25")
        .replace('/', "%2F")
        .replace('\\', "%5C")
}

pub struct CheckpointManager<'a> {
    store: &'a Store,
    policy: &'a Policy,
}

impl<'a> CheckpointManager<'a> {
    pub fn new(store: &'a Store, policy: &'a Policy) -> Self {
        Self { store, policy }
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.store.checkpoint_dir().join(format!("{}.json", id))
    }

    fn backup_dir(&self, id: &str) -> PathBuf {
        self.store.backup_root().join(id)
    }

    /// Captures `files` (or the discovered include set when `None`).
    pub fn create_checkpoint(
        &self,
        description: &str,
        files: Option<&[PathBuf]>,
        metadata: Option<BTreeMap<String, JsonValue>>,
    ) -> Result<CheckpointReceipt, TagError> {
        let (keys, truncated) = match files {
            Some(files) => (self.dedupe_keys(files), false),
            None => self.discover_files()?,
        };
        self.create_inner(description, keys, metadata.unwrap_or_default(), None, truncated)
    }

    fn create_inner(
        &self,
        description: &str,
        keys: Vec<String>,
        metadata: BTreeMap<String, JsonValue>,
        protect: Option<&str>,
        discovery_truncated: bool,
    ) -> Result<CheckpointReceipt, TagError> {
        let newest = self.list_checkpoints()?.first().map(|c| c.timestamp);
        let now = time::now_epoch_millis();
        let timestamp = match newest {
            Some(prev) if prev >= now => prev + 1,
            _ => now,
        };
        let id = format!("ckpt-{}", time::new_event_id().to_lowercase());
        let backup_dir = self.backup_dir(&id);
        fs::create_dir_all(&backup_dir)?;

        let results: Vec<(String, Result<String, TagError>)> = keys
            .par_iter()
            .map(|key| {
                let outcome = fs::read(self.store.resolve_key(key))
                    .map_err(TagError::from)
                    .and_then(|bytes| {
                        fsio::write_atomic(&backup_dir.join(flatten_key(key)), &bytes)?;
                        Ok(fingerprint(&bytes))
                    });
                (key.clone(), outcome)
            })
            .collect();

        let mut file_states = BTreeMap::new();
        let mut skipped = Vec::new();
        for (key, outcome) in results {
            match outcome {
                Ok(fp) => {
                    file_states.insert(key, fp);
                }
                Err(e) => {
                    tracing::warn!(path = %key, error = %e, "file left out of checkpoint");
                    skipped.push(key);
                }
            }
        }

        let checkpoint = Checkpoint {
            id: id.clone(),
            timestamp,
            description: description.to_string(),
            file_states,
            metadata,
        };
        fsio::write_json_atomic(&self.metadata_path(&id), &checkpoint)?;
        tracing::info!(
            id = %id,
            files = checkpoint.file_states.len(),
            skipped = skipped.len(),
            "checkpoint created"
        );

        let evicted = if self.policy.auto_cleanup {
            self.enforce_retention(protect)?
        } else {
            Vec::new()
        };

        Ok(CheckpointReceipt {
            checkpoint,
            skipped,
            evicted,
            discovery_truncated,
        })
    }

    fn dedupe_keys(&self, files: &[PathBuf]) -> Vec<String> {
        let mut seen = FxHashSet::default();
        files
            .iter()
            .map(|f| self.store.relative_key(f))
            .filter(|k| seen.insert(k.clone()))
            .collect()
    }

    /// Expands the include globs under the project root, bounded by
    /// `checkpoint.max_files`. The checkpoint store itself is never included.
    pub fn discover_files(&self) -> Result<(Vec<String>, bool), TagError> {
        let root_pattern = glob::Pattern::escape(&self.store.root.to_string_lossy());
        let own_prefix = format!(
            "{}/",
            self.store.relative_key(&self.store.checkpoint_dir())
        );
        let limit = self.policy.checkpoint_max_files;
        let mut seen = FxHashSet::default();
        let mut keys = Vec::new();
        let mut truncated = false;

        'patterns: for pattern in &self.policy.checkpoint_include_raw {
            let full = format!("{}/{}", root_pattern.trim_end_matches('/'), pattern);
            for entry in glob::glob(&full)? {
                let path = match entry {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "unreadable path during discovery");
                        continue;
                    }
                };
                if !path.is_file() {
                    continue;
                }
                let key = self.store.relative_key(&path);
                if key.starts_with(&own_prefix) || !seen.insert(key.clone()) {
                    continue;
                }
                if keys.len() >= limit {
                    truncated = true;
                    break 'patterns;
                }
                keys.push(key);
            }
        }
        if truncated {
            tracing::warn!(limit, "checkpoint discovery hit max_files; remaining files ignored");
        }
        Ok((keys, truncated))
    }

    pub fn load_checkpoint(&self, id: &str) -> Result<Checkpoint, TagError> {
        let path = self.metadata_path(id);
        if !path.is_file() {
            return Err(TagError::CheckpointNotFound(id.to_string()));
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// All checkpoints, newest first. Unreadable metadata is skipped.
    pub fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, TagError> {
        let dir = self.store.checkpoint_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let is_meta = path.extension().and_then(|e| e.to_str()) == Some("json")
                && path
                    .file_name()
                    .map(|n| n.to_string_lossy().starts_with("ckpt-"))
                    .unwrap_or(false);
            if !is_meta {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(TagError::from)
                .and_then(|s| serde_json::from_str::<Checkpoint>(&s).map_err(TagError::from))
            {
                Ok(cp) => out.push(cp),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint metadata")
                }
            }
        }
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        Ok(out)
    }

    pub fn delete_checkpoint(&self, id: &str) -> Result<(), TagError> {
        let meta = self.metadata_path(id);
        if !meta.is_file() {
            return Err(TagError::CheckpointNotFound(id.to_string()));
        }
        fs::remove_file(&meta)?;
        let backup = self.backup_dir(id);
        if backup.exists() {
            fs::remove_dir_all(&backup)?;
        }
        tracing::info!(id, "checkpoint deleted");
        Ok(())
    }

    /// Deletes the oldest checkpoints beyond `max_checkpoints`, never the
    /// protected one. A cap of zero disables retention.
    fn enforce_retention(&self, protect: Option<&str>) -> Result<Vec<String>, TagError> {
        let cap = self.policy.max_checkpoints;
        if cap == 0 {
            return Ok(Vec::new());
        }
        let all = self.list_checkpoints()?;
        let mut remaining = all.len();
        let mut evicted = Vec::new();
        for cp in all.iter().rev() {
            if remaining <= cap {
                break;
            }
            if Some(cp.id.as_str()) == protect {
                continue;
            }
            self.delete_checkpoint(&cp.id)?;
            evicted.push(cp.id.clone());
            remaining -= 1;
        }
        Ok(evicted)
    }

    /// True iff the backup directory exists and holds every listed file.
    pub fn validate_checkpoint_integrity(&self, id: &str) -> bool {
        let Ok(cp) = self.load_checkpoint(id) else {
            return false;
        };
        let dir = self.backup_dir(id);
        dir.is_dir()
            && cp
                .file_states
                .keys()
                .all(|key| dir.join(flatten_key(key)).is_file())
    }

    /// Restores every file of checkpoint `id`.
    ///
    /// Per-file failures do not stop the loop; `success` is true only when
    /// every file was restored. A history line is appended either way.
    pub fn rollback_to_checkpoint(&self, id: &str) -> Result<RollbackReport, TagError> {
        let cp = self.load_checkpoint(id)?;
        let guard = lock::acquire_with_timeout(
            &self.store.rollback_lock_path(),
            self.policy.rollback_lock_timeout,
        )?;
        let locked = matches!(guard, LockOutcome::Acquired(_));

        let safety_checkpoint = if self.policy.backup_before_rollback {
            let keys: Vec<String> = cp
                .file_states
                .keys()
                .filter(|k| self.store.resolve_key(k).is_file())
                .cloned()
                .collect();
            let mut meta = BTreeMap::new();
            meta.insert("kind".to_string(), JsonValue::from("safety"));
            meta.insert("rollback_target".to_string(), JsonValue::from(id));
            match self.create_inner(
                &format!("safety checkpoint before rollback to {}", id),
                keys,
                meta,
                Some(id),
                false,
            ) {
                Ok(receipt) => Some(receipt.checkpoint.id),
                Err(e) => {
                    self.append_history(RollbackHistoryEntry {
                        timestamp: time::now_epoch_z(),
                        checkpoint_id: id.to_string(),
                        description: cp.description.clone(),
                        file_count: cp.file_states.len(),
                        outcome: RollbackOutcome::Aborted,
                        restored: 0,
                        failed: Vec::new(),
                        safety_checkpoint: None,
                    })?;
                    return Err(e);
                }
            }
        } else {
            None
        };

        let backup_dir = self.backup_dir(id);
        let mut restored = Vec::new();
        let mut failed = Vec::new();
        for (key, expected) in &cp.file_states {
            match self.restore_one(&backup_dir, key, expected) {
                Ok(()) => restored.push(key.clone()),
                Err(e) => {
                    tracing::warn!(path = %key, error = %e, "restore failed");
                    failed.push(FailedRestore {
                        path: key.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        drop(guard);

        let success = failed.is_empty();
        self.append_history(RollbackHistoryEntry {
            timestamp: time::now_epoch_z(),
            checkpoint_id: id.to_string(),
            description: cp.description.clone(),
            file_count: cp.file_states.len(),
            outcome: if success {
                RollbackOutcome::Success
            } else {
                RollbackOutcome::Partial
            },
            restored: restored.len(),
            failed: failed.clone(),
            safety_checkpoint: safety_checkpoint.clone(),
        })?;
        tracing::info!(
            id,
            restored = restored.len(),
            failed = failed.len(),
            "rollback finished"
        );

        Ok(RollbackReport {
            checkpoint_id: id.to_string(),
            description: cp.description,
            success,
            restored,
            failed,
            safety_checkpoint,
            locked,
        })
    }

    fn restore_one(&self, backup_dir: &Path, key: &str, expected: &str) -> Result<(), TagError> {
        let bytes = fs::read(backup_dir.join(flatten_key(key)))?;
        let actual = fingerprint(&bytes);
        if actual != expected {
            return Err(TagError::IntegrityViolation(format!(
                "backup of {} has fingerprint {} but {} was recorded",
                key, actual, expected
            )));
        }
        fsio::write_atomic(&self.store.resolve_key(key), &bytes)
    }

    pub fn rollback_to_latest(&self) -> Result<RollbackReport, TagError> {
        let latest = self
            .list_checkpoints()?
            .into_iter()
            .next()
            .ok_or_else(|| TagError::NotFound("no checkpoints exist".to_string()))?;
        self.rollback_to_checkpoint(&latest.id)
    }

    /// Restores the oldest checkpoint that passes integrity validation.
    pub fn emergency_rollback(&self) -> Result<RollbackReport, TagError> {
        let candidate = self
            .list_checkpoints()?
            .into_iter()
            .rev()
            .find(|cp| {
                let ok = self.validate_checkpoint_integrity(&cp.id);
                if !ok {
                    tracing::warn!(id = %cp.id, "checkpoint failed integrity validation");
                }
                ok
            })
            .ok_or_else(|| {
                TagError::IntegrityViolation(
                    "no checkpoint passed integrity validation".to_string(),
                )
            })?;
        tracing::warn!(id = %candidate.id, "emergency rollback to oldest valid checkpoint");
        self.rollback_to_checkpoint(&candidate.id)
    }

    fn append_history(&self, entry: RollbackHistoryEntry) -> Result<(), TagError> {
        fsio::append_json_line(&self.store.rollback_history_path(), &entry)
    }

    /// Parsed rollback history, oldest first. Malformed lines are skipped.
    pub fn rollback_history(&self) -> Result<Vec<RollbackHistoryEntry>, TagError> {
        let path = self.store.rollback_history_path();
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&path)?);
        let mut out = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => out.push(entry),
                Err(e) => tracing::warn!(line = i + 1, error = %e, "skipping malformed history line"),
            }
        }
        Ok(out)
    }
}
