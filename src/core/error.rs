use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TagError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Policy parse error: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("Invalid glob pattern: {0}")]
    PatternError(#[from] glob::PatternError),
    #[error("Policy unavailable: {}", .0.display())]
    ConfigMissing(PathBuf),
    #[error("Malformed ledger record at line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),
    #[error("Partial restore of checkpoint {checkpoint_id}: {failed} of {total} files failed")]
    PartialRestoreFailure {
        checkpoint_id: String,
        failed: usize,
        total: usize,
    },
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl TagError {
    /// Stable machine-readable kind used in JSON envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            TagError::IoError(_) => "io",
            TagError::JsonError(_) => "json",
            TagError::TomlError(_) => "policy_parse",
            TagError::PatternError(_) => "glob",
            TagError::ConfigMissing(_) => "config_missing",
            TagError::MalformedRecord { .. } => "malformed_record",
            TagError::CheckpointNotFound(_) => "checkpoint_not_found",
            TagError::PartialRestoreFailure { .. } => "partial_restore_failure",
            TagError::IntegrityViolation(_) => "integrity_violation",
            TagError::ValidationError(_) => "validation",
            TagError::NotFound(_) => "not_found",
        }
    }
}
