//! Store layout for tagledger's on-disk state.
//!
//! A store is anchored at a project root. All state lives under
//! `<root>/.tagledger/` unless a different state directory is supplied.

use std::path::{Component, Path, PathBuf};

pub const STATE_DIR_NAME: &str = ".tagledger";
pub const LEDGER_FILE_NAME: &str = "ledger.jsonl";
pub const INDEX_FILE_NAME: &str = "index.json";
pub const LEDGER_LOCK_NAME: &str = "ledger.lock";
pub const SNAPSHOT_DIR_NAME: &str = "snapshots";
pub const CHECKPOINT_DIR_NAME: &str = "checkpoints";
pub const BACKUP_DIR_NAME: &str = "backups";
pub const ROLLBACK_HISTORY_NAME: &str = "rollback_history.jsonl";
pub const ROLLBACK_LOCK_NAME: &str = "rollback.lock";
pub const POLICY_FILE_NAME: &str = "policy.toml";

/// Store handle: the project root that tracked paths are relative to, plus
/// the directory holding the ledger, index, snapshots and checkpoints.
#[derive(Debug, Clone)]
pub struct Store {
    /// Project root; tracked file paths are resolved against it.
    pub root: PathBuf,
    /// State directory (`<root>/.tagledger` by default).
    pub state_dir: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(STATE_DIR_NAME);
        Self { root, state_dir }
    }

    pub fn with_state_dir(root: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state_dir: state_dir.into(),
        }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join(LEDGER_FILE_NAME)
    }

    pub fn index_path(&self) -> PathBuf {
        self.state_dir.join(INDEX_FILE_NAME)
    }

    pub fn ledger_lock_path(&self) -> PathBuf {
        self.state_dir.join(LEDGER_LOCK_NAME)
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.state_dir.join(SNAPSHOT_DIR_NAME)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.state_dir.join(CHECKPOINT_DIR_NAME)
    }

    pub fn backup_root(&self) -> PathBuf {
        self.checkpoint_dir().join(BACKUP_DIR_NAME)
    }

    pub fn rollback_history_path(&self) -> PathBuf {
        self.checkpoint_dir().join(ROLLBACK_HISTORY_NAME)
    }

    pub fn rollback_lock_path(&self) -> PathBuf {
        self.checkpoint_dir().join(ROLLBACK_LOCK_NAME)
    }

    pub fn default_policy_path(&self) -> PathBuf {
        self.state_dir.join(POLICY_FILE_NAME)
    }

    /// Renders `path` relative to the project root with `/` separators when
    /// it lives under the root; other paths are kept as given.
    pub fn relative_key(&self, path: &Path) -> String {
        let rel = match path.strip_prefix(&self.root) {
            Ok(rel) => rel,
            Err(_) if path.is_absolute() => return path.to_string_lossy().to_string(),
            Err(_) => path,
        };
        rel.components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().to_string()),
                Component::ParentDir => Some("..".to_string()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Inverse of [`Store::relative_key`].
    pub fn resolve_key(&self, key: &str) -> PathBuf {
        let p = Path::new(key);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }
}
