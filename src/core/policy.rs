//! Policy: the immutable configuration value every component consumes.
//!
//! `PolicyConfig` is the raw, serde-facing shape (TOML on disk). `Policy` is
//! the validated value with glob patterns compiled once; it is built a single
//! time per invocation and passed by reference.

use crate::core::error::TagError;
use crate::core::store::Store;
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_EXPIRY_HOURS: u64 = 72;
pub const DEFAULT_MAX_SCAN_LINES: usize = 20;
pub const DEFAULT_MAX_CHECKPOINTS: usize = 10;
pub const DEFAULT_MAX_DISCOVERED_FILES: usize = 1000;
pub const UNMATCHED_AUTHORITY: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMarker {
    pub open: String,
    pub close: String,
}

impl BlockMarker {
    pub fn new(open: &str, close: &str) -> Self {
        Self {
            open: open.to_string(),
            close: close.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToplineConfig {
    pub max_scan_lines: usize,
    pub skip_header_block: Vec<BlockMarker>,
}

impl Default for ToplineConfig {
    fn default() -> Self {
        Self {
            max_scan_lines: DEFAULT_MAX_SCAN_LINES,
            skip_header_block: vec![
                BlockMarker::new("/*", "*/"),
                BlockMarker::new("<!--", "-->"),
                BlockMarker::new("\"\"\"", "\"\"\""),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityHierarchyConfig {
    pub highest: Vec<String>,
    pub high: Vec<String>,
    pub medium: Vec<String>,
    pub low: Vec<String>,
}

impl Default for AuthorityHierarchyConfig {
    fn default() -> Self {
        Self {
            highest: vec!["specs/**".to_string(), "**/SPEC-*.md".to_string()],
            high: vec!["src/**".to_string(), "lib/**".to_string()],
            medium: vec!["tests/**".to_string(), "test/**".to_string()],
            low: vec!["docs/**".to_string(), "**/*.md".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceDuplicatesConfig {
    pub allowed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub include: Vec<String>,
    pub max_files: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            include: vec![
                "**/*.md".to_string(),
                "src/**/*".to_string(),
                "tests/**/*".to_string(),
                ".tagledger/ledger.jsonl".to_string(),
            ],
            max_files: DEFAULT_MAX_DISCOVERED_FILES,
        }
    }
}

/// Raw policy document as read from `policy.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub eligible: Vec<String>,
    pub excluded: Vec<String>,
    pub topline: ToplineConfig,
    pub authority_hierarchy: AuthorityHierarchyConfig,
    pub reservation_expiry_hours: u64,
    pub reference_duplicates: ReferenceDuplicatesConfig,
    pub max_checkpoints: usize,
    pub auto_cleanup: bool,
    pub backup_before_rollback: bool,
    /// Seconds.
    pub rollback_lock_timeout: f64,
    pub ledger_lock_timeout_ms: u64,
    pub checkpoint: CheckpointConfig,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            eligible: vec!["**/*".to_string()],
            excluded: vec![
                ".git/**".to_string(),
                ".tagledger/**".to_string(),
                "target/**".to_string(),
                "node_modules/**".to_string(),
            ],
            topline: ToplineConfig::default(),
            authority_hierarchy: AuthorityHierarchyConfig::default(),
            reservation_expiry_hours: DEFAULT_EXPIRY_HOURS,
            reference_duplicates: ReferenceDuplicatesConfig::default(),
            max_checkpoints: DEFAULT_MAX_CHECKPOINTS,
            auto_cleanup: true,
            backup_before_rollback: true,
            rollback_lock_timeout: 30.0,
            ledger_lock_timeout_ms: 5_000,
            checkpoint: CheckpointConfig::default(),
        }
    }
}

/// A compiled list of path globs. `*` stops at `/`; `**` crosses it.
#[derive(Debug, Clone, Default)]
pub struct GlobSet {
    patterns: Vec<Pattern>,
}

impl GlobSet {
    pub fn compile(raw: &[String]) -> Result<Self, TagError> {
        let patterns = raw
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.as_str())
    }

    /// `path` is a `/`-separated key relative to the project root.
    pub fn matches(&self, path: &str) -> bool {
        let opts = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        self.patterns.iter().any(|p| p.matches_with(path, opts))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorityTier {
    Highest,
    High,
    Medium,
    Low,
}

impl AuthorityTier {
    pub fn score(&self) -> u32 {
        match self {
            AuthorityTier::Highest => 100,
            AuthorityTier::High => 80,
            AuthorityTier::Medium => 60,
            AuthorityTier::Low => 40,
        }
    }
}

/// Validated, immutable policy.
#[derive(Debug, Clone)]
pub struct Policy {
    pub eligible: GlobSet,
    pub excluded: GlobSet,
    pub max_scan_lines: usize,
    pub header_markers: Vec<BlockMarker>,
    /// Ordered highest to lowest; first match wins.
    pub authority_tiers: Vec<(AuthorityTier, GlobSet)>,
    pub reservation_expiry_hours: u64,
    pub reference_duplicates_allowed: bool,
    pub max_checkpoints: usize,
    pub auto_cleanup: bool,
    pub backup_before_rollback: bool,
    pub rollback_lock_timeout: Duration,
    pub ledger_lock_timeout: Duration,
    pub checkpoint_include: GlobSet,
    pub checkpoint_include_raw: Vec<String>,
    pub checkpoint_max_files: usize,
}

impl Policy {
    pub fn from_config(cfg: PolicyConfig) -> Result<Self, TagError> {
        for marker in &cfg.topline.skip_header_block {
            if marker.open.is_empty() || marker.close.is_empty() {
                return Err(TagError::ValidationError(
                    "topline.skip_header_block markers must have non-empty open and close".into(),
                ));
            }
        }
        let rollback_lock_timeout = Duration::try_from_secs_f64(cfg.rollback_lock_timeout)
            .map_err(|_| {
                TagError::ValidationError(format!(
                    "rollback_lock_timeout must be a non-negative number of seconds, got {}",
                    cfg.rollback_lock_timeout
                ))
            })?;
        let tiers = &cfg.authority_hierarchy;
        let authority_tiers = vec![
            (AuthorityTier::Highest, GlobSet::compile(&tiers.highest)?),
            (AuthorityTier::High, GlobSet::compile(&tiers.high)?),
            (AuthorityTier::Medium, GlobSet::compile(&tiers.medium)?),
            (AuthorityTier::Low, GlobSet::compile(&tiers.low)?),
        ];

        Ok(Self {
            eligible: GlobSet::compile(&cfg.eligible)?,
            excluded: GlobSet::compile(&cfg.excluded)?,
            max_scan_lines: cfg.topline.max_scan_lines,
            header_markers: cfg.topline.skip_header_block,
            authority_tiers,
            reservation_expiry_hours: cfg.reservation_expiry_hours,
            reference_duplicates_allowed: cfg.reference_duplicates.allowed,
            max_checkpoints: cfg.max_checkpoints,
            auto_cleanup: cfg.auto_cleanup,
            backup_before_rollback: cfg.backup_before_rollback,
            rollback_lock_timeout,
            ledger_lock_timeout: Duration::from_millis(cfg.ledger_lock_timeout_ms),
            checkpoint_include: GlobSet::compile(&cfg.checkpoint.include)?,
            checkpoint_include_raw: cfg.checkpoint.include,
            checkpoint_max_files: cfg.checkpoint.max_files,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, TagError> {
        let cfg: PolicyConfig = toml::from_str(content)?;
        Self::from_config(cfg)
    }

    /// Eligible for scanning: matches an `eligible` glob and no `excluded` glob.
    pub fn is_eligible(&self, rel_path: &str) -> bool {
        self.eligible.matches(rel_path) && !self.excluded.matches(rel_path)
    }

    pub fn authority_tier(&self, rel_path: &str) -> Option<AuthorityTier> {
        self.authority_tiers
            .iter()
            .find(|(_, globs)| globs.matches(rel_path))
            .map(|(tier, _)| *tier)
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::from_config(PolicyConfig::default()).expect("built-in policy globs are valid")
    }
}

/// Loads the policy for `store`.
///
/// An explicit path must exist (`ConfigMissing` otherwise). Without one, the
/// store's `policy.toml` is used when present and the built-in defaults when
/// not; no config is not an error.
pub fn load_policy(store: &Store, explicit: Option<&Path>) -> Result<Policy, TagError> {
    let path = match explicit {
        Some(p) if !p.is_file() => return Err(TagError::ConfigMissing(p.to_path_buf())),
        Some(p) => p.to_path_buf(),
        None => {
            let default_path = store.default_policy_path();
            if !default_path.is_file() {
                tracing::debug!(path = %default_path.display(), "no policy file; using defaults");
                return Ok(Policy::default());
            }
            default_path
        }
    };
    let content = fs::read_to_string(&path)?;
    Policy::from_toml_str(&content)
}
