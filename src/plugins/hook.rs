//! Host-facing invocation surface.
//!
//! A host tool hands over the files it just changed plus the acting agent.
//! This module scans them, records new identifier declarations and paths in
//! the ledger, rescinds stale reservations, resolves duplicates, and
//! optionally takes a checkpoint. The result is always a [`HookResponse`];
//! errors are folded into it and never cross the boundary.

use crate::core::error::TagError;
use crate::core::policy::{self, Policy};
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::checkpoint::CheckpointManager;
use crate::plugins::ledger::{LedgerManager, LedgerOp, LedgerRecord, TagIndex, TagState};
use crate::plugins::resolver::{self, Correction, CorrectionAction, OccurrenceKind, Resolution};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct HookRequest {
    pub changed_files: Vec<PathBuf>,
    #[serde(default = "default_actor")]
    pub actor: String,
    /// When set, a checkpoint of the changed files is taken with this
    /// description after the ledger is updated.
    #[serde(default)]
    pub checkpoint: Option<String>,
}

fn default_actor() -> String {
    "hook".to_string()
}

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct HookCounts {
    pub files_scanned: usize,
    pub occurrences: usize,
    pub records_appended: usize,
    pub expired_rescinded: usize,
    pub duplicate_groups: usize,
    pub critical_groups: usize,
}

#[derive(Serialize, Debug, Clone)]
pub struct CheckpointSummary {
    pub id: String,
    pub files: usize,
    pub skipped: Vec<String>,
    pub evicted: Vec<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct HookResponse {
    pub ts: String,
    pub status: String,
    pub counts: HookCounts,
    pub suggestions: Vec<Correction>,
    pub checkpoint: Option<CheckpointSummary>,
    pub warnings: Vec<String>,
    pub error: Option<HookError>,
}

#[derive(Serialize, Debug, Clone)]
pub struct HookError {
    pub kind: String,
    pub message: String,
}

impl From<&TagError> for HookError {
    fn from(e: &TagError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

impl HookResponse {
    fn new() -> Self {
        Self {
            ts: time::now_epoch_z(),
            status: "ok".to_string(),
            counts: HookCounts::default(),
            suggestions: Vec::new(),
            checkpoint: None,
            warnings: Vec::new(),
            error: None,
        }
    }

    /// Response for an invocation that failed before any work was done.
    pub fn failed(error: &TagError) -> Self {
        let mut response = Self::new();
        response.fail(error);
        response
    }

    fn fail(&mut self, error: &TagError) {
        tracing::warn!(error = %error, "hook invocation failed");
        self.status = "error".to_string();
        self.error = Some(HookError::from(error));
    }
}

/// Runs one hook invocation. Never panics on I/O and never returns `Err`.
pub fn process(store: &Store, policy: &Policy, request: &HookRequest) -> HookResponse {
    let mut response = HookResponse::new();
    if let Err(e) = run(store, policy, request, &mut response) {
        response.fail(&e);
    }
    response
}

/// Entry point for raw input: parses the request, loads the policy, then
/// runs [`process`]. A malformed request or policy becomes an error response.
pub fn process_input(store: &Store, policy_path: Option<&Path>, input: &str) -> HookResponse {
    let request = match serde_json::from_str::<HookRequest>(input) {
        Ok(request) => request,
        Err(e) => return HookResponse::failed(&TagError::from(e)),
    };
    match policy::load_policy(store, policy_path) {
        Ok(policy) => process(store, &policy, &request),
        Err(e) => HookResponse::failed(&e),
    }
}

fn run(
    store: &Store,
    policy: &Policy,
    request: &HookRequest,
    response: &mut HookResponse,
) -> Result<(), TagError> {
    let ledger = LedgerManager::new(store, policy);
    let index = ledger.read_index()?;

    let resolution = resolver::resolve(store, &request.changed_files, Some(&index), policy);
    response.counts.files_scanned = resolution.scan.files_scanned;
    response.counts.occurrences = resolution.scan.occurrences.len();
    response.warnings.extend(resolution.scan.warnings.iter().cloned());

    let records = ledger_updates(&resolution, &index, &request.actor);
    if !records.is_empty() {
        let receipt = ledger.append_batch(records)?;
        response.counts.records_appended = receipt.appended;
        if !receipt.locked {
            response
                .warnings
                .push("ledger lock timed out; appended without lock".to_string());
        }
        for s in receipt.skipped {
            response
                .warnings
                .push(format!("ledger line {} skipped: {}", s.line, s.reason));
        }
    }

    let rescinded = ledger.rescind_expired(&request.actor)?;
    response.counts.expired_rescinded = rescinded.len();

    response.counts.duplicate_groups = resolution.groups.len();
    response.counts.critical_groups = resolution.critical_count();
    response.suggestions = resolution.plan.corrections;

    if let Some(description) = &request.checkpoint {
        let manager = CheckpointManager::new(store, policy);
        let receipt = manager.create_checkpoint(description, Some(&request.changed_files), None)?;
        response.checkpoint = Some(CheckpointSummary {
            id: receipt.checkpoint.id.clone(),
            files: receipt.checkpoint.file_states.len(),
            skipped: receipt.skipped,
            evicted: receipt.evicted,
        });
    }
    Ok(())
}

/// CREATE for topline identifiers the index has never seen; UPDATE adding
/// the path for known identifiers not yet associated with it.
fn ledger_updates(resolution: &Resolution, index: &TagIndex, actor: &str) -> Vec<LedgerRecord> {
    // Declarations slated for renumbering stay out of the ledger until fixed.
    let renumbered: FxHashSet<(&str, usize)> = resolution
        .plan
        .corrections
        .iter()
        .filter(|c| matches!(c.action, CorrectionAction::Renumber { .. }))
        .map(|c| (c.path.as_str(), c.line))
        .collect();

    let mut emitted: FxHashSet<(String, String)> = FxHashSet::default();
    let mut records = Vec::new();
    for occ in &resolution.scan.occurrences {
        if occ.kind != OccurrenceKind::Topline || renumbered.contains(&(occ.path.as_str(), occ.line)) {
            continue;
        }
        if !emitted.insert((occ.tag.clone(), occ.path.clone())) {
            continue;
        }
        match index.get(&occ.tag) {
            None => records.push(
                LedgerRecord::new(LedgerOp::Create, occ.tag.clone())
                    .with_path(occ.path.clone())
                    .with_state(TagState::Active)
                    .with_actor(actor),
            ),
            Some(entry) => {
                let known = entry.primary_path.as_deref() == Some(occ.path.as_str())
                    || entry.related_paths.contains(&occ.path);
                if !known {
                    records.push(
                        LedgerRecord::new(LedgerOp::Update, occ.tag.clone())
                            .with_path(occ.path.clone())
                            .with_actor(actor),
                    );
                }
            }
        }
    }
    records
}
