//! Duplicate & authority resolver.
//!
//! Scans files for identifier occurrences, groups collisions by
//! `TYPE:DOMAIN-NNN`, picks the most authoritative occurrence as primary and
//! proposes corrections. Everything here is advisory: no file and no ledger
//! record is ever written.

use crate::core::policy::{Policy, UNMATCHED_AUTHORITY};
use crate::core::store::Store;
use crate::core::tag_id::{TagId, TagType};
use crate::plugins::header::{self, LineClass};
use crate::plugins::ledger::{self, TagIndex};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OccurrenceKind {
    /// Declared in the file's header region.
    Topline,
    /// Cited anywhere else.
    Reference,
}

#[derive(Debug, Clone, Serialize)]
pub struct Occurrence {
    pub tag: String,
    #[serde(skip)]
    pub tag_id: TagId,
    pub path: String,
    pub line: usize,
    pub kind: OccurrenceKind,
    pub authority: u32,
    /// Position in scan order; lower was seen first.
    pub scan_order: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub files_scanned: usize,
    pub files_skipped: Vec<String>,
    pub occurrences: Vec<Occurrence>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub key: String,
    pub primary: Occurrence,
    pub duplicates: Vec<Occurrence>,
}

impl DuplicateGroup {
    pub fn occurrences(&self) -> impl Iterator<Item = &Occurrence> {
        std::iter::once(&self.primary).chain(self.duplicates.iter())
    }

    pub fn topline_count(&self) -> usize {
        self.occurrences()
            .filter(|o| o.kind == OccurrenceKind::Topline)
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CorrectionAction {
    Renumber { from: String, to: String },
    TrackOnly { id: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Correction {
    pub path: String,
    pub line: usize,
    #[serde(flatten)]
    pub action: CorrectionAction,
    pub confidence: Confidence,
    /// Other occurrences in the group that cite the renumbered identifier and
    /// need review after the change.
    pub impact: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CorrectionPlan {
    pub dry_run: bool,
    pub corrections: Vec<Correction>,
}

impl CorrectionPlan {
    pub fn renumber_count(&self) -> usize {
        self.corrections
            .iter()
            .filter(|c| matches!(c.action, CorrectionAction::Renumber { .. }))
            .count()
    }
}

/// Score of the first authority tier matching `path`; 20 when none does.
pub fn authority_score(path: &str, policy: &Policy) -> u32 {
    policy
        .authority_tier(path)
        .map(|t| t.score())
        .unwrap_or(UNMATCHED_AUTHORITY)
}

/// Extracts and classifies occurrences from already-read text.
pub fn scan_text(path: &str, text: &str, policy: &Policy) -> Vec<Occurrence> {
    let lines: Vec<&str> = text.lines().collect();
    let classes = header::classify_lines(lines.iter().copied(), &policy.header_markers);
    let authority = authority_score(path, policy);
    let mut out = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        for tag_id in TagId::find_all(line) {
            let kind = if i < policy.max_scan_lines && classes[i] == LineClass::Normal {
                OccurrenceKind::Topline
            } else {
                OccurrenceKind::Reference
            };
            out.push(Occurrence {
                tag: tag_id.to_string(),
                tag_id,
                path: path.to_string(),
                line: i + 1,
                kind,
                authority,
                scan_order: 0,
            });
        }
    }
    out
}

/// Scans `files` (absolute or root-relative) in the given order.
///
/// Ineligible files are skipped silently; unreadable ones with a warning.
pub fn scan(store: &Store, files: &[PathBuf], policy: &Policy) -> ScanReport {
    let mut seen = FxHashSet::default();
    let candidates: Vec<(String, PathBuf)> = files
        .iter()
        .map(|f| {
            let key = store.relative_key(f);
            (key.clone(), store.resolve_key(&key))
        })
        .filter(|(key, _)| seen.insert(key.clone()))
        .collect();

    let mut report = ScanReport::default();
    let eligible: Vec<&(String, PathBuf)> = candidates
        .iter()
        .filter(|(key, _)| {
            let ok = policy.is_eligible(key);
            if !ok {
                report.files_skipped.push(key.clone());
            }
            ok
        })
        .collect();

    let results: Vec<(String, Result<Vec<Occurrence>, String>)> = eligible
        .par_iter()
        .map(|(key, abs)| (key.clone(), read_and_scan(key, abs, policy)))
        .collect();

    let mut order = 0usize;
    for (key, result) in results {
        match result {
            Ok(occurrences) => {
                report.files_scanned += 1;
                for mut occ in occurrences {
                    occ.scan_order = order;
                    order += 1;
                    report.occurrences.push(occ);
                }
            }
            Err(reason) => {
                tracing::warn!(path = %key, %reason, "skipping unreadable file");
                report.warnings.push(format!("{}: {}", key, reason));
                report.files_skipped.push(key);
            }
        }
    }
    report
}

fn read_and_scan(key: &str, abs: &Path, policy: &Policy) -> Result<Vec<Occurrence>, String> {
    let bytes = fs::read(abs).map_err(|e| e.to_string())?;
    let text = String::from_utf8(bytes).map_err(|_| "not valid UTF-8".to_string())?;
    Ok(scan_text(key, &text, policy))
}

/// Groups occurrences by `TYPE:DOMAIN-NNN`; only keys seen more than once
/// form a group. Groups come back sorted by key.
pub fn find_duplicates(occurrences: &[Occurrence]) -> Vec<DuplicateGroup> {
    let mut buckets: FxHashMap<String, Vec<&Occurrence>> = FxHashMap::default();
    for occ in occurrences {
        buckets.entry(occ.tag_id.key()).or_default().push(occ);
    }
    let mut sorted: BTreeMap<String, Vec<&Occurrence>> = BTreeMap::new();
    sorted.extend(buckets.into_iter().filter(|(_, v)| v.len() > 1));

    sorted
        .into_iter()
        .map(|(key, mut members)| {
            members.sort_by_key(|o| o.scan_order);
            let primary_idx = select_primary(&members);
            let primary = members[primary_idx].clone();
            let duplicates = members
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != primary_idx)
                .map(|(_, o)| (*o).clone())
                .collect();
            DuplicateGroup {
                key,
                primary,
                duplicates,
            }
        })
        .collect()
}

/// Index of the strictly highest score; the earliest-scanned wins ties.
/// `members` must be in scan order.
fn select_primary(members: &[&Occurrence]) -> usize {
    let mut best = 0usize;
    for (i, occ) in members.iter().enumerate().skip(1) {
        if occ.authority > members[best].authority {
            best = i;
        }
    }
    best
}

/// Critical when any occurrence in the group is a topline declaration;
/// otherwise a warning, or info when reference duplicates are allowed.
pub fn classify(group: &DuplicateGroup, policy: &Policy) -> Severity {
    if group.topline_count() > 0 {
        Severity::Critical
    } else if policy.reference_duplicates_allowed {
        Severity::Info
    } else {
        Severity::Warning
    }
}

/// Builds a dry-run plan.
///
/// Every non-primary topline duplicate is renumbered to the next unused
/// number of its TYPE+DOMAIN bucket. Numbers used anywhere in
/// the scan, in `index`, or already proposed are never reused. Every other
/// non-primary occurrence gets a track-only entry.
pub fn generate_correction_plan(
    groups: &[DuplicateGroup],
    all_occurrences: &[Occurrence],
    index: Option<&TagIndex>,
) -> CorrectionPlan {
    let mut used: FxHashMap<(TagType, String), FxHashSet<u64>> = FxHashMap::default();
    for occ in all_occurrences {
        if let Some(n) = occ.tag_id.numeric() {
            used.entry((occ.tag_id.tag_type, occ.tag_id.domain.clone()))
                .or_default()
                .insert(n);
        }
    }

    let mut corrections = Vec::new();
    for group in groups {
        let references = group
            .occurrences()
            .filter(|o| o.kind == OccurrenceKind::Reference)
            .count();
        for dup in &group.duplicates {
            if dup.kind == OccurrenceKind::Topline {
                let tag = &dup.tag_id;
                let bucket = used
                    .entry((tag.tag_type, tag.domain.clone()))
                    .or_default();
                if let Some(index) = index {
                    bucket.extend(index.numbers_in_bucket(tag.tag_type, &tag.domain));
                }
                let next = ledger::next_free_number(bucket);
                bucket.insert(next);
                let renumbered = TagId::new(tag.tag_type, &tag.domain, next, tag.number.len());
                let confidence = if group.primary.authority > dup.authority {
                    Confidence::High
                } else {
                    Confidence::Medium
                };
                corrections.push(Correction {
                    path: dup.path.clone(),
                    line: dup.line,
                    action: CorrectionAction::Renumber {
                        from: dup.tag.clone(),
                        to: renumbered.to_string(),
                    },
                    confidence,
                    impact: references,
                    reason: format!(
                        "{} is declared in {} (authority {}); this declaration has authority {}",
                        dup.tag, group.primary.path, group.primary.authority, dup.authority
                    ),
                });
            } else {
                corrections.push(Correction {
                    path: dup.path.clone(),
                    line: dup.line,
                    action: CorrectionAction::TrackOnly {
                        id: dup.tag.clone(),
                    },
                    confidence: Confidence::High,
                    impact: 0,
                    reason: format!("{} cited outside its declaration", dup.tag),
                });
            }
        }
    }
    CorrectionPlan {
        dry_run: true,
        corrections,
    }
}


/// Full resolver pass over `files`.
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub scan: ScanReport,
    pub groups: Vec<ClassifiedGroup>,
    pub plan: CorrectionPlan,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedGroup {
    pub severity: Severity,
    #[serde(flatten)]
    pub group: DuplicateGroup,
}

impl Resolution {
    pub fn critical_count(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.severity == Severity::Critical)
            .count()
    }
}

pub fn resolve(
    store: &Store,
    files: &[PathBuf],
    index: Option<&TagIndex>,
    policy: &Policy,
) -> Resolution {
    let scan = scan(store, files, policy);
    let groups = find_duplicates(&scan.occurrences);
    let plan = generate_correction_plan(&groups, &scan.occurrences, index);
    let groups = groups
        .into_iter()
        .map(|group| ClassifiedGroup {
            severity: classify(&group, policy),
            group,
        })
        .collect();
    Resolution { scan, groups, plan }
}
