//! TAG ledger and index.
//!
//! The ledger (`ledger.jsonl`) is an append-only log of lifecycle events for
//! identifiers and the only source of truth. The index (`index.json`) is a
//! pure projection of it: records are stable-sorted by `ts` and folded into a
//! map of id to [`IndexEntry`]. The index may be deleted at any time and
//! rebuilt byte-for-byte from the same ledger.
//!
//! Writers serialize `append -> rebuild -> persist` through `ledger.lock`.
//! Readers never lock; a stale index is acceptable.

use crate::core::error::TagError;
use crate::core::fsio;
use crate::core::lock::{self, LockOutcome};
use crate::core::policy::Policy;
use crate::core::store::Store;
use crate::core::tag_id::{TagId, TagType};
use crate::core::time;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

pub const INDEX_VERSION: u32 = 1;
const SECS_PER_HOUR: u64 = 3600;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum LedgerOp {
    Create,
    Reserve,
    Issue,
    Update,
    Rescind,
    Deprecated,
    Migrate,
}

impl LedgerOp {
    fn creates(&self) -> bool {
        matches!(self, LedgerOp::Create | LedgerOp::Reserve | LedgerOp::Issue)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TagState {
    #[default]
    Unknown,
    Reserved,
    Active,
    Deprecated,
    Rescinded,
    Migrated,
}

impl TagState {
    /// Rescinded and migrated identifiers never leave their state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TagState::Rescinded | TagState::Migrated)
    }

    /// States an ordinary CREATE/UPDATE record may not overwrite.
    fn blocks_generic_merge(&self) -> bool {
        matches!(
            self,
            TagState::Migrated | TagState::Deprecated | TagState::Rescinded
        )
    }
}

/// Link targets keyed by `SPEC`/`TEST`/`CODE`/`DOC`.
pub type Links = BTreeMap<String, Vec<String>>;

fn default_links() -> Links {
    TagType::ALL
        .iter()
        .map(|t| (t.as_str().to_string(), Vec::new()))
        .collect()
}

/// One immutable ledger event.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LedgerRecord {
    pub op: LedgerOp,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub links: Links,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TagState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl LedgerRecord {
    pub fn new(op: LedgerOp, id: impl Into<String>) -> Self {
        Self {
            op,
            id: id.into(),
            ts: None,
            event_id: None,
            primary_path: None,
            related_paths: Vec::new(),
            links: Links::new(),
            state: None,
            domain: None,
            actor: None,
            reason: None,
            from: None,
            to: None,
        }
    }

    pub fn migrate(from: impl Into<String>, to: impl Into<String>) -> Self {
        let from = from.into();
        let mut rec = Self::new(LedgerOp::Migrate, from.clone());
        rec.from = Some(from);
        rec.to = Some(to.into());
        rec
    }

    pub fn at(mut self, ts_secs: u64) -> Self {
        self.ts = Some(time::format_epoch_z(ts_secs));
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        if self.primary_path.is_none() {
            self.primary_path = Some(path);
        } else {
            self.related_paths.push(path);
        }
        self
    }

    pub fn with_state(mut self, state: TagState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_link(mut self, kind: TagType, target: impl Into<String>) -> Self {
        self.links
            .entry(kind.as_str().to_string())
            .or_default()
            .push(target.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// The identifier whose entry this record changes.
    fn subject(&self) -> &str {
        match self.op {
            LedgerOp::Migrate => self.from.as_deref().unwrap_or(&self.id),
            _ => &self.id,
        }
    }

    fn paths(&self) -> impl Iterator<Item = &String> {
        self.primary_path.iter().chain(self.related_paths.iter())
    }
}

/// Derived per-identifier state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub tag_type: TagType,
    pub primary_path: Option<String>,
    pub related_paths: Vec<String>,
    pub links: Links,
    pub state: TagState,
    pub created: String,
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrated_to: Option<String>,
}

impl IndexEntry {
    fn seed(tag: &TagId, record: &LedgerRecord, ts: &str) -> Self {
        let state = match (record.state, record.op) {
            (Some(_), _) => TagState::Unknown,
            (None, LedgerOp::Reserve) => TagState::Reserved,
            (None, _) => TagState::Unknown,
        };
        Self {
            id: tag.to_string(),
            tag_type: tag.tag_type,
            primary_path: None,
            related_paths: Vec::new(),
            links: default_links(),
            state,
            created: ts.to_string(),
            domain: record.domain.clone().unwrap_or_else(|| tag.domain.clone()),
            migrated_to: None,
        }
    }

    fn merge(&mut self, record: &LedgerRecord) {
        for path in record.paths() {
            match &self.primary_path {
                None => self.primary_path = Some(path.clone()),
                Some(primary) if primary == path => {}
                Some(_) => {
                    if !self.related_paths.contains(path) {
                        self.related_paths.push(path.clone());
                    }
                }
            }
        }
        for (kind, targets) in &record.links {
            self.links.insert(kind.clone(), targets.clone());
        }
        if let Some(state) = record.state
            && !self.state.blocks_generic_merge()
        {
            self.state = state;
        }
    }
}

/// The persisted index document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TagIndex {
    pub version: u32,
    pub entries: BTreeMap<String, IndexEntry>,
}

impl Default for TagIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

impl TagIndex {
    pub fn get(&self, id: &str) -> Option<&IndexEntry> {
        match id.parse::<TagId>() {
            Ok(tag) => self.entries.get(&tag.to_string()),
            Err(_) => self.entries.get(id),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Numbers already taken in a TYPE+DOMAIN bucket.
    pub fn numbers_in_bucket(&self, tag_type: TagType, domain: &str) -> FxHashSet<u64> {
        self.entries
            .keys()
            .filter_map(|k| k.parse::<TagId>().ok())
            .filter(|t| t.tag_type == tag_type && t.domain == domain)
            .filter_map(|t| t.numeric())
            .collect()
    }

    /// Smallest number above every number used in the bucket.
    pub fn next_number(&self, tag_type: TagType, domain: &str) -> u64 {
        next_free_number(&self.numbers_in_bucket(tag_type, domain))
    }
}

/// One above the highest used number. When the highest is `u64::MAX`, the
/// lowest gap from 1 upward is used instead.
pub fn next_free_number(used: &FxHashSet<u64>) -> u64 {
    match used.iter().max() {
        None => 1,
        Some(max) => max
            .checked_add(1)
            .unwrap_or_else(|| (1..).find(|n| !used.contains(n)).unwrap_or(0)),
    }
}

/// A ledger line or record that was skipped during load or replay.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SkippedRecord {
    pub line: usize,
    pub reason: String,
}

impl From<SkippedRecord> for TagError {
    fn from(s: SkippedRecord) -> Self {
        TagError::MalformedRecord {
            line: s.line,
            reason: s.reason,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadedLedger {
    /// `(line number, record)` in file order.
    pub records: Vec<(usize, LedgerRecord)>,
    pub skipped: Vec<SkippedRecord>,
}

#[derive(Debug, Clone)]
pub struct Projection {
    pub index: TagIndex,
    pub applied: usize,
    pub skipped: Vec<SkippedRecord>,
}

/// Folds records into an index. Pure: depends only on the records given.
pub fn project(records: &[LedgerRecord]) -> Projection {
    project_numbered(records.iter().enumerate().map(|(i, r)| (i + 1, r)))
}

fn project_numbered<'a, I>(records: I) -> Projection
where
    I: IntoIterator<Item = (usize, &'a LedgerRecord)>,
{
    let mut skipped = Vec::new();
    let mut ordered = Vec::new();
    for (line, record) in records {
        let Some(secs) = record.ts.as_deref().and_then(time::parse_epoch_z) else {
            skipped.push(SkippedRecord {
                line,
                reason: format!("missing or malformed ts {:?}", record.ts),
            });
            continue;
        };
        let tag = match record.subject().parse::<TagId>() {
            Ok(tag) => tag,
            Err(e) => {
                skipped.push(SkippedRecord {
                    line,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        ordered.push((secs, tag, record));
    }
    // Stable: records sharing a second keep ledger order.
    ordered.sort_by_key(|(secs, _, _)| *secs);

    let mut entries: BTreeMap<String, IndexEntry> = BTreeMap::new();
    let mut applied = 0usize;
    for (secs, tag, record) in ordered {
        let key = tag.to_string();
        match record.op {
            LedgerOp::Rescind | LedgerOp::Deprecated | LedgerOp::Migrate => {
                let Some(entry) = entries.get_mut(&key) else {
                    continue;
                };
                if entry.state.is_terminal() {
                    tracing::debug!(id = %key, op = ?record.op, "ignoring transition out of terminal state");
                    continue;
                }
                match record.op {
                    LedgerOp::Rescind => entry.state = TagState::Rescinded,
                    LedgerOp::Deprecated => entry.state = TagState::Deprecated,
                    _ => {
                        entry.state = TagState::Migrated;
                        entry.migrated_to = record.to.clone();
                    }
                }
            }
            op => {
                if op.creates() && !entries.contains_key(&key) {
                    let seeded = IndexEntry::seed(&tag, record, &time::format_epoch_z(secs));
                    entries.insert(key.clone(), seeded);
                }
                let Some(entry) = entries.get_mut(&key) else {
                    continue;
                };
                entry.merge(record);
            }
        }
        applied += 1;
    }

    Projection {
        index: TagIndex {
            version: INDEX_VERSION,
            entries,
        },
        applied,
        skipped,
    }
}

/// Reserved entries whose `created` is older than `now - threshold_hours`.
/// Entries with an unparseable `created` are skipped.
pub fn find_expired_reservations(
    index: &TagIndex,
    threshold_hours: u64,
    now_secs: u64,
) -> Vec<&IndexEntry> {
    let cutoff = now_secs.saturating_sub(threshold_hours.saturating_mul(SECS_PER_HOUR));
    index
        .entries
        .values()
        .filter(|e| e.state == TagState::Reserved)
        .filter(|e| match time::parse_epoch_z(&e.created) {
            Some(created) => created < cutoff,
            None => {
                tracing::warn!(id = %e.id, created = %e.created, "skipping reservation with malformed timestamp");
                false
            }
        })
        .collect()
}

#[derive(Serialize, Debug, Clone)]
pub struct AppendReceipt {
    pub appended: usize,
    pub locked: bool,
    pub index_entries: usize,
    pub skipped: Vec<SkippedRecord>,
}

#[derive(Serialize, Debug, Clone)]
pub struct RebuildReport {
    pub records: usize,
    pub applied: usize,
    pub index_entries: usize,
    pub skipped: Vec<SkippedRecord>,
    pub index_path: PathBuf,
}

/// Owner of `ledger.jsonl` and `index.json` for one store.
pub struct LedgerManager<'a> {
    store: &'a Store,
    policy: &'a Policy,
}

impl<'a> LedgerManager<'a> {
    pub fn new(store: &'a Store, policy: &'a Policy) -> Self {
        Self { store, policy }
    }

    /// Appends one record, then rebuilds and persists the index.
    pub fn append(&self, record: LedgerRecord) -> Result<AppendReceipt, TagError> {
        self.append_batch(vec![record])
    }

    /// Appends records in order under one lock, then rebuilds once.
    ///
    /// Every record is validated and serialized before the first write, so an
    /// invalid record leaves the ledger untouched.
    pub fn append_batch(&self, records: Vec<LedgerRecord>) -> Result<AppendReceipt, TagError> {
        let now = time::now_epoch_z();
        let mut lines = Vec::with_capacity(records.len());
        for record in records {
            let record = normalize_for_append(record, &now)?;
            lines.push(serde_json::to_string(&record)?);
        }

        let guard = lock::acquire_with_timeout(
            &self.store.ledger_lock_path(),
            self.policy.ledger_lock_timeout,
        )?;
        let locked = guard.is_acquired();

        let ledger_path = self.store.ledger_path();
        for line in &lines {
            fsio::append_line(&ledger_path, line)?;
        }
        let report = self.rebuild_locked()?;
        drop(guard);

        tracing::info!(
            appended = lines.len(),
            entries = report.index_entries,
            locked,
            "ledger append"
        );
        Ok(AppendReceipt {
            appended: lines.len(),
            locked,
            index_entries: report.index_entries,
            skipped: report.skipped,
        })
    }

    /// Reads every ledger line; corrupt lines are skipped and reported.
    pub fn load(&self) -> Result<LoadedLedger, TagError> {
        let path = self.store.ledger_path();
        if !path.is_file() {
            return Ok(LoadedLedger::default());
        }
        let reader = BufReader::new(fs::File::open(&path)?);
        let mut loaded = LoadedLedger::default();
        for (i, line) in reader.lines().enumerate() {
            let line_no = i + 1;
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    loaded.skipped.push(SkippedRecord {
                        line: line_no,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerRecord>(trimmed) {
                Ok(rec) => loaded.records.push((line_no, rec)),
                Err(e) => loaded.skipped.push(SkippedRecord {
                    line: line_no,
                    reason: e.to_string(),
                }),
            }
        }
        for s in &loaded.skipped {
            tracing::warn!(line = s.line, reason = %s.reason, "skipping malformed ledger line");
        }
        Ok(loaded)
    }

    /// Replays the ledger in memory without touching the index file.
    pub fn replay(&self) -> Result<Projection, TagError> {
        let loaded = self.load()?;
        let mut projection =
            project_numbered(loaded.records.iter().map(|(line, rec)| (*line, rec)));
        let mut skipped = loaded.skipped;
        skipped.append(&mut projection.skipped);
        skipped.sort_by_key(|s| s.line);
        projection.skipped = skipped;
        Ok(projection)
    }

    /// Rebuilds the index from the ledger and persists it atomically.
    pub fn rebuild_index(&self) -> Result<RebuildReport, TagError> {
        let _guard = lock::acquire_with_timeout(
            &self.store.ledger_lock_path(),
            self.policy.ledger_lock_timeout,
        )?;
        self.rebuild_locked()
    }

    fn rebuild_locked(&self) -> Result<RebuildReport, TagError> {
        let projection = self.replay()?;
        let index_path = self.store.index_path();
        fsio::write_json_atomic(&index_path, &projection.index)?;
        Ok(RebuildReport {
            records: projection.applied + projection.skipped.len(),
            applied: projection.applied,
            index_entries: projection.index.len(),
            skipped: projection.skipped,
            index_path,
        })
    }

    /// Lock-free read of the persisted index. A missing or unreadable index is
    /// replaced by an in-memory replay.
    pub fn read_index(&self) -> Result<TagIndex, TagError> {
        let path = self.store.index_path();
        if path.is_file() {
            match fs::read_to_string(&path)
                .map_err(TagError::from)
                .and_then(|s| serde_json::from_str::<TagIndex>(&s).map_err(TagError::from))
            {
                Ok(index) if index.version == INDEX_VERSION => return Ok(index),
                Ok(index) => {
                    tracing::warn!(version = index.version, "index version mismatch; replaying ledger")
                }
                Err(e) => tracing::warn!(error = %e, "unreadable index; replaying ledger"),
            }
        }
        Ok(self.replay()?.index)
    }

    pub fn get(&self, id: &str) -> Result<Option<IndexEntry>, TagError> {
        Ok(self.read_index()?.get(id).cloned())
    }

    /// Expired reservations under the policy threshold, as of now.
    pub fn find_expired(&self) -> Result<Vec<IndexEntry>, TagError> {
        let index = self.read_index()?;
        Ok(find_expired_reservations(
            &index,
            self.policy.reservation_expiry_hours,
            time::now_epoch_secs(),
        )
        .into_iter()
        .cloned()
        .collect())
    }

    /// Appends a RESCIND for every expired reservation. Returns the ids.
    pub fn rescind_expired(&self, actor: &str) -> Result<Vec<String>, TagError> {
        let expired = self.find_expired()?;
        if expired.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = expired.iter().map(|e| e.id.clone()).collect();
        let records = ids
            .iter()
            .map(|id| {
                LedgerRecord::new(LedgerOp::Rescind, id.clone())
                    .with_actor(actor)
                    .with_reason(format!(
                        "reservation expired after {}h",
                        self.policy.reservation_expiry_hours
                    ))
            })
            .collect();
        self.append_batch(records)?;
        Ok(ids)
    }

    /// Copies the ledger verbatim into a read-only, timestamped archive.
    pub fn snapshot(&self) -> Result<PathBuf, TagError> {
        let ledger = self.store.ledger_path();
        if !ledger.is_file() {
            return Err(TagError::NotFound(format!(
                "ledger {} does not exist",
                ledger.display()
            )));
        }
        let bytes = fs::read(&ledger)?;
        let dir = self.store.snapshot_dir();
        let target = dir.join(format!(
            "ledger-{}-{}.jsonl",
            time::now_epoch_secs(),
            time::new_event_id()
        ));
        fsio::write_atomic(&target, &bytes)?;
        let mut perms = fs::metadata(&target)?.permissions();
        perms.set_readonly(true);
        fs::set_permissions(&target, perms)?;
        tracing::info!(path = %target.display(), bytes = bytes.len(), "ledger snapshot");
        Ok(target)
    }

    /// Snapshot file names, oldest first.
    pub fn list_snapshots(&self) -> Result<Vec<String>, TagError> {
        let dir = self.store.snapshot_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names: Vec<(u64, String)> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with("ledger-") && n.ends_with(".jsonl"))
            .map(|n| {
                let secs = n
                    .trim_start_matches("ledger-")
                    .split('-')
                    .next()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                (secs, n)
            })
            .collect();
        names.sort();
        Ok(names.into_iter().map(|(_, n)| n).collect())
    }
}

fn normalize_for_append(mut record: LedgerRecord, now: &str) -> Result<LedgerRecord, TagError> {
    record.id = record.id.parse::<TagId>()?.to_string();
    if record.op == LedgerOp::Migrate {
        let to = record.to.as_deref().ok_or_else(|| {
            TagError::ValidationError(format!("MIGRATE of {} requires `to`", record.id))
        })?;
        record.to = Some(to.parse::<TagId>()?.to_string());
        let from = record.from.as_deref().unwrap_or(&record.id);
        record.from = Some(from.parse::<TagId>()?.to_string());
    }
    match record.ts.as_deref() {
        None => record.ts = Some(now.to_string()),
        Some(ts) if time::parse_epoch_z(ts).is_none() => {
            return Err(TagError::ValidationError(format!(
                "record for {} has malformed ts '{}'",
                record.id, ts
            )));
        }
        Some(_) => {}
    }
    if record.event_id.is_none() {
        record.event_id = Some(time::new_event_id());
    }
    Ok(record)
}
