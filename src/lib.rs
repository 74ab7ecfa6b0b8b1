//! tagledger: traceability TAG ledger and recovery toolkit.
//!
//! Tracks identifiers of the form `@TYPE:DOMAIN-NNN` (TYPE is SPEC, TEST, CODE
//! or DOC) across a codebase, and recovers project files after risky
//! automated edits.
//!
//! # Architecture
//!
//! - **Ledger** (`.tagledger/ledger.jsonl`): append-only lifecycle events, the
//!   sole source of truth.
//! - **Index** (`.tagledger/index.json`): a disposable projection of the
//!   ledger, rebuilt deterministically on every append.
//! - **Resolver**: finds identifiers declared or cited in more than one place,
//!   ranks occurrences by path authority and proposes (never applies)
//!   renumbering.
//! - **Checkpoints** (`.tagledger/checkpoints/`): SHA-256 fingerprinted byte
//!   backups of a file set, restorable on demand, with retention and an
//!   emergency path that picks the oldest intact checkpoint.
//!
//! Every component takes an immutable [`core::policy::Policy`] by reference.
//!
//! # Examples
//!
//! ```bash
//! tagledger ledger append --op create --id @SPEC:AUTH-001 --state active --path specs/auth.md
//! tagledger scan src/auth.rs specs/auth.md
//! tagledger checkpoint create -d "before bulk rename"
//! tagledger checkpoint latest
//! ```

mod cli;
pub mod core;
pub mod plugins;

use crate::cli::{CheckpointCommand, Cli, Command, LedgerCommand, OutputFormat};
use crate::core::error::TagError;
use crate::core::policy::{self, Policy};
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::checkpoint::{CheckpointManager, RollbackReport};
use crate::plugins::hook;
use crate::plugins::ledger::{LedgerManager, LedgerOp, LedgerRecord, TagState, find_expired_reservations};
use crate::plugins::resolver::{self, CorrectionAction, Severity};
use clap::Parser;
use colored::Colorize;
use std::io::Read;

pub fn run() -> Result<(), TagError> {
    let cli = Cli::parse();
    let root = match cli.root {
        Some(r) => r,
        None => std::env::current_dir()?,
    };
    let store = Store::new(root);
    let format = cli.format;
    let policy_path = cli.policy.as_deref();
    let load_policy = || policy::load_policy(&store, policy_path);

    match cli.command {
        Command::Ledger(ledger_cli) => run_ledger(&store, &load_policy()?, format, ledger_cli.command),
        Command::Scan { files } => run_scan(&store, &load_policy()?, format, &files),
        Command::Checkpoint(cp_cli) => {
            run_checkpoint(&store, &load_policy()?, format, cp_cli.command)
        }
        Command::Hook => run_hook(&store, policy_path),
    }
}

/// Hook output is always a JSON response on stdout, including for unreadable
/// input and policy errors.
fn run_hook(store: &Store, policy_path: Option<&std::path::Path>) -> Result<(), TagError> {
    let mut input = String::new();
    let response = match std::io::stdin().read_to_string(&mut input) {
        Ok(_) => hook::process_input(store, policy_path, &input),
        Err(e) => hook::HookResponse::failed(&TagError::from(e)),
    };
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn emit_json(cmd: &str, body: serde_json::Value) -> Result<(), TagError> {
    let envelope = time::command_envelope(cmd, "ok", body);
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}

fn run_ledger(
    store: &Store,
    policy: &Policy,
    format: OutputFormat,
    command: LedgerCommand,
) -> Result<(), TagError> {
    let ledger = LedgerManager::new(store, policy);
    match command {
        LedgerCommand::Append {
            op,
            id,
            paths,
            state,
            links,
            domain,
            actor,
            reason,
            to,
        } => {
            let op = LedgerOp::from(op);
            let mut record = match op {
                LedgerOp::Migrate => {
                    let to = to.ok_or_else(|| {
                        TagError::ValidationError("--to is required for migrate".into())
                    })?;
                    LedgerRecord::migrate(id.clone(), to)
                }
                _ => LedgerRecord::new(op, id.clone()),
            };
            for path in paths {
                record = record.with_path(path);
            }
            for (kind, target) in links {
                record = record.with_link(kind.into(), target);
            }
            if let Some(state) = state {
                record = record.with_state(TagState::from(state));
            }
            record.domain = domain;
            record = record.with_actor(actor);
            if let Some(reason) = reason {
                record = record.with_reason(reason);
            }
            let receipt = ledger.append(record)?;
            match format {
                OutputFormat::Json => emit_json("ledger.append", serde_json::to_value(&receipt)?),
                OutputFormat::Text => {
                    println!(
                        "{} appended {} ({} index entries)",
                        "✓".bright_green(),
                        id.bright_cyan(),
                        receipt.index_entries
                    );
                    if !receipt.locked {
                        println!("{} ledger lock timed out; wrote without lock", "⚠".bright_yellow());
                    }
                    Ok(())
                }
            }
        }
        LedgerCommand::Rebuild => {
            let report = ledger.rebuild_index()?;
            match format {
                OutputFormat::Json => emit_json("ledger.rebuild", serde_json::to_value(&report)?),
                OutputFormat::Text => {
                    println!(
                        "{} rebuilt index: {} records, {} entries",
                        "✓".bright_green(),
                        report.records,
                        report.index_entries
                    );
                    for s in &report.skipped {
                        println!("  {} line {}: {}", "⚠".bright_yellow(), s.line, s.reason);
                    }
                    Ok(())
                }
            }
        }
        LedgerCommand::Show { id } => {
            let entry = ledger
                .get(&id)?
                .ok_or_else(|| TagError::NotFound(format!("identifier {}", id)))?;
            match format {
                OutputFormat::Json => emit_json("ledger.show", serde_json::to_value(&entry)?),
                OutputFormat::Text => {
                    println!("{} [{:?}]", entry.id.bright_cyan(), entry.state);
                    println!("  type:    {}", entry.tag_type);
                    println!("  domain:  {}", entry.domain);
                    println!("  created: {}", entry.created);
                    if let Some(p) = &entry.primary_path {
                        println!("  primary: {}", p);
                    }
                    for p in &entry.related_paths {
                        println!("  related: {}", p);
                    }
                    for (kind, targets) in entry.links.iter().filter(|(_, t)| !t.is_empty()) {
                        println!("  {}: {}", kind, targets.join(", "));
                    }
                    if let Some(to) = &entry.migrated_to {
                        println!("  migrated to: {}", to);
                    }
                    Ok(())
                }
            }
        }
        LedgerCommand::List { state } => {
            let index = ledger.read_index()?;
            let wanted = state.map(TagState::from);
            let entries: Vec<_> = index
                .entries
                .values()
                .filter(|e| wanted.is_none_or(|s| e.state == s))
                .collect();
            match format {
                OutputFormat::Json => emit_json(
                    "ledger.list",
                    serde_json::json!({ "count": entries.len(), "entries": entries }),
                ),
                OutputFormat::Text => {
                    for e in &entries {
                        println!(
                            "{:<28} {:<10} {}",
                            e.id,
                            format!("{:?}", e.state).to_lowercase(),
                            e.primary_path.as_deref().unwrap_or("-")
                        );
                    }
                    Ok(())
                }
            }
        }
        LedgerCommand::Expired { hours } => {
            let index = ledger.read_index()?;
            let threshold = hours.unwrap_or(policy.reservation_expiry_hours);
            let expired = find_expired_reservations(&index, threshold, time::now_epoch_secs());
            match format {
                OutputFormat::Json => emit_json(
                    "ledger.expired",
                    serde_json::json!({ "threshold_hours": threshold, "expired": expired }),
                ),
                OutputFormat::Text => {
                    if expired.is_empty() {
                        println!("No reservations older than {}h", threshold);
                    }
                    for e in expired {
                        println!("{} {} reserved at {}", "⏳".bright_yellow(), e.id, e.created);
                    }
                    Ok(())
                }
            }
        }
        LedgerCommand::RescindExpired { actor } => {
            let ids = ledger.rescind_expired(&actor)?;
            match format {
                OutputFormat::Json => {
                    emit_json("ledger.rescind_expired", serde_json::json!({ "rescinded": ids }))
                }
                OutputFormat::Text => {
                    println!("Rescinded {} expired reservation(s)", ids.len());
                    for id in ids {
                        println!("  {}", id);
                    }
                    Ok(())
                }
            }
        }
        LedgerCommand::Snapshot => {
            let path = ledger.snapshot()?;
            match format {
                OutputFormat::Json => emit_json(
                    "ledger.snapshot",
                    serde_json::json!({ "path": path.to_string_lossy() }),
                ),
                OutputFormat::Text => {
                    println!("{} snapshot written to {}", "✓".bright_green(), path.display());
                    Ok(())
                }
            }
        }
        LedgerCommand::Snapshots => {
            let names = ledger.list_snapshots()?;
            match format {
                OutputFormat::Json => {
                    emit_json("ledger.snapshots", serde_json::json!({ "snapshots": names }))
                }
                OutputFormat::Text => {
                    for n in names {
                        println!("{}", n);
                    }
                    Ok(())
                }
            }
        }
    }
}

fn run_scan(
    store: &Store,
    policy: &Policy,
    format: OutputFormat,
    files: &[std::path::PathBuf],
) -> Result<(), TagError> {
    let index = LedgerManager::new(store, policy).read_index()?;
    let resolution = resolver::resolve(store, files, Some(&index), policy);
    if format == OutputFormat::Json {
        return emit_json("scan", serde_json::to_value(&resolution)?);
    }

    println!(
        "Scanned {} file(s), {} occurrence(s), {} duplicate group(s)",
        resolution.scan.files_scanned,
        resolution.scan.occurrences.len(),
        resolution.groups.len()
    );
    for w in &resolution.scan.warnings {
        println!("  {} {}", "⚠".bright_yellow(), w);
    }
    for g in &resolution.groups {
        let label = match g.severity {
            Severity::Critical => "CRITICAL".bright_red().bold(),
            Severity::Warning => "WARNING".bright_yellow(),
            Severity::Info => "INFO".normal(),
        };
        println!(
            "{} {} primary {}:{} (authority {})",
            label, g.group.key, g.group.primary.path, g.group.primary.line, g.group.primary.authority
        );
        for d in &g.group.duplicates {
            println!("    {:?} {}:{} (authority {})", d.kind, d.path, d.line, d.authority);
        }
    }
    if !resolution.plan.corrections.is_empty() {
        println!("Correction plan (dry run):");
        for c in &resolution.plan.corrections {
            match &c.action {
                CorrectionAction::Renumber { from, to } => println!(
                    "  {} {}:{} {} -> {} [{:?}, impact {}]",
                    "renumber".bright_cyan(),
                    c.path,
                    c.line,
                    from,
                    to,
                    c.confidence,
                    c.impact
                ),
                CorrectionAction::TrackOnly { id } => {
                    println!("  {} {}:{} {}", "track".normal(), c.path, c.line, id)
                }
            }
        }
    }
    Ok(())
}

fn print_rollback(report: &RollbackReport) {
    let mark = if report.success {
        "✓".bright_green()
    } else {
        "✗".bright_red()
    };
    println!(
        "{} rollback to {}: {}/{} file(s) restored",
        mark,
        report.checkpoint_id.bright_cyan(),
        report.restored.len(),
        report.file_count()
    );
    if let Some(safety) = &report.safety_checkpoint {
        println!("  safety checkpoint: {}", safety);
    }
    for f in &report.failed {
        println!("  {} {}: {}", "✗".bright_red(), f.path, f.reason);
    }
}

fn finish_rollback(format: OutputFormat, cmd: &str, report: RollbackReport) -> Result<(), TagError> {
    match format {
        OutputFormat::Json => emit_json(cmd, serde_json::to_value(&report)?)?,
        OutputFormat::Text => print_rollback(&report),
    }
    report.ensure_complete().map(|_| ())
}

fn run_checkpoint(
    store: &Store,
    policy: &Policy,
    format: OutputFormat,
    command: CheckpointCommand,
) -> Result<(), TagError> {
    let manager = CheckpointManager::new(store, policy);
    match command {
        CheckpointCommand::Create { description, files } => {
            let files = if files.is_empty() { None } else { Some(files.as_slice()) };
            let receipt = manager.create_checkpoint(&description, files, None)?;
            match format {
                OutputFormat::Json => emit_json("checkpoint.create", serde_json::to_value(&receipt)?),
                OutputFormat::Text => {
                    println!(
                        "{} checkpoint {} ({} file(s))",
                        "✓".bright_green(),
                        receipt.checkpoint.id.bright_cyan(),
                        receipt.checkpoint.file_states.len()
                    );
                    for s in &receipt.skipped {
                        println!("  {} skipped {}", "⚠".bright_yellow(), s);
                    }
                    for e in &receipt.evicted {
                        println!("  evicted {}", e);
                    }
                    if receipt.discovery_truncated {
                        println!(
                            "  {} discovery stopped at {} files",
                            "⚠".bright_yellow(),
                            policy.checkpoint_max_files
                        );
                    }
                    Ok(())
                }
            }
        }
        CheckpointCommand::List => {
            let all = manager.list_checkpoints()?;
            match format {
                OutputFormat::Json => emit_json(
                    "checkpoint.list",
                    serde_json::json!({ "count": all.len(), "checkpoints": all }),
                ),
                OutputFormat::Text => {
                    for cp in &all {
                        println!(
                            "{}  {}  {:>4} file(s)  {}",
                            cp.id.bright_cyan(),
                            cp.timestamp,
                            cp.file_states.len(),
                            cp.description
                        );
                    }
                    Ok(())
                }
            }
        }
        CheckpointCommand::Rollback { id } => {
            let report = manager.rollback_to_checkpoint(&id)?;
            finish_rollback(format, "checkpoint.rollback", report)
        }
        CheckpointCommand::Latest => {
            let report = manager.rollback_to_latest()?;
            finish_rollback(format, "checkpoint.latest", report)
        }
        CheckpointCommand::Emergency => {
            let report = manager.emergency_rollback()?;
            finish_rollback(format, "checkpoint.emergency", report)
        }
        CheckpointCommand::Validate { id } => {
            let valid = manager.validate_checkpoint_integrity(&id);
            match format {
                OutputFormat::Json => emit_json(
                    "checkpoint.validate",
                    serde_json::json!({ "id": id, "valid": valid }),
                )?,
                OutputFormat::Text => {
                    if valid {
                        println!("{} {} is intact", "✓".bright_green(), id);
                    } else {
                        println!("{} {} is missing backups", "✗".bright_red(), id);
                    }
                }
            }
            if valid {
                Ok(())
            } else {
                Err(TagError::IntegrityViolation(format!(
                    "checkpoint {} failed validation",
                    id
                )))
            }
        }
        CheckpointCommand::Delete { id } => {
            manager.delete_checkpoint(&id)?;
            match format {
                OutputFormat::Json => {
                    emit_json("checkpoint.delete", serde_json::json!({ "deleted": id }))
                }
                OutputFormat::Text => {
                    println!("Deleted {}", id);
                    Ok(())
                }
            }
        }
        CheckpointCommand::History => {
            let history = manager.rollback_history()?;
            match format {
                OutputFormat::Json => {
                    emit_json("checkpoint.history", serde_json::json!({ "history": history }))
                }
                OutputFormat::Text => {
                    for h in &history {
                        println!(
                            "{}  {}  {:?}  {} file(s)  {}",
                            h.timestamp, h.checkpoint_id, h.outcome, h.file_count, h.description
                        );
                    }
                    Ok(())
                }
            }
        }
    }
}
