//! CLI struct definitions for the tagledger command-line interface.
//!
//! All clap-derived types live here. Dispatch logic lives in `lib.rs`.

use crate::core::tag_id::TagType;
use crate::plugins::ledger::{LedgerOp, TagState};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "tagledger",
    version = env!("CARGO_PKG_VERSION"),
    about = "Append-only TAG ledger, duplicate resolver and checkpoint/rollback manager"
)]
pub(crate) struct Cli {
    /// Project root (defaults to the current directory).
    #[clap(long, global = true)]
    pub root: Option<PathBuf>,
    /// Policy file (defaults to <root>/.tagledger/policy.toml when present).
    #[clap(long, global = true)]
    pub policy: Option<PathBuf>,
    /// Output format.
    #[clap(long, global = true, value_enum, default_value = "text")]
    pub format: OutputFormat,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Append to and inspect the TAG ledger
    Ledger(LedgerCli),
    /// Scan files for duplicate identifiers and print a correction plan
    Scan {
        /// Files to scan.
        files: Vec<PathBuf>,
    },
    /// Create, list and restore checkpoints
    Checkpoint(CheckpointCli),
    /// Read a JSON hook request on stdin and write the JSON response
    Hook,
}

#[derive(clap::Args, Debug)]
pub(crate) struct LedgerCli {
    #[clap(subcommand)]
    pub command: LedgerCommand,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum OpArg {
    Create,
    Reserve,
    Issue,
    Update,
    Rescind,
    Deprecated,
    Migrate,
}

impl From<OpArg> for LedgerOp {
    fn from(op: OpArg) -> Self {
        match op {
            OpArg::Create => LedgerOp::Create,
            OpArg::Reserve => LedgerOp::Reserve,
            OpArg::Issue => LedgerOp::Issue,
            OpArg::Update => LedgerOp::Update,
            OpArg::Rescind => LedgerOp::Rescind,
            OpArg::Deprecated => LedgerOp::Deprecated,
            OpArg::Migrate => LedgerOp::Migrate,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum StateArg {
    Reserved,
    Active,
    Deprecated,
    Rescinded,
    Migrated,
}

impl From<StateArg> for TagState {
    fn from(s: StateArg) -> Self {
        match s {
            StateArg::Reserved => TagState::Reserved,
            StateArg::Active => TagState::Active,
            StateArg::Deprecated => TagState::Deprecated,
            StateArg::Rescinded => TagState::Rescinded,
            StateArg::Migrated => TagState::Migrated,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum LinkKindArg {
    Spec,
    Test,
    Code,
    Doc,
}

impl From<LinkKindArg> for TagType {
    fn from(k: LinkKindArg) -> Self {
        match k {
            LinkKindArg::Spec => TagType::Spec,
            LinkKindArg::Test => TagType::Test,
            LinkKindArg::Code => TagType::Code,
            LinkKindArg::Doc => TagType::Doc,
        }
    }
}

#[derive(Subcommand, Debug)]
pub(crate) enum LedgerCommand {
    /// Append one record and rebuild the index
    Append {
        #[clap(long, value_enum)]
        op: OpArg,
        /// Identifier, e.g. @SPEC:AUTH-001 (the source identifier for migrate).
        #[clap(long)]
        id: String,
        /// File path; repeat to add related paths.
        #[clap(long = "path")]
        paths: Vec<String>,
        #[clap(long, value_enum)]
        state: Option<StateArg>,
        /// Link as KIND=ID, e.g. --link test=@TEST:AUTH-001.
        #[clap(long = "link", value_parser = parse_link)]
        links: Vec<(LinkKindArg, String)>,
        #[clap(long)]
        domain: Option<String>,
        #[clap(long, default_value = "operator")]
        actor: String,
        #[clap(long)]
        reason: Option<String>,
        /// Migration target (migrate only).
        #[clap(long)]
        to: Option<String>,
    },
    /// Rebuild the index from the ledger
    Rebuild,
    /// Show one index entry
    Show { id: String },
    /// List index entries, optionally filtered by state
    List {
        #[clap(long, value_enum)]
        state: Option<StateArg>,
    },
    /// List reservations older than the expiry threshold
    Expired {
        /// Override the policy threshold (hours).
        #[clap(long)]
        hours: Option<u64>,
    },
    /// Rescind every expired reservation
    RescindExpired {
        #[clap(long, default_value = "operator")]
        actor: String,
    },
    /// Archive a read-only copy of the ledger
    Snapshot,
    /// List ledger snapshots
    Snapshots,
}

fn parse_link(raw: &str) -> Result<(LinkKindArg, String), String> {
    let (kind, id) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KIND=ID, got '{}'", raw))?;
    let kind = LinkKindArg::from_str(kind, true)?;
    Ok((kind, id.to_string()))
}

#[derive(clap::Args, Debug)]
pub(crate) struct CheckpointCli {
    #[clap(subcommand)]
    pub command: CheckpointCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CheckpointCommand {
    /// Capture files (or the configured include set) into a new checkpoint
    Create {
        #[clap(short, long)]
        description: String,
        /// Files to capture; discovered from policy globs when omitted.
        files: Vec<PathBuf>,
    },
    /// List checkpoints, newest first
    List,
    /// Restore a checkpoint by id
    Rollback { id: String },
    /// Restore the most recent checkpoint
    Latest,
    /// Restore the oldest checkpoint that passes integrity validation
    Emergency,
    /// Check that a checkpoint's backups are complete
    Validate { id: String },
    /// Delete a checkpoint and its backups
    Delete { id: String },
    /// Show the rollback history
    History,
}
