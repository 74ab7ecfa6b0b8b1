//! Subsystems built on [`crate::core`].
//!
//! - [`ledger`]: append-only lifecycle log and its index projection
//! - [`header`]: header-comment detection for topline scanning
//! - [`resolver`]: duplicate detection, severity and correction plans
//! - [`checkpoint`]: fingerprinted backups and rollback
//! - [`hook`]: JSON-in/JSON-out surface for host tools

pub mod checkpoint;
pub mod header;
pub mod hook;
pub mod ledger;
pub mod resolver;
