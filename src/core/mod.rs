//! Shared primitives: error type, state layout, policy, identifier grammar,
//! durable file writes, advisory locks and time helpers.

pub mod error;
pub mod fsio;
pub mod lock;
pub mod policy;
pub mod store;
pub mod tag_id;
pub mod time;
