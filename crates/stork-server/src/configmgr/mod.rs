//! Configuration transactions.
//!
//! Stages subnet and shared network changes per user, locks the daemons
//! they touch, sends the Kea commands and persists the result.

mod context;
mod error;
mod manager;

#[cfg(test)]
mod manager_tests;

pub use context::{TransactionContext, TransactionState};
pub use error::{ApplyError, CommitError, ConfigManagerError, SentCommand};
pub use manager::ConfigManager;
