use thiserror::Error;

use super::context::TransactionState;
use crate::agentcomm::AgentError;
use crate::dhcp::KeaModuleError;
use crate::storage::DatabaseError;

/// Failure to stage a change in a transaction.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Kea(#[from] KeaModuleError),

    #[error("daemon {0} cannot be configured in this transaction")]
    UnknownDaemon(i64),

    #[error("daemon {0} is not locked by this transaction")]
    NotLocked(i64),

    #[error("transaction holds no {0} to modify")]
    MissingImage(&'static str),
}

/// A command sent while committing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCommand {
    pub daemon_id: i64,
    pub daemon_name: String,
    pub command: String,
}

/// Commit stopped at the first command that failed. Commands already sent
/// are not rolled back; `sent` lists them so they can be reconciled.
#[derive(Debug, Error)]
#[error(
    "Problem with committing the configuration: {command} failed on {daemon_name} (daemon {daemon_id}) at step {step}: {source}"
)]
pub struct CommitError {
    pub daemon_id: i64,
    pub daemon_name: String,
    pub app_id: i64,
    pub command: String,
    /// Zero-based index of the failed command within the whole plan.
    pub step: usize,
    pub sent: Vec<SentCommand>,
    #[source]
    pub source: AgentError,
}

impl CommitError {
    /// True when the daemon or its control agent rejected the command, as
    /// opposed to the command never reaching it.
    pub const fn is_daemon_error(&self) -> bool {
        matches!(self.source, AgentError::Daemon { .. })
    }
}

#[derive(Debug, Error)]
pub enum ConfigManagerError {
    #[error("Unable to edit the subnet with ID {0} because it cannot be found")]
    SubnetNotFound(i64),

    #[error("Unable to edit the shared network with ID {0} because it cannot be found")]
    SharedNetworkNotFound(i64),

    #[error(
        "Unable to edit the {resource} with ID {id} because it may be currently edited by another user"
    )]
    Locked { resource: &'static str, id: i64 },

    #[error(
        "Unable to edit the {resource} with ID {id} because daemon {daemon_name} (id {daemon_id}) does not use the libdhcp_subnet_cmds hook library"
    )]
    NoSubnetCmdsHook {
        resource: &'static str,
        id: i64,
        daemon_id: i64,
        daemon_name: String,
    },

    #[error("Transaction {0} does not exist or has expired")]
    TransactionExpired(u64),

    #[error("Transaction {id} cannot proceed from the {state:?} state")]
    InvalidState { id: u64, state: TransactionState },

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<KeaModuleError> for ConfigManagerError {
    fn from(err: KeaModuleError) -> Self {
        Self::Apply(ApplyError::Kea(err))
    }
}
