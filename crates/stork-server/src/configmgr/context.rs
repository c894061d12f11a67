//! Transaction contexts and the daemon lock table.
//!
//! Contexts and locks expire together: each transaction has a single
//! deadline fixed when it is created. Expired transactions are found by
//! peeking at a min-heap of deadlines, so every access to the store first
//! drops whatever expired since the previous one.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};

use crate::dhcp::{ConfigRecipe, Resource};
use crate::storage::DaemonRef;

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Created,
    Open,
    Staged,
    Committed,
}

/// One user's in-progress configuration change.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    pub id: u64,
    pub user_id: i64,
    pub state: TransactionState,
    /// Daemons the change may target.
    pub daemons: Vec<DaemonRef>,
    /// Resource as stored before the edit.
    pub pre_image: Option<Resource>,
    pub locked_daemons: Vec<i64>,
    /// Staged changes, in the order they were applied.
    pub recipes: Vec<ConfigRecipe>,
    pub created_at: Instant,
    pub deadline: Instant,
}

impl TransactionContext {
    pub(super) fn new(id: u64, user_id: i64, created_at: Instant, deadline: Instant) -> Self {
        Self {
            id,
            user_id,
            state: TransactionState::Created,
            daemons: Vec::new(),
            pre_image: None,
            locked_daemons: Vec::new(),
            recipes: Vec::new(),
            created_at,
            deadline,
        }
    }

    pub fn daemon(&self, id: i64) -> Option<&DaemonRef> {
        self.daemons.iter().find(|d| d.id == id)
    }
}

/// Remembered contexts, their deadlines and the daemon locks.
#[derive(Debug, Default)]
pub(super) struct ContextStore {
    contexts: HashMap<u64, TransactionContext>,
    deadlines: HashMap<u64, Instant>,
    expiry: BinaryHeap<Reverse<(Instant, u64)>>,
    /// Daemon id to the transaction holding it.
    locks: HashMap<i64, u64>,
}

impl ContextStore {
    fn track(&mut self, tx: u64, deadline: Instant) {
        if self.deadlines.get(&tx) != Some(&deadline) {
            self.deadlines.insert(tx, deadline);
            self.expiry.push(Reverse((deadline, tx)));
        }
    }

    /// Drop transactions whose deadline passed, releasing their locks.
    /// Returns the expired transaction ids.
    pub(super) fn purge_expired(&mut self, now: Instant) -> Vec<u64> {
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, tx))) = self.expiry.peek().copied() {
            if deadline > now {
                break;
            }
            self.expiry.pop();
            // Entries superseded by a newer deadline or already finished.
            if self.deadlines.get(&tx) != Some(&deadline) {
                continue;
            }
            let released = self.finish(tx);
            warn!(tx_id = tx, released = ?released, "Configuration transaction expired");
            expired.push(tx);
        }
        expired
    }

    /// Lock every daemon in `daemons` for `tx`, or none of them.
    ///
    /// Returns the daemons held by other transactions on failure.
    pub(super) fn try_lock(
        &mut self,
        tx: u64,
        deadline: Instant,
        daemons: &[i64],
    ) -> Result<(), Vec<i64>> {
        let busy: Vec<i64> = daemons
            .iter()
            .copied()
            .filter(|d| self.locks.get(d).is_some_and(|owner| *owner != tx))
            .collect();
        if !busy.is_empty() {
            return Err(busy);
        }
        for daemon in daemons {
            self.locks.insert(*daemon, tx);
        }
        self.track(tx, deadline);
        debug!(tx_id = tx, daemons = ?daemons, "Daemons locked");
        Ok(())
    }

    /// Release the locks of `tx` and forget its context.
    /// Returns the daemons that were unlocked.
    pub(super) fn finish(&mut self, tx: u64) -> Vec<i64> {
        self.contexts.remove(&tx);
        self.deadlines.remove(&tx);
        let mut released: Vec<i64> = self
            .locks
            .iter()
            .filter(|(_, owner)| **owner == tx)
            .map(|(daemon, _)| *daemon)
            .collect();
        released.sort_unstable();
        for daemon in &released {
            self.locks.remove(daemon);
        }
        released
    }

    pub(super) fn remember(&mut self, ctx: TransactionContext) {
        self.track(ctx.id, ctx.deadline);
        self.contexts.insert(ctx.id, ctx);
    }

    /// A copy of a live context owned by `user_id`.
    pub(super) fn recover(&self, tx: u64, user_id: i64) -> Option<TransactionContext> {
        self.contexts
            .get(&tx)
            .filter(|ctx| ctx.user_id == user_id)
            .cloned()
    }

    pub(super) fn lock_owner(&self, daemon_id: i64) -> Option<u64> {
        self.locks.get(&daemon_id).copied()
    }

    pub(super) fn lock_count(&self) -> usize {
        self.locks.len()
    }
}
