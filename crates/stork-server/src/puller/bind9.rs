//! BIND 9 statistics puller.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::framework::{PullerError, PullerTask};
use crate::agentcomm::AgentClient;
use crate::storage::{AppType, ServerDatabase};

pub const BIND9_STATS_INTERVAL: &str = "bind9_stats_puller_interval";

pub struct Bind9StatsPuller {
    db: ServerDatabase,
    agents: Arc<AgentClient>,
}

impl Bind9StatsPuller {
    pub const fn new(db: ServerDatabase, agents: Arc<AgentClient>) -> Self {
        Self { db, agents }
    }
}

#[async_trait]
impl PullerTask for Bind9StatsPuller {
    fn name(&self) -> &'static str {
        "BIND 9 Statistics Puller"
    }

    fn interval_setting(&self) -> &'static str {
        BIND9_STATS_INTERVAL
    }

    async fn tick(&self, cancel: &CancellationToken) -> Result<(), PullerError> {
        let targets = self
            .db
            .get_active_daemon_targets(AppType::Bind9, &["named"])
            .await?;
        let total = targets.len();
        let mut failed = 0;
        for target in targets {
            if cancel.is_cancelled() {
                break;
            }
            match self.agents.bind9_stats(&target, cancel).await {
                Ok(stats) => {
                    self.db
                        .update_daemon_bind9_stats(target.daemon_id, &stats)
                        .await?;
                }
                Err(e) => {
                    warn!(daemon_id = target.daemon_id, error = %e, "Cannot fetch BIND 9 statistics");
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            return Err(PullerError::Partial { failed, total });
        }
        Ok(())
    }
}
