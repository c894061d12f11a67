//! Kea pullers: subnet statistics, daemon status and host reservations.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use stork_core::db::unix_timestamp;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::framework::{PullerError, PullerTask};
use super::state::resolve_hosts;
use crate::agentcomm::AgentClient;
use crate::dhcp::KeaCommand;
use crate::dhcp::command::{DaemonStatus, parse_reservation, subnet_stats};
use crate::dhcp::wire::{HOST_CMDS_HOOK, has_hook};
use crate::storage::{AppType, DaemonTarget, HostDataSource, ServerDatabase};

pub const KEA_STATS_INTERVAL: &str = "kea_stats_puller_interval";
pub const KEA_STATUS_INTERVAL: &str = "kea_status_puller_interval";
pub const KEA_HOSTS_INTERVAL: &str = "kea_hosts_puller_interval";

const DHCP_DAEMONS: &[&str] = &["dhcp4", "dhcp6"];

/// Reservations requested per `reservation-get-page` call.
const HOSTS_PAGE_LIMIT: i64 = 1000;

/// Run `step` for each active Kea DHCP daemon, counting failures.
async fn for_each_dhcp_daemon<F, Fut>(
    db: &ServerDatabase,
    cancel: &CancellationToken,
    puller: &'static str,
    mut step: F,
) -> Result<(), PullerError>
where
    F: FnMut(DaemonTarget) -> Fut,
    Fut: Future<Output = Result<(), PullerError>>,
{
    let targets = db.get_active_daemon_targets(AppType::Kea, DHCP_DAEMONS).await?;
    let total = targets.len();
    let mut failed = 0;
    for target in targets {
        if cancel.is_cancelled() {
            break;
        }
        let daemon_id = target.daemon_id;
        if let Err(e) = step(target).await {
            warn!(puller, daemon_id, error = %e, "Daemon skipped");
            failed += 1;
        }
    }
    if failed > 0 {
        return Err(PullerError::Partial { failed, total });
    }
    Ok(())
}

pub struct KeaStatsPuller {
    db: ServerDatabase,
    agents: Arc<AgentClient>,
}

impl KeaStatsPuller {
    pub const fn new(db: ServerDatabase, agents: Arc<AgentClient>) -> Self {
        Self { db, agents }
    }

    async fn pull(&self, target: DaemonTarget, cancel: &CancellationToken) -> Result<(), PullerError> {
        let command = KeaCommand::new("statistic-get-all", &target.daemon_name, Some(json!({})));
        let response = self.agents.call_kea_daemon(&target, &command, cancel).await?;
        let Some(arguments) = response.arguments else {
            return Ok(());
        };
        for (local_id, stats) in subnet_stats(&arguments) {
            let stored = self
                .db
                .update_local_subnet_stats(target.daemon_id, local_id, &Value::Object(stats))
                .await?;
            if !stored {
                debug!(daemon_id = target.daemon_id, local_id, "Statistics for unknown subnet");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PullerTask for KeaStatsPuller {
    fn name(&self) -> &'static str {
        "Kea Statistics Puller"
    }

    fn interval_setting(&self) -> &'static str {
        KEA_STATS_INTERVAL
    }

    async fn tick(&self, cancel: &CancellationToken) -> Result<(), PullerError> {
        for_each_dhcp_daemon(&self.db, cancel, self.name(), |t| self.pull(t, cancel)).await
    }
}

pub struct KeaStatusPuller {
    db: ServerDatabase,
    agents: Arc<AgentClient>,
}

impl KeaStatusPuller {
    pub const fn new(db: ServerDatabase, agents: Arc<AgentClient>) -> Self {
        Self { db, agents }
    }

    async fn pull(&self, target: DaemonTarget, cancel: &CancellationToken) -> Result<(), PullerError> {
        let command = KeaCommand::new("status-get", &target.daemon_name, None);
        let response = self.agents.call_kea_daemon(&target, &command, cancel).await?;
        let status = response
            .arguments
            .as_ref()
            .map(DaemonStatus::from_arguments)
            .unwrap_or_default();
        let reloaded_at = status.reload.map(|secs| unix_timestamp() - secs);
        self.db
            .update_daemon_status(
                target.daemon_id,
                status.pid,
                status.uptime,
                reloaded_at,
                status.ha_state.as_deref(),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PullerTask for KeaStatusPuller {
    fn name(&self) -> &'static str {
        "Kea Status Puller"
    }

    fn interval_setting(&self) -> &'static str {
        KEA_STATUS_INTERVAL
    }

    async fn tick(&self, cancel: &CancellationToken) -> Result<(), PullerError> {
        for_each_dhcp_daemon(&self.db, cancel, self.name(), |t| self.pull(t, cancel)).await
    }
}

/// Pulls reservations kept in host backends through `libdhcp_host_cmds`.
pub struct KeaHostsPuller {
    db: ServerDatabase,
    agents: Arc<AgentClient>,
}

impl KeaHostsPuller {
    pub const fn new(db: ServerDatabase, agents: Arc<AgentClient>) -> Self {
        Self { db, agents }
    }

    async fn pull(&self, target: DaemonTarget, cancel: &CancellationToken) -> Result<(), PullerError> {
        let daemon = self.db.get_daemon(target.daemon_id).await?;
        if !daemon.kea_config().is_some_and(|c| has_hook(c, HOST_CMDS_HOOK)) {
            return Ok(());
        }

        let mut reservations = Vec::new();
        let mut cursor: Option<(i64, i64)> = None;
        loop {
            let mut arguments = json!({"limit": HOSTS_PAGE_LIMIT});
            if let Some((from, source_index)) = cursor {
                arguments["from"] = json!(from);
                arguments["source-index"] = json!(source_index);
            }
            let command = KeaCommand::new("reservation-get-page", &target.daemon_name, Some(arguments));
            let response = self.agents.call_kea_daemon(&target, &command, cancel).await?;
            let Some(page) = response.arguments else {
                break;
            };

            let hosts = page.get("hosts").and_then(Value::as_array);
            if hosts.is_none_or(Vec::is_empty) {
                break;
            }
            reservations.extend(hosts.into_iter().flatten().filter_map(parse_reservation));

            let next = page.get("next").and_then(|n| {
                Some((
                    n.get("from")?.as_i64()?,
                    n.get("source-index")?.as_i64()?,
                ))
            });
            if next.is_none() || next == cursor {
                break;
            }
            cursor = next;
        }

        let hosts = resolve_hosts(&self.db, target.daemon_id, reservations).await?;
        let count = self
            .db
            .commit_daemon_hosts(target.daemon_id, HostDataSource::Api, &hosts)
            .await?;
        debug!(daemon_id = target.daemon_id, count, "Host reservations pulled");
        Ok(())
    }
}

#[async_trait]
impl PullerTask for KeaHostsPuller {
    fn name(&self) -> &'static str {
        "Kea Hosts Puller"
    }

    fn interval_setting(&self) -> &'static str {
        KEA_HOSTS_INTERVAL
    }

    async fn tick(&self, cancel: &CancellationToken) -> Result<(), PullerError> {
        for_each_dhcp_daemon(&self.db, cancel, self.name(), |t| self.pull(t, cancel)).await
    }
}
