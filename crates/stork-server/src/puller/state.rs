//! Machine state puller.
//!
//! Refreshes every authorized machine from its agent: machine facts, the
//! apps and daemons running on it, and the configuration of each active
//! Kea DHCP daemon. A changed configuration is decomposed into subnets,
//! shared networks and reservations.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::framework::{PullerError, PullerTask};
use crate::agentcomm::AgentClient;
use crate::dhcp::KeaCommand;
use crate::dhcp::wire::{networks_from_config, reservations_from_config};
use crate::storage::{
    AccessPoint, AccessPointKind, App, AppUpdate, Daemon, HostDataSource, HostUpdate, Machine,
    ServerDatabase,
};

pub const APPS_STATE_INTERVAL: &str = "apps_state_puller_interval";

pub struct StatePuller {
    db: ServerDatabase,
    agents: Arc<AgentClient>,
}

impl StatePuller {
    pub const fn new(db: ServerDatabase, agents: Arc<AgentClient>) -> Self {
        Self { db, agents }
    }
}

#[async_trait]
impl PullerTask for StatePuller {
    fn name(&self) -> &'static str {
        "Apps State Puller"
    }

    fn interval_setting(&self) -> &'static str {
        APPS_STATE_INTERVAL
    }

    async fn tick(&self, cancel: &CancellationToken) -> Result<(), PullerError> {
        let machines = self.db.get_authorized_machines().await?;
        let total = machines.len();
        let mut failed = 0;
        for machine in machines {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = refresh_machine_state(&self.db, &self.agents, machine.id, cancel).await {
                warn!(machine_id = machine.id, address = %machine.address, error = %e, "Machine refresh failed");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(PullerError::Partial { failed, total });
        }
        Ok(())
    }
}

/// Refresh one machine from its agent and return the stored result.
///
/// An unreachable agent is recorded as the machine's error and reported
/// back; the last known state is kept.
pub async fn refresh_machine_state(
    db: &ServerDatabase,
    agents: &AgentClient,
    machine_id: i64,
    cancel: &CancellationToken,
) -> Result<Machine, PullerError> {
    let machine = db.get_machine_with_apps(machine_id).await?;
    let state = match agents
        .get_state(&machine.address, machine.agent_port, cancel)
        .await
    {
        Ok(state) => state,
        Err(e) => {
            db.set_machine_error(machine.id, &e.to_string()).await?;
            return Err(e.into());
        }
    };
    db.update_machine_state(machine.id, &state.machine, None)
        .await?;

    for reported in state.apps {
        let update = reported.into_update(machine.id, &machine.address);
        let app = match find_app(&machine.apps, &update) {
            Some(existing) => db.update_app(existing.id, &update).await?,
            None => {
                info!(machine_id = machine.id, app = %update.name, "New app discovered");
                db.add_app(&update).await?
            }
        };
        for daemon in app.daemons.iter().filter(|d| d.active && d.is_dhcp()) {
            if let Err(e) = refresh_kea_config(db, agents, daemon, cancel).await {
                warn!(daemon_id = daemon.id, daemon = %daemon.name, error = %e, "Cannot refresh Kea configuration");
            }
        }
    }

    Ok(db.get_machine_with_apps(machine.id).await?)
}

/// Stored app matching a reported one: same type and control port.
fn find_app<'a>(apps: &'a [App], update: &AppUpdate) -> Option<&'a App> {
    let control_port = |aps: &[AccessPoint]| {
        aps.iter()
            .find(|ap| ap.kind == AccessPointKind::Control)
            .map(|ap| ap.port)
    };
    let reported_port = control_port(&update.access_points);
    apps.iter().find(|app| {
        app.app_type == update.app_type && control_port(&app.access_points) == reported_port
    })
}

/// Hex SHA-256 of a configuration's JSON text.
pub fn config_hash(config: &Value) -> String {
    hex::encode(Sha256::digest(config.to_string().as_bytes()))
}

/// Fetch a daemon's configuration and, when it changed, rebuild its
/// networks and configured reservations.
async fn refresh_kea_config(
    db: &ServerDatabase,
    agents: &AgentClient,
    daemon: &Daemon,
    cancel: &CancellationToken,
) -> Result<(), PullerError> {
    let target = db.get_daemon_target(daemon.id).await?;
    let response = agents
        .call_kea_daemon(&target, &KeaCommand::new("config-get", &daemon.name, None), cancel)
        .await?;
    let Some(config) = response.arguments else {
        return Ok(());
    };

    let hash = config_hash(&config);
    if !db.update_daemon_kea_config(daemon.id, &config, &hash).await? {
        debug!(daemon_id = daemon.id, "Kea configuration unchanged");
        return Ok(());
    }
    info!(daemon_id = daemon.id, daemon = %daemon.name, hash = %hash, "Kea configuration changed");

    let (networks, subnets) = networks_from_config(daemon, &config);
    let committed = db.commit_networks_into_db(&networks, &subnets).await?;
    let keep_subnets: Vec<i64> = committed
        .subnet_ids
        .iter()
        .chain(&committed.member_subnet_ids)
        .copied()
        .filter(|id| *id > 0)
        .collect();
    db.prune_daemon_networks(daemon.id, &keep_subnets, &committed.shared_network_ids)
        .await?;

    let hosts = resolve_hosts(db, daemon.id, reservations_from_config(&daemon.name, &config)).await?;
    db.commit_daemon_hosts(daemon.id, HostDataSource::Config, &hosts)
        .await?;
    Ok(())
}

/// Replace daemon-local subnet ids of reservations with subnet ids.
/// Reservations in subnets unknown to the database are dropped.
pub(super) async fn resolve_hosts(
    db: &ServerDatabase,
    daemon_id: i64,
    reservations: Vec<(Option<i64>, HostUpdate)>,
) -> Result<Vec<HostUpdate>, PullerError> {
    let mut hosts = Vec::with_capacity(reservations.len());
    for (local_id, mut host) in reservations {
        if let Some(local_id) = local_id {
            match db.get_subnet_id_by_local_id(daemon_id, local_id).await? {
                Some(subnet_id) => host.subnet_id = Some(subnet_id),
                None => {
                    debug!(daemon_id, local_id, "Reservation in unknown subnet skipped");
                    continue;
                }
            }
        }
        hosts.push(host);
    }
    Ok(hosts)
}
