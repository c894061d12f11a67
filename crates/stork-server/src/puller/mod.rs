//! Background pullers refreshing cached agent and daemon state.

mod bind9;
mod framework;
mod kea;
mod state;

#[cfg(test)]
mod pullers_tests;

use std::sync::Arc;
use std::time::Duration;

use stork_core::config::PullerConfig;
use tokio_util::sync::CancellationToken;

use crate::agentcomm::AgentClient;
use crate::storage::ServerDatabase;

pub use bind9::{BIND9_STATS_INTERVAL, Bind9StatsPuller};
pub use framework::{
    PeriodicPuller, PullerError, PullerInfo, PullerRegistry, PullerTask, PullerTiming,
};
pub use kea::{
    KEA_HOSTS_INTERVAL, KEA_STATS_INTERVAL, KEA_STATUS_INTERVAL, KeaHostsPuller, KeaStatsPuller,
    KeaStatusPuller,
};
pub use state::{APPS_STATE_INTERVAL, StatePuller, config_hash, refresh_machine_state};

/// Registry holding every server puller, not yet started.
pub fn server_pullers(
    db: &ServerDatabase,
    agents: &Arc<AgentClient>,
    config: &PullerConfig,
    shutdown: CancellationToken,
) -> PullerRegistry {
    let timing = PullerTiming {
        disabled_recheck: Duration::from_secs(config.disabled_recheck_secs.max(1)),
        ..PullerTiming::default()
    };
    let mut registry =
        PullerRegistry::new(shutdown, Duration::from_secs(config.shutdown_grace_secs));
    let tasks: [Arc<dyn PullerTask>; 5] = [
        Arc::new(StatePuller::new(db.clone(), Arc::clone(agents))),
        Arc::new(KeaStatsPuller::new(db.clone(), Arc::clone(agents))),
        Arc::new(KeaStatusPuller::new(db.clone(), Arc::clone(agents))),
        Arc::new(KeaHostsPuller::new(db.clone(), Arc::clone(agents))),
        Arc::new(Bind9StatsPuller::new(db.clone(), Arc::clone(agents))),
    ];
    for task in tasks {
        registry.register(PeriodicPuller::new(task, db.clone(), timing));
    }
    registry
}
