//! Zone inventory fetches across BIND 9 servers.
//!
//! The [`ZoneManager`] runs at most one fetch at a time. A fetch streams
//! the zone list of every active `named` daemon through its agent, with a
//! semaphore bounding how many agents are streamed concurrently, and stores
//! the zones in batches. Progress is readable while the fetch runs.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use stork_core::db::unix_timestamp;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agentcomm::{AgentClient, AgentError};
use crate::storage::{
    AppType, DaemonTarget, DatabaseError, ServerDatabase, ZoneInventoryStatus, ZoneRecord,
};

/// Default number of agents streamed concurrently.
const DEFAULT_CONCURRENCY: usize = 10;

/// Default number of zones stored per transaction.
const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ZoneManagerError {
    #[error("Zone inventory fetch is already in progress")]
    ManagerAlreadyFetching,

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Debug, thiserror::Error)]
enum InventoryError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Snapshot of the fetch progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchProgress {
    pub in_progress: bool,
    pub apps_count: usize,
    pub completed_apps_count: usize,
}

/// Outcome of a finished fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub apps: usize,
    pub erred: usize,
    pub zones: usize,
}

/// Progress shared between the manager and the workers of a fetch.
#[derive(Default)]
struct Progress(Mutex<FetchProgress>);

impl Progress {
    fn lock(&self) -> MutexGuard<'_, FetchProgress> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ends the fetch however the fetch task exits.
struct FetchGuard(Arc<Progress>);

impl Drop for FetchGuard {
    fn drop(&mut self) {
        self.0.lock().in_progress = false;
    }
}

pub struct ZoneManager {
    db: ServerDatabase,
    agents: Arc<AgentClient>,
    progress: Arc<Progress>,
    next_token: AtomicI64,
    shutdown: CancellationToken,
}

impl ZoneManager {
    pub fn new(db: ServerDatabase, agents: Arc<AgentClient>, shutdown: CancellationToken) -> Self {
        Self {
            db,
            agents,
            progress: Arc::new(Progress::default()),
            // Tokens only need to differ between fetches, also across restarts.
            next_token: AtomicI64::new(unix_timestamp().saturating_mul(1000)),
            shutdown,
        }
    }

    /// Counters of the running fetch, or of the last one once it ended.
    pub fn progress(&self) -> FetchProgress {
        *self.progress.lock()
    }

    /// Start a fetch in the background.
    ///
    /// Fails with [`ZoneManagerError::ManagerAlreadyFetching`] while another
    /// fetch runs; the running fetch is not affected. `force` asks agents to
    /// bypass their own zone caches.
    pub async fn fetch_zones(
        &self,
        concurrency: usize,
        batch_size: usize,
        force: bool,
    ) -> Result<JoinHandle<FetchSummary>, ZoneManagerError> {
        {
            let mut progress = self.progress.lock();
            if progress.in_progress {
                return Err(ZoneManagerError::ManagerAlreadyFetching);
            }
            *progress = FetchProgress {
                in_progress: true,
                ..FetchProgress::default()
            };
        }
        let guard = FetchGuard(Arc::clone(&self.progress));

        let targets = self
            .db
            .get_active_daemon_targets(AppType::Bind9, &["named"])
            .await?;
        self.progress.lock().apps_count = targets.len();

        let concurrency = if concurrency == 0 { DEFAULT_CONCURRENCY } else { concurrency };
        let batch_size = if batch_size == 0 { DEFAULT_BATCH_SIZE } else { batch_size };
        let token = self.next_token.fetch_add(1, Ordering::AcqRel);
        info!(apps = targets.len(), concurrency, batch_size, force, "Starting zone inventory fetch");

        let fetch = Fetch {
            db: self.db.clone(),
            agents: Arc::clone(&self.agents),
            progress: Arc::clone(&self.progress),
            cancel: self.shutdown.child_token(),
            batch_size,
            force,
            token,
        };
        Ok(tokio::spawn(async move {
            let summary = fetch.run(targets, concurrency).await;
            drop(guard);
            info!(apps = summary.apps, erred = summary.erred, zones = summary.zones, "Zone inventory fetch finished");
            summary
        }))
    }
}

/// State shared by the workers of one fetch.
#[derive(Clone)]
struct Fetch {
    db: ServerDatabase,
    agents: Arc<AgentClient>,
    progress: Arc<Progress>,
    cancel: CancellationToken,
    batch_size: usize,
    force: bool,
    token: i64,
}

impl Fetch {
    async fn run(self, targets: Vec<DaemonTarget>, concurrency: usize) -> FetchSummary {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut workers = JoinSet::new();
        let mut summary = FetchSummary {
            apps: targets.len(),
            ..FetchSummary::default()
        };

        for target in targets {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let fetch = self.clone();
            workers.spawn(async move {
                let result = fetch.inventory(&target).await;
                drop(permit);
                fetch.progress.lock().completed_apps_count += 1;
                result
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Some(zones)) => summary.zones += zones,
                Ok(None) => summary.erred += 1,
                Err(e) => {
                    warn!(error = %e, "Zone inventory worker failed");
                    summary.erred += 1;
                }
            }
        }
        summary
    }

    /// Fetch one daemon's zones and record the outcome in its inventory
    /// state. Returns the zone count, or `None` when the fetch failed.
    async fn inventory(&self, target: &DaemonTarget) -> Option<usize> {
        let daemon_id = target.daemon_id;
        if let Err(e) = self
            .db
            .set_zone_inventory_state(daemon_id, ZoneInventoryStatus::Busy, None, None)
            .await
        {
            warn!(daemon_id, error = %e, "Cannot mark zone inventory busy");
        }

        let outcome = self.stream_zones(target).await;
        let (status, error, count) = match &outcome {
            Ok(count) => (
                ZoneInventoryStatus::Ok,
                None,
                Some(i64::try_from(*count).unwrap_or(i64::MAX)),
            ),
            Err(e) => {
                warn!(daemon_id, app = %target.app_name, error = %e, "Zone inventory fetch failed");
                (ZoneInventoryStatus::Erred, Some(e.to_string()), None)
            }
        };
        if let Err(e) = self
            .db
            .set_zone_inventory_state(daemon_id, status, error.as_deref(), count)
            .await
        {
            warn!(daemon_id, error = %e, "Cannot record zone inventory state");
            return None;
        }
        outcome.ok()
    }

    async fn stream_zones(&self, target: &DaemonTarget) -> Result<usize, InventoryError> {
        let mut stream = self
            .agents
            .receive_zones(target, self.force, &self.cancel)
            .await?;
        let mut batch: Vec<ZoneRecord> = Vec::with_capacity(self.batch_size);
        let mut count = 0;

        while let Some(record) = stream.next().await {
            batch.push(record?);
            if batch.len() >= self.batch_size {
                self.db
                    .commit_zone_batch(target.daemon_id, &batch, self.token)
                    .await?;
                count += batch.len();
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.db
                .commit_zone_batch(target.daemon_id, &batch, self.token)
                .await?;
            count += batch.len();
        }

        let removed = self
            .db
            .delete_stale_local_zones(target.daemon_id, self.token)
            .await?;
        debug!(daemon_id = target.daemon_id, count, removed, "Zone inventory stored");
        Ok(count)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};

    use super::*;
    use crate::agentcomm::mock::MockTransport;
    use crate::storage::{PageRequest, ZoneFilter};
    use crate::test_helpers::{add_bind9_server, bind9_endpoint as endpoint};

    struct Bind9Fixture {
        db: ServerDatabase,
        mock: Arc<MockTransport>,
        manager: ZoneManager,
        daemons: Vec<i64>,
    }

    fn zone(name: &str, serial: i64) -> Value {
        json!({"name": name, "view": "_default", "class": "IN", "serial": serial, "type": "primary", "loaded": 1_700_000_000})
    }

    async fn bind9_fixture(servers: usize) -> Bind9Fixture {
        let db = ServerDatabase::open_in_memory().await.unwrap();
        let mock = MockTransport::new();
        let agents = Arc::new(AgentClient::new(mock.clone(), Duration::from_secs(2)));
        let mut daemons = Vec::new();
        for i in 0..servers {
            daemons.push(add_bind9_server(&db, i).await);
        }
        let manager = ZoneManager::new(db.clone(), agents, CancellationToken::new());
        Bind9Fixture {
            db,
            mock,
            manager,
            daemons,
        }
    }

    async fn zone_total(db: &ServerDatabase) -> i64 {
        db.get_zones_by_page(&PageRequest::new(0, 100), &ZoneFilter::default())
            .await
            .unwrap()
            .total
    }

    #[tokio::test]
    async fn fetch_stores_zones_in_batches() {
        let fx = bind9_fixture(2).await;
        fx.mock.set_zones(
            endpoint(0),
            vec![zone("example.org", 1), zone("example.com", 2), zone("example.net", 3)],
        );
        fx.mock.set_zones(endpoint(1), vec![zone("example.org", 1)]);

        let summary = fx.manager.fetch_zones(1, 2, false).await.unwrap().await.unwrap();
        assert_eq!(
            summary,
            FetchSummary {
                apps: 2,
                erred: 0,
                zones: 4
            }
        );
        assert_eq!(zone_total(&fx.db).await, 3);
        assert_eq!(fx.db.count_local_zones(fx.daemons[0]).await.unwrap(), 3);

        let states = fx.db.get_zone_inventory_states().await.unwrap();
        assert_eq!(states.len(), 2);
        assert!(states.iter().all(|s| s.status == ZoneInventoryStatus::Ok));
        assert_eq!(states[0].zone_count, Some(3));
        assert_eq!(states[1].zone_count, Some(1));

        let progress = fx.manager.progress();
        assert!(!progress.in_progress);
        assert_eq!(progress.apps_count, 2);
        assert_eq!(progress.completed_apps_count, 2);
    }

    #[tokio::test]
    async fn concurrent_fetch_is_rejected() {
        let fx = bind9_fixture(2).await;
        fx.mock.set_zones(endpoint(0), vec![zone("example.org", 1)]);
        fx.mock.set_zones(endpoint(1), vec![zone("example.com", 1)]);
        let gate = fx.mock.gate_zones();

        let handle = fx.manager.fetch_zones(10, 100, false).await.unwrap();
        let second = fx.manager.fetch_zones(10, 100, true).await;
        assert!(matches!(second, Err(ZoneManagerError::ManagerAlreadyFetching)));

        let during = fx.manager.progress();
        assert!(during.in_progress);
        assert_eq!(during.apps_count, 2);
        assert_eq!(during.completed_apps_count, 0);

        // Both daemons are marked busy while their streams are held.
        for _ in 0..100 {
            let states = fx.db.get_zone_inventory_states().await.unwrap();
            if states.len() == 2 {
                assert!(states.iter().all(|s| s.status == ZoneInventoryStatus::Busy));
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        gate.add_permits(2);
        handle.await.unwrap();
        let after = fx.manager.progress();
        assert!(!after.in_progress);
        assert!(after.completed_apps_count >= during.completed_apps_count);
        assert_eq!(after.completed_apps_count, 2);

        // A new fetch may start once the previous one ended.
        fx.manager.fetch_zones(10, 100, false).await.unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_agent_marks_inventory_erred() {
        let fx = bind9_fixture(2).await;
        fx.mock.set_unreachable(endpoint(0));
        fx.mock.set_zones(endpoint(1), vec![zone("example.org", 7)]);

        let summary = fx.manager.fetch_zones(2, 10, false).await.unwrap().await.unwrap();
        assert_eq!(summary.erred, 1);
        assert_eq!(summary.zones, 1);

        let erred = fx
            .db
            .get_zone_inventory_state(fx.daemons[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(erred.status, ZoneInventoryStatus::Erred);
        assert!(erred.error.unwrap().contains("connection refused"));
        let ok = fx
            .db
            .get_zone_inventory_state(fx.daemons[1])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ok.status, ZoneInventoryStatus::Ok);
        assert_eq!(ok.zone_count, Some(1));
    }

    #[tokio::test]
    async fn refetch_removes_zones_no_longer_served() {
        let fx = bind9_fixture(1).await;
        fx.mock
            .set_zones(endpoint(0), vec![zone("example.org", 1), zone("example.com", 1)]);
        fx.manager.fetch_zones(1, 1, false).await.unwrap().await.unwrap();
        assert_eq!(zone_total(&fx.db).await, 2);

        fx.mock.set_zones(endpoint(0), vec![zone("example.org", 2)]);
        fx.manager.fetch_zones(1, 1, true).await.unwrap().await.unwrap();
        assert_eq!(zone_total(&fx.db).await, 1);
        assert_eq!(fx.db.count_local_zones(fx.daemons[0]).await.unwrap(), 1);
    }
}
