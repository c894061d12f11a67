//! Periodic pullers.
//!
//! Each puller runs its own loop: read the interval setting, sleep, tick.
//! A tick runs as a separate task so a slow tick never delays the
//! schedule; while it is still running later ticks are skipped. An
//! interval of zero disables the puller until the setting changes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use stork_core::db::unix_timestamp;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use crate::agentcomm::AgentError;
use crate::storage::{DatabaseError, ServerDatabase};

/// Clears the tick flag however the tick task exits.
struct TickGuard(Arc<AtomicBool>);

impl Drop for TickGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Error)]
pub enum PullerError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("{failed} of {total} targets failed")]
    Partial { failed: usize, total: usize },
}

/// Work done by a puller on every tick.
#[async_trait]
pub trait PullerTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Setting holding the interval in seconds.
    fn interval_setting(&self) -> &'static str;

    async fn tick(&self, cancel: &CancellationToken) -> Result<(), PullerError>;
}

/// Puller metadata exposed to operators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullerInfo {
    /// The interval setting name, which identifies the puller.
    pub id: String,
    pub name: String,
    pub interval: i64,
    pub last_invoked_at: Option<i64>,
    pub last_finished_at: Option<i64>,
}

impl PullerInfo {
    pub const fn enabled(&self) -> bool {
        self.interval > 0
    }
}

/// Timing knobs of the puller loops.
#[derive(Debug, Clone, Copy)]
pub struct PullerTiming {
    /// Unit of the interval settings.
    pub unit: Duration,
    /// How long a disabled puller waits before re-reading its setting.
    pub disabled_recheck: Duration,
}

impl Default for PullerTiming {
    fn default() -> Self {
        Self {
            unit: Duration::from_secs(1),
            disabled_recheck: Duration::from_secs(10),
        }
    }
}

/// One puller and its loop state.
pub struct PeriodicPuller {
    task: Arc<dyn PullerTask>,
    db: ServerDatabase,
    timing: PullerTiming,
    info: Arc<RwLock<PullerInfo>>,
    ticking: Arc<AtomicBool>,
}

impl PeriodicPuller {
    pub fn new(task: Arc<dyn PullerTask>, db: ServerDatabase, timing: PullerTiming) -> Self {
        let info = PullerInfo {
            id: task.interval_setting().to_string(),
            name: task.name().to_string(),
            interval: 0,
            last_invoked_at: None,
            last_finished_at: None,
        };
        Self {
            task,
            db,
            timing,
            info: Arc::new(RwLock::new(info)),
            ticking: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn info(&self) -> PullerInfo {
        self.info.read().await.clone()
    }

    /// Current interval setting. Read failures keep the previous value.
    async fn refresh_interval(&self) -> i64 {
        let setting = self.task.interval_setting();
        match self.db.get_setting_int(setting).await {
            Ok(interval) => {
                self.info.write().await.interval = interval;
                interval
            }
            Err(e) => {
                let interval = self.info.read().await.interval;
                warn!(puller = self.task.name(), setting, error = %e, interval, "Cannot read puller interval");
                interval
            }
        }
    }

    /// Start a tick unless the previous one is still running.
    async fn start_tick(&self, ticks: &mut JoinSet<()>, cancel: &CancellationToken) {
        if self.ticking.swap(true, Ordering::AcqRel) {
            warn!(puller = self.task.name(), "Previous tick still running, skipping");
            return;
        }
        self.info.write().await.last_invoked_at = Some(unix_timestamp());

        let task = Arc::clone(&self.task);
        let info = Arc::clone(&self.info);
        let guard = TickGuard(Arc::clone(&self.ticking));
        let cancel = cancel.clone();
        ticks.spawn(async move {
            let _guard = guard;
            let name = task.name();
            // The inner task isolates panics; aborting the outer one aborts it too.
            let tick = AbortOnDropHandle::new(tokio::spawn(async move { task.tick(&cancel).await }));
            match tick.await {
                Ok(Ok(())) => debug!(puller = name, "Tick finished"),
                Ok(Err(e)) => warn!(puller = name, error = %e, "Tick failed"),
                Err(e) if e.is_panic() => error!(puller = name, "Tick panicked"),
                Err(e) => warn!(puller = name, error = %e, "Tick aborted"),
            }
            info.write().await.last_finished_at = Some(unix_timestamp());
        });
    }

    /// Run until `shutdown` fires, then give in-flight ticks `grace` to end.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken, grace: Duration) {
        let mut ticks = JoinSet::new();
        info!(puller = self.task.name(), "Puller started");

        loop {
            let interval = self.refresh_interval().await;
            let wait = u32::try_from(interval)
                .ok()
                .filter(|i| *i > 0)
                .map_or(self.timing.disabled_recheck, |i| self.timing.unit * i);

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
            }
            // Reap finished ticks so the set does not grow.
            while ticks.try_join_next().is_some() {}

            if interval > 0 {
                self.start_tick(&mut ticks, &shutdown).await;
            }
        }

        if !ticks.is_empty() {
            info!(puller = self.task.name(), "Waiting for in-flight tick");
            if tokio::time::timeout(grace, async { while ticks.join_next().await.is_some() {} })
                .await
                .is_err()
            {
                warn!(puller = self.task.name(), "In-flight tick did not stop in time, aborting");
                ticks.abort_all();
            }
        }
        info!(puller = self.task.name(), "Puller stopped");
    }
}

/// All pullers of the server.
pub struct PullerRegistry {
    pullers: Vec<Arc<PeriodicPuller>>,
    handles: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
    grace: Duration,
}

impl PullerRegistry {
    pub fn new(shutdown: CancellationToken, grace: Duration) -> Self {
        Self {
            pullers: Vec::new(),
            handles: Mutex::new(JoinSet::new()),
            shutdown,
            grace,
        }
    }

    pub fn register(&mut self, puller: PeriodicPuller) {
        self.pullers.push(Arc::new(puller));
    }

    /// Spawn the loops of all registered pullers.
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        for puller in &self.pullers {
            handles.spawn(Arc::clone(puller).run(self.shutdown.clone(), self.grace));
        }
    }

    pub async fn infos(&self) -> Vec<PullerInfo> {
        let mut out = Vec::with_capacity(self.pullers.len());
        for puller in &self.pullers {
            out.push(puller.info().await);
        }
        out
    }

    pub async fn info(&self, id: &str) -> Option<PullerInfo> {
        for puller in &self.pullers {
            let info = puller.info().await;
            if info.id == id {
                return Some(info);
            }
        }
        None
    }

    /// Signal shutdown and wait for every loop to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut handles = self.handles.lock().await;
        while handles.join_next().await.is_some() {}
    }
}
