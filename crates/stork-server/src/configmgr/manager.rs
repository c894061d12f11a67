//! Configuration transactions on Kea daemons.
//!
//! A transaction is created for a user, opened with `begin_*` (which
//! locks the daemons of an edited resource), given one or more staged
//! recipes with `apply_*`, sent to the daemons with [`ConfigManager::commit`]
//! and finished with [`ConfigManager::done`]. Contexts that are never
//! finished expire after their TTL and release their locks.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::context::{ContextStore, TransactionContext, TransactionState};
use super::error::{ApplyError, CommitError, ConfigManagerError, SentCommand};
use crate::agentcomm::AgentClient;
use crate::dhcp::recipe::{self, created_subnet_id};
use crate::dhcp::wire::{SUBNET_CMDS_HOOK, has_hook};
use crate::dhcp::{ConfigRecipe, Intent, Resource};
use crate::storage::{DaemonRef, NewEvent, ServerDatabase, SharedNetwork, Subnet};

const SUBNET: &str = "subnet";
const SHARED_NETWORK: &str = "shared network";

pub struct ConfigManager {
    db: ServerDatabase,
    agents: Arc<AgentClient>,
    ttl: Duration,
    next_id: AtomicU64,
    store: Mutex<ContextStore>,
}

impl ConfigManager {
    pub fn new(db: ServerDatabase, agents: Arc<AgentClient>, ttl: Duration) -> Self {
        Self {
            db,
            agents,
            ttl,
            next_id: AtomicU64::new(1),
            store: Mutex::new(ContextStore::default()),
        }
    }

    /// Default lifetime of a transaction.
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// New transaction for `user_id`. It is not remembered until
    /// [`remember_context`](Self::remember_context) is called.
    pub fn create_context(&self, user_id: i64) -> TransactionContext {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        TransactionContext::new(id, user_id, now, now + self.ttl)
    }

    /// Keep a context until `ttl` after its creation. The deadline is
    /// never extended past the one fixed at creation.
    pub async fn remember_context(&self, ctx: &TransactionContext, ttl: Duration) {
        let mut ctx = ctx.clone();
        ctx.deadline = ctx.deadline.min(ctx.created_at + ttl);
        let mut store = self.store.lock().await;
        store.purge_expired(Instant::now());
        store.remember(ctx);
    }

    /// The live context `tx_id` if it belongs to `user_id`.
    pub async fn recover_context(&self, tx_id: u64, user_id: i64) -> Option<TransactionContext> {
        let mut store = self.store.lock().await;
        store.purge_expired(Instant::now());
        store.recover(tx_id, user_id)
    }

    /// Finish a transaction: release its locks and forget it.
    pub async fn done(&self, tx_id: u64) {
        let released = self.store.lock().await.finish(tx_id);
        info!(tx_id, released = ?released, "Configuration transaction finished");
    }

    /// Transaction holding the lock on a daemon, if any.
    pub async fn lock_owner(&self, daemon_id: i64) -> Option<u64> {
        let mut store = self.store.lock().await;
        store.purge_expired(Instant::now());
        store.lock_owner(daemon_id)
    }

    /// Number of daemons currently locked.
    pub async fn lock_count(&self) -> usize {
        let mut store = self.store.lock().await;
        store.purge_expired(Instant::now());
        store.lock_count()
    }

    // =========================================================================
    // Begin
    // =========================================================================

    /// Kea DHCP daemons able to take subnet commands.
    async fn subnet_cmds_daemons(&self) -> Result<Vec<DaemonRef>, ConfigManagerError> {
        let mut refs = Vec::new();
        for daemon in self.db.get_kea_dhcp_daemons().await? {
            if daemon
                .kea_config()
                .is_some_and(|c| has_hook(c, SUBNET_CMDS_HOOK))
            {
                refs.push(self.db.get_daemon_ref(daemon.id).await?);
            }
        }
        Ok(refs)
    }

    async fn lock_daemons(
        &self,
        ctx: &mut TransactionContext,
        daemon_ids: &[i64],
        resource: &'static str,
        id: i64,
    ) -> Result<(), ConfigManagerError> {
        let mut store = self.store.lock().await;
        store.purge_expired(Instant::now());
        if let Err(busy) = store.try_lock(ctx.id, ctx.deadline, daemon_ids) {
            warn!(tx_id = ctx.id, resource, id, busy = ?busy, "Resource locked by another transaction");
            return Err(ConfigManagerError::Locked { resource, id });
        }
        for daemon in daemon_ids {
            if !ctx.locked_daemons.contains(daemon) {
                ctx.locked_daemons.push(*daemon);
            }
        }
        Ok(())
    }

    async fn check_subnet_cmds(
        &self,
        daemon_ids: &[i64],
        resource: &'static str,
        id: i64,
    ) -> Result<(), ConfigManagerError> {
        for daemon_id in daemon_ids {
            let daemon = self.db.get_daemon(*daemon_id).await?;
            if !daemon
                .kea_config()
                .is_some_and(|c| has_hook(c, SUBNET_CMDS_HOOK))
            {
                return Err(ConfigManagerError::NoSubnetCmdsHook {
                    resource,
                    id,
                    daemon_id: daemon.id,
                    daemon_name: daemon.name,
                });
            }
        }
        Ok(())
    }

    /// Lock the daemons of an existing resource and verify they can be
    /// configured. Locks are released again if verification fails.
    async fn begin_edit(
        &self,
        ctx: &mut TransactionContext,
        daemon_ids: &[i64],
        resource: &'static str,
        id: i64,
    ) -> Result<(), ConfigManagerError> {
        self.lock_daemons(ctx, daemon_ids, resource, id).await?;
        let prepared = async {
            self.check_subnet_cmds(daemon_ids, resource, id).await?;
            self.subnet_cmds_daemons().await
        }
        .await;
        match prepared {
            Ok(daemons) => {
                ctx.daemons = daemons;
                ctx.state = TransactionState::Open;
                Ok(())
            }
            Err(e) => {
                self.store.lock().await.finish(ctx.id);
                ctx.locked_daemons.clear();
                Err(e)
            }
        }
    }

    /// Open a transaction creating a new subnet. No daemons are locked.
    pub async fn begin_subnet_add(
        &self,
        ctx: &mut TransactionContext,
    ) -> Result<(), ConfigManagerError> {
        ctx.daemons = self.subnet_cmds_daemons().await?;
        ctx.state = TransactionState::Open;
        Ok(())
    }

    /// Open a transaction creating a new shared network.
    pub async fn begin_shared_network_add(
        &self,
        ctx: &mut TransactionContext,
    ) -> Result<(), ConfigManagerError> {
        self.begin_subnet_add(ctx).await
    }

    /// Open a transaction editing subnet `subnet_id` and lock its daemons.
    pub async fn begin_subnet_update(
        &self,
        ctx: &mut TransactionContext,
        subnet_id: i64,
    ) -> Result<Subnet, ConfigManagerError> {
        let subnet = match self.db.get_subnet(subnet_id).await {
            Ok(subnet) => subnet,
            Err(e) if e.is_not_found() => return Err(ConfigManagerError::SubnetNotFound(subnet_id)),
            Err(e) => return Err(e.into()),
        };
        self.begin_edit(ctx, &subnet.daemon_ids(), SUBNET, subnet_id)
            .await?;
        ctx.pre_image = Some(Resource::Subnet(subnet.clone()));
        Ok(subnet)
    }

    /// Open a transaction editing shared network `id` and lock the daemons
    /// of the network and of its subnets.
    pub async fn begin_shared_network_update(
        &self,
        ctx: &mut TransactionContext,
        id: i64,
    ) -> Result<SharedNetwork, ConfigManagerError> {
        let network = match self.db.get_shared_network(id).await {
            Ok(network) => network,
            Err(e) if e.is_not_found() => {
                return Err(ConfigManagerError::SharedNetworkNotFound(id));
            }
            Err(e) => return Err(e.into()),
        };
        let mut daemon_ids = network.daemon_ids();
        for subnet in &network.subnets {
            daemon_ids.extend(subnet.daemon_ids());
        }
        daemon_ids.sort_unstable();
        daemon_ids.dedup();
        self.begin_edit(ctx, &daemon_ids, SHARED_NETWORK, id).await?;
        ctx.pre_image = Some(Resource::SharedNetwork(network.clone()));
        Ok(network)
    }

    // =========================================================================
    // Apply
    // =========================================================================

    fn check_stageable(ctx: &TransactionContext) -> Result<(), ConfigManagerError> {
        match ctx.state {
            TransactionState::Open | TransactionState::Staged => Ok(()),
            state => Err(ConfigManagerError::InvalidState { id: ctx.id, state }),
        }
    }

    fn stage(ctx: &mut TransactionContext, recipe: ConfigRecipe) {
        info!(
            tx_id = ctx.id,
            intent = ?recipe.intent,
            commands = recipe.command_count(),
            "Configuration change staged"
        );
        ctx.recipes.push(recipe);
        ctx.state = TransactionState::Staged;
    }

    /// Stage the creation of `subnet` on the daemons it lists.
    pub fn apply_subnet_add(
        &self,
        ctx: &mut TransactionContext,
        mut subnet: Subnet,
    ) -> Result<(), ConfigManagerError> {
        Self::check_stageable(ctx)?;
        subnet.id = 0;
        resolve_subnet_daemons(ctx, &mut subnet)?;
        let recipe = recipe::add_subnet(&subnet)?;
        Self::stage(ctx, recipe);
        Ok(())
    }

    /// Stage the replacement of the subnet opened with `begin_subnet_update`.
    pub fn apply_subnet_update(
        &self,
        ctx: &mut TransactionContext,
        mut subnet: Subnet,
    ) -> Result<(), ConfigManagerError> {
        Self::check_stageable(ctx)?;
        let Some(Resource::Subnet(pre)) = ctx.pre_image.clone() else {
            return Err(ApplyError::MissingImage(SUBNET).into());
        };
        resolve_subnet_daemons(ctx, &mut subnet)?;
        let recipe = recipe::update_subnet(&pre, &subnet)?;
        Self::stage(ctx, recipe);
        Ok(())
    }

    /// Stage the removal of `subnet`. Its daemons must be locked by `ctx`.
    pub fn apply_subnet_delete(
        &self,
        ctx: &mut TransactionContext,
        subnet: &Subnet,
    ) -> Result<(), ConfigManagerError> {
        Self::check_stageable(ctx)?;
        check_locked(ctx, &subnet.daemon_ids())?;
        let recipe = recipe::delete_subnet(subnet)?;
        Self::stage(ctx, recipe);
        Ok(())
    }

    /// Stage the creation of `network` together with its subnets.
    pub fn apply_shared_network_add(
        &self,
        ctx: &mut TransactionContext,
        mut network: SharedNetwork,
    ) -> Result<(), ConfigManagerError> {
        Self::check_stageable(ctx)?;
        network.id = 0;
        resolve_network_daemons(ctx, &mut network)?;
        let recipe = recipe::add_shared_network(&network)?;
        Self::stage(ctx, recipe);
        Ok(())
    }

    /// Stage the replacement of the shared network opened with
    /// `begin_shared_network_update`.
    pub fn apply_shared_network_update(
        &self,
        ctx: &mut TransactionContext,
        mut network: SharedNetwork,
    ) -> Result<(), ConfigManagerError> {
        Self::check_stageable(ctx)?;
        let Some(Resource::SharedNetwork(pre)) = ctx.pre_image.clone() else {
            return Err(ApplyError::MissingImage(SHARED_NETWORK).into());
        };
        resolve_network_daemons(ctx, &mut network)?;
        let recipe = recipe::update_shared_network(&pre, &network)?;
        Self::stage(ctx, recipe);
        Ok(())
    }

    /// Stage the removal of `network` and its subnets.
    pub fn apply_shared_network_delete(
        &self,
        ctx: &mut TransactionContext,
        network: &SharedNetwork,
    ) -> Result<(), ConfigManagerError> {
        Self::check_stageable(ctx)?;
        check_locked(ctx, &network.daemon_ids())?;
        let recipe = recipe::delete_shared_network(network)?;
        Self::stage(ctx, recipe);
        Ok(())
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Send every staged command and, once all succeeded, persist the
    /// changes. Stops at the first failing command; nothing is written to
    /// the database in that case.
    pub async fn commit(
        &self,
        ctx: &mut TransactionContext,
        cancel: &CancellationToken,
    ) -> Result<(), ConfigManagerError> {
        if ctx.state != TransactionState::Staged {
            return Err(ConfigManagerError::InvalidState {
                id: ctx.id,
                state: ctx.state,
            });
        }

        let mut sent = Vec::new();
        let mut created: Vec<HashMap<i64, i64>> = Vec::with_capacity(ctx.recipes.len());
        let mut step = 0;
        for recipe in &ctx.recipes {
            let mut local_ids = HashMap::new();
            for daemon in &recipe.daemons {
                let target = self.db.get_daemon_target(daemon.daemon_id).await?;
                for command in &daemon.commands {
                    match self.agents.call_kea_daemon(&target, command, cancel).await {
                        Ok(response) => {
                            if command.command.starts_with("subnet")
                                && command.command.ends_with("-add")
                                && let Some(id) = created_subnet_id(response.arguments.as_ref())
                            {
                                local_ids.insert(daemon.daemon_id, id);
                            }
                            sent.push(SentCommand {
                                daemon_id: daemon.daemon_id,
                                daemon_name: daemon.daemon_name.clone(),
                                command: command.command.clone(),
                            });
                        }
                        Err(source) => {
                            warn!(
                                tx_id = ctx.id,
                                daemon_id = daemon.daemon_id,
                                command = %command.command,
                                step,
                                error = %source,
                                "Configuration commit failed"
                            );
                            return Err(CommitError {
                                daemon_id: daemon.daemon_id,
                                daemon_name: daemon.daemon_name.clone(),
                                app_id: daemon.app_id,
                                command: command.command.clone(),
                                step,
                                sent,
                                source,
                            }
                            .into());
                        }
                    }
                    step += 1;
                }
            }
            created.push(local_ids);
        }

        for (recipe, local_ids) in ctx.recipes.iter_mut().zip(&created) {
            self.write_back(recipe, local_ids).await?;
            self.db
                .add_event(
                    &NewEvent::info(format!("committed {}", describe(recipe))).user(ctx.user_id),
                )
                .await?;
        }
        ctx.state = TransactionState::Committed;
        info!(tx_id = ctx.id, commands = step, "Configuration transaction committed");
        Ok(())
    }

    /// Persist a recipe whose commands all succeeded.
    async fn write_back(
        &self,
        recipe: &mut ConfigRecipe,
        local_ids: &HashMap<i64, i64>,
    ) -> Result<(), ConfigManagerError> {
        match recipe.intent {
            Intent::AddSubnet | Intent::UpdateSubnet => {
                let Some(Resource::Subnet(subnet)) = recipe.post_image.as_mut() else {
                    return Err(ApplyError::MissingImage(SUBNET).into());
                };
                for local in &mut subnet.local_subnets {
                    if let Some(id) = local_ids.get(&local.daemon_id) {
                        local.local_subnet_id = *id;
                    }
                }
                if recipe.intent == Intent::AddSubnet {
                    subnet.id = self.db.add_subnet(subnet).await?;
                    recipe.created_id = Some(subnet.id);
                } else {
                    self.db.update_subnet(subnet).await?;
                }
            }
            Intent::DeleteSubnet => {
                let Some(Resource::Subnet(subnet)) = recipe.pre_image.as_ref() else {
                    return Err(ApplyError::MissingImage(SUBNET).into());
                };
                self.db.delete_subnet(subnet.id).await?;
            }
            Intent::AddSharedNetwork => {
                let Some(Resource::SharedNetwork(network)) = recipe.post_image.as_mut() else {
                    return Err(ApplyError::MissingImage(SHARED_NETWORK).into());
                };
                network.id = self.db.add_shared_network(network).await?;
                recipe.created_id = Some(network.id);
            }
            Intent::UpdateSharedNetwork => {
                let Some(Resource::SharedNetwork(network)) = recipe.post_image.as_ref() else {
                    return Err(ApplyError::MissingImage(SHARED_NETWORK).into());
                };
                self.db.update_shared_network(network).await?;
            }
            Intent::DeleteSharedNetwork => {
                let Some(Resource::SharedNetwork(network)) = recipe.pre_image.as_ref() else {
                    return Err(ApplyError::MissingImage(SHARED_NETWORK).into());
                };
                self.db.delete_shared_network(network.id).await?;
            }
        }
        Ok(())
    }
}

fn describe(recipe: &ConfigRecipe) -> String {
    let image = recipe.post_image.as_ref().or(recipe.pre_image.as_ref());
    let what = match image {
        Some(Resource::Subnet(s)) => format!("subnet {}", s.prefix),
        Some(Resource::SharedNetwork(n)) => format!("shared network {}", n.name),
        None => "configuration change".to_string(),
    };
    let verb = match recipe.intent {
        Intent::AddSubnet | Intent::AddSharedNetwork => "addition of",
        Intent::UpdateSubnet | Intent::UpdateSharedNetwork => "update of",
        Intent::DeleteSubnet | Intent::DeleteSharedNetwork => "deletion of",
    };
    format!("{verb} {what}")
}

fn check_locked(ctx: &TransactionContext, daemon_ids: &[i64]) -> Result<(), ApplyError> {
    match daemon_ids.iter().find(|d| !ctx.locked_daemons.contains(d)) {
        Some(d) => Err(ApplyError::NotLocked(*d)),
        None => Ok(()),
    }
}

/// Fill daemon names and apps of a submitted subnet from the daemons
/// available to the transaction.
fn resolve_subnet_daemons(
    ctx: &TransactionContext,
    subnet: &mut Subnet,
) -> Result<(), ApplyError> {
    for local in &mut subnet.local_subnets {
        let daemon = ctx
            .daemon(local.daemon_id)
            .ok_or(ApplyError::UnknownDaemon(local.daemon_id))?;
        local.daemon_name.clone_from(&daemon.name);
        local.app_id = daemon.app_id;
        local.app_name.clone_from(&daemon.app_name);
    }
    Ok(())
}

fn resolve_network_daemons(
    ctx: &TransactionContext,
    network: &mut SharedNetwork,
) -> Result<(), ApplyError> {
    for local in &mut network.local_shared_networks {
        let daemon = ctx
            .daemon(local.daemon_id)
            .ok_or(ApplyError::UnknownDaemon(local.daemon_id))?;
        local.daemon_name.clone_from(&daemon.name);
        local.app_id = daemon.app_id;
        local.app_name.clone_from(&daemon.app_name);
    }
    for subnet in &mut network.subnets {
        subnet.shared_network_name = Some(network.name.clone());
        resolve_subnet_daemons(ctx, subnet)?;
    }
    Ok(())
}
