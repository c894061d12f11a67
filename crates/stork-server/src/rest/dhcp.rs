//! Subnets, shared networks, hosts, leases and the configuration
//! transactions that edit subnets and shared networks.
//!
//! A transaction is opened by a `POST .../transaction`, which returns its
//! id. The edited resource is sent with `POST .../transaction/{tx}/submit`,
//! which stages it, commits it to the daemons and finishes the transaction.
//! `DELETE .../transaction/{tx}` cancels it.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{ApiError, AppState, CurrentUser, ListParams};
use crate::configmgr::{ConfigManager, ConfigManagerError, TransactionContext};
use crate::leases::{self, LeaseSearchResult};
use crate::storage::{DaemonRef, Host, Page, SharedNetwork, Subnet};

// =========================================================================
// Lists
// =========================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkFilter {
    pub app_id: Option<i64>,
    pub dhcp_version: Option<u8>,
}

pub async fn list_subnets(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
    Query(filter): Query<NetworkFilter>,
) -> Result<Json<Page<Subnet>>, ApiError> {
    Ok(Json(
        state
            .db
            .get_subnets_by_page(&params.page(), filter.app_id, filter.dhcp_version)
            .await?,
    ))
}

pub async fn get_subnet(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Subnet>, ApiError> {
    Ok(Json(state.db.get_subnet(id).await?))
}

pub async fn list_shared_networks(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
    Query(filter): Query<NetworkFilter>,
) -> Result<Json<Page<SharedNetwork>>, ApiError> {
    Ok(Json(
        state
            .db
            .get_shared_networks_by_page(&params.page(), filter.app_id, filter.dhcp_version)
            .await?,
    ))
}

pub async fn get_shared_network(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<SharedNetwork>, ApiError> {
    Ok(Json(state.db.get_shared_network(id).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostFilter {
    pub app_id: Option<i64>,
    pub subnet_id: Option<i64>,
}

pub async fn list_hosts(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
    Query(filter): Query<HostFilter>,
) -> Result<Json<Page<Host>>, ApiError> {
    Ok(Json(
        state
            .db
            .get_hosts_by_page(&params.page(), filter.app_id, filter.subnet_id)
            .await?,
    ))
}

pub async fn get_host(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Host>, ApiError> {
    Ok(Json(state.db.get_host(id).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LeaseParams {
    pub text: String,
}

pub async fn search_leases(
    State(state): State<AppState>,
    Query(params): Query<LeaseParams>,
) -> Result<Json<LeaseSearchResult>, ApiError> {
    let result =
        leases::search_leases(&state.db, &state.agents, &params.text, &state.shutdown).await?;
    Ok(Json(result))
}

// =========================================================================
// Transactions
// =========================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetTransaction {
    pub id: u64,
    pub daemons: Vec<DaemonRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<Subnet>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedNetworkTransaction {
    pub id: u64,
    pub daemons: Vec<DaemonRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_network: Option<SharedNetwork>,
}

#[derive(Debug, Deserialize)]
pub struct SubnetSubmit {
    pub subnet: Subnet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedNetworkSubmit {
    pub shared_network: SharedNetwork,
}

/// Outcome of a committed transaction. `id` is the stored resource.
#[derive(Debug, Serialize)]
pub struct Committed {
    pub id: Option<i64>,
}

/// Remember a context opened by a `begin_*` call. A context that failed
/// to open is finished so that no lock outlives the request.
async fn remember_or_finish<T>(
    cm: &ConfigManager,
    ctx: &TransactionContext,
    begun: Result<T, ConfigManagerError>,
) -> Result<T, ApiError> {
    match begun {
        Ok(value) => {
            cm.remember_context(ctx, cm.ttl()).await;
            info!(tx_id = ctx.id, user_id = ctx.user_id, "Configuration transaction opened");
            Ok(value)
        }
        Err(e) => {
            cm.done(ctx.id).await;
            Err(e.into())
        }
    }
}

/// Stage a change in a remembered transaction and commit it.
///
/// A change that cannot be staged leaves the transaction open so the user
/// can correct it. Once the commit was attempted the transaction is
/// finished whatever its outcome.
async fn submit(
    state: &AppState,
    user: i64,
    tx_id: u64,
    stage: impl FnOnce(&ConfigManager, &mut TransactionContext) -> Result<(), ConfigManagerError>,
) -> Result<TransactionContext, ApiError> {
    let cm: &ConfigManager = &state.config_manager;
    let mut ctx = cm
        .recover_context(tx_id, user)
        .await
        .ok_or(ConfigManagerError::TransactionExpired(tx_id))?;
    stage(cm, &mut ctx)?;
    let result = cm.commit(&mut ctx, &state.shutdown).await;
    cm.done(ctx.id).await;
    result?;
    Ok(ctx)
}

async fn cancel(state: &AppState, user: i64, tx_id: u64) -> Result<StatusCode, ApiError> {
    let cm: &ConfigManager = &state.config_manager;
    let ctx = cm
        .recover_context(tx_id, user)
        .await
        .ok_or(ConfigManagerError::TransactionExpired(tx_id))?;
    cm.done(ctx.id).await;
    Ok(StatusCode::OK)
}

pub async fn cancel_new_transaction(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(tx_id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    cancel(&state, user, tx_id).await
}

pub async fn cancel_transaction(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((_id, tx_id)): Path<(i64, u64)>,
) -> Result<StatusCode, ApiError> {
    cancel(&state, user, tx_id).await
}

pub async fn begin_subnet_add(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<SubnetTransaction>, ApiError> {
    let cm: &ConfigManager = &state.config_manager;
    let mut ctx = cm.create_context(user);
    let begun = cm.begin_subnet_add(&mut ctx).await;
    remember_or_finish(cm, &ctx, begun).await?;
    Ok(Json(SubnetTransaction {
        id: ctx.id,
        daemons: ctx.daemons,
        subnet: None,
    }))
}

pub async fn submit_subnet_add(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(tx_id): Path<u64>,
    Json(body): Json<SubnetSubmit>,
) -> Result<Json<Committed>, ApiError> {
    let ctx = submit(&state, user, tx_id, |cm, ctx| {
        cm.apply_subnet_add(ctx, body.subnet)
    })
    .await?;
    Ok(Json(Committed {
        id: ctx.recipes.first().and_then(|r| r.created_id),
    }))
}

pub async fn begin_subnet_update(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<Json<SubnetTransaction>, ApiError> {
    let cm: &ConfigManager = &state.config_manager;
    let mut ctx = cm.create_context(user);
    let begun = cm.begin_subnet_update(&mut ctx, id).await;
    let subnet = remember_or_finish(cm, &ctx, begun).await?;
    Ok(Json(SubnetTransaction {
        id: ctx.id,
        daemons: ctx.daemons,
        subnet: Some(subnet),
    }))
}

pub async fn submit_subnet_update(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((id, tx_id)): Path<(i64, u64)>,
    Json(body): Json<SubnetSubmit>,
) -> Result<Json<Committed>, ApiError> {
    submit(&state, user, tx_id, |cm, ctx| {
        cm.apply_subnet_update(ctx, Subnet { id, ..body.subnet })
    })
    .await?;
    Ok(Json(Committed { id: Some(id) }))
}

/// Remove a subnet from its daemons in a single request. The daemons are
/// locked like in an update.
pub async fn delete_subnet(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let cm: &ConfigManager = &state.config_manager;
    let mut ctx = cm.create_context(user);
    let result = remove_subnet(cm, &mut ctx, id, &state.shutdown).await;
    cm.done(ctx.id).await;
    result?;
    info!(subnet_id = id, user_id = user, "Subnet deleted");
    Ok(StatusCode::OK)
}

async fn remove_subnet(
    cm: &ConfigManager,
    ctx: &mut TransactionContext,
    id: i64,
    cancel: &CancellationToken,
) -> Result<(), ConfigManagerError> {
    let subnet = cm.begin_subnet_update(ctx, id).await?;
    cm.apply_subnet_delete(ctx, &subnet)?;
    cm.commit(ctx, cancel).await
}

pub async fn begin_shared_network_add(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<SharedNetworkTransaction>, ApiError> {
    let cm: &ConfigManager = &state.config_manager;
    let mut ctx = cm.create_context(user);
    let begun = cm.begin_shared_network_add(&mut ctx).await;
    remember_or_finish(cm, &ctx, begun).await?;
    Ok(Json(SharedNetworkTransaction {
        id: ctx.id,
        daemons: ctx.daemons,
        shared_network: None,
    }))
}

pub async fn submit_shared_network_add(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(tx_id): Path<u64>,
    Json(body): Json<SharedNetworkSubmit>,
) -> Result<Json<Committed>, ApiError> {
    let ctx = submit(&state, user, tx_id, |cm, ctx| {
        cm.apply_shared_network_add(ctx, body.shared_network)
    })
    .await?;
    Ok(Json(Committed {
        id: ctx.recipes.first().and_then(|r| r.created_id),
    }))
}

pub async fn begin_shared_network_update(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<Json<SharedNetworkTransaction>, ApiError> {
    let cm: &ConfigManager = &state.config_manager;
    let mut ctx = cm.create_context(user);
    let begun = cm.begin_shared_network_update(&mut ctx, id).await;
    let network = remember_or_finish(cm, &ctx, begun).await?;
    Ok(Json(SharedNetworkTransaction {
        id: ctx.id,
        daemons: ctx.daemons,
        shared_network: Some(network),
    }))
}

pub async fn submit_shared_network_update(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((id, tx_id)): Path<(i64, u64)>,
    Json(body): Json<SharedNetworkSubmit>,
) -> Result<Json<Committed>, ApiError> {
    submit(&state, user, tx_id, |cm, ctx| {
        cm.apply_shared_network_update(
            ctx,
            SharedNetwork {
                id,
                ..body.shared_network
            },
        )
    })
    .await?;
    Ok(Json(Committed { id: Some(id) }))
}

/// Remove a shared network and its subnets from their daemons.
pub async fn delete_shared_network(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let cm: &ConfigManager = &state.config_manager;
    let mut ctx = cm.create_context(user);
    let result = remove_shared_network(cm, &mut ctx, id, &state.shutdown).await;
    cm.done(ctx.id).await;
    result?;
    info!(shared_network_id = id, user_id = user, "Shared network deleted");
    Ok(StatusCode::OK)
}

async fn remove_shared_network(
    cm: &ConfigManager,
    ctx: &mut TransactionContext,
    id: i64,
    cancel: &CancellationToken,
) -> Result<(), ConfigManagerError> {
    let network = cm.begin_shared_network_update(ctx, id).await?;
    cm.apply_shared_network_delete(ctx, &network)?;
    cm.commit(ctx, cancel).await
}
