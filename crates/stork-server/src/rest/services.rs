//! Machines, apps and daemons.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stork_pki::{format_fingerprint, sign_agent_csr};
use tracing::{info, warn};

use super::{ApiError, AppState, CurrentUser, ListParams, page_limit};
use crate::puller::{PullerError, refresh_machine_state};
use crate::review::render_report;
use crate::storage::{App, AppType, ConfigReview, Machine, NewEvent, Page};

// =========================================================================
// Machines
// =========================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MachineFilter {
    pub authorized: Option<bool>,
}

pub async fn list_machines(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
    Query(filter): Query<MachineFilter>,
) -> Result<Json<Page<Machine>>, ApiError> {
    let page = state
        .db
        .get_machines_by_page(&params.page(), filter.authorized)
        .await?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMachine {
    pub address: String,
    pub agent_port: i64,
    #[serde(rename = "agentCSR")]
    pub agent_csr: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineRegistration {
    pub id: i64,
    #[serde(rename = "serverCACert")]
    pub server_ca_cert: String,
    pub agent_cert: String,
}

/// Register an agent. The machine starts unauthorized; its certificate is
/// issued right away so the agent can reach the server once authorized.
pub async fn register_machine(
    State(state): State<AppState>,
    Json(body): Json<NewMachine>,
) -> Result<Json<MachineRegistration>, ApiError> {
    let address = body.address.trim();
    if address.is_empty() {
        return Err(ApiError::bad_request("Machine address is required"));
    }
    if !(1..=65535).contains(&body.agent_port) {
        return Err(ApiError::bad_request(format!(
            "Invalid agent port {}",
            body.agent_port
        )));
    }

    let issued = sign_agent_csr(&state.ca, &body.agent_csr)?;
    let machine = state.db.add_machine(address, body.agent_port, false).await?;
    let fingerprint = format_fingerprint(&issued.fingerprint);
    state
        .db
        .set_machine_cert_fingerprint(machine.id, &fingerprint)
        .await?;
    state
        .db
        .add_event(&NewEvent::info(format!("Machine {address} registered")).machine(machine.id))
        .await?;
    info!(machine_id = machine.id, address, agent_port = body.agent_port, "Machine registered");

    Ok(Json(MachineRegistration {
        id: machine.id,
        server_ca_cert: state.ca.cert_pem.clone(),
        agent_cert: issued.cert_pem,
    }))
}

pub async fn get_machine(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Machine>, ApiError> {
    Ok(Json(state.db.get_machine_with_apps(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct MachineUpdate {
    pub authorized: bool,
}

pub async fn update_machine(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
    Json(body): Json<MachineUpdate>,
) -> Result<Json<Machine>, ApiError> {
    let machine = state.db.set_machine_authorized(id, body.authorized).await?;
    let verb = if body.authorized { "authorized" } else { "unauthorized" };
    state
        .db
        .add_event(
            &NewEvent::info(format!("Machine {} {verb}", machine.address))
                .machine(id)
                .user(user),
        )
        .await?;
    Ok(Json(machine))
}

pub async fn delete_machine(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if !state.db.delete_machine(id).await? {
        return Err(ApiError::not_found(format!("Machine {id} not found")));
    }
    info!(machine_id = id, user_id = user, "Machine deleted");
    Ok(StatusCode::OK)
}

/// Refresh a machine from its agent. An unreachable agent is not a failure
/// of the request: the machine is returned with the recorded error.
pub async fn refresh_machine(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Machine>, ApiError> {
    match refresh_machine_state(&state.db, &state.agents, id, &state.shutdown).await {
        Ok(machine) => Ok(Json(machine)),
        Err(PullerError::Agent(e)) => {
            warn!(machine_id = id, error = %e, "Cannot refresh machine state");
            Ok(Json(state.db.get_machine_with_apps(id).await?))
        }
        Err(PullerError::Database(e)) => Err(e.into()),
        Err(e) => Err(ApiError::internal(&e)),
    }
}

// =========================================================================
// Apps
// =========================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppFilter {
    pub app_type: Option<AppType>,
}

pub async fn list_apps(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
    Query(filter): Query<AppFilter>,
) -> Result<Json<Page<App>>, ApiError> {
    Ok(Json(
        state
            .db
            .get_apps_by_page(&params.page(), filter.app_type)
            .await?,
    ))
}

pub async fn get_app(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<App>, ApiError> {
    Ok(Json(state.db.get_app(id).await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub daemon_id: i64,
    pub daemon_name: String,
    pub active: bool,
    pub ha_state: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ServicesStatus {
    pub items: Vec<ServiceStatus>,
}

/// High availability state of each daemon of an app that reports one.
pub async fn app_services_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ServicesStatus>, ApiError> {
    let app = state.db.get_app(id).await?;
    let items = app
        .daemons
        .into_iter()
        .filter(|d| d.kea_ha_state.is_some())
        .map(|d| ServiceStatus {
            daemon_id: d.id,
            daemon_name: d.name,
            active: d.active,
            ha_state: d.kea_ha_state,
        })
        .collect();
    Ok(Json(ServicesStatus { items }))
}

// =========================================================================
// Daemon configuration and review
// =========================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    pub daemon_id: i64,
    pub config: Value,
    pub config_hash: Option<String>,
}

/// The stored configuration, or 204 when none was fetched yet.
pub async fn daemon_config(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let daemon = state.db.get_daemon(id).await?;
    let Some(config) = daemon.kea_config().cloned() else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    Ok(Json(DaemonConfig {
        daemon_id: daemon.id,
        config,
        config_hash: daemon.kea_config_hash,
    })
    .into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReportParams {
    pub start: i64,
    pub limit: Option<i64>,
    pub issues_only: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedReport {
    pub id: i64,
    pub checker_name: String,
    pub content: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigReports {
    pub review: ConfigReview,
    pub items: Vec<RenderedReport>,
    pub total: i64,
}

/// Reports of the daemon's latest review with daemon references rendered.
/// 204 when the daemon was never reviewed.
pub async fn daemon_config_reports(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<ReportParams>,
) -> Result<Response, ApiError> {
    state.db.get_daemon(id).await?;
    let Some(review) = state.db.get_config_review(id).await? else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    let page = state
        .db
        .get_config_reports_by_page(id, params.start, page_limit(params.limit), params.issues_only)
        .await?;
    let items = page
        .items
        .into_iter()
        .map(|report| RenderedReport {
            id: report.id,
            checker_name: report.checker_name,
            content: report
                .content
                .as_deref()
                .map(|c| render_report(c, &report.ref_daemons)),
            created_at: report.created_at,
        })
        .collect();
    Ok(Json(ConfigReports {
        review,
        items,
        total: page.total,
    })
    .into_response())
}

/// Start a new review in the background.
pub async fn review_daemon_config(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let daemon = state.db.get_daemon(id).await?;
    if daemon.kea_config().is_none() {
        return Err(ApiError::bad_request(format!(
            "Daemon {id} has no configuration to review"
        )));
    }
    state.reviewer.spawn_review(id);
    Ok(StatusCode::ACCEPTED)
}
