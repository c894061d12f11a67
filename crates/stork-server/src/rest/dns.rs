//! DNS zones and the zone inventory fetch.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::{ApiError, AppState, ListParams};
use crate::dns::ZoneManagerError;
use crate::storage::{AppType, Page, Zone, ZoneFilter, ZoneInventoryState};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ZoneParams {
    pub app_id: Option<i64>,
    pub app_type: Option<AppType>,
    pub class: Option<String>,
    pub serial: Option<i64>,
    pub zone_type: Option<String>,
}

pub async fn list_zones(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
    Query(zone): Query<ZoneParams>,
) -> Result<Json<Page<Zone>>, ApiError> {
    let filter = ZoneFilter {
        app_id: zone.app_id,
        app_type: zone.app_type,
        class: zone.class,
        serial: zone.serial,
        zone_type: zone.zone_type,
    };
    Ok(Json(
        state.db.get_zones_by_page(&params.page(), &filter).await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FetchParams {
    /// Ask the agents to refresh their zone caches first.
    pub force: bool,
}

/// Start a zone inventory fetch. A fetch that is already running counts
/// as accepted too.
pub async fn fetch_zones(
    State(state): State<AppState>,
    Query(params): Query<FetchParams>,
) -> Response {
    let config = &state.zone_fetch;
    match state
        .zone_manager
        .fetch_zones(config.concurrency, config.batch_size, params.force)
        .await
    {
        Ok(_) => StatusCode::ACCEPTED.into_response(),
        Err(ZoneManagerError::ManagerAlreadyFetching) => {
            info!("Zone inventory fetch already in progress");
            StatusCode::ACCEPTED.into_response()
        }
        Err(e) => {
            error!(error = %e, "Cannot start zone inventory fetch");
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to start fetching the zones",
            )
            .into_response()
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ZoneInventoryStates {
    pub items: Vec<ZoneInventoryState>,
    pub total: usize,
}

/// 202 with the progress while a fetch runs, otherwise 200 with the
/// stored inventory states or 204 when there are none.
pub async fn zones_fetch_status(State(state): State<AppState>) -> Result<Response, ApiError> {
    let progress = state.zone_manager.progress();
    if progress.in_progress {
        return Ok((StatusCode::ACCEPTED, Json(progress)).into_response());
    }
    let items = state.db.get_zone_inventory_states().await?;
    if items.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    let total = items.len();
    Ok(Json(ZoneInventoryStates { items, total }).into_response())
}
