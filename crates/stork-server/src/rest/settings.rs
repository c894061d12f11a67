//! Global settings, puller metadata, events and accounts.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::{ApiError, AppState, CurrentUser, ListParams};
use crate::puller::PullerInfo;
use crate::storage::{
    Event, EventLevel, NewEvent, Page, Setting, SystemGroup, SystemUser, setting_default,
};

#[derive(Debug, Serialize)]
pub struct Settings {
    pub items: Vec<Setting>,
}

pub async fn get_settings(State(state): State<AppState>) -> Result<Json<Settings>, ApiError> {
    Ok(Json(Settings {
        items: state.db.get_settings().await?,
    }))
}

/// Validate one submitted setting and return its stored text form.
fn setting_value(name: &str, value: &Value) -> Result<String, ApiError> {
    let Some((value_type, _)) = setting_default(name) else {
        return Err(ApiError::bad_request(format!("Unknown setting {name}")));
    };
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => {
            return Err(ApiError::bad_request(format!(
                "Setting {name} must be a string or a number"
            )));
        }
    };
    if value_type == "int" && !text.parse::<i64>().is_ok_and(|v| v >= 0) {
        return Err(ApiError::bad_request(format!(
            "Setting {name} requires a non-negative integer"
        )));
    }
    Ok(text)
}

/// Update several settings at once. Nothing is stored unless every value
/// is valid.
pub async fn update_settings(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(body): Json<BTreeMap<String, Value>>,
) -> Result<Json<Settings>, ApiError> {
    let mut values = Vec::with_capacity(body.len());
    for (name, value) in &body {
        values.push((name.as_str(), setting_value(name, value)?));
    }
    let pairs: Vec<(&str, &str)> = values.iter().map(|(n, v)| (*n, v.as_str())).collect();
    state.db.set_settings(&pairs).await?;
    if !values.is_empty() {
        let names: Vec<&str> = values.iter().map(|(n, _)| *n).collect();
        info!(user_id = user, settings = ?names, "Settings updated");
        state
            .db
            .add_event(&NewEvent::info(format!("Settings updated: {}", names.join(", "))).user(user))
            .await?;
    }
    get_settings(State(state)).await
}

#[derive(Debug, Serialize)]
pub struct Pullers {
    pub items: Vec<PullerInfo>,
    pub total: usize,
}

pub async fn list_pullers(State(state): State<AppState>) -> Json<Pullers> {
    let items = state.pullers.infos().await;
    let total = items.len();
    Json(Pullers { items, total })
}

pub async fn get_puller(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PullerInfo>, ApiError> {
    state
        .pullers
        .info(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Puller {id} not found")))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventFilter {
    pub level: Option<EventLevel>,
    pub machine_id: Option<i64>,
    pub daemon_id: Option<i64>,
}

pub async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
    Query(filter): Query<EventFilter>,
) -> Result<Json<Page<Event>>, ApiError> {
    Ok(Json(
        state
            .db
            .get_events_by_page(
                &params.page(),
                filter.level,
                filter.machine_id,
                filter.daemon_id,
            )
            .await?,
    ))
}

pub async fn list_users(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Page<SystemUser>>, ApiError> {
    Ok(Json(state.db.get_users_by_page(&params.page()).await?))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<SystemUser>, ApiError> {
    Ok(Json(state.db.get_user(id).await?))
}

pub async fn list_groups(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Page<SystemGroup>>, ApiError> {
    Ok(Json(state.db.get_groups_by_page(&params.page()).await?))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use super::*;

    #[test]
    fn setting_values_are_checked_against_their_type() {
        assert_eq!(
            setting_value("kea_stats_puller_interval", &json!(0)).unwrap(),
            "0"
        );
        assert_eq!(
            setting_value("kea_stats_puller_interval", &json!("120")).unwrap(),
            "120"
        );
        assert_eq!(
            setting_value("grafana_url", &json!(" http://grafana ")).unwrap(),
            "http://grafana"
        );

        let err = setting_value("kea_stats_puller_interval", &json!(-1)).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        let err = setting_value("kea_stats_puller_interval", &json!(true)).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        let err = setting_value("no_such_setting", &json!(1)).unwrap_err();
        assert_eq!(err.message, "Unknown setting no_such_setting");
    }
}
