//! HTTP+JSON API of the server.
//!
//! Handlers are thin: they translate requests into storage queries and
//! calls on the configuration manager, the zone manager, the reviewer and
//! the agent client. Routes live under `/api`.

mod dhcp;
mod dns;
mod error;
mod search;
mod services;
mod settings;

#[cfg(test)]
mod dhcp_tests;
#[cfg(test)]
mod dns_tests;

use std::sync::Arc;

use axum::Router;
use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::routing::{delete, get, post, put};
use serde::Deserialize;
use stork_core::config::ZoneFetchConfig;
use stork_pki::CaBundle;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::agentcomm::AgentClient;
use crate::configmgr::ConfigManager;
use crate::dns::ZoneManager;
use crate::puller::PullerRegistry;
use crate::review::ConfigReviewer;
use crate::storage::{PageRequest, ServerDatabase, SortDir};

pub use error::ApiError;

/// Header carrying the id of the authenticated user.
pub const USER_HEADER: &str = "x-stork-user-id";

const DEFAULT_PAGE_LIMIT: i64 = 10;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: ServerDatabase,
    pub agents: Arc<AgentClient>,
    pub config_manager: Arc<ConfigManager>,
    pub zone_manager: Arc<ZoneManager>,
    pub reviewer: ConfigReviewer,
    pub pullers: Arc<PullerRegistry>,
    pub ca: Arc<CaBundle>,
    pub zone_fetch: ZoneFetchConfig,
    pub shutdown: CancellationToken,
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        // Services
        .route(
            "/machines",
            get(services::list_machines).post(services::register_machine),
        )
        .route(
            "/machines/{id}",
            get(services::get_machine)
                .put(services::update_machine)
                .delete(services::delete_machine),
        )
        .route("/machines/{id}/state", get(services::refresh_machine))
        .route("/apps", get(services::list_apps))
        .route("/apps/{id}", get(services::get_app))
        .route("/apps/{id}/services/status", get(services::app_services_status))
        .route("/daemons/{id}/config", get(services::daemon_config))
        .route("/daemons/{id}/config-reports", get(services::daemon_config_reports))
        .route("/daemons/{id}/config-review", put(services::review_daemon_config))
        // DHCP
        .route("/subnets", get(dhcp::list_subnets))
        .route(
            "/subnets/{id}",
            get(dhcp::get_subnet).delete(dhcp::delete_subnet),
        )
        .route("/subnets/new/transaction", post(dhcp::begin_subnet_add))
        .route(
            "/subnets/new/transaction/{tx}/submit",
            post(dhcp::submit_subnet_add),
        )
        .route(
            "/subnets/new/transaction/{tx}",
            delete(dhcp::cancel_new_transaction),
        )
        .route("/subnets/{id}/transaction", post(dhcp::begin_subnet_update))
        .route(
            "/subnets/{id}/transaction/{tx}/submit",
            post(dhcp::submit_subnet_update),
        )
        .route(
            "/subnets/{id}/transaction/{tx}",
            delete(dhcp::cancel_transaction),
        )
        .route("/shared-networks", get(dhcp::list_shared_networks))
        .route(
            "/shared-networks/{id}",
            get(dhcp::get_shared_network).delete(dhcp::delete_shared_network),
        )
        .route(
            "/shared-networks/new/transaction",
            post(dhcp::begin_shared_network_add),
        )
        .route(
            "/shared-networks/new/transaction/{tx}/submit",
            post(dhcp::submit_shared_network_add),
        )
        .route(
            "/shared-networks/new/transaction/{tx}",
            delete(dhcp::cancel_new_transaction),
        )
        .route(
            "/shared-networks/{id}/transaction",
            post(dhcp::begin_shared_network_update),
        )
        .route(
            "/shared-networks/{id}/transaction/{tx}/submit",
            post(dhcp::submit_shared_network_update),
        )
        .route(
            "/shared-networks/{id}/transaction/{tx}",
            delete(dhcp::cancel_transaction),
        )
        .route("/hosts", get(dhcp::list_hosts))
        .route("/hosts/{id}", get(dhcp::get_host))
        .route("/leases", get(dhcp::search_leases))
        // DNS
        .route("/zones", get(dns::list_zones))
        .route(
            "/zones/fetch",
            get(dns::zones_fetch_status).put(dns::fetch_zones),
        )
        // Settings, events, users
        .route(
            "/settings",
            get(settings::get_settings).put(settings::update_settings),
        )
        .route("/pullers", get(settings::list_pullers))
        .route("/pullers/{id}", get(settings::get_puller))
        .route("/events", get(settings::list_events))
        .route("/users", get(settings::list_users))
        .route("/users/{id}", get(settings::get_user))
        .route("/groups", get(settings::list_groups))
        .route("/search", get(search::search_records));

    with_service_layers(Router::new().nest("/api", api).with_state(state))
}

/// Layers wrapped around every route. A panicking handler answers 500.
fn with_service_layers(router: Router) -> Router {
    router
        .layer(CatchPanicLayer::custom(error::panic_response))
        .layer(TraceLayer::new_for_http())
}

/// The user a request acts for.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub i64);

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .map(Self)
            .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "User is not logged in"))
    }
}

/// Paging and text filter shared by list endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListParams {
    pub start: i64,
    pub limit: Option<i64>,
    pub text: Option<String>,
    pub sort_field: Option<String>,
    pub sort_dir: SortDir,
}

/// Requested page size, or the default when missing or not positive.
fn page_limit(limit: Option<i64>) -> i64 {
    limit.filter(|l| *l > 0).unwrap_or(DEFAULT_PAGE_LIMIT)
}

impl ListParams {
    pub fn page(&self) -> PageRequest {
        let mut page = PageRequest::new(self.start, page_limit(self.limit))
            .with_text(self.text.as_deref().unwrap_or_default().trim());
        page.sort_field.clone_from(&self.sort_field);
        page.sort_dir = self.sort_dir;
        page
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn list_params_default_to_ten_items() {
        let page = ListParams::default().page();
        assert_eq!(page.offset, 0);
        assert_eq!(page.limit, 10);
        assert!(page.filter_text.is_none());
    }

    #[test]
    fn blank_text_is_no_filter() {
        let params = ListParams {
            text: Some("  ".into()),
            ..ListParams::default()
        };
        assert!(params.page().filter_text.is_none());
    }

    #[test]
    fn non_positive_limit_falls_back_to_default() {
        for limit in [0, -1, -100] {
            let params = ListParams {
                limit: Some(limit),
                ..ListParams::default()
            };
            let page = params.page();
            assert_eq!(page.limit, DEFAULT_PAGE_LIMIT);
            assert_eq!(page.sql_limit(), DEFAULT_PAGE_LIMIT);
        }
        let params = ListParams {
            limit: Some(25),
            ..ListParams::default()
        };
        assert_eq!(params.page().sql_limit(), 25);
    }

    #[tokio::test]
    async fn panicking_handler_answers_500() {
        use axum::http::Method;
        use serde_json::json;

        async fn explode() -> &'static str {
            panic!("handler bug");
        }

        let app = with_service_layers(Router::new().route("/explode", get(explode)));
        let (status, body) = crate::test_helpers::send(&app, Method::GET, "/explode", None, None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({"message": "Internal server error"}));

        // The service keeps answering after a panic.
        let (status, _) = crate::test_helpers::send(&app, Method::GET, "/explode", None, None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
