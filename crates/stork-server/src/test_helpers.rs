//! Shared fixtures for tests that need machines, Kea and BIND 9 daemons,
//! a scripted agent or the REST router.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::{Value, json};
use stork_core::config::{PullerConfig, ZoneFetchConfig};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::agentcomm::mock::MockTransport;
use crate::agentcomm::{AgentClient, Endpoint};
use crate::configmgr::ConfigManager;
use crate::dhcp::options::{DhcpOption, OptionField};
use crate::dhcp::params::KeaParameters;
use crate::dns::ZoneManager;
use crate::puller::server_pullers;
use crate::rest::{AppState, USER_HEADER, build_router};
use crate::review::ConfigReviewer;
use crate::storage::{
    AccessPoint, AccessPointKind, App, AppType, AppUpdate, DaemonUpdate, LocalSubnet,
    ServerDatabase, Subnet,
};

pub const AGENT_PORT: i64 = 8080;

/// Database, scripted agents and Kea DHCPv4 daemons on separate machines.
pub struct KeaFixture {
    pub db: ServerDatabase,
    pub mock: Arc<MockTransport>,
    pub agents: Arc<AgentClient>,
    pub apps: Vec<App>,
    /// One `dhcp4` daemon id per machine.
    pub daemons: Vec<i64>,
}

impl KeaFixture {
    pub fn endpoint(&self, i: usize) -> Endpoint {
        Endpoint::new(format!("192.0.2.{}", 10 + i), AGENT_PORT)
    }
}

pub fn kea_config(hooks: &[&str]) -> Value {
    let libs: Vec<Value> = hooks
        .iter()
        .map(|h| json!({"library": format!("/usr/lib/kea/hooks/{h}.so")}))
        .collect();
    json!({"Dhcp4": {"hooks-libraries": libs, "subnet4": []}})
}

pub fn kea_app_update(machine_id: i64, daemons: &[&str]) -> AppUpdate {
    AppUpdate {
        machine_id,
        app_type: AppType::Kea,
        name: format!("kea@machine-{machine_id}"),
        active: true,
        version: "2.4.0".into(),
        access_points: vec![AccessPoint {
            app_id: 0,
            machine_id,
            kind: AccessPointKind::Control,
            address: "127.0.0.1".into(),
            port: 8000,
            key: None,
            use_secure_protocol: false,
        }],
        daemons: daemons
            .iter()
            .map(|name| DaemonUpdate {
                name: (*name).to_string(),
                active: true,
                version: "2.4.0".into(),
                ..DaemonUpdate::default()
            })
            .collect(),
    }
}

/// `machines` authorized machines, each running a Kea app with a `dhcp4`
/// daemon whose configuration loads `hooks`.
pub async fn kea_fixture(machines: usize, hooks: &[&str]) -> KeaFixture {
    let db = ServerDatabase::open_in_memory().await.unwrap();
    let mock = MockTransport::new();
    let agents = Arc::new(AgentClient::new(mock.clone(), Duration::from_secs(2)));

    let mut apps = Vec::new();
    let mut daemons = Vec::new();
    let config = kea_config(hooks);
    for i in 0..machines {
        let machine = db
            .add_machine(&format!("192.0.2.{}", 10 + i), AGENT_PORT, true)
            .await
            .unwrap();
        let app = db
            .add_app(&kea_app_update(machine.id, &["dhcp4"]))
            .await
            .unwrap();
        let daemon_id = app.daemons[0].id;
        db.update_daemon_kea_config(daemon_id, &config, &format!("hash-{daemon_id}"))
            .await
            .unwrap();
        daemons.push(daemon_id);
        apps.push(app);
    }

    KeaFixture {
        db,
        mock,
        agents,
        apps,
        daemons,
    }
}

/// Local subnet with a 4500 s valid lifetime and a router option.
pub fn local_subnet(daemon_id: i64, local_id: i64) -> LocalSubnet {
    LocalSubnet {
        daemon_id,
        local_subnet_id: local_id,
        kea_parameters: KeaParameters {
            valid_lifetime: Some(4500),
            ..KeaParameters::default()
        },
        options: vec![DhcpOption::new(
            3,
            "dhcp4",
            vec![OptionField::Ipv4Addr(Ipv4Addr::new(192, 0, 2, 1))],
        )],
        ..LocalSubnet::default()
    }
}

pub fn subnet(prefix: &str, locals: Vec<LocalSubnet>) -> Subnet {
    Subnet {
        prefix: prefix.into(),
        local_subnets: locals,
        ..Subnet::default()
    }
}

pub fn bind9_endpoint(i: usize) -> Endpoint {
    Endpoint::new(format!("198.51.100.{}", 10 + i), AGENT_PORT)
}

/// Authorized machine `198.51.100.{10 + i}` running BIND 9. Returns the
/// `named` daemon id.
pub async fn add_bind9_server(db: &ServerDatabase, i: usize) -> i64 {
    let machine = db
        .add_machine(&format!("198.51.100.{}", 10 + i), AGENT_PORT, true)
        .await
        .unwrap();
    let app = db
        .add_app(&AppUpdate {
            machine_id: machine.id,
            app_type: AppType::Bind9,
            name: format!("bind9@{i}"),
            active: true,
            version: "9.18.20".into(),
            access_points: vec![AccessPoint {
                app_id: 0,
                machine_id: machine.id,
                kind: AccessPointKind::Control,
                address: "127.0.0.1".into(),
                port: 953,
                key: None,
                use_secure_protocol: false,
            }],
            daemons: vec![DaemonUpdate {
                name: "named".into(),
                active: true,
                ..DaemonUpdate::default()
            }],
        })
        .await
        .unwrap();
    app.daemons[0].id
}

/// REST state over the fixture's database and scripted agents.
pub fn app_state(fx: &KeaFixture) -> AppState {
    let shutdown = CancellationToken::new();
    let ca = stork_pki::generate_ca("Stork").unwrap();
    AppState {
        db: fx.db.clone(),
        agents: Arc::clone(&fx.agents),
        config_manager: Arc::new(ConfigManager::new(
            fx.db.clone(),
            Arc::clone(&fx.agents),
            Duration::from_secs(600),
        )),
        zone_manager: Arc::new(ZoneManager::new(
            fx.db.clone(),
            Arc::clone(&fx.agents),
            shutdown.clone(),
        )),
        reviewer: ConfigReviewer::new(fx.db.clone()),
        pullers: Arc::new(server_pullers(
            &fx.db,
            &fx.agents,
            &PullerConfig::default(),
            shutdown.clone(),
        )),
        ca: Arc::new(ca),
        zone_fetch: ZoneFetchConfig::default(),
        shutdown,
    }
}

pub fn test_app(fx: &KeaFixture) -> Router {
    build_router(app_state(fx))
}

/// Send a request as `user` and return the status and JSON body
/// (`Value::Null` for an empty body).
pub async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    user: Option<i64>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header(USER_HEADER, user.to_string());
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(request).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}
