//! REST tests for subnet and shared network transactions.

use axum::Router;
use axum::http::{Method, StatusCode};
use serde_json::{Value, json};

use super::build_router;
use crate::dhcp::wire::SUBNET_CMDS_HOOK;
use crate::storage::{LocalSharedNetwork, SharedNetwork};
use crate::test_helpers::{KeaFixture, app_state, kea_fixture, local_subnet, send, subnet, test_app};

const USER_A: i64 = 1;
const USER_B: i64 = 2;

async fn stored_subnet(fx: &KeaFixture, prefix: &str) -> i64 {
    let locals = fx
        .daemons
        .iter()
        .enumerate()
        .map(|(i, d)| local_subnet(*d, 42 + i64::try_from(i).unwrap()))
        .collect();
    fx.db.add_subnet(&subnet(prefix, locals)).await.unwrap()
}

fn new_subnet_body(fx: &KeaFixture) -> Value {
    let locals: Vec<Value> = fx
        .daemons
        .iter()
        .map(|d| {
            json!({
                "daemonId": d,
                "keaParameters": {"valid-lifetime": 4500},
                "options": [{
                    "code": 3,
                    "space": "dhcp4",
                    "fields": [{"fieldType": "ipv4-address", "values": ["192.0.2.1"]}]
                }]
            })
        })
        .collect();
    json!({"subnet": {"prefix": "192.0.2.0/24", "localSubnets": locals}})
}

#[tokio::test]
async fn create_subnet_over_rest() {
    let fx = kea_fixture(2, &[SUBNET_CMDS_HOOK]).await;
    let app = test_app(&fx);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/subnets/new/transaction",
        Some(USER_A),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["daemons"].as_array().unwrap().len(), 2);
    let tx = body["id"].as_u64().unwrap();

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/api/subnets/new/transaction/{tx}/submit"),
        Some(USER_A),
        Some(new_subnet_body(&fx)),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let id = body["id"].as_i64().unwrap();

    assert_eq!(
        fx.mock.sent_names(),
        vec!["subnet4-add", "config-write", "subnet4-add", "config-write"]
    );
    assert_eq!(
        fx.mock.sent()[0].arguments,
        Some(json!({"subnet4": [{
            "subnet": "192.0.2.0/24",
            "valid-lifetime": 4500,
            "option-data": [{"code": 3, "csv-format": true, "data": "192.0.2.1", "space": "dhcp4"}]
        }]}))
    );

    let (status, body) = send(&app, Method::GET, &format!("/api/subnets/{id}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["prefix"], "192.0.2.0/24");
    assert_eq!(body["localSubnets"].as_array().unwrap().len(), 2);

    // The transaction is gone once committed.
    let (status, _) = send(
        &app,
        Method::DELETE,
        &format!("/api/subnets/new/transaction/{tx}"),
        Some(USER_A),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn transactions_require_a_user() {
    let fx = kea_fixture(1, &[SUBNET_CMDS_HOOK]).await;
    let app = test_app(&fx);
    let (status, body) =
        send(&app, Method::POST, "/api/subnets/new/transaction", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "User is not logged in");
}

#[tokio::test]
async fn concurrent_update_is_locked_out() {
    let fx = kea_fixture(2, &[SUBNET_CMDS_HOOK]).await;
    let id = stored_subnet(&fx, "192.0.2.0/24").await;
    let app = test_app(&fx);
    let begin = format!("/api/subnets/{id}/transaction");

    let (status, body) = send(&app, Method::POST, &begin, Some(USER_A), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subnet"]["id"], id);
    let tx_a = body["id"].as_u64().unwrap();

    let (status, body) = send(&app, Method::POST, &begin, Some(USER_B), None).await;
    assert_eq!(status, StatusCode::LOCKED);
    assert_eq!(
        body["message"],
        format!(
            "Unable to edit the subnet with ID {id} because it may be currently edited by another user"
        )
    );

    // Only the owner can cancel.
    let cancel_a = format!("/api/subnets/{id}/transaction/{tx_a}");
    let (status, _) = send(&app, Method::DELETE, &cancel_a, Some(USER_B), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, Method::DELETE, &cancel_a, Some(USER_A), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, Method::POST, &begin, Some(USER_B), None).await;
    assert_eq!(status, StatusCode::OK);
    let tx_b = body["id"].as_u64().unwrap();
    let (status, _) = send(
        &app,
        Method::DELETE,
        &format!("/api/subnets/{id}/transaction/{tx_b}"),
        Some(USER_B),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Begin and cancel never reach the daemons.
    assert!(fx.mock.sent().is_empty());
}

#[tokio::test]
async fn failed_commit_keeps_database_and_ends_transaction() {
    let fx = kea_fixture(2, &[SUBNET_CMDS_HOOK]).await;
    fx.mock.fail_command("subnet4-del", 1, "subnet not found");
    let id = stored_subnet(&fx, "192.0.2.0/24").await;
    let state = app_state(&fx);
    let config_manager = state.config_manager.clone();
    let app: Router = build_router(state);

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/api/subnets/{id}/transaction"),
        Some(USER_A),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let tx = body["id"].as_u64().unwrap();
    let mut edited = body["subnet"].clone();
    for local in edited["localSubnets"].as_array_mut().unwrap() {
        local["keaParameters"]["valid-lifetime"] = json!(7200);
    }

    let submit = format!("/api/subnets/{id}/transaction/{tx}/submit");
    let (status, body) = send(
        &app,
        Method::POST,
        &submit,
        Some(USER_A),
        Some(json!({"subnet": edited.clone()})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["message"].as_str().unwrap().contains("subnet not found"));
    assert_eq!(fx.mock.sent_names(), vec!["subnet4-del"]);

    assert_eq!(config_manager.lock_count().await, 0);
    let stored = fx.db.get_subnet(id).await.unwrap();
    assert!(
        stored
            .local_subnets
            .iter()
            .all(|l| l.kea_parameters.valid_lifetime == Some(4500))
    );

    let (status, _) = send(
        &app,
        Method::POST,
        &submit,
        Some(USER_A),
        Some(json!({"subnet": edited})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_submission_keeps_transaction_open() {
    let fx = kea_fixture(1, &[SUBNET_CMDS_HOOK]).await;
    let app = test_app(&fx);

    let (_, body) = send(
        &app,
        Method::POST,
        "/api/subnets/new/transaction",
        Some(USER_A),
        None,
    )
    .await;
    let tx = body["id"].as_u64().unwrap();
    let submit = format!("/api/subnets/new/transaction/{tx}/submit");

    let (status, _) = send(
        &app,
        Method::POST,
        &submit,
        Some(USER_A),
        Some(json!({"subnet": {"prefix": "192.0.2.0/24", "localSubnets": [{"daemonId": 999}]}})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(fx.mock.sent().is_empty());

    let (status, _) = send(&app, Method::POST, &submit, Some(USER_A), Some(new_subnet_body(&fx))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fx.mock.sent_names(), vec!["subnet4-add", "config-write"]);
}

#[tokio::test]
async fn delete_shared_network_over_rest() {
    let fx = kea_fixture(2, &[SUBNET_CMDS_HOOK]).await;
    let network_id = fx
        .db
        .add_shared_network(&SharedNetwork {
            name: "foo".into(),
            family: 4,
            local_shared_networks: fx
                .daemons
                .iter()
                .map(|d| LocalSharedNetwork {
                    daemon_id: *d,
                    ..LocalSharedNetwork::default()
                })
                .collect(),
            subnets: vec![subnet(
                "192.0.2.0/24",
                fx.daemons.iter().map(|d| local_subnet(*d, 1)).collect(),
            )],
            ..SharedNetwork::default()
        })
        .await
        .unwrap();
    let app = test_app(&fx);

    let (status, _) = send(
        &app,
        Method::DELETE,
        &format!("/api/shared-networks/{network_id}"),
        Some(USER_A),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        fx.mock.sent_names(),
        vec!["network4-del", "config-write", "network4-del", "config-write"]
    );
    assert_eq!(
        fx.mock.sent()[0].arguments,
        Some(json!({"name": "foo", "subnets-action": "delete"}))
    );

    let (status, body) = send(
        &app,
        Method::GET,
        &format!("/api/shared-networks/{network_id}"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], format!("Shared network {network_id} not found"));
}

#[tokio::test]
async fn list_subnets_filters_by_text() {
    let fx = kea_fixture(1, &[SUBNET_CMDS_HOOK]).await;
    stored_subnet(&fx, "192.0.2.0/24").await;
    stored_subnet(&fx, "198.51.100.0/24").await;
    let app = test_app(&fx);

    let (status, body) = send(&app, Method::GET, "/api/subnets", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);

    let (_, body) = send(&app, Method::GET, "/api/subnets?text=198.51", None, None).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["prefix"], "198.51.100.0/24");
}

#[tokio::test]
async fn zero_limit_returns_default_page() {
    let fx = kea_fixture(1, &[SUBNET_CMDS_HOOK]).await;
    for i in 0..12 {
        stored_subnet(&fx, &format!("10.0.{i}.0/24")).await;
    }
    let app = test_app(&fx);

    for uri in ["/api/subnets?limit=0", "/api/subnets?limit=-1"] {
        let (status, body) = send(&app, Method::GET, uri, None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 12);
        assert_eq!(body["items"].as_array().unwrap().len(), 10);
    }
}
