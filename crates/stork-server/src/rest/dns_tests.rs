//! REST tests for the zone inventory fetch.

use std::time::Duration;

use axum::http::{Method, StatusCode};
use serde_json::{Value, json};

use crate::test_helpers::{add_bind9_server, bind9_endpoint, kea_fixture, send, test_app};

fn zone(name: &str) -> Value {
    json!({"name": name, "view": "_default", "class": "IN", "serial": 1, "type": "primary", "loaded": 1_700_000_000})
}

#[tokio::test]
async fn zone_fetch_reports_progress_then_states() {
    let fx = kea_fixture(0, &[]).await;
    add_bind9_server(&fx.db, 0).await;
    add_bind9_server(&fx.db, 1).await;
    fx.mock
        .set_zones(bind9_endpoint(0), vec![zone("example.org"), zone("example.com")]);
    fx.mock.set_zones(bind9_endpoint(1), vec![zone("example.org")]);
    let gate = fx.mock.gate_zones();
    let app = test_app(&fx);

    let (status, _) = send(&app, Method::GET, "/api/zones/fetch", None, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, Method::PUT, "/api/zones/fetch", Some(1), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    // A second request while fetching is accepted and does not restart it.
    let (status, _) = send(&app, Method::PUT, "/api/zones/fetch", Some(1), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = send(&app, Method::GET, "/api/zones/fetch", None, None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["inProgress"], true);
    assert_eq!(body["appsCount"], 2);
    assert_eq!(body["completedAppsCount"], 0);

    gate.add_permits(2);
    let mut last = (StatusCode::ACCEPTED, Value::Null);
    for _ in 0..200 {
        last = send(&app, Method::GET, "/api/zones/fetch", None, None).await;
        if last.0 == StatusCode::OK {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let (status, body) = last;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["items"].as_array().unwrap().len(), 2);

    let (status, body) = send(&app, Method::GET, "/api/zones?text=example.com", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["name"], "example.com");
}

#[tokio::test]
async fn forced_fetch_reaches_the_agents() {
    let fx = kea_fixture(0, &[]).await;
    add_bind9_server(&fx.db, 0).await;
    fx.mock.set_zones(bind9_endpoint(0), vec![zone("example.org")]);
    let app = test_app(&fx);

    let (status, _) = send(&app, Method::PUT, "/api/zones/fetch?force=true", Some(1), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    for _ in 0..200 {
        if send(&app, Method::GET, "/api/zones/fetch", None, None).await.0 == StatusCode::OK {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let (status, _) = send(&app, Method::PUT, "/api/zones/fetch", Some(1), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    for _ in 0..200 {
        if fx.mock.zone_requests().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let forced: Vec<Value> = fx
        .mock
        .zone_requests()
        .iter()
        .map(|r| r["force"].clone())
        .collect();
    assert_eq!(forced, vec![json!(true), json!(false)]);
}
