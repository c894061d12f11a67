//! Tests for ConfigManager transactions.

use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::dhcp::wire::SUBNET_CMDS_HOOK;
use crate::storage::{LocalSharedNetwork, SharedNetwork};
use crate::test_helpers::{KeaFixture, kea_fixture, local_subnet, subnet};

const USER_A: i64 = 1;
const USER_B: i64 = 2;

fn manager(fx: &KeaFixture, ttl: Duration) -> ConfigManager {
    ConfigManager::new(fx.db.clone(), fx.agents.clone(), ttl)
}

/// Store `prefix` as served by every fixture daemon and return its id.
async fn stored_subnet(fx: &KeaFixture, prefix: &str) -> i64 {
    let locals = fx
        .daemons
        .iter()
        .enumerate()
        .map(|(i, d)| local_subnet(*d, 42 + i64::try_from(i).unwrap()))
        .collect();
    fx.db.add_subnet(&subnet(prefix, locals)).await.unwrap()
}

#[tokio::test]
async fn create_subnet_lifecycle() {
    let fx = kea_fixture(2, &[SUBNET_CMDS_HOOK]).await;
    let cm = manager(&fx, Duration::from_secs(600));

    let mut ctx = cm.create_context(USER_A);
    cm.begin_subnet_add(&mut ctx).await.unwrap();
    assert_eq!(ctx.daemons.len(), 2);
    assert!(ctx.locked_daemons.is_empty());
    cm.remember_context(&ctx, cm.ttl()).await;

    let mut ctx = cm.recover_context(ctx.id, USER_A).await.unwrap();
    let new = subnet(
        "192.0.2.0/24",
        fx.daemons.iter().map(|d| local_subnet(*d, 0)).collect(),
    );
    cm.apply_subnet_add(&mut ctx, new).unwrap();
    cm.commit(&mut ctx, &CancellationToken::new()).await.unwrap();
    cm.done(ctx.id).await;

    let sent = fx.mock.sent();
    assert_eq!(
        fx.mock.sent_names(),
        vec!["subnet4-add", "config-write", "subnet4-add", "config-write"]
    );
    assert_eq!(
        sent[0].arguments,
        Some(json!({"subnet4": [{
            "subnet": "192.0.2.0/24",
            "valid-lifetime": 4500,
            "option-data": [{"code": 3, "csv-format": true, "data": "192.0.2.1", "space": "dhcp4"}]
        }]}))
    );

    let id = ctx.recipes[0].created_id.unwrap();
    let stored = fx.db.get_subnet(id).await.unwrap();
    assert_eq!(stored.local_subnets.len(), 2);
    for local in &stored.local_subnets {
        // The mock assigns ids from 100 upwards.
        assert!(local.local_subnet_id >= 100);
        assert!(!local.option_set_hash.is_empty());
    }
    assert_eq!(ctx.state, TransactionState::Committed);
}

#[tokio::test]
async fn update_under_contention() {
    let fx = kea_fixture(2, &[SUBNET_CMDS_HOOK]).await;
    let cm = manager(&fx, Duration::from_secs(600));
    let id = stored_subnet(&fx, "192.0.2.0/24").await;

    let mut a = cm.create_context(USER_A);
    cm.begin_subnet_update(&mut a, id).await.unwrap();
    cm.remember_context(&a, cm.ttl()).await;
    assert_eq!(cm.lock_count().await, 2);

    let mut b = cm.create_context(USER_B);
    let err = cm.begin_subnet_update(&mut b, id).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("Unable to edit the subnet with ID {id} because it may be currently edited by another user")
    );
    assert!(b.locked_daemons.is_empty());
    assert_eq!(cm.lock_owner(fx.daemons[0]).await, Some(a.id));

    cm.done(a.id).await;
    assert_eq!(cm.lock_count().await, 0);
    cm.begin_subnet_update(&mut b, id).await.unwrap();
    assert_eq!(cm.lock_owner(fx.daemons[1]).await, Some(b.id));

    // Begin followed by cancel sends nothing.
    cm.done(b.id).await;
    assert!(fx.mock.sent().is_empty());
}

#[tokio::test]
async fn commit_failure_leaves_database_unchanged() {
    let fx = kea_fixture(2, &[SUBNET_CMDS_HOOK]).await;
    fx.mock.fail_command("subnet4-del", 1, "subnet not found");
    let cm = manager(&fx, Duration::from_secs(600));
    let id = stored_subnet(&fx, "192.0.2.0/24").await;

    let mut ctx = cm.create_context(USER_A);
    let mut edited = cm.begin_subnet_update(&mut ctx, id).await.unwrap();
    for local in &mut edited.local_subnets {
        local.kea_parameters.valid_lifetime = Some(7200);
    }
    cm.apply_subnet_update(&mut ctx, edited).unwrap();

    let err = cm
        .commit(&mut ctx, &CancellationToken::new())
        .await
        .unwrap_err();
    let ConfigManagerError::Commit(commit) = err else {
        panic!("unexpected error: {err}");
    };
    assert!(commit.is_daemon_error());
    assert_eq!(commit.step, 0);
    assert_eq!(commit.command, "subnet4-del");
    assert!(commit.sent.is_empty());
    assert!(commit.to_string().contains("subnet not found"));
    assert_eq!(fx.mock.sent_names(), vec!["subnet4-del"]);

    cm.done(ctx.id).await;
    assert_eq!(cm.lock_count().await, 0);
    let stored = fx.db.get_subnet(id).await.unwrap();
    assert!(
        stored
            .local_subnets
            .iter()
            .all(|l| l.kea_parameters.valid_lifetime == Some(4500))
    );
}

#[tokio::test]
async fn update_carries_local_ids() {
    let fx = kea_fixture(1, &[SUBNET_CMDS_HOOK]).await;
    let cm = manager(&fx, Duration::from_secs(600));
    let id = stored_subnet(&fx, "192.0.2.0/24").await;

    let mut ctx = cm.create_context(USER_A);
    let pre = cm.begin_subnet_update(&mut ctx, id).await.unwrap();
    let mut post = pre.clone();
    post.local_subnets[0].local_subnet_id = 0;
    post.client_class = Some("office".into());
    cm.apply_subnet_update(&mut ctx, post).unwrap();
    fx.mock.set_arguments("subnet4-add", json!({"subnets": [{"id": 42}]}));
    cm.commit(&mut ctx, &CancellationToken::new()).await.unwrap();

    let sent = fx.mock.sent();
    assert_eq!(
        fx.mock.sent_names(),
        vec!["subnet4-del", "subnet4-add", "config-write"]
    );
    assert_eq!(sent[0].arguments, Some(json!({"id": 42})));
    assert_eq!(sent[1].arguments.as_ref().unwrap()["subnet4"][0]["id"], 42);

    let stored = fx.db.get_subnet(id).await.unwrap();
    assert_eq!(stored.client_class.as_deref(), Some("office"));
    assert_eq!(stored.local_subnets[0].local_subnet_id, 42);
}

#[tokio::test]
async fn delete_shared_network() {
    let fx = kea_fixture(2, &[SUBNET_CMDS_HOOK]).await;
    let cm = manager(&fx, Duration::from_secs(600));
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

    let mut ctx = cm.create_context(USER_A);
    let network = cm
        .begin_shared_network_update(&mut ctx, network_id)
        .await
        .unwrap();
    cm.apply_shared_network_delete(&mut ctx, &network).unwrap();
    cm.commit(&mut ctx, &CancellationToken::new()).await.unwrap();
    cm.done(ctx.id).await;

    let sent = fx.mock.sent();
    assert_eq!(
        fx.mock.sent_names(),
        vec!["network4-del", "config-write", "network4-del", "config-write"]
    );
    assert_eq!(
        sent[0].arguments,
        Some(json!({"name": "foo", "subnets-action": "delete"}))
    );
    assert_ne!(sent[0].endpoint, sent[2].endpoint);

    assert!(fx.db.get_shared_network(network_id).await.unwrap_err().is_not_found());
    assert!(fx.db.get_subnet_by_prefix("192.0.2.0/24").await.unwrap().is_none());
}

#[tokio::test]
async fn missing_hook_rejects_update_and_releases_locks() {
    let fx = kea_fixture(1, &[]).await;
    let cm = manager(&fx, Duration::from_secs(600));
    let id = stored_subnet(&fx, "192.0.2.0/24").await;

    let mut ctx = cm.create_context(USER_A);
    let err = cm.begin_subnet_update(&mut ctx, id).await.unwrap_err();
    assert!(matches!(err, ConfigManagerError::NoSubnetCmdsHook { .. }));
    assert_eq!(cm.lock_count().await, 0);
}

#[tokio::test]
async fn unknown_subnet_is_reported() {
    let fx = kea_fixture(1, &[SUBNET_CMDS_HOOK]).await;
    let cm = manager(&fx, Duration::from_secs(600));
    let mut ctx = cm.create_context(USER_A);
    let err = cm.begin_subnet_update(&mut ctx, 999).await.unwrap_err();
    assert!(matches!(err, ConfigManagerError::SubnetNotFound(999)));
}

#[tokio::test]
async fn subnet_without_daemons_is_rejected() {
    let fx = kea_fixture(1, &[SUBNET_CMDS_HOOK]).await;
    let cm = manager(&fx, Duration::from_secs(600));
    let mut ctx = cm.create_context(USER_A);
    cm.begin_subnet_add(&mut ctx).await.unwrap();

    let err = cm
        .apply_subnet_add(&mut ctx, subnet("192.0.2.0/24", Vec::new()))
        .unwrap_err();
    assert!(matches!(err, ConfigManagerError::Apply(ApplyError::Kea(_))));

    let err = cm
        .apply_subnet_add(&mut ctx, subnet("192.0.2.0/24", vec![local_subnet(999, 0)]))
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigManagerError::Apply(ApplyError::UnknownDaemon(999))
    ));
}

#[tokio::test]
async fn commit_requires_staged_change() {
    let fx = kea_fixture(1, &[SUBNET_CMDS_HOOK]).await;
    let cm = manager(&fx, Duration::from_secs(600));
    let mut ctx = cm.create_context(USER_A);
    cm.begin_subnet_add(&mut ctx).await.unwrap();
    let err = cm
        .commit(&mut ctx, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ConfigManagerError::InvalidState { .. }));
}

#[tokio::test]
async fn recover_is_per_user() {
    let fx = kea_fixture(1, &[SUBNET_CMDS_HOOK]).await;
    let cm = manager(&fx, Duration::from_secs(600));
    let ctx = cm.create_context(USER_A);
    cm.remember_context(&ctx, cm.ttl()).await;

    assert!(cm.recover_context(ctx.id, USER_B).await.is_none());
    assert!(cm.recover_context(ctx.id, USER_A).await.is_some());
    cm.done(ctx.id).await;
    assert!(cm.recover_context(ctx.id, USER_A).await.is_none());
}

#[tokio::test]
async fn expired_transaction_releases_locks() {
    let fx = kea_fixture(1, &[SUBNET_CMDS_HOOK]).await;
    let cm = manager(&fx, Duration::from_millis(50));
    let id = stored_subnet(&fx, "192.0.2.0/24").await;

    let mut ctx = cm.create_context(USER_A);
    cm.begin_subnet_update(&mut ctx, id).await.unwrap();
    cm.remember_context(&ctx, cm.ttl()).await;
    assert_eq!(cm.lock_count().await, 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cm.lock_count().await, 0);
    assert!(cm.recover_context(ctx.id, USER_A).await.is_none());

    let mut other = cm.create_context(USER_B);
    cm.begin_subnet_update(&mut other, id).await.unwrap();
}

#[tokio::test]
async fn cancelled_commit_reports_progress() {
    let fx = kea_fixture(1, &[SUBNET_CMDS_HOOK]).await;
    let cm = manager(&fx, Duration::from_secs(600));
    let id = stored_subnet(&fx, "192.0.2.0/24").await;

    let mut ctx = cm.create_context(USER_A);
    let pre = cm.begin_subnet_update(&mut ctx, id).await.unwrap();
    cm.apply_subnet_delete(&mut ctx, &pre).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = cm.commit(&mut ctx, &cancel).await.unwrap_err();
    let ConfigManagerError::Commit(commit) = err else {
        panic!("unexpected error: {err}");
    };
    assert!(!commit.is_daemon_error());
    assert!(fx.db.get_subnet(id).await.is_ok());
}
