use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::dhcp::wire::{HOST_CMDS_HOOK, SUBNET_CMDS_HOOK};
use crate::storage::{
    AccessPoint, AccessPointKind, AppType, AppUpdate, DaemonUpdate, HostDataSource, PageRequest,
};
use crate::test_helpers::{KeaFixture, kea_config, kea_fixture, local_subnet, subnet};

fn reported_state(apps: Value) -> Value {
    json!({
        "agentVersion": "1.19.0",
        "hostname": "kea-host",
        "os": "linux",
        "cpus": 4,
        "memory": 8,
        "apps": apps,
    })
}

fn reported_kea_app() -> Value {
    json!({
        "type": "kea",
        "name": "kea@machine-1",
        "version": "2.4.1",
        "accessPoints": [{"kind": "control", "address": "127.0.0.1", "port": 8000}],
        "daemons": [{"name": "dhcp4", "active": true, "version": "2.4.1"}],
    })
}

fn served_config() -> Value {
    let mut config = kea_config(&[SUBNET_CMDS_HOOK]);
    config["Dhcp4"]["subnet4"] = json!([{
        "id": 7,
        "subnet": "192.0.2.0/24",
        "pools": [{"pool": "192.0.2.10-192.0.2.100"}],
        "reservations": [{"hw-address": "aa:bb:cc:dd:ee:ff", "ip-address": "192.0.2.5", "hostname": "printer"}],
    }]);
    config["Dhcp4"]["reservations"] = json!([{"duid": "01:02:03", "hostname": "global"}]);
    config
}

async fn bind9_daemon(fx: &KeaFixture) -> i64 {
    let machine_id = fx.apps[0].machine_id;
    let app = fx
        .db
        .add_app(&AppUpdate {
            machine_id,
            app_type: AppType::Bind9,
            name: "bind9@machine-1".into(),
            active: true,
            version: "9.18".into(),
            access_points: vec![
                AccessPoint {
                    app_id: 0,
                    machine_id,
                    kind: AccessPointKind::Control,
                    address: "127.0.0.1".into(),
                    port: 953,
                    key: None,
                    use_secure_protocol: false,
                },
                AccessPoint {
                    app_id: 0,
                    machine_id,
                    kind: AccessPointKind::Statistics,
                    address: "127.0.0.1".into(),
                    port: 8053,
                    key: None,
                    use_secure_protocol: false,
                },
            ],
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

#[tokio::test]
async fn state_refresh_imports_configuration() {
    let fx = kea_fixture(1, &[SUBNET_CMDS_HOOK]).await;
    let machine_id = fx.apps[0].machine_id;
    fx.mock.set_state(fx.endpoint(0), reported_state(json!([reported_kea_app()])));
    fx.mock.set_arguments("config-get", served_config());

    let machine = refresh_machine_state(&fx.db, &fx.agents, machine_id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(machine.state.0.hostname, "kea-host");
    assert_eq!(machine.state.0.cpus, 4);
    assert!(machine.error.is_none());
    assert_eq!(machine.apps.len(), 1);
    assert_eq!(machine.apps[0].id, fx.apps[0].id);
    assert_eq!(machine.apps[0].version, "2.4.1");

    let stored = fx
        .db
        .get_subnet_by_prefix("192.0.2.0/24")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.local_subnets.len(), 1);
    assert_eq!(stored.local_subnets[0].local_subnet_id, 7);

    let hosts = fx
        .db
        .get_hosts_by_page(&PageRequest::new(0, 10), None, None)
        .await
        .unwrap();
    assert_eq!(hosts.total, 2);
    let printer = hosts.items.iter().find(|h| h.hostname == "printer").unwrap();
    assert_eq!(printer.subnet_id, Some(stored.id));
    assert_eq!(printer.local_hosts[0].data_source, HostDataSource::Config);
    let global = hosts.items.iter().find(|h| h.hostname == "global").unwrap();
    assert_eq!(global.subnet_id, None);

    let daemon = fx.db.get_daemon(fx.daemons[0]).await.unwrap();
    assert_eq!(
        daemon.kea_config_hash.as_deref(),
        Some(config_hash(&served_config()).as_str())
    );
}

#[tokio::test]
async fn unchanged_configuration_is_not_reimported() {
    let fx = kea_fixture(1, &[SUBNET_CMDS_HOOK]).await;
    let machine_id = fx.apps[0].machine_id;
    fx.mock.set_state(fx.endpoint(0), reported_state(json!([reported_kea_app()])));
    fx.mock.set_arguments("config-get", served_config());
    let cancel = CancellationToken::new();

    refresh_machine_state(&fx.db, &fx.agents, machine_id, &cancel)
        .await
        .unwrap();
    let first = fx.db.get_subnet_by_prefix("192.0.2.0/24").await.unwrap().unwrap();

    // A subnet removed behind the server's back stays removed while the
    // daemon's configuration hash does not change.
    fx.db.delete_subnet(first.id).await.unwrap();
    refresh_machine_state(&fx.db, &fx.agents, machine_id, &cancel)
        .await
        .unwrap();
    assert!(fx.db.get_subnet_by_prefix("192.0.2.0/24").await.unwrap().is_none());
}

#[tokio::test]
async fn state_refresh_adds_new_apps() {
    let fx = kea_fixture(1, &[]).await;
    let machine_id = fx.apps[0].machine_id;
    let bind9 = json!({
        "type": "bind9",
        "accessPoints": [{"kind": "control", "address": "127.0.0.1", "port": 953}],
        "daemons": [{"name": "named", "active": true}],
    });
    fx.mock
        .set_state(fx.endpoint(0), reported_state(json!([reported_kea_app(), bind9])));
    fx.mock.set_arguments("config-get", kea_config(&[]));

    let machine = refresh_machine_state(&fx.db, &fx.agents, machine_id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(machine.apps.len(), 2);
    let named = machine
        .apps
        .iter()
        .find(|a| a.app_type == AppType::Bind9)
        .unwrap();
    assert_eq!(named.name, "bind9@192.0.2.10");
    assert_eq!(named.daemons[0].name, "named");
}

#[tokio::test]
async fn unreachable_agent_is_recorded() {
    let fx = kea_fixture(1, &[]).await;
    fx.mock.set_unreachable(fx.endpoint(0));
    let puller = StatePuller::new(fx.db.clone(), fx.agents.clone());

    let err = puller.tick(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, PullerError::Partial { failed: 1, total: 1 }));

    let machine = fx.db.get_machine(fx.apps[0].machine_id).await.unwrap();
    assert!(machine.error.unwrap().contains("connection refused"));
}

#[tokio::test]
async fn stats_are_stored_per_local_subnet() {
    let fx = kea_fixture(1, &[]).await;
    let subnet_id = fx
        .db
        .add_subnet(&subnet("192.0.2.0/24", vec![local_subnet(fx.daemons[0], 1)]))
        .await
        .unwrap();
    fx.mock.set_arguments(
        "statistic-get-all",
        json!({
            "subnet[1].total-addresses": [[256, "2024-01-01 00:00:00"]],
            "subnet[1].assigned-addresses": [[12, "2024-01-01 00:00:00"]],
            "subnet[9].total-addresses": [[16, "2024-01-01 00:00:00"]],
        }),
    );

    let puller = KeaStatsPuller::new(fx.db.clone(), fx.agents.clone());
    puller.tick(&CancellationToken::new()).await.unwrap();

    let stored = fx.db.get_subnet(subnet_id).await.unwrap();
    assert_eq!(
        stored.local_subnets[0].stats,
        Some(json!({"total-addresses": 256, "assigned-addresses": 12}))
    );
}

#[tokio::test]
async fn status_updates_daemon() {
    let fx = kea_fixture(2, &[]).await;
    fx.mock.set_arguments(
        "status-get",
        json!({
            "pid": 4242,
            "uptime": 3600,
            "reload": 60,
            "high-availability": [{"ha-servers": {"local": {"state": "load-balancing"}}}],
        }),
    );

    let puller = KeaStatusPuller::new(fx.db.clone(), fx.agents.clone());
    puller.tick(&CancellationToken::new()).await.unwrap();

    for id in &fx.daemons {
        let daemon = fx.db.get_daemon(*id).await.unwrap();
        assert_eq!(daemon.pid, 4242);
        assert_eq!(daemon.uptime, 3600);
        assert!(daemon.reloaded_at.is_some());
        assert_eq!(daemon.kea_ha_state.as_deref(), Some("load-balancing"));
    }
    assert_eq!(fx.mock.sent_names(), vec!["status-get", "status-get"]);
}

#[tokio::test]
async fn status_failure_on_one_daemon_is_partial() {
    let fx = kea_fixture(2, &[]).await;
    fx.mock.set_unreachable(fx.endpoint(1));
    fx.mock.set_arguments("status-get", json!({"pid": 1, "uptime": 1}));

    let puller = KeaStatusPuller::new(fx.db.clone(), fx.agents.clone());
    let err = puller.tick(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, PullerError::Partial { failed: 1, total: 2 }));
    assert_eq!(fx.db.get_daemon(fx.daemons[0]).await.unwrap().pid, 1);
}

#[tokio::test]
async fn hosts_pulled_only_with_host_cmds() {
    let fx = kea_fixture(2, &[]).await;
    fx.db
        .update_daemon_kea_config(fx.daemons[0], &kea_config(&[HOST_CMDS_HOOK]), "with-hook")
        .await
        .unwrap();
    fx.mock.set_arguments(
        "reservation-get-page",
        json!({
            "count": 1,
            "hosts": [{"hw-address": "01:02:03:04:05:06", "ip-address": "192.0.2.77", "subnet-id": 0}],
        }),
    );

    let puller = KeaHostsPuller::new(fx.db.clone(), fx.agents.clone());
    puller.tick(&CancellationToken::new()).await.unwrap();

    let sent = fx.mock.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].command, "reservation-get-page");
    assert_eq!(sent[0].endpoint, fx.endpoint(0));
    assert_eq!(sent[0].arguments, Some(json!({"limit": 1000})));

    let hosts = fx
        .db
        .get_hosts_by_page(&PageRequest::new(0, 10), None, None)
        .await
        .unwrap();
    assert_eq!(hosts.total, 1);
    assert_eq!(hosts.items[0].reserved_addresses.0, vec!["192.0.2.77"]);
    assert_eq!(hosts.items[0].local_hosts[0].daemon_id, fx.daemons[0]);
    assert_eq!(hosts.items[0].local_hosts[0].data_source, HostDataSource::Api);
}

#[tokio::test]
async fn bind9_stats_are_stored() {
    let fx = kea_fixture(1, &[]).await;
    let named = bind9_daemon(&fx).await;
    let stats = json!({"views": {"_default": {"resolver": {"cachestats": {"CacheHits": 10}}}}});
    fx.mock.set_bind9_stats(fx.endpoint(0), stats.clone());

    let puller = Bind9StatsPuller::new(fx.db.clone(), fx.agents.clone());
    puller.tick(&CancellationToken::new()).await.unwrap();

    let daemon = fx.db.get_daemon(named).await.unwrap();
    assert_eq!(daemon.bind9_stats.map(|s| s.0), Some(stats));
}

#[tokio::test]
async fn registry_lists_server_pullers() {
    let fx = kea_fixture(1, &[]).await;
    let registry = server_pullers(
        &fx.db,
        &fx.agents,
        &stork_core::config::PullerConfig::default(),
        CancellationToken::new(),
    );
    let ids: Vec<String> = registry.infos().await.into_iter().map(|i| i.id).collect();
    assert_eq!(
        ids,
        vec![
            APPS_STATE_INTERVAL,
            KEA_STATS_INTERVAL,
            KEA_STATUS_INTERVAL,
            KEA_HOSTS_INTERVAL,
            BIND9_STATS_INTERVAL,
        ]
    );
}
