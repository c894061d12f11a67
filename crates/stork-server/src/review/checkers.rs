//! Configuration checkers.
//!
//! A checker inspects one daemon's configuration, plus what the database
//! knows about other daemons, and returns at most one issue. Issue text
//! refers to daemons through `{daemon}` placeholders which are matched
//! positionally with the issue's `ref_daemon_ids`.

use std::collections::BTreeMap;

use ipnetwork::IpNetwork;
use serde_json::Value;

use crate::dhcp::wire::{HOST_CMDS_HOOK, STAT_CMDS_HOOK, has_hook, root_key};
use crate::storage::{Daemon, SharedNetwork, Subnet};

/// Most entries listed in a single report.
const MAX_LISTED: usize = 10;

/// Input of the checkers for one daemon.
pub struct ReviewContext {
    pub daemon: Daemon,
    pub config: Value,
    pub shared_networks: Vec<SharedNetwork>,
    /// Every subnet of the configuration, including shared network members.
    pub subnets: Vec<Subnet>,
    /// `(daemon id, local subnet id)` of every daemon serving each prefix.
    pub served_by: BTreeMap<String, Vec<(i64, i64)>>,
}

impl ReviewContext {
    fn root(&self) -> Option<&Value> {
        self.config.get(root_key(&self.daemon.name))
    }

    fn local_subnet_id(&self, subnet: &Subnet) -> Option<i64> {
        subnet
            .local_subnet(self.daemon.id)
            .map(|ls| ls.local_subnet_id)
    }
}

/// A problem found by a checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub content: String,
    pub ref_daemon_ids: Vec<i64>,
}

impl Issue {
    fn about(daemon_id: i64, content: String) -> Self {
        Self {
            content,
            ref_daemon_ids: vec![daemon_id],
        }
    }
}

pub struct Checker {
    pub name: &'static str,
    pub check: fn(&ReviewContext) -> Option<Issue>,
}

/// Checkers run by every review, in report order.
pub const CHECKERS: &[Checker] = &[
    Checker {
        name: "stat_cmds_presence",
        check: stat_cmds_presence,
    },
    Checker {
        name: "host_cmds_presence",
        check: host_cmds_presence,
    },
    Checker {
        name: "dispensable_shared_network",
        check: dispensable_shared_network,
    },
    Checker {
        name: "overlapping_subnet",
        check: overlapping_subnet,
    },
    Checker {
        name: "subnet_id_mismatch",
        check: subnet_id_mismatch,
    },
];

fn stat_cmds_presence(ctx: &ReviewContext) -> Option<Issue> {
    if has_hook(&ctx.config, STAT_CMDS_HOOK) {
        return None;
    }
    Some(Issue::about(
        ctx.daemon.id,
        "The Kea Statistics Commands library (libdhcp_stat_cmds) is not loaded by {daemon}. \
         Lease and pool statistics cannot be collected without it."
            .to_string(),
    ))
}

fn host_cmds_presence(ctx: &ReviewContext) -> Option<Issue> {
    let root = ctx.root()?;
    let uses_database = root.get("hosts-database").is_some()
        || root
            .get("hosts-databases")
            .and_then(Value::as_array)
            .is_some_and(|dbs| !dbs.is_empty());
    if !uses_database || has_hook(&ctx.config, HOST_CMDS_HOOK) {
        return None;
    }
    Some(Issue::about(
        ctx.daemon.id,
        "{daemon} keeps host reservations in a database, but the Host Commands library \
         (libdhcp_host_cmds) is not loaded. Those reservations are not visible."
            .to_string(),
    ))
}

fn dispensable_shared_network(ctx: &ReviewContext) -> Option<Issue> {
    let empty = ctx
        .shared_networks
        .iter()
        .filter(|n| n.subnets.is_empty())
        .count();
    let single = ctx
        .shared_networks
        .iter()
        .filter(|n| n.subnets.len() == 1)
        .count();
    if empty == 0 && single == 0 {
        return None;
    }

    let mut parts = Vec::new();
    if empty > 0 {
        parts.push(format!("{empty} empty shared network{}", plural(empty)));
    }
    if single > 0 {
        parts.push(format!(
            "{single} shared network{} with a single subnet",
            plural(single)
        ));
    }
    Some(Issue::about(
        ctx.daemon.id,
        format!(
            "{{daemon}} configuration includes {}. Such shared networks can be removed \
             and their subnets defined at the top level.",
            parts.join(" and ")
        ),
    ))
}

fn overlapping_subnet(ctx: &ReviewContext) -> Option<Issue> {
    let mut networks: Vec<(IpNetwork, &str)> = ctx
        .subnets
        .iter()
        .filter_map(|s| s.prefix.parse().ok().map(|n| (n, s.prefix.as_str())))
        .collect();
    networks.sort_by_key(|(n, _)| (n.network(), n.prefix()));

    let mut overlaps = Vec::new();
    for (i, (a, a_text)) in networks.iter().enumerate() {
        for (b, b_text) in &networks[i + 1..] {
            if a.contains(b.network()) || b.contains(a.network()) {
                overlaps.push(format!("{a_text} overlaps with {b_text}"));
            }
        }
    }
    if overlaps.is_empty() {
        return None;
    }

    let count = overlaps.len();
    overlaps.truncate(MAX_LISTED);
    Some(Issue::about(
        ctx.daemon.id,
        format!(
            "{{daemon}} configuration includes {count} overlapping subnet pair{}: {}.",
            plural(count),
            overlaps.join("; ")
        ),
    ))
}

/// Same prefix served under different local ids by different daemons.
fn subnet_id_mismatch(ctx: &ReviewContext) -> Option<Issue> {
    let mut lines = Vec::new();
    let mut refs = Vec::new();
    for subnet in &ctx.subnets {
        let Some(own_id) = ctx.local_subnet_id(subnet) else {
            continue;
        };
        let Some(servers) = ctx.served_by.get(&subnet.prefix) else {
            continue;
        };
        for (other_daemon, other_id) in servers {
            if *other_daemon == ctx.daemon.id || *other_id == own_id {
                continue;
            }
            if lines.len() < MAX_LISTED {
                lines.push(format!(
                    "subnet {} has ID {own_id} in {{daemon}} and ID {other_id} in {{daemon}}",
                    subnet.prefix
                ));
                refs.extend([ctx.daemon.id, *other_daemon]);
            }
        }
    }
    if lines.is_empty() {
        return None;
    }
    Some(Issue {
        content: format!(
            "Subnet IDs differ between servers: {}. Statistics and reservations of these \
             subnets cannot be correlated.",
            lines.join("; ")
        ),
        ref_daemon_ids: refs,
    })
}

const fn plural(n: usize) -> &'static str {
    if n == 1 { "" } else { "s" }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dhcp::wire::networks_from_config;
    use serde_json::json;
    use sqlx::types::Json;

    fn daemon(id: i64) -> Daemon {
        Daemon {
            id,
            app_id: 1,
            name: "dhcp4".into(),
            pid: 0,
            active: true,
            monitored: true,
            version: "2.4.0".into(),
            extended_version: String::new(),
            reloaded_at: None,
            uptime: 0,
            log_targets: Json(Vec::new()),
            kea_config: None,
            kea_config_hash: None,
            kea_ha_state: None,
            bind9_stats: None,
            created_at: 0,
        }
    }

    fn context(config: Value) -> ReviewContext {
        let daemon = daemon(1);
        let (shared_networks, mut subnets) = networks_from_config(&daemon, &config);
        subnets.extend(shared_networks.iter().flat_map(|n| n.subnets.clone()));
        ReviewContext {
            daemon,
            config,
            shared_networks,
            subnets,
            served_by: BTreeMap::new(),
        }
    }

    #[test]
    fn stat_cmds_missing() {
        let ctx = context(json!({"Dhcp4": {"hooks-libraries": []}}));
        let issue = stat_cmds_presence(&ctx).unwrap();
        assert!(issue.content.contains("libdhcp_stat_cmds"));
        assert_eq!(issue.ref_daemon_ids, vec![1]);

        let ctx = context(json!({"Dhcp4": {"hooks-libraries": [
            {"library": "/usr/lib/kea/hooks/libdhcp_stat_cmds.so"}
        ]}}));
        assert!(stat_cmds_presence(&ctx).is_none());
    }

    #[test]
    fn host_cmds_only_matters_with_host_database() {
        let ctx = context(json!({"Dhcp4": {}}));
        assert!(host_cmds_presence(&ctx).is_none());

        let ctx = context(json!({"Dhcp4": {"hosts-database": {"type": "mysql"}}}));
        assert!(host_cmds_presence(&ctx).is_some());

        let ctx = context(json!({"Dhcp4": {
            "hosts-databases": [{"type": "postgresql"}],
            "hooks-libraries": [{"library": "libdhcp_host_cmds.so"}]
        }}));
        assert!(host_cmds_presence(&ctx).is_none());
    }

    #[test]
    fn dispensable_networks_counted() {
        let ctx = context(json!({"Dhcp4": {"shared-networks": [
            {"name": "empty", "subnet4": []},
            {"name": "single", "subnet4": [{"id": 1, "subnet": "192.0.2.0/24"}]},
            {"name": "fine", "subnet4": [
                {"id": 2, "subnet": "198.51.100.0/24"},
                {"id": 3, "subnet": "203.0.113.0/24"}
            ]}
        ]}}));
        let issue = dispensable_shared_network(&ctx).unwrap();
        assert_eq!(
            issue.content,
            "{daemon} configuration includes 1 empty shared network and 1 shared network \
             with a single subnet. Such shared networks can be removed and their subnets \
             defined at the top level."
        );
    }

    #[test]
    fn overlaps_detected() {
        let ctx = context(json!({"Dhcp4": {"subnet4": [
            {"id": 1, "subnet": "192.0.2.0/24"},
            {"id": 2, "subnet": "192.0.2.128/25"},
            {"id": 3, "subnet": "198.51.100.0/24"}
        ]}}));
        let issue = overlapping_subnet(&ctx).unwrap();
        assert!(issue.content.contains("1 overlapping subnet pair:"));
        assert!(issue.content.contains("192.0.2.0/24 overlaps with 192.0.2.128/25"));

        let ctx = context(json!({"Dhcp4": {"subnet4": [
            {"id": 1, "subnet": "192.0.2.0/25"},
            {"id": 2, "subnet": "192.0.2.128/25"}
        ]}}));
        assert!(overlapping_subnet(&ctx).is_none());
    }

    #[test]
    fn mismatched_ids_reference_both_daemons() {
        let mut ctx = context(json!({"Dhcp4": {"subnet4": [
            {"id": 7, "subnet": "192.0.2.0/24"},
            {"id": 8, "subnet": "198.51.100.0/24"}
        ]}}));
        ctx.served_by
            .insert("192.0.2.0/24".into(), vec![(1, 7), (2, 9)]);
        ctx.served_by
            .insert("198.51.100.0/24".into(), vec![(1, 8), (2, 8)]);

        let issue = subnet_id_mismatch(&ctx).unwrap();
        assert!(
            issue
                .content
                .contains("subnet 192.0.2.0/24 has ID 7 in {daemon} and ID 9 in {daemon}")
        );
        assert!(!issue.content.contains("198.51.100.0/24"));
        assert_eq!(issue.ref_daemon_ids, vec![1, 2]);
    }
}
