//! Lease search across Kea servers loading `libdhcp_lease_cmds`.

use std::net::IpAddr;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::agentcomm::AgentClient;
use crate::dhcp::KeaCommand;
use crate::dhcp::wire::{LEASE_CMDS_HOOK, has_hook};
use crate::storage::{AppType, DaemonTarget, DatabaseError, ServerDatabase};

/// Text selecting declined leases instead of a lookup by value.
pub const DECLINED_QUERY: &str = "state:declined";

/// Kea's lease state for a declined address.
const STATE_DECLINED: i64 = 1;

#[allow(clippy::expect_used)]
static HW_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2}$").expect("static regex is valid")
});

#[allow(clippy::expect_used)]
static HEX_IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}[:-]?)+[0-9A-Fa-f]{2}$").expect("static regex is valid")
});

/// How the search text is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseQuery {
    Address(IpAddr),
    /// A MAC address; also tried as client identifier and DUID.
    HwAddress(String),
    /// Hex identifier that is not a MAC address.
    Identifier(String),
    Hostname(String),
    Declined,
}

impl LeaseQuery {
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        if text.eq_ignore_ascii_case(DECLINED_QUERY) {
            return Some(Self::Declined);
        }
        if let Ok(addr) = text.parse::<IpAddr>() {
            return Some(Self::Address(addr));
        }
        let normalized = text.replace('-', ":").to_lowercase();
        if HW_ADDRESS.is_match(text) {
            return Some(Self::HwAddress(normalized));
        }
        if HEX_IDENTIFIER.is_match(text) {
            return Some(Self::Identifier(normalized));
        }
        Some(Self::Hostname(text.to_string()))
    }

    /// Commands to send to a daemon of the given name.
    fn commands(&self, daemon_name: &str) -> Vec<KeaCommand> {
        let v6 = daemon_name == "dhcp6";
        let cmd = |name: &str, arguments: Value| KeaCommand::new(name, daemon_name, Some(arguments));
        match self {
            Self::Address(IpAddr::V4(addr)) if !v6 => {
                vec![cmd("lease4-get", json!({"ip-address": addr.to_string()}))]
            }
            Self::Address(IpAddr::V6(addr)) if v6 => vec![cmd(
                "lease6-get",
                json!({"ip-address": addr.to_string(), "type": "IA_NA"}),
            )],
            Self::Address(_) => Vec::new(),
            Self::HwAddress(hw) if !v6 => vec![
                cmd("lease4-get-by-hw-address", json!({"hw-address": hw})),
                cmd("lease4-get-by-client-id", json!({"client-id": hw})),
            ],
            Self::HwAddress(id) | Self::Identifier(id) if v6 => {
                vec![cmd("lease6-get-by-duid", json!({"duid": id}))]
            }
            Self::Identifier(id) => vec![cmd("lease4-get-by-client-id", json!({"client-id": id}))],
            Self::HwAddress(_) => Vec::new(),
            Self::Hostname(name) if v6 => {
                vec![cmd("lease6-get-by-hostname", json!({"hostname": name}))]
            }
            Self::Hostname(name) => {
                vec![cmd("lease4-get-by-hostname", json!({"hostname": name}))]
            }
            Self::Declined if v6 => vec![cmd("lease6-get-by-duid", json!({"duid": "0"}))],
            Self::Declined => vec![cmd(
                "lease4-get-by-hw-address",
                json!({"hw-address": "00:00:00:00:00:00"}),
            )],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub app_id: i64,
    pub app_name: String,
    pub daemon_id: i64,
    pub ip_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hw_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_length: Option<i64>,
    pub hostname: String,
    pub subnet_id: i64,
    pub state: i64,
    pub valid_lifetime: i64,
    pub cltt: i64,
}

impl Lease {
    fn from_kea(target: &DaemonTarget, entry: &Value) -> Option<Self> {
        let text = |key: &str| entry.get(key).and_then(Value::as_str).map(ToString::to_string);
        let int = |key: &str| entry.get(key).and_then(Value::as_i64);
        Some(Self {
            app_id: target.app_id,
            app_name: target.app_name.clone(),
            daemon_id: target.daemon_id,
            ip_address: text("ip-address")?,
            hw_address: text("hw-address").filter(|s| !s.is_empty()),
            client_id: text("client-id").filter(|s| !s.is_empty()),
            duid: text("duid").filter(|s| !s.is_empty()),
            lease_type: text("type"),
            prefix_length: int("prefix-len"),
            hostname: text("hostname").unwrap_or_default(),
            subnet_id: int("subnet-id").unwrap_or(0),
            state: int("state").unwrap_or(0),
            valid_lifetime: int("valid-lft").unwrap_or(0),
            cltt: int("cltt").unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErredApp {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseSearchResult {
    pub items: Vec<Lease>,
    pub total: i64,
    pub erred_apps: Vec<ErredApp>,
}

/// Leases from a single command's arguments. `lease*-get` answers with the
/// lease itself, the other lookups with a `leases` list.
fn leases_from_arguments(target: &DaemonTarget, arguments: &Value) -> Vec<Lease> {
    match arguments.get("leases").and_then(Value::as_array) {
        Some(list) => list.iter().filter_map(|l| Lease::from_kea(target, l)).collect(),
        None => Lease::from_kea(target, arguments).into_iter().collect(),
    }
}

/// Query every Kea DHCP daemon that can answer lease commands.
///
/// A daemon that fails any of its commands puts its app in `erred_apps`;
/// leases from other daemons are still returned.
pub async fn search_leases(
    db: &ServerDatabase,
    agents: &Arc<AgentClient>,
    text: &str,
    cancel: &CancellationToken,
) -> Result<LeaseSearchResult, DatabaseError> {
    let Some(query) = LeaseQuery::parse(text) else {
        return Ok(LeaseSearchResult::default());
    };

    let mut result = LeaseSearchResult::default();
    for target in db
        .get_active_daemon_targets(AppType::Kea, &["dhcp4", "dhcp6"])
        .await?
    {
        let daemon = db.get_daemon(target.daemon_id).await?;
        if !daemon.kea_config().is_some_and(|c| has_hook(c, LEASE_CMDS_HOOK)) {
            continue;
        }

        let mut leases = Vec::new();
        let mut erred = false;
        for command in query.commands(&target.daemon_name) {
            match agents.call_kea_daemon(&target, &command, cancel).await {
                Ok(response) => {
                    if let Some(arguments) = &response.arguments {
                        leases.extend(leases_from_arguments(&target, arguments));
                    }
                }
                Err(e) => {
                    warn!(daemon_id = target.daemon_id, command = %command.command, error = %e, "Lease lookup failed");
                    erred = true;
                }
            }
        }

        if erred && !result.erred_apps.iter().any(|a| a.id == target.app_id) {
            result.erred_apps.push(ErredApp {
                id: target.app_id,
                name: target.app_name.clone(),
            });
        }
        for lease in leases {
            if query == LeaseQuery::Declined && lease.state != STATE_DECLINED {
                continue;
            }
            let duplicate = result
                .items
                .iter()
                .any(|l| l.daemon_id == lease.daemon_id && l.ip_address == lease.ip_address);
            if !duplicate {
                result.items.push(lease);
            }
        }
    }

    result.total = i64::try_from(result.items.len()).unwrap_or(i64::MAX);
    Ok(result)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dhcp::command::RESULT_ERROR;
    use crate::test_helpers::kea_fixture;

    #[test]
    fn text_classification() {
        assert_eq!(
            LeaseQuery::parse(" 192.0.2.5 "),
            Some(LeaseQuery::Address("192.0.2.5".parse().unwrap()))
        );
        assert_eq!(
            LeaseQuery::parse("01-02-03-04-05-0A"),
            Some(LeaseQuery::HwAddress("01:02:03:04:05:0a".into()))
        );
        assert_eq!(
            LeaseQuery::parse("01:02:03"),
            Some(LeaseQuery::Identifier("01:02:03".into()))
        );
        assert_eq!(
            LeaseQuery::parse("STATE:declined"),
            Some(LeaseQuery::Declined)
        );
        assert_eq!(
            LeaseQuery::parse("printer"),
            Some(LeaseQuery::Hostname("printer".into()))
        );
        assert_eq!(LeaseQuery::parse("   "), None);
    }

    #[test]
    fn commands_follow_daemon_family() {
        let query = LeaseQuery::parse("2001:db8::5").unwrap();
        assert!(query.commands("dhcp4").is_empty());
        assert_eq!(query.commands("dhcp6")[0].command, "lease6-get");

        let names = |q: &LeaseQuery, d: &str| -> Vec<String> {
            q.commands(d).into_iter().map(|c| c.command).collect()
        };
        let hw = LeaseQuery::parse("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(
            names(&hw, "dhcp4"),
            vec!["lease4-get-by-hw-address", "lease4-get-by-client-id"]
        );
        assert_eq!(names(&hw, "dhcp6"), vec!["lease6-get-by-duid"]);
    }

    #[tokio::test]
    async fn address_search_collects_leases() {
        let fx = kea_fixture(2, &[LEASE_CMDS_HOOK]).await;
        fx.mock.set_arguments(
            "lease4-get",
            json!({"ip-address": "192.0.2.5", "hw-address": "aa:bb:cc:dd:ee:ff",
                   "hostname": "printer", "subnet-id": 7, "state": 0,
                   "valid-lft": 3600, "cltt": 1700000000}),
        );

        let result = search_leases(&fx.db, &fx.agents, "192.0.2.5", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.total, 2);
        assert_eq!(result.items[0].hostname, "printer");
        assert_eq!(result.items[0].subnet_id, 7);
        assert!(result.erred_apps.is_empty());
    }

    #[tokio::test]
    async fn daemons_without_lease_cmds_are_skipped() {
        let fx = kea_fixture(1, &[]).await;
        let result = search_leases(&fx.db, &fx.agents, "printer", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.total, 0);
        assert!(fx.mock.sent().is_empty());
    }

    #[tokio::test]
    async fn failing_app_reported() {
        let fx = kea_fixture(2, &[LEASE_CMDS_HOOK]).await;
        fx.mock.set_unreachable(fx.endpoint(1));
        fx.mock.set_arguments(
            "lease4-get-by-hostname",
            json!({"leases": [{"ip-address": "192.0.2.9", "hostname": "printer"}]}),
        );

        let result = search_leases(&fx.db, &fx.agents, "printer", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.erred_apps.len(), 1);
        assert_eq!(result.erred_apps[0].id, fx.apps[1].id);
    }

    #[tokio::test]
    async fn declined_search_keeps_declined_only() {
        let fx = kea_fixture(1, &[LEASE_CMDS_HOOK]).await;
        fx.mock.set_arguments(
            "lease4-get-by-hw-address",
            json!({"leases": [
                {"ip-address": "192.0.2.20", "hw-address": "00:00:00:00:00:00", "state": 1},
                {"ip-address": "192.0.2.21", "hw-address": "00:00:00:00:00:00", "state": 0}
            ]}),
        );

        let result = search_leases(&fx.db, &fx.agents, DECLINED_QUERY, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.items[0].ip_address, "192.0.2.20");
        assert_eq!(fx.mock.sent()[0].arguments, Some(json!({"hw-address": "00:00:00:00:00:00"})));
    }

    #[tokio::test]
    async fn daemon_error_marks_app_erred() {
        let fx = kea_fixture(1, &[LEASE_CMDS_HOOK]).await;
        fx.mock.fail_command("lease4-get", RESULT_ERROR, "boom");
        let result = search_leases(&fx.db, &fx.agents, "192.0.2.1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.total, 0);
        assert_eq!(result.erred_apps[0].name, fx.apps[0].name);
    }
}
