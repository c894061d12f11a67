//! Kea control commands and their responses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::storage::{HostIdentifier, HostUpdate};

/// Kea result code for success.
pub const RESULT_SUCCESS: i64 = 0;
/// Kea result code for an error.
pub const RESULT_ERROR: i64 = 1;
/// Kea result code for an unsupported command.
pub const RESULT_UNSUPPORTED: i64 = 2;
/// Kea result code for "no data", e.g. an empty lease lookup.
pub const RESULT_EMPTY: i64 = 3;

/// A command sent to Kea through its control agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeaCommand {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl KeaCommand {
    /// Command addressed to one daemon.
    pub fn new(command: impl Into<String>, daemon_name: &str, arguments: Option<Value>) -> Self {
        Self {
            command: command.into(),
            service: vec![daemon_name.to_string()],
            arguments,
        }
    }
}

/// One daemon's answer to a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeaResponse {
    pub result: i64,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub arguments: Option<Value>,
}

impl KeaResponse {
    pub fn success(arguments: Option<Value>) -> Self {
        Self {
            result: RESULT_SUCCESS,
            text: None,
            arguments,
        }
    }

    pub fn error(result: i64, text: impl Into<String>) -> Self {
        Self {
            result,
            text: Some(text.into()),
            arguments: None,
        }
    }

    /// Success or "empty"; both carry usable (possibly absent) arguments.
    pub const fn is_ok(&self) -> bool {
        self.result == RESULT_SUCCESS || self.result == RESULT_EMPTY
    }

    pub fn text_or_default(&self) -> &str {
        self.text.as_deref().unwrap_or("no error text")
    }
}

/// Runtime status reported by `status-get`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonStatus {
    pub pid: i64,
    pub uptime: i64,
    /// Seconds since the last reconfiguration.
    pub reload: Option<i64>,
    pub ha_state: Option<String>,
}

impl DaemonStatus {
    pub fn from_arguments(arguments: &Value) -> Self {
        let ha_state = arguments
            .get("high-availability")
            .and_then(Value::as_array)
            .and_then(|ha| ha.first())
            .and_then(|ha| ha.pointer("/ha-servers/local/state"))
            .and_then(Value::as_str)
            .map(ToString::to_string);
        Self {
            pid: arguments.get("pid").and_then(Value::as_i64).unwrap_or(0),
            uptime: arguments.get("uptime").and_then(Value::as_i64).unwrap_or(0),
            reload: arguments.get("reload").and_then(Value::as_i64),
            ha_state,
        }
    }
}

/// Group `statistic-get-all` output by local subnet id.
///
/// Kea reports `subnet[N].name: [[value, timestamp], ...]`; the latest
/// sample of each subnet-level statistic is kept. Pool-level statistics
/// (`subnet[N].pool[M].name`) are skipped.
pub fn subnet_stats(arguments: &Value) -> BTreeMap<i64, Map<String, Value>> {
    let mut out: BTreeMap<i64, Map<String, Value>> = BTreeMap::new();
    let Some(stats) = arguments.as_object() else {
        return out;
    };
    for (key, samples) in stats {
        let Some(rest) = key.strip_prefix("subnet[") else {
            continue;
        };
        let Some((id, name)) = rest.split_once("].") else {
            continue;
        };
        if name.contains('[') {
            continue;
        }
        let Ok(id) = id.parse::<i64>() else {
            continue;
        };
        let value = samples
            .as_array()
            .and_then(|s| s.first())
            .and_then(Value::as_array)
            .and_then(|sample| sample.first())
            .cloned()
            .unwrap_or(Value::Null);
        out.entry(id).or_default().insert(name.to_string(), value);
    }
    out
}

/// Identifier types a Kea reservation may carry.
pub const HOST_IDENTIFIER_TYPES: &[&str] =
    &["hw-address", "duid", "client-id", "circuit-id", "flex-id"];

/// Convert a Kea reservation into a host. Returns the daemon-local subnet
/// id (0 or absent means a global reservation) alongside the host, whose
/// `subnet_id` is left unset for the caller to resolve.
pub fn parse_reservation(entry: &Value) -> Option<(Option<i64>, HostUpdate)> {
    let identifiers: Vec<HostIdentifier> = HOST_IDENTIFIER_TYPES
        .iter()
        .filter_map(|t| {
            entry.get(*t).and_then(Value::as_str).map(|v| HostIdentifier {
                id_type: (*t).to_string(),
                value: v.to_lowercase(),
            })
        })
        .collect();
    if identifiers.is_empty() {
        return None;
    }

    let mut reserved_addresses = Vec::new();
    if let Some(addr) = entry.get("ip-address").and_then(Value::as_str) {
        reserved_addresses.push(addr.to_string());
    }
    for key in ["ip-addresses", "prefixes"] {
        if let Some(list) = entry.get(key).and_then(Value::as_array) {
            reserved_addresses.extend(list.iter().filter_map(Value::as_str).map(ToString::to_string));
        }
    }

    let local_subnet_id = entry
        .get("subnet-id")
        .and_then(Value::as_i64)
        .filter(|id| *id > 0);
    Some((
        local_subnet_id,
        HostUpdate {
            subnet_id: None,
            hostname: entry
                .get("hostname")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            identifiers,
            reserved_addresses,
        },
    ))
}
