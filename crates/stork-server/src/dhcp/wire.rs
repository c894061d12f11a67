//! Conversion between Kea configuration JSON and the network models.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use serde_json::{Map, Value, json};

use super::options::{flatten_options, unflatten_options};
use super::params::KeaParameters;
use crate::dhcp::recipe::KeaModuleError;
use crate::storage::{
    AddressPool, Daemon, LocalSharedNetwork, LocalSubnet, PrefixPool, SharedNetwork, Subnet,
};

/// Hook libraries the server relies on.
pub const SUBNET_CMDS_HOOK: &str = "libdhcp_subnet_cmds";
pub const HOST_CMDS_HOOK: &str = "libdhcp_host_cmds";
pub const STAT_CMDS_HOOK: &str = "libdhcp_stat_cmds";
pub const LEASE_CMDS_HOOK: &str = "libdhcp_lease_cmds";

/// Top-level key of a daemon's configuration (`Dhcp4` or `Dhcp6`).
pub fn root_key(daemon_name: &str) -> &'static str {
    if daemon_name == "dhcp6" { "Dhcp6" } else { "Dhcp4" }
}

/// Option space of a family.
pub const fn option_space(family: u8) -> &'static str {
    if family == 6 { "dhcp6" } else { "dhcp4" }
}

/// Whether the configuration loads a hook library whose path contains `hook`.
pub fn has_hook(config: &Value, hook: &str) -> bool {
    ["Dhcp4", "Dhcp6"].iter().any(|root| {
        config
            .get(*root)
            .and_then(|r| r.get("hooks-libraries"))
            .and_then(Value::as_array)
            .is_some_and(|libs| {
                libs.iter().any(|lib| {
                    lib.get("library")
                        .and_then(Value::as_str)
                        .is_some_and(|path| path.contains(hook))
                })
            })
    })
}

/// Kea JSON of a subnet as one daemon sees it.
///
/// The `id` is left out when the daemon has not assigned one yet; pools,
/// prefix pools and option data are only present when non-empty.
pub fn subnet_to_kea(subnet: &Subnet, local: &LocalSubnet) -> Result<Value, KeaModuleError> {
    let mut object = Map::new();
    if local.local_subnet_id > 0 {
        object.insert("id".into(), json!(local.local_subnet_id));
    }
    object.insert("subnet".into(), Value::String(subnet.prefix.clone()));
    if let Some(name) = &subnet.shared_network_name {
        object.insert("shared-network-name".into(), Value::String(name.clone()));
    }
    if let Some(class) = &subnet.client_class
        && local.kea_parameters.client_class.is_none()
    {
        object.insert("client-class".into(), Value::String(class.clone()));
    }
    local.kea_parameters.write_into(&mut object);

    if !local.address_pools.is_empty() {
        let pools = local
            .address_pools
            .iter()
            .map(|p| json!({"pool": format!("{}-{}", p.lower_bound, p.upper_bound)}))
            .collect();
        object.insert("pools".into(), Value::Array(pools));
    }
    if !local.prefix_pools.is_empty() {
        let pools = local
            .prefix_pools
            .iter()
            .map(prefix_pool_to_kea)
            .collect::<Result<Vec<_>, _>>()?;
        object.insert("pd-pools".into(), Value::Array(pools));
    }
    if !local.options.is_empty() {
        object.insert(
            "option-data".into(),
            Value::Array(flatten_options(&local.options)),
        );
    }
    Ok(Value::Object(object))
}

fn prefix_pool_to_kea(pool: &PrefixPool) -> Result<Value, KeaModuleError> {
    let (prefix, len) = split_prefix(&pool.prefix)?;
    let mut object = Map::new();
    object.insert("prefix".into(), Value::String(prefix));
    object.insert("prefix-len".into(), json!(len));
    object.insert("delegated-len".into(), json!(pool.delegated_len));
    if let Some(excluded) = &pool.excluded_prefix {
        let (prefix, len) = split_prefix(excluded)?;
        object.insert("excluded-prefix".into(), Value::String(prefix));
        object.insert("excluded-prefix-len".into(), json!(len));
    }
    Ok(Value::Object(object))
}

fn split_prefix(prefix: &str) -> Result<(String, u8), KeaModuleError> {
    let network: IpNetwork = prefix
        .parse()
        .map_err(|_| KeaModuleError::InvalidPrefix(prefix.to_string()))?;
    Ok((network.ip().to_string(), network.prefix()))
}

/// Kea JSON of a shared network as one daemon sees it, including the
/// member subnets that daemon serves.
pub fn shared_network_to_kea(
    network: &SharedNetwork,
    local: &LocalSharedNetwork,
) -> Result<Value, KeaModuleError> {
    let mut object = Map::new();
    object.insert("name".into(), Value::String(network.name.clone()));
    local.kea_parameters.write_into(&mut object);

    let mut subnets = Vec::new();
    for subnet in &network.subnets {
        if let Some(local_subnet) = subnet.local_subnet(local.daemon_id) {
            // Membership is expressed by nesting.
            let mut member = subnet.clone();
            member.shared_network_name = None;
            subnets.push(subnet_to_kea(&member, local_subnet)?);
        }
    }
    let key = if network.family == 6 { "subnet6" } else { "subnet4" };
    object.insert(key.into(), Value::Array(subnets));

    if !local.options.is_empty() {
        object.insert(
            "option-data".into(),
            Value::Array(flatten_options(&local.options)),
        );
    }
    Ok(Value::Object(object))
}

/// Subnets and shared networks found in a daemon's configuration, as
/// projections of that one daemon. Subnets inside shared networks are
/// returned nested in their network.
pub fn networks_from_config(daemon: &Daemon, config: &Value) -> (Vec<SharedNetwork>, Vec<Subnet>) {
    let family: u8 = if daemon.name == "dhcp6" { 6 } else { 4 };
    let Some(root) = config.get(root_key(&daemon.name)) else {
        return (Vec::new(), Vec::new());
    };
    let subnet_key = if family == 6 { "subnet6" } else { "subnet4" };

    let mut networks = Vec::new();
    for entry in root
        .get("shared-networks")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let Some(object) = entry.as_object() else {
            continue;
        };
        let Some(name) = object.get("name").and_then(Value::as_str) else {
            continue;
        };
        let subnets = object
            .get(subnet_key)
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|s| subnet_from_kea(daemon, s, family, Some(name)))
            .collect();
        networks.push(SharedNetwork {
            id: 0,
            name: name.to_string(),
            family,
            local_shared_networks: vec![LocalSharedNetwork {
                daemon_id: daemon.id,
                daemon_name: daemon.name.clone(),
                app_id: daemon.app_id,
                app_name: String::new(),
                kea_parameters: KeaParameters::from_kea_object(&strip_nested(object)),
                options: options_from_kea(object, family),
                option_set_hash: String::new(),
            }],
            subnets,
        });
    }

    let subnets = root
        .get(subnet_key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|s| subnet_from_kea(daemon, s, family, None))
        .collect();

    (networks, subnets)
}

fn subnet_from_kea(
    daemon: &Daemon,
    entry: &Value,
    family: u8,
    shared_network: Option<&str>,
) -> Option<Subnet> {
    let object = entry.as_object()?;
    let prefix = object.get("subnet").and_then(Value::as_str)?;
    let prefix = prefix
        .parse::<IpNetwork>()
        .map_or_else(|_| prefix.to_string(), |n| canonical_prefix(&n));

    let address_pools = object
        .get("pools")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|p| p.get("pool").and_then(Value::as_str))
        .filter_map(parse_pool)
        .collect();
    let prefix_pools = object
        .get("pd-pools")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(parse_pd_pool)
        .collect();

    Some(Subnet {
        id: 0,
        prefix,
        shared_network_id: None,
        shared_network_name: shared_network.map(ToString::to_string),
        client_class: object
            .get("client-class")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        local_subnets: vec![LocalSubnet {
            daemon_id: daemon.id,
            daemon_name: daemon.name.clone(),
            app_id: daemon.app_id,
            app_name: String::new(),
            local_subnet_id: object.get("id").and_then(Value::as_i64).unwrap_or(0),
            kea_parameters: KeaParameters::from_kea_object(&strip_nested(object)),
            options: options_from_kea(object, family),
            option_set_hash: String::new(),
            address_pools,
            prefix_pools,
            stats: None,
        }],
    })
}

/// Keys handled outside of [`KeaParameters`].
fn strip_nested(object: &Map<String, Value>) -> Map<String, Value> {
    object
        .iter()
        .filter(|(k, _)| {
            !matches!(
                k.as_str(),
                "subnet4" | "subnet6" | "pools" | "pd-pools" | "option-data" | "reservations"
            )
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn options_from_kea(object: &Map<String, Value>, family: u8) -> Vec<super::options::DhcpOption> {
    object
        .get("option-data")
        .and_then(Value::as_array)
        .map(|entries| unflatten_options(entries, option_space(family)))
        .unwrap_or_default()
}

/// Network address and length in canonical notation.
pub fn canonical_prefix(network: &IpNetwork) -> String {
    format!("{}/{}", network_address(network), network.prefix())
}

fn network_address(network: &IpNetwork) -> IpAddr {
    network.network()
}

fn last_address(network: &IpNetwork) -> IpAddr {
    match (network.network(), network.mask()) {
        (IpAddr::V4(net), IpAddr::V4(mask)) => IpAddr::V4((u32::from(net) | !u32::from(mask)).into()),
        (IpAddr::V6(net), IpAddr::V6(mask)) => {
            IpAddr::V6((u128::from(net) | !u128::from(mask)).into())
        }
        (net, _) => net,
    }
}

/// Parse a Kea pool, either `lower-upper` or a prefix.
pub fn parse_pool(pool: &str) -> Option<AddressPool> {
    if let Some((lower, upper)) = pool.split_once('-') {
        let lower: IpAddr = lower.trim().parse().ok()?;
        let upper: IpAddr = upper.trim().parse().ok()?;
        return Some(AddressPool {
            lower_bound: lower.to_string(),
            upper_bound: upper.to_string(),
        });
    }
    let network: IpNetwork = pool.trim().parse().ok()?;
    Some(AddressPool {
        lower_bound: network_address(&network).to_string(),
        upper_bound: last_address(&network).to_string(),
    })
}

fn parse_pd_pool(entry: &Value) -> Option<PrefixPool> {
    let prefix = entry.get("prefix").and_then(Value::as_str)?;
    let len = entry.get("prefix-len").and_then(Value::as_i64)?;
    let delegated_len = entry.get("delegated-len").and_then(Value::as_i64)?;
    let excluded_prefix = entry
        .get("excluded-prefix")
        .and_then(Value::as_str)
        .zip(entry.get("excluded-prefix-len").and_then(Value::as_i64))
        .map(|(p, l)| format!("{p}/{l}"));
    Some(PrefixPool {
        prefix: format!("{prefix}/{len}"),
        delegated_len,
        excluded_prefix,
    })
}

/// Reservations declared in a daemon's configuration, paired with the
/// daemon-local id of the subnet declaring them (absent for globals).
pub fn reservations_from_config(
    daemon_name: &str,
    config: &Value,
) -> Vec<(Option<i64>, crate::storage::HostUpdate)> {
    let Some(root) = config.get(root_key(daemon_name)) else {
        return Vec::new();
    };
    let subnet_key = if daemon_name == "dhcp6" { "subnet6" } else { "subnet4" };
    let mut out: Vec<_> = root
        .get("reservations")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(super::command::parse_reservation)
        .map(|(_, host)| (None, host))
        .collect();

    let nested = root
        .get("shared-networks")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|n| n.get(subnet_key).and_then(Value::as_array))
        .flatten();
    let top = root
        .get(subnet_key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten();
    for subnet in top.chain(nested) {
        let local_id = subnet.get("id").and_then(Value::as_i64);
        for entry in subnet
            .get("reservations")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let Some((_, host)) = super::command::parse_reservation(entry) {
                out.push((local_id, host));
            }
        }
    }
    out
}
