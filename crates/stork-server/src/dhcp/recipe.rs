//! Command synthesis for subnet and shared network changes.
//!
//! Kea offers no in-place update of a subnet or shared network, so an
//! update is a delete followed by an add. Every daemon's command list ends
//! with `config-write` so the change survives a daemon restart.

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::{Value, json};

use super::command::KeaCommand;
use super::options::{OptionError, validate_options};
use super::wire::{shared_network_to_kea, subnet_to_kea};
use crate::storage::{SharedNetwork, Subnet};

#[derive(Debug, thiserror::Error)]
pub enum KeaModuleError {
    #[error("{0} is not associated with any daemons")]
    NoDaemons(String),

    #[error("daemon {daemon_name} (id {daemon_id}) cannot serve an IPv{family} {resource}")]
    FamilyMismatch {
        daemon_id: i64,
        daemon_name: String,
        family: u8,
        resource: String,
    },

    #[error("invalid prefix {0}")]
    InvalidPrefix(String),

    #[error(transparent)]
    Option(#[from] OptionError),
}

/// The change a recipe performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    AddSubnet,
    UpdateSubnet,
    DeleteSubnet,
    AddSharedNetwork,
    UpdateSharedNetwork,
    DeleteSharedNetwork,
}

/// A subnet or shared network image.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
    Subnet(Subnet),
    SharedNetwork(SharedNetwork),
}

/// Commands for one daemon, in the order they must be sent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaemonCommands {
    pub daemon_id: i64,
    pub daemon_name: String,
    pub app_id: i64,
    pub commands: Vec<KeaCommand>,
}

/// A staged change: the commands to send and the images used to persist
/// the change once every daemon accepted it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigRecipe {
    pub intent: Intent,
    pub daemons: Vec<DaemonCommands>,
    pub pre_image: Option<Resource>,
    pub post_image: Option<Resource>,
    /// Id of the created subnet or shared network, set after writeback.
    pub created_id: Option<i64>,
}

impl ConfigRecipe {
    /// Total number of commands across all daemons.
    pub fn command_count(&self) -> usize {
        self.daemons.iter().map(|d| d.commands.len()).sum()
    }
}

/// Daemon identity carried by a local subnet or shared network.
struct Target<'a> {
    id: i64,
    name: &'a str,
    app_id: i64,
}

fn family_suffix(family: u8) -> &'static str {
    if family == 6 { "6" } else { "4" }
}

fn check_family(target: &Target<'_>, family: u8, resource: &str) -> Result<(), KeaModuleError> {
    let expected = if family == 6 { "dhcp6" } else { "dhcp4" };
    if target.name == expected {
        Ok(())
    } else {
        Err(KeaModuleError::FamilyMismatch {
            daemon_id: target.id,
            daemon_name: target.name.to_string(),
            family,
            resource: resource.to_string(),
        })
    }
}

fn subnet_targets(subnet: &Subnet) -> Vec<Target<'_>> {
    subnet
        .local_subnets
        .iter()
        .map(|l| Target {
            id: l.daemon_id,
            name: &l.daemon_name,
            app_id: l.app_id,
        })
        .collect()
}

fn network_targets(network: &SharedNetwork) -> Vec<Target<'_>> {
    network
        .local_shared_networks
        .iter()
        .map(|l| Target {
            id: l.daemon_id,
            name: &l.daemon_name,
            app_id: l.app_id,
        })
        .collect()
}

fn validate_subnet(subnet: &Subnet) -> Result<(), KeaModuleError> {
    if subnet.local_subnets.is_empty() {
        return Err(KeaModuleError::NoDaemons(format!("subnet {}", subnet.prefix)));
    }
    let family = subnet.family();
    for local in &subnet.local_subnets {
        validate_options(&local.options, family)?;
    }
    Ok(())
}

fn validate_network(network: &SharedNetwork) -> Result<(), KeaModuleError> {
    if network.local_shared_networks.is_empty() {
        return Err(KeaModuleError::NoDaemons(format!(
            "shared network {}",
            network.name
        )));
    }
    for local in &network.local_shared_networks {
        validate_options(&local.options, network.family)?;
    }
    for subnet in &network.subnets {
        if subnet.local_subnets.is_empty() {
            return Err(KeaModuleError::NoDaemons(format!(
                "subnet {} in shared network {}",
                subnet.prefix, network.name
            )));
        }
        for local in &subnet.local_subnets {
            validate_options(&local.options, network.family)?;
        }
    }
    Ok(())
}

fn subnet_add(subnet: &Subnet, daemon_id: i64, name: &str) -> Result<KeaCommand, KeaModuleError> {
    let family = subnet.family();
    let local = subnet
        .local_subnet(daemon_id)
        .ok_or_else(|| KeaModuleError::NoDaemons(format!("subnet {}", subnet.prefix)))?;
    Ok(KeaCommand::new(
        format!("subnet{}-add", family_suffix(family)),
        name,
        Some(json!({ format!("subnet{}", family_suffix(family)): [subnet_to_kea(subnet, local)?] })),
    ))
}

fn subnet_del(subnet: &Subnet, daemon_id: i64, name: &str) -> KeaCommand {
    let local_id = subnet
        .local_subnet(daemon_id)
        .map_or(0, |l| l.local_subnet_id);
    KeaCommand::new(
        format!("subnet{}-del", family_suffix(subnet.family())),
        name,
        Some(json!({"id": local_id})),
    )
}

fn network_add(
    network: &SharedNetwork,
    daemon_id: i64,
    name: &str,
) -> Result<KeaCommand, KeaModuleError> {
    let local = network
        .local_shared_networks
        .iter()
        .find(|l| l.daemon_id == daemon_id)
        .ok_or_else(|| KeaModuleError::NoDaemons(format!("shared network {}", network.name)))?;
    Ok(KeaCommand::new(
        format!("network{}-add", family_suffix(network.family)),
        name,
        Some(json!({"shared-networks": [shared_network_to_kea(network, local)?]})),
    ))
}

fn network_del(network: &SharedNetwork, name: &str) -> KeaCommand {
    KeaCommand::new(
        format!("network{}-del", family_suffix(network.family)),
        name,
        Some(json!({"name": network.name, "subnets-action": "delete"})),
    )
}

fn config_write(name: &str) -> KeaCommand {
    KeaCommand::new("config-write", name, None)
}

/// Recipe adding a new subnet to every daemon it lists.
pub fn add_subnet(subnet: &Subnet) -> Result<ConfigRecipe, KeaModuleError> {
    validate_subnet(subnet)?;
    let mut daemons = Vec::new();
    for target in subnet_targets(subnet) {
        check_family(&target, subnet.family(), "subnet")?;
        daemons.push(DaemonCommands {
            daemon_id: target.id,
            daemon_name: target.name.to_string(),
            app_id: target.app_id,
            commands: vec![subnet_add(subnet, target.id, target.name)?, config_write(target.name)],
        });
    }
    Ok(ConfigRecipe {
        intent: Intent::AddSubnet,
        daemons,
        pre_image: None,
        post_image: Some(Resource::Subnet(subnet.clone())),
        created_id: None,
    })
}

/// Recipe replacing a subnet.
///
/// Daemons present in both images get delete then add; daemons dropped
/// from the subnet only get the delete, new daemons only the add. Local
/// subnet ids missing from the new image are carried over from the old.
pub fn update_subnet(pre: &Subnet, post: &Subnet) -> Result<ConfigRecipe, KeaModuleError> {
    validate_subnet(post)?;
    let mut post = post.clone();
    post.id = pre.id;
    for local in &mut post.local_subnets {
        if local.local_subnet_id == 0
            && let Some(old) = pre.local_subnet(local.daemon_id)
        {
            local.local_subnet_id = old.local_subnet_id;
        }
    }

    let mut daemons = Vec::new();
    let mut seen = BTreeSet::new();
    for target in subnet_targets(pre).into_iter().chain(subnet_targets(&post)) {
        if !seen.insert(target.id) {
            continue;
        }
        let mut commands = Vec::new();
        if pre.local_subnet(target.id).is_some() {
            commands.push(subnet_del(pre, target.id, target.name));
        }
        if post.local_subnet(target.id).is_some() {
            check_family(&target, post.family(), "subnet")?;
            commands.push(subnet_add(&post, target.id, target.name)?);
        }
        commands.push(config_write(target.name));
        daemons.push(DaemonCommands {
            daemon_id: target.id,
            daemon_name: target.name.to_string(),
            app_id: target.app_id,
            commands,
        });
    }
    Ok(ConfigRecipe {
        intent: Intent::UpdateSubnet,
        daemons,
        pre_image: Some(Resource::Subnet(pre.clone())),
        post_image: Some(Resource::Subnet(post)),
        created_id: None,
    })
}

/// Recipe deleting a subnet from every daemon serving it.
pub fn delete_subnet(subnet: &Subnet) -> Result<ConfigRecipe, KeaModuleError> {
    if subnet.local_subnets.is_empty() {
        return Err(KeaModuleError::NoDaemons(format!("subnet {}", subnet.prefix)));
    }
    let daemons = subnet_targets(subnet)
        .into_iter()
        .map(|target| DaemonCommands {
            daemon_id: target.id,
            daemon_name: target.name.to_string(),
            app_id: target.app_id,
            commands: vec![subnet_del(subnet, target.id, target.name), config_write(target.name)],
        })
        .collect();
    Ok(ConfigRecipe {
        intent: Intent::DeleteSubnet,
        daemons,
        pre_image: Some(Resource::Subnet(subnet.clone())),
        post_image: None,
        created_id: None,
    })
}

/// Recipe adding a shared network with its subnets.
pub fn add_shared_network(network: &SharedNetwork) -> Result<ConfigRecipe, KeaModuleError> {
    validate_network(network)?;
    let mut daemons = Vec::new();
    for target in network_targets(network) {
        check_family(&target, network.family, "shared network")?;
        daemons.push(DaemonCommands {
            daemon_id: target.id,
            daemon_name: target.name.to_string(),
            app_id: target.app_id,
            commands: vec![
                network_add(network, target.id, target.name)?,
                config_write(target.name),
            ],
        });
    }
    Ok(ConfigRecipe {
        intent: Intent::AddSharedNetwork,
        daemons,
        pre_image: None,
        post_image: Some(Resource::SharedNetwork(network.clone())),
        created_id: None,
    })
}

/// Recipe replacing a shared network. The old network is deleted together
/// with its subnets and the new one added with the subnets it lists.
pub fn update_shared_network(
    pre: &SharedNetwork,
    post: &SharedNetwork,
) -> Result<ConfigRecipe, KeaModuleError> {
    validate_network(post)?;
    let mut post = post.clone();
    post.id = pre.id;
    for subnet in &mut post.subnets {
        if let Some(old) = pre.subnets.iter().find(|s| s.prefix == subnet.prefix) {
            if subnet.id == 0 {
                subnet.id = old.id;
            }
            for local in &mut subnet.local_subnets {
                if local.local_subnet_id == 0
                    && let Some(old_local) = old.local_subnet(local.daemon_id)
                {
                    local.local_subnet_id = old_local.local_subnet_id;
                }
            }
        }
    }

    let mut daemons = Vec::new();
    let mut seen = BTreeSet::new();
    for target in network_targets(pre).into_iter().chain(network_targets(&post)) {
        if !seen.insert(target.id) {
            continue;
        }
        let mut commands = Vec::new();
        if pre.daemon_ids().contains(&target.id) {
            commands.push(network_del(pre, target.name));
        }
        if post.daemon_ids().contains(&target.id) {
            check_family(&target, post.family, "shared network")?;
            commands.push(network_add(&post, target.id, target.name)?);
        }
        commands.push(config_write(target.name));
        daemons.push(DaemonCommands {
            daemon_id: target.id,
            daemon_name: target.name.to_string(),
            app_id: target.app_id,
            commands,
        });
    }
    Ok(ConfigRecipe {
        intent: Intent::UpdateSharedNetwork,
        daemons,
        pre_image: Some(Resource::SharedNetwork(pre.clone())),
        post_image: Some(Resource::SharedNetwork(post)),
        created_id: None,
    })
}

/// Recipe deleting a shared network and its subnets.
pub fn delete_shared_network(network: &SharedNetwork) -> Result<ConfigRecipe, KeaModuleError> {
    if network.local_shared_networks.is_empty() {
        return Err(KeaModuleError::NoDaemons(format!(
            "shared network {}",
            network.name
        )));
    }
    let daemons = network_targets(network)
        .into_iter()
        .map(|target| DaemonCommands {
            daemon_id: target.id,
            daemon_name: target.name.to_string(),
            app_id: target.app_id,
            commands: vec![network_del(network, target.name), config_write(target.name)],
        })
        .collect();
    Ok(ConfigRecipe {
        intent: Intent::DeleteSharedNetwork,
        daemons,
        pre_image: Some(Resource::SharedNetwork(network.clone())),
        post_image: None,
        created_id: None,
    })
}

/// Daemon-assigned subnet id from a `subnet4-add`/`subnet6-add` response.
pub fn created_subnet_id(arguments: Option<&Value>) -> Option<i64> {
    arguments?
        .get("subnets")?
        .as_array()?
        .first()?
        .get("id")?
        .as_i64()
}
