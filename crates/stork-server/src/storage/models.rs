//! Data models for Stork server storage.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;

use crate::dhcp::options::DhcpOption;
use crate::dhcp::params::KeaParameters;

// =========================================================================
// Paging
// =========================================================================

/// Sort direction of a paged query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl SortDir {
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Escape `LIKE` wildcards so `text` matches literally under `ESCAPE '\'`.
pub fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Common paging and filtering arguments of list queries.
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub offset: i64,
    pub limit: i64,
    pub filter_text: Option<String>,
    pub sort_field: Option<String>,
    pub sort_dir: SortDir,
}

impl PageRequest {
    pub fn new(offset: i64, limit: i64) -> Self {
        Self {
            offset,
            limit,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        self.filter_text = (!text.is_empty()).then_some(text);
        self
    }

    /// `%text%` pattern for `LIKE ... ESCAPE '\'` filters, or `%` when no
    /// text is set. Wildcards in the text match literally.
    pub fn like_pattern(&self) -> String {
        self.filter_text.as_deref().map_or_else(
            || "%".to_string(),
            |t| format!("%{}%", escape_like(&t.to_lowercase())),
        )
    }

    /// Effective limit; non-positive limits mean "no limit".
    pub const fn sql_limit(&self) -> i64 {
        if self.limit > 0 { self.limit } else { -1 }
    }

    pub const fn sql_offset(&self) -> i64 {
        if self.offset > 0 { self.offset } else { 0 }
    }
}

/// One page of a list query. `total` counts the whole filtered set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}

// =========================================================================
// Machines and apps
// =========================================================================

/// Host state reported by the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MachineState {
    pub agent_version: String,
    pub hostname: String,
    pub os: String,
    pub platform: String,
    pub platform_version: String,
    pub kernel_version: String,
    pub cpus: i64,
    pub cpus_load: String,
    pub memory: i64,
    pub used_memory: i64,
    pub uptime: i64,
    pub virtualization_role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: i64,
    pub address: String,
    pub agent_port: i64,
    pub authorized: bool,
    pub cert_fingerprint: Option<String>,
    pub state: Json<MachineState>,
    pub error: Option<String>,
    pub last_visited_at: Option<i64>,
    pub created_at: i64,
    #[sqlx(skip)]
    pub apps: Vec<App>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AppType {
    Kea,
    Bind9,
}

impl AppType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Kea => "kea",
            Self::Bind9 => "bind9",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AccessPointKind {
    Control,
    Statistics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AccessPoint {
    #[serde(default)]
    pub app_id: i64,
    #[serde(default)]
    pub machine_id: i64,
    pub kind: AccessPointKind,
    pub address: String,
    pub port: i64,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub use_secure_protocol: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct App {
    pub id: i64,
    pub machine_id: i64,
    pub app_type: AppType,
    pub name: String,
    pub active: bool,
    pub version: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[sqlx(skip)]
    pub access_points: Vec<AccessPoint>,
    #[sqlx(skip)]
    pub daemons: Vec<Daemon>,
}

impl App {
    pub fn access_point(&self, kind: AccessPointKind) -> Option<&AccessPoint> {
        self.access_points.iter().find(|ap| ap.kind == kind)
    }
}

/// Logging target of a daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogTarget {
    pub logger: String,
    pub severity: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Daemon {
    pub id: i64,
    pub app_id: i64,
    pub name: String,
    pub pid: i64,
    pub active: bool,
    pub monitored: bool,
    pub version: String,
    pub extended_version: String,
    pub reloaded_at: Option<i64>,
    pub uptime: i64,
    pub log_targets: Json<Vec<LogTarget>>,
    #[serde(skip_serializing)]
    pub kea_config: Option<Json<Value>>,
    pub kea_config_hash: Option<String>,
    pub kea_ha_state: Option<String>,
    pub bind9_stats: Option<Json<Value>>,
    pub created_at: i64,
}

impl Daemon {
    /// True for Kea DHCPv4 and DHCPv6 servers.
    pub fn is_dhcp(&self) -> bool {
        matches!(self.name.as_str(), "dhcp4" | "dhcp6")
    }

    pub fn kea_config(&self) -> Option<&Value> {
        self.kea_config.as_ref().map(|c| &c.0)
    }
}

/// Daemon state reported by a refresh, applied by `add_app`/`update_app`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonUpdate {
    pub name: String,
    pub pid: i64,
    pub active: bool,
    pub version: String,
    pub extended_version: String,
    pub uptime: i64,
    pub reloaded_at: Option<i64>,
    pub log_targets: Vec<LogTarget>,
}

/// An app as discovered on a machine, before it has an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppUpdate {
    pub machine_id: i64,
    pub app_type: AppType,
    pub name: String,
    pub active: bool,
    pub version: String,
    pub access_points: Vec<AccessPoint>,
    pub daemons: Vec<DaemonUpdate>,
}

/// Everything needed to reach a daemon through its agent.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DaemonTarget {
    pub daemon_id: i64,
    pub daemon_name: String,
    pub active: bool,
    pub app_id: i64,
    pub app_name: String,
    pub app_type: AppType,
    pub machine_id: i64,
    pub machine_address: String,
    pub agent_port: i64,
    pub authorized: bool,
    pub control_address: Option<String>,
    pub control_port: Option<i64>,
    pub control_use_tls: Option<bool>,
    pub statistics_address: Option<String>,
    pub statistics_port: Option<i64>,
}

/// Short description of a daemon, used in references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DaemonRef {
    pub id: i64,
    pub name: String,
    pub app_id: i64,
    pub app_name: String,
    pub app_type: AppType,
}

// =========================================================================
// Subnets and shared networks
// =========================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AddressPool {
    pub lower_bound: String,
    pub upper_bound: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PrefixPool {
    pub prefix: String,
    pub delegated_len: i64,
    #[serde(default)]
    pub excluded_prefix: Option<String>,
}

/// Per-daemon projection of a subnet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSubnet {
    pub daemon_id: i64,
    #[serde(default)]
    pub daemon_name: String,
    #[serde(default)]
    pub app_id: i64,
    #[serde(default)]
    pub app_name: String,
    /// Subnet id assigned in the daemon's configuration.
    #[serde(default)]
    pub local_subnet_id: i64,
    #[serde(default)]
    pub kea_parameters: KeaParameters,
    #[serde(default)]
    pub options: Vec<DhcpOption>,
    #[serde(default)]
    pub option_set_hash: String,
    #[serde(default)]
    pub address_pools: Vec<AddressPool>,
    #[serde(default)]
    pub prefix_pools: Vec<PrefixPool>,
    #[serde(default, skip_deserializing)]
    pub stats: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subnet {
    #[serde(default)]
    pub id: i64,
    pub prefix: String,
    #[serde(default)]
    pub shared_network_id: Option<i64>,
    #[serde(default)]
    pub shared_network_name: Option<String>,
    #[serde(default)]
    pub client_class: Option<String>,
    #[serde(default)]
    pub local_subnets: Vec<LocalSubnet>,
}

impl Subnet {
    /// 6 for IPv6 prefixes, 4 otherwise.
    pub fn family(&self) -> u8 {
        if self.prefix.contains(':') { 6 } else { 4 }
    }

    pub fn local_subnet(&self, daemon_id: i64) -> Option<&LocalSubnet> {
        self.local_subnets.iter().find(|ls| ls.daemon_id == daemon_id)
    }

    pub fn daemon_ids(&self) -> Vec<i64> {
        self.local_subnets.iter().map(|ls| ls.daemon_id).collect()
    }
}

/// Per-daemon projection of a shared network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSharedNetwork {
    pub daemon_id: i64,
    #[serde(default)]
    pub daemon_name: String,
    #[serde(default)]
    pub app_id: i64,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub kea_parameters: KeaParameters,
    #[serde(default)]
    pub options: Vec<DhcpOption>,
    #[serde(default)]
    pub option_set_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedNetwork {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub family: u8,
    #[serde(default)]
    pub local_shared_networks: Vec<LocalSharedNetwork>,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
}

impl SharedNetwork {
    pub fn daemon_ids(&self) -> Vec<i64> {
        self.local_shared_networks
            .iter()
            .map(|l| l.daemon_id)
            .collect()
    }
}

// =========================================================================
// Hosts
// =========================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostIdentifier {
    pub id_type: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum HostDataSource {
    Config,
    Api,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LocalHost {
    pub host_id: i64,
    pub daemon_id: i64,
    pub data_source: HostDataSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: i64,
    pub subnet_id: Option<i64>,
    pub hostname: String,
    pub identifiers: Json<Vec<HostIdentifier>>,
    pub reserved_addresses: Json<Vec<String>>,
    #[serde(skip)]
    pub host_key: String,
    pub created_at: i64,
    #[sqlx(skip)]
    pub local_hosts: Vec<LocalHost>,
}

/// A reservation as read from a daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostUpdate {
    pub subnet_id: Option<i64>,
    pub hostname: String,
    pub identifiers: Vec<HostIdentifier>,
    pub reserved_addresses: Vec<String>,
}

impl HostUpdate {
    /// Key identifying a reservation across daemons.
    pub fn host_key(&self) -> String {
        let ids = self
            .identifiers
            .iter()
            .map(|i| format!("{}={}", i.id_type, i.value.to_lowercase()))
            .collect::<Vec<_>>()
            .join(",");
        format!("{}|{ids}", self.subnet_id.unwrap_or(0))
    }
}

// =========================================================================
// Users, settings and events
// =========================================================================

/// Reserved group ids.
pub const SUPER_ADMIN_GROUP_ID: i64 = 1;
pub const ADMIN_GROUP_ID: i64 = 2;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SystemUser {
    pub id: i64,
    pub login: String,
    pub email: Option<String>,
    pub name: String,
    pub lastname: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: i64,
    #[sqlx(skip)]
    pub groups: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SystemGroup {
    pub id: i64,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Setting {
    pub name: String,
    pub value_type: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: i64,
    pub created_at: i64,
    pub level: EventLevel,
    pub text: String,
    pub details: String,
    pub machine_id: Option<i64>,
    pub app_id: Option<i64>,
    pub daemon_id: Option<i64>,
    pub user_id: Option<i64>,
}

/// Event about to be recorded.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub level: EventLevel,
    pub text: String,
    pub details: String,
    pub machine_id: Option<i64>,
    pub app_id: Option<i64>,
    pub daemon_id: Option<i64>,
    pub user_id: Option<i64>,
}

impl NewEvent {
    pub fn new(level: EventLevel, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
            details: String::new(),
            machine_id: None,
            app_id: None,
            daemon_id: None,
            user_id: None,
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(EventLevel::Info, text)
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self::new(EventLevel::Warning, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(EventLevel::Error, text)
    }

    #[must_use]
    pub const fn machine(mut self, id: i64) -> Self {
        self.machine_id = Some(id);
        self
    }

    #[must_use]
    pub const fn app(mut self, id: i64) -> Self {
        self.app_id = Some(id);
        self
    }

    #[must_use]
    pub const fn daemon(mut self, id: i64) -> Self {
        self.daemon_id = Some(id);
        self
    }

    #[must_use]
    pub const fn user(mut self, id: i64) -> Self {
        self.user_id = Some(id);
        self
    }

    #[must_use]
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

// =========================================================================
// Configuration review
// =========================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ConfigReview {
    pub id: i64,
    pub daemon_id: i64,
    pub config_hash: String,
    pub signature: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ConfigReport {
    pub id: i64,
    pub config_review_id: i64,
    pub daemon_id: i64,
    pub checker_name: String,
    pub content: Option<String>,
    pub created_at: i64,
    /// Daemons referenced by `{daemon}` placeholders, in placeholder order.
    #[sqlx(skip)]
    pub ref_daemons: Vec<DaemonRef>,
}

/// A report produced by a checker, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConfigReport {
    pub checker_name: String,
    pub content: Option<String>,
    pub ref_daemon_ids: Vec<i64>,
}

// =========================================================================
// Zones
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ZoneInventoryStatus {
    Uninitialized,
    Busy,
    Erred,
    Ok,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ZoneInventoryState {
    pub daemon_id: i64,
    pub app_id: i64,
    pub status: ZoneInventoryStatus,
    pub error: Option<String>,
    pub zone_count: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LocalZone {
    pub zone_id: i64,
    pub daemon_id: i64,
    pub app_id: i64,
    pub app_name: String,
    pub view: String,
    pub class: String,
    pub serial: i64,
    pub zone_type: String,
    pub loaded_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub id: i64,
    pub name: String,
    pub rname: String,
    pub created_at: i64,
    #[sqlx(skip)]
    pub local_zones: Vec<LocalZone>,
}

/// A zone record streamed from an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneRecord {
    pub name: String,
    #[serde(default = "default_view")]
    pub view: String,
    #[serde(default = "default_class")]
    pub class: String,
    #[serde(default)]
    pub serial: i64,
    #[serde(rename = "type", default)]
    pub zone_type: String,
    #[serde(default)]
    pub loaded: i64,
}

fn default_view() -> String {
    "_default".to_string()
}

fn default_class() -> String {
    "IN".to_string()
}

/// Zone name with labels reversed, for suffix matching.
///
/// `www.example.org.` becomes `org.example.www`.
pub fn reverse_zone_name(name: &str) -> String {
    let trimmed = name.trim_end_matches('.').to_lowercase();
    let mut labels: Vec<&str> = trimmed.split('.').collect();
    labels.reverse();
    labels.join(".")
}

/// Filters of the zone list.
#[derive(Debug, Clone, Default)]
pub struct ZoneFilter {
    pub app_id: Option<i64>,
    pub app_type: Option<AppType>,
    pub class: Option<String>,
    pub serial: Option<i64>,
    pub zone_type: Option<String>,
}
