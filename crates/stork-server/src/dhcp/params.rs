//! Kea-specific parameters of subnets and shared networks.
//!
//! Field names follow Kea's configuration keys so the same structure is
//! used for parsing daemon configurations, building commands and for the
//! REST payloads.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Relay agent settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Relay {
    #[serde(default)]
    pub ip_addresses: Vec<String>,
}

/// Parameters a Kea daemon attaches to a subnet or shared network.
///
/// Every field is optional; unset fields are left out of the commands so
/// the daemon applies its inherited defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KeaParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pd_allocator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authoritative: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calculate_tee_times: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddns_generated_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddns_override_client_update: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddns_override_no_update: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddns_qualifying_suffix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddns_replace_client_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddns_send_updates: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddns_use_conflict_resolution: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname_char_replacement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname_char_set: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_client_id: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_preferred_lifetime: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_valid_lifetime: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_preferred_lifetime: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_valid_lifetime: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_lifetime: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rapid_commit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebind_timer: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay: Option<Relay>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renew_timer: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_client_classes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservations_global: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservations_in_subnet: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservations_out_of_pool: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_extended_info: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t1_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t2_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_lifetime: Option<u32>,
}

impl KeaParameters {
    /// Extract the recognised parameters from a Kea subnet or shared network
    /// object. Unknown keys are ignored.
    pub fn from_kea_object(object: &Map<String, Value>) -> Self {
        serde_json::from_value(Value::Object(object.clone())).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Ignoring malformed Kea parameters");
            Self::default()
        })
    }

    /// Merge the set parameters into a Kea JSON object.
    pub fn write_into(&self, object: &mut Map<String, Value>) {
        if let Ok(Value::Object(params)) = serde_json::to_value(self) {
            object.extend(params);
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unset_parameters_are_omitted() {
        let params = KeaParameters {
            valid_lifetime: Some(4500),
            ..Default::default()
        };
        let mut object = Map::new();
        params.write_into(&mut object);
        assert_eq!(Value::Object(object), json!({"valid-lifetime": 4500}));
    }

    #[test]
    fn parses_kea_keys() {
        let kea = json!({
            "id": 1,
            "subnet": "192.0.2.0/24",
            "valid-lifetime": 3600,
            "t1-percent": 0.5,
            "relay": {"ip-addresses": ["10.0.0.1"]},
            "ddns-send-updates": true
        });
        let params = KeaParameters::from_kea_object(kea.as_object().unwrap());
        assert_eq!(params.valid_lifetime, Some(3600));
        assert_eq!(params.t1_percent, Some(0.5));
        assert_eq!(params.relay.unwrap().ip_addresses, vec!["10.0.0.1"]);
        assert_eq!(params.ddns_send_updates, Some(true));
    }
}
