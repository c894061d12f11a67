//! DHCP option model and its Kea `option-data` encoding.
//!
//! Internally options form a tree: an option carries typed fields and may
//! encapsulate suboptions. Kea's `option-data` list is flat, so every
//! suboption becomes a peer entry whose `space` names the parent's
//! encapsulated option space. A parent whose space differs from the one
//! its definition implies carries it in an `encapsulate` key. The tree is
//! at most three levels deep; deeper entries found in a Kea configuration
//! are dropped with a warning.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

/// Deepest option level kept (top-level options are level 1).
pub const MAX_OPTION_DEPTH: usize = 3;

/// Option validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionError {
    #[error("invalid {field_type} value '{value}': {reason}")]
    InvalidValue {
        field_type: String,
        value: String,
        reason: String,
    },

    #[error("unsupported option field type '{0}'")]
    UnsupportedFieldType(String),

    #[error("option {code} in space {space} is nested deeper than {MAX_OPTION_DEPTH} levels")]
    TooDeep { code: u16, space: String },

    #[error("option code {code} is out of range for space {space}")]
    CodeOutOfRange { code: u16, space: String },
}

fn invalid(field_type: &str, value: &str, reason: impl Into<String>) -> OptionError {
    OptionError::InvalidValue {
        field_type: field_type.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// A single typed value within an option payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionField {
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Bool(bool),
    Ipv4Addr(Ipv4Addr),
    Ipv6Addr(Ipv6Addr),
    Ipv6Prefix(Ipv6Addr, u8),
    Psid(u16, u8),
    Fqdn(String),
    HexBytes(Vec<u8>),
    Str(String),
}

impl OptionField {
    /// Parse and validate a textual value of the named field type.
    pub fn parse(field_type: &str, value: &str) -> Result<Self, OptionError> {
        let value = value.trim();
        match field_type {
            "uint8" => value
                .parse()
                .map(Self::Uint8)
                .map_err(|e| invalid(field_type, value, e.to_string())),
            "uint16" => value
                .parse()
                .map(Self::Uint16)
                .map_err(|e| invalid(field_type, value, e.to_string())),
            "uint32" => value
                .parse()
                .map(Self::Uint32)
                .map_err(|e| invalid(field_type, value, e.to_string())),
            "bool" => match value {
                "true" => Ok(Self::Bool(true)),
                "false" => Ok(Self::Bool(false)),
                _ => Err(invalid(field_type, value, "expected true or false")),
            },
            "ipv4-address" => value
                .parse()
                .map(Self::Ipv4Addr)
                .map_err(|e| invalid(field_type, value, format!("{e}"))),
            "ipv6-address" => value
                .parse()
                .map(Self::Ipv6Addr)
                .map_err(|e| invalid(field_type, value, format!("{e}"))),
            "ipv6-prefix" => {
                let (addr, len) = value
                    .split_once('/')
                    .ok_or_else(|| invalid(field_type, value, "expected address/length"))?;
                let addr: Ipv6Addr = addr
                    .parse()
                    .map_err(|e| invalid(field_type, value, format!("{e}")))?;
                let len: u8 = len
                    .parse()
                    .map_err(|_| invalid(field_type, value, "bad prefix length"))?;
                if len > 128 {
                    return Err(invalid(field_type, value, "prefix length exceeds 128"));
                }
                Ok(Self::Ipv6Prefix(addr, len))
            }
            "psid" => {
                let (psid, len) = value
                    .split_once('/')
                    .ok_or_else(|| invalid(field_type, value, "expected psid/length"))?;
                let psid: u16 = psid
                    .parse()
                    .map_err(|_| invalid(field_type, value, "bad PSID"))?;
                let len: u8 = len
                    .parse()
                    .map_err(|_| invalid(field_type, value, "bad PSID length"))?;
                if len > 16 {
                    return Err(invalid(field_type, value, "PSID length exceeds 16"));
                }
                Ok(Self::Psid(psid, len))
            }
            "fqdn" => {
                validate_fqdn(value).map_err(|reason| invalid(field_type, value, reason))?;
                Ok(Self::Fqdn(value.to_string()))
            }
            "hex-bytes" | "binary" => {
                let cleaned: String = value
                    .chars()
                    .filter(|c| !matches!(c, ':' | ' ' | '-'))
                    .collect();
                let cleaned = cleaned
                    .strip_prefix("0x")
                    .or_else(|| cleaned.strip_prefix("0X"))
                    .unwrap_or(cleaned.as_str());
                if cleaned.is_empty() {
                    return Err(invalid(field_type, value, "empty binary value"));
                }
                hex::decode(cleaned)
                    .map(Self::HexBytes)
                    .map_err(|e| invalid(field_type, value, e.to_string()))
            }
            "string" => {
                if value.is_empty() {
                    return Err(invalid(field_type, value, "empty string"));
                }
                Ok(Self::Str(value.to_string()))
            }
            other => Err(OptionError::UnsupportedFieldType(other.to_string())),
        }
    }

    /// Field type name as used in the REST API.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Uint8(_) => "uint8",
            Self::Uint16(_) => "uint16",
            Self::Uint32(_) => "uint32",
            Self::Bool(_) => "bool",
            Self::Ipv4Addr(_) => "ipv4-address",
            Self::Ipv6Addr(_) => "ipv6-address",
            Self::Ipv6Prefix(..) => "ipv6-prefix",
            Self::Psid(..) => "psid",
            Self::Fqdn(_) => "fqdn",
            Self::HexBytes(_) => "hex-bytes",
            Self::Str(_) => "string",
        }
    }
}

impl fmt::Display for OptionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uint8(v) => write!(f, "{v}"),
            Self::Uint16(v) => write!(f, "{v}"),
            Self::Uint32(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Ipv4Addr(v) => write!(f, "{v}"),
            Self::Ipv6Addr(v) => write!(f, "{v}"),
            Self::Ipv6Prefix(addr, len) => write!(f, "{addr}/{len}"),
            Self::Psid(psid, len) => write!(f, "{psid}/{len}"),
            Self::Fqdn(v) | Self::Str(v) => f.write_str(v),
            Self::HexBytes(v) => f.write_str(&hex::encode_upper(v)),
        }
    }
}

fn validate_fqdn(value: &str) -> Result<(), String> {
    let name = value.strip_suffix('.').unwrap_or(value);
    if name.is_empty() {
        return Err("empty name".into());
    }
    if name.len() > 253 {
        return Err("name longer than 253 characters".into());
    }
    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(format!("invalid label length in '{label}'"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("label '{label}' starts or ends with a hyphen"));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(format!("label '{label}' contains invalid characters"));
        }
    }
    Ok(())
}

/// REST representation of a field: `{"fieldType": "...", "values": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOptionField {
    field_type: String,
    values: Vec<String>,
}

impl Serialize for OptionField {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RawOptionField {
            field_type: self.type_name().to_string(),
            values: vec![self.to_string()],
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for OptionField {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawOptionField::deserialize(deserializer)?;
        let [value] = raw.values.as_slice() else {
            return Err(serde::de::Error::custom(format!(
                "{} field expects exactly one value",
                raw.field_type
            )));
        };
        Self::parse(&raw.field_type, value).map_err(serde::de::Error::custom)
    }
}

/// A DHCP option with its suboptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DhcpOption {
    pub code: u16,
    /// Option space this option belongs to (`dhcp4`, `dhcp6` or an
    /// encapsulated space).
    pub space: String,
    /// Space holding this option's suboptions. Derived when empty.
    #[serde(default)]
    pub encapsulate: String,
    #[serde(default)]
    pub always_send: bool,
    #[serde(default)]
    pub fields: Vec<OptionField>,
    #[serde(default)]
    pub options: Vec<DhcpOption>,
}

impl DhcpOption {
    /// Option with the given payload and no suboptions.
    pub fn new(code: u16, space: &str, fields: Vec<OptionField>) -> Self {
        Self {
            code,
            space: space.to_string(),
            encapsulate: String::new(),
            always_send: false,
            fields,
            options: Vec::new(),
        }
    }

    /// The space suboptions of this option live in.
    pub fn encapsulated_space(&self) -> String {
        if self.encapsulate.is_empty() {
            default_encapsulate(&self.space, self.code)
        } else {
            self.encapsulate.clone()
        }
    }

    /// Nesting depth of this option tree (1 for an option without suboptions).
    pub fn depth(&self) -> usize {
        1 + self.options.iter().map(Self::depth).max().unwrap_or(0)
    }
}

/// Encapsulated space name for options whose definitions name one.
pub fn default_encapsulate(space: &str, code: u16) -> String {
    let known = match (space, code) {
        ("dhcp4", 43) => Some("vendor-encapsulated-options-space"),
        ("dhcp6", 94) => Some("s46-cont-mape-options"),
        ("dhcp6", 95) => Some("s46-cont-mapt-options"),
        ("dhcp6", 96) => Some("s46-cont-lw-options"),
        ("s46-cont-mape-options" | "s46-cont-mapt-options", 89) => Some("s46-rule-options"),
        ("s46-cont-lw-options", 90) => Some("s46-v4v6bind-options"),
        _ => None,
    };
    known.map_or_else(|| format!("{space}.{code}"), ToString::to_string)
}

/// Check the option trees of one subnet or shared network before they are
/// sent to a daemon of the given family.
pub fn validate_options(options: &[DhcpOption], family: u8) -> Result<(), OptionError> {
    fn walk(option: &DhcpOption, level: usize, family: u8) -> Result<(), OptionError> {
        if level > MAX_OPTION_DEPTH {
            return Err(OptionError::TooDeep {
                code: option.code,
                space: option.space.clone(),
            });
        }
        if family == 4 && option.code > 255 {
            return Err(OptionError::CodeOutOfRange {
                code: option.code,
                space: option.space.clone(),
            });
        }
        option
            .options
            .iter()
            .try_for_each(|sub| walk(sub, level + 1, family))
    }
    options.iter().try_for_each(|o| walk(o, 1, family))
}

/// Flatten option trees into Kea `option-data` entries.
///
/// Parents come before their suboptions.
pub fn flatten_options(options: &[DhcpOption]) -> Vec<Value> {
    fn push(option: &DhcpOption, out: &mut Vec<Value>) {
        let mut entry = Map::new();
        if option.always_send {
            entry.insert("always-send".into(), Value::Bool(true));
        }
        entry.insert("code".into(), json!(option.code));
        if !option.fields.is_empty() {
            let binary = matches!(option.fields.as_slice(), [OptionField::HexBytes(_)]);
            let data = option
                .fields
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            entry.insert("csv-format".into(), Value::Bool(!binary));
            entry.insert("data".into(), Value::String(data));
        }
        entry.insert("space".into(), Value::String(option.space.clone()));
        if !option.encapsulate.is_empty()
            && option.encapsulate != default_encapsulate(&option.space, option.code)
        {
            entry.insert("encapsulate".into(), Value::String(option.encapsulate.clone()));
        }
        out.push(Value::Object(entry));

        let sub_space = option.encapsulated_space();
        for sub in &option.options {
            let mut sub = sub.clone();
            sub.space.clone_from(&sub_space);
            push(&sub, out);
        }
    }

    let mut out = Vec::new();
    for option in options {
        push(option, &mut out);
    }
    out
}

/// Rebuild option trees from Kea `option-data` entries.
///
/// `top_space` is `dhcp4` or `dhcp6`. Entries nested deeper than
/// [`MAX_OPTION_DEPTH`] and entries whose space matches no parent are dropped.
pub fn unflatten_options(entries: &[Value], top_space: &str) -> Vec<DhcpOption> {
    fn attach(parent: &mut DhcpOption, all: &[DhcpOption], level: usize, used: &mut [bool]) {
        let sub_space = parent.encapsulated_space();
        for (i, candidate) in all.iter().enumerate() {
            if used[i] || candidate.space != sub_space {
                continue;
            }
            used[i] = true;
            if level > MAX_OPTION_DEPTH {
                warn!(
                    code = candidate.code,
                    space = %candidate.space,
                    "Dropping DHCP option nested deeper than {MAX_OPTION_DEPTH} levels"
                );
                continue;
            }
            let mut child = candidate.clone();
            attach(&mut child, all, level + 1, used);
            parent.options.push(child);
        }
    }

    let parsed: Vec<DhcpOption> = entries.iter().filter_map(parse_option_entry).collect();
    let mut used = vec![false; parsed.len()];
    let mut roots = Vec::new();
    for (i, option) in parsed.iter().enumerate() {
        if option.space != top_space {
            continue;
        }
        used[i] = true;
        let mut root = option.clone();
        attach(&mut root, &parsed, 2, &mut used);
        roots.push(root);
    }
    for (i, option) in parsed.iter().enumerate() {
        if !used[i] {
            warn!(
                code = option.code,
                space = %option.space,
                "Dropping DHCP option without a parent option"
            );
        }
    }
    roots
}

fn parse_option_entry(entry: &Value) -> Option<DhcpOption> {
    let code = u16::try_from(entry.get("code")?.as_u64()?).ok()?;
    let space = entry.get("space").and_then(Value::as_str).unwrap_or("dhcp4");
    let always_send = entry
        .get("always-send")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let csv = entry
        .get("csv-format")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let data = entry.get("data").and_then(Value::as_str).unwrap_or("");

    let fields = if data.is_empty() {
        Vec::new()
    } else if csv {
        data.split(',')
            .map(|v| infer_field(space, code, v.trim()))
            .collect()
    } else {
        match OptionField::parse("hex-bytes", data) {
            Ok(f) => vec![f],
            Err(e) => {
                warn!(code, space, error = %e, "Ignoring malformed binary option data");
                Vec::new()
            }
        }
    };

    let mut option = DhcpOption::new(code, space, fields);
    option.always_send = always_send;
    if let Some(encapsulate) = entry.get("encapsulate").and_then(Value::as_str) {
        option.encapsulate = encapsulate.to_string();
    }
    Some(option)
}

/// Field type of well-known options carrying a single repeated type.
fn standard_field_type(space: &str, code: u16) -> Option<&'static str> {
    match (space, code) {
        ("dhcp4", 1 | 3 | 4 | 5 | 6 | 7 | 9 | 28 | 41 | 42 | 44 | 45 | 69 | 70) => {
            Some("ipv4-address")
        }
        ("dhcp4", 12 | 14 | 17 | 40 | 56 | 60 | 66 | 67) => Some("string"),
        ("dhcp4", 15) => Some("fqdn"),
        ("dhcp4", 19 | 20 | 27 | 29 | 30 | 31 | 34 | 36 | 39) => Some("bool"),
        ("dhcp4", 23 | 37 | 46) => Some("uint8"),
        ("dhcp4", 13 | 22 | 26 | 57) => Some("uint16"),
        ("dhcp4", 2 | 24 | 35 | 38 | 51 | 58 | 59) => Some("uint32"),
        ("dhcp6", 12 | 22 | 23 | 27 | 28 | 31 | 40 | 48) => Some("ipv6-address"),
        ("dhcp6", 24 | 29 | 30 | 33) => Some("fqdn"),
        ("dhcp6", 7) => Some("uint8"),
        ("dhcp6", 32) => Some("uint32"),
        _ => None,
    }
}

fn infer_field(space: &str, code: u16, value: &str) -> OptionField {
    if let Some(field_type) = standard_field_type(space, code)
        && let Ok(field) = OptionField::parse(field_type, value)
    {
        return field;
    }
    if let Ok(addr) = value.parse::<Ipv4Addr>() {
        return OptionField::Ipv4Addr(addr);
    }
    if let Ok(addr) = value.parse::<Ipv6Addr>() {
        return OptionField::Ipv6Addr(addr);
    }
    if let Ok(field) = OptionField::parse("ipv6-prefix", value) {
        return field;
    }
    if let Ok(field) = OptionField::parse("psid", value) {
        return field;
    }
    if let Ok(field) = OptionField::parse("bool", value) {
        return field;
    }
    if let Ok(v) = value.parse::<u32>() {
        return OptionField::Uint32(v);
    }
    OptionField::Str(value.to_string())
}

/// Hash of an option set, used to detect option changes across daemons.
///
/// Empty sets hash to an empty string.
pub fn option_set_hash(options: &[DhcpOption]) -> String {
    if options.is_empty() {
        return String::new();
    }
    let serialized = serde_json::to_string(options).unwrap_or_default();
    hex::encode(Sha256::digest(serialized.as_bytes()))
}
