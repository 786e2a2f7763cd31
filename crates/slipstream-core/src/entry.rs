//! Server entry fields and their wire encoding.
//!
//! A server entry describes one relay: its address, region, supported
//! tunnel and tactics protocols, and legacy fronting information. The
//! datastore treats entries as opaque JSON apart from the fields indexed
//! or filtered on, so unknown fields are preserved round-trip through a
//! flattened map.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Source label for server entries compiled into the client binary.
pub const SERVER_ENTRY_SOURCE_EMBEDDED: &str = "EMBEDDED";

/// Source label for server entries fetched from a remote server list.
pub const SERVER_ENTRY_SOURCE_REMOTE: &str = "REMOTE";

/// Source label for the operator-specified target server entry.
pub const SERVER_ENTRY_SOURCE_TARGET: &str = "TARGET";

/// Errors from server entry decoding and validation.
#[derive(Debug, Error)]
pub enum EntryError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("malformed server entry encoding: {0}")]
    Encoding(String),

    #[error("invalid server entry: {0}")]
    Invalid(String),
}

/// One relay's connection metadata.
///
/// Field names follow the JSON wire format. Fields not modeled here are
/// carried in `extra` and written back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerEntryFields {
    /// Primary key for the entry in the datastore.
    pub ip_address: String,

    /// Egress region code; empty when the relay does not advertise one.
    pub region: String,

    /// Monotonic version used to decide replace-vs-keep on import.
    pub configuration_version: i64,

    /// Tunnel protocols this relay accepts.
    pub tunnel_protocols: Vec<String>,

    /// Tactics request protocols this relay accepts.
    pub tactics_protocols: Vec<String>,

    /// Legacy single fronting domain. Superseded by
    /// `meek_fronting_addresses`; see [`ServerEntryFields::normalize_fronting`].
    pub meek_fronting_domain: String,

    /// Fronting addresses for meek-based protocols.
    pub meek_fronting_addresses: Vec<String>,

    /// Timestamp stamped by the client when the entry was decoded.
    pub local_timestamp: String,

    /// Where the entry came from (embedded, remote list, target).
    pub local_source: String,

    /// Fields this client does not interpret, preserved byte-for-byte.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ServerEntryFields {
    /// Whether this relay can serve tactics requests.
    pub fn supports_tactics(&self) -> bool {
        !self.tactics_protocols.is_empty()
    }

    /// Tunnel protocols this relay supports, restricted to `limit` when
    /// `limit` is non-empty.
    pub fn supported_tunnel_protocols(&self, limit: &[String]) -> Vec<String> {
        if limit.is_empty() {
            return self.tunnel_protocols.clone();
        }
        self.tunnel_protocols
            .iter()
            .filter(|p| limit.contains(p))
            .cloned()
            .collect()
    }

    /// Backwards compatibility with old server entries carrying a single
    /// `meekFrontingDomain` and no `meekFrontingAddresses` array: copy the
    /// one domain into the array so it is used the way legacy clients use it.
    pub fn normalize_fronting(&mut self) {
        if self.meek_fronting_addresses.is_empty() && !self.meek_fronting_domain.is_empty() {
            self.meek_fronting_addresses
                .push(self.meek_fronting_domain.clone());
        }
    }
}

/// Check that `fields` is well-formed enough to store and index.
pub fn validate_server_entry(fields: &ServerEntryFields) -> Result<(), EntryError> {
    if fields.ip_address.is_empty() {
        return Err(EntryError::MissingField("ipAddress"));
    }
    if fields.configuration_version < 0 {
        return Err(EntryError::Invalid(format!(
            "negative configuration version: {}",
            fields.configuration_version
        )));
    }
    Ok(())
}

/// Decode a compact-encoded server entry.
///
/// The wire format is the hex encoding of
/// `<ip> <port> <secret> <cert> <json>`; the four space-separated prefix
/// fields are a legacy artifact and the JSON payload is authoritative.
/// `local_timestamp` and `local_source` are stamped from the arguments.
pub fn decode_server_entry(
    encoded: &str,
    local_timestamp: &str,
    local_source: &str,
) -> Result<ServerEntryFields, EntryError> {
    let raw = hex::decode(encoded.trim()).map_err(|e| EntryError::Encoding(e.to_string()))?;
    let raw = String::from_utf8(raw).map_err(|e| EntryError::Encoding(e.to_string()))?;

    let json = raw
        .splitn(5, ' ')
        .nth(4)
        .ok_or_else(|| EntryError::Encoding("expected 5 space-separated fields".into()))?;

    let mut fields: ServerEntryFields =
        serde_json::from_str(json).map_err(|e| EntryError::Encoding(e.to_string()))?;

    fields.local_timestamp = local_timestamp.to_string();
    fields.local_source = local_source.to_string();

    Ok(fields)
}

/// Encode `fields` in the compact wire format accepted by
/// [`decode_server_entry`].
pub fn encode_server_entry(fields: &ServerEntryFields) -> Result<String, EntryError> {
    let json = serde_json::to_string(fields).map_err(|e| EntryError::Encoding(e.to_string()))?;
    let port = fields
        .extra
        .get("webServerPort")
        .map(|v| v.to_string())
        .unwrap_or_else(|| "0".to_string());
    let raw = format!("{} {} {} {} {}", fields.ip_address, port, "", "", json);
    Ok(hex::encode(raw))
}

/// Current Unix time in seconds, as the string stamped into
/// `local_timestamp`.
pub fn current_timestamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_default()
}
