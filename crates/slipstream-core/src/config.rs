//! Read-only client configuration handle.
//!
//! Loading and validating configuration belongs to the embedding
//! application; the engine only reads the fields it selects and filters
//! on.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Client configuration consumed by the datastore engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the datastore file.
    pub data_store_directory: PathBuf,

    /// Egress region filter; empty selects any region.
    pub egress_region: String,

    /// Number of tunnels the controller establishes in parallel. Also the
    /// length of the candidate-iterator prefix kept in rank order.
    pub tunnel_pool_size: usize,

    /// When non-empty, a compact-encoded server entry that is the only
    /// connection candidate.
    pub target_server_entry: String,

    /// Whether connections are made through an upstream proxy.
    pub use_upstream_proxy: bool,

    /// Snapshot of tunable client parameters.
    pub parameters: ClientParameters,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_store_directory: PathBuf::new(),
            egress_region: String::new(),
            tunnel_pool_size: 1,
            target_server_entry: String::new(),
            use_upstream_proxy: false,
            parameters: ClientParameters::default(),
        }
    }
}

/// Tunable client parameters the engine reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientParameters {
    /// When non-empty, restricts candidate relays to these tunnel
    /// protocols.
    pub limit_tunnel_protocols: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.tunnel_pool_size, 1);
        assert!(config.egress_region.is_empty());
        assert!(config.parameters.limit_tunnel_protocols.is_empty());
    }

    #[test]
    fn test_parse_partial_json() {
        let config: Config =
            serde_json::from_str(r#"{"egress_region":"US","tunnel_pool_size":2}"#).unwrap();
        assert_eq!(config.egress_region, "US");
        assert_eq!(config.tunnel_pool_size, 2);
        assert!(!config.use_upstream_proxy);
    }
}
