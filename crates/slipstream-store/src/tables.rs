//! redb table definitions for the datastore.
//!
//! Each table is a sorted map from byte-string key to byte-string value.
//! Server entries and the ranked vector store JSON in their value columns.

use redb::TableDefinition;

/// Server entries keyed by IP address.
pub const SERVER_ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("serverEntries");

/// The ranked server entry vector, one JSON array under one key.
pub const RANKED_SERVER_ENTRIES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("rankedServerEntries");

/// Split tunnel route ETags keyed by region.
pub const SPLIT_TUNNEL_ROUTE_ETAGS: TableDefinition<&str, &str> =
    TableDefinition::new("splitTunnelRouteETags");

/// Split tunnel route payloads keyed by region.
pub const SPLIT_TUNNEL_ROUTE_DATA: TableDefinition<&str, &[u8]> =
    TableDefinition::new("splitTunnelRouteData");

/// ETags keyed by request URL.
pub const URL_ETAGS: TableDefinition<&str, &str> = TableDefinition::new("urlETags");

/// Generic key/value slots, including the affinity filter memo.
pub const KEY_VALUES: TableDefinition<&str, &[u8]> = TableDefinition::new("keyValues");

/// Remote server list download stats keyed by their JSON bytes.
pub const REMOTE_SERVER_LIST_STATS: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("remoteServerListStats");

/// SLOK keys by record id.
pub const SLOKS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("SLOKs");

/// Tactics records keyed by network id.
pub const TACTICS: TableDefinition<&str, &[u8]> = TableDefinition::new("tactics");

/// Speed test samples keyed by network id.
pub const SPEED_TEST_SAMPLES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("speedTestSamples");

/// Per-session tunnel stats bucket written by old clients; dropped at open.
pub const OBSOLETE_TUNNEL_STATS: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("tunnelStats");
