//! Cache slots: split tunnel routes, URL ETags, generic key/values, and
//! SLOK records.
//!
//! Each operation is one transaction over the relevant bucket. Values are
//! copied out of read transactions before being returned.

use redb::ReadableTable;

use crate::error::{map_err, StoreResult};
use crate::store::DataStore;
use crate::tables::{
    KEY_VALUES, SLOKS, SPLIT_TUNNEL_ROUTE_DATA, SPLIT_TUNNEL_ROUTE_ETAGS, URL_ETAGS,
};

/// Key/value slot where the controller records the last successful
/// connection timestamp.
pub const KEY_VALUE_LAST_CONNECTED: &str = "lastConnected";

impl DataStore {
    /// Cache the routes data for `region` along with the ETag used to
    /// make efficient update requests. Both writes commit together.
    pub fn set_split_tunnel_routes(
        &self,
        region: &str,
        etag: &str,
        data: &[u8],
    ) -> StoreResult<()> {
        self.update(|txn| {
            let mut etags = txn
                .open_table(SPLIT_TUNNEL_ROUTE_ETAGS)
                .map_err(map_err!(Table))?;
            etags.insert(region, etag).map_err(map_err!(Write))?;

            let mut routes = txn
                .open_table(SPLIT_TUNNEL_ROUTE_DATA)
                .map_err(map_err!(Table))?;
            routes.insert(region, data).map_err(map_err!(Write))?;
            Ok(())
        })
    }

    /// The ETag for cached routes data, or empty when none is cached.
    pub fn get_split_tunnel_routes_etag(&self, region: &str) -> StoreResult<String> {
        self.view(|txn| {
            let etags = txn
                .open_table(SPLIT_TUNNEL_ROUTE_ETAGS)
                .map_err(map_err!(Table))?;
            Ok(etags
                .get(region)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_string())
                .unwrap_or_default())
        })
    }

    /// The cached routes data, or `None` when absent.
    pub fn get_split_tunnel_routes_data(&self, region: &str) -> StoreResult<Option<Vec<u8>>> {
        self.view(|txn| {
            let routes = txn
                .open_table(SPLIT_TUNNEL_ROUTE_DATA)
                .map_err(map_err!(Table))?;
            Ok(routes
                .get(region)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec()))
        })
    }

    /// Store an ETag for `url`. The URL is treated as an opaque string,
    /// not canonicalized.
    pub fn set_url_etag(&self, url: &str, etag: &str) -> StoreResult<()> {
        self.update(|txn| {
            let mut etags = txn.open_table(URL_ETAGS).map_err(map_err!(Table))?;
            etags.insert(url, etag).map_err(map_err!(Write))?;
            Ok(())
        })
    }

    /// The ETag stored for `url`, or empty when none is stored.
    pub fn get_url_etag(&self, url: &str) -> StoreResult<String> {
        self.view(|txn| {
            let etags = txn.open_table(URL_ETAGS).map_err(map_err!(Table))?;
            Ok(etags
                .get(url)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_string())
                .unwrap_or_default())
        })
    }

    /// Store a generic key/value pair.
    pub fn set_key_value(&self, key: &str, value: &str) -> StoreResult<()> {
        self.update(|txn| {
            let mut key_values = txn.open_table(KEY_VALUES).map_err(map_err!(Table))?;
            key_values
                .insert(key, value.as_bytes())
                .map_err(map_err!(Write))?;
            Ok(())
        })
    }

    /// The value for `key`, or empty when none is stored.
    pub fn get_key_value(&self, key: &str) -> StoreResult<String> {
        self.view(|txn| {
            let key_values = txn.open_table(KEY_VALUES).map_err(map_err!(Table))?;
            Ok(key_values
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| String::from_utf8_lossy(guard.value()).into_owned())
                .unwrap_or_default())
        })
    }

    /// Store a SLOK key by record id. Returns whether a record with this
    /// id was already stored.
    pub fn set_slok(&self, id: &[u8], key: &[u8]) -> StoreResult<bool> {
        self.update(|txn| {
            let mut sloks = txn.open_table(SLOKS).map_err(map_err!(Table))?;
            let duplicate = sloks.insert(id, key).map_err(map_err!(Write))?.is_some();
            Ok(duplicate)
        })
    }

    /// The SLOK key for `id`, or `None` when not found.
    pub fn get_slok(&self, id: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.view(|txn| {
            let sloks = txn.open_table(SLOKS).map_err(map_err!(Table))?;
            Ok(sloks
                .get(id)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec()))
        })
    }

    /// Total number of SLOK records.
    pub fn count_sloks(&self) -> StoreResult<usize> {
        self.view(|txn| {
            let sloks = txn.open_table(SLOKS).map_err(map_err!(Table))?;
            let mut count = 0;
            for item in sloks.iter().map_err(map_err!(Read))? {
                item.map_err(map_err!(Read))?;
                count += 1;
            }
            Ok(count)
        })
    }

    /// Delete every SLOK record.
    pub fn delete_sloks(&self) -> StoreResult<()> {
        self.update(|txn| {
            let mut sloks = txn.open_table(SLOKS).map_err(map_err!(Table))?;
            let ids: Vec<Vec<u8>> = {
                let mut ids = Vec::new();
                for item in sloks.iter().map_err(map_err!(Read))? {
                    let (id, _) = item.map_err(map_err!(Read))?;
                    ids.push(id.value().to_vec());
                }
                ids
            };
            for id in ids {
                sloks.remove(id.as_slice()).map_err(map_err!(Write))?;
            }
            Ok(())
        })
    }
}
