//! Server entry registry: import, promotion, and derived scans.
//!
//! There are no region or protocol indexes over the entries. The
//! population is bounded (thousands to low tens of thousands), filter
//! values are common, and scans only run on rare control events, so a
//! full scan with a filter beats paying write amplification on every
//! import plus a migration path for the index schema.

use std::collections::BTreeSet;

use redb::ReadableTable;
use slipstream_core::{validate_server_entry, Config, ServerEntryFields};

use crate::error::{map_err, StoreError, StoreResult};
use crate::ranker;
use crate::store::DataStore;
use crate::tables::{KEY_VALUES, SERVER_ENTRIES};

pub(crate) const LAST_SERVER_ENTRY_FILTER_KEY: &str = "lastServerEntryFilter";

/// Caller-supplied classifier deciding whether an entry is usable as a
/// connection candidate under the active tunnel protocol limits.
pub trait CandidateLimits {
    /// Usable for the first establishment round.
    fn is_initial_candidate(&self, entry: &ServerEntryFields) -> bool;

    /// Usable at all.
    fn is_candidate(&self, entry: &ServerEntryFields) -> bool;
}

/// The value of the server-entry selection filter under `config`.
///
/// Only a change of egress region breaks server affinity: if the tunnel
/// protocol filter changes, an existing affinity server either passes the
/// new filter or is skipped during iteration anyway.
pub fn server_entry_filter_value(config: &Config) -> Vec<u8> {
    config.egress_region.clone().into_bytes()
}

impl DataStore {
    /// Add a server entry.
    ///
    /// A stored (or re-stored) entry is ranked next-to-top, which keeps
    /// the last selected server as the top-ranked candidate. An entry
    /// that already exists is replaced only when `replace_if_exists` is
    /// set or the incoming configuration version is strictly newer.
    pub fn store_server_entry(
        &self,
        fields: &ServerEntryFields,
        replace_if_exists: bool,
    ) -> StoreResult<()> {
        // Entries are validated before reaching this point, so a failure
        // here is surfaced rather than skipped.
        validate_server_entry(fields)?;

        self.update(|txn| {
            let existing_version = {
                let entries = txn.open_table(SERVER_ENTRIES).map_err(map_err!(Table))?;
                // An existing value that does not decode counts as absent,
                // so a valid replacement overwrites a corrupt record.
                let version = entries
                    .get(fields.ip_address.as_str())
                    .map_err(map_err!(Read))?
                    .and_then(|guard| {
                        serde_json::from_slice::<ServerEntryFields>(guard.value()).ok()
                    })
                    .map(|existing| existing.configuration_version)
                    .unwrap_or(-1);
                version
            };

            let exists = existing_version > -1;
            let newer = exists && existing_version < fields.configuration_version;
            if exists && !replace_if_exists && !newer {
                return Ok(());
            }

            let data = serde_json::to_vec(fields).map_err(map_err!(Serialize))?;
            {
                let mut entries = txn.open_table(SERVER_ENTRIES).map_err(map_err!(Table))?;
                entries
                    .insert(fields.ip_address.as_str(), data.as_slice())
                    .map_err(map_err!(Write))?;
            }

            ranker::insert_ranked_server_entry(txn, &fields.ip_address, 1, self.notices())?;

            self.notices()
                .info(&format!("updated server {}", fields.ip_address));
            Ok(())
        })
    }

    /// Store a batch of entries, one transaction per entry. Independent
    /// transactions bound transaction size for large imports.
    pub fn store_server_entries<I>(&self, entries: I, replace_if_exists: bool) -> StoreResult<()>
    where
        I: IntoIterator<Item = ServerEntryFields>,
    {
        for fields in entries {
            self.store_server_entry(&fields, replace_if_exists)?;
        }
        Ok(())
    }

    /// Streaming import: an invalid entry is reported and skipped so one
    /// bad record cannot abort a long feed; storage errors still abort.
    pub fn import_server_entries<I>(&self, entries: I, replace_if_exists: bool) -> StoreResult<()>
    where
        I: IntoIterator<Item = ServerEntryFields>,
    {
        for fields in entries {
            match self.store_server_entry(&fields, replace_if_exists) {
                Ok(()) => {}
                Err(StoreError::InvalidEntry(e)) => {
                    self.notices()
                        .alert(&format!("skipping invalid server entry: {e}"));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Fetch one entry by IP address. A stored record that no longer
    /// decodes is reported and treated as absent.
    pub fn get_server_entry(&self, ip_address: &str) -> StoreResult<Option<ServerEntryFields>> {
        self.view(|txn| {
            let entries = txn.open_table(SERVER_ENTRIES).map_err(map_err!(Table))?;
            let Some(guard) = entries.get(ip_address).map_err(map_err!(Read))? else {
                return Ok(None);
            };
            match serde_json::from_slice(guard.value()) {
                Ok(entry) => Ok(Some(entry)),
                Err(e) => {
                    self.notices()
                        .alert(&format!("malformed server entry {ip_address}: {e}"));
                    Ok(None)
                }
            }
        })
    }

    /// Visit every stored entry. Malformed records are reported and
    /// skipped; iteration continues.
    pub fn scan_server_entries(
        &self,
        mut visitor: impl FnMut(&ServerEntryFields),
    ) -> StoreResult<()> {
        self.view(|txn| {
            let entries = txn.open_table(SERVER_ENTRIES).map_err(map_err!(Table))?;
            for item in entries.iter().map_err(map_err!(Read))? {
                let (key, value) = item.map_err(map_err!(Read))?;
                match serde_json::from_slice::<ServerEntryFields>(value.value()) {
                    Ok(entry) => visitor(&entry),
                    Err(e) => {
                        self.notices().alert(&format!(
                            "skipping malformed server entry {}: {e}",
                            key.value()
                        ));
                    }
                }
            }
            Ok(())
        })
    }

    /// Count of stored server entries.
    pub fn count_server_entries(&self) -> StoreResult<usize> {
        let mut count = 0;
        self.scan_server_entries(|_| count += 1)?;
        Ok(count)
    }

    /// Counts of (initial candidates, candidates) in `region` under the
    /// supplied protocol limits. An empty region matches everything.
    pub fn count_server_entries_with_limits(
        &self,
        region: &str,
        limits: &dyn CandidateLimits,
    ) -> StoreResult<(usize, usize)> {
        let mut initial_count = 0;
        let mut count = 0;
        self.scan_server_entries(|entry| {
            if region.is_empty() || entry.region == region {
                if limits.is_initial_candidate(entry) {
                    initial_count += 1;
                }
                if limits.is_candidate(entry) {
                    count += 1;
                }
            }
        })?;
        Ok((initial_count, count))
    }

    /// Report the egress regions for which connection candidates exist.
    pub fn report_available_regions(&self, limits: &dyn CandidateLimits) -> StoreResult<()> {
        let mut regions = BTreeSet::new();
        self.scan_server_entries(|entry| {
            if limits.is_initial_candidate(entry) || limits.is_candidate(entry) {
                // Some entries have no region; an empty string is not a
                // reportable region.
                if !entry.region.is_empty() {
                    regions.insert(entry.region.clone());
                }
            }
        })?;

        let regions: Vec<String> = regions.into_iter().collect();
        self.notices().available_egress_regions(&regions);
        Ok(())
    }

    /// All stored server IP addresses.
    pub fn get_server_entry_ip_addresses(&self) -> StoreResult<Vec<String>> {
        let mut ip_addresses = Vec::new();
        self.scan_server_entries(|entry| ip_addresses.push(entry.ip_address.clone()))?;
        Ok(ip_addresses)
    }

    /// Assign the top rank to `ip_address` so it is the first candidate in
    /// the next establishment, and remember the selection filter it was
    /// promoted under — atomically, so the rank head and the affinity memo
    /// never disagree.
    pub fn promote_server_entry(&self, config: &Config, ip_address: &str) -> StoreResult<()> {
        self.update(|txn| {
            let known = {
                let entries = txn.open_table(SERVER_ENTRIES).map_err(map_err!(Table))?;
                let exists = entries
                    .get(ip_address)
                    .map_err(map_err!(Read))?
                    .is_some();
                exists
            };
            if !known {
                self.notices()
                    .alert(&format!("promote: ignoring unknown server entry: {ip_address}"));
                return Ok(());
            }

            ranker::insert_ranked_server_entry(txn, ip_address, 0, self.notices())?;

            let filter = server_entry_filter_value(config);
            let mut key_values = txn.open_table(KEY_VALUES).map_err(map_err!(Table))?;
            key_values
                .insert(LAST_SERVER_ENTRY_FILTER_KEY, filter.as_slice())
                .map_err(map_err!(Write))?;
            Ok(())
        })
    }

    /// Whether the selection filter differs from the one stored by the
    /// last promotion. A never-written memo matches nothing — including an
    /// empty current filter — so a fresh datastore grants no affinity.
    pub fn has_server_entry_filter_changed(&self, config: &Config) -> StoreResult<bool> {
        let current = server_entry_filter_value(config);
        self.view(|txn| {
            let key_values = txn.open_table(KEY_VALUES).map_err(map_err!(Table))?;
            let stored = key_values
                .get(LAST_SERVER_ENTRY_FILTER_KEY)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            Ok(stored.as_deref() != Some(current.as_slice()))
        })
    }
}
