//! Rank-then-shuffle candidate iteration.
//!
//! Yields server entries to the dial loop: the first `tunnel_pool_size`
//! candidates in rank order to favor previously successful servers, the
//! long tail in uniformly shuffled order to raise up less recent
//! candidates. A tactics iterator has no rank prefix and no region
//! filter; a configured target server entry short-circuits everything and
//! is the only candidate.
//!
//! The iterator snapshots only the id list under one read transaction and
//! fetches each record in a short per-entry transaction. Holding one read
//! view across the whole iteration would pin the storage engine's
//! snapshot against concurrent writers for an unbounded dial loop;
//! instead, a record deleted or rewritten mid-iteration surfaces through
//! the missing/malformed recovery path and iteration continues.

use std::collections::HashSet;

use rand::Rng;
use redb::ReadableTable;
use slipstream_core::{
    current_timestamp, decode_server_entry, validate_server_entry, Config, EntryError,
    ServerEntryFields, SERVER_ENTRY_SOURCE_TARGET,
};

use crate::error::{map_err, StoreError, StoreResult};
use crate::ranker;
use crate::store::DataStore;
use crate::tables::{RANKED_SERVER_ENTRIES, SERVER_ENTRIES};

/// Iterator over stored server entries in candidate order.
///
/// Not designed for concurrent use: the underlying records are fetched in
/// independent transactions, so a single iterator must stay on one
/// thread, while the datastore itself may be mutated concurrently.
pub struct ServerEntryIterator {
    store: DataStore,
    egress_region: String,
    shuffle_head_length: usize,
    server_entry_ids: Vec<String>,
    server_entry_index: usize,
    is_tactics: bool,
    is_target: bool,
    has_next_target: bool,
    target_entry: Option<ServerEntryFields>,
}

impl ServerEntryIterator {
    /// Create a candidate iterator for tunnel establishment.
    ///
    /// The boolean indicates whether to treat the leading candidates as
    /// affinity servers. When the selection filter changed since the head
    /// was promoted — or nothing was ever promoted — the head is arbitrary
    /// and should get no affinity treatment.
    pub fn new(store: &DataStore, config: &Config) -> StoreResult<(bool, Self)> {
        if !config.target_server_entry.is_empty() {
            return Self::new_target(store, config, false);
        }

        let filter_changed = store.has_server_entry_filter_changed(config)?;
        let apply_affinity = !filter_changed;

        let mut iterator = Self {
            store: store.clone(),
            egress_region: config.egress_region.clone(),
            shuffle_head_length: config.tunnel_pool_size,
            server_entry_ids: Vec::new(),
            server_entry_index: 0,
            is_tactics: false,
            is_target: false,
            has_next_target: false,
            target_entry: None,
        };
        iterator.reset()?;

        Ok((apply_affinity, iterator))
    }

    /// Create an iterator over relays that can serve tactics requests.
    /// Tactics selection keeps no rank prefix and ignores the region
    /// filter.
    pub fn new_tactics(store: &DataStore, config: &Config) -> StoreResult<Self> {
        if !config.target_server_entry.is_empty() {
            let (_, iterator) = Self::new_target(store, config, true)?;
            return Ok(iterator);
        }

        let mut iterator = Self {
            store: store.clone(),
            egress_region: String::new(),
            shuffle_head_length: 0,
            server_entry_ids: Vec::new(),
            server_entry_index: 0,
            is_tactics: true,
            is_target: false,
            has_next_target: false,
            target_entry: None,
        };
        iterator.reset()?;

        Ok(iterator)
    }

    fn new_target(store: &DataStore, config: &Config, is_tactics: bool) -> StoreResult<(bool, Self)> {
        let entry = decode_server_entry(
            &config.target_server_entry,
            &current_timestamp(),
            SERVER_ENTRY_SOURCE_TARGET,
        )?;
        validate_server_entry(&entry)?;

        if is_tactics {
            if !entry.supports_tactics() {
                return Err(StoreError::InvalidEntry(EntryError::Invalid(
                    "target server entry does not support tactics protocols".into(),
                )));
            }
        } else {
            if !config.egress_region.is_empty() && entry.region != config.egress_region {
                return Err(StoreError::InvalidEntry(EntryError::Invalid(
                    "target server entry does not match the egress region".into(),
                )));
            }
            let limit = &config.parameters.limit_tunnel_protocols;
            if !limit.is_empty() && entry.supported_tunnel_protocols(limit).is_empty() {
                return Err(StoreError::InvalidEntry(EntryError::Invalid(
                    "target server entry does not support the limited tunnel protocols".into(),
                )));
            }
        }

        store
            .notices()
            .info(&format!("using target server entry: {}", entry.ip_address));

        Ok((
            false,
            Self {
                store: store.clone(),
                egress_region: String::new(),
                shuffle_head_length: 0,
                server_entry_ids: Vec::new(),
                server_entry_index: 0,
                is_tactics,
                is_target: true,
                has_next_target: true,
                target_entry: Some(entry),
            },
        ))
    }

    /// Rebuild the candidate sequence and rewind to its start.
    pub fn reset(&mut self) -> StoreResult<()> {
        self.close();

        if self.is_target {
            self.has_next_target = true;
            return Ok(());
        }

        // Snapshot: the ranked vector first, then every other stored id in
        // reverse bucket order. Readers tolerate ranked ids whose record
        // has since vanished — next_entry skips them.
        let mut ids = self.store.view(|txn| {
            let ranked = {
                let table = txn
                    .open_table(RANKED_SERVER_ENTRIES)
                    .map_err(map_err!(Table))?;
                ranker::ranked_server_entries(&table, self.store.notices())?
            };
            let ranked_set: HashSet<&str> = ranked.iter().map(String::as_str).collect();

            let entries = txn.open_table(SERVER_ENTRIES).map_err(map_err!(Table))?;
            let mut ids = ranked.clone();
            for item in entries.iter().map_err(map_err!(Read))?.rev() {
                let (key, _) = item.map_err(map_err!(Read))?;
                let id = key.value();
                if !ranked_set.contains(id) {
                    ids.push(id.to_string());
                }
            }
            Ok(ids)
        })?;

        // Fisher–Yates over the tail, leaving the rank-ordered head alone.
        let head = self.shuffle_head_length.min(ids.len());
        let mut rng = rand::thread_rng();
        for i in (head..ids.len()).rev() {
            let j = rng.gen_range(head..=i);
            ids.swap(i, j);
        }

        self.server_entry_ids = ids;
        self.server_entry_index = 0;
        Ok(())
    }

    /// Drop the snapshot. The iterator yields nothing until reset.
    pub fn close(&mut self) {
        self.server_entry_ids.clear();
        self.server_entry_index = 0;
    }

    /// The next entry matching this iterator's filter, or `None` at the
    /// end of the sequence. Missing and malformed records are reported
    /// and skipped, never terminal.
    pub fn next_entry(&mut self) -> StoreResult<Option<ServerEntryFields>> {
        if self.is_target {
            if self.has_next_target {
                self.has_next_target = false;
                if let Some(entry) = &self.target_entry {
                    let mut entry = entry.clone();
                    entry.normalize_fronting();
                    return Ok(Some(entry));
                }
            }
            return Ok(None);
        }

        loop {
            if self.server_entry_index >= self.server_entry_ids.len() {
                return Ok(None);
            }

            let id = self.server_entry_ids[self.server_entry_index].clone();
            self.server_entry_index += 1;

            // Short per-record view; the stored bytes are copied out
            // because the borrow ends with the transaction.
            let data = self.store.view(|txn| {
                let entries = txn.open_table(SERVER_ENTRIES).map_err(map_err!(Table))?;
                Ok(entries
                    .get(id.as_str())
                    .map_err(map_err!(Read))?
                    .map(|guard| guard.value().to_vec()))
            })?;

            let Some(data) = data else {
                self.store
                    .notices()
                    .alert(&format!("iterator: missing server entry: {id}"));
                continue;
            };

            let mut entry: ServerEntryFields = match serde_json::from_slice(&data) {
                Ok(entry) => entry,
                Err(e) => {
                    self.store
                        .notices()
                        .alert(&format!("iterator: malformed server entry {id}: {e}"));
                    continue;
                }
            };

            let matches = if self.is_tactics {
                entry.supports_tactics()
            } else {
                self.egress_region.is_empty() || entry.region == self.egress_region
            };
            if !matches {
                continue;
            }

            entry.normalize_fronting();
            return Ok(Some(entry));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{capturing_store, in_memory_store, test_entry};
    use slipstream_core::encode_server_entry;

    fn region_config(region: &str, pool: usize) -> Config {
        Config {
            egress_region: region.to_string(),
            tunnel_pool_size: pool,
            ..Config::default()
        }
    }

    fn drain(iterator: &mut ServerEntryIterator) -> Vec<String> {
        let mut ips = Vec::new();
        while let Some(entry) = iterator.next_entry().unwrap() {
            ips.push(entry.ip_address);
        }
        ips
    }

    fn seed_three(store: &DataStore) {
        store
            .store_server_entries(
                vec![
                    test_entry("10.0.0.1", "CA", 1),
                    test_entry("10.0.0.2", "US", 1),
                    test_entry("10.0.0.3", "CA", 1),
                ],
                false,
            )
            .unwrap();
    }

    #[test]
    fn promoted_entry_leads_and_region_filter_applies() {
        let store = in_memory_store();
        seed_three(&store);
        let config = region_config("CA", 1);

        store.promote_server_entry(&config, "10.0.0.1").unwrap();

        let (apply_affinity, mut iterator) = ServerEntryIterator::new(&store, &config).unwrap();
        assert!(apply_affinity);
        // 10.0.0.1 holds the rank head; 10.0.0.2 is filtered out; only
        // 10.0.0.3 remains in the shuffled tail.
        assert_eq!(drain(&mut iterator), vec!["10.0.0.1", "10.0.0.3"]);
    }

    #[test]
    fn filter_change_revokes_affinity() {
        let store = in_memory_store();
        seed_three(&store);

        store
            .promote_server_entry(&region_config("CA", 1), "10.0.0.1")
            .unwrap();

        let config = region_config("US", 1);
        let (apply_affinity, mut iterator) = ServerEntryIterator::new(&store, &config).unwrap();
        assert!(!apply_affinity);
        assert_eq!(drain(&mut iterator), vec!["10.0.0.2"]);
    }

    #[test]
    fn unranked_entries_reachable_from_shuffled_tail() {
        let store = in_memory_store();
        for i in 0..150 {
            store
                .store_server_entry(&test_entry(&format!("10.0.{}.{}", i / 250, i % 250), "CA", 1), false)
                .unwrap();
        }

        let (_, mut iterator) =
            ServerEntryIterator::new(&store, &region_config("", 1)).unwrap();
        let mut ips = drain(&mut iterator);
        assert_eq!(ips.len(), 150);
        ips.sort();
        ips.dedup();
        assert_eq!(ips.len(), 150);
    }

    #[test]
    fn reset_rewinds_to_start() {
        let store = in_memory_store();
        seed_three(&store);
        let config = region_config("", 3);

        let (_, mut iterator) = ServerEntryIterator::new(&store, &config).unwrap();
        let first_pass = drain(&mut iterator);
        assert_eq!(first_pass.len(), 3);
        assert!(iterator.next_entry().unwrap().is_none());

        iterator.reset().unwrap();
        assert_eq!(drain(&mut iterator).len(), 3);
    }

    #[test]
    fn corrupt_record_skipped_with_alert() {
        let (store, sink) = capturing_store();
        seed_three(&store);
        store
            .update(|txn| {
                let mut entries = txn.open_table(SERVER_ENTRIES).map_err(map_err!(Table))?;
                entries
                    .insert("10.0.0.2", b"\x00garbage".as_slice())
                    .map_err(map_err!(Write))?;
                Ok(())
            })
            .unwrap();

        let (_, mut iterator) =
            ServerEntryIterator::new(&store, &region_config("", 1)).unwrap();
        let mut ips = drain(&mut iterator);
        ips.sort();

        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.3"]);
        assert_eq!(sink.alerts().len(), 1);
    }

    #[test]
    fn missing_ranked_record_skipped() {
        let (store, sink) = capturing_store();
        seed_three(&store);
        store
            .update(|txn| {
                let mut entries = txn.open_table(SERVER_ENTRIES).map_err(map_err!(Table))?;
                entries.remove("10.0.0.3").map_err(map_err!(Write))?;
                Ok(())
            })
            .unwrap();

        // The ranked vector still references 10.0.0.3.
        let (_, mut iterator) =
            ServerEntryIterator::new(&store, &region_config("", 1)).unwrap();
        let mut ips = drain(&mut iterator);
        ips.sort();

        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(sink.alerts().len(), 1);
    }

    #[test]
    fn tactics_iterator_filters_on_capability() {
        let store = in_memory_store();
        let mut capable = test_entry("10.0.0.1", "CA", 1);
        capable.tactics_protocols = vec!["QUIC-OSSH".to_string()];
        store.store_server_entry(&capable, false).unwrap();
        store
            .store_server_entry(&test_entry("10.0.0.2", "US", 1), false)
            .unwrap();

        let mut iterator =
            ServerEntryIterator::new_tactics(&store, &Config::default()).unwrap();
        assert_eq!(drain(&mut iterator), vec!["10.0.0.1"]);
    }

    #[test]
    fn target_override_yields_exactly_one() {
        let store = in_memory_store();
        seed_three(&store);

        let target = test_entry("203.0.113.7", "CA", 1);
        let config = Config {
            target_server_entry: encode_server_entry(&target).unwrap(),
            ..region_config("CA", 1)
        };

        let (apply_affinity, mut iterator) = ServerEntryIterator::new(&store, &config).unwrap();
        assert!(!apply_affinity);
        assert_eq!(drain(&mut iterator), vec!["203.0.113.7"]);

        iterator.reset().unwrap();
        assert_eq!(drain(&mut iterator), vec!["203.0.113.7"]);
    }

    #[test]
    fn target_override_must_match_region() {
        let store = in_memory_store();
        let target = test_entry("203.0.113.7", "CA", 1);
        let config = Config {
            target_server_entry: encode_server_entry(&target).unwrap(),
            ..region_config("US", 1)
        };

        assert!(matches!(
            ServerEntryIterator::new(&store, &config),
            Err(StoreError::InvalidEntry(_))
        ));
    }

    #[test]
    fn target_override_must_pass_protocol_limits() {
        let store = in_memory_store();
        let target = test_entry("203.0.113.7", "CA", 1);
        let mut config = Config {
            target_server_entry: encode_server_entry(&target).unwrap(),
            ..region_config("CA", 1)
        };
        config.parameters.limit_tunnel_protocols = vec!["FRONTED-MEEK".to_string()];

        assert!(matches!(
            ServerEntryIterator::new(&store, &config),
            Err(StoreError::InvalidEntry(_))
        ));
    }

    #[test]
    fn target_override_for_tactics_requires_capability() {
        let store = in_memory_store();
        let target = test_entry("203.0.113.7", "CA", 1);
        let config = Config {
            target_server_entry: encode_server_entry(&target).unwrap(),
            ..Config::default()
        };

        assert!(ServerEntryIterator::new_tactics(&store, &config).is_err());

        let mut capable = target;
        capable.tactics_protocols = vec!["QUIC-OSSH".to_string()];
        let config = Config {
            target_server_entry: encode_server_entry(&capable).unwrap(),
            ..Config::default()
        };
        let mut iterator = ServerEntryIterator::new_tactics(&store, &config).unwrap();
        assert_eq!(drain(&mut iterator), vec!["203.0.113.7"]);
    }

    #[test]
    fn fronting_domain_copied_into_addresses() {
        let store = in_memory_store();
        let mut entry = test_entry("10.0.0.1", "CA", 1);
        entry.meek_fronting_domain = "cdn.example.com".to_string();
        store.store_server_entry(&entry, false).unwrap();

        let (_, mut iterator) =
            ServerEntryIterator::new(&store, &region_config("", 1)).unwrap();
        let yielded = iterator.next_entry().unwrap().unwrap();
        assert_eq!(yielded.meek_fronting_addresses, vec!["cdn.example.com"]);
    }

    #[test]
    fn closed_store_surfaces_from_next_entry() {
        let store = in_memory_store();
        seed_three(&store);
        let (_, mut iterator) =
            ServerEntryIterator::new(&store, &region_config("", 1)).unwrap();

        store.close();
        assert!(matches!(
            iterator.next_entry(),
            Err(StoreError::Closed)
        ));
    }
}
