//! Durable at-least-once persistent stat queue.
//!
//! A persistent stat is a report that must eventually reach a server. Each
//! record is keyed by its full JSON bytes — assumed unique within a stat
//! type — and carries a one-byte state: unreported records are candidates
//! for take-out; reporting records have been taken out and are pending
//! either deletion (request succeeded) or restoration (request failed).
//!
//! Every record is reverted to unreported when the datastore opens: after
//! a crash there is no way to know whether in-flight reports arrived, so
//! they are retransmitted and duplicates are the server's problem.

use std::collections::HashMap;

use redb::{ReadableTable, TableDefinition};

use crate::error::{map_err, StoreError, StoreResult};
use crate::store::DataStore;
use crate::tables::REMOTE_SERVER_LIST_STATS;

/// Stat type for remote server list download stats.
pub const PERSISTENT_STAT_TYPE_REMOTE_SERVER_LIST: &str = "remoteServerListStats";

/// The closed set of registered stat types. One bucket per type.
const PERSISTENT_STAT_TYPES: &[&str] = &[PERSISTENT_STAT_TYPE_REMOTE_SERVER_LIST];

const STATE_UNREPORTED: &[u8] = b"0";
const STATE_REPORTING: &[u8] = b"1";

fn stat_table(
    stat_type: &str,
) -> Option<TableDefinition<'static, &'static [u8], &'static [u8]>> {
    match stat_type {
        PERSISTENT_STAT_TYPE_REMOTE_SERVER_LIST => Some(REMOTE_SERVER_LIST_STATS),
        _ => None,
    }
}

impl DataStore {
    /// Queue a new stat record, immediately a candidate for reporting.
    ///
    /// `stat` is a JSON byte array with enough unique content to function
    /// as a key within its type.
    pub fn store_persistent_stat(&self, stat_type: &str, stat: &[u8]) -> StoreResult<()> {
        let table = stat_table(stat_type)
            .ok_or_else(|| StoreError::UnknownStatType(stat_type.to_string()))?;

        self.update(|txn| {
            let mut records = txn.open_table(table).map_err(map_err!(Table))?;
            records
                .insert(stat, STATE_UNREPORTED)
                .map_err(map_err!(Write))?;
            Ok(())
        })
    }

    /// Total number of stat records in the unreported state, across all
    /// stat types.
    pub fn count_unreported_persistent_stats(&self) -> StoreResult<usize> {
        self.view(|txn| {
            let mut unreported = 0;
            for &stat_type in PERSISTENT_STAT_TYPES {
                let Some(table) = stat_table(stat_type) else {
                    continue;
                };
                let records = txn.open_table(table).map_err(map_err!(Table))?;
                for item in records.iter().map_err(map_err!(Read))? {
                    let (_, value) = item.map_err(map_err!(Read))?;
                    if value.value() == STATE_UNREPORTED {
                        unreported += 1;
                    }
                }
            }
            Ok(unreported)
        })
    }

    /// Move up to `max_count` unreported records to the reporting state
    /// and return them keyed by stat type. The selection and the state
    /// transition commit together, so no concurrent take-out can observe
    /// the same records as unreported.
    ///
    /// Successfully reported records are removed with
    /// [`DataStore::clear_reported_persistent_stats`]; failed ones are
    /// restored with [`DataStore::put_back_unreported_persistent_stats`].
    pub fn take_out_unreported_persistent_stats(
        &self,
        max_count: usize,
    ) -> StoreResult<HashMap<String, Vec<Vec<u8>>>> {
        self.update(|txn| {
            let mut stats: HashMap<String, Vec<Vec<u8>>> = HashMap::new();
            let mut count = 0;

            for &stat_type in PERSISTENT_STAT_TYPES {
                let Some(table) = stat_table(stat_type) else {
                    continue;
                };
                let mut records = txn.open_table(table).map_err(map_err!(Table))?;

                let mut taken: Vec<Vec<u8>> = Vec::new();
                for item in records.iter().map_err(map_err!(Read))? {
                    if count >= max_count {
                        break;
                    }
                    let (key, value) = item.map_err(map_err!(Read))?;
                    let key_bytes = key.value();

                    // A key that does not parse as JSON cannot be reported;
                    // leave it unreported and move on.
                    if serde_json::from_slice::<serde_json::Value>(key_bytes).is_err() {
                        self.notices()
                            .alert(&format!("invalid persistent stat key in {stat_type}"));
                        continue;
                    }

                    if value.value() == STATE_UNREPORTED {
                        taken.push(key_bytes.to_vec());
                        count += 1;
                    }
                }

                for key in &taken {
                    records
                        .insert(key.as_slice(), STATE_REPORTING)
                        .map_err(map_err!(Write))?;
                }
                if !taken.is_empty() {
                    stats.insert(stat_type.to_string(), taken);
                }
            }

            Ok(stats)
        })
    }

    /// Delete records that were successfully reported.
    pub fn clear_reported_persistent_stats(
        &self,
        stats: &HashMap<String, Vec<Vec<u8>>>,
    ) -> StoreResult<()> {
        self.update(|txn| {
            for &stat_type in PERSISTENT_STAT_TYPES {
                let Some(table) = stat_table(stat_type) else {
                    continue;
                };
                let Some(keys) = stats.get(stat_type) else {
                    continue;
                };
                let mut records = txn.open_table(table).map_err(map_err!(Table))?;
                for key in keys {
                    records.remove(key.as_slice()).map_err(map_err!(Write))?;
                }
            }
            Ok(())
        })
    }

    /// Restore records whose report failed to the unreported state.
    pub fn put_back_unreported_persistent_stats(
        &self,
        stats: &HashMap<String, Vec<Vec<u8>>>,
    ) -> StoreResult<()> {
        self.update(|txn| {
            for &stat_type in PERSISTENT_STAT_TYPES {
                let Some(table) = stat_table(stat_type) else {
                    continue;
                };
                let Some(keys) = stats.get(stat_type) else {
                    continue;
                };
                let mut records = txn.open_table(table).map_err(map_err!(Table))?;
                for key in keys {
                    records
                        .insert(key.as_slice(), STATE_UNREPORTED)
                        .map_err(map_err!(Write))?;
                }
            }
            Ok(())
        })
    }

    /// Revert every stat record to unreported. Run at open: whether
    /// reporting records reached the server before the last shutdown or
    /// crash is unknown.
    pub(crate) fn reset_all_persistent_stats_to_unreported(&self) -> StoreResult<()> {
        self.update(|txn| {
            for &stat_type in PERSISTENT_STAT_TYPES {
                let Some(table) = stat_table(stat_type) else {
                    continue;
                };
                let mut records = txn.open_table(table).map_err(map_err!(Table))?;
                let keys: Vec<Vec<u8>> = {
                    let mut keys = Vec::new();
                    for item in records.iter().map_err(map_err!(Read))? {
                        let (key, _) = item.map_err(map_err!(Read))?;
                        keys.push(key.value().to_vec());
                    }
                    keys
                };
                for key in keys {
                    records
                        .insert(key.as_slice(), STATE_UNREPORTED)
                        .map_err(map_err!(Write))?;
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{capturing_store, in_memory_store, test_config, tracing_sink};

    fn stat(id: u32) -> Vec<u8> {
        format!(r#"{{"url":"https://example.com/list","etag":"{id}"}}"#).into_bytes()
    }

    fn taken_keys(stats: &HashMap<String, Vec<Vec<u8>>>) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = stats.values().flatten().cloned().collect();
        keys.sort();
        keys
    }

    #[test]
    fn unknown_stat_type_is_rejected() {
        let store = in_memory_store();
        assert!(matches!(
            store.store_persistent_stat("tunnelStats", &stat(1)),
            Err(StoreError::UnknownStatType(_))
        ));
    }

    #[test]
    fn stored_stats_are_unreported_candidates() {
        let store = in_memory_store();
        store
            .store_persistent_stat(PERSISTENT_STAT_TYPE_REMOTE_SERVER_LIST, &stat(1))
            .unwrap();
        store
            .store_persistent_stat(PERSISTENT_STAT_TYPE_REMOTE_SERVER_LIST, &stat(2))
            .unwrap();

        assert_eq!(store.count_unreported_persistent_stats().unwrap(), 2);
    }

    #[test]
    fn take_out_marks_reporting_and_respects_max() {
        let store = in_memory_store();
        for id in 0..4 {
            store
                .store_persistent_stat(PERSISTENT_STAT_TYPE_REMOTE_SERVER_LIST, &stat(id))
                .unwrap();
        }

        let first = store.take_out_unreported_persistent_stats(3).unwrap();
        assert_eq!(taken_keys(&first).len(), 3);
        assert_eq!(store.count_unreported_persistent_stats().unwrap(), 1);

        // A second take-out only sees what the first left behind.
        let second = store.take_out_unreported_persistent_stats(10).unwrap();
        assert_eq!(taken_keys(&second).len(), 1);
        for key in taken_keys(&second) {
            assert!(!taken_keys(&first).contains(&key));
        }
        assert_eq!(store.count_unreported_persistent_stats().unwrap(), 0);
    }

    #[test]
    fn clear_deletes_taken_records() {
        let store = in_memory_store();
        store
            .store_persistent_stat(PERSISTENT_STAT_TYPE_REMOTE_SERVER_LIST, &stat(1))
            .unwrap();

        let taken = store.take_out_unreported_persistent_stats(10).unwrap();
        store.clear_reported_persistent_stats(&taken).unwrap();

        assert_eq!(store.count_unreported_persistent_stats().unwrap(), 0);
        assert!(store
            .take_out_unreported_persistent_stats(10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn put_back_requeues_taken_records() {
        let store = in_memory_store();
        store
            .store_persistent_stat(PERSISTENT_STAT_TYPE_REMOTE_SERVER_LIST, &stat(1))
            .unwrap();
        store
            .store_persistent_stat(PERSISTENT_STAT_TYPE_REMOTE_SERVER_LIST, &stat(2))
            .unwrap();

        let taken = store.take_out_unreported_persistent_stats(10).unwrap();
        assert_eq!(store.count_unreported_persistent_stats().unwrap(), 0);

        store.put_back_unreported_persistent_stats(&taken).unwrap();
        assert_eq!(store.count_unreported_persistent_stats().unwrap(), 2);

        let again = store.take_out_unreported_persistent_stats(10).unwrap();
        assert_eq!(taken_keys(&again), taken_keys(&taken));
    }

    #[test]
    fn invalid_json_keys_left_unreported() {
        let (store, sink) = capturing_store();
        store
            .store_persistent_stat(PERSISTENT_STAT_TYPE_REMOTE_SERVER_LIST, b"not json")
            .unwrap();
        store
            .store_persistent_stat(PERSISTENT_STAT_TYPE_REMOTE_SERVER_LIST, &stat(1))
            .unwrap();

        let taken = store.take_out_unreported_persistent_stats(10).unwrap();
        assert_eq!(taken_keys(&taken).len(), 1);
        assert_eq!(sink.alerts().len(), 1);
        // The invalid record still counts as unreported.
        assert_eq!(store.count_unreported_persistent_stats().unwrap(), 1);
    }

    #[test]
    fn reporting_records_requeued_after_crash_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        {
            let store = crate::DataStore::open(&config, tracing_sink()).unwrap();
            store
                .store_persistent_stat(PERSISTENT_STAT_TYPE_REMOTE_SERVER_LIST, &stat(1))
                .unwrap();
            store
                .store_persistent_stat(PERSISTENT_STAT_TYPE_REMOTE_SERVER_LIST, &stat(2))
                .unwrap();

            let taken = store.take_out_unreported_persistent_stats(10).unwrap();
            assert_eq!(taken_keys(&taken).len(), 2);
            assert_eq!(store.count_unreported_persistent_stats().unwrap(), 0);

            // Crash: neither clear nor put-back runs.
            store.close();
        }

        let store = crate::DataStore::open(&config, tracing_sink()).unwrap();
        assert_eq!(store.count_unreported_persistent_stats().unwrap(), 2);

        let retaken = store.take_out_unreported_persistent_stats(10).unwrap();
        let mut expected = vec![stat(1), stat(2)];
        expected.sort();
        assert_eq!(taken_keys(&retaken), expected);
    }
}
