//! The ranked server entry vector.
//!
//! An ordered list of server IP addresses biasing candidate selection
//! toward recently successful relays. Stored as one JSON array under one
//! key; acceptable because the length is capped, and kept that way so the
//! order needs no separate encoding. All mutation happens inside the
//! caller's write transaction so a rank change commits atomically with
//! the entry write that caused it.

use redb::{ReadableTable, WriteTransaction};
use slipstream_core::NoticeSink;

use crate::error::{map_err, StoreResult};
use crate::tables::RANKED_SERVER_ENTRIES;

/// Cap on the ranked vector length. Large enough that the rank-ordered
/// iterator prefix (the tunnel pool size) always fits with plenty of
/// margin.
pub(crate) const RANKED_SERVER_ENTRY_COUNT: usize = 100;

const RANKED_SERVER_ENTRIES_KEY: &str = "rankedServerEntries";

/// Read the ranked vector from an open table. Absent means empty. A
/// malformed value is reported and treated as empty; the next insert
/// rewrites it.
pub(crate) fn ranked_server_entries<T>(
    table: &T,
    notices: &dyn NoticeSink,
) -> StoreResult<Vec<String>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let Some(guard) = table
        .get(RANKED_SERVER_ENTRIES_KEY)
        .map_err(map_err!(Read))?
    else {
        return Ok(Vec::new());
    };

    match serde_json::from_slice(guard.value()) {
        Ok(ids) => Ok(ids),
        Err(e) => {
            notices.alert(&format!("malformed ranked server entries: {e}"));
            Ok(Vec::new())
        }
    }
}

fn set_ranked_server_entries(txn: &WriteTransaction, ids: &[String]) -> StoreResult<()> {
    let data = serde_json::to_vec(ids).map_err(map_err!(Serialize))?;
    let mut table = txn
        .open_table(RANKED_SERVER_ENTRIES)
        .map_err(map_err!(Table))?;
    table
        .insert(RANKED_SERVER_ENTRIES_KEY, data.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Insert `id` at `position` (clamped to the vector end), de-duplicating
/// and evicting the tail entry when at the cap.
pub(crate) fn insert_ranked_server_entry(
    txn: &WriteTransaction,
    id: &str,
    position: usize,
    notices: &dyn NoticeSink,
) -> StoreResult<()> {
    let mut ranked = {
        let table = txn
            .open_table(RANKED_SERVER_ENTRIES)
            .map_err(map_err!(Table))?;
        ranked_server_entries(&table, notices)?
    };

    // An id that is already ranked moves rather than duplicates.
    if let Some(existing) = ranked.iter().position(|ranked_id| ranked_id == id) {
        ranked.remove(existing);
    }

    if ranked.len() >= RANKED_SERVER_ENTRY_COUNT {
        ranked.pop();
    }
    let position = position.min(ranked.len());
    ranked.insert(position, id.to_string());

    set_ranked_server_entries(txn, &ranked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::in_memory_store;

    fn ranked(store: &crate::DataStore) -> Vec<String> {
        store
            .view(|txn| {
                let table = txn
                    .open_table(RANKED_SERVER_ENTRIES)
                    .map_err(map_err!(Table))?;
                ranked_server_entries(&table, store.notices())
            })
            .unwrap()
    }

    fn insert(store: &crate::DataStore, id: &str, position: usize) {
        store
            .update(|txn| insert_ranked_server_entry(txn, id, position, store.notices()))
            .unwrap();
    }

    #[test]
    fn insert_clamps_position_to_end() {
        let store = in_memory_store();
        insert(&store, "a", 5);
        insert(&store, "b", 5);
        assert_eq!(ranked(&store), vec!["a", "b"]);
    }

    #[test]
    fn insert_at_head_shifts_rest() {
        let store = in_memory_store();
        insert(&store, "a", 0);
        insert(&store, "b", 0);
        insert(&store, "c", 0);
        assert_eq!(ranked(&store), vec!["c", "b", "a"]);
    }

    #[test]
    fn reinserting_moves_instead_of_duplicating() {
        let store = in_memory_store();
        insert(&store, "a", 0);
        insert(&store, "b", 0);
        insert(&store, "c", 0);
        insert(&store, "a", 0);
        assert_eq!(ranked(&store), vec!["a", "c", "b"]);
    }

    #[test]
    fn cap_evicts_tail() {
        let store = in_memory_store();
        for i in 0..150 {
            insert(&store, &format!("id-{i}"), 0);
        }

        let ranked = ranked(&store);
        assert_eq!(ranked.len(), RANKED_SERVER_ENTRY_COUNT);
        // Head is the most recent insert; the 50 oldest fell off the tail.
        assert_eq!(ranked[0], "id-149");
        assert!(!ranked.contains(&"id-49".to_string()));
        assert!(ranked.contains(&"id-50".to_string()));
    }

    #[test]
    fn malformed_vector_recovers_as_empty() {
        let store = in_memory_store();
        store
            .update(|txn| {
                let mut table = txn
                    .open_table(RANKED_SERVER_ENTRIES)
                    .map_err(map_err!(Table))?;
                table
                    .insert(RANKED_SERVER_ENTRIES_KEY, b"{not json".as_slice())
                    .map_err(map_err!(Write))?;
                Ok(())
            })
            .unwrap();

        assert!(ranked(&store).is_empty());
        insert(&store, "a", 0);
        assert_eq!(ranked(&store), vec!["a"]);
    }
}
