//! Storage handle for the external tactics subsystem.

use crate::error::{map_err, StoreResult};
use crate::store::DataStore;
use crate::tables::{SPEED_TEST_SAMPLES, TACTICS};

/// Implements the storage interface the tactics subsystem expects: opaque
/// record blobs keyed by network identity. Holds no state of its own;
/// every call delegates to the datastore.
#[derive(Clone)]
pub struct TacticsStorer {
    store: DataStore,
}

impl DataStore {
    /// Handle for the tactics subsystem to persist its records through.
    pub fn tactics_storer(&self) -> TacticsStorer {
        TacticsStorer {
            store: self.clone(),
        }
    }
}

impl TacticsStorer {
    pub fn set_tactics_record(&self, network_id: &str, record: &[u8]) -> StoreResult<()> {
        self.store.update(|txn| {
            let mut records = txn.open_table(TACTICS).map_err(map_err!(Table))?;
            records.insert(network_id, record).map_err(map_err!(Write))?;
            Ok(())
        })
    }

    pub fn get_tactics_record(&self, network_id: &str) -> StoreResult<Option<Vec<u8>>> {
        self.store.view(|txn| {
            let records = txn.open_table(TACTICS).map_err(map_err!(Table))?;
            Ok(records
                .get(network_id)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec()))
        })
    }

    pub fn set_speed_test_samples_record(
        &self,
        network_id: &str,
        record: &[u8],
    ) -> StoreResult<()> {
        self.store.update(|txn| {
            let mut records = txn
                .open_table(SPEED_TEST_SAMPLES)
                .map_err(map_err!(Table))?;
            records.insert(network_id, record).map_err(map_err!(Write))?;
            Ok(())
        })
    }

    pub fn get_speed_test_samples_record(&self, network_id: &str) -> StoreResult<Option<Vec<u8>>> {
        self.store.view(|txn| {
            let records = txn
                .open_table(SPEED_TEST_SAMPLES)
                .map_err(map_err!(Table))?;
            Ok(records
                .get(network_id)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec()))
        })
    }
}
