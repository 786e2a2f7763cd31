//! Shared helpers for the crate's unit tests.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use slipstream_core::{Config, NoticeSink, ServerEntryFields, TracingNoticeSink};

use crate::error::map_err;
use crate::ranker;
use crate::store::DataStore;
use crate::tables::RANKED_SERVER_ENTRIES;

/// Notice sink that records everything it receives.
#[derive(Default)]
pub struct CapturingSink {
    alerts: Mutex<Vec<String>>,
    infos: Mutex<Vec<String>>,
    regions: Mutex<Vec<Vec<String>>>,
}

impl CapturingSink {
    pub fn alerts(&self) -> Vec<String> {
        self.alerts.lock().clone()
    }

    pub fn infos(&self) -> Vec<String> {
        self.infos.lock().clone()
    }

    pub fn regions(&self) -> Vec<Vec<String>> {
        self.regions.lock().clone()
    }
}

impl NoticeSink for CapturingSink {
    fn alert(&self, message: &str) {
        self.alerts.lock().push(message.to_string());
    }

    fn info(&self, message: &str) {
        self.infos.lock().push(message.to_string());
    }

    fn available_egress_regions(&self, regions: &[String]) {
        self.regions.lock().push(regions.to_vec());
    }
}

pub fn tracing_sink() -> Arc<dyn NoticeSink> {
    Arc::new(TracingNoticeSink)
}

pub fn in_memory_store() -> DataStore {
    DataStore::open_in_memory(tracing_sink()).unwrap()
}

pub fn capturing_store() -> (DataStore, Arc<CapturingSink>) {
    let sink = Arc::new(CapturingSink::default());
    let store = DataStore::open_in_memory(sink.clone()).unwrap();
    (store, sink)
}

pub fn test_config(data_dir: &Path) -> Config {
    Config {
        data_store_directory: data_dir.to_path_buf(),
        ..Config::default()
    }
}

pub fn test_entry(ip: &str, region: &str, version: i64) -> ServerEntryFields {
    ServerEntryFields {
        ip_address: ip.to_string(),
        region: region.to_string(),
        configuration_version: version,
        tunnel_protocols: vec!["OSSH".to_string(), "QUIC-OSSH".to_string()],
        ..Default::default()
    }
}

/// Current ranked vector contents.
pub fn ranked_ids(store: &DataStore) -> Vec<String> {
    store
        .view(|txn| {
            let table = txn
                .open_table(RANKED_SERVER_ENTRIES)
                .map_err(map_err!(Table))?;
            ranker::ranked_server_entries(&table, store.notices())
        })
        .unwrap()
}
