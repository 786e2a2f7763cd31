//! slipstream-store — persistent local datastore and server-candidate
//! selection engine for the slipstream tunnel client.
//!
//! Backed by [redb](https://docs.rs/redb), this crate is the sole on-disk
//! state for a running client: server entries and the ranked vector that
//! biases selection toward recently successful relays, cached ETag/route
//! data, opaque key/value slots, SLOK records, tactics blobs, and a
//! reliably-delivered persistent-statistics queue.
//!
//! # Architecture
//!
//! Stored records are JSON-serialized into redb's `&[u8]` value columns;
//! each bucket is one named table. The [`DataStore`] handle is
//! `Clone + Send + Sync` (backed by `Arc`) and is meant to be owned by
//! the application's composition root and shared with the controller,
//! importers, and the tactics subsystem. Candidate iteration snapshots
//! an id list and reads records in short independent transactions, so
//! concurrent imports never block a dial loop.

pub mod cache;
pub mod error;
pub mod iterator;
pub mod registry;
pub mod stats;
pub mod store;
pub mod tables;
pub mod tactics;

mod ranker;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::KEY_VALUE_LAST_CONNECTED;
pub use error::{StoreError, StoreResult};
pub use iterator::ServerEntryIterator;
pub use registry::{server_entry_filter_value, CandidateLimits};
pub use stats::PERSISTENT_STAT_TYPE_REMOTE_SERVER_LIST;
pub use store::{DataStore, DATA_STORE_FILENAME};
pub use tactics::TacticsStorer;
