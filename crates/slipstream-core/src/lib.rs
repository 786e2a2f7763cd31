//! slipstream-core — shared domain types for the slipstream tunnel client.
//!
//! Holds the pieces every other crate speaks in: server entry fields and
//! their encoding, the read-only client [`Config`] handle, and the
//! [`NoticeSink`] interface through which the engine reports operational
//! events to the embedding application.

pub mod config;
pub mod entry;
pub mod notice;

pub use config::{ClientParameters, Config};
pub use entry::{
    current_timestamp, decode_server_entry, encode_server_entry, validate_server_entry,
    EntryError, ServerEntryFields, SERVER_ENTRY_SOURCE_EMBEDDED, SERVER_ENTRY_SOURCE_REMOTE,
    SERVER_ENTRY_SOURCE_TARGET,
};
pub use notice::{NoticeSink, TracingNoticeSink};
