//! Datastore lifecycle: open, close, and transaction combinators.
//!
//! The [`DataStore`] is a cheaply-clonable handle (`Arc` inner) meant to be
//! owned by the application's composition root and passed to the
//! subsystems that need it. Exactly one handle chain may be attached to a
//! given datastore file; a second open observes the engine's file lock and
//! fails with [`StoreError::AlreadyOpen`].
//!
//! Corruption is an expected failure mode on mobile filesystems: an open
//! or integrity-check failure deletes the file and starts over, up to
//! three attempts, so a damaged datastore costs the cached state but never
//! wedges the client.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use redb::{Database, DatabaseError, ReadTransaction, WriteTransaction};
use slipstream_core::{Config, NoticeSink};
use tracing::debug;

use crate::error::{map_err, StoreError, StoreResult};
use crate::tables;

/// Name of the datastore file within the configured data directory.
pub const DATA_STORE_FILENAME: &str = "psiphon.boltdb";

const OPEN_ATTEMPTS: u32 = 3;
const FILE_LOCK_TIMEOUT: Duration = Duration::from_secs(1);
const FILE_LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Handle to the embedded datastore. Clones share one attachment.
#[derive(Clone)]
pub struct DataStore {
    inner: Arc<Inner>,
}

struct Inner {
    /// Published database handle; `None` after close. Readers clone the
    /// `Arc` for the duration of one transaction, so in-flight
    /// transactions finish even when close races them.
    db: RwLock<Option<Arc<Database>>>,
    notices: Arc<dyn NoticeSink>,
}

impl DataStore {
    /// Open (or create) the datastore file under
    /// `config.data_store_directory` and run the post-open sequence:
    /// bucket bootstrap, obsolete-bucket sweep, and persistent-stat crash
    /// recovery.
    pub fn open(config: &Config, notices: Arc<dyn NoticeSink>) -> StoreResult<Self> {
        let path = config.data_store_directory.join(DATA_STORE_FILENAME);

        let mut last_error = String::new();
        for attempt in 0..OPEN_ATTEMPTS {
            if attempt > 0 {
                notices.alert(&format!("datastore open retry: {attempt}"));
            }

            let db = match Self::attach(&path) {
                Ok(db) => db,
                Err(StoreError::AlreadyOpen) => return Err(StoreError::AlreadyOpen),
                Err(e) => {
                    // The file may be corrupt; delete it and start over.
                    notices.alert(&format!("datastore attach failed: {e}"));
                    let _ = fs::remove_file(&path);
                    last_error = e.to_string();
                    continue;
                }
            };

            let store = Self::publish(db, Arc::clone(&notices));
            store.bootstrap()?;
            debug!(?path, "datastore opened");
            return Ok(store);
        }

        Err(StoreError::OpenFailed(format!(
            "{OPEN_ATTEMPTS} attempts: {last_error}"
        )))
    }

    /// Open an ephemeral in-memory datastore (for testing). Runs the same
    /// post-open sequence as [`DataStore::open`].
    pub fn open_in_memory(notices: Arc<dyn NoticeSink>) -> StoreResult<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| StoreError::OpenFailed(e.to_string()))?;

        let store = Self::publish(db, notices);
        store.bootstrap()?;
        debug!("in-memory datastore opened");
        Ok(store)
    }

    /// Attach to the file at `path`, waiting out a held file lock for up
    /// to one second, and verify structural integrity.
    fn attach(path: &Path) -> StoreResult<Database> {
        let deadline = Instant::now() + FILE_LOCK_TIMEOUT;
        let mut db = loop {
            match Database::create(path) {
                Ok(db) => break db,
                Err(DatabaseError::DatabaseAlreadyOpen) => {
                    if Instant::now() >= deadline {
                        return Err(StoreError::AlreadyOpen);
                    }
                    thread::sleep(FILE_LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(StoreError::OpenFailed(e.to_string())),
            }
        };

        // The file is private to this client installation.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
        }

        db.check_integrity()
            .map_err(|e| StoreError::OpenFailed(e.to_string()))?;

        Ok(db)
    }

    fn publish(db: Database, notices: Arc<dyn NoticeSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                db: RwLock::new(Some(Arc::new(db))),
                notices,
            }),
        }
    }

    fn bootstrap(&self) -> StoreResult<()> {
        // Idempotent: opening a table in a write transaction creates it if
        // absent.
        self.update(|txn| {
            txn.open_table(tables::SERVER_ENTRIES).map_err(map_err!(Table))?;
            txn.open_table(tables::RANKED_SERVER_ENTRIES)
                .map_err(map_err!(Table))?;
            txn.open_table(tables::SPLIT_TUNNEL_ROUTE_ETAGS)
                .map_err(map_err!(Table))?;
            txn.open_table(tables::SPLIT_TUNNEL_ROUTE_DATA)
                .map_err(map_err!(Table))?;
            txn.open_table(tables::URL_ETAGS).map_err(map_err!(Table))?;
            txn.open_table(tables::KEY_VALUES).map_err(map_err!(Table))?;
            txn.open_table(tables::REMOTE_SERVER_LIST_STATS)
                .map_err(map_err!(Table))?;
            txn.open_table(tables::SLOKS).map_err(map_err!(Table))?;
            txn.open_table(tables::TACTICS).map_err(map_err!(Table))?;
            txn.open_table(tables::SPEED_TEST_SAMPLES)
                .map_err(map_err!(Table))?;
            Ok(())
        })?;

        // Old clients left a per-session tunnel stats bucket behind; its
        // removal is best-effort.
        let swept = self.update(|txn| {
            txn.delete_table(tables::OBSOLETE_TUNNEL_STATS)
                .map_err(map_err!(Table))
        });
        if let Err(e) = swept {
            self.notices()
                .alert(&format!("failed to drop obsolete tunnelStats bucket: {e}"));
        }

        // Whether in-flight reports reached the server is unknown after a
        // crash, so every stat record is re-queued. Unlike the sweep above
        // this must succeed for the queue's delivery contract to hold.
        self.reset_all_persistent_stats_to_unreported()
    }

    /// Release the datastore. In-flight transactions complete; subsequent
    /// operations fail with [`StoreError::Closed`]. Closing twice is a
    /// no-op.
    pub fn close(&self) {
        let mut slot = self.inner.db.write();
        if slot.take().is_some() {
            debug!("datastore closed");
        }
    }

    pub(crate) fn notices(&self) -> &dyn NoticeSink {
        self.inner.notices.as_ref()
    }

    fn handle(&self) -> StoreResult<Arc<Database>> {
        self.inner.db.read().clone().ok_or(StoreError::Closed)
    }

    /// Run `f` inside a read-only transaction. Concurrent views may run;
    /// each observes a consistent snapshot. Byte slices read from tables
    /// borrow from the transaction and must be copied before it ends.
    pub(crate) fn view<T>(
        &self,
        f: impl FnOnce(&ReadTransaction) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let db = self.handle()?;
        let txn = db.begin_read().map_err(map_err!(Transaction))?;
        f(&txn)
    }

    /// Run `f` inside a serialized read-write transaction. Commits when
    /// `f` succeeds; aborts when it fails.
    pub(crate) fn update<T>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let db = self.handle()?;
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        let value = f(&txn)?;
        txn.commit().map_err(map_err!(Commit))?;
        Ok(value)
    }
}
