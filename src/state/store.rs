//! Durable, observable key-value storage.
//!
//! Every top-level collection is stored as one JSON payload in a single
//! SQLite table, keyed by name. Writes to one key are atomic; there is no
//! cross-key guarantee unless both writes happen in one [`Store::transaction`].
//!
//! Observers register per key with [`Store::subscribe`]. Writes through this
//! handle (or any clone of it) notify them right away. Changes committed by
//! another connection to the same file are picked up by
//! [`Store::poll_external_changes`], which compares SQLite's `data_version`.
//!
//! Every delivery carries a sequence number taken while the connection is
//! locked, so it matches commit order. A subscriber never sees a value older
//! than one it has already been given, even when commits on different
//! threads race to notify.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::StoreError;

type Callback = Box<dyn Fn(Option<&str>) + Send + Sync>;

struct Subscriber {
    id: u64,
    delivery: Arc<Delivery>,
}

/// One subscriber's callback plus the sequence of the last value it got.
struct Delivery {
    last_seq: Mutex<u64>,
    callback: Callback,
}

impl Delivery {
    fn new(callback: Callback) -> Self {
        Self {
            last_seq: Mutex::new(0),
            callback,
        }
    }

    fn deliver(&self, seq: u64, raw: Option<&str>) {
        let mut last = lock(&self.last_seq);
        if seq <= *last {
            debug!(seq, last = *last, "Dropped out-of-order delivery");
            return;
        }
        *last = seq;
        (self.callback)(raw);
    }
}

struct StoreInner {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_subscriber_id: AtomicU64,
    /// Last `PRAGMA data_version` seen by this connection
    data_version: AtomicI64,
    /// Bumped under the `conn` lock on every commit or reload
    commit_seq: AtomicU64,
}

/// Handle to the persistent store. Clones share one connection and one set
/// of subscribers.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Open (or create) a store backed by the SQLite file at `path`.
    ///
    /// Parent directories are created as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        // Independent instances on the same file queue behind each other's
        // write transactions instead of failing with SQLITE_BUSY.
        conn.busy_timeout(Duration::from_secs(5))?;

        let store = Self::from_connection(conn, Some(path.to_path_buf()))?;
        info!(path = %path.display(), "Store opened");
        Ok(store)
    }

    /// A store that lives only as long as this handle. Used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, db_path: Option<PathBuf>) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        let version = data_version(&conn)?;

        Ok(Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                db_path,
                subscribers: Mutex::new(HashMap::new()),
                next_subscriber_id: AtomicU64::new(0),
                data_version: AtomicI64::new(version),
                commit_seq: AtomicU64::new(0),
            }),
        })
    }

    /// Path of the backing database, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.inner.db_path.as_deref()
    }

    /// Read the value stored under `key`.
    ///
    /// Returns `default` when the key was never written or its payload can't
    /// be decoded as `T`.
    pub fn read<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        let raw = {
            let conn = lock(&self.inner.conn);
            load_raw_or_warn(&conn, key)
        };
        decode_or_default(key, raw.as_deref(), default)
    }

    /// Persist `value` under `key` and notify its subscribers.
    pub fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let payload = encode(key, value)?;
        let seq = {
            let conn = lock(&self.inner.conn);
            save_raw(&conn, key, &payload)?;
            self.next_seq()
        };
        debug!(key, bytes = payload.len(), seq, "Persisted entry");
        self.notify(seq, key, Some(&payload));
        Ok(())
    }

    /// Run a read-modify-write sequence as one write transaction.
    ///
    /// The transaction is started with `BEGIN IMMEDIATE`, so it is serialized
    /// against every other writer of the same database, including other
    /// `Store` instances. If `f` returns an error nothing is committed.
    /// Subscribers of the keys written by `f` are notified after commit.
    pub fn transaction<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut StoreTransaction<'_>) -> Result<R, E>,
        E: From<StoreError>,
    {
        let (result, written, seq) = {
            let mut conn = lock(&self.inner.conn);
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(StoreError::from)?;

            let mut store_tx = StoreTransaction {
                tx,
                written: Vec::new(),
            };
            let result = f(&mut store_tx)?;

            let StoreTransaction { tx, written } = store_tx;
            tx.commit().map_err(StoreError::from)?;
            (result, written, self.next_seq())
        };

        for (key, payload) in &written {
            debug!(key = %key, bytes = payload.len(), seq, "Persisted entry");
            self.notify(seq, key, Some(payload));
        }
        Ok(result)
    }

    /// Call `callback` with the decoded value of `key` every time it changes.
    ///
    /// An undecodable payload is delivered as `default`. The subscription
    /// lasts until the returned handle is dropped. Deliveries to one
    /// subscriber are serialized, so `callback` must not write to this store.
    pub fn subscribe<T, F>(&self, key: &str, default: T, callback: F) -> Subscription
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.register(key, default, callback).0
    }

    /// Like [`Store::subscribe`], but also hands `callback` the current value
    /// of `key` right away.
    ///
    /// The initial value is ordered with concurrent writes: a commit that
    /// lands while subscribing is never overwritten by an older snapshot.
    pub fn subscribe_current<T, F>(&self, key: &str, default: T, callback: F) -> Subscription
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let (subscription, delivery) = self.register(key, default, callback);

        let (seq, raw) = {
            let conn = lock(&self.inner.conn);
            (self.next_seq(), load_raw_or_warn(&conn, key))
        };
        delivery.deliver(seq, raw.as_deref());
        subscription
    }

    fn register<T, F>(&self, key: &str, default: T, callback: F) -> (Subscription, Arc<Delivery>)
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let owned_key = key.to_string();
        let delivery = Arc::new(Delivery::new(Box::new(move |raw: Option<&str>| {
            callback(decode_or_default(&owned_key, raw, default.clone()))
        })));

        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.subscribers)
            .entry(key.to_string())
            .or_default()
            .push(Subscriber {
                id,
                delivery: Arc::clone(&delivery),
            });

        let subscription = Subscription {
            store: Arc::downgrade(&self.inner),
            key: key.to_string(),
            id,
        };
        (subscription, delivery)
    }

    /// Check whether another connection committed to the database since the
    /// last check, and if so re-deliver every subscribed key.
    ///
    /// Returns `true` if a change was detected. Best-effort: subscribers get
    /// the current value, not every intermediate one.
    pub fn poll_external_changes(&self) -> Result<bool, StoreError> {
        let (seq, changed): (u64, Vec<(String, Option<String>)>) = {
            let conn = lock(&self.inner.conn);
            let version = data_version(&conn)?;
            let previous = self.inner.data_version.swap(version, Ordering::SeqCst);
            if previous == version {
                return Ok(false);
            }

            let keys: Vec<String> = lock(&self.inner.subscribers).keys().cloned().collect();
            let mut changed = Vec::with_capacity(keys.len());
            for key in keys {
                let raw = load_raw(&conn, &key)?;
                changed.push((key, raw));
            }
            (self.next_seq(), changed)
        };

        info!(keys = changed.len(), seq, "Detected changes from another connection");
        for (key, raw) in &changed {
            self.notify(seq, key, raw.as_deref());
        }
        Ok(true)
    }

    /// Poll for external changes every `interval` until the store is dropped.
    pub fn spawn_change_watcher(&self, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    debug!("Store dropped, stopping change watcher");
                    break;
                };
                let store = Store { inner };
                if let Err(e) = store.poll_external_changes() {
                    warn!(error = %e, "Failed to poll for external changes");
                }
            }
        })
    }

    /// Must be called with the `conn` lock held.
    fn next_seq(&self) -> u64 {
        self.inner.commit_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn notify(&self, seq: u64, key: &str, raw: Option<&str>) {
        // Collect first: callbacks may subscribe/unsubscribe or read the store.
        let deliveries: Vec<Arc<Delivery>> = lock(&self.inner.subscribers)
            .get(key)
            .map(|subs| subs.iter().map(|s| Arc::clone(&s.delivery)).collect())
            .unwrap_or_default();

        for delivery in deliveries {
            delivery.deliver(seq, raw);
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("db_path", &self.inner.db_path)
            .finish()
    }
}

/// Reads and writes inside one [`Store::transaction`].
pub struct StoreTransaction<'conn> {
    tx: rusqlite::Transaction<'conn>,
    written: Vec<(String, String)>,
}

impl StoreTransaction<'_> {
    /// Same contract as [`Store::read`], seeing this transaction's writes.
    pub fn read<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        let raw = load_raw_or_warn(&self.tx, key);
        decode_or_default(key, raw.as_deref(), default)
    }

    pub fn write<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
        let payload = encode(key, value)?;
        save_raw(&self.tx, key, &payload)?;

        self.written.retain(|(k, _)| k != key);
        self.written.push((key.to_string(), payload));
        Ok(())
    }
}

/// Keeps a [`Store::subscribe`] callback registered. Dropping it unsubscribes.
pub struct Subscription {
    store: Weak<StoreInner>,
    key: String,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.store.upgrade() else {
            return;
        };
        let mut subscribers = lock(&inner.subscribers);
        if let Some(subs) = subscribers.get_mut(&self.key) {
            subs.retain(|s| s.id != self.id);
            if subs.is_empty() {
                subscribers.remove(&self.key);
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

/// Create the entries table if it doesn't exist.
fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS entries (
            key             TEXT PRIMARY KEY,
            value           TEXT NOT NULL,
            updated_at      INTEGER NOT NULL
        )",
        [],
    )?;
    Ok(())
}

fn data_version(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.pragma_query_value(None, "data_version", |row| row.get(0))?)
}

fn load_raw(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row("SELECT value FROM entries WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?)
}

fn load_raw_or_warn(conn: &Connection, key: &str) -> Option<String> {
    match load_raw(conn, key) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(key, error = %e, "Failed to load entry, using default");
            None
        }
    }
}

fn save_raw(conn: &Connection, key: &str, payload: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO entries (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        rusqlite::params![key, payload, Utc::now().timestamp()],
    )?;
    Ok(())
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Serialize {
        key: key.to_string(),
        source,
    })
}

fn decode_or_default<T: DeserializeOwned>(key: &str, raw: Option<&str>, default: T) -> T {
    let Some(raw) = raw else {
        return default;
    };
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!(key, error = %e, "Stored payload is corrupt, using default");
            default
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic inside a callback must not wedge the store for everyone else.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
