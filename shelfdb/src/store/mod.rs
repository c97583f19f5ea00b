mod connection;
mod record;
mod transaction;

pub use connection::{Access, Connection};
pub(crate) use record::RawRow;
pub use record::{CollectionKey, StoredRecord};
pub use transaction::{ReadTransaction, ReadWriteTransaction};

use crate::changes::CommitNotification;
use crate::codec::{CollectionCodec, SerializerRegistry};
use crate::config::StoreConfig;
use crate::error::{Result, ShelfError};
use crate::system_db::{ExtensionRecord, SystemDb};
use crate::view::{RegisteredView, ViewRegistry};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};

const INTERNAL_CONSUMER: &str = "shelfdb.internal";

/// State shared by a store, its connections and every handle bound to it.
pub(crate) struct StoreShared {
    path: PathBuf,
    config: StoreConfig,
    pub(crate) codecs: SerializerRegistry,
    pub(crate) views: ViewRegistry,
    registration: Mutex<()>,
    /// Held for the whole of every read-write transaction.
    pub(crate) write_lock: Mutex<()>,
    connections: Mutex<HashMap<String, Connection>>,
    internal: Connection,
    subscribers: Mutex<Vec<Sender<Arc<CommitNotification>>>>,
}

fn open_connection(path: &Path, config: &StoreConfig) -> Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(path).map_err(|source| ShelfError::Open {
        path: path.display().to_string(),
        source,
    })?;
    SystemDb::configure(&conn, config)?;
    Ok(conn)
}

impl StoreShared {
    pub(crate) fn connection(self: &Arc<Self>, consumer: &str) -> Result<Connection> {
        let mut connections = self
            .connections
            .lock()
            .map_err(|_| ShelfError::LockPoisoned("connection pool"))?;
        if let Some(connection) = connections.get(consumer) {
            return Ok(connection.clone());
        }
        let conn = open_connection(&self.path, &self.config)?;
        let connection = Connection::new(consumer, conn, Arc::downgrade(self));
        connections.insert(consumer.to_string(), connection.clone());
        debug!("opened connection for '{consumer}'");
        Ok(connection)
    }

    pub(crate) fn default_connection(self: &Arc<Self>) -> Result<Connection> {
        self.connection(&self.config.default_consumer)
    }

    /// Bind a collection's codecs. Serialized with view registration.
    ///
    /// Binding a new collection while views over every collection are
    /// registered places its existing records in them, which takes the
    /// store's writer.
    pub(crate) fn register_codec(self: &Arc<Self>, collection: &str, codec: CollectionCodec) -> Result<Arc<CollectionCodec>> {
        let _registration = self
            .registration
            .lock()
            .map_err(|_| ShelfError::LockPoisoned("registration"))?;
        let fresh = self.codecs.lookup(collection).is_none();
        let codec = self.codecs.register(collection, codec)?;

        let adopting = fresh
            && self
                .views
                .all()?
                .iter()
                .any(|view| view.parent.is_none() && view.allowed.is_empty());
        if adopting {
            let _writer = self
                .write_lock
                .lock()
                .map_err(|_| ShelfError::LockPoisoned("store writer"))?;
            self.internal
                .write_locked(self, &[], |tx| tx.adopt_collection(collection))?;
        }
        Ok(codec)
    }

    /// Register a view, or return the registration already holding its name.
    pub(crate) fn register_view(self: &Arc<Self>, view: RegisteredView) -> Result<Arc<RegisteredView>> {
        let _registration = self
            .registration
            .lock()
            .map_err(|_| ShelfError::LockPoisoned("registration"))?;

        if let Some(existing) = self.views.get(&view.name)? {
            existing.check_compatible(&view)?;
            return Ok(existing);
        }
        if let Some(parent) = &view.parent {
            match self.views.get(&parent.name)? {
                Some(registered) if Arc::ptr_eq(&registered, parent) => {}
                _ => {
                    return Err(ShelfError::registration(
                        &view.name,
                        format!("parent '{}' is not registered with this store", parent.name),
                    ))
                }
            }
        }

        let _writer = self
            .write_lock
            .lock()
            .map_err(|_| ShelfError::LockPoisoned("store writer"))?;
        self.internal
            .write_locked(self, &[view.name.as_str()], |tx| tx.install_view(&view))?;
        let view = Arc::new(view);
        self.views.insert(view.clone())?;
        info!("registered {} view '{}'", view.kind, view.name);
        Ok(view)
    }

    pub(crate) fn broadcast(&self, notification: Arc<CommitNotification>) {
        match self.subscribers.lock() {
            Ok(mut subscribers) => {
                subscribers.retain(|subscriber| subscriber.send(notification.clone()).is_ok())
            }
            Err(_) => warn!(
                "subscriber list poisoned, dropping notification for snapshot {}",
                notification.snapshot
            ),
        }
    }
}

/// A store file with its registered collections and views.
///
/// Cloning is cheap; clones share connections, registrations and
/// subscribers. Collections and views bound to the store keep only weak
/// references, so dropping the last `Store` closes it.
#[derive(Clone)]
pub struct Store {
    shared: Arc<StoreShared>,
}

impl Store {
    /// Open or create the store at `path` with default settings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, StoreConfig::default())
    }

    pub fn open_with(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path, &config)?;
        {
            let db = SystemDb::new(&conn);
            db.initialize_tables()?;
            for name in db.purge_non_persistent()? {
                info!("discarded state of non-persistent view '{name}'");
            }
        }

        let shared = Arc::new_cyclic(|weak: &Weak<StoreShared>| StoreShared {
            path,
            config,
            codecs: SerializerRegistry::default(),
            views: ViewRegistry::default(),
            registration: Mutex::new(()),
            write_lock: Mutex::new(()),
            connections: Mutex::new(HashMap::new()),
            internal: Connection::new(INTERNAL_CONSUMER, conn, weak.clone()),
            subscribers: Mutex::new(Vec::new()),
        });
        info!("opened store at {}", shared.path.display());
        Ok(Store { shared })
    }

    pub(crate) fn shared(&self) -> &Arc<StoreShared> {
        &self.shared
    }

    pub(crate) fn downgrade(&self) -> Weak<StoreShared> {
        Arc::downgrade(&self.shared)
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// The connection of `consumer`, opened on first use.
    pub fn connection(&self, consumer: &str) -> Result<Connection> {
        self.shared.connection(consumer)
    }

    /// Connection used by operations given no connection or transaction.
    pub fn default_connection(&self) -> Result<Connection> {
        self.shared.default_connection()
    }

    /// Receive every commit notification published from now on.
    pub fn subscribe(&self) -> Receiver<Arc<CommitNotification>> {
        let (tx, rx) = mpsc::channel();
        match self.shared.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(tx),
            Err(_) => warn!("subscriber list poisoned, new subscriber will receive nothing"),
        }
        rx
    }

    /// Snapshot id of the last committed change.
    pub fn snapshot(&self) -> Result<u64> {
        self.default_connection()?.read(|tx| Ok(tx.snapshot()))
    }

    pub fn collection_names(&self) -> Result<Vec<String>> {
        self.default_connection()?.read(|tx| tx.collection_names())
    }

    /// Visit collection names in lexical order until `f` returns false.
    pub fn enumerate_collection_names(&self, f: impl FnMut(&str) -> bool) -> Result<()> {
        self.default_connection()?
            .read(|tx| tx.enumerate_collection_names(f))
    }

    /// Stored bookkeeping of every view, registered in this process or not.
    pub fn extensions(&self) -> Result<Vec<ExtensionRecord>> {
        self.default_connection()?.read(|tx| tx.db().list_extensions())
    }

    /// Names of the views registered with this store, in registration order.
    pub fn registered_views(&self) -> Result<Vec<String>> {
        Ok(self
            .shared
            .views
            .all()?
            .iter()
            .map(|view| view.name.clone())
            .collect())
    }
}
