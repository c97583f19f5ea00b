use crate::error::{Result, ShelfError};
use crate::store::transaction::{ReadTransaction, ReadWriteTransaction};
use crate::store::StoreShared;
use log::debug;
use rusqlite::TransactionBehavior;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;

/// A long-lived connection owned by one consumer.
///
/// Transactions on one connection run one at a time. Opening a transaction
/// from inside another transaction on the same connection deadlocks.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    consumer: String,
    conn: Mutex<rusqlite::Connection>,
    store: Weak<StoreShared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("consumer", &self.inner.consumer)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(consumer: &str, conn: rusqlite::Connection, store: Weak<StoreShared>) -> Self {
        Connection {
            inner: Arc::new(ConnectionInner {
                consumer: consumer.to_string(),
                conn: Mutex::new(conn),
                store,
            }),
        }
    }

    pub fn consumer(&self) -> &str {
        &self.inner.consumer
    }

    pub(crate) fn shared(&self) -> Result<Arc<StoreShared>> {
        self.inner.store.upgrade().ok_or_else(|| {
            ShelfError::contract(format!(
                "connection '{}': the store was dropped",
                self.inner.consumer
            ))
        })
    }

    pub(crate) fn belongs_to(&self, shared: &Arc<StoreShared>) -> bool {
        std::ptr::eq(self.inner.store.as_ptr(), Arc::as_ptr(shared))
    }

    fn lock(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.inner
            .conn
            .lock()
            .map_err(|_| ShelfError::LockPoisoned("connection"))
    }

    /// Run `f` inside a read transaction. Every read in it sees the same
    /// committed snapshot.
    pub fn read<R>(&self, f: impl FnOnce(&ReadTransaction<'_>) -> Result<R>) -> Result<R> {
        let shared = self.shared()?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let tx = ReadTransaction::begin(tx, shared, &self.inner.consumer)?;
        let result = f(&tx)?;
        tx.finish()?;
        Ok(result)
    }

    /// Run `f` inside an exclusive read-write transaction. Registered views
    /// are maintained as records change; everything commits together or, when
    /// `f` fails, rolls back together.
    pub fn read_write<R>(&self, f: impl FnOnce(&ReadWriteTransaction<'_>) -> Result<R>) -> Result<R> {
        let shared = self.shared()?;
        let _writer = shared
            .write_lock
            .lock()
            .map_err(|_| ShelfError::LockPoisoned("store writer"))?;
        self.write_locked(&shared, &[], f)
    }

    /// [`Connection::read_write`] on a spawned thread. `on_complete` receives
    /// the outcome once the transaction has committed or rolled back.
    pub fn read_write_async<R, F, C>(&self, f: F, on_complete: C) -> JoinHandle<()>
    where
        R: Send + 'static,
        F: FnOnce(&ReadWriteTransaction<'_>) -> Result<R> + Send + 'static,
        C: FnOnce(Result<R>) + Send + 'static,
    {
        let connection = self.clone();
        std::thread::spawn(move || on_complete(connection.read_write(f)))
    }

    /// Body of a read-write transaction; the caller holds the store's writer
    /// lock. `also_maintained` names views, not yet in the registry, that are
    /// maintained by this transaction.
    pub(crate) fn write_locked<R>(
        &self,
        shared: &Arc<StoreShared>,
        also_maintained: &[&str],
        f: impl FnOnce(&ReadWriteTransaction<'_>) -> Result<R>,
    ) -> Result<R> {
        let (result, notification) = {
            let mut conn = self.lock()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let tx = ReadWriteTransaction::begin(tx, shared.clone(), &self.inner.consumer)?;
            let result = f(&tx)?;
            (result, tx.commit(also_maintained)?)
        };
        match notification {
            Some(notification) => {
                debug!(
                    "'{}' committed snapshot {} with {} view change(s)",
                    self.inner.consumer,
                    notification.snapshot,
                    notification.changes.len()
                );
                shared.broadcast(notification);
            }
            None => debug!("'{}' committed without changes", self.inner.consumer),
        }
        Ok(result)
    }
}

/// Where an operation runs: on the store's default connection, on a given
/// connection, or inside an open transaction.
#[derive(Clone, Copy)]
pub enum Access<'a> {
    Default,
    Connection(&'a Connection),
    Read(&'a ReadTransaction<'a>),
    Write(&'a ReadWriteTransaction<'a>),
}

impl<'a> From<&'a Connection> for Access<'a> {
    fn from(connection: &'a Connection) -> Self {
        Access::Connection(connection)
    }
}

impl<'a, 'c: 'a> From<&'a ReadTransaction<'c>> for Access<'a> {
    fn from(tx: &'a ReadTransaction<'c>) -> Self {
        Access::Read(tx)
    }
}

impl<'a, 'c: 'a> From<&'a ReadWriteTransaction<'c>> for Access<'a> {
    fn from(tx: &'a ReadWriteTransaction<'c>) -> Self {
        Access::Write(tx)
    }
}

impl<'a> Access<'a> {
    fn connection(shared: &Arc<StoreShared>, connection: Option<&Connection>) -> Result<Connection> {
        match connection {
            Some(connection) if !connection.belongs_to(shared) => Err(ShelfError::contract(format!(
                "connection '{}' belongs to another store",
                connection.consumer()
            ))),
            Some(connection) => Ok(connection.clone()),
            None => shared.default_connection(),
        }
    }

    fn check_tx(shared: &Arc<StoreShared>, tx: &ReadTransaction<'_>) -> Result<()> {
        if tx.belongs_to(shared) {
            Ok(())
        } else {
            Err(ShelfError::contract("transaction belongs to another store"))
        }
    }

    /// Run a read against `shared`, opening a read transaction if needed.
    pub(crate) fn read<R>(
        self,
        shared: &Arc<StoreShared>,
        f: impl FnOnce(&ReadTransaction<'_>) -> Result<R>,
    ) -> Result<R> {
        match self {
            Access::Default => Self::connection(shared, None)?.read(f),
            Access::Connection(connection) => Self::connection(shared, Some(connection))?.read(f),
            Access::Read(tx) => {
                Self::check_tx(shared, tx)?;
                f(tx)
            }
            Access::Write(tx) => {
                Self::check_tx(shared, tx)?;
                f(&**tx)
            }
        }
    }

    /// Run a mutation against `shared`, opening a read-write transaction if
    /// needed. A read transaction cannot carry a mutation.
    pub(crate) fn write<R>(
        self,
        shared: &Arc<StoreShared>,
        f: impl FnOnce(&ReadWriteTransaction<'_>) -> Result<R>,
    ) -> Result<R> {
        match self {
            Access::Default => Self::connection(shared, None)?.read_write(f),
            Access::Connection(connection) => {
                Self::connection(shared, Some(connection))?.read_write(f)
            }
            Access::Read(_) => Err(ShelfError::contract(
                "a read transaction cannot be used for a mutation",
            )),
            Access::Write(tx) => {
                Self::check_tx(shared, tx)?;
                f(tx)
            }
        }
    }
}
