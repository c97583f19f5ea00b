use crate::changes::{ChangeRecord, CommitNotification};
use crate::codec::CollectionCodec;
use crate::error::{Result, ShelfError};
use crate::store::{CollectionKey, RawRow, StoreShared, StoredRecord};
use crate::system_db::SystemDb;
use crate::view::{Maintenance, ManualViewTransaction, RegisteredView, ViewKind, ViewTransaction};
use log::{info, trace};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::ops::Deref;
use std::sync::Arc;

/// A consistent read of the store.
pub struct ReadTransaction<'c> {
    tx: rusqlite::Transaction<'c>,
    shared: Arc<StoreShared>,
    snapshot: u64,
    consumer: String,
}

impl<'c> ReadTransaction<'c> {
    pub(crate) fn begin(
        tx: rusqlite::Transaction<'c>,
        shared: Arc<StoreShared>,
        consumer: &str,
    ) -> Result<Self> {
        let snapshot = SystemDb::new(&tx).snapshot()?;
        Ok(ReadTransaction {
            tx,
            shared,
            snapshot,
            consumer: consumer.to_string(),
        })
    }

    pub(crate) fn db(&self) -> SystemDb<'_> {
        SystemDb::new(&self.tx)
    }

    pub(crate) fn finish(self) -> Result<()> {
        self.tx.rollback()?;
        Ok(())
    }

    pub(crate) fn belongs_to(&self, shared: &Arc<StoreShared>) -> bool {
        Arc::ptr_eq(&self.shared, shared)
    }

    /// Commit snapshot this transaction reads.
    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    fn codec_for<OT: 'static>(&self, collection: &str) -> Result<Arc<CollectionCodec>> {
        let codec = self.shared.codecs.require(collection)?;
        if !codec.holds::<OT>() {
            return Err(ShelfError::contract(format!(
                "collection '{collection}' holds {}, not {}",
                codec.object_type,
                std::any::type_name::<OT>()
            )));
        }
        Ok(codec)
    }

    pub fn get<OT>(&self, collection: &str, key: &str) -> Result<Option<OT>>
    where
        OT: DeserializeOwned + 'static,
    {
        let codec = self.codec_for::<OT>(collection)?;
        match self.db().get_record(collection, key)? {
            Some(record) => Ok(Some(codec.object.decode(&record.object)?)),
            None => Ok(None),
        }
    }

    pub fn get_metadata<MT>(&self, collection: &str, key: &str) -> Result<Option<MT>>
    where
        MT: DeserializeOwned + 'static,
    {
        let codec = self.shared.codecs.require(collection)?;
        if !codec.holds_metadata::<MT>() {
            return Err(ShelfError::contract(format!(
                "collection '{collection}' keeps {} metadata, not {}",
                codec.meta_type,
                std::any::type_name::<MT>()
            )));
        }
        match self.db().get_record(collection, key)? {
            Some(StoredRecord {
                metadata: Some(bytes),
                ..
            }) => Ok(Some(codec.metadata.decode(&bytes)?)),
            _ => Ok(None),
        }
    }

    /// The record as stored, without decoding.
    pub fn get_raw(&self, collection: &str, key: &str) -> Result<Option<StoredRecord>> {
        self.db().get_record(collection, key)
    }

    pub fn has(&self, collection: &str, key: &str) -> Result<bool> {
        self.db().has_record(collection, key)
    }

    pub fn count(&self, collection: &str) -> Result<usize> {
        self.db().count(collection)
    }

    /// Keys of a collection in lexical order.
    pub fn keys(&self, collection: &str) -> Result<Vec<String>> {
        self.db().keys(collection)
    }

    /// Names of the collections that hold at least one record.
    pub fn collection_names(&self) -> Result<Vec<String>> {
        self.db().collection_names()
    }

    /// Visit collection names in lexical order until `f` returns false.
    pub fn enumerate_collection_names(&self, mut f: impl FnMut(&str) -> bool) -> Result<()> {
        for name in self.collection_names()? {
            if !f(&name) {
                break;
            }
        }
        Ok(())
    }

    /// Read access to a registered view.
    pub fn extension(&self, name: &str) -> Result<ViewTransaction<'_>> {
        let view = self
            .shared
            .views
            .get(name)?
            .ok_or_else(|| ShelfError::contract(format!("view '{name}' is not registered")))?;
        Ok(ViewTransaction::new(self.db(), view))
    }
}

/// An exclusive read-write transaction. Derefs to [`ReadTransaction`].
///
/// Every mutation runs view maintenance immediately, so reads later in the
/// same transaction see up-to-date views.
pub struct ReadWriteTransaction<'c> {
    read: ReadTransaction<'c>,
    journal: RefCell<Vec<ChangeRecord>>,
    collections: RefCell<BTreeSet<String>>,
    dirty: Cell<bool>,
}

impl<'c> Deref for ReadWriteTransaction<'c> {
    type Target = ReadTransaction<'c>;

    fn deref(&self) -> &ReadTransaction<'c> {
        &self.read
    }
}

impl<'c> ReadWriteTransaction<'c> {
    pub(crate) fn begin(
        tx: rusqlite::Transaction<'c>,
        shared: Arc<StoreShared>,
        consumer: &str,
    ) -> Result<Self> {
        Ok(ReadWriteTransaction {
            read: ReadTransaction::begin(tx, shared, consumer)?,
            journal: RefCell::new(Vec::new()),
            collections: RefCell::new(BTreeSet::new()),
            dirty: Cell::new(false),
        })
    }

    pub(crate) fn maintenance(&self) -> Result<Maintenance<'_>> {
        Ok(Maintenance::new(
            self.db(),
            &self.read.shared.codecs,
            self.read.shared.views.all()?,
            &self.journal,
            &self.dirty,
        ))
    }

    fn touch(&self, collection: &str) {
        self.collections.borrow_mut().insert(collection.to_string());
        self.dirty.set(true);
    }

    /// Write a record, replacing any record under the same key.
    pub fn set<OT, MT>(&self, collection: &str, key: &str, object: &OT, metadata: Option<&MT>) -> Result<()>
    where
        OT: Serialize + 'static,
        MT: Serialize + 'static,
    {
        let codec = self.codec_for::<OT>(collection)?;
        if metadata.is_some() && !codec.holds_metadata::<MT>() {
            return Err(ShelfError::contract(format!(
                "collection '{collection}' keeps {} metadata, not {}",
                codec.meta_type,
                std::any::type_name::<MT>()
            )));
        }
        let record = StoredRecord {
            object: codec.object.encode(object)?,
            metadata: metadata.map(|m| codec.metadata.encode(m)).transpose()?,
        };
        self.db()
            .put_record(collection, key, &record.object, record.metadata.as_deref())?;
        self.touch(collection);

        let ck = CollectionKey::new(collection, key);
        trace!("set {ck} ({} bytes)", record.object.len());
        let row = Arc::new(RawRow::new(ck.clone(), record, Some(codec)));
        self.maintenance()?.record_changed(&ck, Some(row))
    }

    /// Replace only the metadata of a record. Returns false when there is no
    /// such record.
    pub fn set_metadata<MT>(&self, collection: &str, key: &str, metadata: Option<&MT>) -> Result<bool>
    where
        MT: Serialize + 'static,
    {
        let codec = self.shared.codecs.require(collection)?;
        if !codec.holds_metadata::<MT>() {
            return Err(ShelfError::contract(format!(
                "collection '{collection}' keeps {} metadata, not {}",
                codec.meta_type,
                std::any::type_name::<MT>()
            )));
        }
        let bytes = metadata.map(|m| codec.metadata.encode(m)).transpose()?;
        if !self.db().put_metadata(collection, key, bytes.as_deref())? {
            return Ok(false);
        }
        self.touch(collection);

        let ck = CollectionKey::new(collection, key);
        let maintenance = self.maintenance()?;
        let row = maintenance.load_row(&ck)?;
        maintenance.record_changed(&ck, row)?;
        Ok(true)
    }

    /// Delete a record. Returns false when there is no such record.
    pub fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        if !self.db().delete_record(collection, key)? {
            return Ok(false);
        }
        self.touch(collection);

        let ck = CollectionKey::new(collection, key);
        trace!("deleted {ck}");
        self.maintenance()?.record_changed(&ck, None)?;
        Ok(true)
    }

    /// Delete every record of a collection, returning how many there were.
    pub fn delete_all(&self, collection: &str) -> Result<usize> {
        let keys = self.keys(collection)?;
        for key in &keys {
            self.delete(collection, key)?;
        }
        Ok(keys.len())
    }

    /// Write access to a registered manual view.
    pub fn manual_extension(&self, name: &str) -> Result<ManualViewTransaction<'_, 'c>> {
        let view = self
            .shared
            .views
            .get(name)?
            .ok_or_else(|| ShelfError::contract(format!("view '{name}' is not registered")))?;
        ManualViewTransaction::new(self, view)
    }

    /// Bring a view being registered in line with the records: reuse its
    /// stored state when that is still valid, otherwise rebuild it.
    pub(crate) fn install_view(&self, view: &RegisteredView) -> Result<()> {
        let db = self.db();
        let stored = db.get_extension(&view.name)?;
        let maintenance = self.maintenance()?;

        match &stored {
            Some(stored) if view.can_reuse(stored, self.snapshot)? => {
                info!("view '{}': reusing stored state", view.name);
            }
            Some(stored)
                if view.kind == ViewKind::Manual
                    && stored.kind == ViewKind::Manual.as_str()
                    && stored.persistent
                    && view.persistent
                    && stored.version_tag == view.version_tag()? =>
            {
                info!(
                    "manual view '{}': stored state is behind snapshot {}, pruning",
                    view.name, self.snapshot
                );
                maintenance.prune_manual(view)?;
            }
            _ => {
                if stored.as_ref().is_some_and(|s| s.kind != view.kind.as_str()) {
                    db.clear_view(&view.name)?;
                }
                maintenance.rebuild(view)?;
                maintenance.discard_dependents(&view.name)?;
            }
        }

        db.put_extension(&view.extension_record(self.snapshot)?)
    }

    /// Bring views over every collection in line with a collection whose
    /// codec was just registered.
    pub(crate) fn adopt_collection(&self, collection: &str) -> Result<()> {
        self.maintenance()?.adopt_collection(collection)
    }

    /// Re-evaluate a filtered view after its predicate and version tag were
    /// replaced.
    pub(crate) fn refilter(&self, view: &RegisteredView) -> Result<()> {
        self.db().set_version_tag(&view.name, &view.version_tag()?)?;
        let maintenance = self.maintenance()?;
        maintenance.refilter(view)?;
        maintenance.discard_dependents(&view.name)
    }

    /// Commit, returning the notification to publish when anything changed.
    /// `also_maintained` names views outside the registry whose maintenance
    /// marker advances with this commit.
    pub(crate) fn commit(self, also_maintained: &[&str]) -> Result<Option<Arc<CommitNotification>>> {
        let ReadWriteTransaction {
            read,
            journal,
            collections,
            dirty,
        } = self;

        if !dirty.get() && journal.borrow().is_empty() {
            read.tx.commit()?;
            return Ok(None);
        }

        let snapshot = read.snapshot + 1;
        {
            let db = read.db();
            db.set_snapshot(snapshot)?;
            for view in read.shared.views.all()? {
                db.set_maintained_through(&view.name, snapshot)?;
            }
            for name in also_maintained {
                db.set_maintained_through(name, snapshot)?;
            }
        }
        read.tx.commit()?;

        Ok(Some(Arc::new(CommitNotification {
            snapshot,
            consumer: read.consumer,
            changes: journal.into_inner(),
            collections: collections.into_inner(),
        })))
    }
}
