use crate::error::{Result, ShelfError};
use crate::store::{CollectionKey, ReadWriteTransaction};
use crate::system_db::SystemDb;
use crate::view::engine::{group_members, group_sizes};
use crate::view::{RegisteredView, ViewKind};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Read access to one registered view inside a transaction.
pub struct ViewTransaction<'t> {
    db: SystemDb<'t>,
    view: Arc<RegisteredView>,
}

impl<'t> ViewTransaction<'t> {
    pub(crate) fn new(db: SystemDb<'t>, view: Arc<RegisteredView>) -> Self {
        ViewTransaction { db, view }
    }

    pub fn name(&self) -> &str {
        &self.view.name
    }

    pub fn kind(&self) -> ViewKind {
        self.view.kind
    }

    pub fn version_tag(&self) -> Result<String> {
        self.view.version_tag()
    }

    /// Non-empty groups in lexical order.
    pub fn groups(&self) -> Result<Vec<String>> {
        Ok(self.group_counts()?.into_keys().collect())
    }

    pub fn group_counts(&self) -> Result<BTreeMap<String, usize>> {
        group_sizes(&self.db, &self.view)
    }

    pub fn number_of_items(&self, group: &str) -> Result<usize> {
        Ok(self.group_counts()?.get(group).copied().unwrap_or(0))
    }

    pub fn total_items(&self) -> Result<usize> {
        Ok(self.group_counts()?.values().sum())
    }

    /// Keys of a group in view order.
    pub fn keys(&self, group: &str) -> Result<Vec<CollectionKey>> {
        group_members(&self.db, &self.view, group)
    }

    pub fn key_at(&self, group: &str, index: usize) -> Result<Option<CollectionKey>> {
        Ok(self.keys(group)?.into_iter().nth(index))
    }

    pub fn group_of(&self, ck: &CollectionKey) -> Result<Option<String>> {
        self.db.group_of(&self.view.name, ck)
    }

    /// Group and position of a key, if the view holds it.
    pub fn index_of(&self, ck: &CollectionKey) -> Result<Option<(String, usize)>> {
        let Some(group) = self.group_of(ck)? else {
            return Ok(None);
        };
        let index = self.keys(&group)?.iter().position(|k| k == ck);
        Ok(index.map(|index| (group, index)))
    }

    pub fn contains(&self, ck: &CollectionKey) -> Result<bool> {
        Ok(self.group_of(ck)?.is_some())
    }
}

/// Write access to one manual view inside a read-write transaction.
///
/// Every edit is journaled and propagated to filtered views derived from the
/// manual view, exactly like record maintenance.
pub struct ManualViewTransaction<'a, 'c> {
    tx: &'a ReadWriteTransaction<'c>,
    view: Arc<RegisteredView>,
}

impl<'a, 'c> ManualViewTransaction<'a, 'c> {
    pub(crate) fn new(tx: &'a ReadWriteTransaction<'c>, view: Arc<RegisteredView>) -> Result<Self> {
        if view.kind != ViewKind::Manual {
            return Err(ShelfError::contract(format!(
                "view '{}' is a {} view, not a manual one",
                view.name, view.kind
            )));
        }
        Ok(ManualViewTransaction { tx, view })
    }

    pub fn reader(&self) -> ViewTransaction<'_> {
        ViewTransaction::new(self.tx.db(), self.view.clone())
    }

    /// Append to the end of `group`. A key already in the view is moved.
    /// Returns false, and changes nothing, when the record does not exist.
    pub fn add(&self, ck: &CollectionKey, group: &str) -> Result<bool> {
        self.tx.maintenance()?.manual_place(&self.view, ck, group, None)
    }

    /// Insert at `index` of `group`, which must be within `0..=len`.
    pub fn insert(&self, ck: &CollectionKey, index: usize, group: &str) -> Result<bool> {
        self.tx
            .maintenance()?
            .manual_place(&self.view, ck, group, Some(index))
    }

    pub fn remove(&self, ck: &CollectionKey, group: &str) -> Result<bool> {
        self.tx.maintenance()?.manual_remove(&self.view, ck, group)
    }

    pub fn remove_at(&self, index: usize, group: &str) -> Result<CollectionKey> {
        self.tx.maintenance()?.manual_remove_at(&self.view, index, group)
    }

    pub fn remove_all_in_group(&self, group: &str) -> Result<usize> {
        self.tx.maintenance()?.manual_clear_group(&self.view, group)
    }
}
