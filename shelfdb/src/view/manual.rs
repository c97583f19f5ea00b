use crate::collection::Collection;
use crate::error::Result;
use crate::store::{Access, CollectionKey};
use crate::view::{ManualViewTransaction, View};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::ops::Deref;

/// A view whose membership and order are set by the caller, over the items of
/// one collection.
///
/// Records in the view stay there until removed from the view or deleted
/// from the collection. Persisting a member reports it as updated.
pub struct ManualView<OT, MT = ()> {
    view: View<OT, MT>,
    collection: Collection<OT, MT>,
}

impl<OT, MT> Clone for ManualView<OT, MT> {
    fn clone(&self) -> Self {
        ManualView {
            view: self.view.clone(),
            collection: self.collection.clone(),
        }
    }
}

impl<OT, MT> fmt::Debug for ManualView<OT, MT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualView")
            .field("view", &self.view)
            .field("collection", &self.collection)
            .finish()
    }
}

impl<OT, MT> Deref for ManualView<OT, MT> {
    type Target = View<OT, MT>;

    fn deref(&self) -> &View<OT, MT> {
        &self.view
    }
}

impl<OT, MT> ManualView<OT, MT>
where
    OT: Serialize + DeserializeOwned + Send + Sync + 'static,
    MT: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn new(view: View<OT, MT>, collection: Collection<OT, MT>) -> Self {
        ManualView { view, collection }
    }

    fn key(&self, key: &str) -> CollectionKey {
        CollectionKey::new(self.collection.name(), key)
    }

    fn edit<'a, R>(
        &self,
        via: impl Into<Access<'a>>,
        f: impl FnOnce(&ManualViewTransaction<'_, '_>) -> Result<R>,
    ) -> Result<R> {
        let shared = self.view.shared()?;
        via.into()
            .write(&shared, |tx| f(&tx.manual_extension(self.view.name())?))
    }

    /// Append `item` to `group`, moving it if it is already in the view.
    /// Returns false when the item was never persisted.
    pub fn add_item<'a>(&self, item: &OT, group: &str, via: impl Into<Access<'a>>) -> Result<bool> {
        let ck = self.key(&self.collection.key_for(item));
        self.edit(via, |view| view.add(&ck, group))
    }

    /// Insert `item` at `index` of `group`; `index` may equal the group size.
    pub fn insert_item<'a>(
        &self,
        item: &OT,
        index: usize,
        group: &str,
        via: impl Into<Access<'a>>,
    ) -> Result<bool> {
        let ck = self.key(&self.collection.key_for(item));
        self.edit(via, |view| view.insert(&ck, index, group))
    }

    pub fn remove_item<'a>(&self, item: &OT, group: &str, via: impl Into<Access<'a>>) -> Result<bool> {
        let key = self.collection.key_for(item);
        self.remove_key(&key, group, via)
    }

    pub fn remove_key<'a>(&self, key: &str, group: &str, via: impl Into<Access<'a>>) -> Result<bool> {
        let ck = self.key(key);
        self.edit(via, |view| view.remove(&ck, group))
    }

    /// Remove the member at `index` of `group`, returning its key.
    pub fn remove_at<'a>(&self, index: usize, group: &str, via: impl Into<Access<'a>>) -> Result<CollectionKey> {
        self.edit(via, |view| view.remove_at(index, group))
    }

    pub fn remove_all_in_group<'a>(&self, group: &str, via: impl Into<Access<'a>>) -> Result<usize> {
        self.edit(via, |view| view.remove_all_in_group(group))
    }

    /// Whether `item` is a member of any group.
    pub fn is_item<'a>(&self, item: &OT, via: impl Into<Access<'a>>) -> Result<bool> {
        let ck = self.key(&self.collection.key_for(item));
        Ok(self.view.group_of(&ck, via)?.is_some())
    }
}
