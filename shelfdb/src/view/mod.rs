mod engine;
mod extension;
mod filtered;
pub mod grouping;
mod manual;

pub(crate) use engine::Maintenance;
pub use extension::{ManualViewTransaction, ViewTransaction};
pub use filtered::FilteredView;
pub use grouping::{Filtering, Grouping, Row, Sorting};
pub use manual::ManualView;

use crate::error::{Result, ShelfError};
use crate::mapping::ViewMapping;
use crate::store::{Access, CollectionKey, StoreShared};
use crate::system_db::ExtensionRecord;
use grouping::{Derivation, FilterLogic, Predicate};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::TypeId;
use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock, Weak};
use std::thread::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    Computed,
    Manual,
    Filtered,
}

impl ViewKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewKind::Computed => "computed",
            ViewKind::Manual => "manual",
            ViewKind::Filtered => "filtered",
        }
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration options shared by every view kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewOptions {
    pub name: String,
    /// Changing the tag forces a full rebuild on the next registration.
    pub version_tag: String,
    /// Keep materialized state across store reopen.
    pub persistent: bool,
}

impl ViewOptions {
    pub fn new(name: impl Into<String>) -> Self {
        ViewOptions {
            name: name.into(),
            version_tag: String::new(),
            persistent: true,
        }
    }

    pub fn version_tag(mut self, tag: impl Into<String>) -> Self {
        self.version_tag = tag.into();
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}

/// Item type a view was registered over, compared by `TypeId`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ItemType {
    id: TypeId,
    pub name: &'static str,
}

impl ItemType {
    pub fn of<T: 'static>() -> Self {
        ItemType {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }
}

impl PartialEq for ItemType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ItemType {}

pub(crate) enum ViewLogic {
    Computed(Box<dyn Derivation>),
    Manual,
    Filtered(RwLock<Arc<dyn Predicate>>),
}

/// A view as the store knows it once registered.
pub(crate) struct RegisteredView {
    pub name: String,
    pub kind: ViewKind,
    pub parent: Option<Arc<RegisteredView>>,
    pub persistent: bool,
    /// Collections the view considers; empty means all.
    pub allowed: BTreeSet<String>,
    pub object_type: ItemType,
    version_tag: RwLock<String>,
    pub logic: ViewLogic,
}

impl RegisteredView {
    pub fn new(
        options: ViewOptions,
        parent: Option<Arc<RegisteredView>>,
        allowed: BTreeSet<String>,
        object_type: ItemType,
        logic: ViewLogic,
    ) -> Self {
        let kind = match &logic {
            ViewLogic::Computed(_) => ViewKind::Computed,
            ViewLogic::Manual => ViewKind::Manual,
            ViewLogic::Filtered(_) => ViewKind::Filtered,
        };
        RegisteredView {
            name: options.name,
            kind,
            parent,
            persistent: options.persistent,
            allowed,
            object_type,
            version_tag: RwLock::new(options.version_tag),
            logic,
        }
    }

    pub fn allows(&self, collection: &str) -> bool {
        self.allowed.is_empty() || self.allowed.contains(collection)
    }

    pub fn parent_name(&self) -> Option<&str> {
        self.parent.as_ref().map(|p| p.name.as_str())
    }

    pub fn version_tag(&self) -> Result<String> {
        self.version_tag
            .read()
            .map(|tag| tag.clone())
            .map_err(|_| ShelfError::LockPoisoned("view version tag"))
    }

    pub fn set_version_tag(&self, tag: String) -> Result<()> {
        let mut current = self
            .version_tag
            .write()
            .map_err(|_| ShelfError::LockPoisoned("view version tag"))?;
        *current = tag;
        Ok(())
    }

    pub fn predicate(&self) -> Result<Arc<dyn Predicate>> {
        match &self.logic {
            ViewLogic::Filtered(predicate) => predicate
                .read()
                .map(|p| p.clone())
                .map_err(|_| ShelfError::LockPoisoned("view filter")),
            _ => Err(ShelfError::contract(format!(
                "view '{}' is a {} view and has no filter",
                self.name, self.kind
            ))),
        }
    }

    /// Swap in a new filter, returning the previous one.
    pub fn replace_predicate(&self, next: Arc<dyn Predicate>) -> Result<Arc<dyn Predicate>> {
        match &self.logic {
            ViewLogic::Filtered(predicate) => {
                let mut current = predicate
                    .write()
                    .map_err(|_| ShelfError::LockPoisoned("view filter"))?;
                Ok(std::mem::replace(&mut *current, next))
            }
            _ => Err(ShelfError::contract(format!(
                "view '{}' is a {} view and has no filter",
                self.name, self.kind
            ))),
        }
    }

    pub fn extension_record(&self, maintained_through: u64) -> Result<ExtensionRecord> {
        Ok(ExtensionRecord {
            name: self.name.clone(),
            kind: self.kind.as_str().to_string(),
            version_tag: self.version_tag()?,
            parent: self.parent_name().map(str::to_string),
            persistent: self.persistent,
            maintained_through,
        })
    }

    /// Stored state can be reused only when it was produced by an identical
    /// definition and kept up to date through `snapshot`.
    pub fn can_reuse(&self, stored: &ExtensionRecord, snapshot: u64) -> Result<bool> {
        Ok(self.persistent
            && stored.persistent
            && stored.kind == self.kind.as_str()
            && stored.parent.as_deref() == self.parent_name()
            && stored.version_tag == self.version_tag()?
            && stored.maintained_through == snapshot)
    }

    /// A repeated registration must agree on kind, item type and parent.
    pub fn check_compatible(&self, other: &RegisteredView) -> Result<()> {
        if self.kind != other.kind {
            return Err(ShelfError::registration(
                &other.name,
                format!("already registered as a {} view", self.kind),
            ));
        }
        if self.object_type != other.object_type {
            return Err(ShelfError::registration(
                &other.name,
                format!("already registered over {}", self.object_type.name),
            ));
        }
        if self.parent_name() != other.parent_name() {
            return Err(ShelfError::registration(
                &other.name,
                format!("already registered with parent {:?}", self.parent_name()),
            ));
        }
        Ok(())
    }
}

/// Registered views in registration order; parents precede their children.
#[derive(Default)]
pub(crate) struct ViewRegistry {
    views: RwLock<Vec<Arc<RegisteredView>>>,
}

impl ViewRegistry {
    pub fn get(&self, name: &str) -> Result<Option<Arc<RegisteredView>>> {
        let views = self
            .views
            .read()
            .map_err(|_| ShelfError::LockPoisoned("view registry"))?;
        Ok(views.iter().find(|v| v.name == name).cloned())
    }

    pub fn all(&self) -> Result<Vec<Arc<RegisteredView>>> {
        self.views
            .read()
            .map(|views| views.clone())
            .map_err(|_| ShelfError::LockPoisoned("view registry"))
    }

    pub fn insert(&self, view: Arc<RegisteredView>) -> Result<()> {
        self.views
            .write()
            .map_err(|_| ShelfError::LockPoisoned("view registry"))?
            .push(view);
        Ok(())
    }
}

pub(crate) fn upgrade(store: &Weak<StoreShared>, what: &str) -> Result<Arc<StoreShared>> {
    store
        .upgrade()
        .ok_or_else(|| ShelfError::contract(format!("{what}: the store was dropped")))
}

/// Typed handle to a registered view.
///
/// Handles are cheap to clone and hold only a weak reference to the store.
pub struct View<OT, MT = ()> {
    name: String,
    kind: ViewKind,
    store: Weak<StoreShared>,
    _types: PhantomData<fn() -> (OT, MT)>,
}

impl<OT, MT> Clone for View<OT, MT> {
    fn clone(&self) -> Self {
        View {
            name: self.name.clone(),
            kind: self.kind,
            store: self.store.clone(),
            _types: PhantomData,
        }
    }
}

impl<OT, MT> fmt::Debug for View<OT, MT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl<OT, MT> View<OT, MT>
where
    OT: Serialize + DeserializeOwned + Send + Sync + 'static,
    MT: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn from_registered(view: &RegisteredView, store: Weak<StoreShared>) -> Self {
        View {
            name: view.name.clone(),
            kind: view.kind,
            store,
            _types: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub(crate) fn shared(&self) -> Result<Arc<StoreShared>> {
        upgrade(&self.store, &format!("view '{}'", self.name))
    }

    pub(crate) fn registered(&self) -> Result<Arc<RegisteredView>> {
        self.shared()?.views.get(&self.name)?.ok_or_else(|| {
            ShelfError::contract(format!("view '{}' is not registered", self.name))
        })
    }

    pub fn version_tag(&self) -> Result<String> {
        self.registered()?.version_tag()
    }

    fn read<'a, R>(
        &self,
        via: impl Into<Access<'a>>,
        f: impl FnOnce(&ViewTransaction<'_>) -> Result<R>,
    ) -> Result<R> {
        let shared = self.shared()?;
        via.into().read(&shared, |tx| f(&tx.extension(&self.name)?))
    }

    pub fn groups<'a>(&self, via: impl Into<Access<'a>>) -> Result<Vec<String>> {
        self.read(via, |view| view.groups())
    }

    pub fn number_of_items<'a>(&self, group: &str, via: impl Into<Access<'a>>) -> Result<usize> {
        self.read(via, |view| view.number_of_items(group))
    }

    pub fn total_items<'a>(&self, via: impl Into<Access<'a>>) -> Result<usize> {
        self.read(via, |view| view.total_items())
    }

    pub fn keys<'a>(&self, group: &str, via: impl Into<Access<'a>>) -> Result<Vec<CollectionKey>> {
        self.read(via, |view| view.keys(group))
    }

    pub fn group_of<'a>(&self, ck: &CollectionKey, via: impl Into<Access<'a>>) -> Result<Option<String>> {
        self.read(via, |view| view.group_of(ck))
    }

    /// Items of a group in view order.
    pub fn items<'a>(&self, group: &str, via: impl Into<Access<'a>>) -> Result<Vec<OT>> {
        let shared = self.shared()?;
        via.into().read(&shared, |tx| {
            let mut items = Vec::new();
            for ck in tx.extension(&self.name)?.keys(group)? {
                let item = tx.get::<OT>(&ck.collection, &ck.key)?.ok_or_else(|| {
                    ShelfError::Inconsistent(format!("view '{}' lists {ck} but the record is gone", self.name))
                })?;
                items.push(item);
            }
            Ok(items)
        })
    }

    pub fn item_at<'a>(&self, group: &str, index: usize, via: impl Into<Access<'a>>) -> Result<Option<OT>> {
        let shared = self.shared()?;
        via.into().read(&shared, |tx| {
            match tx.extension(&self.name)?.key_at(group, index)? {
                Some(ck) => tx.get::<OT>(&ck.collection, &ck.key),
                None => Ok(None),
            }
        })
    }

    /// Realized mapping with every group visible in lexical order.
    pub fn mapping<'a>(&self, via: impl Into<Access<'a>>) -> Result<ViewMapping> {
        self.mapping_with(ViewMapping::new(self.name.clone()), via)
    }

    /// Realize a mapping built with custom group filter or sort.
    pub fn mapping_with<'a>(&self, mut mapping: ViewMapping, via: impl Into<Access<'a>>) -> Result<ViewMapping> {
        if mapping.view() != self.name {
            return Err(ShelfError::contract(format!(
                "mapping of '{}' used with view '{}'",
                mapping.view(),
                self.name
            )));
        }
        let shared = self.shared()?;
        via.into().read(&shared, |tx| mapping.update(tx))?;
        Ok(mapping)
    }

    /// Register a filtered view over this one. Must not be called while a
    /// read-write transaction on the same store is open on this thread.
    pub fn filtered(&self, options: ViewOptions, filtering: Filtering<OT, MT>) -> Result<FilteredView<OT, MT>> {
        let shared = self.shared()?;
        let parent = self.registered()?;
        let allowed = parent.allowed.clone();
        let predicate: Arc<dyn Predicate> = Arc::new(FilterLogic::new(filtering));
        let view = shared.register_view(RegisteredView::new(
            options,
            Some(parent),
            allowed,
            ItemType::of::<OT>(),
            ViewLogic::Filtered(RwLock::new(predicate)),
        ))?;
        Ok(FilteredView::new(View::from_registered(&view, Arc::downgrade(&shared))))
    }

    /// Register a filtered view on a separate thread and report the result to
    /// `on_complete`.
    pub fn filtered_async(
        &self,
        options: ViewOptions,
        filtering: Filtering<OT, MT>,
        on_complete: impl FnOnce(Result<FilteredView<OT, MT>>) + Send + 'static,
    ) -> JoinHandle<()> {
        let view = self.clone();
        std::thread::spawn(move || on_complete(view.filtered(options, filtering)))
    }
}
