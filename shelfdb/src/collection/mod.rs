//! Typed collections.
//!
//! A [`Collection`] binds an item type (and optionally a metadata type) to a
//! named collection of one store. It derives keys from items, runs CRUD on a
//! connection or inside a caller's transaction, and builds views over its
//! items.

use crate::codec::{CollectionCodec, Compression};
use crate::error::{Result, ShelfError};
use crate::store::{Access, Store, StoreShared};
use crate::view::grouping::{ComputedLogic, Derivation};
use crate::view::{
    Grouping, ItemType, ManualView, RegisteredView, Sorting, View, ViewLogic, ViewOptions,
};
use log::info;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::thread::JoinHandle;
use ulid::{Generator, Ulid};

/// A fresh lowercase ULID. Ids generated by one process sort in generation
/// order.
pub fn new_unique_sortable_id() -> String {
    static GENERATOR: OnceLock<Mutex<Generator>> = OnceLock::new();
    let generator = GENERATOR.get_or_init(|| Mutex::new(Generator::new()));
    let id = match generator.lock() {
        Ok(mut generator) => generator.generate().unwrap_or_else(|_| Ulid::new()),
        Err(_) => Ulid::new(),
    };
    id.to_string().to_lowercase()
}

type KeyFn<OT> = Box<dyn Fn(&OT) -> String + Send + Sync>;
type MetaFn<OT, MT> = Box<dyn Fn(&OT) -> MT + Send + Sync>;

struct CollectionInner<OT, MT> {
    name: String,
    key_fn: KeyFn<OT>,
    meta_fn: Option<MetaFn<OT, MT>>,
    object_compression: Compression,
    metadata_compression: Compression,
    store: RwLock<Weak<StoreShared>>,
}

/// A named collection of `OT` items with optional `MT` metadata.
pub struct Collection<OT, MT = ()> {
    inner: Arc<CollectionInner<OT, MT>>,
}

impl<OT, MT> Clone for Collection<OT, MT> {
    fn clone(&self) -> Self {
        Collection {
            inner: self.inner.clone(),
        }
    }
}

impl<OT, MT> fmt::Debug for Collection<OT, MT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.inner.name)
            .field("object_compression", &self.inner.object_compression)
            .field("metadata_compression", &self.inner.metadata_compression)
            .finish()
    }
}

pub struct CollectionBuilder<OT, MT = ()> {
    name: String,
    key_fn: Option<KeyFn<OT>>,
    meta_fn: Option<MetaFn<OT, MT>>,
    object_compression: Compression,
    metadata_compression: Compression,
}

impl<OT: 'static, MT: 'static> CollectionBuilder<OT, MT> {
    /// Key of an item. Without one every persist gets a fresh
    /// [`new_unique_sortable_id`].
    pub fn key_fn(mut self, f: impl Fn(&OT) -> String + Send + Sync + 'static) -> Self {
        self.key_fn = Some(Box::new(f));
        self
    }

    /// Metadata derived from the item when persist is given none.
    pub fn meta_fn(mut self, f: impl Fn(&OT) -> MT + Send + Sync + 'static) -> Self {
        self.meta_fn = Some(Box::new(f));
        self
    }

    pub fn object_compression(mut self, compression: Compression) -> Self {
        self.object_compression = compression;
        self
    }

    pub fn metadata_compression(mut self, compression: Compression) -> Self {
        self.metadata_compression = compression;
        self
    }

    pub fn build(self) -> Collection<OT, MT> {
        let key_fn: KeyFn<OT> = match self.key_fn {
            Some(key_fn) => key_fn,
            None => Box::new(|_: &OT| new_unique_sortable_id()),
        };
        Collection {
            inner: Arc::new(CollectionInner {
                name: self.name,
                key_fn,
                meta_fn: self.meta_fn,
                object_compression: self.object_compression,
                metadata_compression: self.metadata_compression,
                store: RwLock::new(Weak::new()),
            }),
        }
    }
}

impl<OT, MT> Collection<OT, MT>
where
    OT: Serialize + DeserializeOwned + Send + Sync + 'static,
    MT: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn builder(name: impl Into<String>) -> CollectionBuilder<OT, MT> {
        CollectionBuilder {
            name: name.into(),
            key_fn: None,
            meta_fn: None,
            object_compression: Compression::None,
            metadata_compression: Compression::None,
        }
    }

    /// Collection with generated keys, no metadata function and no
    /// compression.
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn key_for(&self, item: &OT) -> String {
        (self.inner.key_fn)(item)
    }

    /// Bind the collection to `store`. Registering again with the same store
    /// is a no-op.
    pub fn register(&self, store: &Store) -> Result<()> {
        let mut bound = self
            .inner
            .store
            .write()
            .map_err(|_| ShelfError::LockPoisoned("collection store"))?;
        if let Some(current) = bound.upgrade() {
            if Arc::ptr_eq(&current, store.shared()) {
                return Ok(());
            }
            return Err(ShelfError::contract(format!(
                "collection '{}' is already registered with the store at {}",
                self.inner.name,
                store.path().display()
            )));
        }

        store.shared().register_codec(
            &self.inner.name,
            CollectionCodec::for_types::<OT, MT>(
                self.inner.object_compression,
                self.inner.metadata_compression,
            ),
        )?;
        *bound = store.downgrade();
        info!("registered collection '{}'", self.inner.name);
        Ok(())
    }

    pub(crate) fn shared(&self) -> Result<Arc<StoreShared>> {
        let bound = self
            .inner
            .store
            .read()
            .map_err(|_| ShelfError::LockPoisoned("collection store"))?;
        bound.upgrade().ok_or_else(|| {
            ShelfError::contract(format!(
                "collection '{}' is not registered with an open store",
                self.inner.name
            ))
        })
    }

    pub fn item<'a>(&self, key: &str, via: impl Into<Access<'a>>) -> Result<Option<OT>> {
        let shared = self.shared()?;
        via.into().read(&shared, |tx| tx.get::<OT>(&self.inner.name, key))
    }

    pub fn metadata<'a>(&self, key: &str, via: impl Into<Access<'a>>) -> Result<Option<MT>> {
        let shared = self.shared()?;
        via.into()
            .read(&shared, |tx| tx.get_metadata::<MT>(&self.inner.name, key))
    }

    /// Keys in lexical order.
    pub fn keys<'a>(&self, via: impl Into<Access<'a>>) -> Result<Vec<String>> {
        let shared = self.shared()?;
        via.into().read(&shared, |tx| tx.keys(&self.inner.name))
    }

    pub fn number_of_items<'a>(&self, via: impl Into<Access<'a>>) -> Result<usize> {
        let shared = self.shared()?;
        via.into().read(&shared, |tx| tx.count(&self.inner.name))
    }

    /// Write `item` under its key, replacing what was there. Metadata is the
    /// one given, else the one derived by the metadata function, else none.
    pub fn persist<'a>(&self, item: &OT, metadata: Option<&MT>, via: impl Into<Access<'a>>) -> Result<String> {
        let shared = self.shared()?;
        let key = self.key_for(item);
        let derived;
        let metadata = match metadata {
            Some(metadata) => Some(metadata),
            None => {
                derived = self.inner.meta_fn.as_ref().map(|f| f(item));
                derived.as_ref()
            }
        };
        via.into()
            .write(&shared, |tx| tx.set(&self.inner.name, &key, item, metadata))?;
        Ok(key)
    }

    /// Replace the metadata of the record under `key`. Returns false when
    /// there is no such record.
    pub fn update_metadata<'a>(&self, key: &str, metadata: Option<&MT>, via: impl Into<Access<'a>>) -> Result<bool> {
        let shared = self.shared()?;
        via.into()
            .write(&shared, |tx| tx.set_metadata(&self.inner.name, key, metadata))
    }

    pub fn remove_item<'a>(&self, item: &OT, via: impl Into<Access<'a>>) -> Result<bool> {
        let key = self.key_for(item);
        self.remove_key(&key, via)
    }

    /// Remove the record under `key`. A missing key is logged and ignored.
    pub fn remove_key<'a>(&self, key: &str, via: impl Into<Access<'a>>) -> Result<bool> {
        let shared = self.shared()?;
        let removed = via
            .into()
            .write(&shared, |tx| tx.delete(&self.inner.name, key))?;
        if !removed {
            let missing = ShelfError::NotFound {
                collection: self.inner.name.clone(),
                key: key.to_string(),
            };
            info!("{missing}, nothing removed");
        }
        Ok(removed)
    }

    pub fn remove_all<'a>(&self, via: impl Into<Access<'a>>) -> Result<usize> {
        let shared = self.shared()?;
        via.into().write(&shared, |tx| tx.delete_all(&self.inner.name))
    }

    fn register_computed(
        &self,
        options: ViewOptions,
        allowed: BTreeSet<String>,
        grouping: Grouping<OT, MT>,
        sorting: Sorting<OT, MT>,
    ) -> Result<View<OT, MT>> {
        let shared = self.shared()?;
        let logic: Box<dyn Derivation> = Box::new(ComputedLogic::new(grouping, sorting));
        let view = shared.register_view(RegisteredView::new(
            options,
            None,
            allowed,
            ItemType::of::<OT>(),
            ViewLogic::Computed(logic),
        ))?;
        Ok(View::from_registered(&view, Arc::downgrade(&shared)))
    }

    /// Register a computed view over this collection.
    ///
    /// Registration takes the store's writer, so calling this from inside a
    /// read-write transaction on the same store blocks forever.
    pub fn view(&self, options: ViewOptions, grouping: Grouping<OT, MT>, sorting: Sorting<OT, MT>) -> Result<View<OT, MT>> {
        let allowed = BTreeSet::from([self.inner.name.clone()]);
        self.register_computed(options, allowed, grouping, sorting)
    }

    /// [`Collection::view`] on a spawned thread.
    pub fn view_async(
        &self,
        options: ViewOptions,
        grouping: Grouping<OT, MT>,
        sorting: Sorting<OT, MT>,
        on_complete: impl FnOnce(Result<View<OT, MT>>) + Send + 'static,
    ) -> JoinHandle<()> {
        let collection = self.clone();
        std::thread::spawn(move || on_complete(collection.view(options, grouping, sorting)))
    }

    /// Register a computed view over this collection and `others`, which must
    /// be registered with the same store.
    pub fn multi_view(
        &self,
        options: ViewOptions,
        others: &[&Collection<OT, MT>],
        grouping: Grouping<OT, MT>,
        sorting: Sorting<OT, MT>,
    ) -> Result<View<OT, MT>> {
        let shared = self.shared()?;
        let mut allowed = BTreeSet::from([self.inner.name.clone()]);
        for other in others {
            if !Arc::ptr_eq(&other.shared()?, &shared) {
                return Err(ShelfError::contract(format!(
                    "collection '{}' is registered with another store",
                    other.name()
                )));
            }
            allowed.insert(other.name().to_string());
        }
        self.register_computed(options, allowed, grouping, sorting)
    }

    /// Register a manual view over this collection.
    pub fn manual_view(&self, options: ViewOptions) -> Result<ManualView<OT, MT>> {
        let shared = self.shared()?;
        let view = shared.register_view(RegisteredView::new(
            options,
            None,
            BTreeSet::from([self.inner.name.clone()]),
            ItemType::of::<OT>(),
            ViewLogic::Manual,
        ))?;
        Ok(ManualView::new(
            View::from_registered(&view, Arc::downgrade(&shared)),
            self.clone(),
        ))
    }
}

/// Every collection of a store whose registered item type is `OT`.
pub struct MultiCollection<OT, MT = ()> {
    store: Weak<StoreShared>,
    _types: PhantomData<fn() -> (OT, MT)>,
}

impl<OT, MT> MultiCollection<OT, MT>
where
    OT: Serialize + DeserializeOwned + Send + Sync + 'static,
    MT: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(store: &Store) -> Self {
        MultiCollection {
            store: store.downgrade(),
            _types: PhantomData,
        }
    }

    fn shared(&self) -> Result<Arc<StoreShared>> {
        crate::view::upgrade(&self.store, "multi-collection")
    }

    /// Names of the non-empty collections holding `OT`.
    pub fn collection_names<'a>(&self, via: impl Into<Access<'a>>) -> Result<Vec<String>> {
        let shared = self.shared()?;
        let names = via.into().read(&shared, |tx| tx.collection_names())?;
        Ok(names
            .into_iter()
            .filter(|name| {
                shared
                    .codecs
                    .lookup(name)
                    .is_some_and(|codec| codec.holds::<OT>())
            })
            .collect())
    }

    /// Register a computed view over every record of type `OT`, whatever its
    /// collection.
    pub fn typed_view(
        &self,
        options: ViewOptions,
        grouping: Grouping<OT, MT>,
        sorting: Sorting<OT, MT>,
    ) -> Result<View<OT, MT>> {
        let shared = self.shared()?;
        let logic: Box<dyn Derivation> = Box::new(ComputedLogic::new(grouping, sorting));
        let view = shared.register_view(RegisteredView::new(
            options,
            None,
            BTreeSet::new(),
            ItemType::of::<OT>(),
            ViewLogic::Computed(logic),
        ))?;
        Ok(View::from_registered(&view, Arc::downgrade(&shared)))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::{changes, ChangeKind};
    use crate::mapping::ViewMapping;
    use crate::store::CollectionKey;
    use crate::view::Filtering;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use std::path::Path;
    use std::sync::mpsc;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Person {
        id: String,
        name: String,
    }

    fn person(id: &str, name: &str) -> Person {
        Person {
            id: id.into(),
            name: name.into(),
        }
    }

    fn setup_test_store() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path().join("shelf.db")).unwrap();
        (tmp, store)
    }

    fn people(store: &Store) -> Collection<Person> {
        let people: Collection<Person> = Collection::builder("people")
            .key_fn(|p: &Person| p.id.clone())
            .build();
        people.register(store).unwrap();
        people
    }

    fn first_letter(name: &str) -> Option<String> {
        name.chars().next().map(|c| c.to_uppercase().to_string())
    }

    fn by_initial(people: &Collection<Person>, name: &str) -> View<Person> {
        people
            .view(
                ViewOptions::new(name),
                Grouping::by_object(|p: &Person| first_letter(&p.name)),
                Sorting::by_comparing(|p: &Person| p.name.clone(), true),
            )
            .unwrap()
    }

    fn names(items: Vec<Person>) -> Vec<String> {
        items.into_iter().map(|p| p.name).collect()
    }

    fn ck(key: &str) -> CollectionKey {
        CollectionKey::new("people", key)
    }

    /// Small deterministic generator for randomized edit sequences.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self, bound: u64) -> u64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (self.0 >> 33) % bound
        }
    }

    const NAMES: [&str; 8] = ["Ann", "Aaron", "Bill", "Bea", "Carl", "Cy", "Dora", "Al"];

    fn random_edits(rng: &mut Lcg, people: &Collection<Person>, conn: &crate::store::Connection) {
        let ops = 1 + rng.next(3);
        conn.read_write(|tx| {
            for _ in 0..ops {
                let id = rng.next(10).to_string();
                if rng.next(4) == 0 {
                    people.remove_key(&id, tx)?;
                } else {
                    let name = NAMES[rng.next(NAMES.len() as u64) as usize];
                    people.persist(&person(&id, name), None, tx)?;
                }
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_persist_overwrites_by_key() {
        let (_tmp, store) = setup_test_store();
        let people = people(&store);

        let key = people.persist(&person("1", "Bob"), None, Access::Default).unwrap();
        people.persist(&person("1", "Bobby"), None, Access::Default).unwrap();

        assert_eq!(key, "1");
        assert_eq!(
            people.item("1", Access::Default).unwrap(),
            Some(person("1", "Bobby"))
        );
        assert_eq!(people.number_of_items(Access::Default).unwrap(), 1);
        assert_eq!(people.keys(Access::Default).unwrap(), vec!["1".to_string()]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (_tmp, store) = setup_test_store();
        let people = people(&store);
        let ann = person("1", "Ann");
        people.persist(&ann, None, Access::Default).unwrap();

        assert!(people.remove_item(&ann, Access::Default).unwrap());
        assert!(!people.remove_item(&ann, Access::Default).unwrap());
        assert!(!people.remove_key("never", Access::Default).unwrap());
        assert_eq!(people.item("1", Access::Default).unwrap(), None);
    }

    #[test]
    fn test_remove_all() {
        let (_tmp, store) = setup_test_store();
        let people = people(&store);
        let view = by_initial(&people, "by-initial");
        for (id, name) in [("1", "Ann"), ("2", "Bill"), ("3", "Cy")] {
            people.persist(&person(id, name), None, Access::Default).unwrap();
        }

        assert_eq!(people.remove_all(Access::Default).unwrap(), 3);
        assert_eq!(people.number_of_items(Access::Default).unwrap(), 0);
        assert_eq!(view.total_items(Access::Default).unwrap(), 0);
        assert!(view.groups(Access::Default).unwrap().is_empty());
    }

    #[test]
    fn test_computed_view_groups_by_first_letter() {
        let (_tmp, store) = setup_test_store();
        let people = people(&store);
        let view = by_initial(&people, "by-initial");

        people.persist(&person("1", "Ann"), None, Access::Default).unwrap();
        people.persist(&person("2", "Bill"), None, Access::Default).unwrap();
        people.persist(&person("3", "Aaron"), None, Access::Default).unwrap();

        assert_eq!(view.groups(Access::Default).unwrap(), ["A", "B"]);
        assert_eq!(names(view.items("A", Access::Default).unwrap()), ["Aaron", "Ann"]);

        // renaming moves the row across groups
        people.persist(&person("2", "Abe"), None, Access::Default).unwrap();
        assert_eq!(view.groups(Access::Default).unwrap(), ["A"]);
        assert_eq!(
            names(view.items("A", Access::Default).unwrap()),
            ["Aaron", "Abe", "Ann"]
        );
        assert_eq!(view.group_of(&ck("2"), Access::Default).unwrap(), Some("A".to_string()));
        assert_eq!(
            view.item_at("A", 1, Access::Default).unwrap(),
            Some(person("2", "Abe"))
        );
    }

    #[test]
    fn test_view_over_existing_records_and_reregistration() {
        let (_tmp, store) = setup_test_store();
        let people = people(&store);
        people.persist(&person("1", "Cy"), None, Access::Default).unwrap();
        people.persist(&person("2", "Carl"), None, Access::Default).unwrap();

        let view = by_initial(&people, "by-initial");
        assert_eq!(view.keys("C", Access::Default).unwrap(), vec![ck("2"), ck("1")]);

        let again = by_initial(&people, "by-initial");
        assert_eq!(again.total_items(Access::Default).unwrap(), 2);
        assert_eq!(store.registered_views().unwrap(), vec!["by-initial".to_string()]);

        let err = people.manual_view(ViewOptions::new("by-initial")).unwrap_err();
        assert!(matches!(err, ShelfError::Registration { .. }));
    }

    #[test]
    fn test_view_handles_format_with_debug() {
        let (_tmp, store) = setup_test_store();
        let people = people(&store);
        let view = by_initial(&people, "by-initial");
        let picks = people.manual_view(ViewOptions::new("picks")).unwrap();
        let long = view
            .filtered(
                ViewOptions::new("long-names"),
                Filtering::by_object(|p: &Person| p.name.len() > 3),
            )
            .unwrap();

        let shown = format!("{picks:?}");
        assert!(shown.starts_with("ManualView"));
        assert!(shown.contains("\"picks\""));
        assert!(shown.contains("\"people\""));
        assert!(format!("{long:?}").contains("\"long-names\""));

        let err = view.filtered(ViewOptions::new("picks"), Filtering::by_key(|_| true)).unwrap_err();
        assert!(matches!(err, ShelfError::Registration { .. }));
    }

    #[test]
    fn test_operations_inside_caller_transaction() {
        let (_tmp, store) = setup_test_store();
        let people = people(&store);
        let view = by_initial(&people, "by-initial");
        let conn = store.default_connection().unwrap();

        let total = conn
            .read_write(|tx| {
                people.persist(&person("1", "Ann"), None, tx)?;
                people.persist(&person("2", "Bill"), None, tx)?;
                view.total_items(tx)
            })
            .unwrap();
        assert_eq!(total, 2);

        let result: Result<()> = conn.read_write(|tx| {
            people.persist(&person("3", "Cy"), None, tx)?;
            assert_eq!(view.total_items(tx)?, 3);
            Err(ShelfError::contract("abort"))
        });
        assert!(result.is_err());
        assert_eq!(view.total_items(Access::Default).unwrap(), 2);
        assert_eq!(people.item("3", Access::Default).unwrap(), None);
    }

    #[test]
    fn test_read_transaction_rejects_mutation() {
        let (_tmp, store) = setup_test_store();
        let people = people(&store);
        let err = store
            .default_connection()
            .unwrap()
            .read(|tx| people.persist(&person("1", "Ann"), None, tx))
            .unwrap_err();
        assert!(matches!(err, ShelfError::ContractViolation(_)));
    }

    #[test]
    fn test_manual_view_orders_by_caller() {
        let (_tmp, store) = setup_test_store();
        let people = people(&store);
        let x = person("x", "Xavier");
        let y = person("y", "Yvonne");
        people.persist(&x, None, Access::Default).unwrap();
        people.persist(&y, None, Access::Default).unwrap();

        let picks = people.manual_view(ViewOptions::new("picks")).unwrap();
        assert!(picks.insert_item(&x, 0, "g", Access::Default).unwrap());
        assert!(picks.insert_item(&y, 0, "g", Access::Default).unwrap());
        assert_eq!(names(picks.items("g", Access::Default).unwrap()), ["Yvonne", "Xavier"]);

        let removed = picks.remove_at(0, "g", Access::Default).unwrap();
        assert_eq!(removed, ck("y"));
        assert_eq!(picks.keys("g", Access::Default).unwrap(), vec![ck("x")]);
        assert!(!picks.is_item(&y, Access::Default).unwrap());
    }

    #[test]
    fn test_manual_view_edge_cases() {
        let (_tmp, store) = setup_test_store();
        let people = people(&store);
        let x = person("x", "Xavier");
        let y = person("y", "Yvonne");
        let ghost = person("ghost", "Nobody");
        people.persist(&x, None, Access::Default).unwrap();
        people.persist(&y, None, Access::Default).unwrap();
        let picks = people.manual_view(ViewOptions::new("picks")).unwrap();

        // unknown records are ignored
        assert!(!picks.add_item(&ghost, "g", Access::Default).unwrap());
        assert_eq!(picks.total_items(Access::Default).unwrap(), 0);
        // the index is checked even when the record is unknown
        let err = picks.insert_item(&ghost, 99, "g", Access::Default).unwrap_err();
        assert!(matches!(err, ShelfError::ContractViolation(_)));
        assert!(!picks.insert_item(&ghost, 0, "g", Access::Default).unwrap());

        let err = picks.insert_item(&x, 1, "g", Access::Default).unwrap_err();
        assert!(matches!(err, ShelfError::ContractViolation(_)));
        let err = picks.remove_at(0, "g", Access::Default).unwrap_err();
        assert!(matches!(err, ShelfError::ContractViolation(_)));

        picks.add_item(&x, "g", Access::Default).unwrap();
        picks.add_item(&y, "g", Access::Default).unwrap();
        // re-adding moves the key
        picks.add_item(&x, "h", Access::Default).unwrap();
        assert_eq!(picks.keys("g", Access::Default).unwrap(), vec![ck("y")]);
        assert_eq!(picks.keys("h", Access::Default).unwrap(), vec![ck("x")]);
        assert!(picks.is_item(&x, Access::Default).unwrap());

        assert!(!picks.remove_item(&x, "g", Access::Default).unwrap());
        assert!(picks.remove_key("x", "h", Access::Default).unwrap());

        // deleting the record drops it from the view
        people.remove_item(&y, Access::Default).unwrap();
        assert_eq!(picks.total_items(Access::Default).unwrap(), 0);

        people.persist(&y, None, Access::Default).unwrap();
        picks.add_item(&x, "g", Access::Default).unwrap();
        picks.add_item(&y, "g", Access::Default).unwrap();
        assert_eq!(picks.remove_all_in_group("g", Access::Default).unwrap(), 2);
        assert!(picks.groups(Access::Default).unwrap().is_empty());
    }

    #[test]
    fn test_manual_view_reports_member_updates() {
        let (_tmp, store) = setup_test_store();
        let people = people(&store);
        let x = person("x", "Xavier");
        people.persist(&x, None, Access::Default).unwrap();
        let picks = people.manual_view(ViewOptions::new("picks")).unwrap();
        picks.add_item(&x, "g", Access::Default).unwrap();

        let rx = store.subscribe();
        people.persist(&person("x", "Xavi"), None, Access::Default).unwrap();
        let notification = rx.try_recv().unwrap();
        let kinds: Vec<ChangeKind> = notification
            .changes
            .iter()
            .filter(|c| c.view == "picks")
            .map(|c| c.kind)
            .collect();
        assert_eq!(kinds, vec![ChangeKind::Update]);
        assert!(notification.touches_view("picks"));
    }

    #[test]
    fn test_filtered_view_is_subsequence_of_parent() {
        let (_tmp, store) = setup_test_store();
        let people = people(&store);
        let view = by_initial(&people, "by-initial");
        let long = view
            .filtered(
                ViewOptions::new("long-names"),
                Filtering::by_object(|p: &Person| p.name.len() > 3),
            )
            .unwrap();
        let conn = store.connection("fuzz").unwrap();
        let mut rng = Lcg(11);

        for _ in 0..40 {
            random_edits(&mut rng, &people, &conn);
            for group in view.groups(Access::Default).unwrap() {
                let expected: Vec<CollectionKey> = view
                    .keys(&group, Access::Default)
                    .unwrap()
                    .into_iter()
                    .filter(|k| {
                        let item = people.item(&k.key, Access::Default).unwrap().unwrap();
                        item.name.len() > 3
                    })
                    .collect();
                assert_eq!(long.keys(&group, Access::Default).unwrap(), expected);
            }
        }
    }

    #[test]
    fn test_update_filtering_reevaluates_rows() {
        let (_tmp, store) = setup_test_store();
        let people = people(&store);
        let view = by_initial(&people, "by-initial");
        let long = view
            .filtered(
                ViewOptions::new("long-names"),
                Filtering::by_object(|p: &Person| p.name.len() > 3),
            )
            .unwrap();
        for (id, name) in [("1", "Ann"), ("2", "Aaron"), ("3", "Bill"), ("4", "Bea")] {
            people.persist(&person(id, name), None, Access::Default).unwrap();
        }
        assert_eq!(long.keys("A", Access::Default).unwrap(), vec![ck("2")]);
        assert_eq!(long.keys("B", Access::Default).unwrap(), vec![ck("3")]);

        let before = long.version_tag().unwrap();
        let tag = long
            .update_filtering(Filtering::by_object(|p: &Person| p.name.starts_with('B')), None)
            .unwrap();
        assert_ne!(tag, before);
        assert_eq!(long.version_tag().unwrap(), tag);
        assert_eq!(long.groups(Access::Default).unwrap(), ["B"]);
        assert_eq!(long.keys("B", Access::Default).unwrap(), vec![ck("4"), ck("3")]);

        let stored = store
            .extensions()
            .unwrap()
            .into_iter()
            .find(|ext| ext.name == "long-names")
            .unwrap();
        assert_eq!(stored.version_tag, tag);
        assert_eq!(stored.parent.as_deref(), Some("by-initial"));

        let (done_tx, done_rx) = mpsc::channel();
        long.update_filtering_async(
            Filtering::by_key(|k: &CollectionKey| k.key == "1"),
            None,
            move |result| done_tx.send(result.is_ok()).unwrap(),
        )
        .join()
        .unwrap();
        assert!(done_rx.recv().unwrap());
        assert_eq!(long.groups(Access::Default).unwrap(), ["A"]);
        assert_eq!(long.keys("A", Access::Default).unwrap(), vec![ck("1")]);
    }

    fn fresh(view: &View<Person>, mapping: &ViewMapping) -> Vec<Vec<CollectionKey>> {
        mapping
            .visible_groups()
            .iter()
            .map(|group| view.keys(group, Access::Default).unwrap())
            .collect()
    }

    #[test]
    fn test_change_projection_matches_fresh_view() {
        let (_tmp, store) = setup_test_store();
        let people = people(&store);
        let view = by_initial(&people, "by-initial");
        let long = view
            .filtered(
                ViewOptions::new("long-names"),
                Filtering::by_object(|p: &Person| p.name.len() > 2),
            )
            .unwrap();
        let rx = store.subscribe();
        let conn = store.connection("fuzz").unwrap();

        let mut mappings = vec![
            view.mapping(&conn).unwrap(),
            long.mapping(&conn).unwrap(),
        ];
        let views: [&View<Person>; 2] = [&view, &long];
        let mut mirrors: Vec<Vec<Vec<CollectionKey>>> = views
            .iter()
            .zip(&mappings)
            .map(|(v, m)| fresh(v, m))
            .collect();
        let mut rng = Lcg(7);

        for _ in 0..60 {
            random_edits(&mut rng, &people, &conn);
            let notifications: Vec<_> = rx.try_iter().collect();
            for (i, v) in views.iter().enumerate() {
                let delta = changes(&notifications, &mappings[i]).unwrap();
                delta.apply(&mut mirrors[i], |k| k.clone()).unwrap();
                mappings[i] = delta.mapping;

                let current = v.mapping(Access::Default).unwrap();
                assert_eq!(mappings[i].visible_groups(), current.visible_groups());
                assert_eq!(mappings[i].snapshot(), current.snapshot());
                assert_eq!(mirrors[i], fresh(v, &mappings[i]));
            }
        }
    }

    fn random_picks(
        rng: &mut Lcg,
        people: &Collection<Person>,
        picks: &ManualView<Person>,
        conn: &crate::store::Connection,
    ) {
        let ops = 1 + rng.next(3);
        conn.read_write(|tx| {
            for _ in 0..ops {
                let id = rng.next(8).to_string();
                let group = ["g", "h"][rng.next(2) as usize];
                let size = picks.number_of_items(group, tx)? as u64;
                match rng.next(8) {
                    0 => {
                        people.remove_key(&id, tx)?;
                    }
                    1 | 2 => {
                        let name = NAMES[rng.next(NAMES.len() as u64) as usize];
                        people.persist(&person(&id, name), None, tx)?;
                    }
                    3 => {
                        picks.add_item(&person(&id, ""), group, tx)?;
                    }
                    4 => {
                        let index = rng.next(size.max(1)) as usize;
                        picks.insert_item(&person(&id, ""), index, group, tx)?;
                    }
                    5 => {
                        picks.remove_key(&id, group, tx)?;
                    }
                    6 if size > 0 => {
                        picks.remove_at(rng.next(size) as usize, group, tx)?;
                    }
                    _ => {
                        if rng.next(3) == 0 {
                            picks.remove_all_in_group(group, tx)?;
                        }
                    }
                }
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_change_projection_follows_manual_edits() {
        let (_tmp, store) = setup_test_store();
        let people = people(&store);
        let picks = people.manual_view(ViewOptions::new("picks")).unwrap();
        let long = picks
            .filtered(
                ViewOptions::new("long-picks"),
                Filtering::by_object(|p: &Person| p.name.len() > 3),
            )
            .unwrap();
        let rx = store.subscribe();
        let conn = store.connection("fuzz").unwrap();

        let mut mappings = vec![
            picks.mapping(&conn).unwrap(),
            long.mapping(&conn).unwrap(),
        ];
        let views: [&View<Person>; 2] = [&picks, &long];
        let mut mirrors: Vec<Vec<Vec<CollectionKey>>> = views
            .iter()
            .zip(&mappings)
            .map(|(v, m)| fresh(v, m))
            .collect();
        let mut rng = Lcg(23);
        let mut moved = 0;

        for _ in 0..120 {
            random_picks(&mut rng, &people, &picks, &conn);
            let notifications: Vec<_> = rx.try_iter().collect();
            moved += notifications
                .iter()
                .flat_map(|n| &n.changes)
                .filter(|c| c.view == "picks")
                .count();
            for (i, v) in views.iter().enumerate() {
                let delta = changes(&notifications, &mappings[i]).unwrap();
                delta.apply(&mut mirrors[i], |k| k.clone()).unwrap();
                mappings[i] = delta.mapping;

                let current = v.mapping(Access::Default).unwrap();
                assert_eq!(mappings[i].visible_groups(), current.visible_groups());
                assert_eq!(mappings[i].snapshot(), current.snapshot());
                assert_eq!(mirrors[i], fresh(v, &mappings[i]));
            }
        }
        assert!(moved > 0);
    }

    fn hide_b(group: &str) -> bool {
        group != "B"
    }

    #[test]
    fn test_change_projection_with_group_filter() {
        let (_tmp, store) = setup_test_store();
        let people = people(&store);
        let view = by_initial(&people, "by-initial");
        let rx = store.subscribe();
        let conn = store.connection("fuzz").unwrap();

        let mut mapping = view
            .mapping_with(ViewMapping::new("by-initial").with_group_filter(hide_b), &conn)
            .unwrap();
        let mut mirror = fresh(&view, &mapping);
        let mut rng = Lcg(5);

        for _ in 0..60 {
            random_edits(&mut rng, &people, &conn);
            let notifications: Vec<_> = rx.try_iter().collect();
            let delta = changes(&notifications, &mapping).unwrap();
            delta.apply(&mut mirror, |k| k.clone()).unwrap();
            mapping = delta.mapping;

            let current = view
                .mapping_with(ViewMapping::new("by-initial").with_group_filter(hide_b), Access::Default)
                .unwrap();
            assert!(!mapping.visible_groups().iter().any(|g| g == "B"));
            assert_eq!(mapping.visible_groups(), current.visible_groups());
            assert_eq!(mapping.snapshot(), current.snapshot());
            assert_eq!(mirror, fresh(&view, &mapping));
        }
    }

    #[test]
    fn test_mapping_reads_keys_through_transaction() {
        let (_tmp, store) = setup_test_store();
        let people = people(&store);
        let view = by_initial(&people, "by-initial");
        for (id, name) in [("1", "Ann"), ("2", "Bill"), ("3", "Aaron")] {
            people.persist(&person(id, name), None, Access::Default).unwrap();
        }

        let mapping = view
            .mapping_with(
                ViewMapping::new("by-initial").with_group_sort(|a, b| b.cmp(a)),
                Access::Default,
            )
            .unwrap();
        assert_eq!(mapping.visible_groups(), ["B", "A"]);
        let key = store
            .default_connection()
            .unwrap()
            .read(|tx| mapping.key_at(1, 1, tx))
            .unwrap();
        assert_eq!(key, Some(ck("1")));

        let err = view
            .mapping_with(ViewMapping::new("elsewhere"), Access::Default)
            .unwrap_err();
        assert!(matches!(err, ShelfError::ContractViolation(_)));
    }

    #[test]
    fn test_metadata_grouping_follows_update_metadata() {
        let (_tmp, store) = setup_test_store();
        let tasks: Collection<Person, String> = Collection::builder("tasks")
            .key_fn(|p: &Person| p.id.clone())
            .meta_fn(|_: &Person| "todo".to_string())
            .build();
        tasks.register(&store).unwrap();
        let by_state = tasks
            .view(
                ViewOptions::new("by-state"),
                Grouping::by_key_meta(|_: &CollectionKey, meta: Option<&String>| meta.cloned()),
                Sorting::by_key(|_, a, b| a.cmp(b)),
            )
            .unwrap();

        tasks.persist(&person("1", "Write"), None, Access::Default).unwrap();
        tasks
            .persist(&person("2", "Test"), Some(&"done".to_string()), Access::Default)
            .unwrap();
        assert_eq!(by_state.groups(Access::Default).unwrap(), ["done", "todo"]);

        assert!(tasks
            .update_metadata("1", Some(&"done".to_string()), Access::Default)
            .unwrap());
        assert!(!tasks
            .update_metadata("9", Some(&"done".to_string()), Access::Default)
            .unwrap());
        assert_eq!(by_state.groups(Access::Default).unwrap(), ["done"]);
        assert_eq!(tasks.metadata("1", Access::Default).unwrap(), Some("done".to_string()));
        assert_eq!(by_state.number_of_items("done", Access::Default).unwrap(), 2);
    }

    #[test]
    fn test_compressed_collection_round_trip() {
        let (_tmp, store) = setup_test_store();
        let packed: Collection<Person, String> = Collection::builder("packed")
            .key_fn(|p: &Person| p.id.clone())
            .meta_fn(|p: &Person| p.name.to_lowercase())
            .object_compression(Compression::Lz4)
            .metadata_compression(Compression::Lz4)
            .build();
        packed.register(&store).unwrap();

        let ann = person("1", "Ann");
        packed.persist(&ann, None, Access::Default).unwrap();
        assert_eq!(packed.item("1", Access::Default).unwrap(), Some(ann));
        assert_eq!(packed.metadata("1", Access::Default).unwrap(), Some("ann".to_string()));

        let raw = store
            .default_connection()
            .unwrap()
            .read(|tx| tx.get_raw("packed", "1"))
            .unwrap()
            .unwrap();
        assert!(serde_json::from_slice::<Person>(&raw.object).is_err());

        // same name, different compression
        let plain: Collection<Person, String> = Collection::builder("packed").build();
        let err = plain.register(&store).unwrap_err();
        assert!(matches!(err, ShelfError::Registration { .. }));
    }

    #[test]
    fn test_multi_view_and_typed_view() {
        let (_tmp, store) = setup_test_store();
        let people = people(&store);
        let staff: Collection<Person> = Collection::builder("staff")
            .key_fn(|p: &Person| p.id.clone())
            .build();
        staff.register(&store).unwrap();
        let notes: Collection<String> = Collection::builder("notes")
            .key_fn(|s: &String| s.clone())
            .build();
        notes.register(&store).unwrap();

        people.persist(&person("1", "Ann"), None, Access::Default).unwrap();
        staff.persist(&person("1", "Bob"), None, Access::Default).unwrap();
        staff.persist(&person("2", "Cy"), None, Access::Default).unwrap();
        notes.persist(&"hello".to_string(), None, Access::Default).unwrap();

        let everyone = people
            .multi_view(
                ViewOptions::new("everyone"),
                &[&staff],
                Grouping::single("all"),
                Sorting::by_comparing(|p: &Person| p.name.clone(), false),
            )
            .unwrap();
        assert_eq!(names(everyone.items("all", Access::Default).unwrap()), ["Ann", "Bob", "Cy"]);
        assert_eq!(
            everyone.keys("all", Access::Default).unwrap(),
            vec![
                ck("1"),
                CollectionKey::new("staff", "1"),
                CollectionKey::new("staff", "2")
            ]
        );

        let all: MultiCollection<Person> = MultiCollection::new(&store);
        let typed = all
            .typed_view(
                ViewOptions::new("typed"),
                Grouping::single("all"),
                Sorting::by_key(|_, a, b| b.cmp(a)),
            )
            .unwrap();
        assert_eq!(typed.total_items(Access::Default).unwrap(), 3);
        assert_eq!(
            all.collection_names(Access::Default).unwrap(),
            vec!["people".to_string(), "staff".to_string()]
        );

        // records persisted later reach the typed view too
        notes.persist(&"again".to_string(), None, Access::Default).unwrap();
        staff.persist(&person("3", "Dee"), None, Access::Default).unwrap();
        assert_eq!(typed.total_items(Access::Default).unwrap(), 4);
    }

    fn named(store: &Store, name: &str) -> Collection<Person> {
        let collection: Collection<Person> = Collection::builder(name)
            .key_fn(|p: &Person| p.id.clone())
            .build();
        collection.register(store).unwrap();
        collection
    }

    fn typed_all(store: &Store) -> View<Person> {
        MultiCollection::<Person>::new(store)
            .typed_view(
                ViewOptions::new("typed"),
                Grouping::single("all"),
                Sorting::by_key(|_, a, b| a.cmp(b)),
            )
            .unwrap()
    }

    #[test]
    fn test_typed_view_adopts_collection_registered_later() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("shelf.db");
        {
            let store = Store::open(&path).unwrap();
            named(&store, "a").persist(&person("1", "Ann"), None, Access::Default).unwrap();
            named(&store, "b").persist(&person("1", "Bob"), None, Access::Default).unwrap();
        }

        let store = Store::open(&path).unwrap();
        named(&store, "a");
        let typed = typed_all(&store);
        assert_eq!(typed.total_items(Access::Default).unwrap(), 1);

        let rx = store.subscribe();
        named(&store, "b");
        assert_eq!(typed.total_items(Access::Default).unwrap(), 2);
        assert_eq!(
            typed.keys("all", Access::Default).unwrap(),
            vec![CollectionKey::new("a", "1"), CollectionKey::new("b", "1")]
        );
        let adopted = rx.try_recv().unwrap();
        assert_eq!(adopted.changes.len(), 1);

        // a second binding of the same collection adopts nothing
        named(&store, "b");
        assert!(rx.try_recv().is_err());
        drop((typed, store));

        // reused state already holds both collections
        let store = Store::open(&path).unwrap();
        named(&store, "a");
        named(&store, "b");
        let typed = typed_all(&store);
        assert_eq!(typed.total_items(Access::Default).unwrap(), 2);
    }

    #[test]
    fn test_async_view_registration() {
        let (_tmp, store) = setup_test_store();
        let people = people(&store);
        people.persist(&person("1", "Ann"), None, Access::Default).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        people
            .view_async(
                ViewOptions::new("async"),
                Grouping::single("all"),
                Sorting::by_key(|_, a, b| a.cmp(b)),
                move |result| {
                    let total = result.and_then(|view| view.total_items(Access::Default));
                    done_tx.send(total.map_err(|e| e.to_string())).unwrap();
                },
            )
            .join()
            .unwrap();
        assert_eq!(done_rx.recv().unwrap(), Ok(1));
    }

    fn initials(people: &Collection<Person>, tag: &str, grouping: Grouping<Person>) -> View<Person> {
        people
            .view(
                ViewOptions::new("initials").version_tag(tag),
                grouping,
                Sorting::by_comparing(|p: &Person| p.name.clone(), false),
            )
            .unwrap()
    }

    fn reopen(path: &Path) -> (Store, Collection<Person>) {
        let store = Store::open(path).unwrap();
        let people = people(&store);
        (store, people)
    }

    #[test]
    fn test_view_state_survives_reopen_until_tag_changes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("shelf.db");
        {
            let (_store, people) = reopen(&path);
            let view = initials(&people, "1", Grouping::by_object(|p: &Person| first_letter(&p.name)));
            people.persist(&person("1", "Ann"), None, Access::Default).unwrap();
            people.persist(&person("2", "Bob"), None, Access::Default).unwrap();
            assert_eq!(view.groups(Access::Default).unwrap(), ["A", "B"]);
        }
        {
            // same tag: stored state is reused as is
            let (store, people) = reopen(&path);
            let view = initials(&people, "1", Grouping::single("everyone"));
            assert_eq!(view.groups(Access::Default).unwrap(), ["A", "B"]);
            let stored = store.extensions().unwrap();
            assert_eq!(stored[0].maintained_through, store.snapshot().unwrap());
        }
        {
            let (_store, people) = reopen(&path);
            let view = initials(&people, "2", Grouping::single("everyone"));
            assert_eq!(view.groups(Access::Default).unwrap(), ["everyone"]);
            assert_eq!(names(view.items("everyone", Access::Default).unwrap()), ["Ann", "Bob"]);
        }
    }

    #[test]
    fn test_stale_view_is_rebuilt() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("shelf.db");
        let grouping = || Grouping::by_object(|p: &Person| first_letter(&p.name));
        {
            let (_store, people) = reopen(&path);
            initials(&people, "1", grouping());
            people.persist(&person("1", "Ann"), None, Access::Default).unwrap();
        }
        {
            // written while the view is not registered
            let (_store, people) = reopen(&path);
            people.persist(&person("2", "Bob"), None, Access::Default).unwrap();
        }
        let (store, people) = reopen(&path);
        let view = initials(&people, "1", grouping());
        assert_eq!(view.groups(Access::Default).unwrap(), ["A", "B"]);
        // the rebuild itself inserted Bob into the view and committed
        assert_eq!(store.snapshot().unwrap(), 3);
        assert_eq!(store.extensions().unwrap()[0].maintained_through, 3);
    }

    #[test]
    fn test_non_persistent_view_is_purged_on_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("shelf.db");
        {
            let (store, people) = reopen(&path);
            people
                .view(
                    ViewOptions::new("scratch").persistent(false),
                    Grouping::single("all"),
                    Sorting::by_key(|_, a, b| a.cmp(b)),
                )
                .unwrap();
            assert_eq!(store.extensions().unwrap().len(), 1);
        }
        let (store, _people) = reopen(&path);
        assert!(store.extensions().unwrap().is_empty());
    }

    #[test]
    fn test_dropped_store_is_contract_violation() {
        let (_tmp, store) = setup_test_store();
        let people = people(&store);
        let view = by_initial(&people, "by-initial");
        drop(store);

        let err = people.item("1", Access::Default).unwrap_err();
        assert!(matches!(err, ShelfError::ContractViolation(_)));
        let err = view.groups(Access::Default).unwrap_err();
        assert!(matches!(err, ShelfError::ContractViolation(_)));
    }

    #[test]
    fn test_collection_binds_to_one_store() {
        let (_a, first) = setup_test_store();
        let (_b, second) = setup_test_store();
        let people = people(&first);

        people.register(&first).unwrap();
        let err = people.register(&second).unwrap_err();
        assert!(matches!(err, ShelfError::ContractViolation(_)));

        let unbound: Collection<Person> = Collection::new("loose");
        let err = unbound.number_of_items(Access::Default).unwrap_err();
        assert!(matches!(err, ShelfError::ContractViolation(_)));
    }

    #[test]
    fn test_unique_sortable_ids_are_monotonic() {
        let ids: Vec<String> = (0..200).map(|_| new_unique_sortable_id()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted, ids);
        assert!(ids.iter().all(|id| id.len() == 26 && id == &id.to_lowercase()));

        let (_tmp, store) = setup_test_store();
        let generated: Collection<Person> = Collection::new("generated");
        generated.register(&store).unwrap();
        let first = generated.persist(&person("", "A"), None, Access::Default).unwrap();
        let second = generated.persist(&person("", "A"), None, Access::Default).unwrap();
        assert!(first < second);
        assert_eq!(generated.number_of_items(Access::Default).unwrap(), 2);
    }
}
