//! Typed grouping, sorting and filtering functions.
//!
//! Each enum is tagged by the parts of a row its closure reads. Views erase the
//! item types behind [`Derivation`] and [`Predicate`] so the store can run them
//! over raw rows during maintenance.

use crate::error::Result;
use crate::store::{CollectionKey, RawRow};
use serde::de::DeserializeOwned;
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;

/// Everything a view function may look at for one record.
pub struct Row<'a, OT, MT = ()> {
    pub ck: &'a CollectionKey,
    pub object: &'a OT,
    pub metadata: Option<&'a MT>,
}

impl<'a, OT, MT> Row<'a, OT, MT> {
    pub fn collection(&self) -> &'a str {
        &self.ck.collection
    }

    pub fn key(&self) -> &'a str {
        &self.ck.key
    }
}

/// Decides the group of a row. `None` keeps the row out of the view.
pub enum Grouping<OT, MT = ()> {
    /// Every row of the item type lands in the named group.
    Single(String),
    ByKey(Box<dyn Fn(&CollectionKey) -> Option<String> + Send + Sync>),
    ByObject(Box<dyn Fn(&OT) -> Option<String> + Send + Sync>),
    ByKeyObject(Box<dyn Fn(&CollectionKey, &OT) -> Option<String> + Send + Sync>),
    ByKeyMeta(Box<dyn Fn(&CollectionKey, Option<&MT>) -> Option<String> + Send + Sync>),
    ByRow(Box<dyn Fn(&Row<'_, OT, MT>) -> Option<String> + Send + Sync>),
}

impl<OT, MT> Grouping<OT, MT> {
    pub fn single(group: impl Into<String>) -> Self {
        Grouping::Single(group.into())
    }

    pub fn by_key(f: impl Fn(&CollectionKey) -> Option<String> + Send + Sync + 'static) -> Self {
        Grouping::ByKey(Box::new(f))
    }

    pub fn by_object(f: impl Fn(&OT) -> Option<String> + Send + Sync + 'static) -> Self {
        Grouping::ByObject(Box::new(f))
    }

    pub fn by_key_object(
        f: impl Fn(&CollectionKey, &OT) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Grouping::ByKeyObject(Box::new(f))
    }

    pub fn by_key_meta(
        f: impl Fn(&CollectionKey, Option<&MT>) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Grouping::ByKeyMeta(Box::new(f))
    }

    pub fn by_row(f: impl Fn(&Row<'_, OT, MT>) -> Option<String> + Send + Sync + 'static) -> Self {
        Grouping::ByRow(Box::new(f))
    }
}

/// Orders two rows of the same group. The group name is passed first.
pub enum Sorting<OT, MT = ()> {
    ByKey(Box<dyn Fn(&str, &CollectionKey, &CollectionKey) -> Ordering + Send + Sync>),
    ByObject(Box<dyn Fn(&str, &OT, &OT) -> Ordering + Send + Sync>),
    /// Compare a string extracted from each object.
    ByComparing {
        field: Box<dyn Fn(&OT) -> String + Send + Sync>,
        case_insensitive: bool,
    },
    ByKeyObject(
        Box<dyn Fn(&str, (&CollectionKey, &OT), (&CollectionKey, &OT)) -> Ordering + Send + Sync>,
    ),
    ByKeyMeta(
        Box<
            dyn Fn(&str, (&CollectionKey, Option<&MT>), (&CollectionKey, Option<&MT>)) -> Ordering
                + Send
                + Sync,
        >,
    ),
    ByRow(Box<dyn Fn(&str, &Row<'_, OT, MT>, &Row<'_, OT, MT>) -> Ordering + Send + Sync>),
}

impl<OT, MT> Sorting<OT, MT> {
    pub fn by_key(
        f: impl Fn(&str, &CollectionKey, &CollectionKey) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        Sorting::ByKey(Box::new(f))
    }

    pub fn by_object(f: impl Fn(&str, &OT, &OT) -> Ordering + Send + Sync + 'static) -> Self {
        Sorting::ByObject(Box::new(f))
    }

    pub fn by_comparing(
        field: impl Fn(&OT) -> String + Send + Sync + 'static,
        case_insensitive: bool,
    ) -> Self {
        Sorting::ByComparing {
            field: Box::new(field),
            case_insensitive,
        }
    }

    pub fn by_key_object(
        f: impl Fn(&str, (&CollectionKey, &OT), (&CollectionKey, &OT)) -> Ordering
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Sorting::ByKeyObject(Box::new(f))
    }

    pub fn by_key_meta(
        f: impl Fn(&str, (&CollectionKey, Option<&MT>), (&CollectionKey, Option<&MT>)) -> Ordering
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Sorting::ByKeyMeta(Box::new(f))
    }

    pub fn by_row(
        f: impl Fn(&str, &Row<'_, OT, MT>, &Row<'_, OT, MT>) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        Sorting::ByRow(Box::new(f))
    }
}

/// Keeps or drops a row of the parent view.
pub enum Filtering<OT, MT = ()> {
    ByKey(Box<dyn Fn(&CollectionKey) -> bool + Send + Sync>),
    ByObject(Box<dyn Fn(&OT) -> bool + Send + Sync>),
    ByKeyObject(Box<dyn Fn(&CollectionKey, &OT) -> bool + Send + Sync>),
    ByKeyMeta(Box<dyn Fn(&CollectionKey, Option<&MT>) -> bool + Send + Sync>),
    ByRow(Box<dyn Fn(&Row<'_, OT, MT>) -> bool + Send + Sync>),
}

impl<OT, MT> Filtering<OT, MT> {
    pub fn by_key(f: impl Fn(&CollectionKey) -> bool + Send + Sync + 'static) -> Self {
        Filtering::ByKey(Box::new(f))
    }

    pub fn by_object(f: impl Fn(&OT) -> bool + Send + Sync + 'static) -> Self {
        Filtering::ByObject(Box::new(f))
    }

    pub fn by_key_object(f: impl Fn(&CollectionKey, &OT) -> bool + Send + Sync + 'static) -> Self {
        Filtering::ByKeyObject(Box::new(f))
    }

    pub fn by_key_meta(
        f: impl Fn(&CollectionKey, Option<&MT>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Filtering::ByKeyMeta(Box::new(f))
    }

    pub fn by_row(f: impl Fn(&Row<'_, OT, MT>) -> bool + Send + Sync + 'static) -> Self {
        Filtering::ByRow(Box::new(f))
    }
}

/// Type-erased grouping plus sorting, run by the store over raw rows.
pub(crate) trait Derivation: Send + Sync {
    /// Group of the row, or `None` when the row is not part of the view.
    fn group(&self, row: &RawRow) -> Result<Option<String>>;

    /// Order of two rows already known to belong to `group`.
    fn compare(&self, group: &str, a: &RawRow, b: &RawRow) -> Result<Ordering>;
}

/// Type-erased filter, run by the store over raw rows.
pub(crate) trait Predicate: Send + Sync {
    fn accepts(&self, row: &RawRow) -> Result<bool>;
}

pub(crate) struct ComputedLogic<OT, MT> {
    grouping: Grouping<OT, MT>,
    sorting: Sorting<OT, MT>,
}

impl<OT, MT> ComputedLogic<OT, MT> {
    pub fn new(grouping: Grouping<OT, MT>, sorting: Sorting<OT, MT>) -> Self {
        ComputedLogic { grouping, sorting }
    }
}

pub(crate) struct FilterLogic<OT, MT> {
    filtering: Filtering<OT, MT>,
    _types: PhantomData<fn() -> (OT, MT)>,
}

impl<OT, MT> FilterLogic<OT, MT> {
    pub fn new(filtering: Filtering<OT, MT>) -> Self {
        FilterLogic {
            filtering,
            _types: PhantomData,
        }
    }
}

/// A row decoded for one item type.
struct Typed<'r, OT, MT> {
    ck: &'r CollectionKey,
    object: Arc<OT>,
    metadata: Option<Arc<MT>>,
}

impl<'r, OT, MT> Typed<'r, OT, MT>
where
    OT: DeserializeOwned + Send + Sync + 'static,
    MT: DeserializeOwned + Send + Sync + 'static,
{
    /// Decode a raw row. Metadata is decoded only when `with_meta` is set.
    fn decode(row: &'r RawRow, with_meta: bool) -> Result<Option<Self>> {
        let Some(object) = row.object::<OT>()? else {
            return Ok(None);
        };
        let metadata = if with_meta { row.metadata::<MT>()? } else { None };
        Ok(Some(Typed {
            ck: &row.ck,
            object,
            metadata,
        }))
    }

    fn row(&self) -> Row<'_, OT, MT> {
        Row {
            ck: self.ck,
            object: &self.object,
            metadata: self.metadata.as_deref(),
        }
    }
}

impl<OT, MT> Grouping<OT, MT> {
    fn reads_metadata(&self) -> bool {
        matches!(self, Grouping::ByKeyMeta(_) | Grouping::ByRow(_))
    }
}

impl<OT, MT> Sorting<OT, MT> {
    fn reads_metadata(&self) -> bool {
        matches!(self, Sorting::ByKeyMeta(_) | Sorting::ByRow(_))
    }
}

impl<OT, MT> Filtering<OT, MT> {
    fn reads_metadata(&self) -> bool {
        matches!(self, Filtering::ByKeyMeta(_) | Filtering::ByRow(_))
    }
}

impl<OT, MT> Derivation for ComputedLogic<OT, MT>
where
    OT: DeserializeOwned + Send + Sync + 'static,
    MT: DeserializeOwned + Send + Sync + 'static,
{
    fn group(&self, row: &RawRow) -> Result<Option<String>> {
        let Some(typed) = Typed::<OT, MT>::decode(row, self.grouping.reads_metadata())? else {
            return Ok(None);
        };
        let group = match &self.grouping {
            Grouping::Single(name) => Some(name.clone()),
            Grouping::ByKey(f) => f(typed.ck),
            Grouping::ByObject(f) => f(&typed.object),
            Grouping::ByKeyObject(f) => f(typed.ck, &typed.object),
            Grouping::ByKeyMeta(f) => f(typed.ck, typed.metadata.as_deref()),
            Grouping::ByRow(f) => f(&typed.row()),
        };
        Ok(group)
    }

    fn compare(&self, group: &str, a: &RawRow, b: &RawRow) -> Result<Ordering> {
        if let Sorting::ByKey(f) = &self.sorting {
            return Ok(f(group, &a.ck, &b.ck));
        }
        let with_meta = self.sorting.reads_metadata();
        let (Some(a), Some(b)) = (
            Typed::<OT, MT>::decode(a, with_meta)?,
            Typed::<OT, MT>::decode(b, with_meta)?,
        ) else {
            return Ok(Ordering::Equal);
        };
        let ordering = match &self.sorting {
            Sorting::ByKey(f) => f(group, a.ck, b.ck),
            Sorting::ByObject(f) => f(group, &a.object, &b.object),
            Sorting::ByComparing {
                field,
                case_insensitive,
            } => {
                let (left, right) = (field(&a.object), field(&b.object));
                if *case_insensitive {
                    left.to_lowercase().cmp(&right.to_lowercase())
                } else {
                    left.cmp(&right)
                }
            }
            Sorting::ByKeyObject(f) => f(group, (a.ck, &a.object), (b.ck, &b.object)),
            Sorting::ByKeyMeta(f) => f(
                group,
                (a.ck, a.metadata.as_deref()),
                (b.ck, b.metadata.as_deref()),
            ),
            Sorting::ByRow(f) => f(group, &a.row(), &b.row()),
        };
        Ok(ordering)
    }
}

impl<OT, MT> Predicate for FilterLogic<OT, MT>
where
    OT: DeserializeOwned + Send + Sync + 'static,
    MT: DeserializeOwned + Send + Sync + 'static,
{
    fn accepts(&self, row: &RawRow) -> Result<bool> {
        if let Filtering::ByKey(f) = &self.filtering {
            return Ok(f(&row.ck));
        }
        let Some(typed) = Typed::<OT, MT>::decode(row, self.filtering.reads_metadata())? else {
            return Ok(false);
        };
        let keep = match &self.filtering {
            Filtering::ByKey(f) => f(typed.ck),
            Filtering::ByObject(f) => f(&typed.object),
            Filtering::ByKeyObject(f) => f(typed.ck, &typed.object),
            Filtering::ByKeyMeta(f) => f(typed.ck, typed.metadata.as_deref()),
            Filtering::ByRow(f) => f(&typed.row()),
        };
        Ok(keep)
    }
}
