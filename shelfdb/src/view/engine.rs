//! Incremental view maintenance.
//!
//! Every change to a view's materialized state is expressed as a [`GroupEdit`]:
//! one group's member list before and after, plus what caused it. Applying an
//! edit journals the sequential change records for that view and hands the same
//! edit to every filtered view derived from it, which narrows it to its own
//! membership and recurses.

use crate::changes::{ChangeKind, ChangeRecord};
use crate::codec::SerializerRegistry;
use crate::error::{Result, ShelfError};
use crate::store::{CollectionKey, RawRow};
use crate::system_db::SystemDb;
use crate::view::grouping::Derivation;
use crate::view::{RegisteredView, ViewLogic};
use log::{info, trace, warn};
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

pub(crate) struct GroupEdit {
    pub group: String,
    pub before: Vec<CollectionKey>,
    pub after: Vec<CollectionKey>,
    pub change: EditChange,
}

pub(crate) enum EditChange {
    /// One key moved, appeared, disappeared or was rewritten. `row` is the
    /// record as it is now, `None` once deleted.
    Row {
        ck: CollectionKey,
        row: Option<Arc<RawRow>>,
        updated: bool,
    },
    /// The whole group was re-derived.
    Reset,
}

/// Maintenance context for one read-write transaction.
pub(crate) struct Maintenance<'t> {
    db: SystemDb<'t>,
    codecs: &'t SerializerRegistry,
    views: Vec<Arc<RegisteredView>>,
    journal: &'t RefCell<Vec<ChangeRecord>>,
    dirty: &'t Cell<bool>,
}

impl<'t> Maintenance<'t> {
    pub fn new(
        db: SystemDb<'t>,
        codecs: &'t SerializerRegistry,
        views: Vec<Arc<RegisteredView>>,
        journal: &'t RefCell<Vec<ChangeRecord>>,
        dirty: &'t Cell<bool>,
    ) -> Self {
        Maintenance {
            db,
            codecs,
            views,
            journal,
            dirty,
        }
    }

    pub fn load_row(&self, ck: &CollectionKey) -> Result<Option<Arc<RawRow>>> {
        let Some(record) = self.db.get_record(&ck.collection, &ck.key)? else {
            return Ok(None);
        };
        let codec = self.codecs.lookup(&ck.collection);
        Ok(Some(Arc::new(RawRow::new(ck.clone(), record, codec))))
    }

    fn require_row(&self, view: &RegisteredView, ck: &CollectionKey) -> Result<Arc<RawRow>> {
        self.load_row(ck)?.ok_or_else(|| {
            ShelfError::Inconsistent(format!("view '{}' lists {ck} but the record is gone", view.name))
        })
    }

    /// Bring every root view allowing the collection in line with the new
    /// state of one record (`None` when it was deleted).
    pub fn record_changed(&self, ck: &CollectionKey, row: Option<Arc<RawRow>>) -> Result<()> {
        for view in &self.views {
            if view.parent.is_some() || !view.allows(&ck.collection) {
                continue;
            }
            match &view.logic {
                ViewLogic::Computed(logic) => {
                    self.place_computed(view, logic.as_ref(), ck, row.as_ref())?
                }
                ViewLogic::Manual => self.touch_manual(view, ck, row.as_ref())?,
                ViewLogic::Filtered(_) => {}
            }
        }
        Ok(())
    }

    /// Place the records of a newly bound collection in the root computed
    /// views that consider every collection. Until its codec is known those
    /// records cannot be decoded and are absent from such views. Rows already
    /// in a view stay where they are.
    pub fn adopt_collection(&self, collection: &str) -> Result<()> {
        let keys = self.db.keys(collection)?;
        for view in &self.views {
            if view.parent.is_some() || !view.allowed.is_empty() {
                continue;
            }
            let ViewLogic::Computed(logic) = &view.logic else {
                continue;
            };
            let mut placed = 0;
            for key in &keys {
                let ck = CollectionKey::new(collection, key.as_str());
                if self.db.group_of(&view.name, &ck)?.is_some() {
                    continue;
                }
                let row = self.load_row(&ck)?;
                if row.is_some() {
                    self.place_computed(view, logic.as_ref(), &ck, row.as_ref())?;
                    placed += 1;
                }
            }
            if placed > 0 {
                info!("view '{}': adopted {placed} record(s) of '{collection}'", view.name);
            }
        }
        Ok(())
    }

    fn place_computed(
        &self,
        view: &RegisteredView,
        logic: &dyn Derivation,
        ck: &CollectionKey,
        row: Option<&Arc<RawRow>>,
    ) -> Result<()> {
        let old_group = self.db.group_of(&view.name, ck)?;
        let new_group = match row {
            Some(row) => logic.group(row)?,
            None => None,
        };
        if old_group.is_none() && new_group.is_none() {
            return Ok(());
        }
        trace!("view '{}': {ck} {:?} -> {:?}", view.name, old_group, new_group);

        if let Some(old) = old_group.filter(|g| Some(g) != new_group.as_ref()) {
            let before = self.db.load_group(&view.name, &old)?;
            let after = without(&before, ck);
            self.db.save_group(&view.name, &old, &after)?;
            self.db.clear_group_of(&view.name, ck)?;
            self.apply_edit(
                view,
                GroupEdit {
                    group: old,
                    before,
                    after,
                    change: EditChange::Row {
                        ck: ck.clone(),
                        row: row.cloned(),
                        updated: true,
                    },
                },
            )?;
        }

        if let (Some(group), Some(row)) = (new_group, row) {
            let before = self.db.load_group(&view.name, &group)?;
            let mut after = without(&before, ck);
            let index = self.insertion_index(view, logic, &group, &after, row)?;
            after.insert(index, ck.clone());
            self.db.save_group(&view.name, &group, &after)?;
            self.db.set_group_of(&view.name, ck, &group)?;
            self.apply_edit(
                view,
                GroupEdit {
                    group,
                    before,
                    after,
                    change: EditChange::Row {
                        ck: ck.clone(),
                        row: Some(row.clone()),
                        updated: true,
                    },
                },
            )?;
        }
        Ok(())
    }

    /// Binary search over the sorted members, ties broken by collection key.
    fn insertion_index(
        &self,
        view: &RegisteredView,
        logic: &dyn Derivation,
        group: &str,
        members: &[CollectionKey],
        row: &RawRow,
    ) -> Result<usize> {
        let (mut low, mut high) = (0, members.len());
        while low < high {
            let mid = (low + high) / 2;
            let pivot = self.require_row(view, &members[mid])?;
            let ordering = logic
                .compare(group, &pivot, row)?
                .then_with(|| pivot.ck.cmp(&row.ck));
            if ordering == Ordering::Less {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        Ok(low)
    }

    fn touch_manual(
        &self,
        view: &RegisteredView,
        ck: &CollectionKey,
        row: Option<&Arc<RawRow>>,
    ) -> Result<()> {
        let Some(group) = self.db.group_of(&view.name, ck)? else {
            return Ok(());
        };
        let before = self.db.load_group(&view.name, &group)?;
        let after = if row.is_some() {
            before.clone()
        } else {
            let after = without(&before, ck);
            self.db.save_group(&view.name, &group, &after)?;
            self.db.clear_group_of(&view.name, ck)?;
            after
        };
        self.apply_edit(
            view,
            GroupEdit {
                group,
                before,
                after,
                change: EditChange::Row {
                    ck: ck.clone(),
                    row: row.cloned(),
                    updated: true,
                },
            },
        )
    }

    fn children(&self, view: &RegisteredView) -> Vec<Arc<RegisteredView>> {
        self.views
            .iter()
            .filter(|child| child.parent.as_ref().is_some_and(|p| p.name == view.name))
            .cloned()
            .collect()
    }

    fn apply_edit(&self, view: &RegisteredView, edit: GroupEdit) -> Result<()> {
        let emitted = match &edit.change {
            EditChange::Row { ck, updated, .. } => self.journal_single(
                view,
                &edit.group,
                ck,
                position(&edit.before, ck),
                position(&edit.after, ck),
                *updated,
            ),
            EditChange::Reset => self.journal_lists(view, &edit.group, &edit.before, &edit.after),
        };
        if emitted > 0 {
            self.dirty.set(true);
        }
        for child in self.children(view) {
            self.filtered_edit(&child, &edit)?;
        }
        Ok(())
    }

    /// Narrow a parent's edit to the filtered view's membership, updating that
    /// membership for the rows the edit touched.
    fn filtered_edit(&self, view: &RegisteredView, parent: &GroupEdit) -> Result<()> {
        let predicate = view.predicate()?;
        let group = &parent.group;
        let mut members = self.db.keys_in_group(&view.name, group)?;
        let before: Vec<CollectionKey> = parent
            .before
            .iter()
            .filter(|k| members.contains(*k))
            .cloned()
            .collect();

        let change = match &parent.change {
            EditChange::Row { ck, row, updated } => {
                let keep = match row {
                    Some(row) if parent.after.contains(ck) && view.allows(&ck.collection) => {
                        predicate.accepts(row)?
                    }
                    _ => false,
                };
                if keep {
                    if members.insert(ck.clone()) {
                        self.db.set_group_of(&view.name, ck, group)?;
                    }
                } else if members.remove(ck) {
                    self.db.clear_group_of(&view.name, ck)?;
                }
                EditChange::Row {
                    ck: ck.clone(),
                    row: row.clone(),
                    updated: *updated,
                }
            }
            EditChange::Reset => {
                let mut next = HashSet::new();
                for ck in &parent.after {
                    if !view.allows(&ck.collection) {
                        continue;
                    }
                    let row = self.require_row(view, ck)?;
                    if predicate.accepts(&row)? {
                        next.insert(ck.clone());
                    }
                }
                for stale in members.difference(&next) {
                    self.db.clear_group_of(&view.name, stale)?;
                }
                for fresh in next.difference(&members) {
                    self.db.set_group_of(&view.name, fresh, group)?;
                }
                members = next;
                EditChange::Reset
            }
        };

        let after = parent
            .after
            .iter()
            .filter(|k| members.contains(*k))
            .cloned()
            .collect();
        self.apply_edit(
            view,
            GroupEdit {
                group: group.clone(),
                before,
                after,
                change,
            },
        )
    }

    fn push(&self, view: &RegisteredView, kind: ChangeKind, key: &CollectionKey, group: &str, index: usize) {
        self.journal.borrow_mut().push(ChangeRecord {
            view: view.name.clone(),
            kind,
            key: key.clone(),
            group: group.to_string(),
            index,
        });
    }

    /// Journal the move of a single key. Returns how many records were written.
    fn journal_single(
        &self,
        view: &RegisteredView,
        group: &str,
        ck: &CollectionKey,
        from: Option<usize>,
        to: Option<usize>,
        updated: bool,
    ) -> usize {
        match (from, to) {
            (Some(i), Some(j)) if i == j => {
                if updated {
                    self.push(view, ChangeKind::Update, ck, group, i);
                    1
                } else {
                    0
                }
            }
            (Some(i), Some(j)) => {
                self.push(view, ChangeKind::Delete, ck, group, i);
                self.push(view, ChangeKind::Insert, ck, group, j);
                2
            }
            (Some(i), None) => {
                self.push(view, ChangeKind::Delete, ck, group, i);
                1
            }
            (None, Some(j)) => {
                self.push(view, ChangeKind::Insert, ck, group, j);
                1
            }
            (None, None) => 0,
        }
    }

    /// Journal an arbitrary transformation of a group's list. When the keys
    /// present in both lists keep their relative order only the difference is
    /// recorded, otherwise the group is replayed from scratch.
    fn journal_lists(
        &self,
        view: &RegisteredView,
        group: &str,
        before: &[CollectionKey],
        after: &[CollectionKey],
    ) -> usize {
        let before_set: HashSet<&CollectionKey> = before.iter().collect();
        let after_set: HashSet<&CollectionKey> = after.iter().collect();
        let kept_before: Vec<&CollectionKey> =
            before.iter().filter(|k| after_set.contains(k)).collect();
        let kept_after: Vec<&CollectionKey> =
            after.iter().filter(|k| before_set.contains(k)).collect();
        let incremental = kept_before == kept_after;

        let mut emitted = 0;
        for (index, key) in before.iter().enumerate().rev() {
            if !incremental || !after_set.contains(key) {
                self.push(view, ChangeKind::Delete, key, group, index);
                emitted += 1;
            }
        }
        for (index, key) in after.iter().enumerate() {
            if !incremental || !before_set.contains(key) {
                self.push(view, ChangeKind::Insert, key, group, index);
                emitted += 1;
            }
        }
        emitted
    }

    // ── Rebuilds ─────────────────────────────────────────────────────

    /// Re-derive a view from scratch, journaling the difference.
    pub fn rebuild(&self, view: &RegisteredView) -> Result<()> {
        info!("rebuilding {} view '{}'", view.kind, view.name);
        match &view.logic {
            ViewLogic::Computed(logic) => self.rebuild_computed(view, logic.as_ref()),
            ViewLogic::Manual => self.clear_manual(view),
            ViewLogic::Filtered(_) => self.refilter(view),
        }
    }

    fn stored_groups(&self, view: &RegisteredView) -> Result<BTreeMap<String, Vec<CollectionKey>>> {
        let mut groups = BTreeMap::new();
        for group in self.db.group_names(&view.name)? {
            let members = self.db.load_group(&view.name, &group)?;
            groups.insert(group, members);
        }
        Ok(groups)
    }

    fn reset_groups(
        &self,
        view: &RegisteredView,
        old: &BTreeMap<String, Vec<CollectionKey>>,
        new: &BTreeMap<String, Vec<CollectionKey>>,
    ) -> Result<()> {
        let groups: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
        for group in groups {
            self.apply_edit(
                view,
                GroupEdit {
                    group: group.clone(),
                    before: old.get(group).cloned().unwrap_or_default(),
                    after: new.get(group).cloned().unwrap_or_default(),
                    change: EditChange::Reset,
                },
            )?;
        }
        Ok(())
    }

    fn rebuild_computed(&self, view: &RegisteredView, logic: &dyn Derivation) -> Result<()> {
        let old = self.stored_groups(view)?;
        self.db.clear_view(&view.name)?;

        let collections: Vec<String> = if view.allowed.is_empty() {
            self.db.collection_names()?
        } else {
            view.allowed.iter().cloned().collect()
        };

        let mut grouped: BTreeMap<String, Vec<Arc<RawRow>>> = BTreeMap::new();
        for collection in collections {
            for key in self.db.keys(&collection)? {
                let ck = CollectionKey::new(collection.clone(), key);
                let Some(row) = self.load_row(&ck)? else {
                    continue;
                };
                if let Some(group) = logic.group(&row)? {
                    grouped.entry(group).or_default().push(row);
                }
            }
        }

        let mut new = BTreeMap::new();
        for (group, mut rows) in grouped {
            // decode every row up front so the comparisons below cannot fail
            for row in &rows {
                logic.compare(&group, row, row)?;
            }
            let mut failure = None;
            rows.sort_by(|a, b| match logic.compare(&group, a, b) {
                Ok(ordering) => ordering.then_with(|| a.ck.cmp(&b.ck)),
                Err(e) => {
                    failure.get_or_insert(e);
                    a.ck.cmp(&b.ck)
                }
            });
            if let Some(e) = failure {
                return Err(e);
            }
            let members: Vec<CollectionKey> = rows.iter().map(|row| row.ck.clone()).collect();
            self.db.save_group(&view.name, &group, &members)?;
            for ck in &members {
                self.db.set_group_of(&view.name, ck, &group)?;
            }
            new.insert(group, members);
        }

        self.reset_groups(view, &old, &new)
    }

    fn clear_manual(&self, view: &RegisteredView) -> Result<()> {
        let old = self.stored_groups(view)?;
        self.db.clear_view(&view.name)?;
        self.reset_groups(view, &old, &BTreeMap::new())
    }

    /// Drop manual members whose records were deleted while the view was not
    /// being maintained. Order and placement of the rest are kept.
    pub fn prune_manual(&self, view: &RegisteredView) -> Result<()> {
        let old = self.stored_groups(view)?;
        let mut new = BTreeMap::new();
        for (group, members) in &old {
            let mut kept = Vec::with_capacity(members.len());
            for ck in members {
                if self.db.has_record(&ck.collection, &ck.key)? {
                    kept.push(ck.clone());
                } else {
                    self.db.clear_group_of(&view.name, ck)?;
                }
            }
            if kept.len() != members.len() {
                info!(
                    "manual view '{}': dropped {} deleted member(s) from '{group}'",
                    view.name,
                    members.len() - kept.len()
                );
                self.db.save_group(&view.name, group, &kept)?;
            }
            if !kept.is_empty() {
                new.insert(group.clone(), kept);
            }
        }
        self.reset_groups(view, &old, &new)
    }

    /// Re-evaluate the filter for every row of the parent.
    pub fn refilter(&self, view: &RegisteredView) -> Result<()> {
        let parent = view.parent.as_ref().ok_or_else(|| {
            ShelfError::Inconsistent(format!("filtered view '{}' has no parent", view.name))
        })?;
        let mut groups: BTreeSet<String> = self.db.key_group_sizes(&view.name)?.into_keys().collect();
        groups.extend(group_sizes(&self.db, parent)?.into_keys());
        for group in groups {
            let members = group_members(&self.db, parent, &group)?;
            self.filtered_edit(
                view,
                &GroupEdit {
                    group,
                    before: members.clone(),
                    after: members,
                    change: EditChange::Reset,
                },
            )?;
        }
        Ok(())
    }

    /// Forget the stored state of persisted views derived from `name` that are
    /// not registered right now, so they rebuild when they are.
    pub fn discard_dependents(&self, name: &str) -> Result<()> {
        for dependent in self.db.dependents(name)? {
            if self.views.iter().any(|v| v.name == dependent) {
                continue;
            }
            self.discard_dependents(&dependent)?;
            info!("discarding stored state of '{dependent}' (parent '{name}' was rebuilt)");
            self.db.drop_extension(&dependent)?;
        }
        Ok(())
    }

    // ── Manual edits ─────────────────────────────────────────────────

    /// Place `ck` in `group`, at `index` or at the end. A key already in the
    /// view is moved. Returns false when the record does not exist.
    pub fn manual_place(
        &self,
        view: &RegisteredView,
        ck: &CollectionKey,
        group: &str,
        index: Option<usize>,
    ) -> Result<bool> {
        if !view.allows(&ck.collection) {
            return Err(ShelfError::contract(format!(
                "manual view '{}' does not accept records of '{}'",
                view.name, ck.collection
            )));
        }
        let before = self.db.load_group(&view.name, group)?;
        let mut after = without(&before, ck);
        let index = match index {
            Some(index) if index > after.len() => {
                return Err(ShelfError::contract(format!(
                    "index {index} is out of range for group '{group}' of '{}' (size {})",
                    view.name,
                    after.len()
                )))
            }
            Some(index) => index,
            None => after.len(),
        };
        let Some(row) = self.load_row(ck)? else {
            warn!("manual view '{}': ignoring {ck}, no such record", view.name);
            return Ok(false);
        };

        let current = self.db.group_of(&view.name, ck)?;

        if let Some(old) = current.filter(|g| g != group) {
            self.manual_take(view, ck, &old, Some(row.clone()))?;
        }

        after.insert(index, ck.clone());
        self.db.save_group(&view.name, group, &after)?;
        self.db.set_group_of(&view.name, ck, group)?;
        self.apply_edit(
            view,
            GroupEdit {
                group: group.to_string(),
                before,
                after,
                change: EditChange::Row {
                    ck: ck.clone(),
                    row: Some(row),
                    updated: false,
                },
            },
        )?;
        Ok(true)
    }

    fn manual_take(
        &self,
        view: &RegisteredView,
        ck: &CollectionKey,
        group: &str,
        row: Option<Arc<RawRow>>,
    ) -> Result<()> {
        let before = self.db.load_group(&view.name, group)?;
        let after = without(&before, ck);
        self.db.save_group(&view.name, group, &after)?;
        self.db.clear_group_of(&view.name, ck)?;
        self.apply_edit(
            view,
            GroupEdit {
                group: group.to_string(),
                before,
                after,
                change: EditChange::Row {
                    ck: ck.clone(),
                    row,
                    updated: false,
                },
            },
        )
    }

    pub fn manual_remove(&self, view: &RegisteredView, ck: &CollectionKey, group: &str) -> Result<bool> {
        if self.db.group_of(&view.name, ck)?.as_deref() != Some(group) {
            info!("manual view '{}': {ck} is not in group '{group}'", view.name);
            return Ok(false);
        }
        let row = self.load_row(ck)?;
        self.manual_take(view, ck, group, row)?;
        Ok(true)
    }

    pub fn manual_remove_at(
        &self,
        view: &RegisteredView,
        index: usize,
        group: &str,
    ) -> Result<CollectionKey> {
        let members = self.db.load_group(&view.name, group)?;
        let Some(ck) = members.get(index).cloned() else {
            return Err(ShelfError::contract(format!(
                "index {index} is out of range for group '{group}' of '{}' (size {})",
                view.name,
                members.len()
            )));
        };
        let row = self.load_row(&ck)?;
        self.manual_take(view, &ck, group, row)?;
        Ok(ck)
    }

    pub fn manual_clear_group(&self, view: &RegisteredView, group: &str) -> Result<usize> {
        let before = self.db.load_group(&view.name, group)?;
        if before.is_empty() {
            return Ok(0);
        }
        for ck in &before {
            self.db.clear_group_of(&view.name, ck)?;
        }
        self.db.save_group(&view.name, group, &[])?;
        let removed = before.len();
        self.apply_edit(
            view,
            GroupEdit {
                group: group.to_string(),
                before,
                after: Vec::new(),
                change: EditChange::Reset,
            },
        )?;
        Ok(removed)
    }
}

fn position(list: &[CollectionKey], ck: &CollectionKey) -> Option<usize> {
    list.iter().position(|k| k == ck)
}

fn without(list: &[CollectionKey], ck: &CollectionKey) -> Vec<CollectionKey> {
    list.iter().filter(|k| *k != ck).cloned().collect()
}

/// Ordered members of one group of any view kind.
pub(crate) fn group_members(
    db: &SystemDb<'_>,
    view: &RegisteredView,
    group: &str,
) -> Result<Vec<CollectionKey>> {
    match &view.logic {
        ViewLogic::Filtered(_) => {
            let parent = view.parent.as_ref().ok_or_else(|| {
                ShelfError::Inconsistent(format!("filtered view '{}' has no parent", view.name))
            })?;
            let keys = db.keys_in_group(&view.name, group)?;
            if keys.is_empty() {
                return Ok(Vec::new());
            }
            let members = group_members(db, parent, group)?;
            Ok(members.into_iter().filter(|k| keys.contains(k)).collect())
        }
        ViewLogic::Computed(_) | ViewLogic::Manual => db.load_group(&view.name, group),
    }
}

/// Row count of every non-empty group of any view kind.
pub(crate) fn group_sizes(db: &SystemDb<'_>, view: &RegisteredView) -> Result<BTreeMap<String, usize>> {
    match &view.logic {
        ViewLogic::Filtered(_) => db.key_group_sizes(&view.name),
        ViewLogic::Computed(_) | ViewLogic::Manual => db.group_sizes(&view.name),
    }
}
