//! Commit notifications and their projection onto a view mapping.
//!
//! Maintenance journals one [`ChangeRecord`] per elementary list edit, in the
//! order the edits happened. [`changes`] replays those records against the
//! row counts of an old [`ViewMapping`] and produces batch section/row deltas
//! plus the advanced mapping, without touching the store.

use crate::error::{Result, ShelfError};
use crate::mapping::ViewMapping;
use crate::store::CollectionKey;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Delete,
    Update,
}

/// One elementary edit of a view group. `index` refers to the group as left
/// by the previous record of the same commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRecord {
    pub view: String,
    pub kind: ChangeKind,
    pub key: CollectionKey,
    pub group: String,
    pub index: usize,
}

/// Published after every committed read-write transaction that changed
/// records or view state.
#[derive(Debug, Clone, Serialize)]
pub struct CommitNotification {
    pub snapshot: u64,
    pub consumer: String,
    pub changes: Vec<ChangeRecord>,
    pub collections: BTreeSet<String>,
}

impl CommitNotification {
    pub fn touches_view(&self, view: &str) -> bool {
        self.changes.iter().any(|c| c.view == view)
    }

    pub fn touches_collection(&self, collection: &str) -> bool {
        self.collections.contains(collection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct IndexPath {
    pub section: usize,
    pub row: usize,
}

impl IndexPath {
    pub fn new(section: usize, row: usize) -> Self {
        IndexPath { section, row }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionChangeKind {
    Insert,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionChange {
    pub kind: SectionChangeKind,
    /// Old index for deletes, new index for inserts.
    pub index: usize,
    pub group: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowChangeKind {
    Insert,
    Delete,
    Update,
    Move,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowChange {
    pub kind: RowChangeKind,
    pub key: CollectionKey,
    /// Old coordinates (delete, move, update).
    pub from: Option<IndexPath>,
    /// New coordinates (insert, move, update).
    pub to: Option<IndexPath>,
}

/// Section and row deltas between an old mapping and `mapping`.
///
/// Deltas have batch semantics, see [`ViewChanges::apply`].
#[derive(Debug, Clone)]
pub struct ViewChanges {
    pub sections: Vec<SectionChange>,
    pub rows: Vec<RowChange>,
    pub mapping: ViewMapping,
}

impl ViewChanges {
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty() && self.rows.is_empty()
    }

    /// Apply the deltas to a list mirroring the old mapping, one inner vec per
    /// section. Steps, in order: remove deleted and moved-out rows (old
    /// coordinates), remove deleted sections, insert new empty sections,
    /// insert new and moved-in rows (new coordinates, ascending), then replace
    /// updated rows. `fetch` produces the value for a key in the new state.
    pub fn apply<T>(
        &self,
        sections: &mut Vec<Vec<T>>,
        mut fetch: impl FnMut(&CollectionKey) -> T,
    ) -> Result<()> {
        let mut removals: Vec<IndexPath> = self
            .rows
            .iter()
            .filter(|c| matches!(c.kind, RowChangeKind::Delete | RowChangeKind::Move))
            .filter_map(|c| c.from)
            .collect();
        removals.sort_unstable_by(|a, b| b.cmp(a));
        for path in removals {
            let section = section_mut(sections, path.section)?;
            if path.row >= section.len() {
                return Err(out_of_range(path));
            }
            section.remove(path.row);
        }

        let mut dropped: Vec<usize> = self
            .sections
            .iter()
            .filter(|c| c.kind == SectionChangeKind::Delete)
            .map(|c| c.index)
            .collect();
        dropped.sort_unstable_by(|a, b| b.cmp(a));
        for index in dropped {
            if index >= sections.len() {
                return Err(ShelfError::Inconsistent(format!("no section {index} to delete")));
            }
            sections.remove(index);
        }

        let mut added: Vec<usize> = self
            .sections
            .iter()
            .filter(|c| c.kind == SectionChangeKind::Insert)
            .map(|c| c.index)
            .collect();
        added.sort_unstable();
        for index in added {
            if index > sections.len() {
                return Err(ShelfError::Inconsistent(format!("cannot insert section {index}")));
            }
            sections.insert(index, Vec::new());
        }

        let mut arrivals: Vec<(IndexPath, &CollectionKey)> = self
            .rows
            .iter()
            .filter(|c| matches!(c.kind, RowChangeKind::Insert | RowChangeKind::Move))
            .filter_map(|c| c.to.map(|to| (to, &c.key)))
            .collect();
        arrivals.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        for (path, key) in arrivals {
            let section = section_mut(sections, path.section)?;
            if path.row > section.len() {
                return Err(out_of_range(path));
            }
            section.insert(path.row, fetch(key));
        }

        for change in self.rows.iter().filter(|c| c.kind == RowChangeKind::Update) {
            let Some(path) = change.to else { continue };
            let section = section_mut(sections, path.section)?;
            let slot = section.get_mut(path.row).ok_or_else(|| out_of_range(path))?;
            *slot = fetch(&change.key);
        }
        Ok(())
    }
}

fn section_mut<T>(sections: &mut [Vec<T>], index: usize) -> Result<&mut Vec<T>> {
    sections
        .get_mut(index)
        .ok_or_else(|| ShelfError::Inconsistent(format!("no section {index}")))
}

fn out_of_range(path: IndexPath) -> ShelfError {
    ShelfError::Inconsistent(format!(
        "row {} of section {} is out of range",
        path.row, path.section
    ))
}

/// A row position while replaying change records.
enum Slot {
    /// Row present in the old mapping at `index`; `updated` holds its key once
    /// an update was recorded for it.
    Original {
        index: usize,
        updated: Option<CollectionKey>,
    },
    Inserted(CollectionKey),
}

/// Project the commit notifications newer than `mapping` onto it.
///
/// Notifications must be complete from the mapping's snapshot onward: take the
/// mapping after subscribing, then pass everything received since. Records of
/// other views are ignored.
pub fn changes(notifications: &[Arc<CommitNotification>], mapping: &ViewMapping) -> Result<ViewChanges> {
    let Some(since) = mapping.snapshot() else {
        return Err(ShelfError::contract(format!(
            "mapping of view '{}' was never updated from a transaction",
            mapping.view()
        )));
    };

    let mut pending: Vec<&Arc<CommitNotification>> =
        notifications.iter().filter(|n| n.snapshot > since).collect();
    pending.sort_by_key(|n| n.snapshot);
    let latest = pending.last().map_or(since, |n| n.snapshot);

    let mut slots: HashMap<String, Vec<Slot>> = HashMap::new();
    let mut removed: Vec<(CollectionKey, String, usize)> = Vec::new();
    for note in pending {
        for change in note.changes.iter().filter(|c| c.view == mapping.view()) {
            let group = slots.entry(change.group.clone()).or_insert_with(|| {
                (0..mapping.count_of_group(&change.group))
                    .map(|index| Slot::Original {
                        index,
                        updated: None,
                    })
                    .collect()
            });
            match change.kind {
                ChangeKind::Insert => {
                    if change.index > group.len() {
                        return Err(replay_error(change, group.len()));
                    }
                    group.insert(change.index, Slot::Inserted(change.key.clone()));
                }
                ChangeKind::Delete => {
                    if change.index >= group.len() {
                        return Err(replay_error(change, group.len()));
                    }
                    if let Slot::Original { index, .. } = group.remove(change.index) {
                        removed.push((change.key.clone(), change.group.clone(), index));
                    }
                }
                ChangeKind::Update => {
                    let size = group.len();
                    match group.get_mut(change.index) {
                        Some(Slot::Original { updated, .. }) => *updated = Some(change.key.clone()),
                        Some(Slot::Inserted(_)) => {}
                        None => return Err(replay_error(change, size)),
                    }
                }
            }
        }
    }

    let mut counts = mapping.counts().clone();
    for (group, list) in &slots {
        if list.is_empty() {
            counts.remove(group);
        } else {
            counts.insert(group.clone(), list.len());
        }
    }
    let next = mapping.advanced(counts, latest);

    let mut sections = Vec::new();
    for (index, group) in mapping.visible_groups().iter().enumerate().rev() {
        if next.section_for_group(group).is_none() {
            sections.push(SectionChange {
                kind: SectionChangeKind::Delete,
                index,
                group: group.clone(),
            });
        }
    }
    for (index, group) in next.visible_groups().iter().enumerate() {
        if mapping.section_for_group(group).is_none() {
            sections.push(SectionChange {
                kind: SectionChangeKind::Insert,
                index,
                group: group.clone(),
            });
        }
    }

    let mut arrivals: HashMap<CollectionKey, IndexPath> = HashMap::new();
    let mut updates = Vec::new();
    for (group, list) in &slots {
        let Some(section) = next.section_for_group(group) else {
            continue;
        };
        let old_section = mapping.section_for_group(group);
        for (row, slot) in list.iter().enumerate() {
            let to = IndexPath::new(section, row);
            match slot {
                Slot::Inserted(key) => {
                    arrivals.insert(key.clone(), to);
                }
                Slot::Original {
                    index,
                    updated: Some(key),
                } => {
                    if let Some(old_section) = old_section {
                        updates.push(RowChange {
                            kind: RowChangeKind::Update,
                            key: key.clone(),
                            from: Some(IndexPath::new(old_section, *index)),
                            to: Some(to),
                        });
                    }
                }
                Slot::Original { updated: None, .. } => {}
            }
        }
    }

    let mut deletes = Vec::new();
    let mut moves = Vec::new();
    for (key, group, index) in removed {
        // rows of a deleted section go with the section
        let (Some(old_section), Some(_)) = (
            mapping.section_for_group(&group),
            next.section_for_group(&group),
        ) else {
            continue;
        };
        let from = IndexPath::new(old_section, index);
        match arrivals.remove(&key) {
            Some(to) => moves.push(RowChange {
                kind: RowChangeKind::Move,
                key,
                from: Some(from),
                to: Some(to),
            }),
            None => deletes.push(RowChange {
                kind: RowChangeKind::Delete,
                key,
                from: Some(from),
                to: None,
            }),
        }
    }
    let mut inserts: Vec<RowChange> = arrivals
        .into_iter()
        .map(|(key, to)| RowChange {
            kind: RowChangeKind::Insert,
            key,
            from: None,
            to: Some(to),
        })
        .collect();

    deletes.sort_by(|a, b| b.from.cmp(&a.from));
    moves.sort_by(|a, b| a.to.cmp(&b.to));
    inserts.sort_by(|a, b| a.to.cmp(&b.to));
    updates.sort_by(|a, b| a.to.cmp(&b.to));

    let mut rows = deletes;
    rows.extend(moves);
    rows.extend(inserts);
    rows.extend(updates);

    Ok(ViewChanges {
        sections,
        rows,
        mapping: next,
    })
}

fn replay_error(change: &ChangeRecord, size: usize) -> ShelfError {
    ShelfError::Inconsistent(format!(
        "{:?} of {} at {} in group '{}' of '{}' (size {size}); notifications are missing or the mapping is stale",
        change.kind, change.key, change.index, change.group, change.view
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn ck(key: &str) -> CollectionKey {
        CollectionKey::new("items", key)
    }

    fn record(kind: ChangeKind, key: &str, group: &str, index: usize) -> ChangeRecord {
        ChangeRecord {
            view: "v".into(),
            kind,
            key: ck(key),
            group: group.into(),
            index,
        }
    }

    fn note(snapshot: u64, changes: Vec<ChangeRecord>) -> Arc<CommitNotification> {
        Arc::new(CommitNotification {
            snapshot,
            consumer: String::new(),
            changes,
            collections: BTreeSet::new(),
        })
    }

    /// Old state as lists of keys per group, realized into a mapping at snapshot 1.
    fn mapping_of(groups: &[(&str, &[&str])]) -> ViewMapping {
        let counts: BTreeMap<String, usize> = groups
            .iter()
            .map(|(g, keys)| (g.to_string(), keys.len()))
            .collect();
        ViewMapping::new("v").advanced(counts, 1)
    }

    fn lists(groups: &[(&str, &[&str])]) -> Vec<Vec<String>> {
        groups
            .iter()
            .filter(|(_, keys)| !keys.is_empty())
            .map(|(_, keys)| keys.iter().map(|k| k.to_string()).collect())
            .collect()
    }

    fn project(old: &[(&str, &[&str])], notes: &[Arc<CommitNotification>]) -> (ViewChanges, Vec<Vec<String>>) {
        let mapping = mapping_of(old);
        let delta = changes(notes, &mapping).unwrap();
        let mut list = lists(old);
        delta.apply(&mut list, |key| key.key.clone()).unwrap();
        (delta, list)
    }

    #[test]
    fn test_insert_into_existing_section() {
        let (delta, list) = project(
            &[("A", &["a1", "a3"])],
            &[note(2, vec![record(ChangeKind::Insert, "a2", "A", 1)])],
        );
        assert_eq!(list, vec![vec!["a1", "a2", "a3"]]);
        assert_eq!(delta.rows.len(), 1);
        assert_eq!(delta.rows[0].kind, RowChangeKind::Insert);
        assert_eq!(delta.rows[0].to, Some(IndexPath::new(0, 1)));
        assert_eq!(delta.mapping.snapshot(), Some(2));
    }

    #[test]
    fn test_reposition_becomes_move() {
        let (delta, list) = project(
            &[("A", &["a", "b", "c"])],
            &[note(
                2,
                vec![
                    record(ChangeKind::Delete, "a", "A", 0),
                    record(ChangeKind::Insert, "a", "A", 2),
                ],
            )],
        );
        assert_eq!(list, vec![vec!["b", "c", "a"]]);
        assert_eq!(delta.rows.len(), 1);
        assert_eq!(delta.rows[0].kind, RowChangeKind::Move);
        assert_eq!(delta.rows[0].from, Some(IndexPath::new(0, 0)));
        assert_eq!(delta.rows[0].to, Some(IndexPath::new(0, 2)));
    }

    #[test]
    fn test_new_and_emptied_sections() {
        let (delta, list) = project(
            &[("A", &["a"]), ("C", &["c"])],
            &[
                note(2, vec![record(ChangeKind::Insert, "b", "B", 0)]),
                note(3, vec![record(ChangeKind::Delete, "a", "A", 0)]),
            ],
        );
        assert_eq!(list, vec![vec!["b"], vec!["c"]]);
        assert_eq!(
            delta.sections,
            vec![
                SectionChange {
                    kind: SectionChangeKind::Delete,
                    index: 0,
                    group: "A".into()
                },
                SectionChange {
                    kind: SectionChangeKind::Insert,
                    index: 0,
                    group: "B".into()
                },
            ]
        );
        // the row of the deleted section is not reported on its own
        assert!(delta.rows.iter().all(|r| r.kind == RowChangeKind::Insert));
    }

    #[test]
    fn test_move_out_of_deleted_section_is_insert() {
        let (delta, list) = project(
            &[("A", &["a"]), ("B", &["b"])],
            &[note(
                2,
                vec![
                    record(ChangeKind::Delete, "a", "A", 0),
                    record(ChangeKind::Insert, "a", "B", 1),
                ],
            )],
        );
        assert_eq!(list, vec![vec!["b", "a"]]);
        assert_eq!(delta.rows.len(), 1);
        assert_eq!(delta.rows[0].kind, RowChangeKind::Insert);
        assert_eq!(delta.rows[0].to, Some(IndexPath::new(0, 1)));
    }

    #[test]
    fn test_update_reports_new_coordinates() {
        let (delta, list) = project(
            &[("A", &["a", "b"])],
            &[note(
                2,
                vec![
                    record(ChangeKind::Update, "b", "A", 1),
                    record(ChangeKind::Delete, "a", "A", 0),
                ],
            )],
        );
        assert_eq!(list, vec![vec!["b"]]);
        let update = delta
            .rows
            .iter()
            .find(|r| r.kind == RowChangeKind::Update)
            .unwrap();
        assert_eq!(update.from, Some(IndexPath::new(0, 1)));
        assert_eq!(update.to, Some(IndexPath::new(0, 0)));
    }

    #[test]
    fn test_hidden_groups_are_ignored() {
        let mapping = mapping_of(&[("A", &["a"]), ("_hidden", &["h"])])
            .with_group_filter(|g| !g.starts_with('_'));
        assert_eq!(mapping.number_of_sections(), 1);
        let delta = changes(
            &[note(2, vec![record(ChangeKind::Insert, "h2", "_hidden", 0)])],
            &mapping,
        )
        .unwrap();
        assert!(delta.is_empty());
        assert_eq!(delta.mapping.count_of_group("_hidden"), 2);
    }

    #[test]
    fn test_old_notifications_and_other_views_are_skipped() {
        let mapping = mapping_of(&[("A", &["a"])]);
        let mut foreign = record(ChangeKind::Insert, "x", "A", 0);
        foreign.view = "other".into();
        let delta = changes(
            &[
                note(1, vec![record(ChangeKind::Delete, "a", "A", 0)]),
                note(2, vec![foreign]),
            ],
            &mapping,
        )
        .unwrap();
        assert!(delta.is_empty());
        assert_eq!(delta.mapping.snapshot(), Some(2));
    }

    #[test]
    fn test_unrealized_mapping_is_rejected() {
        let result = changes(&[], &ViewMapping::new("v"));
        assert!(matches!(result, Err(ShelfError::ContractViolation(_))));
    }

    #[test]
    fn test_replay_past_end_is_inconsistent() {
        let mapping = mapping_of(&[("A", &["a"])]);
        let result = changes(&[note(2, vec![record(ChangeKind::Delete, "z", "A", 4)])], &mapping);
        assert!(matches!(result, Err(ShelfError::Inconsistent(_))));
    }
}
