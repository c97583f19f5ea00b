use crate::error::Result;
use crate::store::{CollectionKey, ReadTransaction};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

type GroupFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;
type GroupSort = Arc<dyn Fn(&str, &str) -> Ordering + Send + Sync>;

/// Which groups of a view are visible as sections, and in what order.
///
/// A mapping holds row counts only. It is realized from a transaction with
/// [`ViewMapping::update`] and advanced by [`crate::changes`]; rows are read
/// back through [`ViewMapping::key_at`].
#[derive(Clone)]
pub struct ViewMapping {
    view: String,
    group_filter: GroupFilter,
    group_sort: GroupSort,
    snapshot: Option<u64>,
    counts: BTreeMap<String, usize>,
    sections: Vec<String>,
}

impl fmt::Debug for ViewMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewMapping")
            .field("view", &self.view)
            .field("snapshot", &self.snapshot)
            .field("sections", &self.sections)
            .field("counts", &self.counts)
            .finish()
    }
}

impl ViewMapping {
    /// Mapping showing every group in lexical order.
    pub fn new(view: impl Into<String>) -> Self {
        ViewMapping {
            view: view.into(),
            group_filter: Arc::new(|_| true),
            group_sort: Arc::new(|a, b| a.cmp(b)),
            snapshot: None,
            counts: BTreeMap::new(),
            sections: Vec::new(),
        }
    }

    pub fn with_group_filter(mut self, filter: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.group_filter = Arc::new(filter);
        self.realize();
        self
    }

    pub fn with_group_sort(
        mut self,
        sort: impl Fn(&str, &str) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        self.group_sort = Arc::new(sort);
        self.realize();
        self
    }

    /// Re-read the group counts of the view as seen by `tx`.
    pub fn update(&mut self, tx: &ReadTransaction<'_>) -> Result<()> {
        let view = tx.extension(&self.view)?;
        self.counts = view.group_counts()?;
        self.snapshot = Some(tx.snapshot());
        self.realize();
        Ok(())
    }

    fn realize(&mut self) {
        let filter = &self.group_filter;
        let mut sections: Vec<String> = self
            .counts
            .iter()
            .filter(|(group, count)| **count > 0 && filter(group.as_str()))
            .map(|(group, _)| group.clone())
            .collect();
        let sort = &self.group_sort;
        sections.sort_by(|a, b| sort(a, b));
        self.sections = sections;
    }

    /// Same lens over new counts.
    pub(crate) fn advanced(&self, counts: BTreeMap<String, usize>, snapshot: u64) -> ViewMapping {
        let mut next = ViewMapping {
            view: self.view.clone(),
            group_filter: self.group_filter.clone(),
            group_sort: self.group_sort.clone(),
            snapshot: Some(snapshot),
            counts,
            sections: Vec::new(),
        };
        next.realize();
        next
    }

    pub(crate) fn counts(&self) -> &BTreeMap<String, usize> {
        &self.counts
    }

    pub fn view(&self) -> &str {
        &self.view
    }

    /// Commit snapshot the mapping reflects; `None` until first updated.
    pub fn snapshot(&self) -> Option<u64> {
        self.snapshot
    }

    pub fn is_realized(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn visible_groups(&self) -> &[String] {
        &self.sections
    }

    pub fn number_of_sections(&self) -> usize {
        self.sections.len()
    }

    pub fn number_of_items_in_section(&self, section: usize) -> usize {
        self.group_for_section(section)
            .map_or(0, |group| self.count_of_group(group))
    }

    /// Rows across all visible sections.
    pub fn number_of_items(&self) -> usize {
        self.sections.iter().map(|g| self.count_of_group(g)).sum()
    }

    /// Row count of a group, visible or not.
    pub fn count_of_group(&self, group: &str) -> usize {
        self.counts.get(group).copied().unwrap_or(0)
    }

    pub fn group_for_section(&self, section: usize) -> Option<&str> {
        self.sections.get(section).map(String::as_str)
    }

    pub fn section_for_group(&self, group: &str) -> Option<usize> {
        self.sections.iter().position(|g| g == group)
    }

    /// Key shown at `(section, row)`, read through `tx`.
    pub fn key_at(
        &self,
        section: usize,
        row: usize,
        tx: &ReadTransaction<'_>,
    ) -> Result<Option<CollectionKey>> {
        let Some(group) = self.group_for_section(section) else {
            return Ok(None);
        };
        tx.extension(&self.view)?.key_at(group, row)
    }
}
