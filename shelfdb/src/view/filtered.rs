use crate::error::Result;
use crate::store::{Access, Connection};
use crate::view::grouping::{FilterLogic, Predicate};
use crate::view::{Filtering, View};
use chrono::Utc;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::thread::JoinHandle;

/// A view showing the rows of its parent that pass a filter, in the parent's
/// order.
pub struct FilteredView<OT, MT = ()> {
    view: View<OT, MT>,
}

impl<OT, MT> Clone for FilteredView<OT, MT> {
    fn clone(&self) -> Self {
        FilteredView {
            view: self.view.clone(),
        }
    }
}

impl<OT, MT> fmt::Debug for FilteredView<OT, MT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FilteredView").field(&self.view).finish()
    }
}

impl<OT, MT> Deref for FilteredView<OT, MT> {
    type Target = View<OT, MT>;

    fn deref(&self) -> &View<OT, MT> {
        &self.view
    }
}

/// Timestamp tag with nanoseconds, never equal to `previous`.
fn next_version_tag(previous: &str) -> String {
    let now = Utc::now();
    let tag = format!("{}.{:09}", now.timestamp(), now.timestamp_subsec_nanos());
    if tag == previous {
        format!("{tag}.1")
    } else {
        tag
    }
}

fn same_predicate(a: &Arc<dyn Predicate>, b: &Arc<dyn Predicate>) -> bool {
    Arc::as_ptr(a) as *const u8 == Arc::as_ptr(b) as *const u8
}

impl<OT, MT> FilteredView<OT, MT>
where
    OT: Serialize + DeserializeOwned + Send + Sync + 'static,
    MT: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn new(view: View<OT, MT>) -> Self {
        FilteredView { view }
    }

    /// Replace the filter and re-evaluate every row of the parent in one
    /// read-write transaction on `via` (the default connection when `None`).
    /// Returns the new version tag. On failure the previous filter stays.
    pub fn update_filtering(&self, filtering: Filtering<OT, MT>, via: Option<&Connection>) -> Result<String> {
        let shared = self.view.shared()?;
        let registered = self.view.registered()?;
        let next: Arc<dyn Predicate> = Arc::new(FilterLogic::new(filtering));
        let connection = match via {
            Some(connection) => connection.clone(),
            None => shared.default_connection()?,
        };

        let mut restore = None;
        let outcome = Access::Connection(&connection).write(&shared, |tx| {
            let previous_tag = registered.version_tag()?;
            let tag = next_version_tag(&previous_tag);
            let previous = registered.replace_predicate(next.clone())?;
            restore = Some((previous, previous_tag));
            registered.set_version_tag(tag.clone())?;
            tx.refilter(&registered)?;
            Ok(tag)
        });

        match outcome {
            Ok(tag) => {
                debug!("filtered view '{}' now at version {tag}", registered.name);
                Ok(tag)
            }
            Err(e) => {
                if let Some((previous, previous_tag)) = restore {
                    if same_predicate(&registered.predicate()?, &next) {
                        registered.replace_predicate(previous)?;
                        registered.set_version_tag(previous_tag)?;
                    }
                }
                Err(e)
            }
        }
    }

    /// [`FilteredView::update_filtering`] on a spawned thread.
    pub fn update_filtering_async(
        &self,
        filtering: Filtering<OT, MT>,
        via: Option<Connection>,
        on_complete: impl FnOnce(Result<String>) + Send + 'static,
    ) -> JoinHandle<()> {
        let view = self.clone();
        std::thread::spawn(move || on_complete(view.update_filtering(filtering, via.as_ref())))
    }
}
