pub mod changes;
pub mod codec;
pub mod collection;
pub mod config;
pub mod error;
pub mod mapping;
pub mod store;
mod system_db;
pub mod view;

pub use changes::{changes, ChangeKind, ChangeRecord, CommitNotification, ViewChanges};
pub use codec::{Codec, Compression};
pub use collection::{new_unique_sortable_id, Collection, CollectionBuilder, MultiCollection};
pub use config::{StoreConfig, SynchronousMode};
pub use error::{Result, ShelfError};
pub use mapping::ViewMapping;
pub use store::{Access, CollectionKey, Connection, ReadTransaction, ReadWriteTransaction, Store, StoredRecord};
pub use system_db::ExtensionRecord;
pub use view::{
    FilteredView, Filtering, Grouping, ManualView, ManualViewTransaction, Row, Sorting, View,
    ViewKind, ViewOptions, ViewTransaction,
};
