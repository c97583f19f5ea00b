use crate::codec::CollectionCodec;
use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Address of a record: its collection plus its key within that collection.
///
/// Ordering is by collection, then key. Views use it to break ties between
/// rows that sort equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CollectionKey {
    pub collection: String,
    pub key: String,
}

impl CollectionKey {
    pub fn new(collection: impl Into<String>, key: impl Into<String>) -> Self {
        CollectionKey {
            collection: collection.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.key)
    }
}

/// A record exactly as stored: encoded object and optional encoded metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub object: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
}

type Decoded = Arc<dyn Any + Send + Sync>;

/// A stored record paired with the codecs of its collection, decoded lazily.
///
/// Decoded values are cached so that sorting a group decodes each member once.
/// A row whose collection holds a different item type than the one asked for
/// reads as `None`; it is invisible to views typed over another item.
pub(crate) struct RawRow {
    pub ck: CollectionKey,
    pub record: StoredRecord,
    pub codec: Option<Arc<CollectionCodec>>,
    object: OnceLock<Decoded>,
    metadata: OnceLock<Decoded>,
}

impl RawRow {
    pub fn new(ck: CollectionKey, record: StoredRecord, codec: Option<Arc<CollectionCodec>>) -> Self {
        RawRow {
            ck,
            record,
            codec,
            object: OnceLock::new(),
            metadata: OnceLock::new(),
        }
    }

    pub fn object<OT>(&self) -> Result<Option<Arc<OT>>>
    where
        OT: DeserializeOwned + Send + Sync + 'static,
    {
        let Some(codec) = &self.codec else {
            return Ok(None);
        };
        if !codec.holds::<OT>() {
            return Ok(None);
        }
        if let Some(cached) = self.object.get() {
            return Ok(cached.clone().downcast::<OT>().ok());
        }
        let value: Decoded = Arc::new(codec.object.decode::<OT>(&self.record.object)?);
        let _ = self.object.set(value.clone());
        Ok(value.downcast::<OT>().ok())
    }

    pub fn metadata<MT>(&self) -> Result<Option<Arc<MT>>>
    where
        MT: DeserializeOwned + Send + Sync + 'static,
    {
        let (Some(codec), Some(bytes)) = (&self.codec, &self.record.metadata) else {
            return Ok(None);
        };
        if !codec.holds_metadata::<MT>() {
            return Ok(None);
        }
        if let Some(cached) = self.metadata.get() {
            return Ok(cached.clone().downcast::<MT>().ok());
        }
        let value: Decoded = Arc::new(codec.metadata.decode::<MT>(bytes)?);
        let _ = self.metadata.set(value.clone());
        Ok(value.downcast::<MT>().ok())
    }
}
