//! Payload codecs and the per-collection serializer registry.
//!
//! Objects and metadata are stored as JSON bytes, optionally LZ4-compressed.
//! Each collection registers one codec pair when it is bound to a store; the
//! store looks the pair up by collection name whenever it has to turn stored
//! bytes back into rows for view maintenance.

use crate::error::{Result, ShelfError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Compression applied to encoded payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Lz4,
}

/// Encodes values to bytes and back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Codec {
    compression: Compression,
}

impl Codec {
    pub fn new(compression: Compression) -> Self {
        Codec { compression }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(value).map_err(|e| ShelfError::Encode(e.to_string()))?;
        Ok(match self.compression {
            Compression::None => bytes,
            Compression::Lz4 => lz4_flex::compress_prepend_size(&bytes),
        })
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self.compression {
            Compression::None => {
                serde_json::from_slice(bytes).map_err(|e| ShelfError::Decode(e.to_string()))
            }
            Compression::Lz4 => {
                let raw = lz4_flex::decompress_size_prepended(bytes)
                    .map_err(|e| ShelfError::Decode(format!("lz4: {e}")))?;
                serde_json::from_slice(&raw).map_err(|e| ShelfError::Decode(e.to_string()))
            }
        }
    }
}

/// The codec pair registered for one collection, plus the Rust types it was
/// registered with. Types are matched by `TypeId`; the names are kept for
/// error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionCodec {
    pub object_type: &'static str,
    pub meta_type: &'static str,
    object_id: TypeId,
    meta_id: TypeId,
    pub object: Codec,
    pub metadata: Codec,
}

impl CollectionCodec {
    pub fn for_types<OT: 'static, MT: 'static>(object: Compression, metadata: Compression) -> Self {
        CollectionCodec {
            object_type: std::any::type_name::<OT>(),
            meta_type: std::any::type_name::<MT>(),
            object_id: TypeId::of::<OT>(),
            meta_id: TypeId::of::<MT>(),
            object: Codec::new(object),
            metadata: Codec::new(metadata),
        }
    }

    /// Whether rows of this collection decode as `OT`.
    pub fn holds<OT: 'static>(&self) -> bool {
        self.object_id == TypeId::of::<OT>()
    }

    pub fn holds_metadata<MT: 'static>(&self) -> bool {
        self.meta_id == TypeId::of::<MT>()
    }
}

/// Collection name -> codec pair. Registration is idempotent per name.
#[derive(Default)]
pub(crate) struct SerializerRegistry {
    entries: RwLock<HashMap<String, Arc<CollectionCodec>>>,
}

impl SerializerRegistry {
    pub fn register(&self, collection: &str, codec: CollectionCodec) -> Result<Arc<CollectionCodec>> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| ShelfError::LockPoisoned("serializer registry"))?;

        if let Some(existing) = entries.get(collection) {
            if **existing == codec {
                return Ok(existing.clone());
            }
            return Err(ShelfError::registration(
                collection,
                format!(
                    "collection already registered as {} / {} with {:?} / {:?} compression",
                    existing.object_type,
                    existing.meta_type,
                    existing.object.compression(),
                    existing.metadata.compression()
                ),
            ));
        }

        let codec = Arc::new(codec);
        entries.insert(collection.to_string(), codec.clone());
        Ok(codec)
    }

    pub fn lookup(&self, collection: &str) -> Option<Arc<CollectionCodec>> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(collection).cloned())
    }

    /// Like `lookup`, but a miss is a contract violation.
    pub fn require(&self, collection: &str) -> Result<Arc<CollectionCodec>> {
        self.lookup(collection).ok_or_else(|| {
            ShelfError::contract(format!(
                "collection '{collection}' has no registered serializers"
            ))
        })
    }
}
