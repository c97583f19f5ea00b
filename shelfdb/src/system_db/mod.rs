use crate::config::StoreConfig;
use crate::error::Result;
use crate::store::{CollectionKey, StoredRecord};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Table layer over one SQLite connection (or an open transaction on it).
///
/// Holds records, registered extension bookkeeping, materialized view state
/// and the commit snapshot counter. Everything above this module talks in
/// collections, keys and groups; only this module writes SQL.
pub(crate) struct SystemDb<'a> {
    conn: &'a Connection,
}

/// Bookkeeping row for a registered extension (view).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionRecord {
    pub name: String,
    pub kind: String,
    pub version_tag: String,
    pub parent: Option<String>,
    pub persistent: bool,
    /// Last commit snapshot during which the view was maintained.
    pub maintained_through: u64,
}

impl<'a> SystemDb<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        SystemDb { conn }
    }

    /// Apply per-connection settings: WAL journaling, sync mode, cache, busy timeout.
    pub fn configure(conn: &Connection, config: &StoreConfig) -> Result<()> {
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", config.synchronous.pragma_value())?;
        conn.pragma_update(None, "cache_size", -config.cache_size_kib)?;
        Ok(())
    }

    pub fn initialize_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                key TEXT NOT NULL,
                object BLOB NOT NULL,
                metadata BLOB,
                PRIMARY KEY (collection, key)
            );

            CREATE TABLE IF NOT EXISTS extensions (
                name TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                version_tag TEXT NOT NULL,
                parent TEXT,
                persistent INTEGER NOT NULL,
                maintained_through INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS view_groups (
                view TEXT NOT NULL,
                grp TEXT NOT NULL,
                size INTEGER NOT NULL,
                members TEXT NOT NULL,
                PRIMARY KEY (view, grp)
            );

            CREATE TABLE IF NOT EXISTS view_keys (
                view TEXT NOT NULL,
                collection TEXT NOT NULL,
                key TEXT NOT NULL,
                grp TEXT NOT NULL,
                PRIMARY KEY (view, collection, key)
            );

            CREATE INDEX IF NOT EXISTS idx_view_keys_group ON view_keys(view, grp);

            CREATE TABLE IF NOT EXISTS store_state (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ── Records ──────────────────────────────────────────────────────

    pub fn get_record(&self, collection: &str, key: &str) -> Result<Option<StoredRecord>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT object, metadata FROM records WHERE collection = ?1 AND key = ?2")?;
        let result = stmt
            .query_row(params![collection, key], |row| {
                Ok(StoredRecord {
                    object: row.get(0)?,
                    metadata: row.get(1)?,
                })
            })
            .optional()?;
        Ok(result)
    }

    pub fn has_record(&self, collection: &str, key: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM records WHERE collection = ?1 AND key = ?2")?;
        Ok(stmt.exists(params![collection, key])?)
    }

    /// Insert or overwrite a record, object and metadata together.
    pub fn put_record(
        &self,
        collection: &str,
        key: &str,
        object: &[u8],
        metadata: Option<&[u8]>,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT OR REPLACE INTO records (collection, key, object, metadata) VALUES (?1, ?2, ?3, ?4)",
        )?;
        stmt.execute(params![collection, key, object, metadata])?;
        Ok(())
    }

    /// Replace only the metadata. Returns false when the record does not exist.
    pub fn put_metadata(&self, collection: &str, key: &str, metadata: Option<&[u8]>) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE records SET metadata = ?3 WHERE collection = ?1 AND key = ?2")?;
        Ok(stmt.execute(params![collection, key, metadata])? > 0)
    }

    pub fn delete_record(&self, collection: &str, key: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM records WHERE collection = ?1 AND key = ?2")?;
        Ok(stmt.execute(params![collection, key])? > 0)
    }

    pub fn count(&self, collection: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Keys of a collection in ascending order.
    pub fn keys(&self, collection: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT key FROM records WHERE collection = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![collection], |row| row.get(0))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    /// Names of every collection holding at least one record.
    pub fn collection_names(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT DISTINCT collection FROM records ORDER BY collection")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    // ── Store State ──────────────────────────────────────────────────

    /// Snapshot id of the last commit that changed anything.
    pub fn snapshot(&self) -> Result<u64> {
        let value: Option<i64> = self
            .conn
            .query_row(
                "SELECT value FROM store_state WHERE name = 'snapshot'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0) as u64)
    }

    pub fn set_snapshot(&self, snapshot: u64) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO store_state (name, value) VALUES ('snapshot', ?1)",
            params![snapshot as i64],
        )?;
        Ok(())
    }

    // ── Extensions ───────────────────────────────────────────────────

    pub fn get_extension(&self, name: &str) -> Result<Option<ExtensionRecord>> {
        let result = self
            .conn
            .query_row(
                "SELECT name, kind, version_tag, parent, persistent, maintained_through
                 FROM extensions WHERE name = ?1",
                params![name],
                extension_from_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn list_extensions(&self) -> Result<Vec<ExtensionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, kind, version_tag, parent, persistent, maintained_through
             FROM extensions ORDER BY name",
        )?;
        let rows = stmt.query_map([], extension_from_row)?;
        let mut extensions = Vec::new();
        for row in rows {
            extensions.push(row?);
        }
        Ok(extensions)
    }

    pub fn put_extension(&self, record: &ExtensionRecord) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO extensions
             (name, kind, version_tag, parent, persistent, maintained_through)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.name,
                record.kind,
                record.version_tag,
                record.parent,
                record.persistent,
                record.maintained_through as i64
            ],
        )?;
        Ok(())
    }

    pub fn set_version_tag(&self, name: &str, version_tag: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE extensions SET version_tag = ?2 WHERE name = ?1",
            params![name, version_tag],
        )?;
        Ok(())
    }

    pub fn set_maintained_through(&self, name: &str, snapshot: u64) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE extensions SET maintained_through = ?2 WHERE name = ?1")?;
        stmt.execute(params![name, snapshot as i64])?;
        Ok(())
    }

    /// Names of the extensions stored with `name` as their parent.
    pub fn dependents(&self, name: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM extensions WHERE parent = ?1 ORDER BY name")?;
        let rows = stmt.query_map(params![name], |row| row.get(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    /// Forget an extension entirely: bookkeeping row and materialized state.
    pub fn drop_extension(&self, name: &str) -> Result<()> {
        self.clear_view(name)?;
        self.conn
            .execute("DELETE FROM extensions WHERE name = ?1", params![name])?;
        Ok(())
    }

    /// Drop every extension that was registered as non-persistent.
    pub fn purge_non_persistent(&self) -> Result<Vec<String>> {
        let names: Vec<String> = self
            .list_extensions()?
            .into_iter()
            .filter(|ext| !ext.persistent)
            .map(|ext| ext.name)
            .collect();
        for name in &names {
            self.drop_extension(name)?;
        }
        Ok(names)
    }

    // ── View State ───────────────────────────────────────────────────

    pub fn clear_view(&self, view: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM view_groups WHERE view = ?1", params![view])?;
        self.conn
            .execute("DELETE FROM view_keys WHERE view = ?1", params![view])?;
        Ok(())
    }

    /// Non-empty stored groups of an ordered view, in lexical order.
    pub fn group_names(&self, view: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT grp FROM view_groups WHERE view = ?1 ORDER BY grp")?;
        let rows = stmt.query_map(params![view], |row| row.get(0))?;
        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    pub fn group_sizes(&self, view: &str) -> Result<BTreeMap<String, usize>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT grp, size FROM view_groups WHERE view = ?1")?;
        let rows = stmt.query_map(params![view], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        let mut sizes = BTreeMap::new();
        for row in rows {
            let (group, size) = row?;
            sizes.insert(group, size);
        }
        Ok(sizes)
    }

    /// Ordered members of one group of an ordered view.
    pub fn load_group(&self, view: &str, group: &str) -> Result<Vec<CollectionKey>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT members FROM view_groups WHERE view = ?1 AND grp = ?2")?;
        let members: Option<String> = stmt
            .query_row(params![view, group], |row| row.get(0))
            .optional()?;
        match members {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    /// Store the ordered members of a group. An empty group is removed.
    pub fn save_group(&self, view: &str, group: &str, members: &[CollectionKey]) -> Result<()> {
        if members.is_empty() {
            let mut stmt = self
                .conn
                .prepare_cached("DELETE FROM view_groups WHERE view = ?1 AND grp = ?2")?;
            stmt.execute(params![view, group])?;
            return Ok(());
        }
        let json = serde_json::to_string(members)?;
        let mut stmt = self.conn.prepare_cached(
            "INSERT OR REPLACE INTO view_groups (view, grp, size, members) VALUES (?1, ?2, ?3, ?4)",
        )?;
        stmt.execute(params![view, group, members.len() as i64, json])?;
        Ok(())
    }

    /// Group currently holding `ck` in `view`, if any.
    pub fn group_of(&self, view: &str, ck: &CollectionKey) -> Result<Option<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT grp FROM view_keys WHERE view = ?1 AND collection = ?2 AND key = ?3",
        )?;
        let result = stmt
            .query_row(params![view, ck.collection, ck.key], |row| row.get(0))
            .optional()?;
        Ok(result)
    }

    pub fn set_group_of(&self, view: &str, ck: &CollectionKey, group: &str) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT OR REPLACE INTO view_keys (view, collection, key, grp) VALUES (?1, ?2, ?3, ?4)",
        )?;
        stmt.execute(params![view, ck.collection, ck.key, group])?;
        Ok(())
    }

    pub fn clear_group_of(&self, view: &str, ck: &CollectionKey) -> Result<bool> {
        let mut stmt = self.conn.prepare_cached(
            "DELETE FROM view_keys WHERE view = ?1 AND collection = ?2 AND key = ?3",
        )?;
        Ok(stmt.execute(params![view, ck.collection, ck.key])? > 0)
    }

    /// Every key assigned to `group` in `view`, unordered.
    pub fn keys_in_group(&self, view: &str, group: &str) -> Result<HashSet<CollectionKey>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT collection, key FROM view_keys WHERE view = ?1 AND grp = ?2")?;
        let rows = stmt.query_map(params![view, group], |row| {
            Ok(CollectionKey {
                collection: row.get(0)?,
                key: row.get(1)?,
            })
        })?;
        let mut keys = HashSet::new();
        for row in rows {
            keys.insert(row?);
        }
        Ok(keys)
    }

    /// Member counts per group taken from the key index.
    pub fn key_group_sizes(&self, view: &str) -> Result<BTreeMap<String, usize>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT grp, COUNT(*) FROM view_keys WHERE view = ?1 GROUP BY grp")?;
        let rows = stmt.query_map(params![view], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        let mut sizes = BTreeMap::new();
        for row in rows {
            let (group, size) = row?;
            sizes.insert(group, size);
        }
        Ok(sizes)
    }
}

fn extension_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExtensionRecord> {
    Ok(ExtensionRecord {
        name: row.get(0)?,
        kind: row.get(1)?,
        version_tag: row.get(2)?,
        parent: row.get(3)?,
        persistent: row.get(4)?,
        maintained_through: row.get::<_, i64>(5)? as u64,
    })
}
