//! The backing file: a SQLite database with a `game` table (identifier ->
//! object blob) and a `custom` table (key -> global blob).
//!
//! The file is loaded into an in-memory connection on open; nothing touches
//! the file again until [`SaveStore::save`], which writes a complete copy and
//! swaps it in.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::backup::Progress;
use rusqlite::{Connection, DatabaseName, OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{DecodeOptions, DecodePolicy, InvalidObjectHook};
use crate::context::SaveContext;
use crate::error::{Result, SaveError};
use crate::object::GameObject;
use crate::patch::Patcher;

pub const SAVE_HEADER_KEY: &str = "SaveHeader";
pub const ACTOR_TRANSFORMS_KEY: &str = "ActorTransforms";

const CREATE_TABLES: &str = "CREATE TABLE IF NOT EXISTS game (key BLOB PRIMARY KEY, value BLOB);
     CREATE TABLE IF NOT EXISTS custom (key TEXT PRIMARY KEY, value BLOB);";

/// Decoded objects of the current session, keyed by identifier. Entries are
/// dropped whenever the stored blob changes.
#[derive(Debug, Default)]
pub struct ObjectCache {
    objects: HashMap<Uuid, Arc<GameObject>>,
}

impl ObjectCache {
    pub fn get(&self, id: &Uuid) -> Option<Arc<GameObject>> {
        self.objects.get(id).cloned()
    }

    pub fn insert(&mut self, object: Arc<GameObject>) {
        self.objects.insert(object.id, object);
    }

    pub fn invalidate(&mut self, id: &Uuid) {
        self.objects.remove(id);
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Result of a bulk scan.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub objects: Vec<Arc<GameObject>>,
    /// Objects that failed to decode and were skipped under the permissive
    /// policy.
    pub skipped: usize,
}

impl IntoIterator for ScanReport {
    type Item = Arc<GameObject>;
    type IntoIter = std::vec::IntoIter<Arc<GameObject>>;

    fn into_iter(self) -> Self::IntoIter {
        self.objects.into_iter()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub objects: usize,
    pub custom_keys: Vec<String>,
    pub names: usize,
    pub transforms: usize,
    pub version: u16,
    pub game_time: Option<f64>,
}

pub struct SaveStore {
    conn: Connection,
    path: Option<PathBuf>,
    policy: DecodePolicy,
    context: Option<Arc<SaveContext>>,
    cache: ObjectCache,
}

impl std::fmt::Debug for SaveStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveStore")
            .field("path", &self.path)
            .field("policy", &self.policy)
            .field("cached", &self.cache.len())
            .finish()
    }
}

fn identifier(key: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(key).map_err(|e| {
        SaveError::invalid(format!("game key is {} bytes, not an identifier: {e}", key.len()))
    })
}

impl SaveStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, DecodePolicy::default())
    }

    pub fn open_with(path: impl AsRef<Path>, policy: DecodePolicy) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(SaveError::NotFound(format!("save file {}", path.display())));
        }
        let mut conn = Connection::open_in_memory()?;
        conn.restore(DatabaseName::Main, path, None::<fn(Progress)>)?;
        conn.execute_batch(CREATE_TABLES)?;
        info!(path = %path.display(), "opened save");
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
            policy,
            context: None,
            cache: ObjectCache::default(),
        })
    }

    /// An empty store with no backing file, for building saves from scratch.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn,
            path: None,
            policy: DecodePolicy::default(),
            context: None,
            cache: ObjectCache::default(),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn options(&self) -> DecodeOptions {
        self.policy.options
    }

    pub fn set_options(&mut self, options: DecodeOptions) {
        self.policy.options = options;
        self.cache.clear();
    }

    pub fn set_invalid_object_hook(&mut self, hook: InvalidObjectHook) {
        self.policy.on_invalid = Some(hook);
    }

    /// The save context, built from the header and transform blobs on first
    /// use and shared from then on.
    pub fn context(&mut self) -> Result<Arc<SaveContext>> {
        if let Some(ctx) = &self.context {
            return Ok(Arc::clone(ctx));
        }
        let header = self
            .get_custom(SAVE_HEADER_KEY)?
            .ok_or_else(|| SaveError::NotFound(format!("custom blob {SAVE_HEADER_KEY}")))?;
        let transforms = self.get_custom(ACTOR_TRANSFORMS_KEY)?;
        let ctx = Arc::new(SaveContext::from_blobs(&header, transforms.as_deref())?);
        self.context = Some(Arc::clone(&ctx));
        Ok(ctx)
    }

    /// Store `ctx` as the save context and write its header and transform
    /// blobs back.
    pub fn write_context(&mut self, ctx: SaveContext) -> Result<()> {
        self.put_custom(SAVE_HEADER_KEY, &ctx.header_bytes()?)?;
        self.put_custom(ACTOR_TRANSFORMS_KEY, &ctx.transforms_bytes())?;
        self.context = Some(Arc::new(ctx));
        self.cache.clear();
        Ok(())
    }

    /// Add `name` to the save's name table if absent and persist the table.
    pub fn intern_name(&mut self, name: &str) -> Result<u32> {
        let ctx = self.context()?;
        if let Some(index) = ctx.index_of(name) {
            return Ok(index);
        }
        let mut grown = SaveContext::clone(&ctx);
        let index = grown.intern_name(name);
        debug!(name, index, "interned name");
        self.write_context(grown)?;
        Ok(index)
    }

    pub fn get(&self, id: &Uuid) -> Result<Vec<u8>> {
        self.conn
            .query_row(
                "SELECT value FROM game WHERE key = ?1",
                params![id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| SaveError::NotFound(format!("object {id}")))
    }

    /// Insert or replace the blob stored under `id`.
    pub fn put(&mut self, id: &Uuid, blob: &[u8]) -> Result<()> {
        let key = id.as_bytes().as_slice();
        let updated = self
            .conn
            .execute("UPDATE game SET value = ?2 WHERE key = ?1", params![key, blob])?;
        if updated == 0 {
            self.conn
                .execute("INSERT INTO game (key, value) VALUES (?1, ?2)", params![key, blob])?;
        }
        self.cache.invalidate(id);
        Ok(())
    }

    pub fn delete(&mut self, id: &Uuid) -> Result<()> {
        let removed = self
            .conn
            .execute("DELETE FROM game WHERE key = ?1", params![id.as_bytes().as_slice()])?;
        self.cache.invalidate(id);
        if removed == 0 {
            return Err(SaveError::NotFound(format!("object {id}")));
        }
        Ok(())
    }

    pub fn get_custom(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM custom WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    pub fn put_custom(&mut self, key: &str, blob: &[u8]) -> Result<()> {
        let updated = self
            .conn
            .execute("UPDATE custom SET value = ?2 WHERE key = ?1", params![key, blob])?;
        if updated == 0 {
            self.conn
                .execute("INSERT INTO custom (key, value) VALUES (?1, ?2)", params![key, blob])?;
        }
        Ok(())
    }

    pub fn custom_keys(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT key FROM custom ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    pub fn object_ids(&self) -> Result<Vec<Uuid>> {
        let mut stmt = self.conn.prepare("SELECT key FROM game")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        keys.iter().map(|key| identifier(key)).collect()
    }

    pub fn object_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM game", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn stats(&mut self) -> Result<StoreStats> {
        let ctx = self.context()?;
        Ok(StoreStats {
            objects: self.object_count()?,
            custom_keys: self.custom_keys()?,
            names: ctx.names().len(),
            transforms: ctx.transforms().len(),
            version: ctx.version(),
            game_time: ctx.game_time(),
        })
    }

    /// Decode one object, serving it from the session cache when possible.
    pub fn get_object(&mut self, id: &Uuid) -> Result<Arc<GameObject>> {
        if let Some(object) = self.cache.get(id) {
            return Ok(object);
        }
        let ctx = self.context()?;
        let blob = self.get(id)?;
        let object = Arc::new(GameObject::decode(*id, &blob, &ctx, self.policy.options)?);
        self.cache.insert(Arc::clone(&object));
        Ok(object)
    }

    /// Encode `object` and store it under its identifier.
    pub fn put_object(&mut self, object: &GameObject) -> Result<()> {
        let ctx = self.context()?;
        let blob = object.to_bytes(&ctx)?;
        self.put(&object.id, &blob)
    }

    /// Decode every object whose identifier and blueprint pass the filters.
    ///
    /// Under the permissive policy a failing object is reported to the hook,
    /// counted and skipped; otherwise the first failure aborts the scan.
    pub fn scan(
        &mut self,
        mut blueprint: impl FnMut(&str) -> bool,
        mut id: impl FnMut(&Uuid) -> bool,
    ) -> Result<ScanReport> {
        let ctx = self.context()?;
        let rows = {
            let mut stmt = self.conn.prepare("SELECT key, value FROM game")?;
            stmt.query_map([], |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut report = ScanReport::default();
        for (key, blob) in rows {
            let object_id = identifier(&key)?;
            if !id(&object_id) {
                continue;
            }
            if let Some(object) = self.cache.get(&object_id) {
                if blueprint(object.blueprint.base()) {
                    report.objects.push(object);
                }
                continue;
            }

            let decoded = GameObject::peek_blueprint(&blob, &ctx).and_then(|name| {
                if !blueprint(name.base()) {
                    return Ok(None);
                }
                GameObject::decode(object_id, &blob, &ctx, self.policy.options).map(Some)
            });
            match decoded {
                Ok(Some(object)) => {
                    let object = Arc::new(object);
                    self.cache.insert(Arc::clone(&object));
                    report.objects.push(object);
                }
                Ok(None) => {}
                Err(error) if self.policy.allows_invalid() => {
                    warn!(id = %object_id, %error, "skipping object that failed to decode");
                    if let Some(hook) = &self.policy.on_invalid {
                        hook(&object_id, &error);
                    }
                    report.skipped += 1;
                }
                Err(error) => return Err(error),
            }
        }

        debug!(objects = report.objects.len(), skipped = report.skipped, "scan complete");
        Ok(report)
    }

    /// Give object `old` the identifier `new`: every occurrence of `old` in
    /// every object blob is rewritten, the row is re-keyed and its world
    /// transform moves with it. Returns the number of occurrences rewritten.
    pub fn reidentify(&mut self, old: &Uuid, new: &Uuid) -> Result<usize> {
        let ctx = self.context()?;
        let blob = self.get(old)?;
        match self.get(new) {
            Ok(_) => return Err(SaveError::invalid(format!("object {new} already exists"))),
            Err(SaveError::NotFound(_)) => {}
            Err(error) => return Err(error),
        }

        let mut rewritten = Vec::new();
        let mut total = 0;
        for other in self.object_ids()? {
            if other == *old {
                continue;
            }
            let mut patcher = Patcher::new(&ctx, self.get(&other)?);
            let count = patcher.reidentify(old, new)?;
            if count > 0 {
                total += count;
                rewritten.push((other, patcher.into_bytes()));
            }
        }
        let mut patcher = Patcher::new(&ctx, blob);
        total += patcher.reidentify(old, new)?;
        let moved = patcher.into_bytes();

        self.delete(old)?;
        self.put(new, &moved)?;
        for (other, bytes) in rewritten {
            self.put(&other, &bytes)?;
        }

        if ctx.transform(old).is_some() {
            let mut updated = SaveContext::clone(&ctx);
            if let Some(transform) = updated.remove_transform(old) {
                updated.insert_transform(*new, transform);
            }
            self.write_context(updated)?;
        }

        info!(%old, %new, occurrences = total, "reidentified object");
        Ok(total)
    }

    /// Write the store back to the file it was opened from.
    pub fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| SaveError::invalid("store has no backing file; use save_as"))?;
        self.save_as(path)
    }

    /// Write a complete copy of the store to `path`. An existing file is kept
    /// as `<path>.bak`; the new file is written beside it and renamed over.
    pub fn save_as(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = sibling(path, "tmp");
        if tmp.exists() {
            fs::remove_file(&tmp)?;
        }
        self.conn
            .backup(DatabaseName::Main, &tmp, None::<fn(Progress)>)?;
        if path.exists() {
            fs::copy(path, sibling(path, "bak"))?;
        }
        fs::rename(&tmp, path)?;
        info!(path = %path.display(), "saved");
        Ok(())
    }
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use rusqlite::params;

    use super::{ObjectCache, SaveStore, sibling};
    use crate::context::{NameTable, SaveContext, SaveHeader};
    use crate::error::SaveError;
    use crate::object::GameObject;

    #[test]
    fn missing_rows_are_not_found() {
        let mut store = SaveStore::in_memory().unwrap();
        let id = Uuid::from_u128(5);
        assert!(matches!(store.get(&id), Err(SaveError::NotFound(_))));
        assert!(matches!(store.delete(&id), Err(SaveError::NotFound(_))));
        assert_eq!(store.get_custom("SaveHeader").unwrap(), None);
    }

    #[test]
    fn put_replaces_existing_rows() {
        let mut store = SaveStore::in_memory().unwrap();
        let id = Uuid::from_u128(5);
        store.put(&id, &[1, 2]).unwrap();
        store.put(&id, &[3]).unwrap();
        assert_eq!(store.get(&id).unwrap(), vec![3]);
        assert_eq!(store.object_count().unwrap(), 1);
        assert_eq!(store.object_ids().unwrap(), vec![id]);
    }

    #[test]
    fn reidentify_stops_on_a_failed_lookup_of_the_target() {
        let mut store = SaveStore::in_memory().unwrap();
        let ctx = SaveContext::with_header(SaveHeader::new(13, 0.0), NameTable::from_names(["None"]));
        store.write_context(ctx).unwrap();
        let old = Uuid::from_u128(5);
        let new = Uuid::from_u128(6);
        store.put(&old, &[1, 2, 3, 4]).unwrap();
        // An integer where a blob belongs makes the row unreadable.
        store
            .conn
            .execute(
                "INSERT INTO game (key, value) VALUES (?1, 42)",
                params![new.as_bytes().as_slice()],
            )
            .unwrap();

        let err = store.reidentify(&old, &new).unwrap_err();
        assert!(matches!(err, SaveError::Database(_)));
        assert_eq!(store.get(&old).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn cache_invalidates_by_identifier() {
        let mut cache = ObjectCache::default();
        let a = Uuid::from_u128(1);
        cache.insert(Arc::new(GameObject::new(a, "A")));
        cache.insert(Arc::new(GameObject::new(Uuid::from_u128(2), "B")));
        cache.invalidate(&a);
        assert!(cache.get(&a).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn sibling_appends_extension() {
        let path = std::path::Path::new("/saves/TheIsland_WP.ark");
        assert_eq!(
            sibling(path, "bak"),
            std::path::PathBuf::from("/saves/TheIsland_WP.ark.bak")
        );
    }
}
