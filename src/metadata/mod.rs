//! Metadata store (§4.5, §6): files/blobs/page_metadata schema, CRUD,
//! refcounts, and the transaction protocol of [`transaction`].

pub mod statements;
pub mod transaction;

use sqlx::{Row, SqlitePool};

use crate::clock::SharedClock;
use crate::config::{Tier, TransactionConfig};
use crate::error::{Error, Result};
use statements::PreparedStatementCache;
use transaction::{TransactionManager, TransactionOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Directory,
    Symlink,
}

impl EntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryType::File => "file",
            EntryType::Directory => "directory",
            EntryType::Symlink => "symlink",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(EntryType::File),
            "directory" => Ok(EntryType::Directory),
            "symlink" => Ok(EntryType::Symlink),
            other => Err(Error::invalid_argument(format!("unknown entry type {other:?}"))),
        }
    }
}

/// A filesystem node (§3 FileEntry).
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub id: i64,
    pub path: String,
    pub name: String,
    pub parent_id: Option<i64>,
    pub entry_type: EntryType,
    pub mode: i64,
    pub uid: i64,
    pub gid: i64,
    pub size: i64,
    pub blob_id: Option<String>,
    pub link_target: Option<String>,
    pub nlink: i64,
    pub tier: Tier,
    pub birthtime: i64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

/// Fields accepted by [`MetadataStore::update_entry`]; `None` leaves the
/// column untouched.
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
    pub size: Option<i64>,
    pub mode: Option<i64>,
    pub uid: Option<i64>,
    pub gid: Option<i64>,
    pub blob_id: Option<Option<String>>,
    pub nlink: Option<i64>,
    pub tier: Option<Tier>,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewEntry {
    pub path: String,
    pub name: String,
    pub parent_id: Option<i64>,
    pub entry_type: EntryType,
    pub mode: i64,
    pub uid: i64,
    pub gid: i64,
    pub size: i64,
    pub blob_id: Option<String>,
    pub link_target: Option<String>,
    pub tier: Tier,
}

#[derive(Debug, Clone)]
pub struct BlobRef {
    pub id: String,
    pub tier: Tier,
    pub size: i64,
    pub checksum: Option<String>,
    pub ref_count: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewBlob {
    pub id: String,
    pub tier: Tier,
    pub size: i64,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TierUsage {
    pub count: i64,
    pub total_size: i64,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub total_files: i64,
    pub total_directories: i64,
    pub total_size: i64,
    pub blobs_by_tier: Vec<(Tier, TierUsage)>,
}

pub struct MetadataStore {
    pool: SqlitePool,
    pub transactions: TransactionManager,
    statements: PreparedStatementCache,
    clock: SharedClock,
}

const STATEMENT_KEYS: &[&str] = &[
    "get_by_path",
    "get_by_id",
    "get_children",
    "create_entry",
    "update_entry",
    "delete_entry",
    "increment_blob_ref_count",
    "decrement_blob_ref_count",
];

impl MetadataStore {
    pub fn new(pool: SqlitePool, txn_config: TransactionConfig, clock: SharedClock) -> Self {
        let statements = PreparedStatementCache::new();
        for key in STATEMENT_KEYS {
            statements.register(key);
        }
        Self { transactions: TransactionManager::new(pool.clone(), txn_config, clock.clone()), pool, statements, clock }
    }

    /// Idempotent schema creation (§4.5). Creates the root directory if
    /// absent.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL,
                parent_id INTEGER,
                type TEXT NOT NULL CHECK (type IN ('file','directory','symlink')),
                mode INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                gid INTEGER NOT NULL,
                size INTEGER NOT NULL,
                blob_id TEXT,
                link_target TEXT,
                nlink INTEGER NOT NULL DEFAULT 1,
                tier TEXT NOT NULL DEFAULT 'hot' CHECK (tier IN ('hot','warm','cold')),
                birthtime INTEGER NOT NULL,
                atime INTEGER NOT NULL,
                mtime INTEGER NOT NULL,
                ctime INTEGER NOT NULL,
                FOREIGN KEY (parent_id) REFERENCES files(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_parent ON files(parent_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_tier ON files(tier)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blobs (
                id TEXT PRIMARY KEY,
                tier TEXT NOT NULL CHECK (tier IN ('hot','warm','cold')),
                size INTEGER NOT NULL,
                checksum TEXT,
                ref_count INTEGER NOT NULL DEFAULT 1 CHECK (ref_count >= 0),
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS page_metadata (
                file_id INTEGER NOT NULL,
                page_number INTEGER NOT NULL,
                page_key TEXT NOT NULL UNIQUE,
                tier TEXT NOT NULL DEFAULT 'warm' CHECK (tier IN ('hot','warm','cold')),
                size INTEGER NOT NULL,
                checksum TEXT,
                last_access_at INTEGER NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                compressed INTEGER NOT NULL DEFAULT 0,
                original_size INTEGER,
                PRIMARY KEY (file_id, page_number),
                FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_page_metadata_tier ON page_metadata(tier)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_page_metadata_lru ON page_metadata(last_access_at)")
            .execute(&self.pool)
            .await?;

        let root = sqlx::query("SELECT id FROM files WHERE path = '/'").fetch_optional(&self.pool).await?;
        if root.is_none() {
            let now = self.clock.now_ms();
            sqlx::query(
                "INSERT INTO files (path, name, parent_id, type, mode, uid, gid, size, blob_id,
                 link_target, nlink, tier, birthtime, atime, mtime, ctime)
                 VALUES ('/', '', NULL, 'directory', 0o755, 0, 0, 0, NULL, NULL, 1, 'hot', ?, ?, ?, ?)",
            )
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn get_by_path(&self, path: &str) -> Result<Option<FileEntry>> {
        let row = self
            .statements
            .timed("get_by_path", || {
                self.transactions.exec(|conn| Box::pin(async move {
                    sqlx::query(SELECT_FILE_COLUMNS).bind(path).fetch_optional(conn).await
                }))
            })
            .await?;
        row.map(row_to_entry).transpose()
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<FileEntry>> {
        let row = self
            .statements
            .timed("get_by_id", || {
                self.transactions.exec(|conn| Box::pin(async move {
                    sqlx::query(&format!("{SELECT_FILE_COLUMNS_BY} WHERE id = ?")).bind(id).fetch_optional(conn).await
                }))
            })
            .await?;
        row.map(row_to_entry).transpose()
    }

    pub async fn get_children(&self, parent_id: i64) -> Result<Vec<FileEntry>> {
        let rows = self
            .statements
            .timed("get_children", || {
                self.transactions.exec(|conn| Box::pin(async move {
                    sqlx::query(&format!("{SELECT_FILE_COLUMNS_BY} WHERE parent_id = ?"))
                        .bind(parent_id)
                        .fetch_all(conn)
                        .await
                }))
            })
            .await?;
        rows.into_iter().map(row_to_entry).collect()
    }

    pub async fn create_entry(&self, entry: NewEntry) -> Result<i64> {
        if self.get_by_path(&entry.path).await?.is_some() {
            return Err(Error::already_exists(entry.path));
        }
        let now = self.clock.now_ms();
        let result = self
            .statements
            .timed("create_entry", || {
                self.transactions.exec(|conn| Box::pin(async move {
                    sqlx::query(
                        "INSERT INTO files (path, name, parent_id, type, mode, uid, gid, size, blob_id,
                         link_target, nlink, tier, birthtime, atime, mtime, ctime)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?)",
                    )
                    .bind(&entry.path)
                    .bind(&entry.name)
                    .bind(entry.parent_id)
                    .bind(entry.entry_type.as_str())
                    .bind(entry.mode)
                    .bind(entry.uid)
                    .bind(entry.gid)
                    .bind(entry.size)
                    .bind(&entry.blob_id)
                    .bind(&entry.link_target)
                    .bind(entry.tier.as_str())
                    .bind(now)
                    .bind(now)
                    .bind(now)
                    .bind(now)
                    .execute(conn)
                    .await
                }))
            })
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn update_entry(&self, id: i64, patch: EntryPatch) -> Result<()> {
        let now = self.clock.now_ms();
        let mut sets = vec!["ctime = ?".to_string()];
        macro_rules! push {
            ($col:literal, $opt:expr) => {
                if $opt.is_some() {
                    sets.push(format!("{} = ?", $col));
                }
            };
        }
        push!("size", patch.size);
        push!("mode", patch.mode);
        push!("uid", patch.uid);
        push!("gid", patch.gid);
        push!("blob_id", patch.blob_id);
        push!("nlink", patch.nlink);
        push!("tier", patch.tier);
        push!("atime", patch.atime);
        push!("mtime", patch.mtime);

        let sql = format!("UPDATE files SET {} WHERE id = ?", sets.join(", "));
        let mut query = sqlx::query(&sql).bind(now);
        if let Some(v) = patch.size {
            query = query.bind(v);
        }
        if let Some(v) = patch.mode {
            query = query.bind(v);
        }
        if let Some(v) = patch.uid {
            query = query.bind(v);
        }
        if let Some(v) = patch.gid {
            query = query.bind(v);
        }
        if let Some(v) = patch.blob_id {
            query = query.bind(v);
        }
        if let Some(v) = patch.nlink {
            query = query.bind(v);
        }
        if let Some(v) = patch.tier {
            query = query.bind(v.as_str());
        }
        if let Some(v) = patch.atime {
            query = query.bind(v);
        }
        if let Some(v) = patch.mtime {
            query = query.bind(v);
        }
        query = query.bind(id);

        let result = self
            .statements
            .timed("update_entry", || self.transactions.exec(move |conn| Box::pin(async move { query.execute(conn).await })))
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(id.to_string()));
        }
        Ok(())
    }

    /// Moves an entry to a new path/name/parent, for `move` (§4.5 — `path`
    /// isn't one of [`EntryPatch`]'s columns since every other mutation
    /// leaves it fixed).
    pub async fn rename_entry(&self, id: i64, new_path: &str, new_name: &str, new_parent_id: Option<i64>) -> Result<()> {
        if self.get_by_path(new_path).await?.is_some() {
            return Err(Error::already_exists(new_path.to_string()));
        }
        let now = self.clock.now_ms();
        let result = self
            .statements
            .timed("rename_entry", || {
                self.transactions.exec(|conn| Box::pin(async move {
                    sqlx::query("UPDATE files SET path = ?, name = ?, parent_id = ?, ctime = ? WHERE id = ?")
                        .bind(new_path)
                        .bind(new_name)
                        .bind(new_parent_id)
                        .bind(now)
                        .bind(id)
                        .execute(conn)
                        .await
                }))
            })
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(id.to_string()));
        }
        Ok(())
    }

    pub async fn delete_entry(&self, id: i64) -> Result<()> {
        let result = self
            .statements
            .timed("delete_entry", || {
                self.transactions.exec(|conn| Box::pin(async move { sqlx::query("DELETE FROM files WHERE id = ?").bind(id).execute(conn).await }))
            })
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(id.to_string()));
        }
        Ok(())
    }

    /// Bulk insert, all-or-nothing (§4.5).
    pub async fn create_entries_atomic(&self, entries: Vec<NewEntry>) -> Result<Vec<i64>> {
        self.transactions
            .transaction(TransactionOptions::default(), || async {
                let mut ids = Vec::with_capacity(entries.len());
                for entry in entries.clone() {
                    ids.push(self.create_entry(entry).await?);
                }
                Ok(ids)
            })
            .await
    }

    pub async fn delete_entries_atomic(&self, ids: Vec<i64>) -> Result<()> {
        self.transactions
            .transaction(TransactionOptions::default(), || async {
                for id in &ids {
                    self.delete_entry(*id).await?;
                }
                Ok(())
            })
            .await
    }

    pub async fn register_blobs_atomic(&self, blobs: Vec<NewBlob>) -> Result<()> {
        self.transactions
            .transaction(TransactionOptions::default(), || async {
                for blob in blobs.clone() {
                    self.register_blob(blob).await?;
                }
                Ok(())
            })
            .await
    }

    pub async fn register_blob(&self, blob: NewBlob) -> Result<()> {
        let now = self.clock.now_ms();
        self.transactions
            .exec(|conn| Box::pin(async move {
                sqlx::query("INSERT INTO blobs (id, tier, size, checksum, ref_count, created_at) VALUES (?, ?, ?, ?, 1, ?)")
                    .bind(&blob.id)
                    .bind(blob.tier.as_str())
                    .bind(blob.size)
                    .bind(&blob.checksum)
                    .bind(now)
                    .execute(conn)
                    .await
            }))
            .await?;
        Ok(())
    }

    pub async fn get_blob(&self, id: &str) -> Result<Option<BlobRef>> {
        let row = self
            .transactions
            .exec(|conn| Box::pin(async move {
                sqlx::query("SELECT id, tier, size, checksum, ref_count, created_at FROM blobs WHERE id = ?")
                    .bind(id)
                    .fetch_optional(conn)
                    .await
            }))
            .await?;
        row.map(row_to_blob).transpose()
    }

    pub async fn update_blob_tier(&self, id: &str, tier: Tier) -> Result<()> {
        self.transactions
            .exec(|conn| Box::pin(async move {
                sqlx::query("UPDATE blobs SET tier = ? WHERE id = ?").bind(tier.as_str()).bind(id).execute(conn).await
            }))
            .await?;
        Ok(())
    }

    pub async fn delete_blob(&self, id: &str) -> Result<()> {
        self.transactions
            .exec(|conn| Box::pin(async move { sqlx::query("DELETE FROM blobs WHERE id = ?").bind(id).execute(conn).await }))
            .await?;
        Ok(())
    }

    pub async fn get_blob_ref_count(&self, id: &str) -> Result<i64> {
        let row = self
            .transactions
            .exec(|conn| Box::pin(async move { sqlx::query("SELECT ref_count FROM blobs WHERE id = ?").bind(id).fetch_one(conn).await }))
            .await?;
        Ok(row.try_get::<i64, _>("ref_count")?)
    }

    /// Atomic relative update (§5: safe against concurrent executors).
    pub async fn increment_blob_ref_count(&self, id: &str) -> Result<()> {
        self.statements
            .timed("increment_blob_ref_count", || {
                self.transactions.exec(|conn| Box::pin(async move {
                    sqlx::query("UPDATE blobs SET ref_count = ref_count + 1 WHERE id = ?").bind(id).execute(conn).await
                }))
            })
            .await?;
        Ok(())
    }

    /// Returns `true` iff the new count reached zero.
    pub async fn decrement_blob_ref_count(&self, id: &str) -> Result<bool> {
        self.statements
            .timed("decrement_blob_ref_count", || {
                self.transactions.exec(|conn| Box::pin(async move {
                    sqlx::query("UPDATE blobs SET ref_count = MAX(ref_count - 1, 0) WHERE id = ?").bind(id).execute(conn).await
                }))
            })
            .await?;
        Ok(self.get_blob_ref_count(id).await? == 0)
    }

    pub async fn count_blob_references(&self, id: &str) -> Result<i64> {
        let row = self
            .transactions
            .exec(|conn| Box::pin(async move { sqlx::query("SELECT COUNT(*) AS n FROM files WHERE blob_id = ?").bind(id).fetch_one(conn).await }))
            .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    pub async fn sync_blob_ref_count(&self, id: &str) -> Result<i64> {
        let live = self.count_blob_references(id).await?;
        self.transactions
            .exec(|conn| Box::pin(async move { sqlx::query("UPDATE blobs SET ref_count = ? WHERE id = ?").bind(live).bind(id).execute(conn).await }))
            .await?;
        Ok(live)
    }

    /// `*`/`?` glob lookup, optionally scoped under `parent_path`.
    pub async fn find_by_pattern(&self, pattern: &str, parent_path: Option<&str>) -> Result<Vec<FileEntry>> {
        let like = pattern.replace('*', "%").replace('?', "_");
        let rows = match parent_path {
            Some(parent) => {
                let scoped = format!("{parent}%");
                self.transactions
                    .exec(|conn| Box::pin(async move {
                        sqlx::query(&format!("{SELECT_FILE_COLUMNS_BY} WHERE path LIKE ? AND path LIKE ?"))
                            .bind(&like)
                            .bind(&scoped)
                            .fetch_all(conn)
                            .await
                    }))
                    .await?
            }
            None => {
                self.transactions
                    .exec(|conn| Box::pin(async move {
                        sqlx::query(&format!("{SELECT_FILE_COLUMNS_BY} WHERE path LIKE ?")).bind(&like).fetch_all(conn).await
                    }))
                    .await?
            }
        };
        rows.into_iter().map(row_to_entry).collect()
    }

    pub async fn get_stats(&self) -> Result<StoreStats> {
        let totals = self
            .transactions
            .exec(|conn| Box::pin(async move {
                sqlx::query(
                    "SELECT
                        SUM(CASE WHEN type = 'file' THEN 1 ELSE 0 END) AS total_files,
                        SUM(CASE WHEN type = 'directory' THEN 1 ELSE 0 END) AS total_directories,
                        COALESCE(SUM(size), 0) AS total_size
                     FROM files",
                )
                .fetch_one(conn)
                .await
            }))
            .await?;

        let mut blobs_by_tier = Vec::new();
        for tier in [Tier::Hot, Tier::Warm, Tier::Cold] {
            let row = self
                .transactions
                .exec(|conn| Box::pin(async move {
                    sqlx::query("SELECT COUNT(*) AS count, COALESCE(SUM(size), 0) AS total_size FROM blobs WHERE tier = ?")
                        .bind(tier.as_str())
                        .fetch_one(conn)
                        .await
                }))
                .await?;
            blobs_by_tier.push((
                tier,
                TierUsage { count: row.try_get("count")?, total_size: row.try_get("total_size")? },
            ));
        }

        Ok(StoreStats {
            total_files: totals.try_get::<Option<i64>, _>("total_files")?.unwrap_or(0),
            total_directories: totals.try_get::<Option<i64>, _>("total_directories")?.unwrap_or(0),
            total_size: totals.try_get("total_size")?,
            blobs_by_tier,
        })
    }

    pub fn get_statement_stats(&self) -> Vec<(&'static str, statements::StatementStats)> {
        self.statements.get_statement_stats()
    }
}

const SELECT_FILE_COLUMNS_BY: &str = "SELECT id, path, name, parent_id, type, mode, uid, gid, size, blob_id, \
    link_target, nlink, tier, birthtime, atime, mtime, ctime FROM files";
const SELECT_FILE_COLUMNS: &str = "SELECT id, path, name, parent_id, type, mode, uid, gid, size, blob_id, \
    link_target, nlink, tier, birthtime, atime, mtime, ctime FROM files WHERE path = ?";

fn row_to_entry(row: sqlx::sqlite::SqliteRow) -> Result<FileEntry> {
    Ok(FileEntry {
        id: row.try_get("id")?,
        path: row.try_get("path")?,
        name: row.try_get("name")?,
        parent_id: row.try_get("parent_id")?,
        entry_type: EntryType::parse(&row.try_get::<String, _>("type")?)?,
        mode: row.try_get("mode")?,
        uid: row.try_get("uid")?,
        gid: row.try_get("gid")?,
        size: row.try_get("size")?,
        blob_id: row.try_get("blob_id")?,
        link_target: row.try_get("link_target")?,
        nlink: row.try_get("nlink")?,
        tier: row.try_get::<String, _>("tier")?.parse()?,
        birthtime: row.try_get("birthtime")?,
        atime: row.try_get("atime")?,
        mtime: row.try_get("mtime")?,
        ctime: row.try_get("ctime")?,
    })
}

fn row_to_blob(row: sqlx::sqlite::SqliteRow) -> Result<BlobRef> {
    Ok(BlobRef {
        id: row.try_get("id")?,
        tier: row.try_get::<String, _>("tier")?.parse()?,
        size: row.try_get("size")?,
        checksum: row.try_get("checksum")?,
        ref_count: row.try_get("ref_count")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::VirtualClock;
    use std::sync::Arc;

    async fn store() -> MetadataStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = MetadataStore::new(pool, TransactionConfig::default(), Arc::new(VirtualClock::new(1_000)));
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn init_creates_root() {
        let store = store().await;
        let root = store.get_by_path("/").await.unwrap().expect("root exists");
        assert_eq!(root.parent_id, None);
        assert_eq!(root.entry_type.as_str(), "directory");
    }

    #[tokio::test]
    async fn create_rejects_duplicate_path() {
        let store = store().await;
        let entry = NewEntry {
            path: "/a".into(),
            name: "a".into(),
            parent_id: None,
            entry_type: EntryType::File,
            mode: 0o644,
            uid: 0,
            gid: 0,
            size: 0,
            blob_id: None,
            link_target: None,
            tier: Tier::Hot,
        };
        store.create_entry(entry.clone()).await.unwrap();
        let err = store.create_entry(entry).await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_EXISTS");
    }

    #[tokio::test]
    async fn blob_refcount_lifecycle() {
        let store = store().await;
        store.register_blob(NewBlob { id: "X".into(), tier: Tier::Hot, size: 10, checksum: None }).await.unwrap();
        store.increment_blob_ref_count("X").await.unwrap();
        assert_eq!(store.get_blob_ref_count("X").await.unwrap(), 2);
        assert!(!store.decrement_blob_ref_count("X").await.unwrap());
        assert!(store.decrement_blob_ref_count("X").await.unwrap());
    }
}
