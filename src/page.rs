//! Page metadata & VFS chunker (§4.6): 2 MiB chunk descriptors for files
//! larger than the single-blob threshold.

use sqlx::{Row, SqlitePool};

use crate::clock::SharedClock;
use crate::config::{Tier, PAGE_SIZE};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct PageMetadata {
    pub file_id: i64,
    pub page_number: i64,
    pub page_key: String,
    pub tier: Tier,
    pub size: i64,
    pub checksum: Option<String>,
    pub last_access_at: i64,
    pub access_count: i64,
    pub compressed: bool,
    pub original_size: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct PagePatch {
    pub tier: Option<Tier>,
    pub size: Option<i64>,
    pub checksum: Option<Option<String>>,
    pub compressed: Option<bool>,
    pub original_size: Option<Option<i64>>,
}

#[derive(Debug, Clone, Default)]
pub struct TierUsage {
    pub count: i64,
    pub total_size: i64,
}

pub struct PageStore {
    pool: SqlitePool,
    clock: SharedClock,
}

const COLUMNS: &str = "file_id, page_number, page_key, tier, size, checksum, last_access_at, access_count, compressed, original_size";

impl PageStore {
    pub fn new(pool: SqlitePool, clock: SharedClock) -> Self {
        Self { pool, clock }
    }

    pub async fn create_page(
        &self,
        file_id: i64,
        page_number: i64,
        page_key: &str,
        tier: Tier,
        size: i64,
        checksum: Option<&str>,
        compressed: bool,
        original_size: Option<i64>,
    ) -> Result<()> {
        debug_assert!(size as u64 <= PAGE_SIZE, "chunk exceeds page size");
        let now = self.clock.now_ms();
        sqlx::query(
            "INSERT INTO page_metadata (file_id, page_number, page_key, tier, size, checksum,
             last_access_at, access_count, compressed, original_size)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(file_id)
        .bind(page_number)
        .bind(page_key)
        .bind(tier.as_str())
        .bind(size)
        .bind(checksum)
        .bind(now)
        .bind(compressed as i64)
        .bind(original_size)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_page(&self, file_id: i64, page_number: i64) -> Result<Option<PageMetadata>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM page_metadata WHERE file_id = ? AND page_number = ?"
        ))
        .bind(file_id)
        .bind(page_number)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_page).transpose()
    }

    pub async fn get_pages_for_file(&self, file_id: i64) -> Result<Vec<PageMetadata>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM page_metadata WHERE file_id = ? ORDER BY page_number ASC"
        ))
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_page).collect()
    }

    pub async fn update_page(&self, file_id: i64, page_number: i64, patch: PagePatch) -> Result<()> {
        let mut sets = Vec::new();
        if patch.tier.is_some() {
            sets.push("tier = ?".to_string());
        }
        if patch.size.is_some() {
            sets.push("size = ?".to_string());
        }
        if patch.checksum.is_some() {
            sets.push("checksum = ?".to_string());
        }
        if patch.compressed.is_some() {
            sets.push("compressed = ?".to_string());
        }
        if patch.original_size.is_some() {
            sets.push("original_size = ?".to_string());
        }
        if sets.is_empty() {
            return Ok(());
        }
        let sql = format!("UPDATE page_metadata SET {} WHERE file_id = ? AND page_number = ?", sets.join(", "));
        let mut query = sqlx::query(&sql);
        if let Some(v) = patch.tier {
            query = query.bind(v.as_str());
        }
        if let Some(v) = patch.size {
            query = query.bind(v);
        }
        if let Some(v) = patch.checksum {
            query = query.bind(v);
        }
        if let Some(v) = patch.compressed {
            query = query.bind(v as i64);
        }
        if let Some(v) = patch.original_size {
            query = query.bind(v);
        }
        query.bind(file_id).bind(page_number).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn delete_page(&self, file_id: i64, page_number: i64) -> Result<()> {
        sqlx::query("DELETE FROM page_metadata WHERE file_id = ? AND page_number = ?")
            .bind(file_id)
            .bind(page_number)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_pages_for_file(&self, file_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM page_metadata WHERE file_id = ?").bind(file_id).execute(&self.pool).await?;
        Ok(())
    }

    /// Defensive cascade for backends without FK cascade support; a no-op
    /// here since SQLite FK cascade already handles this, kept so callers
    /// don't need to special-case the backend.
    pub async fn on_file_deleted(&self, file_id: i64) -> Result<()> {
        self.delete_pages_for_file(file_id).await
    }

    pub async fn record_access(&self, file_id: i64, page_number: i64) -> Result<()> {
        let now = self.clock.now_ms();
        sqlx::query(
            "UPDATE page_metadata SET access_count = access_count + 1, last_access_at = ?
             WHERE file_id = ? AND page_number = ?",
        )
        .bind(now)
        .bind(file_id)
        .bind(page_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_pages_by_tier(&self, tier: Tier) -> Result<Vec<PageMetadata>> {
        let rows = sqlx::query(&format!("SELECT {COLUMNS} FROM page_metadata WHERE tier = ?"))
            .bind(tier.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_page).collect()
    }

    pub async fn get_oldest_pages(&self, limit: i64, tier: Option<Tier>) -> Result<Vec<PageMetadata>> {
        let rows = match tier {
            Some(tier) => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM page_metadata WHERE tier = ? ORDER BY last_access_at ASC LIMIT ?"
                ))
                .bind(tier.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!("SELECT {COLUMNS} FROM page_metadata ORDER BY last_access_at ASC LIMIT ?"))
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(row_to_page).collect()
    }

    /// Candidates for promotion: pages with at least `min_access_count`
    /// accesses, optionally scoped to `tier`.
    pub async fn get_hot_pages(&self, min_access_count: i64, tier: Option<Tier>) -> Result<Vec<PageMetadata>> {
        let rows = match tier {
            Some(tier) => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM page_metadata WHERE access_count >= ? AND tier = ? ORDER BY access_count DESC"
                ))
                .bind(min_access_count)
                .bind(tier.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM page_metadata WHERE access_count >= ? ORDER BY access_count DESC"
                ))
                .bind(min_access_count)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(row_to_page).collect()
    }

    /// Eviction ranking (§4.6): cold > warm > hot (colder evicted first),
    /// then `accessCount` ascending, then `lastAccessAt` ascending.
    pub async fn get_eviction_candidates(&self, limit: i64) -> Result<Vec<PageMetadata>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM page_metadata
             ORDER BY CASE tier WHEN 'cold' THEN 0 WHEN 'warm' THEN 1 ELSE 2 END ASC,
                      access_count ASC, last_access_at ASC
             LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_page).collect()
    }

    pub async fn get_tier_stats(&self) -> Result<Vec<(Tier, TierUsage)>> {
        let mut stats = Vec::new();
        for tier in [Tier::Hot, Tier::Warm, Tier::Cold] {
            let row = sqlx::query("SELECT COUNT(*) AS count, COALESCE(SUM(size), 0) AS total_size FROM page_metadata WHERE tier = ?")
                .bind(tier.as_str())
                .fetch_one(&self.pool)
                .await?;
            stats.push((tier, TierUsage { count: row.try_get("count")?, total_size: row.try_get("total_size")? }));
        }
        Ok(stats)
    }

    pub async fn get_total_file_size(&self, file_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT COALESCE(SUM(size), 0) AS total FROM page_metadata WHERE file_id = ?")
            .bind(file_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }

    pub async fn get_page_keys_for_file(&self, file_id: i64) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT page_key FROM page_metadata WHERE file_id = ? ORDER BY page_number ASC")
            .bind(file_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|row| row.try_get("page_key").map_err(Into::into)).collect()
    }
}

/// Splits `total_size` bytes into `(page_number, chunk_size)` pairs; every
/// chunk is exactly [`PAGE_SIZE`] except possibly the last (§4.6).
pub fn chunk_plan(total_size: u64) -> Vec<(i64, u64)> {
    if total_size == 0 {
        return Vec::new();
    }
    let mut plan = Vec::new();
    let mut remaining = total_size;
    let mut page_number = 0i64;
    while remaining > 0 {
        let size = remaining.min(PAGE_SIZE);
        plan.push((page_number, size));
        remaining -= size;
        page_number += 1;
    }
    plan
}

fn row_to_page(row: sqlx::sqlite::SqliteRow) -> Result<PageMetadata> {
    Ok(PageMetadata {
        file_id: row.try_get("file_id")?,
        page_number: row.try_get("page_number")?,
        page_key: row.try_get("page_key")?,
        tier: row.try_get::<String, _>("tier")?.parse()?,
        size: row.try_get("size")?,
        checksum: row.try_get("checksum")?,
        last_access_at: row.try_get("last_access_at")?,
        access_count: row.try_get("access_count")?,
        compressed: row.try_get::<i64, _>("compressed")? != 0,
        original_size: row.try_get("original_size")?,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chunk_plan_splits_on_page_boundary() {
        let plan = chunk_plan(PAGE_SIZE * 2 + 10);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0], (0, PAGE_SIZE));
        assert_eq!(plan[1], (1, PAGE_SIZE));
        assert_eq!(plan[2], (2, 10));
    }

    #[test]
    fn empty_file_has_no_pages() {
        assert!(chunk_plan(0).is_empty());
    }
}
